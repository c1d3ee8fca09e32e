use crate::core::validator::parse_review_date;
use crate::domain::model::{json_i64, CanonicalReview, Provider, RawRecord, ReviewerInfo};
use crate::utils::error::{EtlError, Result};
use sha2::{Digest, Sha256};

/// Maps a validated raw record onto the persisted review shape.
#[derive(Debug, Clone, Default)]
pub struct ReviewTransformer;

impl ReviewTransformer {
    pub fn new() -> Self {
        Self
    }

    pub fn transform(&self, raw: &RawRecord, provider: &Provider) -> Result<CanonicalReview> {
        let line = raw.line_number;
        let missing = |field: &str| EtlError::TransformError {
            line,
            message: format!("missing {}", field),
        };

        let hotel_id = raw.hotel_id.ok_or_else(|| missing("hotelId"))?;
        let external_review_id = raw
            .external_review_id()
            .ok_or_else(|| missing("comment.hotelReviewId"))?;
        let rating = raw.rating().ok_or_else(|| missing("comment.rating"))?;
        let hotel_name = raw
            .hotel_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| missing("hotelName"))?
            .to_string();

        let raw_review_date = raw.raw_review_date().map(str::to_string);
        let review_date = raw_review_date.as_deref().and_then(parse_review_date);
        let review_comments = text_field(raw, "reviewComments");

        let content_hash = content_hash(
            hotel_id,
            review_comments.as_deref(),
            rating,
            raw_review_date.as_deref(),
        );

        Ok(CanonicalReview {
            hotel_id,
            hotel_name,
            provider_id: provider.id,
            external_review_id,
            rating,
            review_title: text_field(raw, "reviewTitle"),
            review_comments,
            review_positives: text_field(raw, "reviewPositives"),
            review_negatives: text_field(raw, "reviewNegatives"),
            review_date,
            raw_review_date,
            reviewer: raw.reviewer_info().map(reviewer_info),
            helpful_votes: raw.comment_field("helpfulVotes").and_then(json_i64),
            is_verified: raw
                .comment_field("isVerified")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            language: text_field(raw, "translateSource").or_else(|| text_field(raw, "language")),
            content_hash,
            source_line: line,
        })
    }
}

fn text_field(raw: &RawRecord, name: &str) -> Option<String> {
    raw.comment_str(name)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn reviewer_info(value: &serde_json::Value) -> ReviewerInfo {
    let text = |name: &str| {
        value
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    ReviewerInfo {
        country_name: text("countryName"),
        display_member_name: text("displayMemberName"),
        review_group_name: text("reviewGroupName"),
        room_type_name: text("roomTypeName"),
        length_of_stay: value.get("lengthOfStay").and_then(json_i64),
        reviewed_count: value.get("reviewerReviewedCount").and_then(json_i64),
        is_expert: value
            .get("isExpertReviewer")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }
}

/// SHA-256 over hotel id, whitespace-collapsed lowercase comment, rating and
/// the raw date text. Same inputs always give the same hex digest.
pub fn content_hash(
    hotel_id: i64,
    comment: Option<&str>,
    rating: f64,
    raw_date: Option<&str>,
) -> String {
    let normalized_comment = comment
        .unwrap_or_default()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}",
            hotel_id,
            normalized_comment,
            rating,
            raw_date.unwrap_or_default().trim()
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn agoda() -> Provider {
        Provider {
            id: 1,
            code: "agoda".to_string(),
            name: "Agoda".to_string(),
        }
    }

    fn raw(comment: serde_json::Value) -> RawRecord {
        RawRecord {
            hotel_id: Some(10984),
            platform: Some("Agoda".to_string()),
            hotel_name: Some(" Oscar Saigon Hotel ".to_string()),
            comment: Some(comment),
            line_number: 12,
            raw_line: String::new(),
        }
    }

    #[test]
    fn test_transform_maps_nested_fields() {
        let record = raw(json!({
            "hotelReviewId": 948353737,
            "rating": 6.4,
            "reviewDate": "2025-04-10T05:37:00+07:00",
            "reviewTitle": "Perfect location",
            "reviewComments": "Hotel room is basic and very small.",
            "translateSource": "en",
            "isVerified": true,
            "reviewerInfo": {
                "countryName": "India",
                "displayMemberName": "********",
                "roomTypeName": "Premium Deluxe Double Room",
                "lengthOfStay": 2,
                "reviewerReviewedCount": 0,
                "isExpertReviewer": false
            }
        }));

        let review = ReviewTransformer::new().transform(&record, &agoda()).unwrap();

        assert_eq!(review.hotel_name, "Oscar Saigon Hotel");
        assert_eq!(review.provider_id, 1);
        assert_eq!(review.external_review_id, 948353737);
        assert_eq!(
            review.review_date,
            Some(Utc.with_ymd_and_hms(2025, 4, 9, 22, 37, 0).unwrap())
        );
        assert_eq!(review.language.as_deref(), Some("en"));
        assert!(review.is_verified);
        assert_eq!(review.source_line, 12);
        let reviewer = review.reviewer.unwrap();
        assert_eq!(reviewer.country_name.as_deref(), Some("India"));
        assert_eq!(reviewer.length_of_stay, Some(2));
        assert_eq!(review.content_hash.len(), 64);
    }

    #[test]
    fn test_content_hash_is_deterministic_and_normalizes_comment() {
        let a = content_hash(1, Some("Great   Stay\n"), 8.0, Some("2025-01-01"));
        let b = content_hash(1, Some("great stay"), 8.0, Some("2025-01-01"));
        let c = content_hash(1, Some("great stay"), 8.5, Some("2025-01-01"));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_missing_required_field_is_a_transform_error() {
        let record = raw(json!({"rating": 5}));
        let err = ReviewTransformer::new().transform(&record, &agoda()).unwrap_err();
        assert!(matches!(err, EtlError::TransformError { line: 12, .. }));
    }
}
