use crate::domain::model::{json_f64, json_i64, RawRecord, ValidationOutcome};
use chrono::{DateTime, Months, NaiveDate, NaiveDateTime, Utc};

/// 可接受的日期格式（依序嘗試，第一個成功者為準）
pub const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
pub const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%B %d, %Y", "%d/%m/%Y"];

pub const DEFAULT_KNOWN_PROVIDERS: &[&str] = &["Agoda", "Booking.com", "Expedia"];

/// Parses a review date with the accepted formats; RFC 3339 first.
pub fn parse_review_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ndt.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub known_providers: Vec<String>,
    pub max_hotel_name_length: usize,
    pub max_comment_length: usize,
    pub max_review_age_years: u32,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            known_providers: DEFAULT_KNOWN_PROVIDERS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            max_hotel_name_length: 255,
            max_comment_length: 5000,
            max_review_age_years: 20,
        }
    }
}

/// Collects every violation of a record; never stops at the first one.
#[derive(Debug, Clone, Default)]
pub struct ReviewValidator {
    rules: ValidationRules,
}

impl ReviewValidator {
    pub fn new(rules: ValidationRules) -> Self {
        Self { rules }
    }

    pub fn is_known_provider(&self, name: &str) -> bool {
        let name = name.trim();
        self.rules
            .known_providers
            .iter()
            .any(|known| known.eq_ignore_ascii_case(name))
    }

    pub fn validate(&self, raw: &RawRecord) -> ValidationOutcome {
        self.validate_at(raw, Utc::now())
    }

    pub fn validate_at(&self, raw: &RawRecord, now: DateTime<Utc>) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        match raw.hotel_id {
            None => outcome.push("Hotel ID is required"),
            Some(id) if id <= 0 => outcome.push(format!("Hotel ID must be positive, got {}", id)),
            Some(_) => {}
        }

        match raw.platform.as_deref().map(str::trim) {
            None | Some("") => outcome.push("Provider name is required"),
            Some(name) if !self.is_known_provider(name) => {
                outcome.push(format!("Unknown provider: {}", name))
            }
            Some(_) => {}
        }

        match raw.hotel_name.as_deref().map(str::trim) {
            None | Some("") => outcome.push("Hotel name is required"),
            Some(name) if name.chars().count() > self.rules.max_hotel_name_length => {
                outcome.push(format!(
                    "Hotel name must not exceed {} characters",
                    self.rules.max_hotel_name_length
                ))
            }
            Some(_) => {}
        }

        if !raw.comment.as_ref().is_some_and(|c| c.is_object()) {
            outcome.push("Review comment object is required");
            return outcome;
        }

        self.check_review_identifiers(raw, &mut outcome);
        self.check_rating(raw, &mut outcome);
        self.check_review_date(raw, now, &mut outcome);

        if let Some(text) = raw.comment_str("reviewComments") {
            if text.chars().count() > self.rules.max_comment_length {
                outcome.push(format!(
                    "Review comment must not exceed {} characters",
                    self.rules.max_comment_length
                ));
            }
        }

        if let Some(reviewer) = raw.reviewer_info() {
            check_reviewer(reviewer, &mut outcome);
        }

        outcome
    }

    fn check_review_identifiers(&self, raw: &RawRecord, outcome: &mut ValidationOutcome) {
        match raw.comment_field("hotelReviewId").map(json_i64) {
            None => outcome.push("Review ID is required"),
            Some(None) => outcome.push("Review ID must be an integer"),
            Some(Some(id)) if id <= 0 => {
                outcome.push(format!("Review ID must be positive, got {}", id))
            }
            Some(Some(_)) => {}
        }

        if let Some(value) = raw.comment_field("providerId").filter(|v| !v.is_null()) {
            if !json_i64(value).is_some_and(|id| id > 0) {
                outcome.push("Provider ID must be a positive integer");
            }
        }
    }

    fn check_rating(&self, raw: &RawRecord, outcome: &mut ValidationOutcome) {
        match raw.comment_field("rating").filter(|v| !v.is_null()) {
            None => outcome.push("Rating is required"),
            Some(value) => match json_f64(value) {
                None => outcome.push("Rating must be numeric"),
                Some(rating) if !(0.0..=10.0).contains(&rating) => outcome.push(format!(
                    "Rating must be between 0 and 10, got {}",
                    rating
                )),
                Some(_) => {}
            },
        }
    }

    fn check_review_date(&self, raw: &RawRecord, now: DateTime<Utc>, outcome: &mut ValidationOutcome) {
        let Some(date_text) = raw.raw_review_date().filter(|d| !d.trim().is_empty()) else {
            outcome.push("Review date is required");
            return;
        };
        let Some(date) = parse_review_date(date_text) else {
            outcome.push(format!(
                "Review date '{}' does not match any accepted format",
                date_text
            ));
            return;
        };

        if date > now {
            outcome.push("Review date cannot be in the future");
        }
        let oldest = now.checked_sub_months(Months::new(self.rules.max_review_age_years * 12));
        if oldest.is_some_and(|oldest| date < oldest) {
            outcome.push(format!(
                "Review date cannot be older than {} years",
                self.rules.max_review_age_years
            ));
        }
    }
}

fn check_reviewer(reviewer: &serde_json::Value, outcome: &mut ValidationOutcome) {
    if let Some(country) = reviewer.get("countryName").filter(|v| !v.is_null()) {
        if country.as_str().map_or(true, |c| c.trim().is_empty()) {
            outcome.push("Reviewer country name must not be empty");
        }
    }
    if let Some(stay) = reviewer.get("lengthOfStay").filter(|v| !v.is_null()) {
        if !json_i64(stay).is_some_and(|days| days > 0) {
            outcome.push("Length of stay must be positive");
        }
    }
}
