use crate::domain::model::ObjectSummary;
use crate::domain::ports::{ByteStream, ObjectPage, ObjectStore};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Builds a client from the default credential chain. `endpoint` and
    /// `force_path_style` are for S3-compatible stores such as MinIO.
    pub async fn connect(
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        force_path_style: bool,
    ) -> Self {
        let shared = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .region(Region::new(region.to_string()))
            .force_path_style(force_path_style);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self::new(S3Client::from_conf(builder.build()), bucket.to_string())
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos())
}

fn clean_etag(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

/// Maps SDK failures onto the object store error taxonomy.
fn classify<E>(key: &str, err: SdkError<E>) -> EtlError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            EtlError::TransientNetwork {
                key: key.to_string(),
                message,
            }
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            match (context.err().code(), status) {
                (Some("NoSuchKey") | Some("NotFound"), _) | (_, 404) => EtlError::NotFound {
                    key: key.to_string(),
                },
                (Some("AccessDenied") | Some("Forbidden"), _) | (_, 403) => EtlError::AccessDenied {
                    key: key.to_string(),
                },
                (Some("SlowDown") | Some("InternalError") | Some("ServiceUnavailable"), _) => {
                    EtlError::TransientNetwork {
                        key: key.to_string(),
                        message,
                    }
                }
                (_, status) if status >= 500 || status == 429 => EtlError::TransientNetwork {
                    key: key.to_string(),
                    message,
                },
                _ => EtlError::Storage { message },
            }
        }
        _ => EtlError::Storage { message },
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ObjectPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| classify(prefix, e))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectSummary {
                    key: object.key()?.to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    last_modified: object.last_modified().and_then(to_chrono),
                    fingerprint: clean_etag(object.e_tag()),
                })
            })
            .collect();

        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectSummary>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(output) => Ok(Some(ObjectSummary {
                key: key.to_string(),
                size: output.content_length().unwrap_or_default().max(0) as u64,
                last_modified: output.last_modified().and_then(to_chrono),
                fingerprint: clean_etag(output.e_tag()),
            })),
            Err(e) => match classify(key, e) {
                EtlError::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_quotes_are_stripped() {
        assert_eq!(clean_etag(Some("\"abc123\"")), "abc123");
        assert_eq!(clean_etag(None), "");
    }
}
