use crate::domain::model::ObjectSummary;
use crate::domain::ports::{ByteStream, ObjectPage, ObjectStore};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

const PAGE_SIZE: usize = 1000;

/// Object store over a local directory. Keys are `/`-separated paths relative
/// to the root; the fingerprint is derived from size and modification time.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(EtlError::AccessDenied {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn summary(key: String, metadata: &std::fs::Metadata) -> ObjectSummary {
        let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        let stamp = last_modified
            .and_then(|ts| ts.timestamp_nanos_opt())
            .unwrap_or_default();
        ObjectSummary {
            fingerprint: format!("{:x}-{:x}", metadata.len(), stamp),
            key,
            size: metadata.len(),
            last_modified,
        }
    }

    /// All file keys under the root, sorted.
    async fn walk(&self) -> Result<Vec<(String, std::fs::Metadata)>> {
        let mut found = Vec::new();
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                let path = entry.path();
                if metadata.is_dir() {
                    dirs.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    found.push((key, metadata));
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

fn map_io(key: &str, e: std::io::Error) -> EtlError {
    match e.kind() {
        ErrorKind::NotFound => EtlError::NotFound {
            key: key.to_string(),
        },
        ErrorKind::PermissionDenied => EtlError::AccessDenied {
            key: key.to_string(),
        },
        _ => EtlError::IoError(e),
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    /// The continuation token is the last key of the previous page.
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ObjectPage> {
        let mut remaining = self
            .walk()
            .await?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| continuation.as_ref().map_or(true, |token| key > token));

        let objects: Vec<ObjectSummary> = remaining
            .by_ref()
            .take(self.page_size)
            .map(|(key, metadata)| Self::summary(key, &metadata))
            .collect();
        let next_token = match remaining.next() {
            Some(_) => objects.last().map(|o| o.key.clone()),
            None => None,
        };
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let path = self.resolve(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| map_io(key, e))?;
        Ok(Box::new(file))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectSummary>> {
        let path = self.resolve(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(Self::summary(key.to_string(), &metadata))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn write(root: &Path, key: &str, body: &str) {
        let path = root.join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_lists_pages_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "reviews/2025-04-10/agoda.jl", "{}\n");
        write(dir.path(), "reviews/2025-04-11/agoda.jl", "{}\n");
        write(dir.path(), "reviews/2025-04-12/expedia.jl", "{}\n");
        write(dir.path(), "other/skip.jl", "{}\n");
        let store = LocalObjectStore::new(dir.path()).with_page_size(2);

        let first = store.list_page("reviews/", None).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        assert_eq!(first.objects[0].key, "reviews/2025-04-10/agoda.jl");
        let token = first.next_token.clone().unwrap();

        let second = store.list_page("reviews/", Some(token)).await.unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].key, "reviews/2025-04-12/expedia.jl");
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_get_and_head() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "reviews/a.jl", "hello\n");
        let store = LocalObjectStore::new(dir.path());

        let mut body = store.get("reviews/a.jl").await.unwrap();
        let mut text = String::new();
        body.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "hello\n");

        let head = store.head("reviews/a.jl").await.unwrap().unwrap();
        assert_eq!(head.size, 6);
        assert!(!head.fingerprint.is_empty());
        assert!(store.head("reviews/missing.jl").await.unwrap().is_none());
        assert!(matches!(
            store.get("reviews/missing.jl").await,
            Err(EtlError::NotFound { .. })
        ));
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(EtlError::AccessDenied { .. })
        ));
    }
}
