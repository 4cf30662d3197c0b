use async_trait::async_trait;
use url::Url;

use crate::error::{GatewayError, Result};

/// Direct access for URIs outside the gateway scheme
///
/// Nothing read through here is cached or dispatched to a service.
#[async_trait]
pub trait PassThrough: Send + Sync {
    async fn read_file(&self, url: &Url) -> Result<String>;

    /// List a directory as absolute member URIs
    async fn list_directory(&self, url: &Url) -> Result<Vec<String>>;
}

fn not_found() -> GatewayError {
    GatewayError::backend("not found")
}

fn local_path(url: &Url) -> Result<std::path::PathBuf> {
    if url.scheme() != "file" {
        return Err(not_found());
    }
    url.to_file_path().map_err(|_| not_found())
}

/// Serves `file:` URIs from the local filesystem
#[derive(Debug, Default, Clone)]
pub struct LocalFiles;

#[async_trait]
impl PassThrough for LocalFiles {
    async fn read_file(&self, url: &Url) -> Result<String> {
        let path = local_path(url)?;
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found()
            } else {
                GatewayError::Io(e)
            }
        })
    }

    async fn list_directory(&self, url: &Url) -> Result<Vec<String>> {
        let path = local_path(url)?;
        let mut read_dir = tokio::fs::read_dir(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found()
            } else {
                GatewayError::Io(e)
            }
        })?;

        let mut members = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if let Ok(member) = Url::from_file_path(entry.path()) {
                members.push(member.to_string());
            }
        }
        members.sort();
        Ok(members)
    }
}

/// Rejects every pass-through request
#[derive(Debug, Default, Clone)]
pub struct NoPassThrough;

#[async_trait]
impl PassThrough for NoPassThrough {
    async fn read_file(&self, _url: &Url) -> Result<String> {
        Err(not_found())
    }

    async fn list_directory(&self, _url: &Url) -> Result<Vec<String>> {
        Err(not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_files() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "alpha").await.unwrap();
        tokio::fs::write(dir.path().join("b.txt"), "beta").await.unwrap();

        let files = LocalFiles;
        let a = Url::from_file_path(dir.path().join("a.txt")).unwrap();
        assert_eq!(files.read_file(&a).await.unwrap(), "alpha");

        let root = Url::from_directory_path(dir.path()).unwrap();
        let members = files.list_directory(&root).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members[0].ends_with("/a.txt"));

        let missing = Url::from_file_path(dir.path().join("missing")).unwrap();
        match files.read_file(&missing).await {
            Err(e) => assert_eq!(e.to_string(), "not found"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_other_schemes_are_not_found() {
        let url = Url::parse("unknown:scheme").unwrap();
        assert!(LocalFiles.read_file(&url).await.is_err());
        assert!(NoPassThrough.list_directory(&url).await.is_err());
    }
}
