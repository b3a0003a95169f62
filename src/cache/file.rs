//! Filesystem certificate cache

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Cache, CacheError};
use crate::pki::CertBundle;

/// Persists the certificate and key as a single PEM file.
///
/// The key lives in the same file, so the file is written 0600 with its
/// parent directory at 0700, and the write goes through a temp file plus
/// rename so readers never observe a torn bundle.
#[derive(Debug, Clone)]
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Cache for FileCache {
    async fn get(&self) -> Result<Option<CertBundle>, CacheError> {
        let pem = match tokio::fs::read(&self.path).await {
            Ok(pem) => pem,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no cached certificate file");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let bundle = CertBundle::from_pem(&pem)?;
        debug!(
            path = %self.path.display(),
            not_after = %bundle.not_after(),
            "loaded certificate from file cache"
        );
        Ok(Some(bundle))
    }

    async fn put(&self, bundle: &CertBundle) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).await?;
            }
        }

        let tmp = self.path.with_file_name(format!(
            "{}.tmp",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "cert".to_string())
        ));
        tokio::fs::write(&tmp, bundle.to_pem()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(
            path = %self.path.display(),
            not_after = %bundle.not_after(),
            "stored certificate in file cache"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = FileCache::new(dir.path().join("absent.pem"));
        assert!(cache.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = FileCache::new(dir.path().join("nested").join("cert.pem"));
        let bundle = testutil::bundle_expiring_in_days(45);

        cache.put(&bundle).await.unwrap();
        let loaded = cache.get().await.unwrap().unwrap();
        assert_eq!(loaded.leaf().as_ref(), bundle.leaf().as_ref());
        assert_eq!(loaded.not_after(), bundle.not_after());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_written_with_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store").join("cert.pem");
        let cache = FileCache::new(&path);
        cache
            .put(&testutil::bundle_expiring_in_days(45))
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cert.pem");
        std::fs::write(&path, b"garbage").unwrap();
        let cache = FileCache::new(&path);
        assert!(cache.get().await.is_err());
    }
}
