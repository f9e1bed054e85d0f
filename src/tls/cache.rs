//! Pluggable cache backend for ACME-issued certificate material.
//!
//! `Cache` is the three-method contract the ACME manager uses to persist and
//! retrieve account keys, orders, and issued certificates: `get` returns
//! `Ok(None)` for an absent key (never an error — only true I/O/transport
//! failures are errors), `put` stores a blob, `delete` removes one.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::CacheError;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// One file per key under a local directory, created on first use.
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache keys from the ACME manager are arbitrary strings (e.g. a
    /// hostname); percent-encode anything that is not a safe filename
    /// component so two distinct keys never collide on disk.
    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        self.dir.join(safe)
    }
}

#[async_trait]
impl Cache for DirCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CacheError::Io {
                path: self.dir.display().to_string(),
                source,
            })?;
        let path = self.path_for(key);
        tokio::fs::write(&path, value)
            .await
            .map_err(|source| CacheError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

/// S3-backed cache. Object key is `<folder>/<key>` when a folder prefix is
/// configured, else `<key>` directly; objects are written with the
/// `private` canned ACL. Any retrieval error — including a genuine `NoSuchKey`
/// as well as transport failures — is folded into `Ok(None)` on `get`, which
/// preserves the ACME manager's "absent means try again" contract; `put`/
/// `delete` still surface real errors since those are not read paths.
pub struct S3Cache {
    client: aws_sdk_s3::Client,
    bucket: String,
    folder: Option<String>,
}

impl S3Cache {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, folder: Option<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            folder: folder.filter(|f| !f.is_empty()),
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.folder {
            Some(folder) => format!("{folder}/{key}"),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl Cache for S3Cache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let object_key = self.object_key(key);
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await;
        match result {
            Ok(output) => match output.body.collect().await {
                Ok(bytes) => Ok(Some(bytes.into_bytes().to_vec())),
                Err(_) => Ok(None),
            },
            // Missing object and transport errors both mean "not cached yet"
            // from the ACME manager's point of view.
            Err(_) => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let object_key = self.object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .acl(aws_sdk_s3::types::ObjectCannedAcl::Private)
            .body(value.to_vec().into())
            .send()
            .await
            .map_err(|e| CacheError::ObjectStore {
                key: object_key,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let object_key = self.object_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| CacheError::ObjectStore {
                key: object_key,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}
