use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use log::{debug, warn};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{ChatError, ChatResult};
use crate::models::{Attachment, FileDescriptor, MessageKind};

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

const CHAT_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "application/pdf",
    "text/plain",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/zip",
];

/// Durable blob storage collaborator.
pub trait BlobStore: Send + Sync {
    /// Writes `bytes` at `path` and returns its public URL.
    fn put(&self, path: &str, bytes: &[u8]) -> ChatResult<String>;

    fn get_public_url(&self, path: &str) -> String;
}

/// Blob store backed by a local directory, served under `base_url`.
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> ChatResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FsBlobStore {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Reads back the bytes behind a URL this store handed out.
    pub fn read_url(&self, url: &str) -> ChatResult<Vec<u8>> {
        let path = url
            .strip_prefix(&self.base_url)
            .map(|rest| rest.trim_start_matches('/'))
            .ok_or_else(|| ChatError::NotFound(url.to_string()))?;
        Ok(fs::read(self.resolve(path)?)?)
    }

    fn resolve(&self, path: &str) -> ChatResult<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ChatError::Storage(format!("invalid blob path: {}", path)));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, path: &str, bytes: &[u8]) -> ChatResult<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, bytes)?;
        Ok(self.get_public_url(path))
    }

    fn get_public_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

/// Which uploads are accepted and how big they may be.
#[derive(Clone, Debug)]
pub struct AttachmentPolicy {
    pub max_bytes: u64,
    pub allowed_types: Vec<String>,
}

impl AttachmentPolicy {
    pub fn chat(max_bytes: u64) -> Self {
        AttachmentPolicy {
            max_bytes,
            allowed_types: CHAT_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn validate(&self, file: &FileDescriptor) -> ChatResult<()> {
        let content_type = normalize_content_type(&file.content_type);
        if !self.allowed_types.iter().any(|t| *t == content_type) {
            return Err(ChatError::InvalidType(file.content_type.clone()));
        }
        if file.size_bytes > self.max_bytes {
            return Err(ChatError::TooLarge {
                size: file.size_bytes,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        AttachmentPolicy::chat(DEFAULT_MAX_BYTES)
    }
}

/// A file that made it into blob storage, ready to be appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredAttachment {
    pub kind: MessageKind,
    pub attachment: Attachment,
}

/// Validates, uploads and classifies attachments.
#[derive(Clone)]
pub struct AttachmentPipeline {
    policy: AttachmentPolicy,
    store: Arc<dyn BlobStore>,
    rng: SystemRandom,
}

impl AttachmentPipeline {
    pub fn new(policy: AttachmentPolicy, store: Arc<dyn BlobStore>) -> Self {
        AttachmentPipeline {
            policy,
            store,
            rng: SystemRandom::new(),
        }
    }

    pub fn validate(&self, file: &FileDescriptor) -> ChatResult<()> {
        self.policy.validate(file)
    }

    /// Writes `bytes` under a fresh collision-resistant path.
    pub async fn store(&self, bytes: Vec<u8>, declared_name: &str) -> ChatResult<Attachment> {
        let name = display_name(declared_name);
        let path = self.blob_path(&name)?;
        let size_bytes = bytes.len() as u64;
        let store = Arc::clone(&self.store);
        let blob_path = path.clone();
        let url = tokio::task::spawn_blocking(move || store.put(&blob_path, &bytes))
            .await
            .map_err(|e| ChatError::Storage(format!("upload task failed: {}", e)))??;
        debug!("Stored {} ({} bytes) at {}", name, size_bytes, path);
        Ok(Attachment {
            url,
            name,
            size_bytes,
        })
    }

    /// Validation, upload and classification in one step. Nothing is
    /// written when validation fails.
    pub async fn upload(&self, file: &FileDescriptor, bytes: Vec<u8>) -> ChatResult<StoredAttachment> {
        let actual = FileDescriptor {
            size_bytes: file.size_bytes.max(bytes.len() as u64),
            ..file.clone()
        };
        if let Err(e) = self.validate(&actual) {
            warn!("Rejected attachment {}: {}", file.name, e);
            return Err(e);
        }
        let attachment = self.store(bytes, &file.name).await?;
        Ok(StoredAttachment {
            kind: classify(&file.content_type),
            attachment,
        })
    }

    fn blob_path(&self, name: &str) -> ChatResult<String> {
        let mut suffix = [0u8; 9];
        self.rng
            .fill(&mut suffix)
            .map_err(|_| ChatError::Storage("failed to generate blob name".into()))?;
        let mut path = format!(
            "chat/{}-{}",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            URL_SAFE_NO_PAD.encode(suffix)
        );
        if let Some(ext) = extension(name) {
            path.push('.');
            path.push_str(&ext);
        }
        Ok(path)
    }
}

pub fn classify(content_type: &str) -> MessageKind {
    MessageKind::from_content_type(content_type)
}

fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Last path component of a client-supplied file name.
fn display_name(declared: &str) -> String {
    let name = declared
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() {
        "attachment".to_string()
    } else {
        name.to_string()
    }
}

fn extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(content_type: &str, size_bytes: u64) -> FileDescriptor {
        FileDescriptor {
            name: "file.bin".to_string(),
            content_type: content_type.to_string(),
            size_bytes,
        }
    }

    fn pipeline(dir: &TempDir) -> (AttachmentPipeline, Arc<FsBlobStore>) {
        let store = Arc::new(FsBlobStore::new(dir.path(), "http://localhost/files/").unwrap());
        (
            AttachmentPipeline::new(AttachmentPolicy::default(), store.clone()),
            store,
        )
    }

    #[test]
    fn test_validate_allow_list_and_ceiling() {
        let policy = AttachmentPolicy::default();
        assert!(policy.validate(&descriptor("image/png", 1024)).is_ok());
        assert!(policy
            .validate(&descriptor("application/pdf; charset=binary", 1024))
            .is_ok());
        assert!(matches!(
            policy.validate(&descriptor("application/x-msdownload", 10)),
            Err(ChatError::InvalidType(_))
        ));
        assert!(matches!(
            policy.validate(&descriptor("image/png", 11 * 1024 * 1024)),
            Err(ChatError::TooLarge { .. })
        ));
        assert!(policy.validate(&descriptor("image/png", DEFAULT_MAX_BYTES)).is_ok());
    }

    #[test]
    fn test_names_and_extensions() {
        assert_eq!(display_name("C:\\Users\\me\\plan.PDF"), "plan.PDF");
        assert_eq!(display_name("../../etc/passwd"), "passwd");
        assert_eq!(display_name("  "), "attachment");
        assert_eq!(extension("plan.PDF"), Some("pdf".to_string()));
        assert_eq!(extension(".bashrc"), None);
        assert_eq!(extension("noext"), None);
        assert_eq!(extension("evil.p/hp"), None);
    }

    #[tokio::test]
    async fn test_store_uses_unique_paths() {
        let dir = TempDir::new().unwrap();
        let (pipeline, store) = pipeline(&dir);
        let first = pipeline.store(b"one".to_vec(), "photo.png").await.unwrap();
        let second = pipeline.store(b"two".to_vec(), "photo.png").await.unwrap();

        assert_ne!(first.url, second.url);
        assert!(first.url.starts_with("http://localhost/files/chat/"));
        assert!(first.url.ends_with(".png"));
        assert_eq!(first.name, "photo.png");
        assert_eq!(first.size_bytes, 3);
        assert_eq!(store.read_url(&first.url).unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_upload_classifies() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir);
        let png = pipeline
            .upload(&descriptor("image/png", 4), vec![0; 4])
            .await
            .unwrap();
        assert_eq!(png.kind, MessageKind::Image);
        let pdf = pipeline
            .upload(&descriptor("application/pdf", 4), vec![0; 4])
            .await
            .unwrap();
        assert_eq!(pdf.kind, MessageKind::Document);
        let zip = pipeline
            .upload(&descriptor("application/zip", 4), vec![0; 4])
            .await
            .unwrap();
        assert_eq!(zip.kind, MessageKind::File);
    }

    #[tokio::test]
    async fn test_rejected_upload_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir);
        // declared small, actually too large
        let result = pipeline
            .upload(&descriptor("image/png", 10), vec![0; 11 * 1024 * 1024])
            .await;
        assert!(matches!(result, Err(ChatError::TooLarge { .. })));
        assert!(!dir.path().join("chat").exists());
    }

    #[test]
    fn test_read_url_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path(), "http://localhost/files").unwrap();
        assert!(store.read_url("http://localhost/files/../secret").is_err());
        assert!(store.read_url("http://elsewhere/x").is_err());
    }
}
