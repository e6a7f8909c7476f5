// Seams to the external collaborators: the identity provider that issues
// bearer tokens and the blob store that hosts file attachments. The engine
// never talks to either service directly.

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::Attachment;

/// Issues bearer tokens for the realtime connection.
///
/// Returning `Ok(None)` means no user is authenticated; the connection
/// manager treats that as fatal and does not retry.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, force_refresh: bool) -> Result<Option<String>>;
}

/// Fixed-token provider for tests and the CLI harness.
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        StaticTokenProvider {
            token: Some(token.into()),
        }
    }

    /// Provider that behaves like a signed-out session.
    pub fn unauthenticated() -> Self {
        StaticTokenProvider { token: None }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _force_refresh: bool) -> Result<Option<String>> {
        Ok(self.token.clone())
    }
}

/// Bytes-level progress callback for uploads: (transferred, total).
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// A file picked locally, not yet uploaded.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Uploads attachment bytes to the external blob store and returns the
/// stable descriptor the wire protocol carries.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn upload(
        &self,
        upload: AttachmentUpload,
        progress: Option<ProgressCallback>,
    ) -> Result<Attachment>;
}

/// Store for sessions without attachment support; every upload fails, which
/// flips the owning message to Failed through the normal error path.
pub struct NullAttachmentStore;

#[async_trait]
impl AttachmentStore for NullAttachmentStore {
    async fn upload(
        &self,
        upload: AttachmentUpload,
        _progress: Option<ProgressCallback>,
    ) -> Result<Attachment> {
        Err(anyhow!("no attachment store configured for '{}'", upload.name))
    }
}
