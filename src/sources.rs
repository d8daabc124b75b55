//! Collaborator interfaces the push core consumes.
//!
//! Layer assembly, configuration rendering and credential storage all
//! happen outside the core; these traits are the narrow seams they are
//! consumed through.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sec::Secret;

use crate::{
    error::PushError,
    image::{ContainerConfig, Layer},
};

/// Produces the bytes of one blob. Must be re-openable: retried uploads
/// read the content again.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn open(&self) -> Result<Bytes, PushError>;
}

/// Blob content held in memory.
#[derive(Clone, Debug)]
pub struct MemoryBlobSource(Bytes);

impl MemoryBlobSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }
}

#[async_trait]
impl BlobSource for MemoryBlobSource {
    async fn open(&self) -> Result<Bytes, PushError> {
        Ok(self.0.clone())
    }
}

/// Blob content backed by a file, re-read on every open.
#[derive(Clone, Debug)]
pub struct FileBlobSource {
    path: PathBuf,
}

impl FileBlobSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BlobSource for FileBlobSource {
    async fn open(&self) -> Result<Bytes, PushError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|err| PushError::Internal(format!("could not read layer file: {err}")))?;

        Ok(data.into())
    }
}

/// Supplies the already-computed layers of the image, split into the
/// inherited base set and the locally produced application set.
#[async_trait]
pub trait LayerSource: Send + Sync {
    async fn base_layers(&self) -> Result<Vec<Layer>, PushError>;

    async fn application_layers(&self) -> Result<Vec<Layer>, PushError>;
}

/// A fixed set of layers.
#[derive(Clone, Debug, Default)]
pub struct StaticLayerSource {
    pub base: Vec<Layer>,
    pub application: Vec<Layer>,
}

#[async_trait]
impl LayerSource for StaticLayerSource {
    async fn base_layers(&self) -> Result<Vec<Layer>, PushError> {
        Ok(self.base.clone())
    }

    async fn application_layers(&self) -> Result<Vec<Layer>, PushError> {
        Ok(self.application.clone())
    }
}

/// Supplies the container configuration, both as a document and as the
/// serialized JSON bytes that become the config blob.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn container_config(&self) -> Result<ContainerConfig, PushError>;

    /// The serialized configuration. Implementations must return the same
    /// bytes on every call; the digest of the uploaded blob is computed
    /// from them.
    async fn config_bytes(&self) -> Result<Bytes, PushError>;
}

/// Serializes a [`ContainerConfig`] once and hands out the same bytes on
/// every call.
#[derive(Clone, Debug)]
pub struct StaticConfigSource {
    config: ContainerConfig,
    bytes: Bytes,
}

impl StaticConfigSource {
    pub fn new(config: ContainerConfig) -> Result<Self, PushError> {
        let bytes = serde_json::to_vec(&config)
            .map_err(|err| PushError::Internal(format!("could not serialize config: {err}")))?;

        Ok(Self {
            config,
            bytes: bytes.into(),
        })
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn container_config(&self) -> Result<ContainerConfig, PushError> {
        Ok(self.config.clone())
    }

    async fn config_bytes(&self) -> Result<Bytes, PushError> {
        Ok(self.bytes.clone())
    }
}

/// Credentials for one registry host.
#[derive(Clone, Debug)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: Secret<String>,
}

impl RegistryCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }
}

/// Looks up credentials for a registry host. Returning `None` means the
/// push proceeds anonymously (and fails `AuthRequired` if the registry
/// demands credentials).
pub trait CredentialProvider: Send + Sync {
    fn lookup(&self, host: &str) -> Option<RegistryCredentials>;
}

/// The anonymous provider.
impl CredentialProvider for () {
    fn lookup(&self, _host: &str) -> Option<RegistryCredentials> {
        None
    }
}

impl CredentialProvider for HashMap<String, RegistryCredentials> {
    fn lookup(&self, host: &str) -> Option<RegistryCredentials> {
        self.get(host).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn memory_source_is_reopenable() {
        let source = MemoryBlobSource::new(&b"layer bytes"[..]);

        let first = source.open().await.expect("should open");
        let second = source.open().await.expect("should open");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn file_source_rereads_the_file() {
        let mut file = tempfile::NamedTempFile::new().expect("could not create temporary file");
        file.write_all(b"compressed layer").expect("could not write");

        let source = FileBlobSource::new(file.path());
        assert_eq!(
            source.open().await.expect("should open").as_ref(),
            b"compressed layer"
        );
    }

    #[tokio::test]
    async fn static_config_source_bytes_are_stable() {
        let source = StaticConfigSource::new(ContainerConfig {
            created: Some("2024-01-01T00:00:00Z".to_owned()),
            architecture: "amd64".to_owned(),
            os: "linux".to_owned(),
            ..Default::default()
        })
        .expect("should serialize");

        let first = source.config_bytes().await.expect("should produce bytes");
        let second = source.config_bytes().await.expect("should produce bytes");
        assert_eq!(first, second);
    }

    #[test]
    fn credential_provider_map_lookup() {
        let mut providers = HashMap::new();
        providers.insert(
            "registry.example.com".to_owned(),
            RegistryCredentials::new("user", "hunter2"),
        );

        assert!(providers.lookup("registry.example.com").is_some());
        assert!(providers.lookup("other.example.com").is_none());
        assert!(().lookup("registry.example.com").is_none());
    }
}
