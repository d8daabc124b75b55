//! Image manifest formats.
//!
//! ## Specs
//!
//! * Docker: https://distribution.github.io/distribution/spec/manifest-v2-2/
//! * OCI: https://github.com/opencontainers/image-spec/blob/main/manifest.md
//!
//! The manifest is serialized exactly once per push; the digest of those
//! bytes is the image digest reported to the caller.

use serde::{Deserialize, Serialize};

use crate::image::{BlobDescriptor, Digest};

pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// The manifest flavor uploaded to the registry.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ManifestFormat {
    #[default]
    #[serde(rename = "docker-v2.2")]
    DockerV22,
    #[serde(rename = "oci")]
    Oci,
}

impl ManifestFormat {
    pub fn media_type(self) -> &'static str {
        match self {
            ManifestFormat::DockerV22 => DOCKER_MANIFEST_MEDIA_TYPE,
            ManifestFormat::Oci => OCI_MANIFEST_MEDIA_TYPE,
        }
    }

    pub(crate) fn config_media_type(self) -> &'static str {
        match self {
            ManifestFormat::DockerV22 => DOCKER_CONFIG_MEDIA_TYPE,
            ManifestFormat::Oci => OCI_CONFIG_MEDIA_TYPE,
        }
    }

    pub(crate) fn layer_media_type(self) -> &'static str {
        match self {
            ManifestFormat::DockerV22 => DOCKER_LAYER_MEDIA_TYPE,
            ManifestFormat::Oci => OCI_LAYER_MEDIA_TYPE,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDescriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
}

impl ContentDescriptor {
    fn new(descriptor: &BlobDescriptor, fallback_media_type: &'static str) -> Self {
        Self {
            media_type: descriptor
                .media_type
                .unwrap_or(fallback_media_type)
                .to_owned(),
            size: descriptor.size,
            digest: descriptor.digest,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: ContentDescriptor,
    pub layers: Vec<ContentDescriptor>,
}

impl ImageManifest {
    /// Translate an image's blob descriptors into a manifest. Pure; the
    /// layer order is preserved.
    pub fn new(
        format: ManifestFormat,
        config: &BlobDescriptor,
        layers: &[BlobDescriptor],
    ) -> Self {
        Self {
            schema_version: 2,
            media_type: format.media_type().to_owned(),
            config: ContentDescriptor::new(config, format.config_media_type()),
            layers: layers
                .iter()
                .map(|layer| ContentDescriptor::new(layer, format.layer_media_type()))
                .collect(),
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }
}
