//! Image data model: digests, blob descriptors, layers and references.
//!
//! Everything here is immutable once constructed; a value carrying a
//! digest is a promise about the bytes behind it.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Display},
    str::FromStr,
    sync::Arc,
};

use hex::FromHex;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Digest as Sha2Digest;
use thiserror::Error;

use crate::sources::BlobSource;

const SHA256_LEN: usize = 32;

/// A sha256 content address, rendered as `sha256:<64 hex chars>`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; SHA256_LEN]);

impl Digest {
    pub fn new(bytes: [u8; SHA256_LEN]) -> Self {
        Self(bytes)
    }

    /// Digest of the given bytes.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", hex::encode(self.0))
    }
}

#[derive(Debug, Eq, PartialEq, Error)]
pub enum DigestParseError {
    #[error("wrong length")]
    WrongLength,
    #[error("wrong prefix")]
    WrongPrefix,
    #[error("hex decoding error")]
    HexDecodeError,
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        const PREFIX_LEN: usize = 7;
        const DIGEST_HEX_LEN: usize = SHA256_LEN * 2;

        if raw.len() != PREFIX_LEN + DIGEST_HEX_LEN {
            return Err(DigestParseError::WrongLength);
        }

        if !raw.starts_with("sha256:") {
            return Err(DigestParseError::WrongPrefix);
        }

        let hex_encoded = &raw[PREFIX_LEN..];
        debug_assert_eq!(hex_encoded.len(), DIGEST_HEX_LEN);

        let digest = <[u8; SHA256_LEN]>::from_hex(hex_encoded)
            .map_err(|_| DigestParseError::HexDecodeError)?;

        Ok(Self(digest))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Note: `&str` fails when the value sits inside query parameters.
        let raw = <String>::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A blob known by digest and size, optionally with a media type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobDescriptor {
    pub digest: Digest,
    pub size: u64,
    pub media_type: Option<&'static str>,
}

impl BlobDescriptor {
    pub fn new(digest: Digest, size: u64) -> Self {
        Self {
            digest,
            size,
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: &'static str) -> Self {
        self.media_type = Some(media_type);
        self
    }
}

/// Classification of a layer within the image being pushed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LayerKind {
    /// Inherited from the source image; candidate for a cross-repository
    /// mount when the originating repository is known.
    Base { source_repository: Option<String> },
    /// Produced locally, always uploaded.
    Application,
}

/// A compressed layer blob together with a re-openable byte source.
#[derive(Clone)]
pub struct Layer {
    pub descriptor: BlobDescriptor,
    pub source: Arc<dyn BlobSource>,
    pub kind: LayerKind,
}

impl Layer {
    pub fn base(
        descriptor: BlobDescriptor,
        source: Arc<dyn BlobSource>,
        source_repository: Option<String>,
    ) -> Self {
        Self {
            descriptor,
            source,
            kind: LayerKind::Base { source_repository },
        }
    }

    pub fn application(descriptor: BlobDescriptor, source: Arc<dyn BlobSource>) -> Self {
        Self {
            descriptor,
            source,
            kind: LayerKind::Application,
        }
    }

    /// Repository a cross-repo mount may be attempted from.
    pub(crate) fn mount_source(&self) -> Option<&str> {
        match &self.kind {
            LayerKind::Base {
                source_repository: Some(repo),
            } => Some(repo),
            _ => None,
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("descriptor", &self.descriptor)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// An assembled image: ordered layers plus the container configuration.
///
/// Layer order equals the runtime filesystem stacking order.
#[derive(Clone, Debug)]
pub struct Image {
    pub layers: Vec<Layer>,
    pub config: ContainerConfig,
}

/// The container configuration document.
///
/// See: https://github.com/opencontainers/image-spec/blob/main/config.md
///
/// The `created` timestamp is taken verbatim from the caller; nothing in
/// the push core samples the clock, so identical inputs serialize to
/// identical bytes.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ContainerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ProcessConfig>,
    pub rootfs: RootFs,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    // Ordered maps: the serialized config must not change between runs
    // on identical inputs, and its digest is content-addressed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, EmptyGoStruct>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, EmptyGoStruct>>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".to_owned(),
            diff_ids: Vec::new(),
        }
    }
}

/// Ports and volumes are keyed sets rendered as `{}`-valued maps.
#[derive(Clone, Debug, PartialEq)]
pub struct EmptyGoStruct;

impl Serialize for EmptyGoStruct {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        HashMap::<(), ()>::new().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EmptyGoStruct {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let deserialized: HashMap<(), ()> = Deserialize::deserialize(deserializer)?;
        if !deserialized.is_empty() {
            return Err(serde::de::Error::custom("should be an empty object"));
        }
        Ok(EmptyGoStruct)
    }
}

/// A reference to an image in a registry: `host/repository[:tag][@digest]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

#[derive(Debug, Eq, PartialEq, Error)]
pub enum ReferenceParseError {
    #[error("missing registry host")]
    MissingRegistry,
    #[error("missing repository")]
    MissingRepository,
    #[error("invalid repository character")]
    InvalidRepository,
    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] DigestParseError),
}

fn valid_repository(repository: &str) -> bool {
    !repository.is_empty()
        && !repository.starts_with('/')
        && !repository.ends_with('/')
        && repository
            .bytes()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, b'.' | b'_' | b'-' | b'/'))
}

impl ImageReference {
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
    ) -> Result<Self, ReferenceParseError> {
        let registry = registry.into();
        let repository = repository.into();

        if registry.is_empty() {
            return Err(ReferenceParseError::MissingRegistry);
        }
        if !valid_repository(&repository) {
            return Err(ReferenceParseError::InvalidRepository);
        }

        Ok(Self {
            registry,
            repository,
            tag: None,
            digest: None,
        })
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[inline(always)]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    #[inline(always)]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<Digest> {
        self.digest
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (registry, rest) = raw
            .split_once('/')
            .ok_or(ReferenceParseError::MissingRegistry)?;

        let (rest, digest) = match rest.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.parse()?)),
            None => (rest, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to the registry port and never reach this point.
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => {
                (repository, Some(tag.to_owned()))
            }
            _ => (rest, None),
        };

        if repository.is_empty() {
            return Err(ReferenceParseError::MissingRepository);
        }

        let mut reference = ImageReference::new(registry, repository)?;
        reference.tag = tag;
        reference.digest = digest;
        Ok(reference)
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
