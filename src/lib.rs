//! Push built container images to OCI / "Docker" V2 registries.
//!
//! ## Specs
//!
//! * Registry: https://github.com/opencontainers/distribution-spec/blob/v1.0.1/spec.md
//! * Manifest: https://github.com/opencontainers/image-spec/blob/main/manifest.md
//!
//! The push is a DAG of deferred steps: one authentication, one
//! deduplicated blob upload per distinct layer digest plus the config
//! blob, then the manifest under each tag. Steps run concurrently on a
//! bounded worker pool and join through declared predecessors; a single
//! cancellation signal covers the whole invocation.
//!
//! Layer assembly, credential storage and progress rendering live with
//! the caller, behind the traits in [`sources`] and [`events`].

pub mod config;
pub mod error;
pub mod events;
pub mod image;
pub mod manifest;
pub mod pusher;
pub mod registry;
pub mod sources;
pub mod steps;

pub use config::{PushConfig, RetryConfig};
pub use error::PushError;
pub use events::{ChannelSink, Event, EventSink, LogLevel, TracingSink};
pub use image::{
    BlobDescriptor, ContainerConfig, Digest, Image, ImageReference, Layer, LayerKind,
    ProcessConfig, RootFs,
};
pub use manifest::{ImageManifest, ManifestFormat};
pub use pusher::{push_image, PushContext};
pub use registry::{Authorization, RegistryClient};
pub use sources::{
    BlobSource, ConfigSource, CredentialProvider, FileBlobSource, LayerSource, MemoryBlobSource,
    RegistryCredentials, StaticConfigSource, StaticLayerSource,
};
pub use steps::{Step, StepPool};
