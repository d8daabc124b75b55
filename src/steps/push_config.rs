use std::sync::Arc;

use bytes::Bytes;

use crate::{
    events::EventSink,
    image::{BlobDescriptor, Digest, ImageReference},
    manifest::ManifestFormat,
    registry::{Authorization, RegistryClient},
    sources::MemoryBlobSource,
    steps::{
        push_blob::{push_blob, BlobPush, PushTaskSet},
        runtime::{Step, StepPool},
    },
};

/// Descriptor of the config blob: digest and size of the exact bytes
/// handed to the uploader, so the manifest's config entry always matches
/// what the registry stores.
fn config_descriptor(config_bytes: &Bytes, format: ManifestFormat) -> BlobDescriptor {
    BlobDescriptor::new(Digest::of(config_bytes), config_bytes.len() as u64)
        .with_media_type(format.config_media_type())
}

/// Push the serialized container configuration as a blob.
pub(crate) fn push_config(
    pool: &StepPool,
    client: Arc<RegistryClient>,
    events: Arc<dyn EventSink>,
    tasks: &PushTaskSet,
    auth: &Step<Authorization>,
    target: &ImageReference,
    config_bytes: Bytes,
    format: ManifestFormat,
) -> Step<BlobDescriptor> {
    let descriptor = config_descriptor(&config_bytes, format);

    push_blob(
        pool,
        client,
        events,
        tasks,
        auth.clone(),
        target.clone(),
        BlobPush {
            descriptor,
            source: Arc::new(MemoryBlobSource::new(config_bytes)),
            mount_from: None,
        },
    )
}
