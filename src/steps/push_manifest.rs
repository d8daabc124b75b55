use std::sync::Arc;

use bytes::Bytes;

use crate::{
    error::PushError,
    events::{Event, EventSink, Timer},
    image::{BlobDescriptor, Digest, Image, ImageReference},
    manifest::{ImageManifest, ManifestFormat},
    registry::{Authorization, RegistryClient},
    steps::runtime::{all_of, Step, StepPool},
};

/// Serialize the manifest, upload it under every tag, and emit the
/// terminal event.
///
/// Begins only after every layer blob and the config blob are final; the
/// joins below are the happens-before edges of the DAG. The manifest is
/// serialized exactly once and the same bytes are hashed and uploaded,
/// so the digest returned to the caller is the digest of what the
/// registry received.
pub(crate) fn push_manifest(
    pool: &StepPool,
    client: Arc<RegistryClient>,
    events: Arc<dyn EventSink>,
    auth: Step<Authorization>,
    image: Step<Image>,
    layer_blobs: Step<Vec<BlobDescriptor>>,
    config_blob: Step<BlobDescriptor>,
    format: ManifestFormat,
    target: ImageReference,
    tags: Vec<String>,
) -> Step<Digest> {
    let inner = pool.clone();

    Step::compose(pool, async move {
        if tags.is_empty() {
            return Err(PushError::Internal(
                "refusing to push an image with no tags".to_owned(),
            ));
        }

        let _timer = Timer::start(Arc::clone(&events), "push manifest");

        let auth = auth.join().await?;
        let image = image.join().await?;
        let pushed_layers = layer_blobs.join().await?;
        let config_descriptor = config_blob.join().await?;

        let layer_descriptors: Vec<BlobDescriptor> = image
            .layers
            .iter()
            .map(|layer| layer.descriptor.clone())
            .collect();
        debug_assert_eq!(pushed_layers, layer_descriptors);

        let manifest = ImageManifest::new(format, &config_descriptor, &layer_descriptors);

        // The single canonical serialization: hashed here, uploaded below.
        let bytes: Bytes = serde_json::to_vec(&manifest)
            .map_err(|err| PushError::Internal(format!("could not serialize manifest: {err}")))?
            .into();
        let image_digest = Digest::of(&bytes);

        let uploads: Vec<Step<Digest>> = tags
            .iter()
            .map(|tag| {
                let client = Arc::clone(&client);
                let auth = auth.clone();
                let target = target.clone();
                let tag = tag.clone();
                let bytes = bytes.clone();
                let media_type = format.media_type();

                Step::spawn(&inner, async move {
                    client
                        .put_manifest(&auth, &target, &tag, media_type, bytes, image_digest)
                        .await?;
                    Ok(image_digest)
                })
            })
            .collect();

        all_of(&uploads).await?;

        // Only after every tag landed.
        events.dispatch(Event::ImageCreated {
            reference: target.to_string(),
            image_digest,
            config_digest: config_descriptor.digest,
        });

        Ok(image_digest)
    })
}
