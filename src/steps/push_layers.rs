use std::sync::Arc;

use futures::{stream::FuturesUnordered, StreamExt};

use crate::{
    events::{Event, EventSink},
    image::{BlobDescriptor, ImageReference, Layer},
    registry::{Authorization, RegistryClient},
    steps::{
        push_blob::{push_blob, BlobPush, PushTaskSet},
        runtime::{all_of, Step, StepPool},
    },
};

/// Fan one push-blob step out per layer. The children run with whatever
/// parallelism the pool allows; the returned step completes when all of
/// them have, resolving to their descriptors in layer order.
pub(crate) fn push_layers(
    pool: &StepPool,
    client: Arc<RegistryClient>,
    events: Arc<dyn EventSink>,
    tasks: &PushTaskSet,
    auth: &Step<Authorization>,
    target: &ImageReference,
    layers: &[Layer],
) -> Step<Vec<BlobDescriptor>> {
    let children: Vec<Step<BlobDescriptor>> = layers
        .iter()
        .map(|layer| {
            push_blob(
                pool,
                Arc::clone(&client),
                Arc::clone(&events),
                tasks,
                auth.clone(),
                target.clone(),
                BlobPush {
                    descriptor: layer.descriptor.clone(),
                    source: Arc::clone(&layer.source),
                    mount_from: layer.mount_source().map(ToOwned::to_owned),
                },
            )
        })
        .collect();

    Step::compose(pool, async move {
        let total = children.len() as u64;

        // Report completions as they land, in whatever order they land.
        let mut done = 0;
        let mut pending: FuturesUnordered<_> =
            children.iter().map(|child| child.join()).collect();
        while let Some(result) = pending.next().await {
            result?;
            done += 1;
            events.dispatch(Event::Progress {
                unit: "layer blobs".to_owned(),
                total,
                done,
            });
        }
        drop(pending);

        // Every child is resolved; collect the values in layer order.
        all_of(&children).await
    })
}
