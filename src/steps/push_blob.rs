use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    error::PushError,
    events::{self, EventSink, LogLevel, Timer},
    image::{BlobDescriptor, Digest, ImageReference},
    registry::{Authorization, MountOutcome, RegistryClient},
    sources::BlobSource,
    steps::runtime::{Step, StepPool},
};

type BlobKey = (String, String, Digest);

/// The per-invocation push task set: at most one uploader runs per
/// `(registry, repository, digest)`, later references attach to the
/// existing step. Dies with the invocation; entries are never removed.
#[derive(Default)]
pub(crate) struct PushTaskSet {
    inflight: Mutex<HashMap<BlobKey, Step<BlobDescriptor>>>,
}

impl PushTaskSet {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Compare-and-insert: only the inserting caller spawns the body.
    fn get_or_spawn(
        &self,
        key: BlobKey,
        spawn: impl FnOnce() -> Step<BlobDescriptor>,
    ) -> Step<BlobDescriptor> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|err| err.into_inner());

        inflight.entry(key).or_insert_with(spawn).clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }
}

/// One blob to bring into the target repository.
pub(crate) struct BlobPush {
    pub descriptor: BlobDescriptor,
    pub source: Arc<dyn BlobSource>,
    /// Repository to attempt a cross-repo mount from; set for base
    /// layers whose origin is known.
    pub mount_from: Option<String>,
}

/// Push one blob, deduplicated through the task set. The returned step
/// resolves to the pushed blob's descriptor and doubles as a handle to
/// it for downstream steps.
pub(crate) fn push_blob(
    pool: &StepPool,
    client: Arc<RegistryClient>,
    events: Arc<dyn EventSink>,
    tasks: &PushTaskSet,
    auth: Step<Authorization>,
    target: ImageReference,
    push: BlobPush,
) -> Step<BlobDescriptor> {
    let key = (
        target.registry().to_owned(),
        target.repository().to_owned(),
        push.descriptor.digest,
    );

    tasks.get_or_spawn(key, || {
        let inner = pool.clone();
        Step::compose(pool, async move {
            // The shared authorization gates every uploader.
            let auth = auth.join().await?;
            inner
                .run(upload(client, events, auth, target, push))
                .await
        })
    })
}

/// The three-phase protocol: exists-probe, mount attempt, streamed
/// upload. Short-circuits at the first phase that settles the blob.
async fn upload(
    client: Arc<RegistryClient>,
    events: Arc<dyn EventSink>,
    auth: Authorization,
    target: ImageReference,
    push: BlobPush,
) -> Result<BlobDescriptor, PushError> {
    let digest = push.descriptor.digest;
    let _timer = Timer::start(Arc::clone(&events), "push blob");

    if client.blob_exists(&auth, &target, digest).await? {
        events::log(
            &*events,
            LogLevel::Debug,
            format!("blob {digest} already present, skipping"),
        );
        return Ok(push.descriptor);
    }

    let mut location = None;
    if let Some(from) = push
        .mount_from
        .as_deref()
        .filter(|from| *from != target.repository())
    {
        match client.mount_blob(&auth, &target, digest, from).await? {
            MountOutcome::Mounted => {
                events::log(
                    &*events,
                    LogLevel::Info,
                    format!("blob {digest} mounted from {from}"),
                );
                return Ok(push.descriptor);
            }
            MountOutcome::Fallback(session) => location = Some(session),
        }
    }

    let bytes = push.source.open().await?;

    // Verify what is about to go over the wire before finalizing; a
    // disagreement here is a corrupted input, never retried.
    if bytes.len() as u64 != push.descriptor.size {
        return Err(PushError::DigestMismatch {
            expected: digest.to_string(),
            actual: format!(
                "content of {} bytes, advertised as {}",
                bytes.len(),
                push.descriptor.size
            ),
        });
    }
    let actual = Digest::of(&bytes);
    if actual != digest {
        return Err(PushError::DigestMismatch {
            expected: digest.to_string(),
            actual: actual.to_string(),
        });
    }

    client
        .upload_blob(&auth, &target, digest, bytes, location)
        .await?;

    events::log(
        &*events,
        LogLevel::Info,
        format!("blob {digest} uploaded ({} bytes)", push.descriptor.size),
    );
    Ok(push.descriptor)
}
