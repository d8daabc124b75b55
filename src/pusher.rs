//! Top-level push orchestration: wires the step DAG and runs it.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::PushConfig,
    error::PushError,
    events::EventSink,
    image::{Digest, ImageReference},
    registry::RegistryClient,
    sources::{ConfigSource, CredentialProvider, LayerSource},
    steps::{
        authenticate_push, build_image, push_config, push_layers, push_manifest, PushTaskSet,
        Step, StepPool,
    },
};

/// Everything a push needs, injected once. The core keeps no global
/// state; a context is built per invocation and discarded with it.
pub struct PushContext {
    client: Arc<RegistryClient>,
    credentials: Arc<dyn CredentialProvider>,
    events: Arc<dyn EventSink>,
    pool: StepPool,
    config: PushConfig,
}

impl PushContext {
    pub fn new(
        config: PushConfig,
        credentials: Arc<dyn CredentialProvider>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, PushError> {
        let pool = StepPool::new(config.workers);
        let client = Arc::new(RegistryClient::new(&config, pool.cancel_token())?);

        Ok(Self {
            client,
            credentials,
            events,
            pool,
            config,
        })
    }

    /// Cancel the push sharing this context. Steps resolve cancelled and
    /// in-flight HTTP requests close their sockets.
    pub fn cancel(&self) {
        self.pool.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.pool.cancel_token()
    }
}

/// Push an image to `target` under every tag in `tags`, returning the
/// image digest: the sha256 of the manifest bytes that were uploaded.
pub async fn push_image(
    ctx: &PushContext,
    target: &ImageReference,
    layers: &dyn LayerSource,
    config_source: &dyn ConfigSource,
    tags: &[String],
) -> Result<Digest, PushError> {
    // An empty tag set is a caller bug; fail before any network I/O.
    if tags.is_empty() {
        return Err(PushError::Internal(
            "refusing to push an image with no tags".to_owned(),
        ));
    }

    let run = run_push(ctx, target, layers, config_source, tags);

    match ctx.config.timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
            Ok(result) => result,
            Err(_) => {
                debug!(budget_secs = secs, "push exceeded its wall-clock budget");
                ctx.pool.cancel();
                Err(PushError::Cancelled)
            }
        },
        None => run.await,
    }
}

async fn run_push(
    ctx: &PushContext,
    target: &ImageReference,
    layers: &dyn LayerSource,
    config_source: &dyn ConfigSource,
    tags: &[String],
) -> Result<Digest, PushError> {
    let base = layers.base_layers().await?;
    let application = layers.application_layers().await?;
    let container_config = config_source.container_config().await?;
    let config_bytes = config_source.config_bytes().await?;

    debug!(
        base_layers = base.len(),
        application_layers = application.len(),
        %target,
        "starting push"
    );

    let pool = &ctx.pool;
    let tasks = PushTaskSet::new();

    let auth = authenticate_push(
        pool,
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.events),
        target.clone(),
        Arc::clone(&ctx.credentials),
    );

    let base_pushes = push_layers(
        pool,
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.events),
        &tasks,
        &auth,
        target,
        &base,
    );
    let application_pushes = push_layers(
        pool,
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.events),
        &tasks,
        &auth,
        target,
        &application,
    );
    let config_push = push_config(
        pool,
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.events),
        &tasks,
        &auth,
        target,
        config_bytes,
        ctx.config.manifest_format,
    );

    let image = build_image(pool, base, application, container_config);

    // One ordered barrier over both layer sets, base first.
    let layer_pushes = {
        let base_pushes = base_pushes.clone();
        let application_pushes = application_pushes.clone();

        Step::compose(pool, async move {
            let mut descriptors = base_pushes.join().await?;
            descriptors.extend(application_pushes.join().await?);
            Ok(descriptors)
        })
    };

    let manifest = push_manifest(
        pool,
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.events),
        auth,
        image,
        layer_pushes,
        config_push,
        ctx.config.manifest_format,
        target.clone(),
        tags.to_vec(),
    );

    manifest.join().await
}
