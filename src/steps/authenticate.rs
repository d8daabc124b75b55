use std::sync::Arc;

use crate::{
    events::{self, EventSink, LogLevel, Timer},
    image::ImageReference,
    registry::{self, Authorization, RegistryClient},
    sources::CredentialProvider,
    steps::runtime::{Step, StepPool},
};

/// Obtain the push authorization. Singleton per push: this step runs
/// once and its result gates every uploader.
pub(crate) fn authenticate_push(
    pool: &StepPool,
    client: Arc<RegistryClient>,
    events: Arc<dyn EventSink>,
    target: ImageReference,
    credentials: Arc<dyn CredentialProvider>,
) -> Step<Authorization> {
    Step::spawn(pool, async move {
        let _timer = Timer::start(Arc::clone(&events), "authenticate");

        let auth = registry::authenticate(&client, &target, &*credentials).await?;

        let message = if auth.is_anonymous() {
            format!("pushing to {} without authentication", target.registry())
        } else {
            format!("authenticated against {}", target.registry())
        };
        events::log(&*events, LogLevel::Info, message);

        Ok(auth)
    })
}
