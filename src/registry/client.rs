use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
    Response, StatusCode, Url,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::{PushConfig, RetryConfig},
    error::PushError,
    image::{Digest, ImageReference},
};

use super::auth::Authorization;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const OCTET_STREAM: &str = "application/octet-stream";

/// How far into a refusal body error reporting looks.
const BODY_SNIPPET_LEN: usize = 256;

/// HTTP client for the five distribution-protocol operations a push
/// needs. One instance serves every step of a push.
///
/// Concurrent requests are capped per host: a worker holding a pool
/// permit still waits here when the target already has
/// `max_connections_per_host` requests in flight.
pub struct RegistryClient {
    http: reqwest::Client,
    scheme: &'static str,
    retry: RetryConfig,
    cancel: CancellationToken,
    max_connections_per_host: usize,
    host_limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Result of a cross-repository mount attempt.
pub(crate) enum MountOutcome {
    /// The registry linked the blob; no upload needed.
    Mounted,
    /// The registry declined and opened a regular upload session instead.
    Fallback(Url),
}

/// One attempt of a non-idempotent operation.
enum Attempt {
    Transient(String),
    Fatal(PushError),
}

enum SendError {
    Cancelled,
    Transport(String),
}

impl RegistryClient {
    pub fn new(config: &PushConfig, cancel: CancellationToken) -> Result<Self, PushError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_connections_per_host)
            .build()
            .map_err(|err| PushError::Internal(format!("could not build http client: {err}")))?;

        Ok(Self {
            http,
            scheme: if config.allow_insecure_registries {
                "http"
            } else {
                "https"
            },
            retry: config.retry.clone(),
            cancel,
            max_connections_per_host: config.max_connections_per_host.max(1),
            host_limits: Mutex::new(HashMap::new()),
        })
    }

    /// Limiter for one host authority. The token realm may live on a
    /// different host than the registry; each gets its own budget.
    fn host_limit(&self, url: &Url) -> Arc<Semaphore> {
        let key = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_owned(),
        };

        let mut host_limits = self.host_limits.lock().unwrap_or_else(|err| err.into_inner());
        Arc::clone(
            host_limits
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_connections_per_host))),
        )
    }

    #[inline(always)]
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn base_url(&self, host: &str) -> String {
        format!("{}://{}", self.scheme, host)
    }

    fn blob_url(&self, target: &ImageReference, digest: Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{digest}",
            self.base_url(target.registry()),
            target.repository()
        )
    }

    fn uploads_url(&self, target: &ImageReference) -> String {
        format!(
            "{}/v2/{}/blobs/uploads/",
            self.base_url(target.registry()),
            target.repository()
        )
    }

    fn manifest_url(&self, target: &ImageReference, tag: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{tag}",
            self.base_url(target.registry()),
            target.repository()
        )
    }

    /// `HEAD /v2/<repo>/blobs/<digest>`; `200` present, `404` absent.
    pub(crate) async fn blob_exists(
        &self,
        auth: &Authorization,
        target: &ImageReference,
        digest: Digest,
    ) -> Result<bool, PushError> {
        let url = self.blob_url(target, digest);
        let response = self
            .send_retrying(|| auth.apply(self.http.head(&url)))
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.fail_status(auth, response).await),
        }
    }

    /// `POST /v2/<repo>/blobs/uploads/?mount=<digest>&from=<src>`; `201`
    /// means the registry linked the existing blob, `202` means it
    /// declined and opened a regular upload session.
    pub(crate) async fn mount_blob(
        &self,
        auth: &Authorization,
        target: &ImageReference,
        digest: Digest,
        from: &str,
    ) -> Result<MountOutcome, PushError> {
        let url = format!("{}?mount={digest}&from={from}", self.uploads_url(target));
        let response = self
            .send_retrying(|| auth.apply(self.http.post(&url).header(CONTENT_LENGTH, 0)))
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(MountOutcome::Mounted),
            StatusCode::ACCEPTED => {
                debug!(%digest, %from, "registry declined mount, falling back to upload");
                Ok(MountOutcome::Fallback(upload_location(&response)?))
            }
            _ => Err(self.fail_status(auth, response).await),
        }
    }

    /// Upload a blob: `PATCH` the bytes into an upload session, then
    /// `PUT ?digest=` to finalize. A transient failure restarts the whole
    /// session from a fresh `POST`; the registry discards the stale one.
    pub(crate) async fn upload_blob(
        &self,
        auth: &Authorization,
        target: &ImageReference,
        digest: Digest,
        bytes: Bytes,
        initial_location: Option<Url>,
    ) -> Result<(), PushError> {
        let mut backoff = Backoff::new(&self.retry);
        let mut location = initial_location;

        loop {
            match self
                .try_upload(auth, target, digest, bytes.clone(), location.take())
                .await
            {
                Ok(()) => return Ok(()),
                Err(Attempt::Fatal(err)) => return Err(err),
                Err(Attempt::Transient(cause)) => {
                    warn!(%digest, %cause, "blob upload attempt failed");
                    backoff.wait(&self.cancel, cause).await?;
                }
            }
        }
    }

    async fn try_upload(
        &self,
        auth: &Authorization,
        target: &ImageReference,
        digest: Digest,
        bytes: Bytes,
        location: Option<Url>,
    ) -> Result<(), Attempt> {
        let location = match location {
            Some(location) => location,
            None => self.begin_upload(auth, target).await?,
        };

        let size = bytes.len();
        let response = self
            .send_once(auth.apply(
                self.http
                    .patch(location.clone())
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .header(CONTENT_LENGTH, size)
                    .body(bytes),
            ))
            .await
            .map_err(SendError::into_attempt)?;
        self.expect_success(auth, response).await?;

        let mut finalize = location;
        finalize
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());

        let response = self
            .send_once(auth.apply(self.http.put(finalize).header(CONTENT_LENGTH, 0)))
            .await
            .map_err(SendError::into_attempt)?;
        let response = self.expect_success(auth, response).await?;

        verify_content_digest(&response, digest).map_err(Attempt::Fatal)
    }

    /// `POST /v2/<repo>/blobs/uploads/` for a fresh upload session.
    async fn begin_upload(
        &self,
        auth: &Authorization,
        target: &ImageReference,
    ) -> Result<Url, Attempt> {
        let url = self.uploads_url(target);
        let response = self
            .send_once(auth.apply(self.http.post(&url).header(CONTENT_LENGTH, 0)))
            .await
            .map_err(SendError::into_attempt)?;
        let response = self.expect_success(auth, response).await?;

        upload_location(&response).map_err(Attempt::Fatal)
    }

    /// `PUT /v2/<repo>/manifests/<tag>`. The caller passes the digest it
    /// computed over the exact bytes being sent; a disagreeing
    /// `Docker-Content-Digest` response is fatal.
    pub(crate) async fn put_manifest(
        &self,
        auth: &Authorization,
        target: &ImageReference,
        tag: &str,
        media_type: &str,
        bytes: Bytes,
        expected_digest: Digest,
    ) -> Result<(), PushError> {
        let url = self.manifest_url(target, tag);
        let response = self
            .send_retrying(|| {
                auth.apply(
                    self.http
                        .put(&url)
                        .header(CONTENT_TYPE, media_type)
                        .body(bytes.clone()),
                )
            })
            .await?;

        let status = response.status();
        if status == StatusCode::UNSUPPORTED_MEDIA_TYPE {
            return Err(PushError::ManifestUnsupported {
                status: status.as_u16(),
                media_type: media_type.to_owned(),
            });
        }
        if !status.is_success() {
            return Err(self.fail_status(auth, response).await);
        }

        verify_content_digest(&response, expected_digest)
    }

    /// Send with retries for transport failures and transient statuses.
    /// Only safe for idempotent requests; the upload session pair goes
    /// through [`Self::upload_blob`]'s restart loop instead.
    pub(crate) async fn send_retrying(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Response, PushError> {
        let mut backoff = Backoff::new(&self.retry);

        loop {
            match self.send_once(build()).await {
                Ok(response) if transient_status(response.status()) => {
                    let cause = format!("status {}", response.status());
                    warn!(%cause, "transient registry failure");
                    backoff.wait(&self.cancel, cause).await?;
                }
                Ok(response) => return Ok(response),
                Err(SendError::Cancelled) => return Err(PushError::Cancelled),
                Err(SendError::Transport(cause)) => {
                    warn!(%cause, "request transport failure");
                    backoff.wait(&self.cancel, cause).await?;
                }
            }
        }
    }

    /// Every request funnels through here: the per-host permit is held
    /// for the duration of the request, bounding simultaneous
    /// connections to any one host.
    async fn send_once(&self, request: reqwest::RequestBuilder) -> Result<Response, SendError> {
        let request = request
            .build()
            .map_err(|err| SendError::Transport(err.to_string()))?;
        let limit = self.host_limit(request.url());

        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SendError::Cancelled),
            permit = limit.acquire_owned() => permit
                .map_err(|err| SendError::Transport(err.to_string()))?,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(SendError::Cancelled),
            result = self.http.execute(request) => {
                result.map_err(|err| SendError::Transport(err.to_string()))
            }
        }
    }

    /// Classify a response inside the upload restart loop.
    async fn expect_success(
        &self,
        auth: &Authorization,
        response: Response,
    ) -> Result<Response, Attempt> {
        let status = response.status();

        if transient_status(status) {
            return Err(Attempt::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(Attempt::Fatal(self.fail_status(auth, response).await));
        }

        Ok(response)
    }

    /// Map an unexpected terminal status onto the error taxonomy.
    async fn fail_status(&self, auth: &Authorization, response: Response) -> PushError {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return PushError::AuthInsufficient {
                host: auth.host().to_owned(),
                scope: auth.scope().to_owned(),
            };
        }

        let body = response.text().await.unwrap_or_default();
        PushError::RegistryRefused {
            status: status.as_u16(),
            body: snippet(&body),
        }
    }
}

impl SendError {
    fn into_attempt(self) -> Attempt {
        match self {
            SendError::Cancelled => Attempt::Fatal(PushError::Cancelled),
            SendError::Transport(cause) => Attempt::Transient(cause),
        }
    }
}

fn transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn snippet(body: &str) -> String {
    let mut end = body.len().min(BODY_SNIPPET_LEN);
    while !body.is_char_boundary(end) {
        end -= 1;
    }

    body[..end].to_owned()
}

/// Resolve the `Location` header of an upload session response against
/// the request URL; registries frequently return relative locations.
fn upload_location(response: &Response) -> Result<Url, PushError> {
    let status = response.status().as_u16();

    let raw = response
        .headers()
        .get(LOCATION)
        .ok_or_else(|| PushError::RegistryRefused {
            status,
            body: "upload session response missing Location header".to_owned(),
        })?
        .to_str()
        .map_err(|_| PushError::RegistryRefused {
            status,
            body: "upload session Location header is not valid UTF-8".to_owned(),
        })?;

    response
        .url()
        .join(raw)
        .map_err(|err| PushError::RegistryRefused {
            status,
            body: format!("unusable upload session Location header: {err}"),
        })
}

/// Compare a `Docker-Content-Digest` response header, if present, with
/// the locally computed digest.
fn verify_content_digest(response: &Response, expected: Digest) -> Result<(), PushError> {
    let Some(raw) = response.headers().get(DOCKER_CONTENT_DIGEST) else {
        return Ok(());
    };

    let reported = raw.to_str().ok().and_then(|raw| raw.parse::<Digest>().ok());
    match reported {
        Some(reported) if reported == expected => Ok(()),
        Some(reported) => Err(PushError::DigestMismatch {
            expected: expected.to_string(),
            actual: reported.to_string(),
        }),
        None => Err(PushError::DigestMismatch {
            expected: expected.to_string(),
            actual: String::from_utf8_lossy(raw.as_bytes()).into_owned(),
        }),
    }
}

/// Exponential backoff over a fixed attempt budget. `wait` sleeps before
/// the next attempt and fails with `NetworkExhausted` once the budget is
/// spent.
struct Backoff {
    delay: Duration,
    max_delay: Duration,
    attempts_made: u32,
    max_attempts: u32,
}

impl Backoff {
    fn new(retry: &RetryConfig) -> Self {
        Self {
            delay: Duration::from_millis(retry.initial_backoff_ms),
            max_delay: Duration::from_millis(retry.max_backoff_ms),
            attempts_made: 1,
            max_attempts: retry.max_attempts.max(1),
        }
    }

    async fn wait(&mut self, cancel: &CancellationToken, cause: String) -> Result<(), PushError> {
        if self.attempts_made >= self.max_attempts {
            return Err(PushError::NetworkExhausted {
                attempts: self.attempts_made,
                last: cause,
            });
        }
        self.attempts_made += 1;

        tokio::select! {
            _ = cancel.cancelled() => return Err(PushError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }

        self.delay = (self.delay * 2).min(self.max_delay);
        Ok(())
    }
}
