//! In-memory mock registry for exercising the push client end to end.
//!
//! Speaks the subset of the distribution protocol a push needs: blob
//! HEAD, upload sessions (POST/PATCH/PUT), cross-repository mounts,
//! manifest PUT and the bearer token flow. Every request is recorded and
//! a few failure modes can be injected.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, Request, State},
    http::{
        header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
        HeaderMap, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, head, patch, post, put},
    Json, Router,
};
use serde::Deserialize;
use sha2::Digest as Sha2Digest;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
}

#[derive(Default)]
struct Storage {
    /// repository -> digest -> bytes
    blobs: HashMap<String, HashMap<String, Vec<u8>>>,
    uploads: HashMap<Uuid, Vec<u8>>,
    /// (repository, reference) -> (content type, bytes)
    manifests: HashMap<(String, String), (String, Vec<u8>)>,
}

struct MockState {
    storage: Mutex<Storage>,
    log: Mutex<Vec<RecordedRequest>>,
    /// Statuses served for upcoming PATCH requests, consumed in order.
    fail_patches: Mutex<Vec<u16>>,
    /// Served as `Docker-Content-Digest` on manifest PUTs when set.
    manifest_digest_override: Mutex<Option<String>>,
    stall_patches: AtomicBool,
    /// Concurrently in-flight requests, and the highest value observed.
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    /// Artificial per-request latency, to make request overlap visible.
    request_delay: Mutex<Option<Duration>>,
    /// When set, every endpoint demands this bearer token.
    token: Option<String>,
    realm: String,
}

pub struct MockRegistry {
    state: Arc<MockState>,
    addr: SocketAddr,
}

#[allow(dead_code)] // not every test file uses every helper
impl MockRegistry {
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_inner(None).await
    }

    pub async fn spawn_with_token(token: &str) -> anyhow::Result<Self> {
        Self::spawn_inner(Some(token.to_owned())).await
    }

    async fn spawn_inner(token: Option<String>) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("could not bind listener")?;
        let addr = listener.local_addr().context("could not read local addr")?;

        let state = Arc::new(MockState {
            storage: Default::default(),
            log: Default::default(),
            fail_patches: Default::default(),
            manifest_digest_override: Default::default(),
            stall_patches: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            request_delay: Default::default(),
            token,
            realm: format!("http://{addr}/token"),
        });

        let router = make_router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("mock registry exited");
        });

        Ok(Self { state, addr })
    }

    /// Router without a socket, for in-process tower tests.
    pub fn in_process() -> (Self, Router) {
        let state = Arc::new(MockState {
            storage: Default::default(),
            log: Default::default(),
            fail_patches: Default::default(),
            manifest_digest_override: Default::default(),
            stall_patches: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            request_delay: Default::default(),
            token: None,
            realm: "http://unused/token".to_owned(),
        });

        let router = make_router(Arc::clone(&state));
        let registry = Self {
            state,
            addr: ([127, 0, 0, 1], 0).into(),
        };

        (registry, router)
    }

    /// `host:port`, usable as the registry part of an image reference.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.state.log.lock().unwrap().clear();
    }

    pub fn count(&self, method: &str, path_fragment: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path.contains(path_fragment))
            .count()
    }

    pub fn fail_next_patch(&self, status: u16) {
        self.state.fail_patches.lock().unwrap().push(status);
    }

    pub fn override_manifest_digest(&self, digest: &str) {
        *self.state.manifest_digest_override.lock().unwrap() = Some(digest.to_owned());
    }

    pub fn stall_patches(&self) {
        self.state.stall_patches.store(true, Ordering::SeqCst);
    }

    /// Hold every request open for `delay`, so concurrent requests
    /// overlap long enough to be counted.
    pub fn set_request_delay(&self, delay: Duration) {
        *self.state.request_delay.lock().unwrap() = Some(delay);
    }

    /// Highest number of simultaneously in-flight requests seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Preload a blob, as if some earlier push put it there. Returns the
    /// digest string.
    pub fn put_blob(&self, repository: &str, bytes: &[u8]) -> String {
        let digest = digest_of(bytes);
        self.state
            .storage
            .lock()
            .unwrap()
            .blobs
            .entry(repository.to_owned())
            .or_default()
            .insert(digest.clone(), bytes.to_vec());
        digest
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        self.state
            .storage
            .lock()
            .unwrap()
            .blobs
            .get(repository)
            .is_some_and(|blobs| blobs.contains_key(digest))
    }

    pub fn manifest(&self, repository: &str, reference: &str) -> Option<(String, Vec<u8>)> {
        self.state
            .storage
            .lock()
            .unwrap()
            .manifests
            .get(&(repository.to_owned(), reference.to_owned()))
            .cloned()
    }
}

fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(sha2::Sha256::digest(bytes)))
}

fn make_router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/v2/", get(index_v2))
        .route("/token", get(issue_token))
        .route("/v2/:repository/:image/blobs/:digest", head(blob_check))
        .route("/v2/:repository/:image/blobs/uploads/", post(upload_new))
        .route(
            "/v2/:repository/:image/uploads/:upload",
            patch(upload_add_chunk),
        )
        .route(
            "/v2/:repository/:image/uploads/:upload",
            put(upload_finalize),
        )
        .route(
            "/v2/:repository/:image/manifests/:reference",
            put(manifest_put),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            record_request,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn record_request(
    State(state): State<Arc<MockState>>,
    request: Request,
    next: Next,
) -> Response {
    state.log.lock().unwrap().push(RecordedRequest {
        method: request.method().to_string(),
        path: request.uri().path().to_owned(),
        query: request.uri().query().map(ToOwned::to_owned),
    });

    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_in_flight.fetch_max(now, Ordering::SeqCst);

    let delay = *state.request_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let response = next.run(request).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    response
}

fn authorized(state: &MockState, headers: &HeaderMap) -> bool {
    match &state.token {
        None => true,
        Some(token) => headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == format!("Bearer {token}")),
    }
}

fn unauthorized(state: &MockState) -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(
            "WWW-Authenticate",
            format!(
                "Bearer realm=\"{}\",service=\"mock-registry\"",
                state.realm
            ),
        )
        .body(Body::empty())
        .unwrap()
}

async fn index_v2(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized(&state);
    }

    StatusCode::OK.into_response()
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    #[allow(dead_code)]
    service: Option<String>,
    scope: Option<String>,
}

async fn issue_token(
    State(state): State<Arc<MockState>>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let token = state.token.clone().unwrap_or_else(|| "anonymous".to_owned());

    Json(serde_json::json!({
        "token": token,
        "scope": query.scope,
    }))
    .into_response()
}

async fn blob_check(
    State(state): State<Arc<MockState>>,
    Path((repository, image, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized(&state);
    }

    let repo = format!("{repository}/{image}");
    let storage = state.storage.lock().unwrap();

    match storage.blobs.get(&repo).and_then(|blobs| blobs.get(&digest)) {
        Some(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_LENGTH, bytes.len())
            .header("Docker-Content-Digest", digest)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::empty())
            .unwrap(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MountQuery {
    mount: Option<String>,
    from: Option<String>,
}

fn mk_upload_location(repository: &str, image: &str, upload: Uuid) -> String {
    format!("/v2/{repository}/{image}/uploads/{upload}")
}

async fn upload_new(
    State(state): State<Arc<MockState>>,
    Path((repository, image)): Path<(String, String)>,
    Query(MountQuery { mount, from }): Query<MountQuery>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized(&state);
    }

    let mut storage = state.storage.lock().unwrap();

    // Cross-repository mount: link the blob when the source has it,
    // decline with a regular upload session otherwise.
    if let (Some(mount), Some(from)) = (mount, from) {
        let existing = storage
            .blobs
            .get(&from)
            .and_then(|blobs| blobs.get(&mount))
            .cloned();

        if let Some(bytes) = existing {
            let repo = format!("{repository}/{image}");
            storage
                .blobs
                .entry(repo)
                .or_default()
                .insert(mount.clone(), bytes);

            return Response::builder()
                .status(StatusCode::CREATED)
                .header("Docker-Content-Digest", mount)
                .header(CONTENT_LENGTH, 0)
                .body(Body::empty())
                .unwrap();
        }
    }

    let upload = Uuid::new_v4();
    storage.uploads.insert(upload, Vec::new());

    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(LOCATION, mk_upload_location(&repository, &image, upload))
        .header("Docker-Upload-UUID", upload.to_string())
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .unwrap()
}

async fn upload_add_chunk(
    State(state): State<Arc<MockState>>,
    Path((repository, image, upload)): Path<(String, String, Uuid)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized(&state);
    }

    if state.stall_patches.load(Ordering::SeqCst) {
        // Long enough for the test to cancel mid-flight.
        tokio::time::sleep(Duration::from_secs(30)).await;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let injected = {
        let mut fail_patches = state.fail_patches.lock().unwrap();
        if fail_patches.is_empty() {
            None
        } else {
            Some(fail_patches.remove(0))
        }
    };
    if let Some(status) = injected {
        return StatusCode::from_u16(status)
            .expect("injected status should be valid")
            .into_response();
    }

    let mut storage = state.storage.lock().unwrap();
    let Some(buffer) = storage.uploads.get_mut(&upload) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    buffer.extend_from_slice(&body);
    let completed = buffer.len();

    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(LOCATION, mk_upload_location(&repository, &image, upload))
        .header("Range", format!("0-{completed}"))
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .unwrap()
}

#[derive(Debug, Deserialize)]
struct DigestQuery {
    digest: String,
}

async fn upload_finalize(
    State(state): State<Arc<MockState>>,
    Path((repository, image, upload)): Path<(String, String, Uuid)>,
    Query(DigestQuery { digest }): Query<DigestQuery>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized(&state);
    }

    let mut storage = state.storage.lock().unwrap();
    let Some(bytes) = storage.uploads.remove(&upload) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if digest_of(&bytes) != digest {
        return (StatusCode::BAD_REQUEST, "digest did not match").into_response();
    }

    let repo = format!("{repository}/{image}");
    storage
        .blobs
        .entry(repo)
        .or_default()
        .insert(digest.clone(), bytes);

    Response::builder()
        .status(StatusCode::CREATED)
        .header("Docker-Content-Digest", digest)
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .unwrap()
}

async fn manifest_put(
    State(state): State<Arc<MockState>>,
    Path((repository, image, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized(&state);
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_owned();

    let digest = state
        .manifest_digest_override
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| digest_of(&body));

    let repo = format!("{repository}/{image}");
    state
        .storage
        .lock()
        .unwrap()
        .manifests
        .insert((repo, reference), (content_type, body.to_vec()));

    Response::builder()
        .status(StatusCode::CREATED)
        .header("Docker-Content-Digest", digest)
        .header(CONTENT_LENGTH, 0)
        .body(Body::empty())
        .unwrap()
}

/// Install a subscriber once; repeat calls are fine.
#[allow(dead_code)]
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stevedore=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
