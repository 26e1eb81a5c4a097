//! An in-memory OCI registry that the integration tests run against,
//! served on an ephemeral local port.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use tokio::net::TcpListener;

use oci_registry_client::digest::sha256_digest;

/// The bearer token the mock token endpoint issues and the registry accepts.
pub const MOCK_TOKEN: &str = "mock-registry-token";

const UNAUTHORIZED_BODY: &str =
    r#"{"errors":[{"code":"UNAUTHORIZED","message":"authentication required"}]}"#;

#[derive(Clone, Default)]
pub enum AuthMode {
    /// No authentication at all.
    #[default]
    Open,
    /// Every registry request must carry these Basic credentials.
    Basic { username: String, password: String },
    /// Registry requests need the issued bearer token; the token endpoint
    /// itself optionally requires Basic credentials.
    Bearer {
        credentials: Option<(String, String)>,
    },
}

#[derive(Default)]
pub struct Options {
    pub auth: AuthMode,
    /// Delay served blob GETs, making download concurrency observable.
    pub blob_delay: Option<Duration>,
    /// Drop the Docker-Content-Digest header from manifest responses.
    pub omit_digest_header: bool,
    /// Return a wrong Docker-Content-Digest header on manifest GETs.
    pub bad_digest_header: bool,
    /// Serve corrupted bytes for the blob with this digest.
    pub corrupt_blob: Option<String>,
    /// Serve the native OCI 1.1 referrers endpoint.
    pub referrers_api: bool,
    /// Acknowledge chunk uploads with a wrong Range header.
    pub lie_about_range: bool,
}

#[derive(Default)]
struct Store {
    // (repository, digest) -> bytes
    blobs: HashMap<(String, String), Vec<u8>>,
    // (repository, tag or digest) -> (body, content type)
    manifests: HashMap<(String, String), (Vec<u8>, String)>,
    // repository -> tags, in push order
    tags: HashMap<String, Vec<String>>,
    // upload session id -> received bytes
    uploads: HashMap<String, Vec<u8>>,
    // subject digest -> referrers index JSON
    referrers: HashMap<String, Vec<u8>>,
    manifest_requests: usize,
    last_manifest_authorization: Option<String>,
}

/// Request counters, readable while the registry is serving.
#[derive(Default)]
pub struct Counters {
    pub blob_gets: AtomicUsize,
    pub inflight_blob_gets: AtomicUsize,
    pub max_inflight_blob_gets: AtomicUsize,
    pub upload_posts: AtomicUsize,
    pub upload_patches: AtomicUsize,
    pub upload_puts: AtomicUsize,
    pub token_requests: AtomicUsize,
}

#[derive(Clone)]
struct Shared {
    store: Arc<Mutex<Store>>,
    counters: Arc<Counters>,
    options: Arc<Options>,
    realm: String,
    upload_seq: Arc<AtomicUsize>,
}

pub struct MockRegistry {
    /// `host:port` of the listening registry.
    pub addr: String,
    pub counters: Arc<Counters>,
    store: Arc<Mutex<Store>>,
}

impl MockRegistry {
    pub async fn spawn() -> Self {
        Self::spawn_with(Options::default()).await
    }

    pub async fn spawn_with(options: Options) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

        let store = Arc::new(Mutex::new(Store::default()));
        let counters = Arc::new(Counters::default());
        let shared = Shared {
            store: Arc::clone(&store),
            counters: Arc::clone(&counters),
            options: Arc::new(options),
            realm: format!("http://{}/token", addr),
            upload_seq: Arc::new(AtomicUsize::new(0)),
        };

        let protected = Router::new()
            .route("/v2/", get(api_version))
            .route(
                "/v2/:repo/manifests/:reference",
                get(get_manifest).put(put_manifest),
            )
            .route("/v2/:repo/blobs/:digest", get(get_blob))
            .route("/v2/:repo/blobs/uploads/", post(start_upload))
            .route(
                "/v2/:repo/blobs/uploads/:session",
                axum::routing::patch(patch_upload).put(put_upload),
            )
            .route("/v2/:repo/tags/list", get(list_tags))
            .route("/v2/:repo/referrers/:digest", get(get_referrers))
            .layer(middleware::from_fn_with_state(
                shared.clone(),
                require_auth,
            ));

        let app = Router::new()
            .route("/token", get(issue_token))
            .merge(protected)
            .layer(DefaultBodyLimit::disable())
            .with_state(shared);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockRegistry {
            addr,
            counters,
            store,
        }
    }

    /// Preload a blob without going through the upload protocol.
    pub fn add_blob(&self, repo: &str, data: &[u8]) -> String {
        let digest = sha256_digest(data);
        self.store
            .lock()
            .unwrap()
            .blobs
            .insert((repo.to_string(), digest.clone()), data.to_vec());
        digest
    }

    /// Preload a manifest under a tag (also addressable by its digest).
    /// Returns the manifest digest.
    pub fn add_manifest(
        &self,
        repo: &str,
        reference: &str,
        content_type: &str,
        body: &[u8],
    ) -> String {
        let digest = sha256_digest(body);
        let mut store = self.store.lock().unwrap();
        store.manifests.insert(
            (repo.to_string(), reference.to_string()),
            (body.to_vec(), content_type.to_string()),
        );
        store.manifests.insert(
            (repo.to_string(), digest.clone()),
            (body.to_vec(), content_type.to_string()),
        );
        if !reference.contains(':') {
            let tags = store.tags.entry(repo.to_string()).or_default();
            if !tags.iter().any(|t| t == reference) {
                tags.push(reference.to_string());
            }
        }
        digest
    }

    /// Preload the index returned by the native referrers endpoint for a
    /// subject digest.
    pub fn add_referrers_index(&self, subject_digest: &str, body: &[u8]) {
        self.store
            .lock()
            .unwrap()
            .referrers
            .insert(subject_digest.to_string(), body.to_vec());
    }

    pub fn blob(&self, repo: &str, digest: &str) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap()
            .blobs
            .get(&(repo.to_string(), digest.to_string()))
            .cloned()
    }

    pub fn manifest(&self, repo: &str, reference: &str) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap()
            .manifests
            .get(&(repo.to_string(), reference.to_string()))
            .map(|(body, _)| body.clone())
    }

    pub fn manifest_requests(&self) -> usize {
        self.store.lock().unwrap().manifest_requests
    }

    pub fn last_manifest_authorization(&self) -> Option<String> {
        self.store
            .lock()
            .unwrap()
            .last_manifest_authorization
            .clone()
    }
}

fn json_response(status: StatusCode, body: impl Into<Body>) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

fn not_found(code: &str) -> Response {
    json_response(
        StatusCode::NOT_FOUND,
        format!(
            r#"{{"errors":[{{"code":"{}","message":"not found"}}]}}"#,
            code
        ),
    )
}

async fn require_auth(
    State(shared): State<Shared>,
    request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if request.uri().path().contains("/manifests/")
        && (request.method() == Method::GET || request.method() == Method::HEAD)
    {
        let mut store = shared.store.lock().unwrap();
        store.manifest_requests += 1;
        store.last_manifest_authorization = authorization.clone();
    }

    let authorized = match &shared.options.auth {
        AuthMode::Open => true,
        AuthMode::Basic { username, password } => {
            authorization.as_deref() == Some(basic_header(username, password).as_str())
        }
        AuthMode::Bearer { .. } => {
            authorization.as_deref() == Some(format!("Bearer {}", MOCK_TOKEN).as_str())
        }
    };

    if authorized {
        return next.run(request).await;
    }

    let challenge = match &shared.options.auth {
        AuthMode::Basic { .. } => r#"Basic realm="mock-registry""#.to_string(),
        _ => format!(
            r#"Bearer realm="{}",service="mock-registry""#,
            shared.realm
        ),
    };
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::WWW_AUTHENTICATE, challenge)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(UNAUTHORIZED_BODY))
        .unwrap()
}

fn basic_header(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password))
    )
}

async fn issue_token(State(shared): State<Shared>, headers: HeaderMap) -> Response {
    shared.counters.token_requests.fetch_add(1, Ordering::SeqCst);

    if let AuthMode::Bearer {
        credentials: Some((username, password)),
    } = &shared.options.auth
    {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(basic_header(username, password).as_str()) {
            return json_response(StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY);
        }
    }

    json_response(
        StatusCode::OK,
        format!(r#"{{"token":"{}","expires_in":300}}"#, MOCK_TOKEN),
    )
}

async fn api_version() -> Response {
    json_response(StatusCode::OK, "{}")
}

async fn get_manifest(
    State(shared): State<Shared>,
    Path((repo, reference)): Path<(String, String)>,
) -> Response {
    let entry = shared
        .store
        .lock()
        .unwrap()
        .manifests
        .get(&(repo, reference))
        .cloned();
    let (body, content_type) = match entry {
        Some(found) => found,
        None => return not_found("MANIFEST_UNKNOWN"),
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    if shared.options.bad_digest_header {
        builder = builder.header("Docker-Content-Digest", sha256_digest(b"someone elses bytes"));
    } else if !shared.options.omit_digest_header {
        builder = builder.header("Docker-Content-Digest", sha256_digest(&body));
    }
    builder.body(Body::from(body)).unwrap()
}

async fn put_manifest(
    State(shared): State<Shared>,
    Path((repo, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/vnd.oci.image.manifest.v1+json")
        .to_string();
    let digest = sha256_digest(&body);

    let mut store = shared.store.lock().unwrap();
    store.manifests.insert(
        (repo.clone(), reference.clone()),
        (body.to_vec(), content_type.clone()),
    );
    store
        .manifests
        .insert((repo.clone(), digest.clone()), (body.to_vec(), content_type));
    if !reference.contains(':') {
        let tags = store.tags.entry(repo.clone()).or_default();
        if !tags.iter().any(|t| t == &reference) {
            tags.push(reference.clone());
        }
    }

    Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, format!("/v2/{}/manifests/{}", repo, digest))
        .header("Docker-Content-Digest", digest)
        .body(Body::empty())
        .unwrap()
}

async fn get_blob(
    State(shared): State<Shared>,
    Path((repo, digest)): Path<(String, String)>,
    method: Method,
) -> Response {
    let blob = shared
        .store
        .lock()
        .unwrap()
        .blobs
        .get(&(repo, digest.clone()))
        .cloned();
    let mut body = match blob {
        Some(data) => data,
        None => return not_found("BLOB_UNKNOWN"),
    };

    if method == Method::GET {
        shared.counters.blob_gets.fetch_add(1, Ordering::SeqCst);
        let inflight = shared
            .counters
            .inflight_blob_gets
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        shared
            .counters
            .max_inflight_blob_gets
            .fetch_max(inflight, Ordering::SeqCst);
        if let Some(delay) = shared.options.blob_delay {
            tokio::time::sleep(delay).await;
        }
        shared
            .counters
            .inflight_blob_gets
            .fetch_sub(1, Ordering::SeqCst);
    }

    if shared.options.corrupt_blob.as_deref() == Some(digest.as_str()) {
        for byte in body.iter_mut() {
            *byte ^= 0xff;
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("Docker-Content-Digest", digest)
        .body(Body::from(body))
        .unwrap()
}

async fn start_upload(
    State(shared): State<Shared>,
    Path(repo): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    shared.counters.upload_posts.fetch_add(1, Ordering::SeqCst);

    // Cross-repository mount: copy the blob when we have it, otherwise
    // fall back to a regular upload session per the distribution spec.
    if let (Some(mount), Some(from)) = (params.get("mount"), params.get("from")) {
        let mut store = shared.store.lock().unwrap();
        if let Some(data) = store.blobs.get(&(from.clone(), mount.clone())).cloned() {
            store.blobs.insert((repo.clone(), mount.clone()), data);
            return Response::builder()
                .status(StatusCode::CREATED)
                .header(header::LOCATION, format!("/v2/{}/blobs/{}", repo, mount))
                .body(Body::empty())
                .unwrap();
        }
    }

    let session = format!("upload-{}", shared.upload_seq.fetch_add(1, Ordering::SeqCst));
    shared
        .store
        .lock()
        .unwrap()
        .uploads
        .insert(session.clone(), Vec::new());

    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(
            header::LOCATION,
            format!("/v2/{}/blobs/uploads/{}", repo, session),
        )
        .body(Body::empty())
        .unwrap()
}

async fn patch_upload(
    State(shared): State<Shared>,
    Path((repo, session)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    shared.counters.upload_patches.fetch_add(1, Ordering::SeqCst);

    let total = {
        let mut store = shared.store.lock().unwrap();
        let upload = match store.uploads.get_mut(&session) {
            Some(upload) => upload,
            None => return not_found("BLOB_UPLOAD_UNKNOWN"),
        };
        upload.extend_from_slice(&body);
        upload.len()
    };

    let reported_end = if shared.options.lie_about_range {
        total + 9
    } else {
        total.saturating_sub(1)
    };

    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(
            header::LOCATION,
            format!("/v2/{}/blobs/uploads/{}", repo, session),
        )
        .header("Range", format!("0-{}", reported_end))
        .body(Body::empty())
        .unwrap()
}

async fn put_upload(
    State(shared): State<Shared>,
    Path((repo, session)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    shared.counters.upload_puts.fetch_add(1, Ordering::SeqCst);

    let digest = match params.get("digest") {
        Some(digest) => digest.clone(),
        None => {
            return json_response(
                StatusCode::BAD_REQUEST,
                r#"{"errors":[{"code":"DIGEST_INVALID","message":"digest missing"}]}"#,
            )
        }
    };

    let mut store = shared.store.lock().unwrap();
    let mut data = match store.uploads.remove(&session) {
        Some(data) => data,
        None => return not_found("BLOB_UPLOAD_UNKNOWN"),
    };
    data.extend_from_slice(&body);

    if sha256_digest(&data) != digest {
        return json_response(
            StatusCode::BAD_REQUEST,
            r#"{"errors":[{"code":"DIGEST_INVALID","message":"digest does not match content"}]}"#,
        );
    }

    store.blobs.insert((repo.clone(), digest.clone()), data);

    Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, format!("/v2/{}/blobs/{}", repo, digest))
        .body(Body::empty())
        .unwrap()
}

async fn list_tags(
    State(shared): State<Shared>,
    Path(repo): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let tags = shared
        .store
        .lock()
        .unwrap()
        .tags
        .get(&repo)
        .cloned()
        .unwrap_or_default();

    let mut tags: Vec<String> = match params.get("last") {
        Some(last) => tags
            .iter()
            .skip_while(|t| *t != last)
            .skip(1)
            .cloned()
            .collect(),
        None => tags,
    };
    if let Some(n) = params.get("n").and_then(|n| n.parse::<usize>().ok()) {
        tags.truncate(n);
    }

    let body = serde_json::json!({ "name": repo, "tags": tags });
    json_response(StatusCode::OK, body.to_string())
}

async fn get_referrers(
    State(shared): State<Shared>,
    Path((_repo, digest)): Path<(String, String)>,
) -> Response {
    if !shared.options.referrers_api {
        return not_found("UNSUPPORTED");
    }

    let index = shared
        .store
        .lock()
        .unwrap()
        .referrers
        .get(&digest)
        .cloned()
        .unwrap_or_else(|| {
            br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#
                .to_vec()
        });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.oci.image.index.v1+json")
        .body(Body::from(index))
        .unwrap()
}
