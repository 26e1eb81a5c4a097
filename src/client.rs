//! OCI distribution client
//!
//! The client speaks the OCI Distribution Specification against any
//! compliant registry: manifest and blob pulls, monolithic and chunked
//! blob pushes, tag listing, and the OCI 1.1 referrers API.

use crate::digest::{self, sha256_digest, DigestVerifier};
use crate::errors::{OciDistributionError, OciEnvelope, Result};
use crate::manifest::{
    ImageIndexEntry, OciDescriptor, OciImageIndex, OciImageManifest, OciManifest, Versioned,
    IMAGE_CONFIG_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
};
use crate::secrets::{Authenticable, RegistryAuth};
use crate::token_cache::{
    epoch_secs, RegistryOperation, RegistryToken, RegistryTokenType, TokenCache,
};
use crate::Reference;

use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use hyperx::header::Header;
use olpc_cjson::CanonicalFormatter;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use www_authenticate::{Challenge, ChallengeFields, RawChallenge, WwwAuthenticate};

/// Media types sent in the `Accept` header when negotiating manifests,
/// in preference order.
const MIME_TYPES_DISTRIBUTION_MANIFEST: &[&str] = &[
    OCI_IMAGE_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
];

const PUSH_CHUNK_MAX_SIZE: usize = 4096 * 1024;

/// Default value for `ClientConfig::max_concurrent_upload`
pub const DEFAULT_MAX_CONCURRENT_UPLOAD: usize = 16;

/// Default value for `ClientConfig::max_concurrent_download`
pub const DEFAULT_MAX_CONCURRENT_DOWNLOAD: usize = 16;

/// Default value for `ClientConfig::default_token_expiration_secs`
pub const DEFAULT_TOKEN_EXPIRATION_SECS: u64 = 300;

/// The data for an image or module.
#[derive(Clone)]
pub struct ImageData {
    /// The layers of the image or module.
    pub layers: Vec<ImageLayer>,
    /// The digest of the image or module.
    pub digest: Option<String>,
    /// The configuration object of the image or module.
    pub config: Config,
    /// The manifest of the image or module. When the registry returned an
    /// image index that could not be resolved to a single platform, this
    /// holds the index itself and `config`/`layers` are empty.
    pub manifest: Option<OciManifest>,
}

/// The data returned by an OCI registry after a successful push
/// operation is completed
#[derive(Debug)]
pub struct PushResponse {
    /// Pullable url for the config
    pub config_url: String,
    /// Pullable url for the manifest
    pub manifest_url: String,
}

/// The data returned by a successful tags/list request
#[derive(Deserialize, Debug)]
pub struct TagResponse {
    /// Repository name
    pub name: String,
    /// List of existing tags
    pub tags: Vec<String>,
}

/// The data and media type for an image layer
#[derive(Clone)]
pub struct ImageLayer {
    /// The data of this layer
    pub data: Vec<u8>,
    /// The media type of this layer
    pub media_type: String,
    /// This OPTIONAL property contains arbitrary metadata for this descriptor.
    /// This OPTIONAL property MUST use the [annotation rules](https://github.com/opencontainers/image-spec/blob/main/annotations.md#rules)
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageLayer {
    /// Constructs a new ImageLayer struct with provided data and media type
    pub fn new(
        data: Vec<u8>,
        media_type: String,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Self {
        ImageLayer {
            data,
            media_type,
            annotations,
        }
    }

    /// Constructs a new ImageLayer struct with provided data and
    /// media type application/vnd.oci.image.layer.v1.tar
    pub fn oci_v1(data: Vec<u8>, annotations: Option<BTreeMap<String, String>>) -> Self {
        Self::new(data, IMAGE_LAYER_MEDIA_TYPE.to_string(), annotations)
    }

    /// Constructs a new ImageLayer struct with provided data and
    /// media type application/vnd.oci.image.layer.v1.tar+gzip
    pub fn oci_v1_gzip(data: Vec<u8>, annotations: Option<BTreeMap<String, String>>) -> Self {
        Self::new(data, IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(), annotations)
    }

    /// Helper function to compute the sha256 digest of an image layer
    pub fn sha256_digest(&self) -> String {
        sha256_digest(&self.data)
    }
}

/// The data and media type for a configuration object
#[derive(Clone)]
pub struct Config {
    /// The data of this config object
    pub data: Vec<u8>,
    /// The media type of this object
    pub media_type: String,
    /// This OPTIONAL property contains arbitrary metadata for this descriptor.
    /// This OPTIONAL property MUST use the [annotation rules](https://github.com/opencontainers/image-spec/blob/main/annotations.md#rules)
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Config {
    /// Constructs a new Config struct with provided data and media type
    pub fn new(
        data: Vec<u8>,
        media_type: String,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Self {
        Config {
            data,
            media_type,
            annotations,
        }
    }

    /// Constructs a new Config struct with provided data and
    /// media type application/vnd.oci.image.config.v1+json
    pub fn oci_v1(data: Vec<u8>, annotations: Option<BTreeMap<String, String>>) -> Self {
        Self::new(data, IMAGE_CONFIG_MEDIA_TYPE.to_string(), annotations)
    }

    /// Helper function to compute the sha256 digest of this config object
    pub fn sha256_digest(&self) -> String {
        sha256_digest(&self.data)
    }
}

/// The OCI client connects to an OCI registry and fetches OCI images.
///
/// An OCI registry is a container registry that adheres to the OCI Distribution
/// specification. DockerHub is one example, as are ACR and GCR. This client
/// provides a native Rust implementation for pulling and pushing OCI images.
///
/// Most registries require an OAuth2-style token exchange before content can
/// be accessed. The client performs that exchange on demand: when a request
/// comes back `401`, the challenge in the response is answered once and the
/// request retried; a second `401` is terminal. Credentials can be seeded
/// ahead of time with [`Client::store_auth`].
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    // Registry -> RegistryAuth
    auth_store: Arc<RwLock<HashMap<String, RegistryAuth>>>,
    tokens: TokenCache,
    client: reqwest::Client,
    push_chunk_size: usize,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            config: Arc::default(),
            auth_store: Arc::default(),
            tokens: TokenCache::new(),
            client: reqwest::Client::default(),
            push_chunk_size: PUSH_CHUNK_MAX_SIZE,
        }
    }
}

/// A source that can provide a `ClientConfig`.
/// If you are using this crate in your own application, you can implement this
/// trait on your configuration type so that it can be passed to `Client::from_source`.
pub trait ClientConfigSource {
    /// Provides a `ClientConfig`.
    fn client_config(&self) -> ClientConfig;
}

impl TryFrom<ClientConfig> for Client {
    type Error = OciDistributionError;

    fn try_from(config: ClientConfig) -> std::result::Result<Self, Self::Error> {
        let mut client_builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certificates);

        client_builder = match () {
            #[cfg(feature = "native-tls")]
            () => client_builder.danger_accept_invalid_hostnames(config.accept_invalid_hostnames),
            #[cfg(not(feature = "native-tls"))]
            () => {
                if config.accept_invalid_hostnames {
                    warn!("Cannot change value of `accept_invalid_hostnames`: missing 'native-tls' feature");
                }
                client_builder
            }
        };

        for c in &config.extra_root_certificates {
            let cert = match c.encoding {
                CertificateEncoding::Der => reqwest::Certificate::from_der(c.data.as_slice())?,
                CertificateEncoding::Pem => reqwest::Certificate::from_pem(c.data.as_slice())?,
            };
            client_builder = client_builder.add_root_certificate(cert);
        }

        if let Some(timeout) = config.connect_timeout {
            client_builder = client_builder.connect_timeout(timeout);
        }
        if let Some(timeout) = config.read_timeout {
            client_builder = client_builder.timeout(timeout);
        }

        if let Some(proxy_url) = &config.http_proxy {
            let mut proxy = reqwest::Proxy::http(proxy_url)?;
            if let Some(no_proxy) = &config.no_proxy {
                proxy = proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy));
            }
            client_builder = client_builder.proxy(proxy);
        }
        if let Some(proxy_url) = &config.https_proxy {
            let mut proxy = reqwest::Proxy::https(proxy_url)?;
            if let Some(no_proxy) = &config.no_proxy {
                proxy = proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy));
            }
            client_builder = client_builder.proxy(proxy);
        }

        Ok(Self {
            config: Arc::new(config),
            client: client_builder.build()?,
            ..Default::default()
        })
    }
}

impl Client {
    /// Create a new client with the supplied config
    pub fn new(config: ClientConfig) -> Self {
        Client::try_from(config).unwrap_or_else(|err| {
            warn!("Cannot create OCI client from config: {:?}", err);
            warn!("Creating client with default configuration");
            Self::default()
        })
    }

    /// Create a new client with the supplied config
    pub fn from_source(config_source: &impl ClientConfigSource) -> Self {
        Self::new(config_source.client_config())
    }

    /// Seed credentials for a registry ahead of any operation.
    ///
    /// This performs no network round trip; the credential is used the next
    /// time a request to this registry needs authentication.
    pub async fn store_auth(&self, registry: &str, auth: RegistryAuth) {
        self.auth_store
            .write()
            .await
            .insert(registry.to_string(), auth);
    }

    async fn is_stored_auth(&self, registry: &str) -> bool {
        self.auth_store.read().await.contains_key(registry)
    }

    async fn store_auth_if_needed(&self, registry: &str, auth: &RegistryAuth) {
        if !self.is_stored_auth(registry).await {
            self.store_auth(registry, auth.clone()).await;
        }
    }

    async fn stored_auth(&self, registry: &str) -> RegistryAuth {
        self.auth_store
            .read()
            .await
            .get(registry)
            .cloned()
            .unwrap_or(RegistryAuth::Anonymous)
    }

    /// Perform the token exchange for the challenge a registry returned.
    ///
    /// This is the one automatic retry the client allows itself: it runs at
    /// most once per failed request, the caller then retries the original
    /// request with the freshly cached token.
    async fn exchange_token(
        &self,
        image: &Reference,
        operation: RegistryOperation,
        headers: &HeaderMap,
    ) -> Result<()> {
        let dist_hdr = headers
            .get(reqwest::header::WWW_AUTHENTICATE)
            .ok_or_else(|| {
                OciDistributionError::AuthenticationFailed(
                    "registry returned 401 with no challenge".to_string(),
                )
            })?;

        let auth = WwwAuthenticate::parse_header(&dist_hdr.as_bytes().into()).map_err(|e| {
            OciDistributionError::AuthenticationFailed(format!(
                "cannot parse authentication challenge: {}",
                e
            ))
        })?;
        let authentication = self.stored_auth(image.registry()).await;

        // If no Bearer challenge is present the registry wants HTTP Basic
        // Auth; there is no token to exchange in that case.
        let challenge_opt = match auth.get::<BearerChallenge>() {
            Some(co) => co,
            None => {
                if let RegistryAuth::Basic(username, password) = &authentication {
                    self.tokens
                        .insert(
                            image,
                            operation,
                            RegistryTokenType::Basic(username.clone(), password.clone()),
                            u64::MAX,
                        )
                        .await;
                    return Ok(());
                }
                return Err(OciDistributionError::AuthenticationFailed(
                    "registry requires credentials and none were supplied".to_string(),
                ));
            }
        };

        let challenge = &challenge_opt[0];
        let realm = challenge.realm.as_ref().ok_or_else(|| {
            OciDistributionError::AuthenticationFailed(
                "bearer challenge is missing a realm".to_string(),
            )
        })?;
        let service = challenge.service.as_ref();
        // Prefer the scope the registry asked for, fall back to one derived
        // from the operation.
        let scope = challenge.scope.clone().unwrap_or_else(|| match operation {
            RegistryOperation::Pull => format!("repository:{}:pull", image.repository()),
            RegistryOperation::Push => format!("repository:{}:pull,push", image.repository()),
        });

        let mut query = vec![("scope", &scope)];
        if let Some(s) = service {
            query.push(("service", s))
        }

        debug!(?realm, ?service, ?scope, "Making authentication call");

        let auth_res = self
            .client
            .get(realm)
            .query(&query)
            .apply_authentication(&authentication)
            .send()
            .await?;

        match auth_res.status() {
            StatusCode::OK => {
                let text = auth_res.text().await?;
                trace!("Received response from auth request: {}", text);
                let token: RegistryToken = serde_json::from_str(&text)
                    .map_err(|e| OciDistributionError::RegistryTokenDecodeError(e.to_string()))?;
                let expiry: TokenExpiry = serde_json::from_str(&text).unwrap_or_default();
                let lifetime = expiry
                    .expires_in
                    .unwrap_or(self.config.default_token_expiration_secs);
                debug!("Successfully authorized for image '{:?}'", image);
                self.tokens
                    .insert(
                        image,
                        operation,
                        RegistryTokenType::Bearer(token),
                        epoch_secs() + lifetime,
                    )
                    .await;
                Ok(())
            }
            _ => {
                let reason = auth_res.text().await?;
                debug!("Failed to authenticate for image '{:?}': {}", image, reason);
                Err(OciDistributionError::AuthenticationFailed(reason))
            }
        }
    }

    /// Perform the token exchange eagerly, before issuing any other request.
    ///
    /// The registry's `GET /v2/` endpoint tells us whether a token is needed
    /// at all. Returns the bearer token if one was acquired. Calling this is
    /// optional; requests authenticate on demand.
    pub async fn auth(
        &self,
        image: &Reference,
        authentication: &RegistryAuth,
        operation: RegistryOperation,
    ) -> Result<Option<String>> {
        debug!("Authorizing for image: {:?}", image);
        self.store_auth_if_needed(image.registry(), authentication)
            .await;

        // The version request will tell us where to go.
        let url = format!(
            "{}://{}/v2/",
            self.config.protocol.scheme_for(image.registry()),
            image.registry()
        );
        debug!(?url);
        let res = self.client.get(&url).send().await?;
        if res.headers().get(reqwest::header::WWW_AUTHENTICATE).is_none() {
            return Ok(None);
        }

        self.exchange_token(image, operation, res.headers()).await?;
        match self.tokens.get(image, operation).await {
            Some(RegistryTokenType::Bearer(token)) => Ok(Some(token.token().to_string())),
            _ => Ok(None),
        }
    }

    /// Fetches the available tags for the given reference.
    ///
    /// The client will check if it's already been authenticated and if
    /// not will attempt to do so.
    pub async fn list_tags(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
        n: Option<usize>,
        last: Option<&str>,
    ) -> Result<TagResponse> {
        let url = self.to_list_tags_url(image);
        debug!("Listing tags from {}", url);
        self.store_auth_if_needed(image.registry(), auth).await;

        let request = self.client.get(&url);
        let request = if let Some(num) = n {
            request.query(&[("n", num)])
        } else {
            request
        };
        let request = if let Some(l) = last {
            request.query(&[("last", l)])
        } else {
            request
        };

        let res = RequestBuilderWrapper {
            client: self,
            request_builder: request,
        }
        .send(image, RegistryOperation::Pull)
        .await?;
        let status = res.status();
        let body = res.bytes().await?;

        validate_registry_response(status, &body, &url)?;

        Ok(serde_json::from_str(std::str::from_utf8(&body)?)?)
    }

    /// Pull an image and return the bytes
    ///
    /// The client will check if it's already been authenticated and if
    /// not will attempt to do so.
    ///
    /// Layers whose media type is not in `accepted_media_types` are
    /// skipped; the ones that match are returned in manifest order. If the
    /// registry answers with an image index that the configured platform
    /// resolver cannot narrow down to a single entry, the index itself is
    /// returned in [`ImageData::manifest`] with empty config and layers so
    /// the caller can inspect the available platforms.
    pub async fn pull(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
        accepted_media_types: Vec<&str>,
    ) -> Result<ImageData> {
        debug!("Pulling image: {:?}", image);
        self.store_auth_if_needed(image.registry(), auth).await;

        let (manifest, digest) = self._pull_manifest(image).await?;

        match manifest {
            OciManifest::Image(image_manifest) => {
                self.pull_image_data(image, image_manifest, digest, &accepted_media_types)
                    .await
            }
            OciManifest::ImageIndex(index) => {
                let selected = self
                    .config
                    .platform_resolver
                    .as_ref()
                    .and_then(|resolve| resolve(&index.manifests));
                match selected {
                    Some(child_digest) => {
                        debug!(%child_digest, "Resolved index to a platform manifest");
                        let child = Reference::with_digest(
                            image.registry().to_string(),
                            image.repository().to_string(),
                            child_digest.clone(),
                        );
                        match self._pull_manifest(&child).await? {
                            (OciManifest::Image(m), _) => {
                                self.pull_image_data(image, m, child_digest, &accepted_media_types)
                                    .await
                            }
                            _ => Err(OciDistributionError::ImageManifestNotFoundError(
                                "index entry resolved to another index".to_string(),
                            )),
                        }
                    }
                    None => {
                        debug!("No index entry selected, returning the index itself");
                        Ok(ImageData {
                            layers: Vec::new(),
                            digest: Some(digest),
                            config: Config::oci_v1(Vec::new(), None),
                            manifest: Some(OciManifest::ImageIndex(index)),
                        })
                    }
                }
            }
        }
    }

    /// Fetch the config blob and the accepted layers of a resolved image
    /// manifest. Layer downloads run concurrently, bounded by
    /// `max_concurrent_download`, and are reassembled in manifest order.
    async fn pull_image_data(
        &self,
        image: &Reference,
        manifest: OciImageManifest,
        digest: String,
        accepted_media_types: &[&str],
    ) -> Result<ImageData> {
        debug!("Pulling config layer");
        let mut config_data: Vec<u8> = Vec::new();
        self.pull_blob(image, &manifest.config, &mut config_data)
            .await?;
        let config = Config::new(
            config_data,
            manifest.config.media_type.clone(),
            manifest.config.annotations.clone(),
        );

        let to_pull = manifest
            .layers
            .iter()
            .filter(|layer| accepted_media_types.contains(&layer.media_type.as_str()));

        let layers = stream::iter(to_pull)
            .map(|layer| {
                // This avoids moving `self` which is &Self
                // into the async block. We only want to capture
                // as &Self
                let this = &self;
                async move {
                    let mut out: Vec<u8> = Vec::new();
                    debug!("Pulling image layer");
                    this.pull_blob(image, layer, &mut out).await?;
                    Ok::<_, OciDistributionError>(ImageLayer::new(
                        out,
                        layer.media_type.clone(),
                        layer.annotations.clone(),
                    ))
                }
            })
            .boxed() // Workaround to rustc issue https://github.com/rust-lang/rust/issues/104382
            .buffered(self.config.max_concurrent_download)
            .try_collect()
            .await?;

        Ok(ImageData {
            layers,
            digest: Some(digest),
            config,
            manifest: Some(OciManifest::Image(manifest)),
        })
    }

    /// Push an image and return the uploaded URLs of the config and manifest
    ///
    /// The client will check if it's already been authenticated and if
    /// not will attempt to do so.
    ///
    /// If a manifest is not provided, the client will generate one from the
    /// provided layers and config data. A provided manifest must reference
    /// exactly the blobs being pushed; anything else is rejected before a
    /// single byte is transferred.
    ///
    /// All layer and config blobs are acknowledged by the registry before
    /// the manifest referencing them is pushed.
    pub async fn push(
        &self,
        image_ref: &Reference,
        layers: &[ImageLayer],
        config: Config,
        auth: &RegistryAuth,
        manifest: Option<OciImageManifest>,
    ) -> Result<PushResponse> {
        debug!("Pushing image: {:?}", image_ref);
        self.store_auth_if_needed(image_ref.registry(), auth).await;

        let manifest = match manifest {
            Some(m) => {
                validate_manifest_descriptors(&m, layers, &config)?;
                m
            }
            None => OciImageManifest::build(layers, &config, None),
        };

        // Upload layers
        stream::iter(layers)
            .map(|layer| {
                // This avoids moving `self` which is &Self
                // into the async block. We only want to capture
                // as &Self
                let this = &self;
                async move {
                    let digest = layer.sha256_digest();
                    this.push_blob(image_ref, &layer.data, &digest).await?;
                    Result::Ok(())
                }
            })
            .boxed() // Workaround to rustc issue https://github.com/rust-lang/rust/issues/104382
            .buffer_unordered(self.config.max_concurrent_upload)
            .try_for_each(future::ok)
            .await?;

        let config_url = self
            .push_blob(image_ref, &config.data, &manifest.config.digest)
            .await?;
        let manifest_url = self.push_manifest(image_ref, &manifest.into()).await?;

        Ok(PushResponse {
            config_url,
            manifest_url,
        })
    }

    /// Pushes a blob to the registry, idempotently.
    ///
    /// A blob the registry already has is never transferred again; the
    /// existence check short-circuits and the canonical blob URL is
    /// returned either way.
    pub async fn push_blob(
        &self,
        image_ref: &Reference,
        data: &[u8],
        digest: &str,
    ) -> Result<String> {
        if self
            ._blob_exists(image_ref, digest, RegistryOperation::Push)
            .await?
        {
            debug!(%digest, "Blob already present, skipping upload");
            return Ok(self.to_v2_blob_url(image_ref.registry(), image_ref.repository(), digest));
        }

        if self.config.use_monolithic_push {
            return self.push_blob_monolithically(image_ref, data, digest).await;
        }

        match self.push_blob_chunked(image_ref, data, digest).await {
            Ok(url) => Ok(url),
            Err(OciDistributionError::SpecViolationError(violation)) => {
                warn!(?violation, "Registry is not respecting the OCI Distribution Specification when doing chunked push operations");
                warn!("Attempting monolithic push");
                self.push_blob_monolithically(image_ref, data, digest).await
            }
            Err(e) => Err(e),
        }
    }

    /// Pushes a blob to the registry as a monolith
    ///
    /// Returns the pullable location of the blob
    async fn push_blob_monolithically(
        &self,
        image: &Reference,
        blob_data: &[u8],
        blob_digest: &str,
    ) -> Result<String> {
        let location = self.begin_push_session(image).await?;
        self.push_monolithically(&location, image, blob_data, blob_digest)
            .await
    }

    /// Pushes a blob to the registry as a series of chunks
    ///
    /// Returns the pullable location of the blob
    async fn push_blob_chunked(
        &self,
        image: &Reference,
        blob_data: &[u8],
        blob_digest: &str,
    ) -> Result<String> {
        if blob_data.is_empty() {
            return Err(OciDistributionError::PushNoDataError);
        }
        let location = self.begin_push_session(image).await?;
        let mut session = UploadSession::new(location);
        loop {
            let (next_location, next_offset, reported) = self
                .push_chunk(session.location(), image, blob_data, session.offset())
                .await?;
            session.advance(next_location, next_offset, reported)?;
            if next_offset >= blob_data.len() {
                break;
            }
        }
        let url = self
            .end_push_chunked_session(session.location(), image, blob_digest)
            .await?;
        session.commit();
        Ok(url)
    }

    /// Check if a blob is present on the registry.
    ///
    /// A HEAD request is issued for the blob: 200 means present, 404 means
    /// absent, any other response is an error.
    pub async fn blob_exists(&self, image: &Reference, digest: &str) -> Result<bool> {
        self._blob_exists(image, digest, RegistryOperation::Pull)
            .await
    }

    async fn _blob_exists(
        &self,
        image: &Reference,
        digest: &str,
        op: RegistryOperation,
    ) -> Result<bool> {
        let url = self.to_v2_blob_url(image.registry(), image.repository(), digest);
        debug!("HEAD blob at {}", url);
        let res = RequestBuilderWrapper::from_client(self, |client| client.head(&url))
            .send(image, op)
            .await?;
        match res.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Err(OciDistributionError::SpecViolationError(format!(
                "Expected HTTP Status {}, got {} instead",
                StatusCode::OK,
                s,
            ))),
            s => Err(OciDistributionError::ServerError {
                code: s.as_u16(),
                url,
                message: res.text().await?,
            }),
        }
    }

    /// Pull a single blob from an OCI registry.
    ///
    /// This pulls the blob for a particular image that is identified by
    /// the given layer descriptor. The image reference is used to find the
    /// repository and the registry, but it is not used to verify that
    /// the digest is a layer inside of the image. (The manifest is
    /// used for that.)
    ///
    /// The body is streamed through a digest verifier and only verified
    /// bytes reach `out`: on a digest or size mismatch the partial buffer
    /// is discarded and the caller decides whether to re-fetch.
    pub async fn pull_blob<T: AsyncWrite + Unpin>(
        &self,
        image: &Reference,
        layer: &OciDescriptor,
        mut out: T,
    ) -> Result<()> {
        let url = self.to_v2_blob_url(image.registry(), image.repository(), &layer.digest);

        let mut response = RequestBuilderWrapper::from_client(self, |client| client.get(&url))
            .send(image, RegistryOperation::Pull)
            .await?;

        if let Some(urls) = &layer.urls {
            for url in urls {
                if response.error_for_status_ref().is_ok() {
                    break;
                }

                let url = Url::parse(url)
                    .map_err(|e| OciDistributionError::UrlParseError(e.to_string()))?;

                if url.scheme() == "http" || url.scheme() == "https" {
                    // NOTE: we must not authenticate on additional URLs as those
                    // can be abused to leak credentials or tokens.  Please
                    // refer to CVE-2020-15157 for more information.
                    response = self.client.get(url.clone()).send().await?;
                }
            }
        }

        if response.status() == StatusCode::NOT_FOUND {
            return Err(OciDistributionError::NotFound { url });
        }
        let response = response.error_for_status()?;

        let mut verifier = DigestVerifier::new(&layer.digest)?;
        let mut buffer: Vec<u8> = Vec::with_capacity(layer.size.max(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(bytes) = stream.next().await {
            let bytes = bytes?;
            verifier.update(&bytes);
            buffer.extend_from_slice(&bytes);
        }

        if layer.size > 0 && buffer.len() != layer.size as usize {
            return Err(OciDistributionError::SizeMismatch {
                expected: layer.size,
                actual: buffer.len(),
            });
        }
        verifier.verify()?;

        out.write_all(&buffer).await?;
        Ok(())
    }

    /// Mounts a blob to the provided reference, from the given source
    pub async fn mount_blob(
        &self,
        image: &Reference,
        source: &Reference,
        digest: &str,
    ) -> Result<()> {
        let base_url = self.to_v2_blob_upload_url(image);
        let url =
            Url::parse_with_params(&base_url, &[("mount", digest), ("from", source.repository())])
                .map_err(|e| OciDistributionError::UrlParseError(e.to_string()))?;

        let res = RequestBuilderWrapper::from_client(self, |client| client.post(url.clone()))
            .send(image, RegistryOperation::Push)
            .await?;

        self.extract_location_header(image, res, &StatusCode::CREATED)
            .await?;

        Ok(())
    }

    /// Pull a manifest from the remote OCI Distribution service.
    ///
    /// The client will check if it's already been authenticated and if
    /// not will attempt to do so.
    ///
    /// A Tuple is returned containing the [OciManifest](crate::manifest::OciManifest)
    /// and the manifest content digest hash. The digest header returned by
    /// the registry, if any, is cross-checked against the digest computed
    /// locally over the body.
    pub async fn pull_manifest(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
    ) -> Result<(OciManifest, String)> {
        self.store_auth_if_needed(image.registry(), auth).await;

        self._pull_manifest(image).await
    }

    /// Pull a manifest from the remote OCI Distribution service without parsing it.
    ///
    /// The client will check if it's already been authenticated and if
    /// not will attempt to do so.
    ///
    /// A Tuple is returned containing the raw byte representation of the
    /// manifest and the manifest content digest.
    pub async fn pull_manifest_raw(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
        accepted_media_types: &[&str],
    ) -> Result<(Vec<u8>, String)> {
        self.store_auth_if_needed(image.registry(), auth).await;

        self._pull_manifest_raw(image, accepted_media_types).await
    }

    /// Pull an image manifest from the remote OCI Distribution service.
    ///
    /// The client will check if it's already been authenticated and if
    /// not will attempt to do so.
    ///
    /// If a multi-platform image index is encountered, a platform-specific
    /// image manifest is selected using the client's platform resolver.
    pub async fn pull_image_manifest(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
    ) -> Result<(OciImageManifest, String)> {
        self.store_auth_if_needed(image.registry(), auth).await;

        self._pull_image_manifest(image).await
    }

    /// Pull a manifest and its config from the remote OCI Distribution service.
    ///
    /// The client will check if it's already been authenticated and if
    /// not will attempt to do so.
    ///
    /// A Tuple is returned containing the [OciImageManifest](crate::manifest::OciImageManifest),
    /// the manifest content digest hash and the contents of the manifest's
    /// config layer as a String.
    pub async fn pull_manifest_and_config(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
    ) -> Result<(OciImageManifest, String, String)> {
        self.store_auth_if_needed(image.registry(), auth).await;

        let (manifest, digest) = self._pull_image_manifest(image).await?;

        let mut out: Vec<u8> = Vec::new();
        debug!("Pulling config layer");
        self.pull_blob(image, &manifest.config, &mut out).await?;
        let config = String::from_utf8(out).map_err(|e| {
            OciDistributionError::ManifestParsingError(format!("config is not UTF-8: {}", e))
        })?;

        Ok((manifest, digest, config))
    }

    async fn _pull_image_manifest(&self, image: &Reference) -> Result<(OciImageManifest, String)> {
        let (manifest, digest) = self._pull_manifest(image).await?;
        match manifest {
            OciManifest::Image(image_manifest) => Ok((image_manifest, digest)),
            OciManifest::ImageIndex(image_index_manifest) => {
                debug!("Inspecting image index manifest");
                let digest = match &self.config.platform_resolver {
                    Some(resolver) => resolver(&image_index_manifest.manifests),
                    None => {
                        return Err(
                            OciDistributionError::ImageIndexParsingNoPlatformResolverError,
                        )
                    }
                };

                match digest {
                    Some(digest) => {
                        debug!("Selected manifest entry with digest: {}", digest);
                        let manifest_entry_reference = Reference::with_digest(
                            image.registry().to_string(),
                            image.repository().to_string(),
                            digest.clone(),
                        );
                        self._pull_manifest(&manifest_entry_reference)
                            .await
                            .and_then(|(manifest, _digest)| match manifest {
                                OciManifest::Image(manifest) => Ok((manifest, digest)),
                                OciManifest::ImageIndex(_) => {
                                    Err(OciDistributionError::ImageManifestNotFoundError(
                                        "received image index manifest instead".to_string(),
                                    ))
                                }
                            })
                    }
                    None => Err(OciDistributionError::ImageManifestNotFoundError(
                        "no entry found in image index manifest matching the client's platform"
                            .to_string(),
                    )),
                }
            }
        }
    }

    /// Pull a manifest from the remote OCI Distribution service without
    /// parsing it.
    ///
    /// If the connection has already gone through authentication, this will
    /// use the cached bearer token. Otherwise, this will attempt an
    /// anonymous pull.
    async fn _pull_manifest_raw(
        &self,
        image: &Reference,
        accepted_media_types: &[&str],
    ) -> Result<(Vec<u8>, String)> {
        let url = self.to_v2_manifest_url(image);
        debug!("Pulling image manifest from {}", url);

        let res = RequestBuilderWrapper::from_client(self, |client| client.get(&url))
            .apply_accept(accepted_media_types)?
            .send(image, RegistryOperation::Pull)
            .await?;
        let headers = res.headers().clone();
        let status = res.status();
        let body = res.bytes().await?;

        validate_registry_response(status, &body, &url)?;

        let digest = verified_digest_value(&headers, &body)?;

        // A digest-pinned reference is a promise about the content.
        if let Some(expected) = image.digest() {
            match digest::digest_like(expected, &body) {
                Ok(computed) if computed != expected => {
                    return Err(OciDistributionError::DigestMismatch {
                        expected: expected.to_string(),
                        computed,
                    })
                }
                Ok(_) => {}
                Err(_) => warn!(
                    %expected,
                    "Cannot verify manifest against pinned digest: unsupported algorithm"
                ),
            }
        }

        Ok((body.to_vec(), digest))
    }

    async fn _pull_manifest(&self, image: &Reference) -> Result<(OciManifest, String)> {
        let (body, digest) = self
            ._pull_manifest_raw(image, MIME_TYPES_DISTRIBUTION_MANIFEST)
            .await?;

        let text = std::str::from_utf8(&body)?;

        self.validate_image_manifest(text).await?;

        debug!("Parsing response as OciManifest: {}", text);
        let manifest = serde_json::from_str(text)
            .map_err(|e| OciDistributionError::ManifestParsingError(e.to_string()))?;
        Ok((manifest, digest))
    }

    async fn validate_image_manifest(&self, text: &str) -> Result<()> {
        trace!("validating manifest: {}", text);
        let versioned: Versioned = serde_json::from_str(text)
            .map_err(|e| OciDistributionError::ManifestParsingError(e.to_string()))?;
        if versioned.schema_version != 2 {
            return Err(OciDistributionError::UnsupportedSchemaVersion(
                versioned.schema_version,
            ));
        }
        if let Some(media_type) = versioned.media_type {
            if !MIME_TYPES_DISTRIBUTION_MANIFEST.contains(&media_type.as_str()) {
                return Err(OciDistributionError::UnsupportedMediaType(media_type));
            }
        }

        Ok(())
    }

    /// Fetch a manifest's digest from the remote OCI Distribution service.
    ///
    /// The client will check if it's already been authenticated and if
    /// not will attempt to do so.
    ///
    /// Will first attempt to read the `Docker-Content-Digest` header using a
    /// HEAD request. If this header is not present, will make a second GET
    /// request and return the digest of the response body.
    pub async fn fetch_manifest_digest(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
    ) -> Result<String> {
        self.store_auth_if_needed(image.registry(), auth).await;

        let url = self.to_v2_manifest_url(image);
        debug!("HEAD image manifest from {}", url);
        let res = RequestBuilderWrapper::from_client(self, |client| client.head(&url))
            .apply_accept(MIME_TYPES_DISTRIBUTION_MANIFEST)?
            .send(image, RegistryOperation::Pull)
            .await?;

        trace!(headers=?res.headers(), "Got headers");
        if res.status() == StatusCode::NOT_FOUND {
            return Err(OciDistributionError::NotFound { url });
        }
        if res.status().is_success() {
            if let Some(digest_header) = res.headers().get("Docker-Content-Digest") {
                let digest = digest_header
                    .to_str()
                    .map_err(|e| OciDistributionError::SpecViolationError(e.to_string()))?;
                return Ok(digest.to_string());
            }
        }

        // Either the registry does not support HEAD on manifests or it
        // omits the digest header; hash the manifest body instead.
        debug!("GET image manifest from {}", url);
        let (_, digest) = self
            ._pull_manifest_raw(image, MIME_TYPES_DISTRIBUTION_MANIFEST)
            .await?;
        Ok(digest)
    }

    /// Push a manifest list to an OCI registry.
    ///
    /// The referenced child manifests must already exist on the registry;
    /// they are not pushed implicitly.
    pub async fn push_manifest_list(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
        manifest: OciImageIndex,
    ) -> Result<String> {
        self.store_auth_if_needed(reference.registry(), auth).await;
        self.push_manifest(reference, &OciManifest::ImageIndex(manifest))
            .await
    }

    /// Pushes the manifest for a specified image
    ///
    /// The manifest is serialized canonically and the registry is required
    /// to answer `201 Created`. A digest echoed back by the registry must
    /// agree with the digest computed locally.
    ///
    /// Returns the pullable manifest URL.
    pub async fn push_manifest(&self, image: &Reference, manifest: &OciManifest) -> Result<String> {
        // Serialize the manifest with a canonical json formatter, as described at
        // https://github.com/opencontainers/image-spec/blob/main/considerations.md#json
        let mut body = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut body, CanonicalFormatter::new());
        manifest.serialize(&mut ser)?;

        self.push_manifest_raw(image, body, manifest.content_type())
            .await
    }

    async fn push_manifest_raw(
        &self,
        image: &Reference,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let url = self.to_v2_manifest_url(image);
        debug!(?url, ?content_type, "push manifest");

        // Calculate the digest of the manifest; some registries omit the
        // Location header and the digest is the only way to address the
        // uploaded content.
        let manifest_hash = sha256_digest(&body);

        let res = RequestBuilderWrapper::from_client(self, |client| {
            client
                .put(&url)
                .header("Content-Type", content_type)
                .body(body.clone())
        })
        .send(image, RegistryOperation::Push)
        .await?;

        if let Some(echoed) = res.headers().get("Docker-Content-Digest") {
            let echoed = echoed
                .to_str()
                .map_err(|e| OciDistributionError::SpecViolationError(e.to_string()))?
                .to_string();
            match digest::digest_like(&echoed, &body) {
                Ok(local) if local != echoed => {
                    return Err(OciDistributionError::DigestMismatch {
                        expected: local,
                        computed: echoed,
                    })
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(%echoed, "Registry echoed a digest with an unsupported algorithm")
                }
            }
        }

        let ret = self
            .extract_location_header(image, res, &StatusCode::CREATED)
            .await;

        if matches!(ret, Err(OciDistributionError::RegistryNoLocationError)) {
            // The registry is violating the OCI Distribution Spec, BUT the
            // manifest has been uploaded successfully. Its address is fully
            // determined by the digest we already computed, so answer with
            // that. AWS ECR is a known offender.
            warn!("Registry did not return a Location for the uploaded manifest, deriving it from the digest");
            return Ok(format!(
                "{}://{}/v2/{}/manifests/{}",
                self.config.protocol.scheme_for(image.registry()),
                image.registry(),
                image.repository(),
                manifest_hash,
            ));
        }

        ret
    }

    /// Pull the referrers of a manifest, per the OCI 1.1 referrers API.
    ///
    /// The reference must be digest-pinned: referrers are linked to a
    /// subject digest, not a tag. When the registry does not support the
    /// referrers endpoint the deterministic referrers *tag schema* is used
    /// as a fallback. An empty index means "no referrers" and is not an
    /// error. Results can be narrowed with `artifact_type`.
    pub async fn pull_referrers(
        &self,
        image: &Reference,
        artifact_type: Option<&str>,
    ) -> Result<OciImageIndex> {
        let digest = image
            .digest()
            .ok_or_else(|| OciDistributionError::MissingDigest(image.whole()))?;

        let url = self.to_v2_referrers_url(image, digest);
        debug!("Pulling referrers from {}", url);

        let request = self.client.get(&url);
        let request = if let Some(artifact_type) = artifact_type {
            request.query(&[("artifactType", artifact_type)])
        } else {
            request
        };

        let res = RequestBuilderWrapper {
            client: self,
            request_builder: request,
        }
        .send(image, RegistryOperation::Pull)
        .await?;
        let status = res.status();

        let mut index = match status {
            StatusCode::OK => {
                let body = res.bytes().await?;
                serde_json::from_slice::<OciImageIndex>(&body)
                    .map_err(|e| OciDistributionError::ManifestParsingError(e.to_string()))?
            }
            StatusCode::NOT_FOUND => {
                debug!("Registry lacks the referrers API, falling back to the tag schema");
                self.pull_referrers_tag_schema(image, digest).await?
            }
            s => {
                let body = res.bytes().await?;
                return Err(validate_registry_response(s, &body, &url)
                    .err()
                    .unwrap_or(OciDistributionError::SpecViolationError(format!(
                        "unexpected status {} on {}",
                        s, url
                    ))));
            }
        };

        // Filter locally in both paths; registries applying the filter
        // themselves are unaffected, registries ignoring the parameter and
        // the tag-schema fallback both need it.
        if let Some(artifact_type) = artifact_type {
            index
                .manifests
                .retain(|entry| entry.artifact_type.as_deref() == Some(artifact_type));
        }

        Ok(index)
    }

    async fn pull_referrers_tag_schema(
        &self,
        image: &Reference,
        subject_digest: &str,
    ) -> Result<OciImageIndex> {
        let tag = referrers_tag(subject_digest);
        let fallback = Reference::with_tag(
            image.registry().to_string(),
            image.repository().to_string(),
            tag,
        );
        match self
            ._pull_manifest_raw(&fallback, &[OCI_IMAGE_INDEX_MEDIA_TYPE])
            .await
        {
            Ok((body, _digest)) => serde_json::from_slice::<OciImageIndex>(&body)
                .map_err(|e| OciDistributionError::ManifestParsingError(e.to_string())),
            // No fallback tag means no referrers.
            Err(OciDistributionError::NotFound { .. }) => Ok(empty_referrers_index()),
            Err(e) => Err(e),
        }
    }

    /// Begins a session to push a blob to the registry.
    ///
    /// Returns the URL of the upload session, which carries the session ID.
    async fn begin_push_session(&self, image: &Reference) -> Result<String> {
        let url = &self.to_v2_blob_upload_url(image);
        debug!(?url, "begin push session");
        let res = RequestBuilderWrapper::from_client(self, |client| {
            client.post(url).header("Content-Length", 0)
        })
        .send(image, RegistryOperation::Push)
        .await?;

        // OCI spec requires the status code be 202 Accepted to successfully begin the push process
        self.extract_location_header(image, res, &StatusCode::ACCEPTED)
            .await
    }

    /// Closes the chunked push session, committing the blob under its digest.
    ///
    /// Returns the pullable URL for the blob.
    async fn end_push_chunked_session(
        &self,
        location: &str,
        image: &Reference,
        digest: &str,
    ) -> Result<String> {
        let url = Url::parse_with_params(location, &[("digest", digest)])
            .map_err(|e| OciDistributionError::UrlParseError(e.to_string()))?;
        let res = RequestBuilderWrapper::from_client(self, |client| {
            client.put(url.clone()).header("Content-Length", 0)
        })
        .send(image, RegistryOperation::Push)
        .await?;
        self.extract_location_header(image, res, &StatusCode::CREATED)
            .await
    }

    /// Pushes a single chunk of a blob to the registry,
    /// as part of a chunked blob upload.
    ///
    /// Returns the URL location for the next chunk, the local offset after
    /// this chunk, and the offset the server reported, if it reported one.
    async fn push_chunk(
        &self,
        location: &str,
        image: &Reference,
        blob_data: &[u8],
        start_byte: usize,
    ) -> Result<(String, usize, Option<usize>)> {
        if blob_data.is_empty() {
            return Err(OciDistributionError::PushNoDataError);
        }
        let end_byte = if (start_byte + self.push_chunk_size) < blob_data.len() {
            start_byte + self.push_chunk_size - 1
        } else {
            blob_data.len() - 1
        };
        let body = blob_data[start_byte..=end_byte].to_vec();

        debug!(
            ?start_byte,
            ?end_byte,
            blob_data_len = blob_data.len(),
            body_len = body.len(),
            ?location,
            "Pushing chunk"
        );

        let res = RequestBuilderWrapper::from_client(self, |client| {
            client
                .patch(location)
                .header("Content-Range", format!("{}-{}", start_byte, end_byte))
                .header("Content-Length", body.len())
                .header("Content-Type", "application/octet-stream")
                .body(body.clone())
        })
        .send(image, RegistryOperation::Push)
        .await?;

        let reported = parse_range_header(res.headers());
        let location = self
            .extract_location_header(image, res, &StatusCode::ACCEPTED)
            .await?;

        Ok((location, end_byte + 1, reported))
    }

    /// Pushes a whole blob to the registry in a single request.
    ///
    /// Returns the pullable URL for the blob.
    async fn push_monolithically(
        &self,
        location: &str,
        image: &Reference,
        blob_data: &[u8],
        blob_digest: &str,
    ) -> Result<String> {
        if blob_data.is_empty() {
            return Err(OciDistributionError::PushNoDataError);
        }
        let url = Url::parse_with_params(location, &[("digest", blob_digest)])
            .map_err(|e| OciDistributionError::UrlParseError(e.to_string()))?;
        debug!(size = blob_data.len(), location = %url, "Pushing monolithically");

        let body = blob_data.to_vec();
        let res = RequestBuilderWrapper::from_client(self, |client| {
            client
                .put(url.clone())
                .header("Content-Length", body.len())
                .header("Content-Type", "application/octet-stream")
                .body(body.clone())
        })
        .send(image, RegistryOperation::Push)
        .await?;

        self.extract_location_header(image, res, &StatusCode::CREATED)
            .await
    }

    async fn extract_location_header(
        &self,
        image: &Reference,
        res: reqwest::Response,
        expected_status: &StatusCode,
    ) -> Result<String> {
        debug!(expected_status_code=?expected_status.as_u16(),
            status_code=?res.status().as_u16(),
            "extract location header");
        if res.status().eq(expected_status) {
            let location_header = res.headers().get("Location");
            trace!(location=?location_header, "Location header");
            match location_header {
                None => Err(OciDistributionError::RegistryNoLocationError),
                Some(lh) => self.location_header_to_url(image, lh),
            }
        } else if res.status().is_success() && expected_status.is_success() {
            Err(OciDistributionError::SpecViolationError(format!(
                "Expected HTTP Status {}, got {} instead",
                expected_status,
                res.status(),
            )))
        } else if res.status() == StatusCode::NOT_FOUND {
            Err(OciDistributionError::NotFound {
                url: res.url().to_string(),
            })
        } else {
            let url = res.url().to_string();
            let code = res.status().as_u16();
            let message = res.text().await?;
            Err(OciDistributionError::ServerError { url, code, message })
        }
    }

    /// Helper function to convert location header to URL
    ///
    /// Location may be absolute (containing the protocol and/or hostname), or relative (containing just the URL path)
    /// Returns a properly formatted absolute URL
    fn location_header_to_url(
        &self,
        image: &Reference,
        location_header: &reqwest::header::HeaderValue,
    ) -> Result<String> {
        let lh = location_header
            .to_str()
            .map_err(|e| OciDistributionError::SpecViolationError(e.to_string()))?;
        if lh.starts_with("/") {
            Ok(format!(
                "{}://{}{}",
                self.config.protocol.scheme_for(image.registry()),
                image.registry(),
                lh
            ))
        } else {
            Ok(lh.to_string())
        }
    }

    /// Convert a Reference to a v2 manifest URL.
    fn to_v2_manifest_url(&self, reference: &Reference) -> String {
        if let Some(digest) = reference.digest() {
            format!(
                "{}://{}/v2/{}/manifests/{}",
                self.config.protocol.scheme_for(reference.registry()),
                reference.registry(),
                reference.repository(),
                digest,
            )
        } else {
            format!(
                "{}://{}/v2/{}/manifests/{}",
                self.config.protocol.scheme_for(reference.registry()),
                reference.registry(),
                reference.repository(),
                reference.tag().unwrap_or("latest")
            )
        }
    }

    /// Convert a Reference to a v2 blob (layer) URL.
    fn to_v2_blob_url(&self, registry: &str, repository: &str, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            self.config.protocol.scheme_for(registry),
            registry,
            repository,
            digest,
        )
    }

    /// Convert a Reference to a v2 blob upload URL.
    fn to_v2_blob_upload_url(&self, reference: &Reference) -> String {
        self.to_v2_blob_url(reference.registry(), reference.repository(), "uploads/")
    }

    fn to_list_tags_url(&self, reference: &Reference) -> String {
        format!(
            "{}://{}/v2/{}/tags/list",
            self.config.protocol.scheme_for(reference.registry()),
            reference.registry(),
            reference.repository(),
        )
    }

    fn to_v2_referrers_url(&self, reference: &Reference, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/referrers/{}",
            self.config.protocol.scheme_for(reference.registry()),
            reference.registry(),
            reference.repository(),
            digest,
        )
    }
}

/// The tag under which referrers of a subject digest are stored when the
/// registry does not implement the referrers API. Algorithm and hex parts
/// are truncated per the tag grammar limits.
fn referrers_tag(digest: &str) -> String {
    let (algorithm, hex) = digest.split_once(':').unwrap_or((digest, ""));
    let algorithm: String = algorithm.chars().take(32).collect();
    let hex: String = hex.chars().take(64).collect();
    format!("{}-{}", algorithm, hex)
}

fn empty_referrers_index() -> OciImageIndex {
    OciImageIndex {
        schema_version: 2,
        media_type: Some(OCI_IMAGE_INDEX_MEDIA_TYPE.to_string()),
        artifact_type: None,
        manifests: Vec::new(),
        annotations: None,
    }
}

/// Check that a caller-supplied manifest references exactly the blobs that
/// are about to be pushed, so the registry never sees a manifest pointing
/// at content we did not upload.
fn validate_manifest_descriptors(
    manifest: &OciImageManifest,
    layers: &[ImageLayer],
    config: &Config,
) -> Result<()> {
    let config_digest = config.sha256_digest();
    if manifest.config.digest != config_digest {
        return Err(OciDistributionError::ManifestDescriptorMismatch(format!(
            "config descriptor digest {} does not match pushed config {}",
            manifest.config.digest, config_digest
        )));
    }
    for layer in layers {
        let digest = layer.sha256_digest();
        if !manifest.layers.iter().any(|d| d.digest == digest) {
            return Err(OciDistributionError::ManifestDescriptorMismatch(format!(
                "manifest has no layer descriptor with digest {}",
                digest
            )));
        }
    }
    Ok(())
}

/// The OCI spec technically does not allow any codes but 200, 500, 401, and 404.
/// Obviously, HTTP servers are going to send other codes. This tries to catch the
/// obvious ones (200, 4XX, 5XX). Anything else is just treated as an error.
fn validate_registry_response(status: StatusCode, body: &[u8], url: &str) -> Result<()> {
    match status {
        StatusCode::OK => Ok(()),
        StatusCode::UNAUTHORIZED => Err(OciDistributionError::AuthenticationFailed(format!(
            "not authorized on {}",
            url
        ))),
        StatusCode::NOT_FOUND => Err(OciDistributionError::NotFound {
            url: url.to_string(),
        }),
        s if s.is_success() => Err(OciDistributionError::SpecViolationError(format!(
            "Expected HTTP Status {}, got {} instead",
            StatusCode::OK,
            status,
        ))),
        s if s.is_client_error() => {
            let text = std::str::from_utf8(body)?;
            // According to the OCI spec, we should see an error in the message body.
            match serde_json::from_str::<OciEnvelope>(text) {
                Ok(envelope) => Err(OciDistributionError::RegistryError {
                    envelope,
                    url: url.to_string(),
                }),
                Err(_) => Err(OciDistributionError::ServerError {
                    code: s.as_u16(),
                    url: url.to_string(),
                    message: text.to_string(),
                }),
            }
        }
        s => {
            let text = std::str::from_utf8(body)?;
            Err(OciDistributionError::ServerError {
                code: s.as_u16(),
                url: url.to_string(),
                message: text.to_string(),
            })
        }
    }
}

/// Extract `Docker-Content-Digest` from response headers and cross-check it
/// against the digest recomputed locally over `body`. A header that
/// disagrees with the body is a content-addressing violation; an absent
/// header makes the local digest authoritative.
fn verified_digest_value(headers: &HeaderMap, body: &[u8]) -> Result<String> {
    let digest_header = headers.get("Docker-Content-Digest");
    match digest_header {
        None => {
            let hex = sha256_digest(body);
            debug!(%hex, "Computed digest of manifest payload.");
            Ok(hex)
        }
        Some(hv) => {
            let declared = hv
                .to_str()
                .map_err(|e| OciDistributionError::SpecViolationError(e.to_string()))?
                .to_string();
            match digest::digest_like(&declared, body) {
                Ok(computed) => {
                    if computed != declared {
                        return Err(OciDistributionError::DigestMismatch {
                            expected: declared,
                            computed,
                        });
                    }
                    Ok(declared)
                }
                Err(_) => {
                    warn!(%declared, "Registry declared a digest with an unsupported algorithm, recomputing locally");
                    Ok(sha256_digest(body))
                }
            }
        }
    }
}

/// Parse the `Range` header a registry returns after a chunk upload,
/// yielding the next expected offset. Registries report the committed
/// range as `0-<end>`, inclusive.
fn parse_range_header(headers: &HeaderMap) -> Option<usize> {
    let raw = headers.get("Range")?.to_str().ok()?;
    let (_, end) = raw.split_once('-')?;
    match end.parse::<usize>() {
        Ok(end) => Some(end + 1),
        Err(_) => {
            warn!(%raw, "Cannot parse Range header returned by registry");
            None
        }
    }
}

/// The lifecycle of one chunked blob upload.
///
/// The registry acknowledges every chunk with the byte range it has
/// committed so far. The session tracks its own offset and refuses to
/// continue the moment the server's view diverges: the session flips to
/// `Invalid` and the upload has to be restarted from scratch, which is
/// strictly safer than trying to resume.
#[derive(Debug, PartialEq, Eq)]
enum UploadSessionState {
    Started,
    Uploading { offset: usize },
    Committed,
    Invalid,
}

struct UploadSession {
    location: String,
    state: UploadSessionState,
}

impl UploadSession {
    fn new(location: String) -> Self {
        Self {
            location,
            state: UploadSessionState::Started,
        }
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn offset(&self) -> usize {
        match self.state {
            UploadSessionState::Uploading { offset } => offset,
            _ => 0,
        }
    }

    /// Record a chunk acknowledgment. `reported` is the offset the server
    /// claims to have committed, when it sent one.
    fn advance(
        &mut self,
        location: String,
        local_offset: usize,
        reported: Option<usize>,
    ) -> Result<()> {
        if let Some(reported) = reported {
            if reported != local_offset {
                self.state = UploadSessionState::Invalid;
                return Err(OciDistributionError::UploadSessionInvalid(format!(
                    "registry reports {} committed bytes, client sent {}",
                    reported, local_offset
                )));
            }
        }
        self.location = location;
        self.state = UploadSessionState::Uploading {
            offset: local_offset,
        };
        Ok(())
    }

    fn commit(&mut self) {
        self.state = UploadSessionState::Committed;
    }
}

/// The request builder wrapper allows to be instantiated from a
/// `Client` and allows composable operations on the request builder,
/// to produce a `RequestBuilder` object that can be executed.
struct RequestBuilderWrapper<'a> {
    client: &'a Client,
    request_builder: RequestBuilder,
}

// RequestBuilderWrapper type management
impl<'a> RequestBuilderWrapper<'a> {
    /// Create a `RequestBuilderWrapper` from a `Client` instance, by
    /// instantiating the internal `RequestBuilder` with the provided
    /// function `f`.
    fn from_client(
        client: &'a Client,
        f: impl Fn(&reqwest::Client) -> RequestBuilder,
    ) -> RequestBuilderWrapper<'a> {
        let request_builder = f(&client.client);
        RequestBuilderWrapper {
            client,
            request_builder,
        }
    }

    // Produces a final `RequestBuilder` out of this `RequestBuilderWrapper`
    fn into_request_builder(self) -> RequestBuilder {
        self.request_builder
    }
}

// Composable functions applicable to a `RequestBuilderWrapper`
impl<'a> RequestBuilderWrapper<'a> {
    fn try_clone_builder(&self) -> Result<RequestBuilder> {
        self.request_builder.try_clone().ok_or_else(|| {
            OciDistributionError::RequestBuilderError("could not clone request builder".to_string())
        })
    }

    fn apply_accept(&self, accept: &[&str]) -> Result<RequestBuilderWrapper<'a>> {
        let request_builder = self
            .try_clone_builder()?
            .header("Accept", Vec::from(accept).join(", "));

        Ok(RequestBuilderWrapper {
            client: self.client,
            request_builder,
        })
    }

    /// Updates request as necessary for authentication.
    ///
    /// If a cached token exists for this (registry, repository, operation)
    /// it is applied. Otherwise the credential stored for the registry is
    /// applied directly: Basic and caller-supplied Bearer credentials ride
    /// on every request without a challenge round trip, Anonymous adds
    /// nothing.
    async fn apply_auth(
        &self,
        image: &Reference,
        op: RegistryOperation,
    ) -> Result<RequestBuilderWrapper<'a>> {
        let mut headers = HeaderMap::new();

        if let Some(token) = self.client.tokens.get(image, op).await {
            match token {
                RegistryTokenType::Bearer(token) => {
                    debug!("Using bearer token authentication.");
                    headers.insert("Authorization", token.bearer_token().parse().unwrap());
                }
                RegistryTokenType::Basic(username, password) => {
                    debug!("Using HTTP basic authentication.");
                    return Ok(RequestBuilderWrapper {
                        client: self.client,
                        request_builder: self
                            .try_clone_builder()?
                            .headers(headers)
                            .basic_auth(username.to_string(), Some(password.to_string())),
                    });
                }
            }
        } else {
            match self.client.stored_auth(image.registry()).await {
                RegistryAuth::Basic(username, password) => {
                    debug!("Using HTTP basic authentication.");
                    return Ok(RequestBuilderWrapper {
                        client: self.client,
                        request_builder: self
                            .try_clone_builder()?
                            .headers(headers)
                            .basic_auth(username, Some(password)),
                    });
                }
                RegistryAuth::Bearer(token) => {
                    debug!("Using caller-supplied bearer token authentication.");
                    headers.insert(
                        "Authorization",
                        format!("Bearer {}", token).parse().unwrap(),
                    );
                }
                RegistryAuth::Anonymous => {}
            }
        }
        Ok(RequestBuilderWrapper {
            client: self.client,
            request_builder: self.try_clone_builder()?.headers(headers),
        })
    }

    /// Send the request, answering at most one authentication challenge.
    ///
    /// The first `401` triggers the token exchange described by the
    /// response's `WWW-Authenticate` header, after which the request is
    /// retried once with the fresh token. A second `401` surfaces as
    /// `AuthenticationFailed`. This is deliberately an explicit two-step
    /// call rather than middleware, so the retry bound stays auditable.
    async fn send(
        self,
        image: &Reference,
        op: RegistryOperation,
    ) -> Result<reqwest::Response> {
        let retry_builder = self.try_clone_builder()?;
        let client = self.client;

        let res = self
            .apply_auth(image, op)
            .await?
            .into_request_builder()
            .send()
            .await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        debug!(url = %res.url(), "Received 401, answering the challenge");
        client.exchange_token(image, op, res.headers()).await?;

        let res = RequestBuilderWrapper {
            client,
            request_builder: retry_builder,
        }
        .apply_auth(image, op)
        .await?
        .into_request_builder()
        .send()
        .await?;

        if res.status() == StatusCode::UNAUTHORIZED {
            let url = res.url().to_string();
            let reason = res.text().await.unwrap_or_default();
            return Err(OciDistributionError::AuthenticationFailed(format!(
                "registry rejected credentials for {}: {}",
                url, reason
            )));
        }
        Ok(res)
    }
}

#[derive(Deserialize, Default)]
struct TokenExpiry {
    expires_in: Option<u64>,
}

/// The encoding of the certificate
#[derive(Debug, Clone)]
pub enum CertificateEncoding {
    #[allow(missing_docs)]
    Der,
    #[allow(missing_docs)]
    Pem,
}

/// A x509 certificate
#[derive(Debug, Clone)]
pub struct Certificate {
    /// Which encoding is used by the certificate
    pub encoding: CertificateEncoding,

    /// Actual certificate
    pub data: Vec<u8>,
}

/// A client configuration
pub struct ClientConfig {
    /// Which protocol the client should use
    pub protocol: ClientProtocol,

    /// Accept invalid hostname. Defaults to false
    pub accept_invalid_hostnames: bool,

    /// Accept invalid certificates. Defaults to false
    pub accept_invalid_certificates: bool,

    /// A list of extra root certificate to trust. This can be used to connect
    /// to servers using self-signed certificates
    pub extra_root_certificates: Vec<Certificate>,

    /// A function that defines the client's behaviour if an image index
    /// (i.e. manifest list) is encountered when pulling an image.
    /// Defaults to [current_platform_resolver](self::current_platform_resolver),
    /// which attempts to choose an image matching the running OS and Arch.
    ///
    /// If set to None, an error is raised if an image index is received
    /// while pulling an image manifest; `pull` returns the index itself.
    pub platform_resolver: Option<Box<PlatformResolverFn>>,

    /// Uses a single post and put request instead of the chunked upload
    /// session when pushing blobs. Defaults to false
    pub use_monolithic_push: bool,

    /// Maximum number of concurrent uploads to perform during a `push`
    /// operation.
    ///
    /// This defaults to [`DEFAULT_MAX_CONCURRENT_UPLOAD`].
    pub max_concurrent_upload: usize,

    /// Maximum number of concurrent downloads to perform during a `pull`
    /// operation.
    ///
    /// This defaults to [`DEFAULT_MAX_CONCURRENT_DOWNLOAD`].
    pub max_concurrent_download: usize,

    /// Lifetime assumed for cached bearer tokens whose token endpoint did
    /// not declare one.
    ///
    /// This defaults to [`DEFAULT_TOKEN_EXPIRATION_SECS`].
    pub default_token_expiration_secs: u64,

    /// Bounds a stalled transfer on an already-open connection. Expiry
    /// surfaces as [`OciDistributionError::TransportTimeout`]. No timeout
    /// by default.
    pub read_timeout: Option<Duration>,

    /// Bounds the TCP/TLS handshake per request. Expiry surfaces as
    /// [`OciDistributionError::TransportTimeout`]. No timeout by default.
    pub connect_timeout: Option<Duration>,

    /// Proxy every HTTP request through this URL. No proxy by default.
    pub http_proxy: Option<String>,

    /// Proxy every HTTPS request through this URL. No proxy by default.
    pub https_proxy: Option<String>,

    /// Comma-separated list of hosts exempted from proxying.
    pub no_proxy: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: ClientProtocol::default(),
            accept_invalid_hostnames: false,
            accept_invalid_certificates: false,
            extra_root_certificates: Vec::new(),
            platform_resolver: Some(Box::new(current_platform_resolver)),
            use_monolithic_push: false,
            max_concurrent_upload: DEFAULT_MAX_CONCURRENT_UPLOAD,
            max_concurrent_download: DEFAULT_MAX_CONCURRENT_DOWNLOAD,
            default_token_expiration_secs: DEFAULT_TOKEN_EXPIRATION_SECS,
            read_timeout: None,
            connect_timeout: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
        }
    }
}

// Be explicit about the traits supported by this type. This is needed to use
// the Client behind a dynamic reference.
type PlatformResolverFn = dyn Fn(&[ImageIndexEntry]) -> Option<String> + Send + Sync;

/// A platform resolver that chooses the first linux/amd64 variant, if present
pub fn linux_amd64_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry.platform.as_ref().map_or(false, |platform| {
                platform.os == "linux" && platform.architecture == "amd64"
            })
        })
        .map(|entry| entry.digest.clone())
}

/// A platform resolver that chooses the first windows/amd64 variant, if present
pub fn windows_amd64_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry.platform.as_ref().map_or(false, |platform| {
                platform.os == "windows" && platform.architecture == "amd64"
            })
        })
        .map(|entry| entry.digest.clone())
}

const MACOS: &str = "macos";
const DARWIN: &str = "darwin";

fn go_os() -> &'static str {
    // Massage Rust OS var to GO OS:
    // - Rust: https://doc.rust-lang.org/std/env/consts/constant.OS.html
    // - Go: https://golang.org/doc/install/source#environment
    match std::env::consts::OS {
        MACOS => DARWIN,
        other => other,
    }
}

const X86_64: &str = "x86_64";
const AMD64: &str = "amd64";
const X86: &str = "x86";
const AMD: &str = "amd";
const ARM64: &str = "arm64";
const AARCH64: &str = "aarch64";
const POWERPC64: &str = "powerpc64";
const PPC64LE: &str = "ppc64le";

fn go_arch() -> &'static str {
    // Massage Rust Architecture vars to GO equivalent:
    // - Rust: https://doc.rust-lang.org/std/env/consts/constant.ARCH.html
    // - Go: https://golang.org/doc/install/source#environment
    match std::env::consts::ARCH {
        X86_64 => AMD64,
        X86 => AMD,
        AARCH64 => ARM64,
        POWERPC64 => PPC64LE,
        other => other,
    }
}

/// A platform resolver that chooses the first variant matching the running OS/Arch, if present.
/// Doesn't currently handle platform.variants.
pub fn current_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry.platform.as_ref().map_or(false, |platform| {
                platform.os == go_os() && platform.architecture == go_arch()
            })
        })
        .map(|entry| entry.digest.clone())
}

/// The protocol that the client should use to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientProtocol {
    #[allow(missing_docs)]
    Http,
    #[allow(missing_docs)]
    Https,
    #[allow(missing_docs)]
    HttpsExcept(Vec<String>),
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol::Https
    }
}

impl ClientProtocol {
    fn scheme_for(&self, registry: &str) -> &str {
        match self {
            ClientProtocol::Https => "https",
            ClientProtocol::Http => "http",
            ClientProtocol::HttpsExcept(exceptions) => {
                if exceptions.contains(&registry.to_owned()) {
                    "http"
                } else {
                    "https"
                }
            }
        }
    }
}

#[derive(Clone)]
struct BearerChallenge {
    pub realm: Option<String>,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl Challenge for BearerChallenge {
    fn challenge_name() -> &'static str {
        "Bearer"
    }

    fn from_raw(raw: RawChallenge) -> Option<Self> {
        match raw {
            RawChallenge::Token68(_) => None,
            RawChallenge::Fields(mut map) => Some(BearerChallenge {
                realm: map.remove("realm"),
                scope: map.remove("scope"),
                service: map.remove("service"),
            }),
        }
    }

    fn into_raw(self) -> RawChallenge {
        let mut map = ChallengeFields::new();
        if let Some(realm) = self.realm {
            map.insert_static_quoting("realm", realm);
        }
        if let Some(scope) = self.scope {
            map.insert_static_quoting("scope", scope);
        }
        if let Some(service) = self.service {
            map.insert_static_quoting("service", service);
        }
        RawChallenge::Fields(map)
    }
}
