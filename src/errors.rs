//! Errors related to interacting with an OCI compliant remote store

use thiserror::Error;

use crate::reference::ParseError;

/// Result type for all public registry operations.
pub type Result<T> = std::result::Result<T, OciDistributionError>;

/// The failures a registry operation can surface.
///
/// Digest mismatches and malformed references are never retried
/// internally; the one automatic retry the client performs is the
/// auth-challenge round trip, after which `AuthenticationFailed` is
/// terminal. Transport errors are left to the caller's retry policy.
#[derive(Error, Debug)]
pub enum OciDistributionError {
    /// The supplied image reference could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(#[from] ParseError),
    /// The registry challenge round trip was exhausted without credentials
    /// being accepted.
    #[error("failed to authenticate to the registry: {0}")]
    AuthenticationFailed(String),
    /// Retrieved or uploaded content did not hash to the digest it is
    /// addressed by. Fatal for that blob or manifest.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch {
        /// The digest the content was requested or declared by.
        expected: String,
        /// The digest actually computed over the content.
        computed: String,
    },
    /// A blob's byte length disagreed with its descriptor.
    #[error("size mismatch: descriptor says {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The size recorded in the descriptor.
        expected: i64,
        /// The number of bytes actually retrieved.
        actual: usize,
    },
    /// The registry does not know the requested manifest, blob or tag.
    #[error("not found: {url}")]
    NotFound {
        /// The URL that returned 404.
        url: String,
    },
    /// A chunked upload session diverged from the locally tracked offset
    /// or expired. The upload must be restarted, never resumed.
    #[error("upload session is no longer valid: {0}")]
    UploadSessionInvalid(String),
    /// A connect or read timeout expired. Eligible for caller-driven retry.
    #[error("network timeout: {0}")]
    TransportTimeout(String),
    /// The network layer failed. Eligible for caller-driven retry.
    #[error("network error: {0}")]
    TransportError(String),
    /// Content negotiation produced a media type this client does not
    /// understand.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    /// The manifest declares a schema version other than 2.
    #[error("unsupported schema version: {0}")]
    UnsupportedSchemaVersion(i32),
    /// The manifest body could not be parsed into the negotiated shape.
    #[error("failed to parse manifest: {0}")]
    ManifestParsingError(String),
    /// A caller-supplied manifest references blobs other than the ones
    /// that were pushed.
    #[error("manifest descriptor mismatch: {0}")]
    ManifestDescriptorMismatch(String),
    /// The registry answered with a structured OCI error envelope.
    #[error("registry error on {url}: {envelope}")]
    RegistryError {
        /// The parsed error envelope.
        envelope: OciEnvelope,
        /// The URL the error was returned for.
        url: String,
    },
    /// The registry answered with an unexpected status and no parseable
    /// envelope.
    #[error("server error {code} on {url}: {message}")]
    ServerError {
        /// The HTTP status code.
        code: u16,
        /// The URL the error was returned for.
        url: String,
        /// The response body, verbatim.
        message: String,
    },
    /// The registry deviated from the OCI Distribution Specification.
    #[error("registry is violating the OCI spec: {0}")]
    SpecViolationError(String),
    /// The registry did not return a Location header where one is required.
    #[error("registry did not return a location header")]
    RegistryNoLocationError,
    /// The registry returned neither a digest header nor a body to hash.
    #[error("registry did not return a digest header")]
    RegistryNoDigestError,
    /// The token endpoint's response could not be decoded.
    #[error("failed to decode registry token: {0}")]
    RegistryTokenDecodeError(String),
    /// An image index was received but no platform resolver is configured.
    #[error("received an image index and no platform resolver is configured on the client")]
    ImageIndexParsingNoPlatformResolverError,
    /// Resolving an image index did not lead to an image manifest.
    #[error("image manifest not found: {0}")]
    ImageManifestNotFoundError(String),
    /// The digest names a hash algorithm this client cannot compute.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),
    /// The operation needs a digest-pinned reference.
    #[error("image reference must include a digest: {0}")]
    MissingDigest(String),
    /// An empty blob was handed to a push operation.
    #[error("cannot push a blob without data")]
    PushNoDataError,
    /// A URL could not be constructed or parsed.
    #[error("failed to parse URL: {0}")]
    UrlParseError(String),
    /// A request could not be cloned or built for sending.
    #[error("failed to build request: {0}")]
    RequestBuilderError(String),
    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// A response body was not valid UTF-8 where text was required.
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
    /// Writing retrieved content to the caller's sink failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for OciDistributionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OciDistributionError::TransportTimeout(err.to_string())
        } else {
            OciDistributionError::TransportError(err.to_string())
        }
    }
}

/// The OCI specification defines a specific error format.
///
/// This struct represents that error format, which is formally described here:
/// <https://github.com/opencontainers/distribution-spec/blob/main/spec.md#error-codes>
#[derive(serde::Deserialize, Debug)]
pub struct OciError {
    /// The error code
    pub code: OciErrorCode,
    /// An optional message associated with the error
    #[serde(default)]
    pub message: String,
    /// Unstructured optional data associated with the error
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl std::error::Error for OciError {
    fn description(&self) -> &str {
        self.message.as_str()
    }
}

impl std::fmt::Display for OciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OCI API error: {}", self.message.as_str())
    }
}

/// The body of a registry error response, a list of [`OciError`] objects.
#[derive(serde::Deserialize, Debug)]
pub struct OciEnvelope {
    /// The errors returned by the registry.
    pub errors: Vec<OciError>,
}

impl std::fmt::Display for OciEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

/// OCI error codes
///
/// Outlined here: <https://github.com/opencontainers/distribution-spec/blob/main/spec.md#error-codes>
#[derive(serde::Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciErrorCode {
    /// Blob unknown to registry
    ///
    /// This error MAY be returned when a blob is unknown to the registry in a specified
    /// repository. This can be returned with a standard get or if a manifest
    /// references an unknown layer during upload.
    BlobUnknown,
    /// Blob upload is invalid
    ///
    /// The blob upload encountered an error and can no longer proceed.
    BlobUploadInvalid,
    /// Blob upload is unknown to registry
    BlobUploadUnknown,
    /// Provided digest did not match uploaded content.
    DigestInvalid,
    /// Blob is unknown to registry
    ManifestBlobUnknown,
    /// Manifest is invalid
    ///
    /// During upload, manifests undergo several checks ensuring validity. If
    /// those checks fail, this error MAY be returned, unless a more specific
    /// error is included. The detail will contain information the failed
    /// validation.
    ManifestInvalid,
    /// Manifest unknown
    ///
    /// This error is returned when the manifest, identified by name and tag is unknown to the repository.
    ManifestUnknown,
    /// Manifest failed signature validation
    ///
    /// DEPRECATED: This error code has been removed from the OCI spec.
    ManifestUnverified,
    /// Invalid repository name
    NameInvalid,
    /// Repository name is not known
    NameUnknown,
    /// Provided length did not match content length
    SizeInvalid,
    /// Manifest tag did not match URI
    ///
    /// DEPRECATED: This error code has been removed from the OCI spec.
    TagInvalid,
    /// Authentication required.
    Unauthorized,
    /// Requested access to the resource is denied
    Denied,
    /// This operation is unsupported
    Unsupported,
    /// Too many requests from client
    Toomanyrequests,
}

#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE_ERROR: &str = r#"
      {"errors":[{"code":"UNAUTHORIZED","message":"authentication required","detail":[{"Type":"repository","Name":"hello-wasm","Action":"pull"}]}]}
      "#;
    #[test]
    fn test_deserialize() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Unauthorized, e.code);
        assert_eq!("authentication required", e.message);
        assert_ne!(serde_json::value::Value::Null, e.detail);
    }

    const EXAMPLE_ERROR_TOOMANYREQUESTS: &str = r#"
      {"errors":[{"code":"TOOMANYREQUESTS","message":"pull request limit exceeded","detail":"You have reached your pull rate limit."}]}
      "#;
    #[test]
    fn test_deserialize_toomanyrequests() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR_TOOMANYREQUESTS).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Toomanyrequests, e.code);
        assert_eq!("pull request limit exceeded", e.message);
        assert_ne!(serde_json::value::Value::Null, e.detail);
    }

    const EXAMPLE_ERROR_MISSING_MESSAGE: &str = r#"
      {"errors":[{"code":"UNAUTHORIZED","detail":[{"Type":"repository","Name":"hello-wasm","Action":"pull"}]}]}
      "#;
    #[test]
    fn test_deserialize_without_message_field() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR_MISSING_MESSAGE).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Unauthorized, e.code);
        assert_eq!(String::default(), e.message);
        assert_ne!(serde_json::value::Value::Null, e.detail);
    }

    const EXAMPLE_ERROR_MISSING_DETAIL: &str = r#"
      {"errors":[{"code":"UNAUTHORIZED","message":"authentication required"}]}
      "#;
    #[test]
    fn test_deserialize_without_detail_field() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR_MISSING_DETAIL).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Unauthorized, e.code);
        assert_eq!("authentication required", e.message);
        assert_eq!(serde_json::value::Value::Null, e.detail);
    }

    #[test]
    fn timeouts_map_to_their_own_variant() {
        // A reqwest error can't be constructed directly; check the Display
        // plumbing on the variants instead.
        let err = OciDistributionError::TransportTimeout("deadline elapsed".to_string());
        assert_eq!(err.to_string(), "network timeout: deadline elapsed");
    }
}
