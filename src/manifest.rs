//! OCI Manifest
use std::collections::BTreeMap;

use crate::client::{Config, ImageLayer};
use crate::digest::sha256_digest;

/// The mediatype for WASM layers.
pub const WASM_LAYER_MEDIA_TYPE: &str = "application/vnd.wasm.content.layer.v1+wasm";
/// The mediatype for a WASM image config.
pub const WASM_CONFIG_MEDIA_TYPE: &str = "application/vnd.wasm.config.v1+json";
/// The mediatype for a Docker v2 schema 2 manifest.
pub const IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// The mediatype for a Docker v2 schema 2 manifest list.
pub const IMAGE_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// The mediatype for an OCI image manifest.
pub const OCI_IMAGE_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// The mediatype for an OCI image index manifest.
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// The mediatype for an image config (manifest).
pub const IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
/// The mediatype that Docker uses for image configs.
pub const IMAGE_DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
/// The mediatype for a layer.
pub const IMAGE_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
/// The mediatype for a layer that is gzipped.
pub const IMAGE_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// The mediatype that Docker uses for a layer that is tarred.
pub const IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar";
/// The mediatype that Docker uses for a layer that is gzipped.
pub const IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// The mediatype for a layer that is nondistributable.
pub const IMAGE_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";
/// The mediatype for a layer that is nondistributable and gzipped.
pub const IMAGE_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// Pre-defined annotation keys.
/// <https://github.com/opencontainers/image-spec/blob/main/annotations.md#pre-defined-annotation-keys>
pub mod annotations {
    /// Date and time on which the image was built (date-time string as defined by RFC 3339).
    pub const ORG_OPENCONTAINERS_IMAGE_CREATED: &str = "org.opencontainers.image.created";
    /// Contact details of the people or organization responsible for the image.
    pub const ORG_OPENCONTAINERS_IMAGE_AUTHORS: &str = "org.opencontainers.image.authors";
    /// URL to find more information on the image.
    pub const ORG_OPENCONTAINERS_IMAGE_URL: &str = "org.opencontainers.image.url";
    /// URL to get documentation on the image.
    pub const ORG_OPENCONTAINERS_IMAGE_DOCUMENTATION: &str =
        "org.opencontainers.image.documentation";
    /// URL to get source code for building the image.
    pub const ORG_OPENCONTAINERS_IMAGE_SOURCE: &str = "org.opencontainers.image.source";
    /// Version of the packaged software.
    pub const ORG_OPENCONTAINERS_IMAGE_VERSION: &str = "org.opencontainers.image.version";
    /// Source control revision identifier for the packaged software.
    pub const ORG_OPENCONTAINERS_IMAGE_REVISION: &str = "org.opencontainers.image.revision";
    /// Name of the distributing entity, organization or individual.
    pub const ORG_OPENCONTAINERS_IMAGE_VENDOR: &str = "org.opencontainers.image.vendor";
    /// License(s) under which contained software is distributed, as an SPDX expression.
    pub const ORG_OPENCONTAINERS_IMAGE_LICENSES: &str = "org.opencontainers.image.licenses";
    /// Name of the reference for a target.
    pub const ORG_OPENCONTAINERS_IMAGE_REF_NAME: &str = "org.opencontainers.image.ref.name";
    /// Human-readable title of the image.
    pub const ORG_OPENCONTAINERS_IMAGE_TITLE: &str = "org.opencontainers.image.title";
    /// Human-readable description of the software packaged in the image.
    pub const ORG_OPENCONTAINERS_IMAGE_DESCRIPTION: &str =
        "org.opencontainers.image.description";
    /// Digest of the image this image is based on.
    pub const ORG_OPENCONTAINERS_IMAGE_BASE_DIGEST: &str =
        "org.opencontainers.image.base.digest";
    /// Image reference of the image this image is based on.
    pub const ORG_OPENCONTAINERS_IMAGE_BASE_NAME: &str = "org.opencontainers.image.base.name";
}

/// An OCI manifest is either a single image manifest or an image index
/// (a.k.a. manifest list) pointing at per-platform manifests.
///
/// The two shapes share no useful method surface beyond serialization,
/// so they are modeled as a sum type and dispatched by structure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum OciManifest {
    /// A single image manifest.
    Image(OciImageManifest),
    /// An image index.
    ImageIndex(OciImageIndex),
}

impl OciManifest {
    /// Returns the media type to send as `Content-Type` when pushing this
    /// manifest.
    pub fn content_type(&self) -> &str {
        match self {
            OciManifest::Image(m) => m.media_type.as_deref().unwrap_or(OCI_IMAGE_MEDIA_TYPE),
            OciManifest::ImageIndex(i) => {
                i.media_type.as_deref().unwrap_or(OCI_IMAGE_INDEX_MEDIA_TYPE)
            }
        }
    }
}

impl From<OciImageManifest> for OciManifest {
    fn from(m: OciImageManifest) -> Self {
        OciManifest::Image(m)
    }
}

impl From<OciImageIndex> for OciManifest {
    fn from(i: OciImageIndex) -> Self {
        OciManifest::ImageIndex(i)
    }
}

/// The OCI image manifest describes an OCI image.
///
/// It is part of the OCI specification, and is defined here:
/// <https://github.com/opencontainers/image-spec/blob/main/manifest.md>
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciImageManifest {
    /// This is a schema version.
    ///
    /// The specification does not specify the width of this integer.
    /// However, the only version allowed by the specification is `2`.
    /// So we have made this a u8.
    pub schema_version: u8,

    /// This is an optional media type describing this manifest.
    ///
    /// This property SHOULD be used and remain compatible with earlier
    /// versions of this specification and with other similar external
    /// formats.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The type of an artifact when the manifest is used for artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The image configuration.
    ///
    /// This object is required.
    pub config: OciDescriptor,

    /// The OCI image layers
    ///
    /// The specification is unclear whether this is required. We have left it
    /// required, assuming an empty vector can be used if necessary.
    pub layers: Vec<OciDescriptor>,

    /// The digest of the subject manifest this manifest refers to
    /// (OCI 1.1 referrers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<OciDescriptor>,

    /// The annotations for this manifest
    ///
    /// The specification says "If there are no annotations then this property
    /// MUST either be absent or be an empty map."
    /// TO accomodate either, this is optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Default for OciImageManifest {
    fn default() -> Self {
        OciImageManifest {
            schema_version: 2,
            media_type: Some(OCI_IMAGE_MEDIA_TYPE.to_string()),
            artifact_type: None,
            config: OciDescriptor::default(),
            layers: vec![],
            subject: None,
            annotations: None,
        }
    }
}

impl OciImageManifest {
    /// Build an image manifest from the blobs that make up the image.
    ///
    /// Descriptor digests and sizes are computed from the blob contents.
    /// Layers without annotations are given an
    /// `org.opencontainers.image.title` annotation carrying their digest,
    /// so registries have something human-readable to display.
    pub fn build(
        layers: &[ImageLayer],
        config: &Config,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Self {
        let mut manifest = OciImageManifest {
            annotations,
            ..Default::default()
        };

        manifest.config = OciDescriptor {
            media_type: config.media_type.clone(),
            digest: sha256_digest(&config.data),
            size: config.data.len() as i64,
            annotations: config.annotations.clone(),
            ..Default::default()
        };

        for layer in layers {
            let digest = sha256_digest(&layer.data);
            let layer_annotations = layer.annotations.clone().or_else(|| {
                let mut titled = BTreeMap::new();
                titled.insert(
                    annotations::ORG_OPENCONTAINERS_IMAGE_TITLE.to_string(),
                    digest.clone(),
                );
                Some(titled)
            });

            manifest.layers.push(OciDescriptor {
                media_type: layer.media_type.clone(),
                digest,
                size: layer.data.len() as i64,
                annotations: layer_annotations,
                ..Default::default()
            });
        }

        manifest
    }
}

/// Versioned provides a struct with the manifest's schemaVersion and mediaType.
/// Incoming content with unknown schema versions can be decoded against this
/// struct to check the version.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned {
    /// schema_version is the image manifest schema that this image follows
    pub schema_version: i32,

    /// media_type is the media type of this schema.
    pub media_type: Option<String>,
}

/// The OCI descriptor is a generic object used to describe other objects.
///
/// It is defined in the OCI Image Specification:
/// <https://github.com/opencontainers/image-spec/blob/main/descriptor.md#properties>
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    /// The media type of this descriptor.
    ///
    /// Layers, config, and manifests may all have descriptors. Each
    /// is differentiated by its mediaType.
    ///
    /// This REQUIRED property contains the media type of the referenced
    /// content. Values MUST comply with RFC 6838, including the naming
    /// requirements in its section 4.2.
    pub media_type: String,

    /// The SHA 256 or 512 digest of the object this describes.
    ///
    /// This REQUIRED property is the digest of the targeted content, conforming
    /// to the requirements outlined in Digests. Retrieved content SHOULD be
    /// verified against this digest when consumed via untrusted sources.
    pub digest: String,

    /// The size, in bytes, of the object this describes.
    ///
    /// This REQUIRED property specifies the size, in bytes, of the raw
    /// content. This property exists so that a client will have an expected
    /// size for the content before processing. If the length of the retrieved
    /// content does not match the specified length, the content SHOULD NOT be
    /// trusted.
    pub size: i64,

    /// This OPTIONAL property specifies a list of URIs from which this
    /// object MAY be downloaded. Each entry MUST conform to RFC 3986.
    /// Entries SHOULD use the http and https schemes, as defined in RFC 7230.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    /// This OPTIONAL property contains arbitrary metadata for this descriptor.
    /// This OPTIONAL property MUST use the annotation rules.
    /// <https://github.com/opencontainers/image-spec/blob/main/annotations.md#rules>
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Default for OciDescriptor {
    fn default() -> Self {
        OciDescriptor {
            media_type: IMAGE_CONFIG_MEDIA_TYPE.to_owned(),
            digest: "".to_owned(),
            size: 0,
            urls: None,
            annotations: None,
        }
    }
}

/// The OCI image index is a higher-level manifest which points to specific
/// image manifests, ideal for one or more platforms.
///
/// It is part of the OCI specification, and is defined here:
/// <https://github.com/opencontainers/image-spec/blob/main/image-index.md>
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciImageIndex {
    /// This is a schema version.
    ///
    /// The specification does not specify the width of this integer.
    /// However, the only version allowed by the specification is `2`.
    /// So we have made this a u8.
    pub schema_version: u8,

    /// This is an optional media type describing this manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The type of an artifact when the index is used for artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The manifests this index references, one per platform or artifact.
    pub manifests: Vec<ImageIndexEntry>,

    /// The annotations for this index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// The manifest entry of an `OciImageIndex`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndexEntry {
    /// The media type of this descriptor.
    pub media_type: String,

    /// The digest of the targeted content.
    pub digest: String,

    /// The size, in bytes, of the raw content.
    pub size: i64,

    /// The platform the referenced manifest is built for.
    ///
    /// This should only be used when the referenced manifest is an image
    /// manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// The type of the referenced artifact, when the entry points at an
    /// artifact manifest (used by the OCI 1.1 referrers API).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// This OPTIONAL property contains arbitrary metadata for this descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// The runtime requirements of an image index entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// The CPU architecture, in GOARCH form.
    pub architecture: String,

    /// The operating system, in GOOS form.
    pub os: String,

    /// The version of the operating system.
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// Mandatory OS features, e.g. `win32k` on Windows.
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,

    /// The variant of the CPU, e.g. `v7` on arm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Mandatory CPU features.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}
