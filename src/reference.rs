use std::convert::{From, TryFrom};
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

/// NAME_TOTAL_LENGTH_MAX is the maximum total number of characters in a repository name.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

lazy_static! {
    /// One or more lowercase path segments separated by `/`. Each segment is
    /// alphanumeric, with single `.`, `_` or `-` separators inside it.
    static ref REPOSITORY_RE: Regex = Regex::new(
        r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$"
    )
    .expect("repository regex compiles");

    static ref TAG_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("tag regex compiles");

    static ref DIGEST_RE: Regex =
        Regex::new(r"^[a-z0-9]+:[a-f0-9]{32,}$").expect("digest regex compiles");
}

/// Reasons a reference string can fail to parse.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The digest portion is not `<algorithm>:<hex>`.
    DigestInvalidFormat,
    /// Repository names must be lowercase.
    NameContainsUppercase,
    /// The repository portion is missing.
    NameEmpty,
    /// The repository portion contains characters outside the allowed grammar.
    NameInvalidFormat,
    /// The repository portion exceeds the maximum length.
    NameTooLong,
    /// The reference as a whole does not match `registry/repository[:tag][@digest]`.
    ReferenceInvalidFormat,
    /// The registry host portion is missing or not a host.
    RegistryMissing,
    /// The tag portion contains characters outside the allowed grammar.
    TagInvalidFormat,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestInvalidFormat => write!(f, "invalid digest format"),
            ParseError::NameContainsUppercase => write!(f, "repository name must be lowercase"),
            ParseError::NameEmpty => write!(f, "repository name must have at least one component"),
            ParseError::NameInvalidFormat => write!(f, "invalid repository name format"),
            ParseError::NameTooLong => write!(
                f,
                "repository name must not be more than {} characters",
                NAME_TOTAL_LENGTH_MAX
            ),
            ParseError::ReferenceInvalidFormat => write!(f, "invalid reference format"),
            ParseError::RegistryMissing => {
                write!(f, "reference must name a registry host explicitly")
            }
            ParseError::TagInvalidFormat => write!(f, "invalid tag format"),
        }
    }
}

impl Error for ParseError {}

/// Reference provides a general type to represent any way of referencing images within an OCI registry.
///
/// The expected grammar is `registry-host[:port]/repository-path[:tag][@digest]`.
/// The registry host is never defaulted: references without one are rejected
/// so that resolution stays explicit and free of network lookups.
///
/// # Examples
///
/// Parsing a tagged image reference:
///
/// ```
/// use oci_registry_client::Reference;
///
/// let reference: Reference = "docker.io/library/hello-world:latest".parse().unwrap();
///
/// assert_eq!("docker.io/library/hello-world:latest", reference.whole());
/// assert_eq!("docker.io", reference.registry());
/// assert_eq!("library/hello-world", reference.repository());
/// assert_eq!(Some("latest"), reference.tag());
/// assert_eq!(None, reference.digest());
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// Create a Reference with a registry, repository and digest.
    ///
    /// The parts are trusted as-is; use the `FromStr`/`TryFrom`
    /// implementations to validate untrusted input.
    pub fn with_digest(registry: String, repository: String, digest: String) -> Self {
        Self {
            registry,
            repository,
            tag: None,
            digest: Some(digest),
        }
    }

    /// Create a Reference with a registry, repository and tag.
    ///
    /// The parts are trusted as-is; use the `FromStr`/`TryFrom`
    /// implementations to validate untrusted input.
    pub fn with_tag(registry: String, repository: String, tag: String) -> Self {
        Self {
            registry,
            repository,
            tag: Some(tag),
            digest: None,
        }
    }

    /// registry returns the name of the registry.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// repository returns the name of the repository.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// tag returns the object's tag, if present.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// digest returns the object's digest, if present.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// whole returns the whole reference.
    pub fn whole(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(t) = self.tag() {
            s.push(':');
            s.push_str(t);
        }
        if let Some(d) = self.digest() {
            s.push('@');
            s.push_str(d);
        }
        s
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::try_from(s)
    }
}

impl TryFrom<String> for Reference {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Err(ParseError::ReferenceInvalidFormat);
        }
        let repo_start = s.find('/').ok_or(ParseError::RegistryMissing)?;
        let registry = &s[..repo_start];
        let rest = &s[repo_start + 1..];

        let (rest, digest) = match rest.find('@') {
            Some(i) => (&rest[..i], Some(rest[i + 1..].to_string())),
            None => (rest, None),
        };
        // The repository grammar has no `:`, so the first colon left of the
        // digest delimiter starts the tag.
        let (repository, tag) = match rest.find(':') {
            Some(i) => (&rest[..i], Some(rest[i + 1..].to_string())),
            None => (rest, None),
        };

        // A host is either a dotted name, a name with a port, or localhost.
        // Anything else means the reference left the registry out.
        if registry.is_empty()
            || !(registry.contains('.') || registry.contains(':') || registry == "localhost")
        {
            return Err(ParseError::RegistryMissing);
        }

        if repository.is_empty() {
            return Err(ParseError::NameEmpty);
        }
        if repository.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong);
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ParseError::NameContainsUppercase);
        }
        if !REPOSITORY_RE.is_match(repository) {
            return Err(ParseError::NameInvalidFormat);
        }
        if let Some(t) = tag.as_deref() {
            if !TAG_RE.is_match(t) {
                return Err(ParseError::TagInvalidFormat);
            }
        }
        if let Some(d) = digest.as_deref() {
            if !DIGEST_RE.is_match(d) {
                return Err(ParseError::DigestInvalidFormat);
            }
        }

        Ok(Reference {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;
    fn try_from(string: &str) -> Result<Self, Self::Error> {
        TryFrom::try_from(string.to_owned())
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.whole()
    }
}
