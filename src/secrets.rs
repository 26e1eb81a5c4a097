//! Types for working with registry access secrets

/// A method for authenticating to a registry
#[derive(Clone)]
pub enum RegistryAuth {
    /// Access the registry anonymously
    Anonymous,
    /// Access the registry using HTTP Basic authentication
    Basic(String, String),
    /// Access the registry with a caller-supplied bearer token
    Bearer(String),
}

impl std::fmt::Debug for RegistryAuth {
    // credentials stay out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryAuth::Anonymous => write!(f, "Anonymous"),
            RegistryAuth::Basic(username, _) => write!(f, "Basic({}, <redacted>)", username),
            RegistryAuth::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

pub(crate) trait Authenticable {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self;
}

impl Authenticable for reqwest::RequestBuilder {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self {
        match auth {
            RegistryAuth::Anonymous => self,
            RegistryAuth::Basic(username, password) => {
                self.basic_auth(username, Some(password))
            }
            RegistryAuth::Bearer(token) => self.bearer_auth(token),
        }
    }
}
