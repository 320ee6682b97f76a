//! Repository credentials.
//!
//! Credentials never live in `keel.toml`; the manifest names the environment
//! variables that hold them.

use std::fmt;
use thiserror::Error;

/// Errors resolving credentials.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// A configured variable is not set.
    #[error("Environment variable {0} is not set")]
    MissingVar(String),

    /// Only one of username / password was configured.
    #[error("Repository '{0}' configures only one of username-env / password-env")]
    Incomplete(String),
}

/// Username and password for HTTP basic auth.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Build credentials from plain values.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Resolve credentials for `repository` from two variable names using
    /// `lookup`. No names means anonymous access.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Incomplete`] if only one name is given and
    /// [`CredentialError::MissingVar`] if a named variable is unset.
    pub fn resolve_with(
        repository: &str,
        username_var: Option<&str>,
        password_var: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, CredentialError> {
        match (username_var, password_var) {
            (None, None) => Ok(None),
            (Some(user), Some(pass)) => {
                let username =
                    lookup(user).ok_or_else(|| CredentialError::MissingVar(user.to_string()))?;
                let password =
                    lookup(pass).ok_or_else(|| CredentialError::MissingVar(pass.to_string()))?;
                Ok(Some(Self { username, password }))
            }
            _ => Err(CredentialError::Incomplete(repository.to_string())),
        }
    }

    /// [`Credentials::resolve_with`] reading the process environment.
    ///
    /// # Errors
    ///
    /// See [`Credentials::resolve_with`].
    pub fn from_env(
        repository: &str,
        username_var: Option<&str>,
        password_var: Option<&str>,
    ) -> Result<Option<Self>, CredentialError> {
        Self::resolve_with(repository, username_var, password_var, |name| {
            std::env::var(name).ok()
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
