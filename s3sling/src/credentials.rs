//! Credential resolution and the request signing strategy.
//!
//! Resolution is a pure function over the explicitly-provided keys and an environment lookup, so
//! it can be tested without touching the process environment.  The resolved credentials are
//! immutable; they are handed to the SDK client exactly once at construction and never mutated
//! afterwards.

use crate::Result;
use snafu::OptionExt;

/// Static credentials for the object store.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret key must never end up in logs
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<...>")
            .finish()
    }
}

/// The request signing scheme to use when talking to the object store.
///
/// Selected once at client construction, never changed afterwards.  The AWS SDK only implements
/// SigV4; selecting [`SigningVersion::V2`] against it fails with a config error at client
/// construction time.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum SigningVersion {
    /// The legacy AWS signature version 2 scheme, needed by some very old S3-compatible stores
    V2,

    /// The current AWS signature version 4 scheme
    #[default]
    V4,
}

impl std::fmt::Display for SigningVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V2 => write!(f, "v2"),
            Self::V4 => write!(f, "v4"),
        }
    }
}

/// Resolve the access key and secret to use, preferring explicitly-provided values over the
/// conventional `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` environment variables.
///
/// `env` is the environment lookup, normally `|name| std::env::var(name).ok()`.  Fails if either
/// half of the credentials can't be found anywhere.
pub fn resolve_credentials<E>(
    explicit_access_key: Option<&str>,
    explicit_secret_key: Option<&str>,
    env: E,
) -> Result<Credentials>
where
    E: Fn(&str) -> Option<String>,
{
    let access_key = explicit_access_key
        .map(|key| key.to_string())
        .or_else(|| env("AWS_ACCESS_KEY_ID"))
        .filter(|key| !key.is_empty())
        .context(crate::error::MissingCredentialsSnafu {})?;

    let secret_key = explicit_secret_key
        .map(|key| key.to_string())
        .or_else(|| env("AWS_SECRET_ACCESS_KEY"))
        .filter(|key| !key.is_empty())
        .context(crate::error::MissingCredentialsSnafu {})?;

    Ok(Credentials {
        access_key,
        secret_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |name| map.get(name).cloned()
    }

    #[test]
    fn explicit_credentials_win_over_environment() {
        let env = env_of(&[
            ("AWS_ACCESS_KEY_ID", "env-access"),
            ("AWS_SECRET_ACCESS_KEY", "env-secret"),
        ]);

        let creds = resolve_credentials(Some("cli-access"), Some("cli-secret"), env).unwrap();

        assert_eq!("cli-access", creds.access_key);
        assert_eq!("cli-secret", creds.secret_key);
    }

    #[test]
    fn environment_fills_in_missing_halves() {
        let env = env_of(&[("AWS_SECRET_ACCESS_KEY", "env-secret")]);

        let creds = resolve_credentials(Some("cli-access"), None, env).unwrap();

        assert_eq!("cli-access", creds.access_key);
        assert_eq!("env-secret", creds.secret_key);
    }

    #[test]
    fn missing_credentials_is_a_config_error() {
        let result = resolve_credentials(None, None, env_of(&[]));

        let err = result.unwrap_err();
        assert_matches!(err, crate::S3SlingError::MissingCredentials { .. });
        assert_eq!(ErrorKind::Config, err.kind());
    }

    #[test]
    fn empty_environment_values_are_treated_as_missing() {
        let env = env_of(&[
            ("AWS_ACCESS_KEY_ID", ""),
            ("AWS_SECRET_ACCESS_KEY", "env-secret"),
        ]);

        let err = resolve_credentials(None, None, env).unwrap_err();
        assert_matches!(err, crate::S3SlingError::MissingCredentials { .. });
    }

    #[test]
    fn secret_key_is_redacted_in_debug_output() {
        let creds = Credentials {
            access_key: "AKIAEXAMPLE".to_string(),
            secret_key: "super-secret".to_string(),
        };

        let debug = format!("{creds:?}");
        assert!(debug.contains("AKIAEXAMPLE"));
        assert!(!debug.contains("super-secret"));
    }
}
