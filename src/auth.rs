//! Credential resolution and authentication
//!
//! Serve and chain nodes resolve credentials from three places, in order:
//! a credential embedded in the spec, a base64 `auth` option, and the first
//! entry of a `secrets` file. Serve nodes additionally carry an
//! [`Authenticator`] validating inbound credentials.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{HopError, Result};
use crate::node::Credential;

/// Validates a username/password pair presented by an inbound connection.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Authenticator backed by an in-memory user table.
pub struct LocalAuthenticator {
    users: HashMap<String, String>,
}

impl LocalAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Single-entry authenticator synthesized from a node credential.
    pub fn single(credential: &Credential) -> Self {
        let mut users = HashMap::new();
        users.insert(
            credential.username.clone(),
            credential.password_or_empty().to_string(),
        );
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for LocalAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users.get(username).map(|p| p == password).unwrap_or(false)
    }
}

/// Decode a base64 `auth` option into a `user[:pass]` credential.
pub fn decode_auth(token: &str) -> Result<Credential> {
    let decoded = BASE64
        .decode(token)
        .map_err(|e| HopError::InvalidAuth(e.to_string()))?;
    let text = String::from_utf8(decoded)
        .map_err(|e| HopError::InvalidAuth(e.to_string()))?;
    Ok(Credential::from_pair(&text))
}

/// Parse a secrets file into credentials.
///
/// One `user pass` pair per whitespace-separated line; blank lines and `#`
/// comments are skipped. A missing path yields an empty list.
pub fn parse_users(path: Option<&str>) -> Result<Vec<Credential>> {
    let path = match path {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(Vec::new()),
    };

    let content = std::fs::read_to_string(Path::new(path)).map_err(|e| {
        HopError::InvalidConfig(format!("failed to read secrets file {}: {}", path, e))
    })?;

    let mut users = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let username = match parts.next() {
            Some(u) => u,
            None => continue,
        };
        let password = parts.next().map(|p| p.to_string());
        users.push(Credential::new(username, password));
    }
    Ok(users)
}

/// Build an authenticator from a secrets file, if one is configured.
pub fn parse_authenticator(path: Option<&str>) -> Result<Option<Arc<dyn Authenticator>>> {
    let users = parse_users(path)?;
    if users.is_empty() {
        return Ok(None);
    }
    let map = users
        .into_iter()
        .map(|c| {
            let pass = c.password_or_empty().to_string();
            (c.username, pass)
        })
        .collect();
    Ok(Some(Arc::new(LocalAuthenticator::new(map))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_secrets(content: &str) -> temppath::TempPath {
        temppath::TempPath::new(content)
    }

    // Minimal scoped temp file helper for secrets tests.
    mod temppath {
        use std::io::Write;
        use std::sync::atomic::{AtomicUsize, Ordering};

        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        pub struct TempPath {
            pub path: std::path::PathBuf,
        }

        impl TempPath {
            pub fn new(content: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!(
                    "hopchain-secrets-{}-{}",
                    std::process::id(),
                    COUNTER.fetch_add(1, Ordering::Relaxed)
                ));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(content.as_bytes()).unwrap();
                Self { path }
            }

            pub fn as_str(&self) -> &str {
                self.path.to_str().unwrap()
            }
        }

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn test_decode_auth_with_password() {
        let token = BASE64.encode(b"admin:s3cret");
        let cred = decode_auth(&token).unwrap();
        assert_eq!(cred.username, "admin");
        assert_eq!(cred.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_decode_auth_username_only() {
        let token = BASE64.encode(b"admin");
        let cred = decode_auth(&token).unwrap();
        assert_eq!(cred.username, "admin");
        assert!(cred.password.is_none());
    }

    #[test]
    fn test_decode_auth_invalid_base64() {
        assert!(matches!(
            decode_auth("not base64 at all!"),
            Err(HopError::InvalidAuth(_))
        ));
    }

    #[test]
    fn test_parse_users_file() {
        let f = temp_secrets("# comment\nalice pw1\n\nbob pw2\ncarol\n");
        let users = parse_users(Some(f.as_str())).unwrap();
        assert_eq!(users.len(), 3);
        assert_eq!(users[0], Credential::new("alice", Some("pw1".to_string())));
        assert_eq!(users[2], Credential::new("carol", None));
    }

    #[test]
    fn test_parse_users_missing_option() {
        assert!(parse_users(None).unwrap().is_empty());
        assert!(parse_users(Some("")).unwrap().is_empty());
    }

    #[test]
    fn test_parse_users_unreadable_file() {
        assert!(matches!(
            parse_users(Some("/nonexistent/secrets.txt")),
            Err(HopError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_local_authenticator() {
        let f = temp_secrets("alice pw1\nbob pw2\n");
        let auth = parse_authenticator(Some(f.as_str())).unwrap().unwrap();
        assert!(auth.authenticate("alice", "pw1"));
        assert!(auth.authenticate("bob", "pw2"));
        assert!(!auth.authenticate("alice", "wrong"));
        assert!(!auth.authenticate("mallory", "pw1"));
    }

    #[test]
    fn test_single_entry_authenticator() {
        let auth = LocalAuthenticator::single(&Credential::new("u", Some("p".to_string())));
        assert_eq!(auth.len(), 1);
        assert!(auth.authenticate("u", "p"));
        assert!(!auth.authenticate("u", ""));

        let auth = LocalAuthenticator::single(&Credential::new("u", None));
        assert!(auth.authenticate("u", ""));
    }
}
