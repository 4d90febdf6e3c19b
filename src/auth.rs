//! HTTP Basic authentication
//!
//! Enabled by `CAMLI_AUTH=userpass:<user>:<password>[:opts]`, the same
//! format the upstream tooling uses. Passwords are compared via their
//! SHA-1 digest; the realm is fixed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use tracing::warn;

pub const REALM: &str = "camproxy";

pub struct AuthCheck {
    username: String,
    password_sha1: [u8; 20],
}

impl AuthCheck {
    /// Parse a `userpass:<user>:<password>[:opts]` spec. Unrecognized
    /// specs are reported and ignored, leaving the server open.
    pub fn from_spec(spec: &str) -> Option<Self> {
        if spec.is_empty() {
            return None;
        }
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() < 3 || parts[0] != "userpass" {
            warn!(spec = spec, "unrecognizable CAMLI_AUTH value, ignoring");
            return None;
        }
        let mut hasher = Sha1::new();
        hasher.update(parts[2].as_bytes());
        Some(Self {
            username: parts[1].to_string(),
            password_sha1: hasher.finalize().into(),
        })
    }

    /// Check an `Authorization` header value.
    pub fn allows(&self, authorization: Option<&str>) -> bool {
        let Some(header) = authorization else {
            return false;
        };
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(userpass) = std::str::from_utf8(&decoded) else {
            return false;
        };
        let Some((user, pass)) = userpass.split_once(':') else {
            return false;
        };
        if user != self.username {
            return false;
        }
        let mut hasher = Sha1::new();
        hasher.update(pass.as_bytes());
        let digest: [u8; 20] = hasher.finalize().into();
        digest == self.password_sha1
    }
}

/// Build the header value clients use for `user`/`pass`.
pub fn basic_header(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_correct_credentials() {
        let auth = AuthCheck::from_spec("userpass:alice:secret").unwrap();
        assert!(auth.allows(Some(&basic_header("alice", "secret"))));
    }

    #[test]
    fn rejects_wrong_password_and_user() {
        let auth = AuthCheck::from_spec("userpass:alice:secret").unwrap();
        assert!(!auth.allows(Some(&basic_header("alice", "wrong"))));
        assert!(!auth.allows(Some(&basic_header("bob", "secret"))));
        assert!(!auth.allows(None));
        assert!(!auth.allows(Some("Bearer token")));
        assert!(!auth.allows(Some("Basic !!!notbase64")));
    }

    #[test]
    fn extra_spec_options_are_tolerated() {
        let auth = AuthCheck::from_spec("userpass:alice:secret:+localhost").unwrap();
        assert!(auth.allows(Some(&basic_header("alice", "secret"))));
    }

    #[test]
    fn bad_specs_are_ignored() {
        assert!(AuthCheck::from_spec("").is_none());
        assert!(AuthCheck::from_spec("token:abc").is_none());
        assert!(AuthCheck::from_spec("userpass:only-user").is_none());
    }
}
