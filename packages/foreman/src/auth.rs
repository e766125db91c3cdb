//! HTTP Basic authentication.
//!
//! Credentials are never stored in plaintext: the configured client id and
//! key are digested at startup and every request's credentials are digested
//! and compared in constant time.

use axum::{
    extract::FromRequestParts,
    http::{
        StatusCode,
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
        request::Parts,
    },
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::warn;

type Fingerprint = [u8; 20];

/// The configured client credential digests.
#[derive(Clone, Debug)]
pub struct Credentials {
    id: Fingerprint,
    key: Fingerprint,
}

impl Credentials {
    pub fn new(id: &str, key: &str) -> Self {
        Self {
            id: digest(id),
            key: digest(key),
        }
    }

    /// Compare the presented pair against the configured digests in
    /// constant time.
    pub fn verify(&self, id: &str, key: &str) -> bool {
        let id_ok = digest(id)[..].ct_eq(&self.id[..]);
        let key_ok = digest(key)[..].ct_eq(&self.key[..]);
        bool::from(id_ok & key_ok)
    }
}

fn digest(value: &str) -> Fingerprint {
    Sha1::digest(value.as_bytes()).into()
}

/// Extractor that authenticates the request before the handler runs.
pub struct Authenticated;

fn deny() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, "Basic realm=\"foreman\"")],
        "authentication required",
    )
        .into_response()
}

impl FromRequestParts<crate::api::State> for Authenticated {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &crate::api::State,
    ) -> Result<Self, Self::Rejection> {
        let Some(credentials) = &state.credentials else {
            warn!("rejecting request: no credentials configured");
            return Err(deny());
        };

        let Some(header) = parts.headers.get(AUTHORIZATION) else {
            return Err(deny());
        };
        let Ok(header) = header.to_str() else {
            return Err(deny());
        };
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return Err(deny());
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return Err(deny());
        };
        let Ok(pair) = String::from_utf8(decoded) else {
            return Err(deny());
        };
        let Some((id, key)) = pair.split_once(':') else {
            return Err(deny());
        };

        if credentials.verify(id, key) {
            Ok(Authenticated)
        } else {
            Err(deny())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_configured_pair() {
        let credentials = Credentials::new("builder", "hunter2");
        assert!(credentials.verify("builder", "hunter2"));
    }

    #[test]
    fn rejects_everything_else() {
        let credentials = Credentials::new("builder", "hunter2");
        assert!(!credentials.verify("builder", "wrong"));
        assert!(!credentials.verify("wrong", "hunter2"));
        assert!(!credentials.verify("", ""));
    }
}
