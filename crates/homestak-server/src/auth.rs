use axum::http::{HeaderMap, StatusCode};
use tracing::warn;

use homestak_core::error::ErrorKind;
use homestak_core::token::TokenService;

/// Extract a Bearer token from the Authorization header.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Authorization failure carrying the HTTP status to respond with.
/// Unauthorized responses carry no body beyond `Unauthorized`.
#[derive(Debug, PartialEq, Eq)]
pub struct AuthFailure {
    pub status: StatusCode,
}

impl AuthFailure {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
        }
    }
}

/// Validate a spec request: a provisioning token must verify and its
/// identity must equal the path identity.
pub fn authorize_spec(
    identity: &str,
    headers: &HeaderMap,
    tokens: Option<&TokenService>,
) -> Result<(), AuthFailure> {
    let Some(tokens) = tokens else {
        warn!("Spec requested but no signing key is configured");
        return Err(AuthFailure {
            status: StatusCode::INTERNAL_SERVER_ERROR,
        });
    };

    let Some(bearer) = extract_bearer(headers) else {
        return Err(AuthFailure::unauthorized());
    };

    let verified = match tokens.verify(bearer) {
        Ok(verified) => verified,
        Err(e) => {
            warn!(identity = %identity, kind = %e.kind, "Token verification failed");
            debug_assert!(matches!(
                e.kind,
                ErrorKind::Unauthorized | ErrorKind::Expired | ErrorKind::Malformed
            ));
            return Err(AuthFailure::unauthorized());
        }
    };

    if verified.identity != identity {
        warn!(
            token_identity = %verified.identity,
            path_identity = %identity,
            "Token identity does not match requested spec"
        );
        return Err(AuthFailure::unauthorized());
    }

    Ok(())
}

/// Validate the opaque bearer token protecting repo endpoints.
/// An empty configured token disables repo auth (dev mode).
pub fn authorize_repo(headers: &HeaderMap, expected: &str) -> Result<(), AuthFailure> {
    if expected.is_empty() {
        return Ok(());
    }
    match extract_bearer(headers) {
        Some(bearer) if bearer == expected => Ok(()),
        _ => Err(AuthFailure::unauthorized()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    fn tokens() -> TokenService {
        TokenService::from_hex_key(Some(
            "a0a1a2a3a4a5a6a7a8a9aaabacadaeafb0b1b2b3b4b5b6b7b8b9babbbcbdbebf",
        ))
        .unwrap()
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {}", token).parse().unwrap());
        headers
    }

    #[test]
    fn test_extract_bearer() {
        let headers = headers_with("abc.def");
        assert_eq!(extract_bearer(&headers), Some("abc.def"));

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, "Basic Zm9v".parse().unwrap());
        assert_eq!(extract_bearer(&basic), None);
        assert_eq!(extract_bearer(&HeaderMap::new()), None);
    }

    #[test]
    fn test_spec_auth_valid_token() {
        let svc = tokens();
        let token = svc.mint("a", 300).unwrap();
        authorize_spec("a", &headers_with(&token), Some(&svc)).unwrap();
    }

    #[test]
    fn test_spec_auth_identity_mismatch() {
        let svc = tokens();
        let token = svc.mint("a", 300).unwrap();
        let err = authorize_spec("b", &headers_with(&token), Some(&svc)).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_spec_auth_tampered_token() {
        let svc = tokens();
        let token = svc.mint("a", 300).unwrap();
        // Flip one character of the signature segment.
        let mut tampered = token.clone().into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        let err = authorize_spec("a", &headers_with(&tampered), Some(&svc)).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_spec_auth_expired_token() {
        let svc = tokens();
        let token = svc.mint("a", -5).unwrap();
        let err = authorize_spec("a", &headers_with(&token), Some(&svc)).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_spec_auth_missing_token() {
        let svc = tokens();
        let err = authorize_spec("a", &HeaderMap::new(), Some(&svc)).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_spec_auth_no_signing_key() {
        let err = authorize_spec("a", &HeaderMap::new(), None).unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_repo_auth() {
        authorize_repo(&headers_with("secret"), "secret").unwrap();
        assert!(authorize_repo(&headers_with("wrong"), "secret").is_err());
        assert!(authorize_repo(&HeaderMap::new(), "secret").is_err());
        // Empty expected token disables auth.
        authorize_repo(&HeaderMap::new(), "").unwrap();
    }
}
