//! Request authentication.
//!
//! Three credentials are understood:
//! - `Authorization: Bearer <jwt>` issued by the project registry;
//! - `Authorization: Bearer <admin token>` from server configuration, for the
//!   project admin routes only;
//! - `Stream-Reader-Key` plus `Stream-Project`, granting read access to the one
//!   stream the key was derived for.

use axum::http::HeaderMap;
use durastream_types::headers;

use crate::{
    error::ApiError,
    registry::{DEFAULT_PROJECT, ProjectRegistry, Scope, constant_time_eq},
};

/// Who is calling and what they may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub project: String,
    pub scopes: Vec<Scope>,
    /// Set when the credential only covers one stream.
    pub stream: Option<String>,
}

impl AuthContext {
    fn open() -> Self {
        Self {
            project: DEFAULT_PROJECT.to_string(),
            scopes: Scope::ALL.to_vec(),
            stream: None,
        }
    }

    pub fn has(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope) || self.scopes.contains(&Scope::Admin)
    }

    /// Fail with 403 unless `scope` is held for `stream`.
    pub fn require(&self, scope: Scope, stream: &str) -> Result<(), ApiError> {
        if !self.has(scope) {
            return Err(ApiError::Forbidden(format!(
                "missing {} scope",
                scope.as_str()
            )));
        }
        if let Some(only) = &self.stream
            && only != stream
        {
            return Err(ApiError::Forbidden(format!(
                "credential does not cover stream {stream}"
            )));
        }
        Ok(())
    }
}

/// Extract a bearer token from the Authorization header.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Authenticate a request against `stream`.
pub fn authenticate(
    registry: &ProjectRegistry,
    headers: &HeaderMap,
    stream: &str,
) -> Result<AuthContext, ApiError> {
    if registry.is_open() {
        return Ok(AuthContext::open());
    }

    if let Some(token) = extract_token(headers) {
        let claims = registry.verify_token(token)?;
        return Ok(AuthContext {
            project: claims.sub,
            scopes: claims.scope,
            stream: claims.stream,
        });
    }

    let reader_key = header_value(headers, headers::STREAM_READER_KEY);
    let project = header_value(headers, headers::STREAM_PROJECT);
    if let (Some(key), Some(project)) = (reader_key, project) {
        if registry.verify_reader_key(project, stream, key) {
            return Ok(AuthContext {
                project: project.to_string(),
                scopes: vec![Scope::Read],
                stream: Some(stream.to_string()),
            });
        }
        return Err(ApiError::Unauthorized);
    }

    Err(ApiError::Unauthorized)
}

/// Authorize a call to the admin routes of `project`.
pub fn authorize_admin(
    registry: &ProjectRegistry,
    headers: &HeaderMap,
    admin_token: Option<&str>,
    project: &str,
) -> Result<(), ApiError> {
    let presented = extract_token(headers);

    if let (Some(expected), Some(presented)) = (admin_token, presented)
        && constant_time_eq(expected.as_bytes(), presented.as_bytes())
    {
        return Ok(());
    }

    match presented {
        // No admin token configured and open mode = no auth
        None if admin_token.is_none() && registry.is_open() => Ok(()),
        None => Err(ApiError::Unauthorized),
        Some(_) if registry.is_open() && admin_token.is_none() => Ok(()),
        Some(token) => {
            let claims = registry.verify_token(token)?;
            if claims.sub != project || !claims.scope.contains(&Scope::Admin) {
                return Err(ApiError::Forbidden("missing admin scope".to_string()));
            }
            Ok(())
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::registry::ProjectSeed;

    fn registry() -> ProjectRegistry {
        ProjectRegistry::from_seeds(
            &[ProjectSeed {
                id: "acme".to_string(),
                reader_secret: Some("s".to_string()),
                ..Default::default()
            }],
            60,
        )
        .unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_open_mode_grants_everything() {
        let registry = ProjectRegistry::open();
        let ctx = authenticate(&registry, &HeaderMap::new(), "orders").unwrap();
        assert_eq!(ctx.project, DEFAULT_PROJECT);
        assert!(ctx.require(Scope::Write, "orders").is_ok());
    }

    #[test]
    fn test_missing_credentials() {
        assert_eq!(
            authenticate(&registry(), &HeaderMap::new(), "orders"),
            Err(ApiError::Unauthorized)
        );
    }

    #[test]
    fn test_token_scopes() {
        let registry = registry();
        let token = registry
            .issue_token("acme", vec![Scope::Read], None, 60)
            .unwrap();
        let ctx = authenticate(&registry, &bearer(&token), "orders").unwrap();
        assert_eq!(ctx.project, "acme");
        assert!(ctx.require(Scope::Read, "orders").is_ok());
        assert!(matches!(
            ctx.require(Scope::Write, "orders"),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn test_reader_key_covers_one_stream() {
        let registry = registry();
        let key = registry.reader_key("acme", "orders").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("Stream-Reader-Key", HeaderValue::from_str(&key).unwrap());
        headers.insert("Stream-Project", HeaderValue::from_static("acme"));

        let ctx = authenticate(&registry, &headers, "orders").unwrap();
        assert!(ctx.require(Scope::Read, "orders").is_ok());
        assert!(ctx.require(Scope::Write, "orders").is_err());
        assert_eq!(
            authenticate(&registry, &headers, "invoices"),
            Err(ApiError::Unauthorized)
        );
    }

    #[test]
    fn test_admin_authorization() {
        let registry = registry();
        assert!(authorize_admin(&registry, &bearer("root"), Some("root"), "acme").is_ok());
        assert!(authorize_admin(&registry, &HeaderMap::new(), Some("root"), "acme").is_err());

        let reader = registry.issue_token("acme", vec![Scope::Read], None, 60).unwrap();
        assert!(matches!(
            authorize_admin(&registry, &bearer(&reader), Some("root"), "acme"),
            Err(ApiError::Forbidden(_))
        ));
        let admin = registry.issue_token("acme", vec![Scope::Admin], None, 60).unwrap();
        assert!(authorize_admin(&registry, &bearer(&admin), None, "acme").is_ok());
        assert!(authorize_admin(&registry, &bearer(&admin), None, "globex").is_err());
    }

    #[test]
    fn test_admin_token_must_match_exactly() {
        let registry = registry();
        for near in ["roo", "rootx", "Root"] {
            assert!(
                authorize_admin(&registry, &bearer(near), Some("root"), "acme").is_err(),
                "accepted {near:?}"
            );
        }
    }
}
