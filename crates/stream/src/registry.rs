//! Project registry.
//!
//! A project is the tenant boundary: it owns its streams, its CORS policy, the
//! keys that sign its access tokens and the secret its reader keys derive
//! from. Signing keys rotate with an overlap: after a rotation the previous key
//! keeps verifying tokens until its grace deadline passes.
//!
//! With no projects configured the registry runs in open mode: every request
//! belongs to [`DEFAULT_PROJECT`] with all scopes, like an unconfigured secret
//! meaning "no auth".

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::ApiError;

/// Project used for every request in open mode.
pub const DEFAULT_PROJECT: &str = "default";

/// Default overlap during which a rotated-out key still verifies.
pub const DEFAULT_ROTATION_GRACE_SECS: u64 = 300;

/// Default lifetime of issued tokens.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Subscribe,
    Admin,
}

impl Scope {
    pub const ALL: [Scope; 4] = [Scope::Read, Scope::Write, Scope::Subscribe, Scope::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Read => "read",
            Scope::Write => "write",
            Scope::Subscribe => "subscribe",
            Scope::Admin => "admin",
        }
    }
}

/// Claims carried by project access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Project id.
    pub sub: String,
    pub scope: Vec<Scope>,
    /// Restricts the token to one stream when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Initial definition of a project, usually from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSeed {
    pub id: String,
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default)]
    pub reader_secret: Option<String>,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
struct SigningKey {
    kid: String,
    secret: String,
    /// Set once the key has been rotated out.
    valid_until: Option<DateTime<Utc>>,
}

impl SigningKey {
    fn generate(project: &str) -> Self {
        Self::with_secret(project, random_secret())
    }

    /// The kid is derived from the secret, so a configured secret keeps the
    /// same kid across restarts and tokens signed elsewhere still resolve.
    fn with_secret(project: &str, secret: String) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"kid:");
        hasher.update(secret.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self {
            kid: format!("{project}:{}", &digest[..12]),
            secret,
            valid_until: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Project {
    id: String,
    cors_origins: Vec<String>,
    current: SigningKey,
    prior: Option<SigningKey>,
    reader_secret: String,
    created_at: DateTime<Utc>,
}

impl Project {
    fn key_for(&self, kid: &str, now: DateTime<Utc>) -> Option<&SigningKey> {
        if self.current.kid == kid {
            return Some(&self.current);
        }
        self.prior
            .as_ref()
            .filter(|k| k.kid == kid && k.valid_until.is_some_and(|until| now < until))
    }

    fn view(&self) -> ProjectView {
        ProjectView {
            id: self.id.clone(),
            cors_origins: self.cors_origins.clone(),
            current_kid: self.current.kid.clone(),
            prior_kid: self.prior.as_ref().map(|k| k.kid.clone()),
            prior_valid_until: self.prior.as_ref().and_then(|k| k.valid_until),
            created_at: self.created_at,
        }
    }
}

/// Public description of a project. Never carries secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectView {
    pub id: String,
    pub cors_origins: Vec<String>,
    pub current_kid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Returned once at creation; the only time secrets leave the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCredentials {
    #[serde(flatten)]
    pub project: ProjectView,
    pub signing_secret: String,
    pub reader_secret: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotatedKey {
    pub kid: String,
    pub signing_secret: String,
    pub prior_kid: String,
    pub prior_valid_until: DateTime<Utc>,
}

/// Decoding keys built on first use per `(project, kid)`.
#[derive(Default)]
pub struct VerifierCache {
    keys: RwLock<HashMap<(String, String), DecodingKey>>,
}

impl VerifierCache {
    fn get_or_build(&self, project: &str, key: &SigningKey) -> DecodingKey {
        let id = (project.to_string(), key.kid.clone());
        if let Some(found) = self.keys.read().get(&id) {
            return found.clone();
        }
        let built = DecodingKey::from_secret(key.secret.as_bytes());
        self.keys.write().insert(id, built.clone());
        built
    }

    fn evict(&self, project: &str, kid: &str) {
        self.keys
            .write()
            .remove(&(project.to_string(), kid.to_string()));
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ProjectRegistry {
    projects: RwLock<HashMap<String, Project>>,
    verifiers: VerifierCache,
    grace: TimeDelta,
    open: bool,
}

impl ProjectRegistry {
    /// Registry in open mode.
    pub fn open() -> Self {
        let registry = Self::build(DEFAULT_ROTATION_GRACE_SECS, true);
        registry.projects.write().insert(
            DEFAULT_PROJECT.to_string(),
            new_project(DEFAULT_PROJECT, None, None, Vec::new()),
        );
        registry
    }

    /// Registry seeded with `seeds`; open mode when `seeds` is empty.
    pub fn from_seeds(seeds: &[ProjectSeed], grace_secs: u64) -> Result<Self, ApiError> {
        if seeds.is_empty() {
            let mut registry = Self::open();
            registry.grace = TimeDelta::seconds(grace_secs as i64);
            return Ok(registry);
        }

        let registry = Self::build(grace_secs, false);
        for seed in seeds {
            registry.insert(
                &seed.id,
                seed.signing_secret.clone(),
                seed.reader_secret.clone(),
                seed.cors_origins.clone(),
            )?;
        }
        info!(projects = seeds.len(), "Project registry seeded");
        Ok(registry)
    }

    fn build(grace_secs: u64, open: bool) -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            verifiers: VerifierCache::default(),
            grace: TimeDelta::seconds(grace_secs as i64),
            open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn verifiers(&self) -> &VerifierCache {
        &self.verifiers
    }

    pub fn create(&self, id: &str, cors_origins: Vec<String>) -> Result<ProjectCredentials, ApiError> {
        self.insert(id, None, None, cors_origins)
    }

    fn insert(
        &self,
        id: &str,
        signing_secret: Option<String>,
        reader_secret: Option<String>,
        cors_origins: Vec<String>,
    ) -> Result<ProjectCredentials, ApiError> {
        validate_project_id(id)?;

        let mut projects = self.projects.write();
        if projects.contains_key(id) {
            return Err(ApiError::AlreadyExists(format!("project {id}")));
        }
        let project = new_project(id, signing_secret, reader_secret, cors_origins);
        let credentials = ProjectCredentials {
            project: project.view(),
            signing_secret: project.current.secret.clone(),
            reader_secret: project.reader_secret.clone(),
        };
        projects.insert(id.to_string(), project);
        info!(project = %id, "Created project");
        Ok(credentials)
    }

    pub fn get(&self, id: &str) -> Result<ProjectView, ApiError> {
        self.projects
            .read()
            .get(id)
            .map(Project::view)
            .ok_or_else(|| ApiError::not_found(format!("project {id}")))
    }

    pub fn list(&self) -> Vec<ProjectView> {
        let mut views: Vec<_> = self.projects.read().values().map(Project::view).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Replace the signing key. The outgoing key keeps verifying until
    /// `now + grace`; a key rotated out earlier is dropped.
    pub fn rotate_signing_key(&self, id: &str) -> Result<RotatedKey, ApiError> {
        self.rotate_signing_key_at(id, Utc::now())
    }

    fn rotate_signing_key_at(&self, id: &str, now: DateTime<Utc>) -> Result<RotatedKey, ApiError> {
        let mut projects = self.projects.write();
        let project = projects
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found(format!("project {id}")))?;

        let mut outgoing = std::mem::replace(&mut project.current, SigningKey::generate(id));
        let valid_until = now + self.grace;
        outgoing.valid_until = Some(valid_until);

        if let Some(dropped) = project.prior.replace(outgoing.clone()) {
            self.verifiers.evict(id, &dropped.kid);
        }

        info!(
            project = %id,
            kid = %project.current.kid,
            prior_kid = %outgoing.kid,
            prior_valid_until = %valid_until,
            "Rotated signing key"
        );
        Ok(RotatedKey {
            kid: project.current.kid.clone(),
            signing_secret: project.current.secret.clone(),
            prior_kid: outgoing.kid,
            prior_valid_until: valid_until,
        })
    }

    pub fn update_cors(&self, id: &str, origins: Vec<String>) -> Result<ProjectView, ApiError> {
        let mut projects = self.projects.write();
        let project = projects
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found(format!("project {id}")))?;
        project.cors_origins = origins;
        debug!(project = %id, origins = ?project.cors_origins, "Updated CORS origins");
        Ok(project.view())
    }

    /// Whether any project allows `origin`.
    pub fn cors_allows(&self, origin: &str) -> bool {
        if self.open {
            return true;
        }
        self.projects
            .read()
            .values()
            .any(|p| p.cors_origins.iter().any(|o| o == "*" || o == origin))
    }

    pub fn issue_token(
        &self,
        id: &str,
        scope: Vec<Scope>,
        stream: Option<String>,
        ttl_secs: u64,
    ) -> Result<String, ApiError> {
        let (kid, secret) = {
            let projects = self.projects.read();
            let project = projects
                .get(id)
                .ok_or_else(|| ApiError::not_found(format!("project {id}")))?;
            (project.current.kid.clone(), project.current.secret.clone())
        };

        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            sub: id.to_string(),
            scope,
            stream,
            iat: now,
            exp: now + ttl_secs as i64,
        };
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid);

        encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .map_err(|e| ApiError::internal(format!("failed to sign token: {e}")))
    }

    pub fn verify_token(&self, token: &str) -> Result<TokenClaims, ApiError> {
        self.verify_token_at(token, Utc::now())
    }

    fn verify_token_at(&self, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, ApiError> {
        let header = decode_header(token).map_err(|_| ApiError::Unauthorized)?;
        let kid = header.kid.ok_or(ApiError::Unauthorized)?;
        let (project_id, _) = kid.rsplit_once(':').ok_or(ApiError::Unauthorized)?;

        let decoding_key = {
            let projects = self.projects.read();
            let project = projects.get(project_id).ok_or(ApiError::Unauthorized)?;
            let key = project.key_for(&kid, now).ok_or_else(|| {
                debug!(project = %project_id, kid = %kid, "Token signed by unknown or retired key");
                ApiError::Unauthorized
            })?;
            self.verifiers.get_or_build(project_id, key)
        };

        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<TokenClaims>(token, &decoding_key, &validation).map_err(|e| {
            warn!(project = %project_id, error = %e, "Rejected token");
            ApiError::Unauthorized
        })?;

        if data.claims.sub != project_id {
            return Err(ApiError::Unauthorized);
        }
        Ok(data.claims)
    }

    /// Read-only key for one stream: hex(sha256(reader_secret ":" stream)).
    pub fn reader_key(&self, id: &str, stream: &str) -> Result<String, ApiError> {
        let projects = self.projects.read();
        let project = projects
            .get(id)
            .ok_or_else(|| ApiError::not_found(format!("project {id}")))?;
        Ok(derive_reader_key(&project.reader_secret, stream))
    }

    pub fn verify_reader_key(&self, id: &str, stream: &str, presented: &str) -> bool {
        self.reader_key(id, stream)
            .is_ok_and(|expected| constant_time_eq(expected.as_bytes(), presented.as_bytes()))
    }
}

fn new_project(
    id: &str,
    signing_secret: Option<String>,
    reader_secret: Option<String>,
    cors_origins: Vec<String>,
) -> Project {
    Project {
        id: id.to_string(),
        cors_origins,
        current: match signing_secret {
            Some(secret) => SigningKey::with_secret(id, secret),
            None => SigningKey::generate(id),
        },
        prior: None,
        reader_secret: reader_secret.unwrap_or_else(random_secret),
        created_at: Utc::now(),
    }
}

fn validate_project_id(id: &str) -> Result<(), ApiError> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(ApiError::InvalidRequest(format!(
            "Project id must be 1-64 characters of [A-Za-z0-9_-], got {id:?}"
        )));
    }
    Ok(())
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn derive_reader_key(secret: &str, stream: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(stream.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProjectRegistry {
        ProjectRegistry::from_seeds(
            &[ProjectSeed {
                id: "acme".to_string(),
                signing_secret: Some("acme-secret".to_string()),
                reader_secret: Some("reader-secret".to_string()),
                cors_origins: vec!["https://acme.test".to_string()],
            }],
            60,
        )
        .unwrap()
    }

    #[test]
    fn test_open_mode() {
        let registry = ProjectRegistry::from_seeds(&[], 60).unwrap();
        assert!(registry.is_open());
        assert!(registry.get(DEFAULT_PROJECT).is_ok());
        assert!(registry.cors_allows("https://anything.test"));
    }

    #[test]
    fn test_create_and_get() {
        let registry = registry();
        let created = registry.create("globex", vec![]).unwrap();
        assert_eq!(created.project.id, "globex");
        assert_eq!(created.signing_secret.len(), 64);
        assert!(matches!(
            registry.create("globex", vec![]),
            Err(ApiError::AlreadyExists(_))
        ));
        assert!(registry.create("bad:id", vec![]).is_err());
        assert!(registry.get("missing").is_err());
    }

    #[test]
    fn test_token_round_trip() {
        let registry = registry();
        let token = registry
            .issue_token("acme", vec![Scope::Read, Scope::Write], None, 60)
            .unwrap();
        let claims = registry.verify_token(&token).unwrap();
        assert_eq!(claims.sub, "acme");
        assert_eq!(claims.scope, vec![Scope::Read, Scope::Write]);
        assert_eq!(registry.verifiers().len(), 1);

        assert!(registry.verify_token("not-a-jwt").is_err());
    }

    #[test]
    fn test_configured_secret_survives_restart() {
        let token = registry().issue_token("acme", vec![Scope::Read], None, 60).unwrap();
        let restarted = registry();
        assert_eq!(restarted.verify_token(&token).unwrap().sub, "acme");
    }

    #[test]
    fn test_tampered_token_rejected() {
        let registry = registry();
        let token = registry.issue_token("acme", vec![Scope::Read], None, 60).unwrap();
        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        parts[2] = parts[2].chars().rev().collect();
        assert!(registry.verify_token(&parts.join(".")).is_err());
    }

    #[test]
    fn test_rotation_grace() {
        let registry = registry();
        let old_token = registry.issue_token("acme", vec![Scope::Read], None, 3600).unwrap();

        let now = Utc::now();
        let rotated = registry.rotate_signing_key_at("acme", now).unwrap();
        assert_eq!(rotated.prior_valid_until, now + TimeDelta::seconds(60));

        // Within grace both keys verify.
        assert!(registry.verify_token_at(&old_token, now + TimeDelta::seconds(30)).is_ok());
        let new_token = registry.issue_token("acme", vec![Scope::Read], None, 3600).unwrap();
        assert!(registry.verify_token_at(&new_token, now).is_ok());

        // After grace only the new key does.
        let later = now + TimeDelta::seconds(61);
        assert!(matches!(
            registry.verify_token_at(&old_token, later),
            Err(ApiError::Unauthorized)
        ));
        assert!(registry.verify_token_at(&new_token, later).is_ok());
    }

    #[test]
    fn test_second_rotation_drops_oldest_key() {
        let registry = registry();
        let first = registry.issue_token("acme", vec![Scope::Read], None, 3600).unwrap();
        registry.verify_token(&first).unwrap();
        registry.rotate_signing_key("acme").unwrap();
        registry.rotate_signing_key("acme").unwrap();

        assert!(registry.verify_token(&first).is_err());
        let view = registry.get("acme").unwrap();
        assert!(view.prior_kid.is_some());
    }

    #[test]
    fn test_reader_key_is_per_stream() {
        let registry = registry();
        let key = registry.reader_key("acme", "orders").unwrap();
        assert_eq!(key, derive_reader_key("reader-secret", "orders"));
        assert!(registry.verify_reader_key("acme", "orders", &key));
        assert!(!registry.verify_reader_key("acme", "invoices", &key));
        assert!(!registry.verify_reader_key("globex", "orders", &key));
    }

    #[test]
    fn test_cors() {
        let registry = registry();
        assert!(registry.cors_allows("https://acme.test"));
        assert!(!registry.cors_allows("https://evil.test"));
        registry
            .update_cors("acme", vec!["https://evil.test".to_string()])
            .unwrap();
        assert!(registry.cors_allows("https://evil.test"));
    }
}
