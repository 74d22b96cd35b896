use anyhow::{Result, anyhow};
use durastream::{
    ProjectRegistry, Scope,
    registry::{DEFAULT_TOKEN_TTL_SECS, derive_reader_key},
};

use crate::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ScopeArg {
    Read,
    Write,
    Subscribe,
    Admin,
}

impl From<ScopeArg> for Scope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Read => Scope::Read,
            ScopeArg::Write => Scope::Write,
            ScopeArg::Subscribe => Scope::Subscribe,
            ScopeArg::Admin => Scope::Admin,
        }
    }
}

/// Sign a token with a project's configured signing secret.
#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct TokenCommand {
    /// Project declared in the manifest
    pub project: String,

    /// Scopes to grant (repeatable)
    #[arg(long = "scope", value_enum, default_values_t = [ScopeArg::Read])]
    pub scopes: Vec<ScopeArg>,

    /// Restrict the token to one stream
    #[arg(long)]
    pub stream: Option<String>,

    /// Lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_TOKEN_TTL_SECS)]
    pub ttl: u64,
}

impl TokenCommand {
    pub fn execute(&self, ctx: &Context) -> Result<String> {
        let registry = registry(ctx)?;
        let scopes = self.scopes.iter().copied().map(Scope::from).collect();
        registry
            .issue_token(&self.project, scopes, self.stream.clone(), self.ttl)
            .map_err(|e| anyhow!("{e}"))
    }
}

/// Print the reader key of one stream.
#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct ReaderKeyCommand {
    /// Project declared in the manifest
    pub project: String,

    /// Stream id
    pub stream: String,
}

impl ReaderKeyCommand {
    pub fn execute(&self, ctx: &Context) -> Result<String> {
        let seed = ctx
            .manifest
            .options
            .projects
            .iter()
            .find(|p| p.id == self.project)
            .ok_or_else(|| anyhow!("Project {} is not declared in the manifest", self.project))?;
        let secret = seed.reader_secret.as_deref().ok_or_else(|| {
            anyhow!(
                "Project {} has no readerSecret; reader keys are only stable with one",
                self.project
            )
        })?;
        Ok(derive_reader_key(secret, &self.stream))
    }
}

fn registry(ctx: &Context) -> Result<ProjectRegistry> {
    let options = &ctx.manifest.options;
    if options.projects.is_empty() {
        return Err(anyhow!(
            "No projects in the manifest; the server runs in open mode and needs no tokens"
        ));
    }
    ProjectRegistry::from_seeds(&options.projects, options.key_rotation_grace_secs)
        .map_err(|e| anyhow!("{e}"))
}

#[cfg(test)]
mod tests {
    use durastream::{ProjectSeed, ServerOptions};

    use super::*;
    use crate::manifest::Manifest;

    fn ctx() -> Context {
        Context {
            manifest: Manifest {
                options: ServerOptions {
                    projects: vec![ProjectSeed {
                        id: "acme".into(),
                        signing_secret: Some("sign".into()),
                        reader_secret: Some("read".into()),
                        cors_origins: vec![],
                    }],
                    ..Default::default()
                },
            },
        }
    }

    #[test]
    fn test_token_verifies_against_same_seed() {
        let ctx = ctx();
        let token = TokenCommand {
            project: "acme".into(),
            scopes: vec![ScopeArg::Write],
            stream: None,
            ttl: 60,
        }
        .execute(&ctx)
        .unwrap();

        let claims = registry(&ctx).unwrap().verify_token(&token).unwrap();
        assert_eq!(claims.sub, "acme");
        assert_eq!(claims.scope, vec![Scope::Write]);
    }

    #[test]
    fn test_reader_key_matches_registry() {
        let ctx = ctx();
        let key = ReaderKeyCommand {
            project: "acme".into(),
            stream: "orders".into(),
        }
        .execute(&ctx)
        .unwrap();
        assert!(registry(&ctx).unwrap().verify_reader_key("acme", "orders", &key));
    }

    #[test]
    fn test_open_mode_has_no_tokens() {
        let ctx = Context {
            manifest: Manifest::default(),
        };
        let err = TokenCommand {
            project: "default".into(),
            scopes: vec![ScopeArg::Read],
            stream: None,
            ttl: 60,
        }
        .execute(&ctx)
        .unwrap_err();
        assert!(err.to_string().contains("open mode"));
    }
}
