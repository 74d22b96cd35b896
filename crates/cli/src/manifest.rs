use std::{env, fs, path::Path};

use anyhow::{Context as _, Result, bail};
use durastream::ServerOptions;

/// Server manifest (durastream.yaml).
///
/// The file holds [`ServerOptions`] in camelCase. `${NAME}` anywhere in the
/// text is replaced by the environment variable `NAME` before parsing, so
/// secrets can live in `.env` instead of the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub options: ServerOptions,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env(content, |name| env::var(name).ok())?;
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        let options = serde_yml::from_str(&expanded)?;
        Ok(Self { options })
    }
}

fn expand_env(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            bail!("Unterminated ${{...}} reference");
        };
        let name = &after[..end];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => bail!("Environment variable {name} is not set"),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
