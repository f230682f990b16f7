//! Filesystem Module Resolver
//!
//! Resolves module identifiers to files under a modules directory:
//! `<id>.json` is bound as data, `<id>.js` is evaluated CommonJS-style.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use wildmatch::WildMatch;

use flowscript_engine::{ModuleExport, ModuleResolver};

pub struct FsModuleResolver {
    dir: PathBuf,
    allowlist: Vec<WildMatch>,
}

impl FsModuleResolver {
    /// Resolver over `dir`; an empty allowlist admits every identifier
    pub fn new(dir: impl Into<PathBuf>, allowlist: &[String]) -> Self {
        Self {
            dir: dir.into(),
            allowlist: allowlist.iter().map(|p| WildMatch::new(p)).collect(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_allowed(&self, identifier: &str) -> bool {
        self.allowlist.is_empty() || self.allowlist.iter().any(|m| m.matches(identifier))
    }

    /// Identifiers may use `/` for scopes but never leave the modules directory
    fn relative_path(identifier: &str) -> Option<PathBuf> {
        let path = Path::new(identifier);
        let contained = !identifier.is_empty()
            && path.components().all(|c| matches!(c, Component::Normal(_)));
        contained.then(|| path.to_path_buf())
    }
}

#[async_trait]
impl ModuleResolver for FsModuleResolver {
    async fn resolve(&self, identifier: &str) -> Result<ModuleExport, String> {
        if !self.is_allowed(identifier) {
            return Err(format!("Module '{}' is not in the allowlist", identifier));
        }
        let relative =
            Self::relative_path(identifier).ok_or_else(|| format!("Invalid module identifier '{}'", identifier))?;
        let base = self.dir.join(relative);

        let json = base.with_extension("json");
        if fs::try_exists(&json).await.unwrap_or(false) {
            debug!("Resolving module '{}' from {}", identifier, json.display());
            let text = fs::read_to_string(&json).await.map_err(|e| e.to_string())?;
            let value = serde_json::from_str(&text).map_err(|e| format!("Invalid JSON in {}: {}", json.display(), e))?;
            return Ok(ModuleExport::Json(value));
        }

        let script = base.with_extension("js");
        if fs::try_exists(&script).await.unwrap_or(false) {
            debug!("Resolving module '{}' from {}", identifier, script.display());
            let source = fs::read_to_string(&script).await.map_err(|e| e.to_string())?;
            return Ok(ModuleExport::Script(source));
        }

        Err(format!("Cannot find module '{}' in {}", identifier, self.dir.display()))
    }
}
