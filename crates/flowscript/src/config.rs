//! Host Configuration
//!
//! Settings for the flow runner, layered from built-in defaults, a
//! `flowscript.toml` file and `FLOWSCRIPT_*` environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use flowscript_engine::EngineConfig;

/// Config file read when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "flowscript.toml";

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Settings passed to every script node
    #[serde(default)]
    pub engine: EngineConfig,

    /// Directory holding `<module>.json` and `<module>.js` files
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// Wildcard patterns of module identifiers scripts may load; empty allows all
    #[serde(default)]
    pub module_allowlist: Vec<String>,

    /// Values served to scripts through `env.get` and `host.getSetting`
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            modules_dir: default_modules_dir(),
            module_allowlist: Vec::new(),
            settings: HashMap::new(),
        }
    }
}

impl HostConfig {
    /// Load configuration from `path`, or `flowscript.toml` when `None`
    ///
    /// A missing file is not an error; defaults and environment still apply.
    /// Nested keys use a double underscore, e.g. `FLOWSCRIPT_ENGINE__PRECOMPILE`.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let file = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::figment(&file).extract()
    }

    fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(HostConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("FLOWSCRIPT_").split("__"))
    }

    /// Resolve `modules_dir` against the directory of the flow file
    pub fn modules_dir_for(&self, flow_path: &Path) -> PathBuf {
        if self.modules_dir.is_absolute() {
            return self.modules_dir.clone();
        }
        match flow_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(&self.modules_dir),
            _ => self.modules_dir.clone(),
        }
    }
}
