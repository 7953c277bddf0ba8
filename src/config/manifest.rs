//! Service manifests.
//!
//! Each supervised service is described by one YAML file:
//!
//! ```yaml
//! name: billing
//! aliases: [bill]
//! language: python
//! binary: ./billing/main.py
//! args: ["--port", "9000"]
//! env:
//!   LOG_LEVEL: debug
//! server: true
//! ```

use crate::error::{Error, Result};
use crate::service::{LaunchKind, LaunchSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Implementation language of a service, which decides how it is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Binary,
    Go,
    Python,
    Node,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub language: Language,

    /// Executable (binary/go) or entry script (python/node).
    pub binary: PathBuf,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Append stdout/stderr here instead of inheriting the node's streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Override for the python/node interpreter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<PathBuf>,

    #[serde(default)]
    pub server: bool,

    #[serde(default)]
    pub client: bool,
}

impl ServiceManifest {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("service manifest has an empty name".to_string()));
        }
        if self.binary.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "service '{}' does not name a binary",
                self.name
            )));
        }
        if self.aliases.iter().any(|a| a == &self.name) {
            return Err(Error::Config(format!(
                "service '{}' lists its own name as an alias",
                self.name
            )));
        }
        Ok(())
    }

    /// Build the launch description, resolving relative paths against `base_dir`
    /// (the directory the manifest was loaded from).
    pub fn launch_spec(&self, base_dir: &Path) -> LaunchSpec {
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };

        let program = resolve(&self.binary);
        let kind = match self.language {
            Language::Binary => LaunchKind::Binary { path: program },
            Language::Go => LaunchKind::Go { binary: program },
            Language::Python => LaunchKind::Python {
                interpreter: self
                    .interpreter
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("python3")),
                script: program,
            },
            Language::Node => LaunchKind::Node {
                runtime: self
                    .interpreter
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("node")),
                script: program,
            },
        };

        LaunchSpec {
            kind,
            args: self.args.clone(),
            env: self.env.clone(),
            work_dir: Some(
                self.cwd
                    .as_deref()
                    .map(resolve)
                    .unwrap_or_else(|| base_dir.to_path_buf()),
            ),
            log_file: self.log_file.as_deref().map(resolve),
        }
    }
}
