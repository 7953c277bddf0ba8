use super::{NodeConfig, ServiceManifest};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Load and validate a node config from file path
    pub fn load_node_config<P: AsRef<Path>>(&self, path: P) -> Result<NodeConfig> {
        let content = read(path.as_ref())?;
        let mut config = self.parse_node_config(&content)?;

        // Relative manifest directories are relative to the config file, not the cwd
        if let (Some(dir), Some(parent)) = (config.manifest_dir.as_ref(), path.as_ref().parent()) {
            if dir.is_relative() && !parent.as_os_str().is_empty() {
                config.manifest_dir = Some(parent.join(dir));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse node config from YAML string
    pub fn parse_node_config(&self, content: &str) -> Result<NodeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Parse(format!("Failed to parse node config: {}", e)))
    }

    /// Load a single service manifest
    pub fn load_manifest<P: AsRef<Path>>(&self, path: P) -> Result<ServiceManifest> {
        let content = read(path.as_ref())?;
        let manifest: ServiceManifest = serde_yaml::from_str(&content).map_err(|e| {
            Error::Parse(format!(
                "Failed to parse manifest '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Find every `*.yaml` / `*.yml` manifest in `dir`, sorted by file name.
    /// Subdirectories are not descended into.
    pub fn scan_manifests<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|e| {
            Error::Config(format!(
                "Failed to read manifest directory '{}': {}",
                dir.display(),
                e
            ))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if is_yaml && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read '{}': {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;

    #[test]
    fn test_load_node_config_resolves_manifest_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        fs::write(
            &path,
            "role: remote\nname: host-a\nparent: 127.0.0.1:7600\nmanifest_dir: services\n",
        )
        .unwrap();

        let config = Parser::new().load_node_config(&path).unwrap();
        assert_eq!(config.role, Role::Remote);
        assert_eq!(config.manifest_dir, Some(dir.path().join("services")));
    }

    #[test]
    fn test_scan_manifests_only_yaml_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.yaml"), "name: b\nbinary: /bin/true\n").unwrap();
        fs::write(dir.path().join("a.yml"), "name: a\nbinary: /bin/true\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::create_dir(dir.path().join("nested.yaml")).unwrap();

        let parser = Parser::new();
        let found = parser.scan_manifests(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.yml", "b.yaml"]);

        let manifest = parser.load_manifest(&found[0]).unwrap();
        assert_eq!(manifest.name, "a");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let parser = Parser::new();
        assert!(parser.parse_node_config("role: mainframe\nname: x\n").is_err());
        assert!(parser.load_node_config("/definitely/not/here.yaml").is_err());
    }
}
