//! Runtime configuration (SPEC_FULL.md §4.7): resolved from an explicit
//! path, an OCI annotation, `$KATA_CONF_FILE`, or a built-in default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const KATA_CONF_FILE_ENV: &str = "KATA_CONF_FILE";
const DEFAULT_CONFIG_PATHS: &[&str] =
    &["/etc/kata-containers/configuration.toml", "/usr/share/defaults/kata-containers/configuration.toml"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_hypervisor_path")]
    pub hypervisor_path: String,
    #[serde(default = "default_vcpus")]
    pub default_vcpus: u32,
    #[serde(default = "default_memory_mb")]
    pub default_memory_mb: u32,
    #[serde(default = "default_vsock_port")]
    pub guest_agent_vsock_port: u32,
    #[serde(default)]
    pub cgroup_path_template: String,
    #[serde(default)]
    pub debug_console_enabled: bool,
    #[serde(default = "default_oom_marker_dir")]
    pub oom_marker_dir: String,
}

fn default_hypervisor_path() -> String {
    "/usr/bin/cloud-hypervisor".to_string()
}

fn default_vcpus() -> u32 {
    1
}

fn default_memory_mb() -> u32 {
    256
}

fn default_vsock_port() -> u32 {
    1024
}

fn default_oom_marker_dir() -> String {
    "/run/kata-containers/oom".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            hypervisor_path: default_hypervisor_path(),
            default_vcpus: default_vcpus(),
            default_memory_mb: default_memory_mb(),
            guest_agent_vsock_port: default_vsock_port(),
            cgroup_path_template: String::new(),
            debug_console_enabled: false,
            oom_marker_dir: default_oom_marker_dir(),
        }
    }
}

impl RuntimeConfig {
    /// Mirrors the resolution order `create` uses: explicit shimv2
    /// option path, then OCI annotation path, then `$KATA_CONF_FILE`,
    /// then the built-in default list. The first path that exists wins;
    /// if none exist, the compiled-in defaults are used.
    pub fn resolve(
        explicit_path: Option<&str>,
        annotation_path: Option<&str>,
    ) -> std::io::Result<Self> {
        let candidates: Vec<PathBuf> = explicit_path
            .map(PathBuf::from)
            .into_iter()
            .chain(annotation_path.map(PathBuf::from))
            .chain(std::env::var(KATA_CONF_FILE_ENV).ok().map(PathBuf::from))
            .chain(DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from))
            .collect();

        for path in &candidates {
            if path.exists() {
                return Self::from_file(path);
            }
        }
        Ok(Self::default())
    }

    pub fn from_env() -> Self {
        Self::resolve(None, None).unwrap_or_default()
    }

    fn from_file(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_configured() {
        std::env::remove_var(KATA_CONF_FILE_ENV);
        let config = RuntimeConfig::resolve(None, None).unwrap();
        assert_eq!(config.default_vcpus, 1);
        assert_eq!(config.guest_agent_vsock_port, 1024);
    }

    #[test]
    fn explicit_path_wins_over_annotation() {
        let dir = std::env::temp_dir().join(format!("shim-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let explicit = dir.join("explicit.toml");
        std::fs::write(&explicit, "default_vcpus = 4\n").unwrap();
        let annotation = dir.join("annotation.toml");
        std::fs::write(&annotation, "default_vcpus = 8\n").unwrap();

        let config =
            RuntimeConfig::resolve(Some(explicit.to_str().unwrap()), Some(annotation.to_str().unwrap()))
                .unwrap();
        assert_eq!(config.default_vcpus, 4);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
