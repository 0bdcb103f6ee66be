//! Runner configuration (optional TOML file passed with `--config`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Runner configuration (TOML).
///
/// Every field has a default, so an empty file (or no file at all) is a
/// valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Default wall-clock limit for a local step command, in seconds.
    pub step_timeout_secs: u64,

    /// Keep at most this many trailing bytes of step output in memory.
    pub step_output_limit_bytes: usize,

    /// Upper bound for the rendered repair prompt.
    pub prompt_budget_bytes: usize,

    pub sandbox: SandboxConfig,
}

/// Settings for the containerized repair agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    /// Working directory inside the container; the repo and job dir mount below it.
    pub workdir: String,
    pub user: Option<String>,
    /// Memory cap in docker syntax (e.g. `2g`).
    pub memory: String,
    /// CPU quota in cores.
    pub cpus: f64,
    pub pids_limit: u32,
    /// Docker network mode (`none`, `bridge`, ...). Daemon default when unset.
    pub network: Option<String>,
    pub timeout_secs: u64,
    /// Entrypoint override; the first element replaces the image entrypoint and
    /// the rest are prepended to `command`.
    pub entrypoint: Option<Vec<String>>,
    /// Agent argv. The prompt arrives on stdin.
    pub command: Vec<String>,
    /// Host variables copied into the sandbox when set. Nothing else leaks in.
    pub env_passthrough: Vec<String>,
    /// Fixed variables for the sandbox. Override passthrough values.
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "local/codex-cli:latest".to_string(),
            workdir: "/workspace".to_string(),
            user: Some("node".to_string()),
            memory: "2g".to_string(),
            cpus: 2.0,
            pids_limit: 512,
            network: None,
            timeout_secs: 180,
            entrypoint: None,
            command: ["entrypoint.sh", "run", "prompt", "--format", "diff", "--stdin"]
                .into_iter()
                .map(String::from)
                .collect(),
            env_passthrough: ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"]
                .into_iter()
                .map(String::from)
                .collect(),
            env: BTreeMap::new(),
            labels: BTreeMap::from([("app".to_string(), "codex-cli".to_string())]),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 60 * 60,
            step_output_limit_bytes: 1_000_000,
            prompt_budget_bytes: 16_000,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.step_output_limit_bytes == 0 {
            return Err(anyhow!("step_output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        self.sandbox.validate()
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(anyhow!("sandbox.image must not be empty"));
        }
        if !self.workdir.starts_with('/') {
            return Err(anyhow!("sandbox.workdir must be an absolute path"));
        }
        if !(self.cpus.is_finite() && self.cpus > 0.0) {
            return Err(anyhow!("sandbox.cpus must be > 0"));
        }
        if self.pids_limit == 0 {
            return Err(anyhow!("sandbox.pids_limit must be > 0"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("sandbox.command must be a non-empty array"));
        }
        if let Some(entrypoint) = &self.entrypoint
            && entrypoint.first().is_none_or(|e| e.trim().is_empty())
        {
            return Err(anyhow!("sandbox.entrypoint must be a non-empty array"));
        }
        Ok(())
    }

    /// Resolve the sandbox environment from the allow-list and fixed values.
    ///
    /// `lookup` is the host environment; unset variables are skipped.
    pub fn resolve_env<F>(&self, lookup: F) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = BTreeMap::new();
        for key in &self.env_passthrough {
            if let Some(value) = lookup(key) {
                env.insert(key.clone(), value);
            }
        }
        for (key, value) in &self.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

/// Load config from a TOML file. The file must exist.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RunnerConfig::default().validate().expect("valid defaults");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("qchain.toml");
        fs::write(
            &path,
            "step_timeout_secs = 60\n[sandbox]\nimage = \"agent:dev\"\nnetwork = \"none\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.step_timeout_secs, 60);
        assert_eq!(cfg.sandbox.image, "agent:dev");
        assert_eq!(cfg.sandbox.network.as_deref(), Some("none"));
        assert_eq!(cfg.sandbox.pids_limit, 512);
        assert_eq!(cfg.prompt_budget_bytes, 16_000);
    }

    #[test]
    fn rejects_empty_agent_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("qchain.toml");
        fs::write(&path, "[sandbox]\ncommand = []\n").expect("write");

        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("sandbox.command"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_config(&temp.path().join("missing.toml")).is_err());
    }

    #[test]
    fn env_is_allow_list_only() {
        let cfg = SandboxConfig {
            env_passthrough: vec!["HTTP_PROXY".to_string(), "UNSET".to_string()],
            env: BTreeMap::from([("MODE".to_string(), "ci".to_string())]),
            ..SandboxConfig::default()
        };
        let env = cfg.resolve_env(|key| match key {
            "HTTP_PROXY" => Some("http://proxy:3128".to_string()),
            "HOME" => Some("/root".to_string()),
            _ => None,
        });
        assert_eq!(
            env,
            BTreeMap::from([
                ("HTTP_PROXY".to_string(), "http://proxy:3128".to_string()),
                ("MODE".to_string(), "ci".to_string()),
            ])
        );
    }
}
