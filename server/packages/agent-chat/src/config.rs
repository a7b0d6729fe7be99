use std::path::{Path, PathBuf};
use std::time::SystemTime;

use agent_chat_process::LaunchSpec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub const CONFIG_ENV: &str = "AGENT_CHAT_CONFIG";
const REDACTED: &str = "********";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Settings for launching and talking to the agent.
///
/// A new value replaces the previous one wholesale whenever the settings file
/// changes; nothing here is ever written back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub python_path: String,
    pub agent_path: PathBuf,
    pub workspace: PathBuf,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub ask_permission: bool,
    pub max_turns: u32,
    pub enable_logging: bool,
    pub logs_path: Option<PathBuf>,
    pub carry_partial_lines: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            python_path: "python".to_string(),
            agent_path: PathBuf::new(),
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            openai_api_key: None,
            anthropic_api_key: None,
            ask_permission: true,
            max_turns: 200,
            enable_logging: true,
            logs_path: None,
            carry_partial_lines: false,
        }
    }
}

impl AgentConfig {
    pub fn from_toml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml_edit::de::from_str(raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn openai_api_key(&self) -> Option<&str> {
        non_empty(self.openai_api_key.as_deref())
    }

    pub fn anthropic_api_key(&self) -> Option<&str> {
        non_empty(self.anthropic_api_key.as_deref())
    }

    pub fn has_credentials(&self) -> bool {
        self.openai_api_key().is_some() || self.anthropic_api_key().is_some()
    }

    /// `<python> <agent> --workspace <dir> [--needs-permission] [--logs-path <file>]`,
    /// run inside the workspace with credentials exported.
    pub fn launch_spec(&self) -> LaunchSpec {
        let mut launch = LaunchSpec::new(&self.python_path)
            .arg(self.agent_path.to_string_lossy())
            .arg("--workspace")
            .arg(self.workspace.to_string_lossy())
            .current_dir(&self.workspace);
        if self.ask_permission {
            launch = launch.arg("--needs-permission");
        }
        if let Some(logs_path) = &self.logs_path {
            launch = launch
                .arg("--logs-path")
                .arg(logs_path.to_string_lossy());
        }
        if let Some(key) = self.openai_api_key() {
            launch = launch.env("OPENAI_API_KEY", key);
        }
        if let Some(key) = self.anthropic_api_key() {
            launch = launch.env("ANTHROPIC_API_KEY", key);
        }
        launch
    }

    pub fn redacted(&self) -> RedactedConfig {
        RedactedConfig {
            python_path: self.python_path.clone(),
            agent_path: self.agent_path.to_string_lossy().into_owned(),
            workspace: self.workspace.to_string_lossy().into_owned(),
            openai_api_key: self.openai_api_key().map(|_| REDACTED.to_string()),
            anthropic_api_key: self.anthropic_api_key().map(|_| REDACTED.to_string()),
            ask_permission: self.ask_permission,
            max_turns: self.max_turns,
            enable_logging: self.enable_logging,
            logs_path: self
                .logs_path
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
            carry_partial_lines: self.carry_partial_lines,
        }
    }
}

/// Configuration safe to show in the UI and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedactedConfig {
    pub python_path: String,
    pub agent_path: String,
    pub workspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    pub ask_permission: bool,
    pub max_turns: u32,
    pub enable_logging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_path: Option<String>,
    pub carry_partial_lines: bool,
}

/// Where settings come from: a TOML file plus an optional workspace override
/// from the command line.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    workspace_override: Option<PathBuf>,
}

impl ConfigSource {
    pub fn new(path: PathBuf, workspace_override: Option<PathBuf>) -> Self {
        Self {
            path,
            workspace_override,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the settings file; a missing file yields the defaults.
    pub fn load(&self) -> Result<AgentConfig, ConfigError> {
        let mut config = match std::fs::read_to_string(&self.path) {
            Ok(raw) => AgentConfig::from_toml(&raw, &self.path)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "settings file not found, using defaults");
                AgentConfig::default()
            }
            Err(err) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };
        if let Some(workspace) = &self.workspace_override {
            config.workspace = workspace.clone();
        }
        Ok(config)
    }

    pub fn modified_at(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .ok()
    }
}

pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs::data_dir()
        .map(|dir| dir.join("agent-chat").join("settings.toml"))
        .unwrap_or_else(|| PathBuf::from(".").join(".agent-chat").join("settings.toml"))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = ConfigSource::new(dir.path().join("settings.toml"), None);
        let config = source.load().expect("load");
        assert_eq!(config.python_path, "python");
        assert!(config.agent_path.as_os_str().is_empty());
        assert!(config.ask_permission);
        assert_eq!(config.max_turns, 200);
        assert!(config.enable_logging);
        assert!(!config.carry_partial_lines);
    }

    #[test]
    fn parses_partial_settings_and_applies_override() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "python_path = \"python3\"\nagent_path = \"/opt/agent/cli.py\"\nask_permission = false\nanthropic_api_key = \"sk-ant-test\"\n",
        )
        .expect("write settings");

        let source = ConfigSource::new(path, Some(PathBuf::from("/tmp/project")));
        let config = source.load().expect("load");
        assert_eq!(config.python_path, "python3");
        assert_eq!(config.agent_path, PathBuf::from("/opt/agent/cli.py"));
        assert_eq!(config.workspace, PathBuf::from("/tmp/project"));
        assert!(!config.ask_permission);
        assert_eq!(config.anthropic_api_key(), Some("sk-ant-test"));
        assert_eq!(config.max_turns, 200);
    }

    #[test]
    fn invalid_settings_report_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "max_turns = \"many\"\n").expect("write settings");
        let err = ConfigSource::new(path.clone(), None)
            .load()
            .expect_err("invalid type");
        match err {
            ConfigError::Parse { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn launch_spec_matches_agent_invocation() {
        let config = AgentConfig {
            python_path: "python3".to_string(),
            agent_path: PathBuf::from("/opt/agent/cli.py"),
            workspace: PathBuf::from("/work"),
            openai_api_key: Some("sk-openai".to_string()),
            anthropic_api_key: Some("  ".to_string()),
            logs_path: Some(PathBuf::from("/work/agent.log")),
            ..AgentConfig::default()
        };
        let launch = config.launch_spec();
        assert_eq!(launch.program, PathBuf::from("python3"));
        assert_eq!(
            launch.args,
            vec![
                "/opt/agent/cli.py",
                "--workspace",
                "/work",
                "--needs-permission",
                "--logs-path",
                "/work/agent.log",
            ]
        );
        assert_eq!(launch.current_dir, Some(PathBuf::from("/work")));
        assert_eq!(launch.env.get("OPENAI_API_KEY").map(String::as_str), Some("sk-openai"));
        assert!(!launch.env.contains_key("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn redacted_hides_keys() {
        let config = AgentConfig {
            openai_api_key: Some("sk-openai".to_string()),
            ..AgentConfig::default()
        };
        let redacted = config.redacted();
        assert_eq!(redacted.openai_api_key.as_deref(), Some(REDACTED));
        assert!(redacted.anthropic_api_key.is_none());
        let raw = serde_json::to_string(&redacted).expect("serialize");
        assert!(!raw.contains("sk-openai"));
    }
}
