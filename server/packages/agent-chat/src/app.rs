use std::sync::Arc;
use std::time::{Duration, SystemTime};

use agent_chat_process::{AgentProcess, ProcessManager};
use tokio::task::JoinHandle;

use crate::bridge::WebviewBridge;
use crate::config::{AgentConfig, ConfigError, ConfigSource};
use crate::output_log::{default_log_path, OutputLog};
use crate::session::AgentSession;

pub const DEFAULT_CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Everything the server shares between requests, built once at startup.
pub struct AppContext {
    config_source: ConfigSource,
    session: Arc<AgentSession>,
    bridge: Arc<WebviewBridge>,
}

impl AppContext {
    /// Loads settings and wires a real agent process into a fresh session.
    pub fn load(config_source: ConfigSource) -> Result<Self, ConfigError> {
        let config = config_source.load()?;
        tracing::info!(
            settings = %config_source.path().display(),
            agent_path = %config.agent_path.display(),
            workspace = %config.workspace.display(),
            "loaded agent settings"
        );
        let process: Arc<dyn AgentProcess> = Arc::new(ProcessManager::new());
        Ok(Self::from_parts(
            config_source,
            config,
            process,
            OutputLog::new(default_log_path()),
        ))
    }

    pub fn from_parts(
        config_source: ConfigSource,
        config: AgentConfig,
        process: Arc<dyn AgentProcess>,
        output_log: OutputLog,
    ) -> Self {
        let session = Arc::new(AgentSession::new(process, config, output_log));
        let bridge = Arc::new(WebviewBridge::new(session.clone()));
        Self {
            config_source,
            session,
            bridge,
        }
    }

    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }

    pub fn bridge(&self) -> &Arc<WebviewBridge> {
        &self.bridge
    }

    pub fn config_source(&self) -> &ConfigSource {
        &self.config_source
    }

    /// Re-reads the settings file whenever its modification time changes.
    /// An unreadable or invalid file leaves the current settings in place.
    pub fn spawn_config_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let context = self.clone();
        tokio::spawn(async move {
            let mut last_seen = context.config_source.modified_at();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let modified = context.config_source.modified_at();
                if modified == last_seen {
                    continue;
                }
                last_seen = modified;
                context.reload_config(modified);
            }
        })
    }

    fn reload_config(&self, modified: Option<SystemTime>) {
        match self.config_source.load() {
            Ok(config) => {
                tracing::info!(
                    settings = %self.config_source.path().display(),
                    removed = modified.is_none(),
                    "settings changed; reloading"
                );
                self.session.update_config(config);
            }
            Err(err) => {
                tracing::warn!(error = %err, "ignoring invalid settings change");
            }
        }
    }

    pub async fn shutdown(&self) {
        self.bridge.close();
        self.session.dispose().await;
    }
}
