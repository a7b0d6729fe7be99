//! The chat session: validation, process lifecycle and the message history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use agent_chat_error::ChatError;
use agent_chat_process::{AgentProcess, ExitInfo, ProcessError, ProcessEvent};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use crate::config::AgentConfig;
use crate::message::Message;
use crate::output_log::{LogLevel, OutputLog};
use crate::parser::{LineMode, OutputLineParser};

pub const CLEARED_NOTICE: &str = "Chat history cleared";
pub const MISSING_CREDENTIALS_WARNING: &str =
    "No API keys configured. Please set an OpenAI or Anthropic API key in settings";

type Observer = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub running: bool,
    pub history_len: usize,
    pub agent_path: String,
    pub disposed: bool,
}

#[derive(Default)]
struct History {
    messages: Vec<Message>,
    observers: Vec<Observer>,
}

impl History {
    fn push(&mut self, message: Message) {
        for observer in &self.observers {
            observer(&message);
        }
        self.messages.push(message);
    }
}

struct SessionInner {
    process: Arc<dyn AgentProcess>,
    config: RwLock<AgentConfig>,
    history: Mutex<History>,
    parser: Mutex<OutputLineParser>,
    output_log: Mutex<OutputLog>,
    credentials_warned: AtomicBool,
    disposed: AtomicBool,
}

/// One logical chat with the agent.
///
/// The session owns the history and is the only writer to it. Output from the
/// agent process is appended from a background task as it arrives, so
/// `history` may grow between calls even when no send is in flight.
pub struct AgentSession {
    inner: Arc<SessionInner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl AgentSession {
    /// Must be called inside a tokio runtime; the process event pump is
    /// spawned immediately.
    pub fn new(process: Arc<dyn AgentProcess>, config: AgentConfig, output_log: OutputLog) -> Self {
        let events = process.subscribe();
        let mode = LineMode::from_carry_partial_lines(config.carry_partial_lines);
        let inner = Arc::new(SessionInner {
            process,
            config: RwLock::new(config),
            history: Mutex::new(History::default()),
            parser: Mutex::new(OutputLineParser::new(mode)),
            output_log: Mutex::new(output_log),
            credentials_warned: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        let pump = tokio::spawn(run_event_pump(inner.clone(), events));
        Self {
            inner,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Records the user's text, then validates, starts the agent if needed and
    /// writes the text to it. Every failure ends up in the history as an error
    /// message; nothing is returned to the caller.
    pub async fn send_message(&self, text: &str) {
        self.inner.append(Message::user(text));
        self.inner.log(LogLevel::Info, &format!("User message: {text}"));

        if let Err(err) = self.deliver(text).await {
            self.inner
                .log(LogLevel::Error, &format!("Error sending message: {err}"));
            self.inner.append(problem_message(
                Message::error(format!("Error: {err}")),
                &err,
            ));
        }
    }

    async fn deliver(&self, text: &str) -> Result<(), ChatError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(ChatError::Startup {
                message: "session has been disposed".to_string(),
            });
        }

        let config = self.config();
        self.validate(&config).await?;

        if !self.inner.process.is_running() {
            self.inner.log(LogLevel::Info, "Starting agent process...");
        }
        let launch = config.launch_spec();
        self.inner
            .process
            .start(&launch)
            .await
            .map_err(process_error)?;
        self.inner
            .process
            .write(text)
            .await
            .map_err(process_error)?;
        Ok(())
    }

    async fn validate(&self, config: &AgentConfig) -> Result<(), ChatError> {
        if config.agent_path.as_os_str().is_empty() {
            return Err(ChatError::Configuration {
                message: "agent path is not configured".to_string(),
            });
        }
        let exists = tokio::fs::try_exists(&config.agent_path)
            .await
            .unwrap_or(false);
        if !exists {
            return Err(ChatError::Configuration {
                message: format!("agent script not found at {}", config.agent_path.display()),
            });
        }

        if !config.has_credentials() && !self.inner.credentials_warned.swap(true, Ordering::SeqCst) {
            self.inner
                .log(LogLevel::Info, "No API keys configured; continuing without credentials");
            self.inner.append(Message::system(MISSING_CREDENTIALS_WARNING));
        }
        Ok(())
    }

    /// Registers a callback for every appended message.
    ///
    /// Observers run while the history is locked, in registration order, so
    /// they must not block or call back into the session.
    pub fn on_message<F>(&self, observer: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        lock(&self.inner.history).observers.push(Arc::new(observer));
    }

    pub fn history(&self) -> Vec<Message> {
        lock(&self.inner.history).messages.clone()
    }

    /// Runs `f` against the history with appends held off, so a caller can
    /// pair a snapshot with an observer-fed subscription without gaps.
    pub fn with_history<T>(&self, f: impl FnOnce(&[Message]) -> T) -> T {
        f(&lock(&self.inner.history).messages)
    }

    pub fn clear_history(&self) {
        {
            let mut history = lock(&self.inner.history);
            history.messages.clear();
            history.push(Message::system(CLEARED_NOTICE));
        }
        self.inner.log(LogLevel::Info, "Chat history cleared");
    }

    /// Replaces the configuration. A running agent keeps the settings it was
    /// started with.
    pub fn update_config(&self, config: AgentConfig) {
        let mut held = self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *held = config;
        self.inner.credentials_warned.store(false, Ordering::SeqCst);
        drop(held);
        self.inner.log(LogLevel::Info, "Configuration updated");
    }

    pub fn config(&self) -> AgentConfig {
        self.inner.config()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            running: self.inner.process.is_running(),
            history_len: lock(&self.inner.history).messages.len(),
            agent_path: self.config().agent_path.to_string_lossy().into_owned(),
            disposed: self.inner.disposed.load(Ordering::SeqCst),
        }
    }

    /// Stops the agent and releases the output log. Later calls do nothing.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.log(LogLevel::Info, "Stopping agent process...");
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.inner.process.stop().await;
        lock(&self.inner.output_log).close();
        tracing::info!("agent session disposed");
    }
}

impl SessionInner {
    fn config(&self) -> AgentConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn append(&self, message: Message) {
        lock(&self.history).push(message);
    }

    fn log(&self, level: LogLevel, text: &str) {
        match level {
            LogLevel::Info => tracing::info!(target: "agent_chat::session", "{text}"),
            LogLevel::Error => tracing::error!(target: "agent_chat::session", "{text}"),
            LogLevel::Debug => tracing::debug!(target: "agent_chat::session", "{text}"),
        }
        if self.config.read().map(|config| config.enable_logging).unwrap_or(false) {
            lock(&self.output_log).append(level, text);
        }
    }

    fn handle_event(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout(chunk) => {
                self.log(LogLevel::Debug, &format!("Agent output: {chunk}"));
                let messages = lock(&self.parser).push(&chunk);
                for message in messages {
                    self.append(message);
                }
            }
            ProcessEvent::Stderr(chunk) => {
                self.log(LogLevel::Error, &format!("Agent stderr: {chunk}"));
                let text = chunk.trim();
                if !text.is_empty() {
                    self.append(Message::error(text));
                }
            }
            ProcessEvent::Exited(info) => {
                let mode = LineMode::from_carry_partial_lines(self.config().carry_partial_lines);
                let rest = {
                    let mut parser = lock(&self.parser);
                    let rest = parser.flush();
                    *parser = OutputLineParser::new(mode);
                    rest
                };
                for message in rest {
                    self.append(message);
                }
                self.report_exit(info);
            }
            ProcessEvent::Error(error) => {
                self.log(LogLevel::Error, &format!("Process error: {error}"));
                self.append(Message::error(format!("Error: {error}")));
            }
        }
    }

    fn report_exit(&self, info: ExitInfo) {
        let text = format!("Agent process exited ({info})");
        self.log(LogLevel::Info, &text);
        if info.success() {
            self.append(Message::system(text));
            return;
        }
        let fault = ChatError::ProcessFault {
            message: text.clone(),
            exit_code: info.code,
            signal: info.signal,
        };
        self.append(problem_message(Message::error(text), &fault));
    }
}

async fn run_event_pump(inner: Arc<SessionInner>, mut events: Receiver<ProcessEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => inner.handle_event(event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "session fell behind agent output; events dropped");
                inner.append(Message::system(format!(
                    "Skipped {skipped} agent events; some output is missing"
                )));
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn process_error(err: ProcessError) -> ChatError {
    if err.is_startup() {
        ChatError::Startup {
            message: err.to_string(),
        }
    } else {
        ChatError::Write {
            message: err.to_string(),
        }
    }
}

/// Attaches the problem details of `err` as message metadata.
fn problem_message(message: Message, err: &ChatError) -> Message {
    match serde_json::to_value(err.to_problem_details()) {
        Ok(value) => message.with_metadata(value),
        Err(_) => message,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
