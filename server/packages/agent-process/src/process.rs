use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::decode::ChunkDecoder;
use crate::launch::LaunchSpec;

/// How long a freshly spawned process must stay alive before it counts as started.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);
/// How long `stop` waits after SIGTERM before killing the process.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 512;
const READ_BUFFER_SIZE: usize = 8 * 1024;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {code}")?,
            None => write!(f, "code none")?,
        }
        match self.signal {
            Some(signal) => write!(f, ", signal {signal}"),
            None => write!(f, ", signal none"),
        }
    }
}

/// Lifecycle and output notifications from the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Raw stdout text, not aligned to line boundaries.
    Stdout(String),
    /// Raw stderr text, not aligned to line boundaries.
    Stderr(String),
    Exited(ExitInfo),
    Error(String),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn agent process `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture agent process {0}")]
    MissingPipe(&'static str),
    #[error("agent process exited during startup ({0})")]
    ExitedDuringStartup(ExitInfo),
    #[error("agent process is not running")]
    NotRunning,
    #[error("failed to write agent stdin: {0}")]
    Write(#[source] std::io::Error),
}

impl ProcessError {
    /// True for failures raised while bringing the process up.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::MissingPipe(_) | Self::ExitedDuringStartup(_)
        )
    }
}

/// The agent subprocess as seen by a chat session.
///
/// `ProcessManager` is the real implementation; sessions take the trait
/// object so tests can substitute a scripted process.
pub trait AgentProcess: Send + Sync + 'static {
    /// Starts the process unless it is already running.
    fn start<'a>(&'a self, launch: &'a LaunchSpec) -> BoxFuture<'a, Result<(), ProcessError>>;

    /// Writes `text` followed by a newline to the process stdin.
    fn write<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), ProcessError>>;

    /// Terminates the process, escalating to a kill after the stop timeout.
    fn stop(&self) -> BoxFuture<'_, ()>;

    fn is_running(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent>;
}

#[derive(Debug)]
struct RunningChild {
    generation: u64,
    pid: Option<u32>,
    /// Locked separately from the slot so a write stuck on a full pipe never
    /// holds up `stop`.
    stdin: Arc<Mutex<ChildStdin>>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<ExitInfo>>,
    spawned_at: Instant,
}

/// Owns at most one agent child process.
#[derive(Debug)]
pub struct ProcessManager {
    slot: Arc<Mutex<Option<RunningChild>>>,
    running: Arc<AtomicBool>,
    generation: AtomicU64,
    start_lock: Mutex<()>,
    sender: broadcast::Sender<ProcessEvent>,
    grace_period: Duration,
    stop_timeout: Duration,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            slot: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(0),
            start_lock: Mutex::new(()),
            sender,
            grace_period: DEFAULT_GRACE_PERIOD,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.sender.subscribe()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.slot.lock().await.as_ref().and_then(|child| child.pid)
    }

    pub async fn start(&self, launch: &LaunchSpec) -> Result<(), ProcessError> {
        let _start_guard = self.start_lock.lock().await;
        if self.is_running() {
            tracing::debug!("agent process already running");
            return Ok(());
        }

        let spawned_at = Instant::now();
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &launch.env {
            command.env(key, value);
        }
        if let Some(dir) = &launch.current_dir {
            command.current_dir(dir);
        }

        let command_line = launch.display_command();
        tracing::info!(command = %command_line, "spawning agent process");

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(command = %command_line, error = %err, "failed to spawn agent process");
            ProcessError::Spawn {
                command: command_line.clone(),
                error: err,
            }
        })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let readers = vec![
            spawn_output_loop(stdout, OutputStream::Stdout, self.sender.clone(), spawned_at),
            spawn_output_loop(stderr, OutputStream::Stderr, self.sender.clone(), spawned_at),
        ];
        self.spawn_exit_watcher(child, generation, kill_rx, exit_tx, readers, spawned_at);

        *self.slot.lock().await = Some(RunningChild {
            generation,
            pid,
            stdin: Arc::new(Mutex::new(stdin)),
            kill: Some(kill_tx),
            exited: exit_rx.clone(),
            spawned_at,
        });

        tracing::info!(
            pid = pid.unwrap_or(0),
            elapsed_ms = spawned_at.elapsed().as_millis() as u64,
            "agent process spawned"
        );

        tokio::time::sleep(self.grace_period).await;

        // The exit watcher clears the slot under the same lock, so the running
        // flag cannot be raised after it has already observed the exit.
        let slot = self.slot.lock().await;
        let exited = *exit_rx.borrow();
        let still_owned = slot.as_ref().map(|child| child.generation) == Some(generation);
        if let Some(info) = exited {
            tracing::error!(exit = %info, "agent process exited during startup");
            return Err(ProcessError::ExitedDuringStartup(info));
        }
        if !still_owned {
            tracing::warn!("agent process was stopped during startup");
            return Err(ProcessError::ExitedDuringStartup(ExitInfo::default()));
        }
        self.running.store(true, Ordering::SeqCst);
        drop(slot);

        tracing::info!(
            pid = pid.unwrap_or(0),
            grace_ms = self.grace_period.as_millis() as u64,
            "agent started successfully"
        );
        Ok(())
    }

    pub async fn write(&self, text: &str) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::NotRunning);
        }
        let stdin = match self.slot.lock().await.as_ref() {
            Some(child) => child.stdin.clone(),
            None => return Err(ProcessError::NotRunning),
        };
        let mut stdin = stdin.lock().await;

        let mut payload = String::with_capacity(text.len() + 1);
        payload.push_str(text);
        payload.push('\n');

        tracing::debug!(bytes = payload.len(), "stdin: writing message to agent");
        stdin.write_all(payload.as_bytes()).await.map_err(|err| {
            tracing::error!(error = %err, "stdin: write_all failed");
            ProcessError::Write(err)
        })?;
        stdin.flush().await.map_err(|err| {
            tracing::error!(error = %err, "stdin: flush failed");
            ProcessError::Write(err)
        })?;
        tracing::debug!("stdin: write+flush complete");
        Ok(())
    }

    pub async fn stop(&self) {
        let taken = self.slot.lock().await.take();
        self.running.store(false, Ordering::SeqCst);
        let Some(mut child) = taken else {
            return;
        };

        tracing::info!(
            pid = child.pid.unwrap_or(0),
            age_ms = child.spawned_at.elapsed().as_millis() as u64,
            "stopping agent process"
        );

        let graceful = if send_terminate(child.pid) {
            tokio::time::timeout(self.stop_timeout, wait_for_exit(&mut child.exited))
                .await
                .is_ok()
        } else {
            false
        };

        if !graceful {
            tracing::warn!(
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "agent process still alive; killing"
            );
            if let Some(kill) = child.kill.take() {
                let _ = kill.send(());
            }
            if tokio::time::timeout(self.stop_timeout, wait_for_exit(&mut child.exited))
                .await
                .is_err()
            {
                tracing::error!("agent process did not exit after kill");
            }
        }
    }

    fn spawn_exit_watcher(
        &self,
        mut child: Child,
        generation: u64,
        mut kill_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<ExitInfo>>,
        readers: Vec<JoinHandle<()>>,
        spawned_at: Instant,
    ) {
        let slot = self.slot.clone();
        let running = self.running.clone();
        let sender = self.sender.clone();

        tokio::spawn(async move {
            // A dropped kill sender also lands here; the child never outlives
            // the manager's handle on it.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(error = %err, "failed to kill agent process");
                    }
                    child.wait().await
                }
            };

            let info = match status {
                Ok(status) => exit_info(&status),
                Err(err) => {
                    tracing::error!(error = %err, "agent process: failed to get exit status");
                    let _ = sender.send(ProcessEvent::Error(format!(
                        "failed to get agent exit status: {err}"
                    )));
                    ExitInfo::default()
                }
            };

            let _ = exit_tx.send(Some(info));
            {
                let mut guard = slot.lock().await;
                if guard.as_ref().map(|child| child.generation) == Some(generation) {
                    *guard = None;
                    running.store(false, Ordering::SeqCst);
                }
            }

            // Let buffered output reach subscribers before the exit notice.
            for reader in readers {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                    tracing::debug!("agent output still open after exit");
                }
            }

            tracing::warn!(
                success = info.success(),
                code = info.code,
                signal = info.signal,
                age_ms = spawned_at.elapsed().as_millis() as u64,
                "agent process exited"
            );
            let _ = sender.send(ProcessEvent::Exited(info));
        });
    }
}

impl AgentProcess for ProcessManager {
    fn start<'a>(&'a self, launch: &'a LaunchSpec) -> BoxFuture<'a, Result<(), ProcessError>> {
        Box::pin(self.start(launch))
    }

    fn write<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), ProcessError>> {
        Box::pin(self.write(text))
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop())
    }

    fn is_running(&self) -> bool {
        self.is_running()
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn event(self, text: String) -> ProcessEvent {
        match self {
            Self::Stdout => ProcessEvent::Stdout(text),
            Self::Stderr => ProcessEvent::Stderr(text),
        }
    }
}

fn spawn_output_loop<R>(
    mut reader: R,
    stream: OutputStream,
    sender: broadcast::Sender<ProcessEvent>,
    spawned_at: Instant,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = ChunkDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut chunk_count: u64 = 0;

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => {
                    let text = decoder.decode(&buf[..read]);
                    if text.is_empty() {
                        continue;
                    }
                    chunk_count += 1;
                    tracing::debug!(
                        stream = stream.as_str(),
                        bytes = read,
                        chunk = chunk_count,
                        "agent output chunk"
                    );
                    let _ = sender.send(stream.event(text));
                }
                Err(err) => {
                    tracing::warn!(stream = stream.as_str(), error = %err, "agent output read failed");
                    break;
                }
            }
        }

        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = sender.send(stream.event(rest));
        }

        tracing::debug!(
            stream = stream.as_str(),
            total_chunks = chunk_count,
            age_ms = spawned_at.elapsed().as_millis() as u64,
            "agent output stream ended"
        );
    })
}

async fn wait_for_exit(exited: &mut watch::Receiver<Option<ExitInfo>>) {
    let _ = exited.wait_for(|info| info.is_some()).await;
}

fn exit_info(status: &std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}

#[cfg(unix)]
fn send_terminate(pid: Option<u32>) -> bool {
    let Some(pid) = pid else {
        return false;
    };
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(_pid: Option<u32>) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn quick_manager() -> ProcessManager {
        ProcessManager::new()
            .with_grace_period(Duration::from_millis(100))
            .with_stop_timeout(Duration::from_millis(300))
    }

    fn shell(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh").arg("-c").arg(script)
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<ProcessEvent>,
        matches: impl Fn(&ProcessEvent) -> bool,
    ) -> ProcessEvent {
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            loop {
                match rx.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) => continue,
                    Err(err) => panic!("event channel closed: {err}"),
                }
            }
        })
        .await
        .expect("timed out waiting for process event")
    }

    #[tokio::test]
    async fn stop_without_process_is_noop() {
        let manager = quick_manager();
        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn second_start_reuses_running_process() {
        let manager = quick_manager();
        let launch = LaunchSpec::new("cat");

        manager.start(&launch).await.expect("first start");
        let first = manager.pid().await.expect("pid");
        manager.start(&launch).await.expect("second start");
        let second = manager.pid().await.expect("pid");

        assert_eq!(first, second);
        assert!(manager.is_running());
        manager.stop().await;
        assert!(!manager.is_running());
        assert!(manager.pid().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_one_process() {
        let manager = quick_manager();
        let launch = LaunchSpec::new("cat");

        let (first, second) = tokio::join!(manager.start(&launch), manager.start(&launch));
        first.expect("first start");
        second.expect("second start");

        assert_eq!(manager.generation.load(Ordering::SeqCst), 1);
        assert!(manager.pid().await.is_some());
        assert!(manager.is_running());
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_is_not_held_up_by_a_blocked_write() {
        let manager = Arc::new(quick_manager());
        let mut events = manager.subscribe();
        manager
            .start(&LaunchSpec::new("sleep").arg("30"))
            .await
            .expect("start");

        // Far more than a pipe buffer; the agent never reads it.
        let writer = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.write(&"x".repeat(1024 * 1024)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        tokio::time::timeout(Duration::from_secs(8), manager.stop())
            .await
            .expect("stop waited on the pending write");
        assert!(!manager.is_running());
        next_event(&mut events, |e| matches!(e, ProcessEvent::Exited(_))).await;

        let result = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("write did not finish after stop")
            .expect("writer task");
        assert!(matches!(result, Err(ProcessError::Write(_))));
    }

    #[tokio::test]
    async fn write_round_trips_through_stdin() {
        let manager = quick_manager();
        let mut events = manager.subscribe();
        manager.start(&LaunchSpec::new("cat")).await.expect("start");

        manager.write("hello agent").await.expect("write");

        let mut collected = String::new();
        while !collected.contains("hello agent\n") {
            if let ProcessEvent::Stdout(text) =
                next_event(&mut events, |e| matches!(e, ProcessEvent::Stdout(_))).await
            {
                collected.push_str(&text);
            }
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn write_without_process_fails() {
        let manager = quick_manager();
        let err = manager.write("nobody home").await.expect_err("not running");
        assert!(matches!(err, ProcessError::NotRunning));
    }

    #[tokio::test]
    async fn spawn_failure_is_startup_error() {
        let manager = quick_manager();
        let err = manager
            .start(&LaunchSpec::new("/definitely/not/an/agent-binary"))
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.is_startup());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn early_exit_fails_startup() {
        let manager = quick_manager();
        let err = manager
            .start(&shell("exit 3"))
            .await
            .expect_err("process exits inside grace period");
        match err {
            ProcessError::ExitedDuringStartup(info) => assert_eq!(info.code, Some(3)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn exit_is_reported_and_clears_running() {
        let manager = quick_manager();
        let mut events = manager.subscribe();
        manager
            .start(&shell("sleep 0.4; exit 2"))
            .await
            .expect("start");
        assert!(manager.is_running());

        let event = next_event(&mut events, |e| matches!(e, ProcessEvent::Exited(_))).await;
        assert_eq!(
            event,
            ProcessEvent::Exited(ExitInfo {
                code: Some(2),
                signal: None
            })
        );
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn stderr_is_forwarded() {
        let manager = quick_manager();
        let mut events = manager.subscribe();
        manager
            .start(&shell("echo oops >&2; sleep 5"))
            .await
            .expect("start");

        let event = next_event(&mut events, |e| matches!(e, ProcessEvent::Stderr(_))).await;
        assert_eq!(event, ProcessEvent::Stderr("oops\n".to_string()));
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_kills_process_ignoring_sigterm() {
        let manager = quick_manager();
        let mut events = manager.subscribe();
        manager
            .start(&shell("trap '' TERM; exec sleep 30"))
            .await
            .expect("start");

        manager.stop().await;
        assert!(!manager.is_running());

        let event = next_event(&mut events, |e| matches!(e, ProcessEvent::Exited(_))).await;
        assert_eq!(
            event,
            ProcessEvent::Exited(ExitInfo {
                code: None,
                signal: Some(libc::SIGKILL)
            })
        );
    }
}
