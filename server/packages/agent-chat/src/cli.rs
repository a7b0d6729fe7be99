use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use agent_chat_error::ProblemDetails;
use axum::http::HeaderValue;
use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::{AppContext, DEFAULT_CONFIG_POLL_INTERVAL};
use crate::bridge::WebviewMessage;
use crate::config::{default_config_path, ConfigError, ConfigSource, RedactedConfig};
use crate::router::{build_router, HistoryResponse, HistoryTreeResponse, DEFAULT_PORT};

const API_PREFIX: &str = "/v1";
const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Parser, Debug)]
#[command(name = "agent-chat", bin_name = "agent-chat")]
#[command(about = "Chat with a locally spawned coding agent", version)]
#[command(arg_required_else_help = true)]
pub struct AgentChatCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server and serve the chat page.
    Serve(ServeArgs),
    /// Send a message through a running server.
    Send(SendArgs),
    /// Print the history held by a running server.
    History(HistoryArgs),
    /// Print the resolved settings with credentials masked.
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct SettingsArgs {
    /// Settings file; defaults to $AGENT_CHAT_CONFIG or the user data directory.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Workspace the agent runs in, overriding the settings file.
    #[arg(long, short = 'w')]
    workspace: Option<PathBuf>,
}

impl SettingsArgs {
    fn source(&self) -> ConfigSource {
        let path = self.config.clone().unwrap_or_else(default_config_path);
        ConfigSource::new(path, self.workspace.clone())
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Extra origins allowed to call the API, e.g. an editor webview.
    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[arg(long, short = 'm')]
    message: String,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Print the session tree instead of the flat message list.
    #[arg(long)]
    tree: bool,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub fn run_agent_chat() -> Result<(), CliError> {
    let cli = AgentChatCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Serve(args) => run_server(args),
        Command::Send(args) => send_message(args),
        Command::History(args) => print_history(args),
        Command::Config(args) => print_config(args),
    }
}

fn run_server(server: &ServeArgs) -> Result<(), CliError> {
    let source = server.settings.source();
    let cors = build_cors_layer(server)?;
    let addr = format!("{}:{}", server.host, server.port);
    let display_host = match server.host.as_str() {
        "0.0.0.0" | "::" => "localhost",
        other => other,
    };
    let chat_url = format!("http://{}:{}/", display_host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let context = Arc::new(AppContext::load(source)?);
        let watcher = context.spawn_config_watcher(DEFAULT_CONFIG_POLL_INTERVAL);
        let router = build_router(context.clone()).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        tracing::info!(url = %chat_url, "chat page available");

        let shutdown_context = context.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
                shutdown_context.shutdown().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()));
        watcher.abort();
        context.shutdown().await;
        served
    })
}

fn build_cors_layer(server: &ServeArgs) -> Result<CorsLayer, CliError> {
    let mut origins: Vec<HeaderValue> = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    Ok(cors.allow_methods(Any).allow_headers(Any))
}

fn send_message(args: &SendArgs) -> Result<(), CliError> {
    let ctx = ClientContext::new(&args.client)?;
    let envelope = WebviewMessage::SendMessage {
        message: args.message.clone(),
    };
    let response = ctx.post(&format!("{API_PREFIX}/webview"), &envelope)?;
    ensure_success(response)?;
    Ok(())
}

fn print_history(args: &HistoryArgs) -> Result<(), CliError> {
    let ctx = ClientContext::new(&args.client)?;
    if args.tree {
        let response = ctx.get(&format!("{API_PREFIX}/history/tree"))?;
        print_json_response::<HistoryTreeResponse>(response)
    } else {
        let response = ctx.get(&format!("{API_PREFIX}/history"))?;
        print_json_response::<HistoryResponse>(response)
    }
}

fn print_config(args: &ConfigArgs) -> Result<(), CliError> {
    let source = args.settings.source();
    let config = source.load()?;
    let report = ConfigReport {
        settings_path: source.path().to_string_lossy().into_owned(),
        config: config.redacted(),
    };
    write_line(&mut std::io::stdout(), &serde_json::to_string_pretty(&report)?)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigReport {
    settings_path: String,
    config: RedactedConfig,
}

struct ClientContext {
    endpoint: String,
    client: HttpClient,
}

impl ClientContext {
    fn new(args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        let client = HttpClient::builder().build()?;
        Ok(Self { endpoint, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.client.request(Method::GET, self.url(path)).send()?)
    }

    fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self
            .client
            .request(Method::POST, self.url(path))
            .json(body)
            .send()?)
    }
}

fn print_json_response<T: DeserializeOwned + Serialize>(
    response: reqwest::blocking::Response,
) -> Result<(), CliError> {
    let parsed: T = ensure_success(response)?.json()?;
    write_line(&mut std::io::stdout(), &serde_json::to_string_pretty(&parsed)?)
}

/// Passes a successful response through. Otherwise the server's problem
/// details are summarized on stderr and the status becomes the error.
fn ensure_success(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, CliError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text()?;
    write_line(&mut std::io::stderr(), &describe_failure(&body))?;
    Err(CliError::HttpStatus(status))
}

fn describe_failure(body: &str) -> String {
    match serde_json::from_str::<ProblemDetails>(body) {
        Ok(problem) => match problem.detail {
            Some(detail) => format!("{} ({}): {detail}", problem.title, problem.status),
            None => format!("{} ({})", problem.title, problem.status),
        },
        Err(_) => body.trim().to_string(),
    }
}

fn write_line(out: &mut impl Write, text: &str) -> Result<(), CliError> {
    writeln!(out, "{text}")?;
    out.flush()?;
    Ok(())
}
