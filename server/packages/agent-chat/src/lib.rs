//! Chat relay between a browser chat page and a locally spawned coding agent.

pub mod app;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod history_view;
pub mod message;
pub mod output_log;
pub mod parser;
pub mod router;
pub mod session;
pub mod ui;

pub use app::AppContext;
pub use router::build_router;
pub use session::AgentSession;
