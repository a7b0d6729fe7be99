use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UnsupportedMediaType,
    Configuration,
    Startup,
    Write,
    ProcessFault,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-chat:error:invalid_request",
            Self::UnsupportedMediaType => "urn:agent-chat:error:unsupported_media_type",
            Self::Configuration => "urn:agent-chat:error:configuration",
            Self::Startup => "urn:agent-chat:error:startup",
            Self::Write => "urn:agent-chat:error:write",
            Self::ProcessFault => "urn:agent-chat:error:process_fault",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::Configuration => "Configuration Error",
            Self::Startup => "Startup Error",
            Self::Write => "Write Error",
            Self::ProcessFault => "Process Fault",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnsupportedMediaType => 415,
            Self::Configuration => 422,
            Self::Startup => 502,
            Self::Write => 502,
            Self::ProcessFault => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Failures surfaced by the chat relay.
///
/// Agent-side variants (`Configuration`, `Startup`, `Write`, `ProcessFault`)
/// are turned into chat entries by the session; the HTTP surface only ever
/// returns `InvalidRequest` and `UnsupportedMediaType` directly.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { message: String },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("failed to start agent: {message}")]
    Startup { message: String },
    #[error("failed to write to agent: {message}")]
    Write { message: String },
    #[error("agent process fault: {message}")]
    ProcessFault {
        message: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ChatError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UnsupportedMediaType { .. } => ErrorType::UnsupportedMediaType,
            Self::Configuration { .. } => ErrorType::Configuration,
            Self::Startup { .. } => ErrorType::Startup,
            Self::Write { .. } => ErrorType::Write,
            Self::ProcessFault { .. } => ErrorType::ProcessFault,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Self::ProcessFault {
            exit_code, signal, ..
        } = self
        {
            let mut details = Map::new();
            if let Some(code) = exit_code {
                details.insert(
                    "exitCode".to_string(),
                    Value::Number(serde_json::Number::from(*code as i64)),
                );
            }
            if let Some(signal) = signal {
                details.insert(
                    "signal".to_string(),
                    Value::Number(serde_json::Number::from(*signal as i64)),
                );
            }
            if !details.is_empty() {
                problem
                    .extensions
                    .insert("details".to_string(), Value::Object(details));
            }
        }
        problem
    }
}

impl From<ChatError> for ProblemDetails {
    fn from(value: ChatError) -> Self {
        value.to_problem_details()
    }
}

impl From<&ChatError> for ProblemDetails {
    fn from(value: &ChatError) -> Self {
        value.to_problem_details()
    }
}
