use std::convert::Infallible;
use std::sync::Arc;

use agent_chat_error::ChatError;
use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use utoipa::ToSchema;

use crate::message::Message;
use crate::session::AgentSession;

const BRIDGE_CHANNEL_CAPACITY: usize = 256;

/// Host to UI envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExtensionMessage {
    AddMessage { message: Message },
    LoadHistory { messages: Vec<Message> },
}

/// UI to host envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WebviewMessage {
    SendMessage { message: String },
    ClearHistory,
    Ready,
    Error { error: String },
}

/// Fans session activity out to every connected chat page and applies the
/// pages' requests to the session.
pub struct WebviewBridge {
    session: Arc<AgentSession>,
    sender: broadcast::Sender<ExtensionMessage>,
    closed: watch::Sender<bool>,
}

impl WebviewBridge {
    pub fn new(session: Arc<AgentSession>) -> Self {
        let (sender, _rx) = broadcast::channel(BRIDGE_CHANNEL_CAPACITY);
        let forward = sender.clone();
        session.on_message(move |message| {
            // No connected page is not an error.
            let _ = forward.send(ExtensionMessage::AddMessage {
                message: message.clone(),
            });
        });
        let (closed, _rx) = watch::channel(false);
        Self {
            session,
            sender,
            closed,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExtensionMessage> {
        self.sender.subscribe()
    }

    pub async fn handle(&self, message: WebviewMessage) -> Result<(), ChatError> {
        match message {
            WebviewMessage::SendMessage { message } => {
                if message.trim().is_empty() {
                    return Err(ChatError::InvalidRequest {
                        message: "message must not be empty".to_string(),
                    });
                }
                self.session.send_message(&message).await;
            }
            WebviewMessage::ClearHistory => {
                self.session.clear_history();
                self.load_history();
            }
            WebviewMessage::Ready => {
                // Each event stream opens with its own history snapshot.
                tracing::debug!("webview ready");
            }
            WebviewMessage::Error { error } => {
                tracing::error!(error = %error, "webview reported an error");
            }
        }
        Ok(())
    }

    /// Ends every open event stream so the server can drain connections.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    fn load_history(&self) {
        let _ = self.sender.send(ExtensionMessage::LoadHistory {
            messages: self.session.history(),
        });
    }

    /// SSE events for one page, starting with a `loadHistory` of everything
    /// so far. A page that falls behind is resynced with a full `loadHistory`
    /// instead of the envelopes it missed.
    pub fn sse_stream(&self) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
        let session = self.session.clone();
        let mut closed = self.closed.subscribe();
        let closing = async move {
            let _ = closed.wait_for(|value| *value).await;
        };
        let (initial, receiver) = self.session.with_history(|messages| {
            let initial = ExtensionMessage::LoadHistory {
                messages: messages.to_vec(),
            };
            (initial, self.subscribe())
        });
        let initial = futures::stream::iter(to_event(&initial).map(Ok::<Event, Infallible>));
        let updates = BroadcastStream::new(receiver).filter_map(move |item| {
            let envelope = match item {
                Ok(envelope) => envelope,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "webview stream lagged; resending history");
                    ExtensionMessage::LoadHistory {
                        messages: session.history(),
                    }
                }
            };
            async move { to_event(&envelope).map(Ok) }
        });
        initial.chain(updates).take_until(closing)
    }
}

fn to_event(envelope: &ExtensionMessage) -> Option<Event> {
    match serde_json::to_string(envelope) {
        Ok(data) => Some(Event::default().event("message").data(data)),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode webview envelope");
            None
        }
    }
}
