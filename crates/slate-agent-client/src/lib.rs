//! Asynchronous client for the storage agent's decoupled command protocol.
//!
//! Submitting a command returns as soon as the agent accepts the request; the
//! substantive response arrives later as a POST to a callback address,
//! correlated by an opaque task uuid carried in the request headers. The
//! client owns the correlation table and resolves each pending command
//! exactly once when its callback arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use slate_agent_protocol::{CALLBACK_URL_HEADER, TASK_UUID_HEADER};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Route the agent POSTs callbacks to; mount [`callback_router`] here.
pub const CALLBACK_PATH: &str = "/slate/callbacks";

#[derive(Debug, thiserror::Error)]
pub enum AgentClientError {
    #[error("failed to submit command to {url}: {source}")]
    Submit {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("agent rejected command at {url}: {status} {body}")]
    Rejected {
        url: String,
        status: u16,
        body: String,
    },
    #[error("callback channel closed before a response arrived")]
    CallbackDropped,
    #[error("failed to decode agent response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    callback_url: String,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
}

impl AgentClient {
    /// `callback_url` is the externally reachable address of this process's
    /// [`CALLBACK_PATH`] route; it is attached to every outgoing command.
    pub fn new(callback_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            callback_url: callback_url.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    /// Commands submitted but not yet answered by a callback.
    pub fn pending_commands(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").len()
    }

    /// Submit `cmd` to `url` and wait for the correlated callback, decoded
    /// as `R`. The wait is unbounded; timeout policy belongs to the
    /// deployment's transport configuration.
    pub async fn call<C, R>(&self, url: &str, cmd: &C) -> Result<R, AgentClientError>
    where
        C: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let task_uuid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(task_uuid.clone(), tx);

        debug!(url, task_uuid, "submitting agent command");
        let submit = self
            .http
            .post(url)
            .header(TASK_UUID_HEADER, &task_uuid)
            .header(CALLBACK_URL_HEADER, &self.callback_url)
            .json(cmd)
            .send()
            .await;

        let response = match submit {
            Ok(response) => response,
            Err(source) => {
                self.discard(&task_uuid);
                return Err(AgentClientError::Submit {
                    url: url.to_string(),
                    source,
                });
            }
        };
        let status = response.status();
        if !status.is_success() {
            self.discard(&task_uuid);
            let body = response.text().await.unwrap_or_default();
            return Err(AgentClientError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body = rx.await.map_err(|_| AgentClientError::CallbackDropped)?;
        Ok(serde_json::from_value(body)?)
    }

    /// Deliver an inbound callback payload to the command waiting on
    /// `task_uuid`. Unknown or already-completed task uuids are dropped with
    /// a diagnostic; returns whether a continuation was resolved.
    pub fn complete(&self, task_uuid: &str, body: Value) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(task_uuid);
        match sender {
            Some(tx) => {
                if tx.send(body).is_err() {
                    warn!(task_uuid, "caller gave up before its callback arrived");
                    return false;
                }
                true
            }
            None => {
                warn!(task_uuid, "no pending command for callback, dropping it");
                false
            }
        }
    }

    fn discard(&self, task_uuid: &str) {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .remove(task_uuid);
    }
}

/// Router exposing the callback endpoint; merge it into the process's axum
/// app and point the client's callback url at it.
pub fn callback_router(client: AgentClient) -> Router {
    Router::new()
        .route(CALLBACK_PATH, post(handle_callback))
        .layer(Extension(client))
}

async fn handle_callback(
    Extension(client): Extension<AgentClient>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let Some(task_uuid) = headers
        .get(TASK_UUID_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        warn!("agent callback without a {TASK_UUID_HEADER} header");
        return StatusCode::BAD_REQUEST;
    };
    client.complete(task_uuid, body);
    StatusCode::OK
}
