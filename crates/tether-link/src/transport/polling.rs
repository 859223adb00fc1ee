//! HTTP long-poll fallback transport.
//!
//! Each `send` POSTs one envelope; the response carries any inbound
//! envelopes the server had pending (piggyback). `poll` is the same
//! exchange with no outbound envelope, issued by the controller on a
//! timer so inbound messages still flow when the client is quiet.
//!
//! Wire shape, camelCase JSON:
//!
//! ```text
//! request:  { "envelope": { ... } }      // absent for an empty poll
//! response: { "messages": [ { ... } ] }
//! ```
//!
//! A bearer token from the injected [`AuthProvider`] is attached to every
//! request. `401`/`403` surface as [`Error::Auth`] so the controller can
//! stop retrying credentials that will never work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tether_core::{AuthProvider, Envelope, Error, Result};

use super::Transport;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    envelope: Option<&'a Envelope>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollResponse {
    #[serde(default)]
    messages: Vec<Envelope>,
}

/// Long-poll transport over HTTP POST.
pub struct PollingTransport {
    url: String,
    auth: Arc<dyn AuthProvider>,
    client: reqwest::Client,
    // Held so the controller's inbound channel stays open while polling;
    // inbound messages are returned from the exchange, never pushed.
    inbound: Option<mpsc::UnboundedSender<Envelope>>,
}

impl PollingTransport {
    /// Creates a transport POSTing to `url` with tokens from `auth`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the HTTP client cannot be
    /// constructed.
    pub fn new(url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|err| Error::configuration(format!("failed to build http client: {err}")))?;

        Ok(Self {
            url: url.into(),
            auth,
            client,
            inbound: None,
        })
    }

    async fn exchange(&self, envelope: Option<&Envelope>) -> Result<Vec<Envelope>> {
        if self.inbound.is_none() {
            return Err(Error::transport("polling transport is not open"));
        }

        let token = self.auth.bearer_token().await?;
        let request = PollRequest { envelope };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|err| Error::transport_with_source("poll request failed", err))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::auth(format!("server rejected credentials ({status})")));
        }
        if !status.is_success() {
            return Err(Error::transport(format!("poll endpoint returned {status}")));
        }

        let body: PollResponse = response
            .json()
            .await
            .map_err(|err| Error::protocol(format!("malformed poll response: {err}")))?;

        Ok(body.messages)
    }
}

impl std::fmt::Debug for PollingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingTransport")
            .field("url", &self.url)
            .field("open", &self.inbound.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for PollingTransport {
    async fn open(&mut self, inbound: mpsc::UnboundedSender<Envelope>) -> Result<()> {
        self.inbound = Some(inbound);
        tracing::debug!(url = %self.url, "polling transport open");
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>> {
        self.exchange(Some(envelope)).await
    }

    async fn poll(&mut self) -> Result<Vec<Envelope>> {
        self.exchange(None).await
    }

    fn is_open(&self) -> bool {
        self.inbound.is_some()
    }

    async fn close(&mut self) {
        self.inbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::extract::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use tether_core::{Message, Priority, StaticTokenProvider};

    type Seen = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn spawn_stub(status: StatusCode, reply: serde_json::Value) -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();

        let app = Router::new().route(
            "/v1/poll",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let recorded = recorded.clone();
                let reply = reply.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    recorded.lock().unwrap().push((auth, body));
                    (status, Json(reply))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/v1/poll"), seen)
    }

    fn open_transport(url: &str) -> PollingTransport {
        let auth = Arc::new(StaticTokenProvider::new("test-token"));
        PollingTransport::new(url, auth).unwrap()
    }

    fn envelope(message_type: &str) -> Envelope {
        Envelope::from_message(&Message::new(
            message_type,
            serde_json::json!({}),
            Priority::Normal,
        ))
    }

    #[tokio::test]
    async fn send_posts_envelope_and_returns_piggyback() {
        let inbound = envelope("server.notice");
        let reply = serde_json::json!({ "messages": [inbound] });
        let (url, seen) = spawn_stub(StatusCode::OK, reply).await;

        let mut transport = open_transport(&url);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();

        let piggyback = transport.send(&envelope("task.submit")).await.unwrap();
        assert_eq!(piggyback.len(), 1);
        assert_eq!(piggyback[0].message_type, "server.notice");

        let requests = seen.lock().unwrap();
        let (auth, body) = &requests[0];
        assert_eq!(auth.as_deref(), Some("Bearer test-token"));
        assert_eq!(body["envelope"]["type"], "task.submit");
    }

    #[tokio::test]
    async fn poll_sends_empty_exchange() {
        let reply = serde_json::json!({ "messages": [] });
        let (url, seen) = spawn_stub(StatusCode::OK, reply).await;

        let mut transport = open_transport(&url);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();

        let messages = transport.poll().await.unwrap();
        assert!(messages.is_empty());

        let requests = seen.lock().unwrap();
        let (_, body) = &requests[0];
        assert!(body.get("envelope").is_none(), "empty poll carries no envelope");
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let (url, _seen) = spawn_stub(StatusCode::UNAUTHORIZED, serde_json::json!({})).await;

        let mut transport = open_transport(&url);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();

        let err = transport.poll().await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }), "got {err}");
    }

    #[tokio::test]
    async fn server_error_maps_to_transport_error() {
        let (url, _seen) = spawn_stub(StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({})).await;

        let mut transport = open_transport(&url);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();

        let err = transport.send(&envelope("x")).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "got {err}");
    }

    #[tokio::test]
    async fn missing_messages_field_defaults_to_empty() {
        let (url, _seen) = spawn_stub(StatusCode::OK, serde_json::json!({})).await;

        let mut transport = open_transport(&url);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();

        let messages = transport.poll().await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn send_when_closed_is_an_error() {
        let mut transport = open_transport("http://127.0.0.1:1/v1/poll");
        let err = transport.send(&envelope("x")).await.unwrap_err();
        assert!(err.to_string().contains("not open"));

        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        assert!(transport.is_open());
        transport.close().await;
        assert!(!transport.is_open());
    }
}
