//! `reqwest`-backed transport with ticket authentication.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{map_status, ApiRequest, Method, Transport};
use crate::config::ResourceConfig;
use crate::error::{ErrorKind, PveError, Result};

const AUTH_COOKIE: &str = "PVEAuthCookie";
const CSRF_HEADER: &str = "CSRFPreventionToken";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const LOGIN_STATUS_MAP: super::StatusMap = &[
    (400, ErrorKind::InvalidParameters),
    (401, ErrorKind::AuthenticationFailed),
];

/// Session obtained from `access/ticket`.
#[derive(Clone)]
struct Session {
    ticket: String,
    csrf_token: String,
}

#[derive(Deserialize)]
struct TicketResponse {
    ticket: Option<String>,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: Option<String>,
}

/// Transport against a live cluster.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    session: RwLock<Option<Session>>,
}

impl HttpTransport {
    /// Build a client for the cluster described by `config`. No network
    /// traffic happens until [`HttpTransport::login`].
    pub fn new(config: &ResourceConfig) -> Result<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PveError::ConnectionFailed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url(),
            user: config.user.clone(),
            password: config.password.clone(),
            session: RwLock::new(None),
        })
    }

    /// Build a client and log in.
    pub async fn connect(config: &ResourceConfig) -> Result<Self> {
        let transport = Self::new(config)?;
        transport.login().await?;
        Ok(transport)
    }

    /// Exchange username and password for a session ticket and CSRF token.
    #[instrument(skip(self), fields(user = %self.user))]
    pub async fn login(&self) -> Result<()> {
        let url = format!("{}/access/ticket", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "username": self.user, "password": self.password }))
            .send()
            .await
            .map_err(|e| PveError::ConnectionFailed(e.to_string()))?;

        let data = unwrap_response(response, LOGIN_STATUS_MAP).await?;
        let ticket: TicketResponse = serde_json::from_value(data)
            .map_err(|e| PveError::UnexpectedResponse(format!("ticket response: {}", e)))?;

        match (ticket.ticket, ticket.csrf_token) {
            (Some(ticket), Some(csrf_token)) if !ticket.is_empty() && !csrf_token.is_empty() => {
                *self.session.write().await = Some(Session { ticket, csrf_token });
                info!(url = %self.base_url, "Authenticated against hypervisor API");
                Ok(())
            }
            _ => Err(PveError::AuthenticationFailed(
                "login response did not carry both a ticket and a CSRF token".to_string(),
            )),
        }
    }

    async fn send(&self, request: &ApiRequest) -> Result<Value> {
        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| PveError::AuthenticationFailed("not logged in".to_string()))?;

        let url = format!("{}/{}", self.base_url, request.path.trim_start_matches('/'));
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };

        builder = builder.header(
            reqwest::header::COOKIE,
            format!("{}={}", AUTH_COOKIE, session.ticket),
        );
        if request.method != Method::Get {
            builder = builder.header(CSRF_HEADER, session.csrf_token.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PveError::ConnectionFailed(e.to_string()))?;

        unwrap_response(response, request.status_map).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: ApiRequest) -> Result<Value> {
        debug!(method = %request.method, path = %request.path, "API request");

        match self.send(&request).await {
            // Tickets expire after two hours; log in once more and replay.
            Err(PveError::AuthenticationFailed(message)) => {
                warn!(error = %message, "Session rejected, logging in again");
                self.login().await?;
                self.send(&request).await
            }
            other => other,
        }
    }
}

/// Check the status and unwrap the `{"data": ...}` envelope.
async fn unwrap_response(response: reqwest::Response, status_map: super::StatusMap) -> Result<Value> {
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| status.to_string());
        warn!(status = status.as_u16(), error = %message, "API request failed");
        return Err(map_status(status.as_u16(), &message, status_map));
    }

    let envelope: Value = response
        .json()
        .await
        .map_err(|e| PveError::UnexpectedResponse(e.to_string()))?;

    Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
}

/// Pull a human-readable reason out of an error body.
///
/// Parameter errors arrive as `{"errors": {"field": "reason"}}`, everything
/// else as `{"message": "..."}`.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;

    if let Some(errors) = value.get("errors").and_then(Value::as_object) {
        let joined = errors
            .iter()
            .map(|(field, reason)| format!("{}: {}", field, reason.as_str().unwrap_or_default().trim()))
            .collect::<Vec<_>>()
            .join("; ");
        if !joined.is_empty() {
            return Some(joined);
        }
    }

    value
        .get("message")
        .and_then(Value::as_str)
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
}
