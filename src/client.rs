use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::api::{SseDecoder, ACTOR_ID_HEADER, ACTOR_ROLE_HEADER};
use crate::broadcast::SessionEvent;
use crate::clock::{from_epoch_millis, TimeSource};
use crate::sessions::auth::Actor;
use crate::sessions::model::{Session, SessionStatus, Settings};
use crate::sessions::service::{NewSession, SessionPatch};

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:4000";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error body returned by the server
#[derive(Debug, Error)]
#[error("{message} ({code}, HTTP {status})")]
pub struct RemoteError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeBody {
    server_time: i64,
}

/// HTTP client for the session API, acting as one fixed actor
pub struct ApiClient {
    client: Client,
    base: url::Url,
    actor: Actor,
}

impl ApiClient {
    pub fn new(base_url: &str, actor: Actor) -> Result<Self> {
        let mut base = url::Url::parse(base_url).context("Invalid server URL")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        // No overall timeout: the event stream stays open indefinitely
        let client = Client::builder()
            .user_agent(format!("playtime/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base,
            actor,
        })
    }

    pub fn base_url(&self) -> &url::Url {
        &self.base
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub async fn list(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        let mut request = self.request(reqwest::Method::GET, "sessions")?;
        if let Some(status) = status {
            request = request.query(&[("status", status.as_str())]);
        }
        self.send_json(request).await
    }

    pub async fn create(&self, new: &NewSession) -> Result<Session> {
        let body = serde_json::json!({
            "childName": new.child_name,
            "durationMinutes": new.duration_minutes,
            "notes": new.notes,
        });
        self.send_json(self.request(reqwest::Method::POST, "sessions")?.json(&body))
            .await
    }

    pub async fn update(&self, id: Uuid, patch: &SessionPatch) -> Result<Session> {
        let mut body = serde_json::Map::new();
        if let Some(name) = &patch.child_name {
            body.insert("childName".to_string(), name.clone().into());
        }
        if let Some(notes) = &patch.notes {
            body.insert("notes".to_string(), notes.clone().into());
        }
        if let Some(minutes) = patch.duration_minutes {
            body.insert("durationMinutes".to_string(), minutes.into());
        }

        let request = self
            .request(reqwest::Method::PATCH, &format!("sessions/{}", id))?
            .json(&body);
        self.send_json(request).await
    }

    pub async fn pause(&self, id: Uuid) -> Result<Session> {
        self.action(id, "pause").await
    }

    pub async fn resume(&self, id: Uuid) -> Result<Session> {
        self.action(id, "resume").await
    }

    pub async fn confirm_exit(&self, id: Uuid) -> Result<Session> {
        self.action(id, "confirm-exit").await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Session> {
        self.action(id, "cancel").await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let request = self.request(reqwest::Method::DELETE, &format!("sessions/{}", id))?;
        let _: serde_json::Value = self.send_json(request).await?;
        Ok(())
    }

    pub async fn settings(&self) -> Result<Settings> {
        self.send_json(self.request(reqwest::Method::GET, "settings")?)
            .await
    }

    pub async fn update_settings(&self, default_duration_minutes: i64) -> Result<Settings> {
        let body = serde_json::json!({ "defaultDurationMinutes": default_duration_minutes });
        self.send_json(self.request(reqwest::Method::PATCH, "settings")?.json(&body))
            .await
    }

    pub async fn server_time(&self) -> Result<DateTime<Utc>> {
        let body: ServerTimeBody = self
            .send_json(self.request(reqwest::Method::GET, "time")?)
            .await?;
        from_epoch_millis(body.server_time).context("Server time out of range")
    }

    /// Open the event feed. The stream ends when the server closes it.
    pub async fn events(&self) -> Result<BoxStream<'static, Result<SessionEvent>>> {
        let response = self
            .authorized(self.client.get(self.url("events")?))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("Failed to connect to event stream")?;
        let response = check_status(response).await?;

        debug!("Event stream connected");
        Ok(decode_events(response.bytes_stream()).boxed())
    }

    async fn action(&self, id: Uuid, action: &str) -> Result<Session> {
        let request =
            self.request(reqwest::Method::POST, &format!("sessions/{}/{}", id, action))?;
        self.send_json(request).await
    }

    fn url(&self, path: &str) -> Result<url::Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid request path: {}", path))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(ACTOR_ID_HEADER, &self.actor.id)
            .header(ACTOR_ROLE_HEADER, self.actor.role.to_string())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder> {
        Ok(self
            .authorized(self.client.request(method, self.url(path)?))
            .timeout(REQUEST_TIMEOUT))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.context("Failed to reach server")?;
        let response = check_status(response).await?;
        response.json().await.context("Invalid response body")
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let error = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => RemoteError {
            status: status.as_u16(),
            code: body.code.unwrap_or_else(|| "unknown".to_string()),
            message: body.error,
        },
        Err(_) => RemoteError {
            status: status.as_u16(),
            code: "unknown".to_string(),
            message: if text.is_empty() {
                status.to_string()
            } else {
                text
            },
        },
    };
    Err(error.into())
}

/// Turn a raw `text/event-stream` byte stream into session events
fn decode_events<S, B, E>(bytes: S) -> impl futures::Stream<Item = Result<SessionEvent>> + Send
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    struct State<S> {
        bytes: Pin<Box<S>>,
        pending: Vec<u8>,
        decoder: SseDecoder,
        ready: VecDeque<Result<SessionEvent>>,
    }

    let state = State {
        bytes: Box::pin(bytes),
        pending: Vec::new(),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((event, state));
            }

            let chunk = match state.bytes.next().await? {
                Ok(chunk) => chunk,
                Err(e) => {
                    let err = anyhow::Error::new(e).context("Event stream interrupted");
                    return Some((Err(err), state));
                }
            };
            state.pending.extend_from_slice(chunk.as_ref());

            // Only hand whole lines to the decoder so multi-byte characters
            // are never split
            let Some(last_newline) = state.pending.iter().rposition(|b| *b == b'\n') else {
                continue;
            };
            let complete: Vec<u8> = state.pending.drain(..=last_newline).collect();
            let text = match String::from_utf8(complete) {
                Ok(text) => text,
                Err(e) => {
                    let err = anyhow::Error::new(e).context("Event stream is not UTF-8");
                    return Some((Err(err), state));
                }
            };

            for (name, data) in state.decoder.push(&text) {
                state.ready.push_back(SessionEvent::from_wire(&name, &data));
            }
        }
    })
}

/// Clock samples taken through an authenticated client
#[async_trait::async_trait]
impl TimeSource for ApiClient {
    async fn server_time(&self) -> Result<DateTime<Utc>> {
        ApiClient::server_time(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::encode_event;
    use chrono::DateTime;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = ApiClient::new("http://127.0.0.1:4000/api", Actor::admin("a")).unwrap();
        assert_eq!(client.url("sessions").unwrap().as_str(), "http://127.0.0.1:4000/api/sessions");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ApiClient::new("::nope::", Actor::admin("a")).is_err());
    }

    #[tokio::test]
    async fn test_decode_events_across_chunk_boundaries() {
        let session = Session::start(
            "Zoë".to_string(),
            10,
            None,
            "admin".to_string(),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        );
        let deleted = Uuid::new_v4();

        let mut wire = b": connected\n\n".to_vec();
        wire.extend_from_slice(&encode_event(&SessionEvent::Created(session.clone())).unwrap());
        wire.extend_from_slice(&encode_event(&SessionEvent::Deleted { id: deleted }).unwrap());

        // Split inside the two-byte 'ë'
        let split = wire.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            vec![Ok(wire[..split].to_vec()), Ok(wire[split..].to_vec())];

        let events: Vec<SessionEvent> = decode_events(stream::iter(chunks))
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![SessionEvent::Created(session), SessionEvent::Deleted { id: deleted }]
        );
    }
}
