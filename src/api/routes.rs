use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error, warn};
use url::form_urlencoded;
use uuid::Uuid;

use super::sse::event_stream;
use crate::broadcast::Subscription;
use crate::clock::to_epoch_millis;
use crate::error::SessionError;
use crate::sessions::auth::{Actor, Role};
use crate::sessions::model::SessionStatus;
use crate::sessions::service::{NewSession, SessionPatch, SessionService};

pub type ApiBody = UnsyncBoxBody<Bytes, Infallible>;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Error response: `{"error": message, "code": code}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", "Not Found")
    }

    fn into_response(self) -> Response<ApiBody> {
        let body = serde_json::json!({ "error": self.message, "code": self.code }).to_string();
        json_response(self.status, body)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::Validation(_) => StatusCode::BAD_REQUEST,
            SessionError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Forbidden { .. } => StatusCode::FORBIDDEN,
            SessionError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

type ApiResult = Result<Response<ApiBody>, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    child_name: Option<String>,
    duration_minutes: Option<Value>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSessionBody {
    child_name: Option<String>,
    notes: Option<String>,
    duration_minutes: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSettingsBody {
    default_duration_minutes: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

#[derive(Debug, Serialize)]
struct Deleted {
    ok: bool,
    id: Uuid,
}

/// Entry point for every HTTP request
pub async fn handle<B>(
    req: Request<B>,
    service: Arc<SessionService>,
) -> Result<Response<ApiBody>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match route(req, &service).await {
        Ok(response) => response,
        Err(err) => {
            if err.status.is_server_error() {
                error!("{} {} failed: {}", method, path, err.message);
            } else {
                debug!("{} {} -> {} {}", method, path, err.status.as_u16(), err.code);
            }
            err.into_response()
        }
    };

    Ok(no_store(response))
}

async fn route<B>(req: Request<B>, service: &SessionService) -> ApiResult
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_value(StatusCode::OK, &serde_json::json!({ "ok": true })),
        (&Method::GET, ["time"]) => server_time(service),
        (&Method::GET, ["sessions"]) => {
            let actor = actor_from_headers(req.headers())?;
            list_sessions(req.uri().query(), &actor, service).await
        }
        (&Method::POST, ["sessions"]) => {
            let actor = actor_from_headers(req.headers())?;
            let body: CreateSessionBody = read_json(req).await?;
            create_session(body, &actor, service).await
        }
        (&Method::PATCH, ["sessions", id]) => {
            let id = parse_id(id)?;
            let actor = actor_from_headers(req.headers())?;
            let body: UpdateSessionBody = read_json(req).await?;
            update_session(id, body, &actor, service).await
        }
        (&Method::DELETE, ["sessions", id]) => {
            let id = parse_id(id)?;
            let actor = actor_from_headers(req.headers())?;
            service.delete(id, &actor).await?;
            json_value(StatusCode::OK, &Deleted { ok: true, id })
        }
        (&Method::POST, ["sessions", id, action]) => {
            let id = parse_id(id)?;
            let actor = actor_from_headers(req.headers())?;
            let session = match *action {
                "pause" => service.pause(id, &actor).await?,
                "resume" => service.resume(id, &actor).await?,
                "confirm-exit" => service.confirm_exit(id, &actor).await?,
                "cancel" => service.cancel(id, &actor).await?,
                _ => return Err(ApiError::not_found()),
            };
            json_value(StatusCode::OK, &session)
        }
        (&Method::GET, ["settings"]) => {
            let actor = actor_from_headers(req.headers())?;
            json_value(StatusCode::OK, &service.settings(&actor).await?)
        }
        (&Method::PATCH, ["settings"]) => {
            let actor = actor_from_headers(req.headers())?;
            let body: UpdateSettingsBody = read_json(req).await?;
            let minutes = body
                .default_duration_minutes
                .as_ref()
                .and_then(whole_minutes)
                .ok_or_else(|| {
                    ApiError::bad_request("defaultDurationMinutes must be a whole number")
                })?;
            json_value(StatusCode::OK, &service.update_settings(minutes, &actor).await?)
        }
        (&Method::GET, ["events"]) => {
            let actor = actor_from_headers(req.headers())?;
            let subscription = service.subscribe(&actor)?;
            debug!("Event stream opened for {}", actor.id);
            Ok(sse_response(subscription))
        }
        _ => Err(ApiError::not_found()),
    }
}

fn server_time(service: &SessionService) -> ApiResult {
    json_value(
        StatusCode::OK,
        &ServerTime {
            server_time: to_epoch_millis(service.now()),
        },
    )
}

async fn list_sessions(query: Option<&str>, actor: &Actor, service: &SessionService) -> ApiResult {
    let status = form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .find(|(key, _)| key == "status")
        .map(|(_, value)| value.parse::<SessionStatus>())
        .transpose()
        .map_err(ApiError::bad_request)?;

    let sessions = service.list(actor, status).await?;
    json_value(StatusCode::OK, &sessions)
}

async fn create_session(body: CreateSessionBody, actor: &Actor, service: &SessionService) -> ApiResult {
    let request = NewSession {
        child_name: body.child_name.unwrap_or_default(),
        duration_minutes: body.duration_minutes.as_ref().and_then(duration_input),
        notes: body.notes,
    };
    let session = service.create(request, actor).await?;
    json_value(StatusCode::CREATED, &session)
}

async fn update_session(
    id: Uuid,
    body: UpdateSessionBody,
    actor: &Actor,
    service: &SessionService,
) -> ApiResult {
    let duration_minutes = match body.duration_minutes {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            whole_minutes(&value)
                .ok_or_else(|| ApiError::bad_request("durationMinutes must be a whole number"))?,
        ),
    };

    let patch = SessionPatch {
        child_name: body.child_name,
        notes: body.notes,
        duration_minutes,
    };
    let session = service.update(id, patch, actor).await?;
    json_value(StatusCode::OK, &session)
}

/// Lenient form used on create: JSON numbers and numeric strings, fractions
/// truncated
fn duration_input(value: &Value) -> Option<i64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !number.is_finite() || number.abs() > i64::MAX as f64 {
        return None;
    }
    Some(number.trunc() as i64)
}

/// Strict form used when editing: the value must be an integer, given either
/// as a JSON number with no fractional part or as a numeric string
fn whole_minutes(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            let f = n.as_f64()?;
            (f.is_finite() && f.fract() == 0.0 && f.abs() <= i64::MAX as f64).then(|| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Identity set by the authentication layer in front of this server
fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let id = headers
        .get(ACTOR_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Missing X-Actor-Id header"))?;

    let role = headers
        .get(ACTOR_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing X-Actor-Role header"))?
        .parse::<Role>()
        .map_err(ApiError::unauthorized)?;

    Ok(Actor {
        id: id.to_string(),
        role,
    })
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid session id: {}", raw)))
}

async fn read_json<B, T>(req: Request<B>) -> Result<T, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
    T: DeserializeOwned,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to read body: {}", e)))?
        .to_bytes();

    if bytes.is_empty() {
        return serde_json::from_str("{}")
            .map_err(|e| ApiError::bad_request(format!("Invalid JSON: {}", e)));
    }

    serde_json::from_slice(&bytes).map_err(|e| ApiError::bad_request(format!("Invalid JSON: {}", e)))
}

fn full(body: impl Into<Bytes>) -> ApiBody {
    Full::new(body.into()).boxed_unsync()
}

fn json_response(status: StatusCode, json: String) -> Response<ApiBody> {
    let mut response = Response::new(full(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_value<T: Serialize>(status: StatusCode, value: &T) -> ApiResult {
    let json = serde_json::to_string(value).map_err(|e| {
        warn!("Failed to serialize response: {}", e);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "Serialization failed")
    })?;
    Ok(json_response(status, json))
}

fn sse_response(subscription: Subscription) -> Response<ApiBody> {
    let body = StreamBody::new(event_stream(subscription)).boxed_unsync();
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response
}

fn no_store(mut response: Response<ApiBody>) -> Response<ApiBody> {
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use crate::sessions::model::Session;
    use crate::store::JsonFileStore;

    fn service() -> Arc<SessionService> {
        let store = Arc::new(JsonFileStore::in_memory());
        Arc::new(SessionService::new(store.clone(), store, BroadcastHub::new()))
    }

    fn request(method: Method, uri: &str, role: Option<&str>, body: &str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(role) = role {
            builder = builder
                .header(ACTOR_ID_HEADER, "tester")
                .header(ACTOR_ROLE_HEADER, role);
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    async fn send(service: &Arc<SessionService>, req: Request<Full<Bytes>>) -> (StatusCode, Value) {
        let response = handle(req, service.clone()).await.unwrap();
        let status = response.status();
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_time_endpoint_needs_no_identity() {
        let service = service();
        let (status, body) = send(&service, request(Method::GET, "/time", None, "")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["serverTime"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let service = service();
        let (status, body) = send(&service, request(Method::GET, "/sessions", None, "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_create_accepts_numeric_string_duration() {
        let service = service();
        let (status, body) = send(
            &service,
            request(
                Method::POST,
                "/sessions",
                Some("ADMIN"),
                r#"{"childName":"Ana","durationMinutes":"20"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session: Session = serde_json::from_value(body).unwrap();
        assert_eq!(session.duration_minutes, 20);
        assert_eq!(session.created_by, "tester");
    }

    #[tokio::test]
    async fn test_create_falls_back_for_garbage_duration() {
        let service = service();
        let (_, body) = send(
            &service,
            request(
                Method::POST,
                "/sessions",
                Some("ADMIN"),
                r#"{"childName":"Ana","durationMinutes":"soon"}"#,
            ),
        )
        .await;
        assert_eq!(body["durationMinutes"], 15);
    }

    #[tokio::test]
    async fn test_error_codes_map_to_statuses() {
        let service = service();

        let (status, body) = send(
            &service,
            request(Method::POST, "/sessions", Some("ADMIN"), r#"{"childName":""}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_error");

        let (status, body) = send(
            &service,
            request(Method::POST, "/sessions", Some("EMPLOYEE"), r#"{"childName":"Ana"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");

        let missing = format!("/sessions/{}/pause", Uuid::new_v4());
        let (status, body) = send(&service, request(Method::POST, &missing, Some("ADMIN"), "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_pause_twice_is_conflict() {
        let service = service();
        let (_, created) = send(
            &service,
            request(Method::POST, "/sessions", Some("ADMIN"), r#"{"childName":"Ana"}"#),
        )
        .await;
        let uri = format!("/sessions/{}/pause", created["id"].as_str().unwrap());

        let (status, body) = send(&service, request(Method::POST, &uri, Some("ADMIN"), "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "PAUSED");

        let (status, body) = send(&service, request(Method::POST, &uri, Some("ADMIN"), "")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "invalid_transition");
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let service = service();
        send(
            &service,
            request(Method::POST, "/sessions", Some("ADMIN"), r#"{"childName":"Ana"}"#),
        )
        .await;

        let (_, running) = send(
            &service,
            request(Method::GET, "/sessions?status=RUNNING", Some("EMPLOYEE"), ""),
        )
        .await;
        assert_eq!(running.as_array().unwrap().len(), 1);

        let (_, paused) = send(
            &service,
            request(Method::GET, "/sessions?status=PAUSED", Some("EMPLOYEE"), ""),
        )
        .await;
        assert!(paused.as_array().unwrap().is_empty());

        let (status, _) = send(
            &service,
            request(Method::GET, "/sessions?status=DONE", Some("EMPLOYEE"), ""),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let service = service();
        let (status, body) = send(
            &service,
            request(
                Method::PATCH,
                "/settings",
                Some("ADMIN"),
                r#"{"defaultDurationMinutes":30}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["defaultDurationMinutes"], 30);

        let (status, _) = send(
            &service,
            request(Method::PATCH, "/settings", Some("ADMIN"), r#"{"defaultDurationMinutes":-1}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_duration_input_forms() {
        assert_eq!(duration_input(&serde_json::json!(12)), Some(12));
        assert_eq!(duration_input(&serde_json::json!(12.9)), Some(12));
        assert_eq!(duration_input(&serde_json::json!(" 7 ")), Some(7));
        assert_eq!(duration_input(&serde_json::json!("x")), None);
        assert_eq!(duration_input(&serde_json::json!(true)), None);
    }

    #[test]
    fn test_whole_minutes_rejects_fractions() {
        assert_eq!(whole_minutes(&serde_json::json!(12)), Some(12));
        assert_eq!(whole_minutes(&serde_json::json!(12.0)), Some(12));
        assert_eq!(whole_minutes(&serde_json::json!("25")), Some(25));
        assert_eq!(whole_minutes(&serde_json::json!(12.9)), None);
        assert_eq!(whole_minutes(&serde_json::json!("12.5")), None);
        assert_eq!(whole_minutes(&serde_json::json!(null)), None);
    }

    #[tokio::test]
    async fn test_fractional_settings_duration_is_rejected() {
        let service = service();
        let (status, body) = send(
            &service,
            request(
                Method::PATCH,
                "/settings",
                Some("ADMIN"),
                r#"{"defaultDurationMinutes":12.9}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_error");

        let (_, settings) = send(&service, request(Method::GET, "/settings", Some("ADMIN"), "")).await;
        assert_eq!(settings["defaultDurationMinutes"], 15);
    }

    #[tokio::test]
    async fn test_fractional_update_duration_is_rejected() {
        let service = service();
        let (_, created) = send(
            &service,
            request(
                Method::POST,
                "/sessions",
                Some("ADMIN"),
                r#"{"childName":"Ana","durationMinutes":12.9}"#,
            ),
        )
        .await;
        assert_eq!(created["durationMinutes"], 12);

        let uri = format!("/sessions/{}", created["id"].as_str().unwrap());
        let (status, body) = send(
            &service,
            request(Method::PATCH, &uri, Some("ADMIN"), r#"{"durationMinutes":20.5}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_error");

        let (status, body) = send(
            &service,
            request(Method::PATCH, &uri, Some("ADMIN"), r#"{"durationMinutes":20}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["durationMinutes"], 20);
    }
}
