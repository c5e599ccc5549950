use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use super::client::IDEMPOTENCY_HEADER;
use crate::command::model::DashboardCommand;
use crate::db::queries;
use crate::execute::error::ExecuteError;
use crate::execute::executor::{Executor, Outcome};
use crate::execute::idempotency::{self, Claim, KeyScope};
use crate::execute::records::{NewMaterial, NewReceipt, NewTask, NewTimeEntry};

#[derive(Clone)]
pub struct AppState {
    executor: Executor,
    /// Bearer token → user id.
    tokens: Arc<HashMap<String, String>>,
}

impl AppState {
    pub fn new(executor: Executor, tokens: HashMap<String, String>) -> Self {
        Self {
            executor,
            tokens: Arc::new(tokens),
        }
    }
}

const COMMAND_ROUTE: &str = "/execute-dashboard-command";
const ENTRIES_ROUTE: &str = "/api/entries";
const TASKS_ROUTE: &str = "/api/tasks";
const MATERIALS_ROUTE: &str = "/api/materials";
const RECEIPTS_ROUTE: &str = "/api/receipts";

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(COMMAND_ROUTE, post(execute_dashboard_command))
        .route("/api/worksites", get(list_worksites))
        .route(ENTRIES_ROUTE, post(post_entry))
        .route(TASKS_ROUTE, post(post_task))
        .route(MATERIALS_ROUTE, post(post_material))
        .route(RECEIPTS_ROUTE, post(post_receipt))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "auth_required",
            message: "authentication required".to_string(),
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message,
        }
    }

    fn in_flight() -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: "idempotency_in_flight",
            message: "a request with this Idempotency-Key is still being processed".to_string(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        error!("request failed: {err:#}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: format!("{err:#}"),
        }
    }
}

impl From<ExecuteError> for ApiError {
    fn from(err: ExecuteError) -> Self {
        let status = match &err {
            ExecuteError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ExecuteError::WorksiteNotFound(_) => StatusCode::NOT_FOUND,
            ExecuteError::WriteFailed(_) | ExecuteError::Internal(_) => {
                error!("command failed: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "success": false,
                "error": self.message,
                "errorKind": self.kind,
            })),
        )
            .into_response()
    }
}

/// Resolve the bearer token to a user id. Runs before any other work.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(ApiError::unauthorized)?;
    state
        .tokens
        .get(token)
        .cloned()
        .ok_or_else(ApiError::unauthorized)
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

/// Shared write path: authenticate, decode the body, claim the
/// idempotency key for this user and route, run the write and store its
/// response under the key.
async fn handle_write<T, F, Fut>(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
    route: &'static str,
    write: F,
) -> Result<Json<Value>, ApiError>
where
    T: DeserializeOwned,
    F: FnOnce(Executor, String, T) -> Fut,
    Fut: Future<Output = Result<Outcome, ExecuteError>>,
{
    let user = authenticate(&state, &headers)?;
    let request: T = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))?;

    let scope = idempotency_key(&headers).map(|key| KeyScope {
        user: user.clone(),
        route,
        key,
    });
    let store = state.executor.store().clone();
    if let Some(scope) = &scope {
        match idempotency::claim(&store, scope)
            .await
            .map_err(ApiError::internal)?
        {
            Claim::Fresh => {}
            Claim::Replay(stored) => {
                debug!("replayed idempotency key {} on {route}", scope.key);
                return Ok(Json(stored));
            }
            Claim::InFlight => return Err(ApiError::in_flight()),
        }
    }

    let result = write(state.executor.clone(), user, request).await;
    let Some(scope) = scope else {
        return Ok(Json(result?.to_json()));
    };

    // A failed write or a conflict stored nothing, so a retry must run again.
    let outcome = match result {
        Ok(outcome) if !outcome.is_conflict() => outcome,
        other => {
            if let Err(err) = idempotency::release(&store, &scope).await {
                warn!("failed to release idempotency key {}: {err:#}", scope.key);
            }
            return Ok(Json(other?.to_json()));
        }
    };
    let response = outcome.to_json();
    if let Err(err) = idempotency::complete(&store, &scope, &response).await {
        warn!("failed to store idempotency key {}: {err:#}", scope.key);
    }
    Ok(Json(response))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn execute_dashboard_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    handle_write(state, headers, body, COMMAND_ROUTE, |executor, user, command: DashboardCommand| async move {
        executor.execute(&user, &command).await
    })
    .await
}

async fn post_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    handle_write(state, headers, body, ENTRIES_ROUTE, |executor, user, entry: NewTimeEntry| async move {
        executor.record_time_entry(&user, entry).await
    })
    .await
}

async fn post_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    handle_write(state, headers, body, TASKS_ROUTE, |executor, user, task: NewTask| async move {
        executor.record_task(&user, task).await
    })
    .await
}

async fn post_material(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    handle_write(state, headers, body, MATERIALS_ROUTE, |executor, user, material: NewMaterial| async move {
        executor.record_material(&user, material).await
    })
    .await
}

async fn post_receipt(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    handle_write(state, headers, body, RECEIPTS_ROUTE, |executor, user, receipt: NewReceipt| async move {
        executor.record_receipt(&user, receipt).await
    })
    .await
}

#[derive(Deserialize)]
struct WorksitesQuery {
    limit: Option<usize>,
}

async fn list_worksites(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<WorksitesQuery>,
) -> Result<Json<Value>, ApiError> {
    authenticate(&state, &headers)?;
    let limit = q.limit.unwrap_or(200);
    let worksites = state
        .executor
        .store()
        .execute(move |conn| queries::list_worksites(conn, limit))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "worksites": worksites })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, Schema};
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TOKEN: &str = "secret-token";
    const OTHER_TOKEN: &str = "other-token";

    fn app() -> Router {
        app_with_store().0
    }

    fn app_with_store() -> (Router, Database) {
        let store = Database::open_in_memory(Schema::Store).unwrap();
        let tokens = HashMap::from([
            (TOKEN.to_string(), "user-1".to_string()),
            (OTHER_TOKEN.to_string(), "user-2".to_string()),
        ]);
        (routes(AppState::new(Executor::new(store.clone()), tokens)), store)
    }

    async fn count(store: &Database, table: &'static str) -> i64 {
        store
            .execute(move |conn| {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap()
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(key) = key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn project(address: &str, is_existing: bool) -> Value {
        json!({
            "type": "create_project",
            "projectInfo": {
                "name": "Herr Müller",
                "address": address,
                "city": "Hamburg",
                "isExisting": is_existing,
            }
        })
    }

    async fn create_worksite(app: &Router, address: &str) -> String {
        let (status, body) = send(
            app,
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            None,
            Some(project(address, false)),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["project"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (status, body) = send(&app(), "GET", "/health", None, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_unauthenticated_is_rejected_before_parsing() {
        let app = app();
        let garbage = Some(json!({"type": "nonsense"}));
        let (status, _) =
            send(&app, "POST", "/execute-dashboard-command", None, None, garbage.clone()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, body) =
            send(&app, "POST", "/execute-dashboard-command", Some("wrong"), None, garbage).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errorKind"], "auth_required");
        let (status, _) = send(&app, "GET", "/api/worksites", None, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_type_is_bad_request() {
        let (status, body) = send(
            &app(),
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            None,
            Some(json!({"type": "delete_everything"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("delete_everything"));
    }

    #[tokio::test]
    async fn test_missing_required_field_is_bad_request() {
        let (status, body) = send(
            &app(),
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            None,
            Some(json!({
                "type": "create_task",
                "taskInfo": {
                    "projectAddress": "  ",
                    "description": "Zaun streichen",
                    "priority": "high",
                    "category": "work",
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorKind"], "invalid_request");
    }

    #[tokio::test]
    async fn test_unknown_worksite_is_not_found() {
        let (status, body) = send(
            &app(),
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            None,
            Some(json!({
                "type": "create_task",
                "taskInfo": {
                    "projectAddress": "Nirgendwo 1",
                    "description": "Zaun streichen",
                    "priority": "high",
                    "category": "work",
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("Nirgendwo 1"));
    }

    #[tokio::test]
    async fn test_duplicate_worksite_is_a_conflict_payload() {
        let app = app();
        let id = create_worksite(&app, "Hauptstraße 10").await;

        let (status, body) = send(
            &app,
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            None,
            Some(project("hauptstraße 10", false)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["error"].is_string());
        assert_eq!(body["existingProject"]["id"], id.as_str());
        assert!(body.get("success").is_none());

        let (status, body) = send(
            &app,
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            None,
            Some(project("Hauptstraße 10", true)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reused"], true);
        assert_eq!(body["project"]["id"], id.as_str());
    }

    #[tokio::test]
    async fn test_task_command_on_existing_worksite() {
        let app = app();
        let id = create_worksite(&app, "Lindenweg 3").await;
        let (status, body) = send(
            &app,
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            None,
            Some(json!({
                "type": "create_task",
                "taskInfo": {
                    "projectAddress": "Lindenweg",
                    "description": "Fenster abdichten",
                    "priority": "urgent",
                    "category": "work",
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert_eq!(body["task"]["worksiteId"], id.as_str());
        assert_eq!(body["task"]["createdBy"], "user-1");
    }

    #[tokio::test]
    async fn test_idempotency_key_replays_first_response() {
        let app = app();
        let id = create_worksite(&app, "Lindenweg 3").await;
        let task = json!({ "worksiteId": id, "content": "Gerüst abbauen" });

        let (status, first) =
            send(&app, "POST", "/api/tasks", Some(TOKEN), Some("k-1"), Some(task.clone())).await;
        assert_eq!(status, StatusCode::OK, "{first}");
        let (status, second) =
            send(&app, "POST", "/api/tasks", Some(TOKEN), Some("k-1"), Some(task.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, second);

        let (_, third) =
            send(&app, "POST", "/api/tasks", Some(TOKEN), Some("k-2"), Some(task)).await;
        assert_ne!(third["task"]["id"], first["task"]["id"]);
    }

    #[tokio::test]
    async fn test_record_routes_and_listing() {
        let app = app();
        let id = create_worksite(&app, "Lindenweg 3").await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/entries",
            Some(TOKEN),
            None,
            Some(json!({
                "worksiteId": id,
                "date": "2024-03-01",
                "startTime": "7:30",
                "endTime": "16:00",
                "breakMinutes": 30,
                "description": "Estrich",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["timeEntry"]["hours"], 8.0);

        let (status, _) = send(
            &app,
            "POST",
            "/api/materials",
            Some(TOKEN),
            None,
            Some(json!({ "worksiteId": id, "name": "Zement", "quantity": 0, "unit": "Sack" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            "POST",
            "/api/receipts",
            Some(TOKEN),
            None,
            Some(json!({ "vendor": "Baumarkt", "amount": 42.5, "date": "2024-03-01" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["receipt"]["worksiteId"].is_null());

        let (status, body) = send(&app, "GET", "/api/worksites", Some(TOKEN), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["worksites"].as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_with_one_key_write_once() {
        let (app, store) = app_with_store();

        for round in 0..10 {
            let key = format!("create-{round}");
            let body = project(&format!("Ringstraße {round}"), false);
            let first = send(
                &app,
                "POST",
                "/execute-dashboard-command",
                Some(TOKEN),
                Some(&key),
                Some(body.clone()),
            );
            let second = send(
                &app,
                "POST",
                "/execute-dashboard-command",
                Some(TOKEN),
                Some(&key),
                Some(body),
            );
            let ((s1, b1), (s2, b2)) = tokio::join!(first, second);

            for (status, body) in [(s1, &b1), (s2, &b2)] {
                assert!(
                    status == StatusCode::OK || status == StatusCode::CONFLICT,
                    "{status} {body}"
                );
                if status == StatusCode::CONFLICT {
                    assert_eq!(body["errorKind"], "idempotency_in_flight");
                }
                if status == StatusCode::OK {
                    assert_eq!(body["success"], true, "{body}");
                }
            }
            assert!(s1 == StatusCode::OK || s2 == StatusCode::OK);
            if s1 == StatusCode::OK && s2 == StatusCode::OK {
                assert_eq!(b1, b2);
            }
        }

        assert_eq!(count(&store, "worksites").await, 10);
    }

    #[tokio::test]
    async fn test_key_reused_on_another_route_still_writes() {
        let (app, store) = app_with_store();
        let (status, body) = send(
            &app,
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            Some("shared"),
            Some(project("Lindenweg 3", false)),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let (status, body) = send(
            &app,
            "POST",
            "/api/receipts",
            Some(TOKEN),
            Some("shared"),
            Some(json!({ "vendor": "Baumarkt", "amount": 12.0, "date": "2024-03-01" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["receipt"].is_object(), "{body}");
        assert_eq!(count(&store, "receipts").await, 1);
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_user() {
        let (app, store) = app_with_store();
        let id = create_worksite(&app, "Lindenweg 3").await;
        let task = json!({ "worksiteId": id, "content": "Gerüst abbauen" });

        let (status, mine) =
            send(&app, "POST", "/api/tasks", Some(TOKEN), Some("same"), Some(task.clone())).await;
        assert_eq!(status, StatusCode::OK, "{mine}");
        let (status, theirs) =
            send(&app, "POST", "/api/tasks", Some(OTHER_TOKEN), Some("same"), Some(task)).await;
        assert_eq!(status, StatusCode::OK, "{theirs}");

        assert_ne!(mine["task"]["id"], theirs["task"]["id"]);
        assert_eq!(theirs["task"]["createdBy"], "user-2");
        assert_eq!(count(&store, "tasks").await, 2);
    }

    #[tokio::test]
    async fn test_failed_write_releases_its_key() {
        let app = app();
        let task = json!({
            "type": "create_task",
            "taskInfo": {
                "projectAddress": "Lindenweg 3",
                "description": "Fenster abdichten",
                "priority": "high",
                "category": "work",
            }
        });

        let (status, _) = send(
            &app,
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            Some("retry"),
            Some(task.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        create_worksite(&app, "Lindenweg 3").await;
        let (status, body) = send(
            &app,
            "POST",
            "/execute-dashboard-command",
            Some(TOKEN),
            Some("retry"),
            Some(task),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
    }
}
