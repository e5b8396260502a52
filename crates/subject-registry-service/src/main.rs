use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use subject_registry_api::{
    AuthContext, IssuedToken, LoginRequest, LogoutResult, SubjectRegistryApi, API_CONTRACT_VERSION,
};
use subject_registry_core::{
    OrderByClause, PageRequest, RegistryError, SortOrder, Subject, SubjectId, SubjectInput,
    SubjectOrderColumn, SubjectPage, SubjectPatch, DEFAULT_PER_PAGE,
};
use subject_registry_store_sqlite::{SchemaStatus, UpsertOutcome};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod graphql;

use graphql::{build_schema, RegistrySchema};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: SubjectRegistryApi,
    schema: RegistrySchema,
    allowed_origin: HeaderValue,
}

impl ServiceState {
    fn new(api: SubjectRegistryApi, allowed_origin: HeaderValue) -> Self {
        let schema = build_schema(api.clone());
        Self { api, schema, allowed_origin }
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, ServiceError> {
        let token = bearer_token(headers)
            .ok_or_else(|| ServiceError::new(StatusCode::UNAUTHORIZED, "Unauthenticated."))?;
        Ok(self.api.authenticate(token)?)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<RegistryError>() {
            Some(RegistryError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Some(RegistryError::Unauthenticated(_)) => StatusCode::UNAUTHORIZED,
            Some(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(RegistryError::Conflict(_)) => StatusCode::CONFLICT,
            None => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListSubjectsQuery {
    order_by: Option<String>,
    order: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

impl ListSubjectsQuery {
    fn order_by(&self) -> Result<Vec<OrderByClause>, RegistryError> {
        let order = match self.order.as_deref() {
            Some(raw) => SortOrder::parse(raw)
                .ok_or_else(|| RegistryError::Validation(format!("unknown sort order: {raw}")))?,
            None => SortOrder::Asc,
        };
        let Some(raw) = self.order_by.as_deref() else {
            return Ok(Vec::new());
        };
        let column = SubjectOrderColumn::parse(raw)
            .ok_or_else(|| RegistryError::Validation(format!("unknown order_by column: {raw}")))?;
        Ok(vec![OrderByClause::new(column, order)])
    }

    fn page(&self) -> PageRequest {
        PageRequest::new(self.page.unwrap_or(1), self.per_page.unwrap_or(DEFAULT_PER_PAGE))
    }
}

#[derive(Debug, Parser)]
#[command(name = "subject-registry-service")]
#[command(about = "HTTP and GraphQL service for the subject registry")]
struct Args {
    #[arg(long, env = "SUBJECT_REGISTRY_DB", default_value = "./subject_registry.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "SUBJECT_REGISTRY_BIND", default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
    /// Single browser origin allowed to call the API with credentials.
    #[arg(long, env = "SUBJECT_REGISTRY_ALLOWED_ORIGIN", default_value = "http://localhost:3000")]
    allowed_origin: String,
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn cors_layer(allowed_origin: HeaderValue) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(allowed_origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            AUTHORIZATION,
            HeaderName::from_static("x-xsrf-token"),
        ])
}

fn app(state: ServiceState) -> Router {
    let cors = cors_layer(state.allowed_origin.clone());
    Router::new()
        .route("/health", get(health))
        .route("/openapi", get(openapi))
        .route("/db/schema-version", get(db_schema_version))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/createSubject", post(create_subject))
        .route("/api/subjects", get(list_subjects))
        .route("/api/subjects/:id", get(show_subject).put(update_subject))
        .route("/api/me/subjects", get(my_subjects))
        .route("/graphql", post(graphql_handler))
        .route("/graphql/schema", get(graphql_schema))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let allowed_origin = HeaderValue::from_str(&args.allowed_origin)
        .with_context(|| format!("invalid allowed origin: {}", args.allowed_origin))?;

    let api = SubjectRegistryApi::new(args.db.clone());
    let migrated = api.migrate(false).context("failed to migrate database")?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = migrated.after_version.unwrap_or(migrated.current_version),
        "database ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, origin = %args.allowed_origin, "subject registry service listening");
    axum::serve(listener, app(ServiceState::new(api, allowed_origin)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    Ok(Json(envelope(state.api.schema_status()?)))
}

async fn login(
    State(state): State<ServiceState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<IssuedToken>>, ServiceError> {
    let Json(request) = payload?;
    Ok(Json(envelope(state.api.login(request)?)))
}

async fn logout(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Json<ServiceEnvelope<LogoutResult>> {
    Json(envelope(state.api.logout(bearer_token(&headers))))
}

async fn create_subject(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<SubjectInput>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<UpsertOutcome>>), ServiceError> {
    let auth = state.authenticate(&headers)?;
    let Json(input) = payload?;
    let outcome = state.api.create_subject(&auth, input)?;
    let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(envelope(outcome))))
}

async fn list_subjects(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ListSubjectsQuery>,
) -> Result<Json<ServiceEnvelope<SubjectPage>>, ServiceError> {
    state.authenticate(&headers)?;
    let page = state.api.page_subjects(&query.order_by()?, query.page())?;
    Ok(Json(envelope(page)))
}

async fn show_subject(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<Subject>>, ServiceError> {
    state.authenticate(&headers)?;
    let id = id.parse::<SubjectId>()?;
    let subject = state
        .api
        .get_subject(id)?
        .ok_or_else(|| RegistryError::NotFound(format!("subject {id}")))?;
    Ok(Json(envelope(subject)))
}

async fn update_subject(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<SubjectPatch>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Subject>>, ServiceError> {
    let auth = state.authenticate(&headers)?;
    let Json(patch) = payload?;
    let id = id.parse::<SubjectId>()?;
    Ok(Json(envelope(state.api.update_subject(&auth, id, &patch)?)))
}

async fn my_subjects(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Subject>>>, ServiceError> {
    let auth = state.authenticate(&headers)?;
    Ok(Json(envelope(state.api.my_subjects(&auth)?)))
}

async fn graphql_handler(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    request: GraphQLRequest,
) -> Result<GraphQLResponse, ServiceError> {
    let auth = state.authenticate(&headers)?;
    Ok(state.schema.execute(request.into_inner().data(auth)).await.into())
}

async fn graphql_schema(State(state): State<ServiceState>) -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "text/plain; charset=utf-8")], state.schema.sdl())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    const ORIGIN: &str = "http://localhost:3000";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("subject-registry-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router(db_path: PathBuf) -> Router {
        app(ServiceState::new(SubjectRegistryApi::new(db_path), HeaderValue::from_static(ORIGIN)))
    }

    fn seed_user(db_path: &std::path::Path) {
        SubjectRegistryApi::new(db_path.to_path_buf())
            .register_user(subject_registry_api::RegisterUserRequest {
                name: "Test Operator".to_string(),
                email: "operator@aperture.test".to_string(),
                password: "cake-is-a-lie".to_string(),
            })
            .unwrap_or_else(|err| panic!("failed to seed user: {err}"));
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: &serde_json::Value) -> Request<Body> {
        let mut builder =
            Request::builder().method(method).uri(uri).header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn login_token(router: &Router) -> String {
        let response = send(
            router,
            json_request(
                "POST",
                "/api/login",
                None,
                &serde_json::json!({"email": "operator@aperture.test", "password": "cake-is-a-lie"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        value["data"]["access_token"]
            .as_str()
            .unwrap_or_else(|| panic!("missing data.access_token in response: {value}"))
            .to_string()
    }

    fn subject_payload(name: &str, chamber: i32, dob: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "test_chamber": chamber,
            "date_of_birth": dob,
            "score": 42,
            "alive": true
        })
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = test_router(unique_temp_db_path());
        let response = send(&router, get_request("/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = test_router(unique_temp_db_path());
        let response = send(&router, get_request("/openapi", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/api/createSubject"));
        assert!(body.contains("/graphql"));
    }

    #[tokio::test]
    async fn preflight_allows_configured_origin_with_credentials() {
        let router = test_router(unique_temp_db_path());
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/createSubject")
            .header("origin", ORIGIN)
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type,x-xsrf-token")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(&router, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(
            headers.get("access-control-allow-origin").and_then(|value| value.to_str().ok()),
            Some(ORIGIN)
        );
        assert_eq!(
            headers.get("access-control-allow-credentials").and_then(|value| value.to_str().ok()),
            Some("true")
        );
        let allowed = headers
            .get("access-control-allow-headers")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        assert!(allowed.contains("x-xsrf-token"), "allowed headers: {allowed}");
    }

    #[tokio::test]
    async fn create_subject_requires_bearer_token() {
        let router = test_router(unique_temp_db_path());
        let response = send(
            &router,
            json_request("POST", "/api/createSubject", None, &subject_payload("Chell", 19, "1988-04-11")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
    }

    #[tokio::test]
    async fn create_then_update_then_list_round_trip() {
        let db_path = unique_temp_db_path();
        seed_user(&db_path);
        let router = test_router(db_path.clone());
        let token = login_token(&router).await;

        let created = send(
            &router,
            json_request(
                "POST",
                "/api/createSubject",
                Some(&token),
                &subject_payload("Chell", 19, "1988-04-11"),
            ),
        )
        .await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let created = response_json(created).await;
        assert_eq!(created["data"]["created"], true);
        let id = created["data"]["subject"]["id"].as_i64().unwrap_or_default();

        let again = send(
            &router,
            json_request(
                "POST",
                "/api/createSubject",
                Some(&token),
                &subject_payload("Chell", 20, "1988-04-11"),
            ),
        )
        .await;
        assert_eq!(again.status(), StatusCode::OK);
        assert_eq!(response_json(again).await["data"]["subject"]["id"].as_i64(), Some(id));

        let updated = send(
            &router,
            json_request("PUT", &format!("/api/subjects/{id}"), Some(&token), &serde_json::json!({"alive": false})),
        )
        .await;
        assert_eq!(updated.status(), StatusCode::OK);
        let updated = response_json(updated).await;
        assert_eq!(updated["data"]["alive"], false);
        assert_eq!(updated["data"]["test_chamber"], 20);

        send(
            &router,
            json_request(
                "POST",
                "/api/createSubject",
                Some(&token),
                &subject_payload("Cave Johnson", 0, "1925-06-15"),
            ),
        )
        .await;
        let listed = send(
            &router,
            get_request("/api/subjects?order_by=date_of_birth&order=asc&per_page=1", Some(&token)),
        )
        .await;
        assert_eq!(listed.status(), StatusCode::OK);
        let listed = response_json(listed).await;
        assert_eq!(listed["data"]["data"][0]["name"], "Cave Johnson");
        assert_eq!(listed["data"]["paginator_info"]["total"], 2);
        assert_eq!(listed["data"]["paginator_info"]["last_page"], 2);

        let mine = response_json(send(&router, get_request("/api/me/subjects", Some(&token))).await).await;
        assert_eq!(mine["data"].as_array().map(Vec::len), Some(2));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn registry_errors_map_to_http_statuses() {
        let db_path = unique_temp_db_path();
        seed_user(&db_path);
        let router = test_router(db_path.clone());
        let token = login_token(&router).await;

        let invalid = send(
            &router,
            json_request(
                "POST",
                "/api/createSubject",
                Some(&token),
                &subject_payload("   ", 1, "1988-04-11"),
            ),
        )
        .await;
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let missing = send(&router, get_request("/api/subjects/404", Some(&token))).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let bad_column =
            send(&router, get_request("/api/subjects?order_by=shoe_size", Some(&token))).await;
        assert_eq!(bad_column.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let bad_login = send(
            &router,
            json_request(
                "POST",
                "/api/login",
                None,
                &serde_json::json!({"email": "operator@aperture.test", "password": "nope"}),
            ),
        )
        .await;
        assert_eq!(bad_login.status(), StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn create_subject_accepts_form_style_string_fields() {
        let db_path = unique_temp_db_path();
        seed_user(&db_path);
        let router = test_router(db_path.clone());
        let token = login_token(&router).await;

        let response = send(
            &router,
            json_request(
                "POST",
                "/api/createSubject",
                Some(&token),
                &serde_json::json!({
                    "name": "Chell",
                    "test_chamber": "19",
                    "date_of_birth": "1988-04-11",
                    "score": "100",
                    "alive": "1"
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let value = response_json(response).await;
        let subject = &value["data"]["subject"];
        assert_eq!(subject["name"], "Chell");
        assert_eq!(subject["test_chamber"], 19);
        assert_eq!(subject["score"], 100);
        assert_eq!(subject["alive"], true);

        let id = subject["id"]
            .as_i64()
            .unwrap_or_else(|| panic!("missing data.subject.id in response: {value}"));
        let edited = send(
            &router,
            json_request(
                "PUT",
                &format!("/api/subjects/{id}"),
                Some(&token),
                &serde_json::json!({"score": "7", "alive": "0"}),
            ),
        )
        .await;
        assert_eq!(edited.status(), StatusCode::OK);
        let edited = response_json(edited).await;
        assert_eq!(edited["data"]["score"], 7);
        assert_eq!(edited["data"]["alive"], false);
        assert_eq!(edited["data"]["test_chamber"], 19);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn malformed_bodies_get_a_json_error_envelope() {
        let db_path = unique_temp_db_path();
        seed_user(&db_path);
        let router = test_router(db_path.clone());
        let token = login_token(&router).await;

        let response = send(
            &router,
            json_request(
                "POST",
                "/api/createSubject",
                Some(&token),
                &serde_json::json!({
                    "name": "Wheatley",
                    "test_chamber": "nineteen",
                    "date_of_birth": "2010-01-01",
                    "score": 1,
                    "alive": true
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert!(
            value["error"].as_str().is_some_and(|message| message.contains("test_chamber")),
            "error should name the field: {value}"
        );

        let not_json = Request::builder()
            .method("POST")
            .uri("/api/login")
            .header("content-type", "application/json")
            .body(Body::from("{\"email\":"))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(&router, not_json).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["service_contract_version"], SERVICE_CONTRACT_VERSION);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn logout_revokes_tokens_and_always_says_gone_away() {
        let db_path = unique_temp_db_path();
        seed_user(&db_path);
        let router = test_router(db_path.clone());
        let token = login_token(&router).await;

        let response =
            send(&router, json_request("POST", "/api/logout", Some(&token), &serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["data"]["message"], "Gone Away");

        let after = send(&router, get_request("/api/me/subjects", Some(&token))).await;
        assert_eq!(after.status(), StatusCode::UNAUTHORIZED);

        let anonymous =
            send(&router, json_request("POST", "/api/logout", None, &serde_json::json!({}))).await;
        assert_eq!(anonymous.status(), StatusCode::OK);
        assert_eq!(response_json(anonymous).await["data"]["message"], "Gone Away");

        let unreachable = test_router(
            std::env::temp_dir()
                .join(format!("subject-registry-service-{}", ulid::Ulid::new()))
                .join("missing")
                .join("registry.sqlite3"),
        );
        let response = send(
            &unreachable,
            json_request("POST", "/api/logout", Some("1|stale-secret"), &serde_json::json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["data"]["message"], "Gone Away");
        assert_eq!(value["data"]["revoked_tokens"], 0);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn graphql_endpoint_serves_authenticated_queries() {
        let db_path = unique_temp_db_path();
        seed_user(&db_path);
        let router = test_router(db_path.clone());
        let token = login_token(&router).await;

        let mutation = serde_json::json!({
            "query": "mutation { createSubject(name: \"Chell\", date_of_birth: \"1988-04-11 00:00:00\", test_chamber: 19, score: 7, alive: true) { id name } }"
        });
        let created = send(&router, json_request("POST", "/graphql", Some(&token), &mutation)).await;
        assert_eq!(created.status(), StatusCode::OK);
        let created = response_json(created).await;
        assert_eq!(created["data"]["createSubject"]["name"], "Chell");

        let query = serde_json::json!({
            "query": "query { subjects(orderBy: [{column: TEST_CHAMBER, order: ASC}]) { name test_chamber date_of_birth } }"
        });
        let listed = response_json(
            send(&router, json_request("POST", "/graphql", Some(&token), &query)).await,
        )
        .await;
        assert_eq!(listed["data"]["subjects"][0]["date_of_birth"], "1988-04-11 00:00:00");

        let anonymous = send(&router, json_request("POST", "/graphql", None, &query)).await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let sdl = send(&router, get_request("/graphql/schema", None)).await;
        assert_eq!(sdl.status(), StatusCode::OK);
        let bytes = to_bytes(sdl.into_body(), 1024 * 1024)
            .await
            .unwrap_or_else(|err| panic!("failed to read schema body: {err}"));
        assert!(String::from_utf8_lossy(&bytes).contains("createSubject"));

        let _ = std::fs::remove_file(&db_path);
    }
}
