use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use customer_ledger_api::{
    AddCustomerRequest, AddSaleRequest, CreateSnapshotRequest, CustomerLedgerApi,
    ExportFilterRequest, IntakeCheckRequest, RestoreSnapshotRequest, API_CONTRACT_VERSION,
};
use customer_ledger_core::{
    ArtifactId, DuplicateCheckPolicy, IntegrityIssue, LegitimacyRules, RestorePhase,
};
use customer_ledger_store_sqlite::StoreError;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: CustomerLedgerApi,
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
    service_contract_version: &'static str,
    error: String,
    phase: Option<&'static str>,
    issues: Vec<IntegrityIssue>,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RestoreRequestBody {
    confirmation_token: String,
    actor: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "customer-ledger-service")]
#[command(about = "Local HTTP service for Customer Ledger")]
struct Args {
    #[arg(long, default_value = "./customer_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4017")]
    bind: SocketAddr,
    /// JSON file overriding the default content-legitimacy rules.
    #[arg(long)]
    rules_file: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "fail-closed")]
    duplicate_policy: PolicyArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    FailClosed,
    FailOpen,
}

impl PolicyArg {
    fn into_policy(self) -> DuplicateCheckPolicy {
        match self {
            Self::FailClosed => DuplicateCheckPolicy::FailClosed,
            Self::FailOpen => DuplicateCheckPolicy::FailOpen,
        }
    }
}

fn load_rules(path: Option<&std::path::Path>) -> Result<LegitimacyRules> {
    match path {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read rules file {}", path.display()))?;
            serde_json::from_str(&body)
                .with_context(|| format!("failed to parse rules file {}", path.display()))
        }
        None => Ok(LegitimacyRules::default()),
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            phase: None,
            issues: Vec::new(),
            status,
        }
    }

    /// Map the store taxonomy onto HTTP statuses; untyped failures read as 500.
    fn from_api(err: &anyhow::Error) -> Self {
        let (status, issues) = match err.downcast_ref::<StoreError>() {
            Some(StoreError::Validation(_)) => (StatusCode::BAD_REQUEST, Vec::new()),
            Some(StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, Vec::new()),
            Some(StoreError::Duplicate(_)) => (StatusCode::CONFLICT, Vec::new()),
            Some(StoreError::Integrity { issues, .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, issues.clone())
            }
            Some(StoreError::Transient(_)) => (StatusCode::SERVICE_UNAVAILABLE, Vec::new()),
            Some(StoreError::FatalRestore { issues, .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, issues.clone())
            }
            Some(StoreError::Storage(_)) | None => (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()),
        };

        let mut error = Self::new(status, err.to_string());
        error.issues = issues;
        error
    }

    fn with_phase(mut self, phase: &'static str) -> Self {
        self.phase = Some(phase);
        self
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
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

fn parse_artifact_id(raw: &str) -> Result<ArtifactId, ServiceError> {
    match Ulid::from_string(raw) {
        Ok(parsed) => Ok(ArtifactId(parsed)),
        Err(err) => Err(ServiceError::new(
            StatusCode::BAD_REQUEST,
            format!("invalid artifact id {raw}: {err}"),
        )),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/intake/check", post(intake_check))
        .route("/v1/customers", get(customer_list).post(customer_create))
        .route("/v1/sales", get(sale_list).post(sale_create))
        .route("/v1/export/filter", post(export_filter))
        .route("/v1/snapshots", get(snapshot_list).post(snapshot_create))
        .route("/v1/snapshots/:artifact_id", get(snapshot_show))
        .route("/v1/snapshots/:artifact_id/validate", post(snapshot_validate))
        .route("/v1/snapshots/:artifact_id/restore", post(snapshot_restore))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let rules = load_rules(args.rules_file.as_deref())?;
    let api = CustomerLedgerApi::new(args.db)
        .with_policy(args.duplicate_policy.into_policy())
        .with_rules(rules);
    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
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
) -> Result<Json<ServiceEnvelope<customer_ledger_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<customer_ledger_api::MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(result)))
}

async fn intake_check(
    State(state): State<ServiceState>,
    Json(request): Json<IntakeCheckRequest>,
) -> Result<Json<ServiceEnvelope<customer_ledger_core::MatchResult>>, ServiceError> {
    let result = state.api.check_intake(request).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(result)))
}

async fn customer_create(
    State(state): State<ServiceState>,
    Json(request): Json<AddCustomerRequest>,
) -> Result<Json<ServiceEnvelope<customer_ledger_api::AddCustomerOutcome>>, ServiceError> {
    let outcome = state.api.add_customer(request).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(outcome)))
}

async fn customer_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<customer_ledger_core::CustomerRecord>>>, ServiceError> {
    let customers = state.api.list_customers().map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(customers)))
}

async fn sale_create(
    State(state): State<ServiceState>,
    Json(request): Json<AddSaleRequest>,
) -> Result<Json<ServiceEnvelope<customer_ledger_core::SaleRecord>>, ServiceError> {
    let sale = state.api.add_sale(request).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(sale)))
}

async fn sale_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<customer_ledger_core::SaleRecord>>>, ServiceError> {
    let sales = state.api.list_sales().map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(sales)))
}

async fn export_filter(
    State(state): State<ServiceState>,
    Json(request): Json<ExportFilterRequest>,
) -> Result<Json<ServiceEnvelope<customer_ledger_api::ExportFilterResult>>, ServiceError> {
    let outcome = state.api.filter_export(request).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(outcome)))
}

async fn snapshot_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Result<Json<ServiceEnvelope<customer_ledger_core::SnapshotArtifact>>, ServiceError> {
    let artifact = state.api.create_snapshot(request).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(artifact)))
}

async fn snapshot_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<customer_ledger_core::SnapshotSummary>>>, ServiceError> {
    let snapshots = state.api.list_snapshots().map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(snapshots)))
}

async fn snapshot_show(
    State(state): State<ServiceState>,
    Path(artifact_id): Path<String>,
) -> Result<Json<ServiceEnvelope<customer_ledger_core::SnapshotArtifact>>, ServiceError> {
    let artifact_id = parse_artifact_id(&artifact_id)?;
    let artifact =
        state.api.snapshot_show(artifact_id).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(artifact)))
}

async fn snapshot_validate(
    State(state): State<ServiceState>,
    Path(artifact_id): Path<String>,
) -> Result<Json<ServiceEnvelope<customer_ledger_api::SnapshotValidation>>, ServiceError> {
    let artifact_id = parse_artifact_id(&artifact_id)?;
    let validation =
        state.api.validate_snapshot(artifact_id).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(validation)))
}

async fn snapshot_restore(
    State(state): State<ServiceState>,
    Path(artifact_id): Path<String>,
    Json(request): Json<RestoreRequestBody>,
) -> Result<Json<ServiceEnvelope<customer_ledger_core::RestoreReport>>, ServiceError> {
    let artifact_id = parse_artifact_id(&artifact_id)?;
    let report = state
        .api
        .restore_snapshot(RestoreSnapshotRequest {
            artifact_id,
            confirmation_token: request.confirmation_token,
            actor: request.actor,
        })
        .map_err(|err| {
            ServiceError::from_api(&err).with_phase(RestorePhase::Aborted.as_str())
        })?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("customerledger-service-{}.sqlite3", ulid::Ulid::new()))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_json(router: Router, uri: &str, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    async fn get_empty(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    async fn post_empty(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    fn customer_payload(
        first: &str,
        last: &str,
        email: Option<&str>,
        phone: &str,
    ) -> serde_json::Value {
        serde_json::json!({
            "first_name": first,
            "last_name": last,
            "email": email,
            "phone_number": phone,
            "account_number": null,
            "created_by": "front-desk",
            "created_at": null
        })
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = ServiceState { api: CustomerLedgerApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = get_empty(router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("api_contract_version").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn openapi_endpoint_matches_served_routes() {
        let state = ServiceState { api: CustomerLedgerApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = get_empty(router, "/v1/openapi").await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));

        let document: serde_yaml::Value = match serde_yaml::from_str(&body) {
            Ok(document) => document,
            Err(err) => panic!("openapi document is not valid YAML: {err}"),
        };
        let paths = document
            .get("paths")
            .unwrap_or_else(|| panic!("openapi document is missing paths"));
        for route in [
            "/v1/health",
            "/v1/db/schema-version",
            "/v1/db/migrate",
            "/v1/intake/check",
            "/v1/customers",
            "/v1/sales",
            "/v1/export/filter",
            "/v1/snapshots",
            "/v1/snapshots/{artifact_id}",
            "/v1/snapshots/{artifact_id}/validate",
            "/v1/snapshots/{artifact_id}/restore",
        ] {
            assert!(paths.get(route).is_some(), "openapi document is missing route {route}");
        }
    }

    #[tokio::test]
    async fn customer_intake_and_sale_flow_round_trips() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: CustomerLedgerApi::new(db_path.clone()) };
        let router = app(state);

        let margot = customer_payload(
            "Margot",
            "Maitland",
            Some("margot@maitland.example"),
            "+44 7123 456 789",
        );
        let add_response = post_json(router.clone(), "/v1/customers", &margot).await;
        assert_eq!(add_response.status(), StatusCode::OK);
        let add_value = response_json(add_response).await;
        let customer_id = add_value
            .pointer("/data/customer/customer_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.customer.customer_id: {add_value}"))
            .to_string();

        let check_response = post_json(
            router.clone(),
            "/v1/intake/check",
            &serde_json::json!({
                "first_name": "Greta",
                "last_name": "Voss",
                "email": null,
                "phone_number": "07123456789"
            }),
        )
        .await;
        assert_eq!(check_response.status(), StatusCode::OK);
        let check_value = response_json(check_response).await;
        assert_eq!(
            check_value.pointer("/data/confidence").and_then(serde_json::Value::as_str),
            Some("medium")
        );

        let duplicate_response = post_json(
            router.clone(),
            "/v1/customers",
            &customer_payload("Greta", "Voss", None, "07123 456 789"),
        )
        .await;
        assert_eq!(duplicate_response.status(), StatusCode::CONFLICT);
        let duplicate_value = response_json(duplicate_response).await;
        assert_eq!(
            duplicate_value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );

        let sale_response = post_json(
            router.clone(),
            "/v1/sales",
            &serde_json::json!({
                "customer_id": customer_id,
                "total_cost_cents": 12999,
                "created_by": "front-desk",
                "created_at": null
            }),
        )
        .await;
        assert_eq!(sale_response.status(), StatusCode::OK);

        let customers_response = get_empty(router.clone(), "/v1/customers").await;
        let customers_value = response_json(customers_response).await;
        let customers = customers_value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("customer list data should be an array: {customers_value}"));
        assert_eq!(customers.len(), 1);

        let sales_response = get_empty(router, "/v1/sales").await;
        let sales_value = response_json(sales_response).await;
        let sales = sales_value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("sale list data should be an array: {sales_value}"));
        assert_eq!(sales.len(), 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[allow(clippy::too_many_lines)]
    #[tokio::test]
    async fn snapshot_endpoints_map_failures_onto_statuses() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: CustomerLedgerApi::new(db_path.clone()) };
        let router = app(state);

        let margot = customer_payload(
            "Margot",
            "Maitland",
            Some("margot@maitland.example"),
            "+44 7123 456 789",
        );
        let add_response = post_json(router.clone(), "/v1/customers", &margot).await;
        assert_eq!(add_response.status(), StatusCode::OK);

        let create_response = post_json(
            router.clone(),
            "/v1/snapshots",
            &serde_json::json!({ "reason": "nightly", "actor": "ops" }),
        )
        .await;
        assert_eq!(create_response.status(), StatusCode::OK);
        let create_value = response_json(create_response).await;
        let artifact_id = create_value
            .pointer("/data/artifact_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.artifact_id: {create_value}"))
            .to_string();

        let list_response = get_empty(router.clone(), "/v1/snapshots").await;
        let list_value = response_json(list_response).await;
        let snapshots = list_value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("snapshot list data should be an array: {list_value}"));
        assert_eq!(snapshots.len(), 1);

        let validate_response =
            post_empty(router.clone(), &format!("/v1/snapshots/{artifact_id}/validate")).await;
        assert_eq!(validate_response.status(), StatusCode::OK);
        let validate_value = response_json(validate_response).await;
        assert_eq!(
            validate_value.pointer("/data/valid").and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let wrong_token_response = post_json(
            router.clone(),
            &format!("/v1/snapshots/{artifact_id}/restore"),
            &serde_json::json!({ "confirmation_token": "nope", "actor": "ops" }),
        )
        .await;
        assert_eq!(wrong_token_response.status(), StatusCode::BAD_REQUEST);
        let wrong_token_value = response_json(wrong_token_response).await;
        assert_eq!(
            wrong_token_value.get("phase").and_then(serde_json::Value::as_str),
            Some("aborted")
        );
        assert!(
            wrong_token_value
                .get("error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .contains("confirmation token"),
            "unexpected error body: {wrong_token_value}"
        );

        let unknown_response =
            get_empty(router.clone(), &format!("/v1/snapshots/{}", Ulid::new())).await;
        assert_eq!(unknown_response.status(), StatusCode::NOT_FOUND);

        let invalid_response = get_empty(router.clone(), "/v1/snapshots/not-a-ulid").await;
        assert_eq!(invalid_response.status(), StatusCode::BAD_REQUEST);

        let restore_response = post_json(
            router.clone(),
            &format!("/v1/snapshots/{artifact_id}/restore"),
            &serde_json::json!({ "confirmation_token": artifact_id, "actor": "ops" }),
        )
        .await;
        assert_eq!(restore_response.status(), StatusCode::OK);
        let restore_value = response_json(restore_response).await;
        assert_eq!(
            restore_value
                .pointer("/data/committed_counts/customers")
                .and_then(serde_json::Value::as_i64),
            Some(1)
        );
        assert_eq!(
            restore_value
                .pointer("/data/phases")
                .and_then(serde_json::Value::as_array)
                .and_then(|phases| phases.last())
                .and_then(serde_json::Value::as_str),
            Some("committed")
        );

        let show_response = get_empty(router, &format!("/v1/snapshots/{artifact_id}")).await;
        assert_eq!(show_response.status(), StatusCode::OK);
        let show_value = response_json(show_response).await;
        assert_eq!(
            show_value.pointer("/data/artifact_id").and_then(serde_json::Value::as_str),
            Some(artifact_id.as_str())
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn db_and_export_endpoints_round_trip() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: CustomerLedgerApi::new(db_path.clone()) };
        let router = app(state);

        let schema_response = post_empty(router.clone(), "/v1/db/schema-version").await;
        assert_eq!(schema_response.status(), StatusCode::OK);
        let schema_value = response_json(schema_response).await;
        assert_eq!(
            schema_value.pointer("/data/current_version").and_then(serde_json::Value::as_i64),
            Some(0)
        );

        let migrate_response = post_json(
            router.clone(),
            "/v1/db/migrate",
            &serde_json::json!({ "dry_run": false }),
        )
        .await;
        assert_eq!(migrate_response.status(), StatusCode::OK);
        let migrate_value = response_json(migrate_response).await;
        assert_eq!(
            migrate_value.pointer("/data/after_version").and_then(serde_json::Value::as_i64),
            Some(1)
        );

        let _hugh = post_json(
            router.clone(),
            "/v1/customers",
            &customer_payload("Hugh", "Bonner", Some("hugh@corp.net"), "07700 900123"),
        )
        .await;
        let _paula = post_json(
            router.clone(),
            "/v1/customers",
            &customer_payload("Paula", "Wake", None, "07700 900456"),
        )
        .await;

        let filter_response = post_json(
            router,
            "/v1/export/filter",
            &serde_json::json!({ "exclusion_lines": ["hugh@corp.net"] }),
        )
        .await;
        assert_eq!(filter_response.status(), StatusCode::OK);
        let filter_value = response_json(filter_response).await;
        let kept = filter_value
            .pointer("/data/kept")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing data.kept: {filter_value}"));
        assert_eq!(kept.len(), 1);
        let excluded = filter_value
            .pointer("/data/excluded")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing data.excluded: {filter_value}"));
        assert_eq!(excluded.len(), 1);

        let _ = std::fs::remove_file(&db_path);
    }
}
