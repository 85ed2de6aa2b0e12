use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use inspection_ledger_api::{
    InspectionLedgerApi, LedgerConfig, LedgerRequest, MigrateResult, RecordFamily,
    API_CONTRACT_VERSION,
};
use inspection_ledger_core::{CompositeKey, LedgerError, OrganizationId, RecordFilter};
use inspection_ledger_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
/// Header carrying the caller's membership identifier.
const MSP_ID_HEADER: &str = "x-msp-id";

#[derive(Debug, Clone)]
struct ServiceState {
    api: InspectionLedgerApi,
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

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct VerifyHashRequest {
    hash: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "inspection-ledger-service")]
#[command(about = "Local HTTP service for the inspection ledger")]
struct Args {
    /// YAML configuration file; `--db` overrides its database path.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<LedgerError>() {
            Some(LedgerError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(
                LedgerError::Decode(_)
                | LedgerError::Validation(_)
                | LedgerError::UnknownOrganization(_),
            ) => StatusCode::BAD_REQUEST,
            Some(LedgerError::Store(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error = format!("{err:#}");
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %error, "request failed");
        }
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error,
        }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        Self::from(anyhow::Error::from(err))
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

fn caller_organization(headers: &HeaderMap) -> Option<OrganizationId> {
    headers
        .get(MSP_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(OrganizationId::new)
}

fn invoke(
    state: &ServiceState,
    family: &str,
    headers: &HeaderMap,
    request: LedgerRequest,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    let family = family.parse::<RecordFamily>()?;
    let value = state.api.invoke(family, caller_organization(headers), request)?;
    Ok(Json(envelope(value)))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/:family/records", post(add_record).get(list_records))
        .route("/v1/:family/records/:part_number/:serial_number", get(get_record))
        .route("/v1/:family/records/:part_number/:serial_number/public", get(get_record_public))
        .route("/v1/:family/records/:part_number/:serial_number/private", get(get_record_private))
        .route("/v1/:family/records/:part_number/:serial_number/history", get(record_history))
        .route("/v1/:family/records/:part_number/:serial_number/exists", get(record_exists))
        .route("/v1/:family/records/:part_number/:serial_number/verify-hash", post(verify_hash))
        .route("/v1/:family/count", get(count_records))
        .route("/v1/:family/query", post(query_records))
        .with_state(state)
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level `{level}`"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialize tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;
    let mut config = match &args.config {
        Some(path) => LedgerConfig::from_file(path)?,
        None => LedgerConfig::default(),
    };
    if let Some(db) = args.db {
        config.db = db;
    }

    let api = InspectionLedgerApi::new(config);
    api.init_ledger()?;
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "inspection ledger service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

async fn add_record(
    State(state): State<ServiceState>,
    Path(family): Path<String>,
    headers: HeaderMap,
    Json(record): Json<Value>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    invoke(&state, &family, &headers, LedgerRequest::AddRecord { record })
}

async fn list_records(
    State(state): State<ServiceState>,
    Path(family): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    invoke(&state, &family, &headers, LedgerRequest::ListAll)
}

async fn get_record(
    State(state): State<ServiceState>,
    Path((family, part_number, serial_number)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    let key = CompositeKey::new(&part_number, &serial_number)?;
    invoke(&state, &family, &headers, LedgerRequest::GetRecord { key })
}

async fn get_record_public(
    State(state): State<ServiceState>,
    Path((family, part_number, serial_number)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    let key = CompositeKey::new(&part_number, &serial_number)?;
    invoke(&state, &family, &headers, LedgerRequest::GetRecordPublic { key })
}

async fn get_record_private(
    State(state): State<ServiceState>,
    Path((family, part_number, serial_number)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    let key = CompositeKey::new(&part_number, &serial_number)?;
    invoke(&state, &family, &headers, LedgerRequest::GetRecordPrivate { key })
}

async fn record_history(
    State(state): State<ServiceState>,
    Path((family, part_number, serial_number)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    let key = CompositeKey::new(&part_number, &serial_number)?;
    invoke(&state, &family, &headers, LedgerRequest::History { key })
}

async fn record_exists(
    State(state): State<ServiceState>,
    Path((family, part_number, serial_number)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    let key = CompositeKey::new(&part_number, &serial_number)?;
    invoke(&state, &family, &headers, LedgerRequest::Exists { key })
}

async fn verify_hash(
    State(state): State<ServiceState>,
    Path((family, part_number, serial_number)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(request): Json<VerifyHashRequest>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    let key = CompositeKey::new(&part_number, &serial_number)?;
    invoke(
        &state,
        &family,
        &headers,
        LedgerRequest::VerifyEvidenceHash {
            key,
            hash: request.hash,
        },
    )
}

async fn count_records(
    State(state): State<ServiceState>,
    Path(family): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    invoke(&state, &family, &headers, LedgerRequest::Count)
}

async fn query_records(
    State(state): State<ServiceState>,
    Path(family): Path<String>,
    headers: HeaderMap,
    Json(filter): Json<RecordFilter>,
) -> Result<Json<ServiceEnvelope<Value>>, ServiceError> {
    invoke(&state, &family, &headers, LedgerRequest::Filter { filter })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use inspection_ledger_core::Membership;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("inspection-ledger-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router(db_path: PathBuf) -> Router {
        app(ServiceState {
            api: InspectionLedgerApi::new(LedgerConfig {
                db: db_path,
                ..LedgerConfig::default()
            }),
        })
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_as(uri: &str, msp_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).method("GET");
        if let Some(msp_id) = msp_id {
            builder = builder.header(MSP_ID_HEADER, msp_id);
        }
        builder
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn post_json_as(uri: &str, msp_id: Option<&str>, body: &Value) -> Request<Body> {
        let mut builder = Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json");
        if let Some(msp_id) = msp_id {
            builder = builder.header(MSP_ID_HEADER, msp_id);
        }
        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn response_json(response: Response) -> Value {
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

    fn defect_record(serial_number: &str, confidence_score: f64) -> Value {
        serde_json::json!({
            "partNumber": "WING-SKIN-7",
            "serialNumber": serial_number,
            "rawVideoHash": format!("sha256:{serial_number}"),
            "defectDetected": true,
            "confidenceScore": confidence_score,
            "inspector": "Jane Doe",
        })
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = test_router(unique_temp_db_path());

        let response = send(&router, get_as("/v1/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn merged_read_depends_on_caller_header() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let added = send(
            &router,
            post_json_as(
                "/v1/defect-inspection/records",
                Some(Membership::MANUFACTURER_MSP),
                &defect_record("S1", 0.91),
            ),
        )
        .await;
        assert_eq!(added.status(), StatusCode::OK);
        let receipt = response_json(added).await;
        assert_eq!(receipt["data"]["key"], serde_json::json!("WING-SKIN-7_S1"));

        let uri = "/v1/defect-inspection/records/WING-SKIN-7/S1";
        let owner = response_json(send(&router, get_as(uri, Some(Membership::MANUFACTURER_MSP))).await).await;
        let lab = response_json(send(&router, get_as(uri, Some(Membership::MRO_LAB_MSP))).await).await;
        let anonymous = response_json(send(&router, get_as(uri, None)).await).await;

        assert_eq!(owner["data"]["inspector"], serde_json::json!("Jane Doe"));
        assert_eq!(lab["data"]["inspector"], serde_json::json!(""));
        assert_eq!(anonymous["data"]["inspector"], serde_json::json!(""));
        assert_eq!(lab["data"]["confidenceScore"], owner["data"]["confidenceScore"]);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn ledger_errors_map_to_http_statuses() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let rejected = send(
            &router,
            post_json_as(
                "/v1/defect-inspection/records",
                Some("RegulatorMSP"),
                &defect_record("S1", 0.91),
            ),
        )
        .await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        let body = response_json(rejected).await;
        assert!(body["error"]
            .as_str()
            .is_some_and(|error| error.contains("unknown organization")));

        let missing = send(
            &router,
            get_as("/v1/defect-inspection/records/WING-SKIN-7/S404", Some(Membership::MRO_LAB_MSP)),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let unknown_family = send(&router, get_as("/v1/engine-inspection/count", None)).await;
        assert_eq!(unknown_family.status(), StatusCode::BAD_REQUEST);

        let bad_key = send(
            &router,
            get_as("/v1/blade-inspection/records/HPT_BLADE/SN-1", None),
        )
        .await;
        assert_eq!(bad_key.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn private_read_query_and_count_endpoints() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());
        for (serial, score) in [("S1", 0.97), ("S2", 0.35)] {
            let response = send(
                &router,
                post_json_as(
                    "/v1/defect-inspection/records",
                    Some(Membership::MRO_LAB_MSP),
                    &defect_record(serial, score),
                ),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let private_uri = "/v1/defect-inspection/records/WING-SKIN-7/S1/private";
        let own = send(&router, get_as(private_uri, Some(Membership::MRO_LAB_MSP))).await;
        assert_eq!(own.status(), StatusCode::OK);
        assert_eq!(response_json(own).await["data"]["inspector"], serde_json::json!("Jane Doe"));
        let foreign = send(&router, get_as(private_uri, Some(Membership::MANUFACTURER_MSP))).await;
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);

        let matched = response_json(
            send(
                &router,
                post_json_as(
                    "/v1/defect-inspection/query",
                    None,
                    &serde_json::json!({ "kind": "confidence_at_least", "value": 0.9 }),
                ),
            )
            .await,
        )
        .await;
        assert_eq!(matched["data"].as_array().map(Vec::len), Some(1));

        let count = response_json(send(&router, get_as("/v1/defect-inspection/count", None)).await).await;
        assert_eq!(count["data"]["count"], serde_json::json!(2));

        let verified = response_json(
            send(
                &router,
                post_json_as(
                    "/v1/defect-inspection/records/WING-SKIN-7/S2/verify-hash",
                    None,
                    &serde_json::json!({ "hash": "sha256:S2" }),
                ),
            )
            .await,
        )
        .await;
        assert_eq!(verified["data"]["verified"], serde_json::json!(true));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn migrate_endpoint_supports_dry_run() {
        let db_path = unique_temp_db_path();
        let router = test_router(db_path.clone());

        let planned = response_json(
            send(
                &router,
                post_json_as("/v1/db/migrate", None, &serde_json::json!({ "dry_run": true })),
            )
            .await,
        )
        .await;
        assert_eq!(planned["data"]["would_apply_versions"], serde_json::json!([1]));

        let applied = response_json(
            send(
                &router,
                post_json_as("/v1/db/migrate", None, &serde_json::json!({ "dry_run": false })),
            )
            .await,
        )
        .await;
        assert_eq!(applied["data"]["up_to_date"], serde_json::json!(true));

        let _ = std::fs::remove_file(&db_path);
    }
}
