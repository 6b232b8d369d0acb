//! OSB HTTP API
//!
//! Axum routes for the Open Service Broker v2 endpoints. Handlers only
//! translate between wire shapes and broker operations; errors are
//! rendered here as `{"error"?, "description"}` bodies.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::broker::{
    AwsBroker, BindRequest, BrokerError, Credentials, DeprovisionRequest, Parameters,
    ProvisionRequest,
};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<AwsBroker>,
}

/// Build the broker router
pub fn router(broker: Arc<AwsBroker>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v2/catalog", get(get_catalog))
        .route(
            "/v2/service_instances/:instance_id",
            put(provision).delete(deprovision),
        )
        .route(
            "/v2/service_instances/:instance_id/last_operation",
            get(last_operation),
        )
        .route(
            "/v2/service_instances/:instance_id/service_bindings/:binding_id",
            put(bind).delete(unbind),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { broker })
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    description: String,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, "Broker operation failed");
        }

        let body = ErrorBody {
            error: self.error_code(),
            description: self.description(),
        };
        (status, Json(body)).into_response()
    }
}

/// Empty JSON object, the OSB body for responses without fields
fn empty_body() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "aws-service-broker",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn get_catalog(State(state): State<AppState>) -> Result<Response, BrokerError> {
    let catalog = state.broker.get_catalog().await?;
    Ok(Json(catalog).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct AsyncQuery {
    #[serde(default)]
    accepts_incomplete: bool,
}

#[derive(Debug, Deserialize)]
struct ProvisionBody {
    service_id: String,
    plan_id: String,
    #[serde(default)]
    parameters: Option<Parameters>,
}

async fn provision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    Json(body): Json<ProvisionBody>,
) -> Result<Response, BrokerError> {
    let req = ProvisionRequest {
        instance_id,
        service_id: body.service_id,
        plan_id: body.plan_id,
        parameters: body.parameters.unwrap_or_default(),
        accepts_incomplete: query.accepts_incomplete,
    };

    let resp = state.broker.provision(&req).await?;
    let status = if resp.asynchronous {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok((status, empty_body()).into_response())
}

async fn deprovision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
) -> Result<Response, BrokerError> {
    let req = DeprovisionRequest {
        instance_id,
        accepts_incomplete: query.accepts_incomplete,
    };

    let resp = state.broker.deprovision(&req).await?;
    let status = if resp.asynchronous {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, empty_body()).into_response())
}

async fn last_operation(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Response, BrokerError> {
    let resp = state.broker.last_operation(&instance_id).await?;
    Ok(Json(resp).into_response())
}

#[derive(Debug, Deserialize)]
struct BindBody {
    service_id: String,
    #[serde(default)]
    parameters: Option<Parameters>,
}

#[derive(Debug, Serialize)]
struct BindBodyResponse {
    credentials: Credentials,
}

async fn bind(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Json(body): Json<BindBody>,
) -> Result<Response, BrokerError> {
    let req = BindRequest {
        binding_id,
        instance_id,
        service_id: body.service_id,
        parameters: body.parameters.unwrap_or_default(),
    };

    let resp = state.broker.bind(&req).await?;
    let status = if resp.exists {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let body = BindBodyResponse {
        credentials: resp.credentials,
    };
    Ok((status, Json(body)).into_response())
}

async fn unbind(
    State(state): State<AppState>,
    Path((_instance_id, binding_id)): Path<(String, String)>,
) -> Result<Response, BrokerError> {
    state.broker.unbind(&binding_id).await?;
    Ok((StatusCode::OK, empty_body()).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ports::CloudClients;
    use crate::broker::{Overrides, Plan, ServiceDefinition};
    use crate::config::BrokerOptions;
    use crate::memory::{InMemoryDataStore, LocalCloud};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app() -> Router {
        let cloud = Arc::new(LocalCloud::new());
        let broker = AwsBroker::new(
            BrokerOptions {
                s3_bucket: "awsservicebroker".to_string(),
                s3_region: "us-east-1".to_string(),
                region: "us-east-1".to_string(),
                broker_id: "awsservicebroker".to_string(),
                ..Default::default()
            },
            Overrides::new(),
            Arc::new(InMemoryDataStore::new()),
            CloudClients::new(cloud.clone(), cloud.clone(), cloud),
        );
        broker.publish_service(ServiceDefinition {
            id: "svc-sqs".to_string(),
            name: "sqs".to_string(),
            description: "Amazon SQS".to_string(),
            bindable: true,
            tags: Vec::new(),
            metadata: None,
            plans: vec![Plan {
                id: "plan-standard".to_string(),
                name: "standard".to_string(),
                description: String::new(),
                free: None,
                schemas: None,
            }],
        });
        broker.get_catalog().await.unwrap();
        router(Arc::new(broker))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_catalog() {
        let app = app().await;
        let (status, body) = send(&app, Method::GET, "/v2/catalog", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["services"][0]["id"], "svc-sqs");
        assert_eq!(body["services"][0]["plans"][0]["id"], "plan-standard");
    }

    #[tokio::test]
    async fn test_provision_requires_accepts_incomplete() {
        let app = app().await;
        let (status, body) = send(
            &app,
            Method::PUT,
            "/v2/service_instances/inst-1",
            Some(json!({"service_id": "svc-sqs", "plan_id": "plan-standard"})),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "AsyncRequired");
        assert_eq!(
            body["description"],
            "This service plan requires client support for asynchronous service operations."
        );
    }

    #[tokio::test]
    async fn test_error_body_omits_missing_code() {
        let app = app().await;
        let (status, body) = send(
            &app,
            Method::PUT,
            "/v2/service_instances/inst-1?accepts_incomplete=true",
            Some(json!({"service_id": "nope", "plan_id": "plan-standard"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"description": "The service nope was not found."}));
    }

    #[tokio::test]
    async fn test_instance_and_binding_flow() {
        let app = app().await;

        let (status, _) = send(
            &app,
            Method::PUT,
            "/v2/service_instances/inst-1?accepts_incomplete=true",
            Some(json!({"service_id": "svc-sqs", "plan_id": "plan-standard", "parameters": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let uri = "/v2/service_instances/inst-1/last_operation";
        let (_, body) = send(&app, Method::GET, uri, None).await;
        assert_eq!(body["state"], "in progress");
        let (status, body) = send(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "succeeded");

        let binding_uri = "/v2/service_instances/inst-1/service_bindings/bind-1";
        let bind_body = json!({"service_id": "svc-sqs", "plan_id": "plan-standard"});
        let (status, body) = send(&app, Method::PUT, binding_uri, Some(bind_body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["credentials"].is_object());

        let (status, _) = send(&app, Method::PUT, binding_uri, Some(bind_body)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            Method::PUT,
            "/v2/service_instances/inst-2/service_bindings/bind-1",
            Some(json!({"service_id": "svc-sqs"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(
            body["description"],
            "Service binding bind-1 already exists but with different attributes."
        );

        let (status, _) = send(&app, Method::DELETE, binding_uri, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            Method::DELETE,
            "/v2/service_instances/inst-1?accepts_incomplete=true",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = send(
            &app,
            Method::DELETE,
            "/v2/service_instances/unknown?accepts_incomplete=true",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_last_operation_for_unknown_instance() {
        let app = app().await;
        let (status, body) = send(
            &app,
            Method::GET,
            "/v2/service_instances/unknown/last_operation",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "failed");
    }
}
