use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{ChanguardError, ErrorCode};
use crate::scheduler::RevalidationScheduler;
use crate::validator::{ChannelValidator, HealthStatus};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;
const DEFAULT_STATS_DAYS: u32 = 7;
const MAX_STATS_DAYS: u32 = 365;

#[derive(Clone)]
struct WebState {
    validator: Arc<ChannelValidator>,
    scheduler: Arc<RevalidationScheduler>,
}

/// Error body: `{"ok": false, "code": ..., "error": ...}`.
struct ApiError(ChanguardError);

impl From<ChanguardError> for ApiError {
    fn from(e: ChanguardError) -> Self {
        ApiError(e)
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotConfigured | ErrorCode::AccountNotFound | ErrorCode::ChannelNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorCode::BotNotMember
        | ErrorCode::BotNotAdmin
        | ErrorCode::ChannelPrivate
        | ErrorCode::InvalidBotToken
        | ErrorCode::InsufficientPermissions => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::TransportError => StatusCode::BAD_GATEWAY,
        ErrorCode::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = status_for(code);
        if status.is_server_error() {
            error!("API error ({code:?}): {}", self.0);
        }
        (
            status,
            Json(json!({
                "ok": false,
                "code": code,
                "error": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

#[derive(Debug, Deserialize)]
struct SetupRequest {
    account_id: String,
    channel_handle: String,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    account_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RunQuery {
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    days: Option<u32>,
}

async fn api_setup(State(state): State<WebState>, Json(body): Json<SetupRequest>) -> ApiResult {
    let account_id = body.account_id.trim();
    if account_id.is_empty() {
        return Err(ChanguardError::InvalidRequest("account_id is required".into()).into());
    }
    let outcome = state
        .validator
        .setup(account_id, &body.channel_handle)
        .await?;
    Ok(Json(json!({ "ok": true, "result": outcome })))
}

async fn api_list(State(state): State<WebState>) -> ApiResult {
    let configurations = state.validator.list_configurations().await?;
    Ok(Json(json!({
        "ok": true,
        "count": configurations.len(),
        "configurations": configurations,
    })))
}

async fn api_batch(State(state): State<WebState>, Json(body): Json<BatchRequest>) -> ApiResult {
    let statuses = state.validator.batch_status(&body.account_ids).await?;
    Ok(Json(json!({
        "ok": true,
        "count": statuses.len(),
        "results": statuses,
    })))
}

async fn api_permission_summary(State(state): State<WebState>) -> ApiResult {
    let summary = state.validator.permission_summary().await?;
    Ok(Json(json!({ "ok": true, "summary": summary })))
}

async fn api_scheduler_status(State(state): State<WebState>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "scheduler": state.scheduler.status() })))
}

async fn api_scheduler_run(
    State(state): State<WebState>,
    Query(query): Query<RunQuery>,
) -> ApiResult {
    let account_id = query.account_id.as_deref().map(str::trim).filter(|a| !a.is_empty());
    let report = state.scheduler.run_now(account_id).await?;
    Ok(Json(json!({ "ok": true, "report": report })))
}

async fn api_status(State(state): State<WebState>, Path(account_id): Path<String>) -> ApiResult {
    let configuration = state.validator.get_status(&account_id).await?;
    let validation_state = state.validator.state(&account_id).await?;
    Ok(Json(json!({
        "ok": true,
        "state": validation_state,
        "configuration": configuration,
    })))
}

async fn api_permissions(
    State(state): State<WebState>,
    Path(account_id): Path<String>,
) -> ApiResult {
    let report = state.validator.get_permissions(&account_id).await?;
    Ok(Json(json!({ "ok": true, "result": report })))
}

async fn api_revalidate(
    State(state): State<WebState>,
    Path(account_id): Path<String>,
) -> ApiResult {
    let outcome = state.validator.revalidate(&account_id).await?;
    Ok(Json(json!({ "ok": true, "result": outcome })))
}

async fn api_delete(State(state): State<WebState>, Path(account_id): Path<String>) -> ApiResult {
    state.validator.delete(&account_id).await?;
    Ok(Json(json!({ "ok": true, "deleted": account_id })))
}

async fn api_history(
    State(state): State<WebState>,
    Path(account_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let records = state.validator.history(&account_id, limit).await?;
    Ok(Json(json!({
        "ok": true,
        "account_id": account_id,
        "count": records.len(),
        "history": records,
    })))
}

async fn api_stats(State(state): State<WebState>, Query(query): Query<StatsQuery>) -> ApiResult {
    let days = query
        .days
        .unwrap_or(DEFAULT_STATS_DAYS)
        .clamp(1, MAX_STATS_DAYS);
    let stats = state.validator.statistics(days).await?;
    Ok(Json(json!({ "ok": true, "days": days, "statistics": stats })))
}

async fn api_health(State(state): State<WebState>) -> impl IntoResponse {
    let report = state.validator.health().await;
    let status = if report.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ok": report.status == HealthStatus::Healthy,
            "version": env!("CARGO_PKG_VERSION"),
            "health": report,
        })),
    )
}

fn build_router(web_state: WebState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/stats", get(api_stats))
        .route("/api/channels", get(api_list))
        .route("/api/channels/setup", post(api_setup))
        .route("/api/channels/batch", post(api_batch))
        .route("/api/permissions/summary", get(api_permission_summary))
        .route("/api/scheduler", get(api_scheduler_status))
        .route("/api/scheduler/run", post(api_scheduler_run))
        .route(
            "/api/channels/:account_id",
            get(api_status).delete(api_delete),
        )
        .route("/api/channels/:account_id/permissions", get(api_permissions))
        .route("/api/channels/:account_id/revalidate", post(api_revalidate))
        .route("/api/channels/:account_id/history", get(api_history))
        .with_state(web_state)
}

pub fn router(validator: Arc<ChannelValidator>, scheduler: Arc<RevalidationScheduler>) -> Router {
    build_router(WebState {
        validator,
        scheduler,
    })
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    config: &Config,
    validator: Arc<ChannelValidator>,
    scheduler: Arc<RevalidationScheduler>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ChanguardError> {
    let addr = format!("{}:{}", config.web_host, config.web_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Channel API available at http://{addr}");
    axum::serve(listener, router(validator, scheduler))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BotCredentials, BotIdentity, ChannelInfo, ChannelKind, Membership, MembershipStatus};
    use crate::clock::SystemClock;
    use crate::credentials::StaticCredentialDirectory;
    use crate::db::Database;
    use crate::scheduler::SchedulerSettings;
    use crate::gateway::GatewayClient;
    use crate::permissions::{Permission, PermissionSet};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct StubGateway {
        admin: bool,
        reachable: bool,
    }

    #[async_trait]
    impl GatewayClient for StubGateway {
        async fn resolve_channel(
            &self,
            _bot_token: &str,
            channel_handle: &str,
        ) -> Result<ChannelInfo, ChanguardError> {
            Ok(ChannelInfo {
                id: -100,
                handle: channel_handle.to_string(),
                title: "Demo".into(),
                kind: ChannelKind::Channel,
                member_count: 5,
            })
        }

        async fn resolve_bot_membership(
            &self,
            _bot_token: &str,
            _channel_id: i64,
            _bot_id: i64,
        ) -> Result<Membership, ChanguardError> {
            Ok(Membership {
                status: if self.admin {
                    MembershipStatus::Administrator
                } else {
                    MembershipStatus::Member
                },
                permissions: PermissionSet::from_granted([
                    Permission::PostMessages,
                    Permission::EditMessages,
                ]),
            })
        }

        async fn resolve_bot_identity(
            &self,
            _bot_token: &str,
        ) -> Result<BotIdentity, ChanguardError> {
            Ok(BotIdentity {
                id: 1,
                username: None,
            })
        }

        async fn probe(&self) -> Result<(), ChanguardError> {
            if self.reachable {
                Ok(())
            } else {
                Err(ChanguardError::Transport("unreachable".into()))
            }
        }
    }

    /// Removes the test database directory when dropped.
    struct TestDir(std::path::PathBuf);

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn test_app(gateway: StubGateway) -> (Router, TestDir) {
        let dir = std::env::temp_dir().join(format!("changuard_webtest_{}", uuid::Uuid::new_v4()));
        let db = Arc::new(Database::new(dir.to_str().unwrap()).unwrap());
        let credentials = StaticCredentialDirectory::default().with_account(
            "acct",
            BotCredentials {
                bot_id: 1,
                bot_token: "1:x".into(),
            },
        );
        let validator = Arc::new(ChannelValidator::new(
            db,
            Arc::new(gateway),
            Arc::new(credentials),
            Arc::new(SystemClock),
            Duration::from_secs(5),
        ));
        let scheduler = Arc::new(RevalidationScheduler::new(
            validator.clone(),
            SchedulerSettings {
                interval: Duration::from_secs(3600),
                staleness: chrono::Duration::minutes(60),
                concurrency: 2,
                batch_limit: 10,
                deadline: Duration::from_secs(5),
                retention: chrono::Duration::days(30),
                prune_interval: Duration::from_secs(3600),
            },
        ));
        (router(validator, scheduler), TestDir(dir))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_status_of_unconfigured_account_is_404() {
        let (app, _app_dir) = test_app(StubGateway {
            admin: true,
            reachable: true,
        });
        let (status, json) = send(&app, "GET", "/api/channels/acct", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["ok"], false);
        assert_eq!(json["code"], "NOT_CONFIGURED");
    }

    #[tokio::test]
    async fn test_setup_then_status_permissions_and_history() {
        let (app, _app_dir) = test_app(StubGateway {
            admin: true,
            reachable: true,
        });
        let (status, json) = send(
            &app,
            "POST",
            "/api/channels/setup",
            Some(r#"{"account_id":"acct","channel_handle":"demo"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"]["configuration"]["is_validated"], true);
        assert_eq!(json["result"]["configuration"]["channel_handle"], "@demo");

        let (status, json) = send(&app, "GET", "/api/channels/acct", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "validated");

        let (_, json) = send(&app, "GET", "/api/channels/acct/permissions", None).await;
        assert_eq!(json["result"]["evaluation"]["satisfied"], true);

        let (_, json) = send(&app, "GET", "/api/channels/acct/history?limit=5", None).await;
        assert_eq!(json["count"], 1);

        let (_, json) = send(&app, "GET", "/api/channels", None).await;
        assert_eq!(json["count"], 1);

        let (_, json) = send(&app, "GET", "/api/stats?days=1", None).await;
        assert_eq!(json["statistics"]["total"], 1);
    }

    #[tokio::test]
    async fn test_setup_not_admin_is_422_and_persisted() {
        let (app, _app_dir) = test_app(StubGateway {
            admin: false,
            reachable: true,
        });
        let (status, json) = send(
            &app,
            "POST",
            "/api/channels/setup",
            Some(r#"{"account_id":"acct","channel_handle":"@demo"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["code"], "BOT_NOT_ADMIN");

        let (status, json) = send(&app, "GET", "/api/channels/acct", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "failed");
    }

    #[tokio::test]
    async fn test_unknown_account_setup_is_404() {
        let (app, _app_dir) = test_app(StubGateway {
            admin: true,
            reachable: true,
        });
        let (status, json) = send(
            &app,
            "POST",
            "/api/channels/setup",
            Some(r#"{"account_id":"ghost","channel_handle":"@demo"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "ACCOUNT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_revalidate_and_delete_unconfigured() {
        let (app, _app_dir) = test_app(StubGateway {
            admin: true,
            reachable: true,
        });
        let (status, json) = send(&app, "POST", "/api/channels/acct/revalidate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "NOT_CONFIGURED");
        let (status, _) = send(&app, "DELETE", "/api/channels/acct", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_degraded_gateway() {
        let (healthy, _healthy_dir) = test_app(StubGateway {
            admin: true,
            reachable: true,
        });
        let (status, json) = send(&healthy, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["health"]["status"], "healthy");

        let (degraded, _degraded_dir) = test_app(StubGateway {
            admin: true,
            reachable: false,
        });
        let (status, json) = send(&degraded, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["health"]["status"], "degraded");
        assert_eq!(json["health"]["store"], true);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorCode::TransportError), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(ErrorCode::StorageUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(ErrorCode::ChannelPrivate),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(ErrorCode::InvalidRequest), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_status_lists_each_account() {
        let (app, _dir) = test_app(StubGateway {
            admin: true,
            reachable: true,
        });
        send(
            &app,
            "POST",
            "/api/channels/setup",
            Some(r#"{"account_id":"acct","channel_handle":"@demo"}"#),
        )
        .await;
        let (status, json) = send(
            &app,
            "POST",
            "/api/channels/batch",
            Some(r#"{"account_ids":["acct","ghost"]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 2);
        assert_eq!(json["results"][0]["state"], "validated");
        assert_eq!(json["results"][0]["configuration"]["is_validated"], true);
        assert_eq!(json["results"][1]["code"], "ACCOUNT_NOT_FOUND");

        let (status, json) = send(
            &app,
            "POST",
            "/api/channels/batch",
            Some(r#"{"account_ids":[]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_permission_summary_and_scheduler_routes() {
        let (app, _dir) = test_app(StubGateway {
            admin: true,
            reachable: true,
        });
        send(
            &app,
            "POST",
            "/api/channels/setup",
            Some(r#"{"account_id":"acct","channel_handle":"@demo"}"#),
        )
        .await;

        let (_, json) = send(&app, "GET", "/api/permissions/summary", None).await;
        assert_eq!(json["summary"]["total_channels"], 1);
        assert_eq!(json["summary"]["with_all_required"], 1);

        let (status, json) = send(&app, "GET", "/api/scheduler", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["scheduler"]["running"], false);
        assert!(json["scheduler"]["last_run"].is_null());

        let (status, json) = send(&app, "POST", "/api/scheduler/run?account_id=acct", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["report"]["succeeded"], 1);

        let (status, json) = send(&app, "POST", "/api/scheduler/run?account_id=ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "NOT_CONFIGURED");

        let (_, json) = send(&app, "GET", "/api/scheduler", None).await;
        assert_eq!(json["scheduler"]["runs_completed"], 1);
        assert_eq!(json["scheduler"]["last_run"]["trigger"], "manual");
    }
}
