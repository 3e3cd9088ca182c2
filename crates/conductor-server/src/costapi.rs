//! HTTP cost query surface: five GET endpoints projecting the cost store
//! through the authorizer, with exactly one audit entry per request.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

use conductor_cost::{
    AuditEntry, AuditLog, Authorizer, CostAggregate, CostFilter, CostStore,
};

/// Header set by the upstream authenticator naming the calling user.
pub const USER_HEADER: &str = "x-conductor-user";

/// Accuracy-class language shared by every cost response.
const ACCURACY_NOTE: &str = "measured = provider-reported tokens priced from the configured pricing table; estimated = derived from the local pricing table only; unavailable = cost not computed";

pub struct CostApiState {
    pub store: Arc<dyn CostStore>,
    pub authz: Arc<Authorizer>,
    pub audit: Arc<AuditLog>,
}

pub fn router(state: Arc<CostApiState>) -> Router {
    Router::new()
        .route("/v1/costs", get(costs_summary))
        .route("/v1/costs/by-provider", get(costs_by_provider))
        .route("/v1/costs/by-model", get(costs_by_model))
        .route("/v1/costs/by-workflow", get(costs_by_workflow))
        .route("/v1/runs/{id}/costs", get(run_costs))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct CostQuery {
    since: Option<String>,
    until: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    workflow: Option<String>,
    run: Option<String>,
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
}

/// Build the store filter; the window defaults to the last 30 days.
fn parse_filter(query: &CostQuery) -> Result<CostFilter, String> {
    let start = match query.since {
        Some(ref raw) => parse_rfc3339(raw)?,
        None => Utc::now() - Duration::days(30),
    };
    let end = query.until.as_deref().map(parse_rfc3339).transpose()?;
    Ok(CostFilter {
        start: Some(start),
        end,
        provider: query.provider.clone(),
        model: query.model.clone(),
        workflow_id: query.workflow.clone(),
        run_id: query.run.clone(),
        ..Default::default()
    })
}

fn caller(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn client_info(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string());
    let agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    (ip, agent)
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"error": {"code": code, "message": message}})),
    )
        .into_response()
}

/// Common prologue shared by every endpoint: resolve the caller, parse the
/// filter, check the permission, and scope non-admins to their own records.
/// The error arm carries the already-audited response.
fn authorize(
    state: &CostApiState,
    headers: &HeaderMap,
    query: &CostQuery,
    action: &str,
    resource: &str,
    permitted: impl Fn(&Authorizer, &str) -> bool,
) -> Result<(String, CostFilter), Response> {
    let (ip, agent) = client_info(headers);
    let Some(user) = caller(headers) else {
        state.audit.log(
            AuditEntry::failure("", action, resource, "missing authentication")
                .with_client(ip, agent),
        );
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing caller identity",
        ));
    };
    let mut filter = match parse_filter(query) {
        Ok(filter) => filter,
        Err(message) => {
            state.audit.log(
                AuditEntry::failure(&user, action, resource, &message).with_client(ip, agent),
            );
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &message,
            ));
        }
    };
    if !permitted(&state.authz, &user) {
        state.audit.log(
            AuditEntry::failure(&user, action, resource, "permission denied")
                .with_client(ip, agent),
        );
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "forbidden",
            "cost:read permission required",
        ));
    }
    // Non-admins only ever see their own records.
    if !state.authz.is_admin(&user) {
        filter.user_id = Some(user.clone());
    }
    Ok((user, filter))
}

fn audit_ok(state: &CostApiState, headers: &HeaderMap, user: &str, action: &str, resource: &str) {
    let (ip, agent) = client_info(headers);
    state
        .audit
        .log(AuditEntry::success(user, action, resource).with_client(ip, agent));
}

fn audit_store_error(
    state: &CostApiState,
    headers: &HeaderMap,
    user: &str,
    action: &str,
    resource: &str,
    err: &conductor_core::ConductorError,
) -> Response {
    let (ip, agent) = client_info(headers);
    state.audit.log(
        AuditEntry::failure(user, action, resource, err.to_string()).with_client(ip, agent),
    );
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "store_error",
        "cost store query failed",
    )
}

async fn costs_summary(
    State(state): State<Arc<CostApiState>>,
    Query(query): Query<CostQuery>,
    headers: HeaderMap,
) -> Response {
    let (action, resource) = ("costs.view", "/v1/costs");
    let (user, filter) = match authorize(&state, &headers, &query, action, resource, |a, u| {
        a.can_view(u)
    }) {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    match state.store.aggregate(&filter).await {
        Ok(agg) => {
            audit_ok(&state, &headers, &user, action, resource);
            let body = json!({
                "summary": {
                    "totalCost": agg.total_cost,
                    "totalCostAccuracy": agg.accuracy.as_str(),
                    "totalTokens": agg.usage.total_tokens,
                    "totalRequests": agg.total_requests,
                    "period": {
                        "start": filter.start.map(|t| t.to_rfc3339()),
                        "end": filter.end.unwrap_or_else(Utc::now).to_rfc3339(),
                    },
                    "accuracyBreakdown": {
                        "measured": agg.breakdown.measured,
                        "estimated": agg.breakdown.estimated,
                        "unavailable": agg.breakdown.unavailable,
                    },
                },
                "accuracyNote": ACCURACY_NOTE,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => audit_store_error(&state, &headers, &user, action, resource, &err),
    }
}

fn grouped_body(groups: BTreeMap<String, CostAggregate>) -> Value {
    let providers: Vec<Value> = groups
        .into_iter()
        .map(|(key, agg)| {
            json!({
                "provider": key,
                "totalCost": agg.total_cost,
                "accuracy": agg.accuracy.as_str(),
                "requests": agg.total_requests,
                "tokens": {
                    "input": agg.usage.prompt_tokens,
                    "output": agg.usage.completion_tokens,
                },
            })
        })
        .collect();
    json!({"providers": providers, "accuracyNote": ACCURACY_NOTE})
}

enum Grouping {
    Provider,
    Model,
    Workflow,
}

async fn costs_grouped(
    state: Arc<CostApiState>,
    headers: HeaderMap,
    query: CostQuery,
    grouping: Grouping,
) -> Response {
    let (action, resource) = match grouping {
        Grouping::Provider => ("costs.view_by_provider", "/v1/costs/by-provider"),
        Grouping::Model => ("costs.view_by_model", "/v1/costs/by-model"),
        Grouping::Workflow => ("costs.view_by_workflow", "/v1/costs/by-workflow"),
    };
    let (user, filter) = match authorize(&state, &headers, &query, action, resource, |a, u| {
        a.can_view(u)
    }) {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let result = match grouping {
        Grouping::Provider => state.store.aggregate_by_provider(&filter).await,
        Grouping::Model => state.store.aggregate_by_model(&filter).await,
        Grouping::Workflow => state.store.aggregate_by_workflow(&filter).await,
    };
    match result {
        Ok(groups) => {
            audit_ok(&state, &headers, &user, action, resource);
            (StatusCode::OK, Json(grouped_body(groups))).into_response()
        }
        Err(err) => audit_store_error(&state, &headers, &user, action, resource, &err),
    }
}

async fn costs_by_provider(
    State(state): State<Arc<CostApiState>>,
    Query(query): Query<CostQuery>,
    headers: HeaderMap,
) -> Response {
    costs_grouped(state, headers, query, Grouping::Provider).await
}

async fn costs_by_model(
    State(state): State<Arc<CostApiState>>,
    Query(query): Query<CostQuery>,
    headers: HeaderMap,
) -> Response {
    costs_grouped(state, headers, query, Grouping::Model).await
}

async fn costs_by_workflow(
    State(state): State<Arc<CostApiState>>,
    Query(query): Query<CostQuery>,
    headers: HeaderMap,
) -> Response {
    costs_grouped(state, headers, query, Grouping::Workflow).await
}

async fn run_costs(
    State(state): State<Arc<CostApiState>>,
    Path(run_id): Path<String>,
    Query(query): Query<CostQuery>,
    headers: HeaderMap,
) -> Response {
    let action = "costs.view_run";
    let resource = format!("/v1/runs/{run_id}/costs");
    let (user, mut filter) =
        match authorize(&state, &headers, &query, action, &resource, |a, u| {
            a.can_view_run_costs(u, &run_id)
        }) {
            Ok(ok) => ok,
            Err(response) => return response,
        };
    filter.run_id = Some(run_id.clone());

    match state.store.query(&filter).await {
        Ok(records) => {
            audit_ok(&state, &headers, &user, action, &resource);
            let overall = CostAggregate::from_records(&records);
            let mut steps: BTreeMap<String, CostAggregate> = BTreeMap::new();
            for record in &records {
                let step = record.step_name.clone().unwrap_or_else(|| "(none)".into());
                steps.entry(step).or_default().add(record);
            }
            let step_costs: BTreeMap<String, Value> = steps
                .into_iter()
                .map(|(step, agg)| (step, serde_json::to_value(&agg).unwrap_or(Value::Null)))
                .collect();
            let body = json!({
                "runId": run_id,
                "totalCost": overall.total_cost,
                "accuracy": overall.accuracy.as_str(),
                "totalTokens": overall.usage.total_tokens,
                "requests": overall.total_requests,
                "stepCosts": step_costs,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => audit_store_error(&state, &headers, &user, action, &resource, &err),
    }
}
