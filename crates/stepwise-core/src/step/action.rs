//! Action step executors: HTTP requests, event publishing, and document
//! store operations. Side effects go through the injected collaborator
//! traits; this module only resolves templates and classifies outcomes.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use stepwise_types::workflow::{ActionConfig, HttpAuth};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::expression::{EvalError, resolve_object, resolve_template};
use crate::repository::{DocumentStore, EventSink, HttpCaller, HttpRequest};
use crate::step::StepResult;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

pub async fn run_action<H, E, D>(
    action: &ActionConfig,
    ctx: &ExecutionContext,
    http: &H,
    events: &E,
    documents: &D,
) -> StepResult
where
    H: HttpCaller,
    E: EventSink,
    D: DocumentStore,
{
    match action {
        ActionConfig::HttpRequest {
            method,
            url,
            headers,
            body,
            auth,
            timeout_secs,
            valid_status_codes,
        } => {
            run_http(
                method,
                url,
                headers,
                body.as_ref(),
                auth.as_ref(),
                *timeout_secs,
                valid_status_codes,
                ctx,
                http,
            )
            .await
        }
        ActionConfig::PublishEvent {
            event_type,
            subject,
            data,
        } => run_publish(event_type, subject.as_deref(), data, ctx, events).await,
        ActionConfig::StoreQuery {
            store,
            query,
            parameters,
        } => run_store_query(store, query, parameters, ctx, documents).await,
        ActionConfig::StoreUpsert { store, document } => {
            run_store_upsert(store, document, ctx, documents).await
        }
        ActionConfig::StoreDelete {
            store,
            key,
            partition,
        } => run_store_delete(store, key, partition.as_deref(), ctx, documents).await,
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_http<H: HttpCaller>(
    method: &str,
    url: &str,
    headers: &HashMap<String, String>,
    body: Option<&Value>,
    auth: Option<&HttpAuth>,
    timeout_secs: Option<u64>,
    valid_status_codes: &[u16],
    ctx: &ExecutionContext,
    http: &H,
) -> StepResult {
    let request = match build_http_request(method, url, headers, body, auth, timeout_secs, ctx) {
        Ok(request) => request,
        Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
    };
    debug!(method = %request.method, url = %request.url, "dispatching http action");

    let response = match http.call(request).await {
        Ok(response) => response,
        Err(err) => return StepResult::failed(err.code(), err.to_string()),
    };

    let parsed_body = parse_body(&response.headers, &response.body);
    let output = json!({
        "status": response.status,
        "headers": response.headers,
        "body": parsed_body,
    });

    if valid_status_codes.contains(&response.status) {
        StepResult::ok(Some(output))
    } else {
        let mut result = StepResult::failed(
            format!("HTTP_{}", response.status),
            format!("unexpected status {}", response.status),
        );
        result.output = Some(output);
        result
    }
}

fn build_http_request(
    method: &str,
    url: &str,
    headers: &HashMap<String, String>,
    body: Option<&Value>,
    auth: Option<&HttpAuth>,
    timeout_secs: Option<u64>,
    ctx: &ExecutionContext,
) -> Result<HttpRequest, EvalError> {
    let url = resolve_template(url, ctx)?;
    let mut resolved_headers = HashMap::with_capacity(headers.len() + 1);
    for (name, value) in headers {
        resolved_headers.insert(name.clone(), resolve_template(value, ctx)?);
    }
    if let Some(auth) = auth {
        let (name, value) = auth_header(auth, ctx)?;
        resolved_headers.insert(name, value);
    }
    let body = match body {
        Some(template) => Some(resolve_object(template, ctx)?),
        None => None,
    };
    Ok(HttpRequest {
        method: method.to_uppercase(),
        url,
        headers: resolved_headers,
        body,
        timeout_secs: timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
    })
}

/// Secrets in auth config are templates, typically `{{env.*}}` references.
fn auth_header(auth: &HttpAuth, ctx: &ExecutionContext) -> Result<(String, String), EvalError> {
    match auth {
        HttpAuth::Bearer { token } => {
            let token = resolve_template(token, ctx)?;
            Ok(("Authorization".to_string(), format!("Bearer {token}")))
        }
        HttpAuth::Basic { username, password } => {
            let username = resolve_template(username, ctx)?;
            let password = resolve_template(password, ctx)?;
            let encoded = BASE64.encode(format!("{username}:{password}"));
            Ok(("Authorization".to_string(), format!("Basic {encoded}")))
        }
        HttpAuth::ApiKey { header, value } => {
            Ok((header.clone(), resolve_template(value, ctx)?))
        }
    }
}

/// JSON when the content type says so (or the body parses as JSON anyway),
/// raw text otherwise.
fn parse_body(headers: &HashMap<String, String>, body: &str) -> Value {
    let is_json = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .is_some_and(|(_, value)| value.contains("json"));
    if is_json || body.trim_start().starts_with(['{', '[']) {
        if let Ok(parsed) = serde_json::from_str(body) {
            return parsed;
        }
    }
    Value::String(body.to_string())
}

// ---------------------------------------------------------------------------
// Event publish
// ---------------------------------------------------------------------------

async fn run_publish<E: EventSink>(
    event_type: &str,
    subject: Option<&str>,
    data: &Value,
    ctx: &ExecutionContext,
    events: &E,
) -> StepResult {
    let event_type = match resolve_template(event_type, ctx) {
        Ok(t) => t,
        Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
    };
    let subject = match subject {
        Some(s) => match resolve_template(s, ctx) {
            Ok(s) => Some(s),
            Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
        },
        None => None,
    };
    let data = match resolve_object(data, ctx) {
        Ok(d) => d,
        Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
    };

    let event_id = Uuid::now_v7();
    events.publish(&event_type, subject.as_deref(), &data).await;
    StepResult::ok(Some(json!({
        "eventId": event_id,
        "eventType": event_type,
        "subject": subject,
    })))
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

async fn run_store_query<D: DocumentStore>(
    store: &str,
    query: &str,
    parameters: &HashMap<String, Value>,
    ctx: &ExecutionContext,
    documents: &D,
) -> StepResult {
    let mut resolved = HashMap::with_capacity(parameters.len());
    for (name, value) in parameters {
        match resolve_object(value, ctx) {
            Ok(v) => {
                resolved.insert(name.clone(), v);
            }
            Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
        }
    }
    match documents.query(store, query, &resolved).await {
        Ok(rows) => StepResult::ok(Some(Value::Array(rows))),
        Err(err) => {
            warn!(store, %err, "store query failed");
            StepResult::failed("STORE_QUERY_ERROR", err.to_string())
        }
    }
}

async fn run_store_upsert<D: DocumentStore>(
    store: &str,
    document: &Value,
    ctx: &ExecutionContext,
    documents: &D,
) -> StepResult {
    let document = match resolve_object(document, ctx) {
        Ok(d) => d,
        Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
    };
    match documents.upsert(store, &document).await {
        Ok(stored) => StepResult::ok(Some(stored)),
        Err(err) => {
            warn!(store, %err, "store upsert failed");
            StepResult::failed("STORE_UPSERT_ERROR", err.to_string())
        }
    }
}

async fn run_store_delete<D: DocumentStore>(
    store: &str,
    key: &str,
    partition: Option<&str>,
    ctx: &ExecutionContext,
    documents: &D,
) -> StepResult {
    let key = match resolve_template(key, ctx) {
        Ok(k) => k,
        Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
    };
    match documents.delete(store, &key, partition).await {
        Ok(existed) => StepResult::ok(Some(json!({ "deleted": existed }))),
        Err(err) => {
            warn!(store, %err, "store delete failed");
            StepResult::failed("STORE_DELETE_ERROR", err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
