use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderValue, Method, Request, Response, StatusCode};
use axum::routing::{any, get};
use tokio::time::timeout_at;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::moderation::ModerationClient;
use crate::openai::ChatCompletionRequest;
use crate::provider::{CarriedResponse, Endpoint, HttpClients, ProxyRequest, UpstreamError};
use crate::upstream::IndexSet;
use crate::upstream::registry::Registry;


const REQUEST_DEADLINE: Duration = Duration::from_secs(180);
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// The data plane: authenticates, moderates, resolves a pool, and drives the
/// retry loop across its upstreams. Fully re-entrant; every request owns its
/// buffered body and used-index set.
#[derive(Clone)]
pub struct DispatchService {
    conf: Arc<Config>,
    registry: Arc<Registry>,
    moderation: Option<Arc<ModerationClient>>,
    metrics: Arc<Metrics>,
}

impl DispatchService {
    pub fn new(
        conf: Arc<Config>,
        registry: Arc<Registry>,
        clients: &HttpClients,
        metrics: Arc<Metrics>,
    ) -> Self {
        let moderation = conf.moderation.enabled.then(|| {
            Arc::new(ModerationClient::new(
                &conf.moderation.api.server,
                &conf.moderation.api.key,
                &conf.moderation.api.model,
                clients.for_rule(conf.moderation.api.proxy).clone(),
            ))
        });

        Self {
            conf,
            registry,
            moderation,
            metrics,
        }
    }

    fn authorized(&self, headers: &axum::http::HeaderMap) -> bool {
        let Some(raw) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let token = match raw.get(..7) {
            Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => raw[7..].trim(),
            _ => raw.trim(),
        };
        if token.is_empty() {
            return false;
        }
        self.conf
            .keys
            .iter()
            .any(|key| key.eq_ignore_ascii_case(token))
    }
}

pub fn router(service: DispatchService) -> Router {
    let mut router = Router::new();

    if service.conf.enable_prometheus {
        let metrics = service.metrics.clone();
        router = router.route(
            "/metrics",
            get(move || {
                let metrics = metrics.clone();
                async move { metrics.render() }
            }),
        );
    }

    let root = service.clone();
    router
        .route("/", any(move |req| handle(root.clone(), req)))
        .route("/{*path}", any(move |req| handle(service.clone(), req)))
}

async fn handle(service: DispatchService, req: Request<Body>) -> Response<Body> {
    // CORS preflight
    if req.method() == Method::OPTIONS {
        return Response::new(Body::empty());
    }

    if !service.authorized(req.headers()) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let (parts, body) = req.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| q.to_string());
    let headers = parts.headers;

    service.metrics.record_request(&path);

    let has_body = method != Method::GET && method != Method::OPTIONS && method != Method::HEAD;
    let body = if has_body {
        match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("read request body: {err}"),
                );
            }
        }
    } else {
        axum::body::Bytes::new()
    };

    let deadline = tokio::time::Instant::now() + REQUEST_DEADLINE;

    // Moderation gate. Service failures are logged and the request goes on.
    if let Some(moderation) = &service.moderation
        && Endpoint::needs_moderation(&path)
    {
        let client_ignores = service.conf.moderation.client_can_ignore
            && headers
                .get("x-ignore-moderation")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        if client_ignores {
            debug!("client ignores moderation for {path}");
        } else {
            let chat: ChatCompletionRequest = match serde_json::from_slice(&body) {
                Ok(chat) => chat,
                Err(err) => {
                    warn!("moderation gate failed to decode request: {err}");
                    return error_response(StatusCode::BAD_REQUEST, "invalid request");
                }
            };

            // tool-call continuations carry a trailing robot message and
            // never contain fresh user input
            let is_tool_continuation = chat
                .messages
                .last()
                .is_some_and(|m| m.role.eq_ignore_ascii_case("robot"));

            if !is_tool_continuation {
                match moderation.check(&moderation.request_for_chat(&chat)).await {
                    Err(err) => {
                        warn!("moderation failed, continuing anyway: {err}");
                    }
                    Ok(result) => {
                        let threshold = service.conf.moderation.score_threshold;
                        if result.flagged(threshold) {
                            let flagged = result.flagged_categories(threshold);
                            let violated: Vec<String> = flagged
                                .into_iter()
                                .filter(|c| service.conf.moderation.categories.contains(c))
                                .collect();

                            if !violated.is_empty() {
                                warn!(
                                    "request blocked by moderation, categories: {}",
                                    violated.join(",")
                                );
                                service.metrics.record_flagged();
                                let mut resp = error_response(
                                    StatusCode::UNPROCESSABLE_ENTITY,
                                    "the request contains illegal content, we cannot service you",
                                );
                                if let Ok(value) = HeaderValue::from_str(&violated.join(",")) {
                                    resp.headers_mut().insert("x-violated-categories", value);
                                }
                                return resp;
                            }

                            info!("request flagged by moderation, but not blocked");
                        }
                    }
                }
            }
        }
    }

    // Route classification.
    if path.trim_end_matches('/') == "/v1/models" {
        let body = match serde_json::to_vec(service.registry.model_list()) {
            Ok(body) => body,
            Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };
        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty()));
    }

    let mut model = String::new();
    let pool = if Endpoint::has_model(&path) {
        model = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("model")
                    .and_then(|m| m.as_str())
                    .map(|s| s.to_string())
            })
            .unwrap_or_default();
        if model.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "model is required");
        }

        service
            .registry
            .select_pool(&model)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| service.registry.default_pool())
    } else {
        service.registry.default_pool()
    };

    let request = ProxyRequest {
        method,
        path,
        query,
        headers,
        body,
    };

    // Retry state machine: every attempt marks its index used, and the pool
    // hands out the next candidate until none remain.
    let mut used = IndexSet::new();
    let Some(mut selected) = pool.next(&used) else {
        return error_response(StatusCode::BAD_REQUEST, "not support");
    };
    used.insert(selected.index);

    let mut retries = 0u32;
    let mut last_carried: Option<CarriedResponse> = None;

    loop {
        debug!(
            "dispatch {} {} via {} (candidates: {}, model: {})",
            request.method,
            request.path,
            selected.name(),
            pool.len(),
            if model.is_empty() { "-" } else { model.as_str() }
        );

        let failed = match timeout_at(deadline, selected.adapter.serve(&request)).await {
            Ok(Ok(resp)) => {
                service.metrics.record_response(resp.status().as_u16());
                return resp;
            }
            Ok(Err(err)) => err,
            Err(_) => {
                // Deadline expiry is terminal; a cancelled attempt is never
                // replayed onto another upstream.
                error!(
                    "request deadline exceeded on {} after {} retries",
                    selected.name(),
                    retries
                );
                service.metrics.record_exhausted();
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "all upstreams failed");
            }
        };

        let message = failed.to_string();
        last_carried = match failed {
            UpstreamError::RetryWithResponse { response, .. } => Some(response),
            UpstreamError::Retry { .. } => None,
        };

        match pool.next(&used) {
            Some(next) => {
                retries += 1;
                service.metrics.record_retry();
                warn!(
                    "retry next upstream[{}]: {} -> {} ({})",
                    retries,
                    selected.name(),
                    next.name(),
                    message
                );
                used.insert(next.index);
                selected = next;
            }
            None => {
                error!(
                    "all upstreams failed: used={}, retries={}, last error: {}",
                    used.len(),
                    retries,
                    message
                );
                service.metrics.record_exhausted();
                return match last_carried {
                    Some(carried) => {
                        service.metrics.record_response(carried.status.as_u16());
                        carried.into_response()
                    }
                    None => {
                        error_response(StatusCode::INTERNAL_SERVER_ERROR, "all upstreams failed")
                    }
                };
            }
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({"error": {"message": message}});
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
