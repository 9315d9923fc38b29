use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use liblinkcheck::{Deadline, LinkService, Probe, ProbeError, ServiceError};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};

pub const PASSWORD_HEADER: &str = "Password";

pub struct AppState<P: Probe> {
    service: LinkService<P>,
    password: Option<Arc<str>>,
    stop: CancellationToken,
    report_timeout: Duration,
}

impl<P: Probe> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            password: self.password.clone(),
            stop: self.stop.clone(),
            report_timeout: self.report_timeout,
        }
    }
}

impl<P: Probe> AppState<P> {
    /// `stop` is cancelled by `/system/stop`; the caller owns the shutdown.
    pub fn new(
        service: LinkService<P>,
        password: Option<String>,
        stop: CancellationToken,
        report_timeout: Duration,
    ) -> Self {
        Self {
            service,
            password: password.map(Arc::from),
            stop,
            report_timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub links: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkStatus {
    pub domain: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub links: Vec<LinkStatus>,
    pub links_num: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub links_list: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn rejected(rejection: JsonRejection) -> Response {
    warn!(error = %rejection.body_text(), "invalid request body");
    error_response(StatusCode::BAD_REQUEST, "Invalid request body")
}

pub fn router<P: Probe>(state: AppState<P>, base_path: &str) -> Router {
    let system = Router::new()
        .route("/system/stop", post(stop::<P>))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_password::<P>,
        ));

    let routes = Router::new()
        .route("/links/check", post(check_links::<P>))
        .route("/links/get_report", post(get_report::<P>))
        .merge(system)
        .with_state(state);

    let app = if base_path.is_empty() {
        routes
    } else {
        Router::new().nest(base_path, routes)
    };
    instrument(app)
}

/// Access log for every request; a panicking handler becomes a 500.
fn instrument(app: Router) -> Router {
    app.layer(CatchPanicLayer::new()).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

async fn check_links<P: Probe>(
    State(state): State<AppState<P>>,
    payload: Result<Json<CheckRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return rejected(rejection),
    };

    match state.service.submit(request.links).await {
        Ok(set) => Json(CheckResponse {
            links_num: set.number,
            links: set
                .links
                .iter()
                .map(|l| LinkStatus {
                    domain: l.domain.clone(),
                    status: l.label().to_string(),
                })
                .collect(),
        })
        .into_response(),
        Err(e) if e.is_retry_later() => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service is restarting, the set will be checked after restart",
        ),
        Err(ServiceError::InvalidDomain(position)) => error_response(
            StatusCode::BAD_REQUEST,
            format!("Link at position {} is empty", position),
        ),
        Err(ServiceError::Probe(ProbeError::DeadlineExceeded)) => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "Timed out while checking the link set",
        ),
        Err(e) => {
            error!(error = %e, "link set check failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to process link set")
        }
    }
}

async fn get_report<P: Probe>(
    State(state): State<AppState<P>>,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return rejected(rejection),
    };
    if request.links_list.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No set numbers requested");
    }

    let deadline = Deadline::after(state.report_timeout);
    match state.service.report(&request.links_list, &deadline).await {
        Ok(report) => {
            let disposition = format!("attachment; filename=\"{}\"", report.file_name());
            let mut response = report.body.into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
            response
        }
        Err(ServiceError::Store(e)) if e.is_not_found() => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) if e.is_retry_later() => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Service is restarting")
        }
        Err(e) => {
            error!(error = %e, "report generation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate report")
        }
    }
}

async fn require_password<P: Probe>(
    State(state): State<AppState<P>>,
    request: Request,
    next: Next,
) -> Response {
    let supplied = request
        .headers()
        .get(PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok());

    let refusal = match (state.password.as_deref(), supplied) {
        (Some(expected), Some(given)) if expected == given => None,
        (_, None) => Some("Password required"),
        _ => Some("Invalid password"),
    };

    match refusal {
        None => next.run(request).await,
        Some(reason) => {
            warn!(reason, "system request refused");
            error_response(StatusCode::UNAUTHORIZED, reason)
        }
    }
}

async fn stop<P: Probe>(State(state): State<AppState<P>>) -> Response {
    info!("stop requested over http");
    state.stop.cancel();
    Json(MessageBody {
        message: "Service is stopping".to_string(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use liblinkcheck::{FanOutConfig, FileStore, QueueConfig};
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// `.invalid` is down, everything else is up.
    struct Offline;

    impl Probe for Offline {
        async fn probe(&self, domain: &str, _deadline: &Deadline) -> Result<bool, ProbeError> {
            Ok(!domain.ends_with(".invalid"))
        }
    }

    struct Harness {
        _dir: TempDir,
        app: Router,
        service: LinkService<Offline>,
        stop: CancellationToken,
    }

    async fn harness(base_path: &str, password: Option<&str>) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("links.jsonl")).await.unwrap();
        let config = QueueConfig {
            workers: 2,
            recovery_path: dir.path().join("queue.json"),
            ..QueueConfig::default()
        };
        let service = LinkService::start(Offline, store, FanOutConfig::default(), config).await;
        let stop = CancellationToken::new();
        let state = AppState::new(
            service.clone(),
            password.map(str::to_string),
            stop.clone(),
            Duration::from_secs(5),
        );
        Harness {
            _dir: dir,
            app: router(state, base_path),
            service,
            stop,
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn check_returns_labelled_links_in_order() {
        let h = harness("/api", None).await;
        let response = h
            .app
            .clone()
            .oneshot(post_json(
                "/api/links/check",
                r#"{"links":["example.com","nope.invalid"]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: CheckResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body.links_num, 1);
        assert_eq!(body.links[0].domain, "example.com");
        assert_eq!(body.links[0].status, "available");
        assert_eq!(body.links[1].status, "not available");
    }

    #[tokio::test]
    async fn malformed_and_empty_domains_are_bad_requests() {
        let h = harness("", None).await;
        let response = h
            .app
            .clone()
            .oneshot(post_json("/links/check", r#"{"link":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = h
            .app
            .clone()
            .oneshot(post_json("/links/check", r#"{"links":["a.com",""]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("position 1"));
    }

    #[tokio::test]
    async fn check_after_shutdown_is_unavailable() {
        let h = harness("", None).await;
        h.service.shutdown(Duration::from_secs(1)).await.unwrap();

        let response = h
            .app
            .clone()
            .oneshot(post_json("/links/check", r#"{"links":["a.com"]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorBody = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(body.error.contains("restart"));
    }

    #[tokio::test]
    async fn report_is_a_text_attachment() {
        let h = harness("", None).await;
        for links in [r#"{"links":["a.com"]}"#, r#"{"links":["b.invalid"]}"#] {
            let response = h.app.clone().oneshot(post_json("/links/check", links)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = h
            .app
            .clone()
            .oneshot(post_json("/links/get_report", r#"{"links_list":[2,1]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"sets_2-1.txt\""
        );
        let text = body_string(response).await;
        let set2 = text.find("Set #2").unwrap();
        let set1 = text.find("Set #1").unwrap();
        assert!(set2 < set1);
        assert!(text.contains("b.invalid"));
    }

    #[tokio::test]
    async fn report_for_unknown_set_is_bad_request() {
        let h = harness("", None).await;
        let response = h
            .app
            .clone()
            .oneshot(post_json("/links/get_report", r#"{"links_list":[42]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = h
            .app
            .clone()
            .oneshot(post_json("/links/get_report", r#"{"links_list":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stop_requires_the_password() {
        let h = harness("/api", Some("secret")).await;

        let response = h
            .app
            .clone()
            .oneshot(Request::post("/api/system/stop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = h
            .app
            .clone()
            .oneshot(
                Request::post("/api/system/stop")
                    .header(PASSWORD_HEADER, "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!h.stop.is_cancelled());

        let response = h
            .app
            .clone()
            .oneshot(
                Request::post("/api/system/stop")
                    .header(PASSWORD_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.stop.is_cancelled());
    }

    #[tokio::test]
    async fn panicking_handler_is_a_server_error() {
        async fn explode() -> &'static str {
            panic!("handler failed")
        }

        let app = instrument(Router::new().route("/explode", axum::routing::get(explode)));
        let response = app
            .clone()
            .oneshot(Request::get("/explode").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // the service keeps answering afterwards
        let response = app
            .oneshot(Request::get("/elsewhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_is_refused_without_a_configured_password() {
        let h = harness("", None).await;
        let response = h
            .app
            .clone()
            .oneshot(
                Request::post("/system/stop")
                    .header(PASSWORD_HEADER, "")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!h.stop.is_cancelled());
    }
}
