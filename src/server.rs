//! Bundled HTTP distributor
//!
//! Routes every request through the [`Router`] and proxies it to the chosen
//! worker on the loopback interface. WebSocket upgrades are not tunnelled
//! here; distributors that need them call [`Router::route_ws`] themselves.

use std::time::Duration;

use actix_web::dev::Server;
use actix_web::http::header::{self, HeaderName};
use actix_web::{get, web, HttpRequest, HttpResponse, HttpServer};
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info};
use serde_json::json;

use crate::policies::RequestView;
use crate::router::Router;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on a proxied request, including its streamed body
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            request_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub router: Router,
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(router: Router, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { router, client })
    }
}

fn forwarded(name: &HeaderName) -> bool {
    !HOP_BY_HOP.contains(&name.as_str()) && name != header::HOST && name != header::CONTENT_LENGTH
}

#[get("/__sticky/health")]
pub async fn health(app_state: web::Data<AppState>) -> Result<HttpResponse, actix_web::Error> {
    let snapshot = app_state
        .router
        .supervisor()
        .snapshot()
        .await
        .map_err(actix_web::error::ErrorServiceUnavailable)?;
    Ok(HttpResponse::Ok().json(json!({
        "allocator": app_state.router.allocator_name(),
        "desired": snapshot.desired,
        "active": snapshot.active.len(),
        "spawning": snapshot.spawning.len(),
        "terminating": snapshot.terminating.len(),
    })))
}

/// Proxy one request to the worker the router picks
pub async fn distribute(
    req: HttpRequest,
    body: Bytes,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let route = app_state
        .router
        .route_http(&req)
        .await
        .map_err(actix_web::error::ErrorServiceUnavailable)?;
    let url = format!("http://127.0.0.1:{}{}", route.port, RequestView::url(&req));
    debug!("{} {} -> {}", req.method(), RequestView::url(&req), route.port);

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(actix_web::error::ErrorBadRequest)?;
    let mut upstream = app_state.client.request(method, url);
    for (name, value) in req.headers().iter().filter(|(name, _)| forwarded(name)) {
        upstream = upstream.header(name.as_str(), value.as_bytes());
    }
    let resp = upstream
        .body(body)
        .send()
        .await
        .map_err(actix_web::error::ErrorBadGateway)?;

    let status = actix_web::http::StatusCode::from_u16(resp.status().as_u16()).map_err(|e| {
        actix_web::error::ErrorBadGateway(format!("Invalid status code: {}", e))
    })?;
    let mut response = HttpResponse::build(status);
    for (name, value) in resp.headers() {
        let skip = HOP_BY_HOP.contains(&name.as_str()) || name == reqwest::header::CONTENT_LENGTH;
        if skip {
            continue;
        }
        if let Ok(value) = value.to_str() {
            response.append_header((name.as_str(), value));
        }
    }
    if let Some(cookie) = route.set_cookie {
        response.append_header((header::SET_COOKIE, cookie));
    }
    let stream = resp
        .bytes_stream()
        .map(|r| r.map_err(actix_web::error::ErrorBadGateway));
    Ok(response.streaming(stream))
}

/// Bind the distributor without running it
///
/// Signal handling is left to the caller so that shutdown can also stop the
/// worker pool.
pub fn build(config: ServerConfig, app_state: AppState) -> std::io::Result<Server> {
    let app_state = web::Data::new(app_state);
    info!("Starting distributor at {}:{}", config.host, config.port);

    let server = HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .service(health)
            .default_service(web::to(distribute))
    })
    .disable_signals()
    .bind((config.host, config.port))?
    .run();
    Ok(server)
}
