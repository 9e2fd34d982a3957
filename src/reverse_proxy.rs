use crate::config::{Config, Environment};
use crate::cors::CorsPolicy;
use anyhow::{Result, anyhow};
use chrono::Utc;
use hyper::header::HeaderValue;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode, Uri, header};
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::broadcast;

/// Start the forwarding gateway. Binds the configured port, serves until the
/// listen port changes via a config reload, then rebinds.
pub async fn start_rp_server() -> Result<()> {
    loop {
        let config = Config::get().await;
        let listen_port = config.get_listen_port();
        let addr = SocketAddr::from(([0, 0, 0, 0], listen_port));

        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let remote_addr = conn.remote_addr().ip();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let client_ip = remote_addr;
                    async move {
                        match handle_request(client_ip, req).await {
                            Ok(resp) => Ok::<_, Infallible>(resp),
                            Err(e) => {
                                error!("handle_request error from {}: {}", client_ip, e);
                                Ok::<_, Infallible>(Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(Body::empty())
                                    .unwrap())
                            }
                        }
                    }
                }))
            }
        });

        let builder = match hyper::Server::try_bind(&addr) {
            Ok(b) => b,
            Err(e) => {
                error!("Failed to bind CORS proxy on {}: {}", addr, e);
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                continue;
            }
        };

        let server = builder.serve(make_svc);

        info!("CORS proxy listening on http://{}", addr);
        info!("Forwarding {}/* -> {}", config.get_forward_prefix(), config.get_upstream());
        info!("Active CORS policy: {}", Environment::active().policy_name());
        if Environment::active() == Environment::Production && config.active_policy().allows_any_origin() {
            warn!("Production policy allows any origin; edit {} to restrict it", config.get_path().display());
        }

        // Reloads that move the listen port need a rebind; everything else is
        // picked up per-request from the config cell.
        let mut updates = Config::subscribe();
        let shutdown = async move {
            loop {
                match updates.recv().await {
                    Ok(updated) if updated.get_listen_port() != listen_port => {
                        info!("Listen port changed to {}; rebinding", updated.get_listen_port());
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} config updates while serving", n)
                    }
                }
            }
        };

        if let Err(e) = server.with_graceful_shutdown(shutdown).await {
            error!("Server error: {}", e);
        }
    }
}

async fn handle_request(client_ip: IpAddr, req: Request<Body>) -> Result<Response<Body>> {
    let config = Config::get().await;
    route_request(&config, client_ip, req).await
}

pub(crate) async fn route_request(config: &Config, client_ip: IpAddr, req: Request<Body>) -> Result<Response<Body>> {
    let policy = config.active_policy();
    let request_origin =
        req.headers().get(header::ORIGIN).and_then(|v| v.to_str().ok()).map(|v| v.to_string());

    // Preflight short-circuits on any path, without touching the upstream
    if req.method() == Method::OPTIONS {
        debug!("Preflight {} from {}", req.uri().path(), client_ip);
        return policy.preflight_response(request_origin.as_deref());
    }

    if req.method() == Method::GET && req.uri().path() == "/health" {
        let mut response = health_response(config)?;
        policy.apply_to(request_origin.as_deref(), response.headers_mut());
        return Ok(response);
    }

    if path_in_prefix(req.uri().path(), config.get_forward_prefix()) {
        return forward_to_upstream(config, &policy, request_origin.as_deref(), client_ip, req).await;
    }

    warn!("Received request from {} for unknown path {}", client_ip, req.uri().path());
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/plain")
        .body(Body::from("Not Found"))?)
}

/// True if the request path is the prefix itself or nested under it.
fn path_in_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || prefix == "/" {
        return true;
    }
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

fn health_response(config: &Config) -> Result<Response<Body>> {
    let body = serde_json::json!({
        "status": "healthy",
        "proxy": "running",
        "backend": config.get_upstream(),
        "timestamp": Utc::now().to_rfc3339(),
    });
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))?)
}

async fn forward_to_upstream(
    config: &Config,
    policy: &CorsPolicy,
    request_origin: Option<&str>,
    client_ip: IpAddr,
    mut req: Request<Body>,
) -> Result<Response<Body>> {
    let upstream = config.get_upstream().trim_end_matches('/').to_string();
    let upstream_uri: Uri =
        upstream.parse().map_err(|e| anyhow!("Invalid upstream URL '{}': {}", upstream, e))?;
    let authority =
        upstream_uri.authority().ok_or_else(|| anyhow!("Upstream URL '{}' has no authority", upstream))?.to_string();

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // The upstream should see itself as the target origin, not the proxy
    req.headers_mut().insert(header::HOST, HeaderValue::from_str(&authority)?);
    req.headers_mut().insert(header::ORIGIN, HeaderValue::from_str(&upstream)?);

    info!("Proxying {} {} -> {}{}", method, path, upstream, path);

    match hyper_reverse_proxy::call(client_ip, &upstream, req).await {
        Ok(mut response) => {
            debug!("Upstream response {} for {} {}", response.status(), method, path);
            policy.apply_to(request_origin, response.headers_mut());
            Ok(response)
        }
        Err(error) => {
            error!("Proxy error for {} {}: {:?}", method, path, error);
            let body = serde_json::json!({
                "success": false,
                "message": "Proxy server error",
                "error": format!("{:?}", error),
            });
            let mut response = Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))?;
            policy.apply_to(request_origin, response.headers_mut());
            Ok(response)
        }
    }
}
