//! HTTP reverse proxy (spec.md §4.7): host-based routing to a tunnel,
//! chunked request/response streaming, and WebSocket upgrade via a raw
//! connection hijack. Webhook hosts are diverted to [`crate::webhook`]
//! before a tunnel lookup ever happens.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, Limited};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use tunnel_protocol::{ErrorCode, HeaderMultiMap, HttpPayload, Payload, RequestFrame, TcpChunk};

use crate::error::{error_response, wants_html};
use crate::registry::tunnel::{MailboxKind, MailboxMessage, RESPONSE_MAILBOX_CAPACITY};
use crate::registry::{Manager, Tunnel};
use crate::store::{unix_now, RequestLogRow, TunnelStore};
use crate::webhook::WebhookRouter;

/// Hard cap on a request body (spec.md §4.7); larger bodies get a 413.
const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;
/// Per-request deadline once the request has been enqueued on the tunnel.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for the single response frame that answers a WebSocket upgrade.
const UPGRADE_DEADLINE: Duration = Duration::from_secs(10);
/// Idle timeout for each direction of a proxied WebSocket connection.
const WEBSOCKET_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Bytes accounted for a status line (spec.md §4.7 size-accounting convention).
const STATUS_LINE_OVERHEAD: u64 = 20;

pub struct HttpProxy {
    manager: Arc<Manager>,
    webhook: Arc<WebhookRouter>,
    store: Arc<dyn TunnelStore>,
    base_domain: String,
    max_request_logs_per_tunnel: u64,
}

impl HttpProxy {
    pub fn new(
        manager: Arc<Manager>,
        webhook: Arc<WebhookRouter>,
        store: Arc<dyn TunnelStore>,
        base_domain: String,
        max_request_logs_per_tunnel: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            webhook,
            store,
            base_domain,
            max_request_logs_per_tunnel,
        })
    }
}

/// Top-level entry point mounted as an axum fallback so every Host reaches
/// this one handler — there is no static route table, routing is entirely
/// by subdomain (spec.md §4.7, §6).
pub async fn handle(State(proxy): State<Arc<HttpProxy>>, req: Request<Body>) -> Response {
    let headers = req.headers().clone();
    let accept_wants_html = wants_html(headers.get("accept").and_then(|v| v.to_str().ok()));
    let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()).map(str::to_string) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidArgument,
            "missing Host header",
            accept_wants_html,
        );
    };

    if WebhookRouter::is_webhook_request(&host) {
        return handle_webhook(&proxy, &host, req).await;
    }

    let host_only = host.split(':').next().unwrap_or(&host);
    let Some(subdomain) = host_only
        .strip_suffix(&format!(".{}", proxy.base_domain))
        .map(str::to_string)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidArgument,
            &format!("host does not end in .{}", proxy.base_domain),
            accept_wants_html,
        );
    };

    let Some(tunnel) = proxy.manager.lookup_by_subdomain(&subdomain) else {
        return error_response(
            StatusCode::NOT_FOUND,
            ErrorCode::Unavailable,
            "no tunnel is registered for this subdomain",
            accept_wants_html,
        );
    };

    if is_websocket_upgrade(&headers) {
        handle_websocket(proxy, tunnel, req).await
    } else {
        handle_chunked(proxy, tunnel, req, accept_wants_html).await
    }
}

async fn handle_webhook(proxy: &Arc<HttpProxy>, host: &str, req: Request<Body>) -> Response {
    let accept_wants_html = wants_html(req.headers().get("accept").and_then(|v| v.to_str().ok()));
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let (org_subdomain, app_name, user_path) = match proxy.webhook.extract_components(host, &path).await {
        Ok(v) => v,
        Err(e) => {
            return error_response(StatusCode::NOT_FOUND, e.wire_code(), &e.to_string(), accept_wants_html)
        }
    };

    let payload = match read_http_payload(&parts.method, &user_path, parts.uri.query(), &parts.headers, body, "webhook").await
    {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match proxy.webhook.broadcast(&org_subdomain, &app_name, payload).await {
        Ok(result) => match result.first_success {
            Some(idx) => {
                let response = &result.responses[idx];
                let mut builder = Response::builder().status(response.status.unwrap_or(200));
                for (name, value) in &response.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                builder.body(Body::from(response.body.clone())).unwrap()
            }
            None => axum::Json(serde_json::json!({
                "error": "no tunnel produced a successful response",
                "responses": result.responses.iter().map(|r| serde_json::json!({
                    "tunnel_id": r.tunnel_id,
                    "success": r.success,
                    "status": r.status,
                    "error": r.error,
                })).collect::<Vec<_>>(),
            }))
            .into_response(),
        },
        Err(e) => error_response(e.status_code(), e.wire_code(), &e.to_string(), accept_wants_html),
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

async fn read_http_payload(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Body,
    remote_addr: &str,
) -> Result<HttpPayload, Response> {
    let limited = Limited::new(body, MAX_REQUEST_BODY);
    let collected = limited.collect().await.map_err(|_| {
        error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::ResourceExhausted,
            &format!("request body exceeds {MAX_REQUEST_BODY} bytes"),
            false,
        )
    })?;
    let body_bytes: Bytes = collected.to_bytes();

    let mut map = HeaderMultiMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str(), v);
        }
    }
    Ok(HttpPayload::request(
        method.as_str(),
        path,
        query.unwrap_or(""),
        map,
        body_bytes.to_vec(),
        remote_addr,
    ))
}

/// Size-accounting convention (spec.md §4.7): per-header `len(name) +
/// len(value) + 4`, a flat 20 bytes for the status/request line, plus
/// method/path/query/protocol overhead.
fn accounted_request_size(payload: &HttpPayload) -> u64 {
    STATUS_LINE_OVERHEAD
        + payload.method.len() as u64
        + payload.path.len() as u64
        + payload.query.len() as u64
        + payload.headers.accounted_size() as u64
        + payload.body.len() as u64
}

async fn handle_chunked(proxy: Arc<HttpProxy>, tunnel: Arc<Tunnel>, req: Request<Body>, wants_html_resp: bool) -> Response {
    let (parts, body) = req.into_parts();
    let remote_addr = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let payload = match read_http_payload(
        &parts.method,
        parts.uri.path(),
        parts.uri.query(),
        &parts.headers,
        body,
        &remote_addr,
    )
    .await
    {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let method = payload.method.clone();
    let path = payload.path.clone();
    let bytes_in = accounted_request_size(&payload);
    let request_id = Uuid::new_v4();
    let mut mailbox = tunnel.register_pending(request_id, MailboxKind::Http, RESPONSE_MAILBOX_CAPACITY);

    let frame = RequestFrame {
        request_id,
        tunnel_id: tunnel.id,
        payload: Payload::Http(payload),
    };
    if tunnel.enqueue_request(frame).await.is_err() {
        tunnel.remove_pending(request_id, MailboxKind::Http);
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unavailable,
            "tunnel is not accepting requests",
            wants_html_resp,
        );
    }

    let first = match timeout(REQUEST_DEADLINE, mailbox.recv()).await {
        Ok(Some(MailboxMessage::Response(frame))) => frame,
        Ok(Some(MailboxMessage::Error(err))) => {
            tunnel.remove_pending(request_id, MailboxKind::Http);
            return error_response(StatusCode::BAD_GATEWAY, ErrorCode::Internal, &err.message, wants_html_resp);
        }
        Ok(None) => {
            tunnel.remove_pending(request_id, MailboxKind::Http);
            return error_response(
                StatusCode::BAD_GATEWAY,
                ErrorCode::Unavailable,
                "tunnel closed before responding",
                wants_html_resp,
            );
        }
        Err(_elapsed) => {
            tunnel.remove_pending(request_id, MailboxKind::Http);
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                ErrorCode::DeadlineExceeded,
                "local service did not respond in time",
                wants_html_resp,
            );
        }
    };

    let Payload::Http(first_http) = first.payload else {
        tunnel.remove_pending(request_id, MailboxKind::Http);
        return error_response(
            StatusCode::BAD_GATEWAY,
            ErrorCode::Internal,
            "tunnel returned a non-HTTP payload",
            wants_html_resp,
        );
    };

    let status = first_http.status.unwrap_or(200);
    let mut builder = Response::builder().status(status);
    for (name, value) in first_http.headers.iter() {
        builder = builder.header(name, value);
    }
    let mut bytes_out = STATUS_LINE_OVERHEAD + first_http.headers.accounted_size() as u64 + first_http.body.len() as u64;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(RESPONSE_MAILBOX_CAPACITY);
    if !first_http.body.is_empty() {
        let _ = tx.send(Ok(Bytes::from(first_http.body))).await;
    }

    if first.end_of_stream {
        drop(tx);
        tunnel.remove_pending(request_id, MailboxKind::Http);
        tunnel.update_stats(bytes_in, bytes_out);
        log_request(&proxy, tunnel.id, &method, &path, status, 0, bytes_in, bytes_out, &remote_addr);
    } else {
        let proxy = proxy.clone();
        let tunnel = tunnel.clone();
        let started = std::time::Instant::now();
        tokio::spawn(async move {
            loop {
                match timeout(REQUEST_DEADLINE, mailbox.recv()).await {
                    Ok(Some(MailboxMessage::Response(frame))) => {
                        let Payload::Http(http) = frame.payload else { break };
                        if !http.body.is_empty() {
                            bytes_out += http.body.len() as u64;
                            if tx.send(Ok(Bytes::from(http.body))).await.is_err() {
                                break;
                            }
                        }
                        if frame.end_of_stream {
                            break;
                        }
                    }
                    Ok(Some(MailboxMessage::Error(err))) => {
                        warn!(tunnel_id = %tunnel.id, request_id = %request_id, error = %err.message, "client sent an error frame mid-response");
                        let _ = tx.send(Err(std::io::Error::other(err.message))).await;
                        break;
                    }
                    Ok(None) => break,
                    Err(_elapsed) => break,
                }
            }
            tunnel.remove_pending(request_id, MailboxKind::Http);
            tunnel.update_stats(bytes_in, bytes_out);
            log_request(
                &proxy,
                tunnel.id,
                &method,
                &path,
                status,
                started.elapsed().as_millis() as u64,
                bytes_in,
                bytes_out,
                &remote_addr,
            );
        });
    }

    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[allow(clippy::too_many_arguments)]
fn log_request(
    proxy: &Arc<HttpProxy>,
    tunnel_id: Uuid,
    method: &str,
    path: &str,
    status: u16,
    duration_ms: u64,
    bytes_in: u64,
    bytes_out: u64,
    client_ip: &str,
) {
    let store = proxy.store.clone();
    let cap = proxy.max_request_logs_per_tunnel;
    let row = RequestLogRow {
        id: Uuid::new_v4(),
        tunnel_id,
        method: method.to_string(),
        path: path.to_string(),
        status_code: status,
        duration_ms,
        bytes_in,
        bytes_out,
        client_ip: client_ip.to_string(),
        created_at: unix_now(),
    };
    tokio::spawn(async move {
        if store.insert_request_log(row).await.is_ok() {
            let _ = store.trim_request_logs(tunnel_id, cap).await;
        }
    });
}

async fn handle_websocket(proxy: Arc<HttpProxy>, tunnel: Arc<Tunnel>, mut req: Request<Body>) -> Response {
    let on_upgrade = hyper::upgrade::on(&mut req);
    let (parts, body) = req.into_parts();
    let remote_addr = "unknown".to_string();
    let payload = match read_http_payload(&parts.method, parts.uri.path(), parts.uri.query(), &parts.headers, body, &remote_addr).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let request_id = Uuid::new_v4();
    let mut mailbox = tunnel.register_pending(request_id, MailboxKind::Http, 4);
    let frame = RequestFrame {
        request_id,
        tunnel_id: tunnel.id,
        payload: Payload::Http(payload),
    };
    if tunnel.enqueue_request(frame).await.is_err() {
        tunnel.remove_pending(request_id, MailboxKind::Http);
        return StatusCode::BAD_GATEWAY.into_response();
    }

    let reply = match timeout(UPGRADE_DEADLINE, mailbox.recv()).await {
        Ok(Some(MailboxMessage::Response(frame))) => frame,
        _ => {
            tunnel.remove_pending(request_id, MailboxKind::Http);
            return StatusCode::GATEWAY_TIMEOUT.into_response();
        }
    };
    tunnel.remove_pending(request_id, MailboxKind::Http);

    let Payload::Http(http) = reply.payload else {
        return StatusCode::BAD_GATEWAY.into_response();
    };
    let status = http.status.unwrap_or(502);
    let mut builder = Response::builder().status(status);
    for (name, value) in http.headers.iter() {
        builder = builder.header(name, value);
    }
    let response = builder.body(Body::from(http.body)).unwrap();

    if status == 101 {
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => run_websocket_pumps(upgraded, tunnel, request_id).await,
                Err(e) => warn!(error = %e, "failed to complete websocket upgrade"),
            }
        });
    }
    response
}

async fn run_websocket_pumps(upgraded: Upgraded, tunnel: Arc<Tunnel>, request_id: Uuid) {
    let io = TokioIo::new(upgraded);
    let (mut read_half, mut write_half) = tokio::io::split(io);
    let mut mailbox = tunnel.register_pending(request_id, MailboxKind::WebSocket, RESPONSE_MAILBOX_CAPACITY);

    let upstream_tunnel = tunnel.clone();
    let upstream = tokio::spawn(async move {
        let mut buf = vec![0u8; 32 * 1024];
        let mut sequence = 0u64;
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let frame = RequestFrame {
                        request_id,
                        tunnel_id: upstream_tunnel.id,
                        payload: Payload::Tcp(TcpChunk { bytes: buf[..n].to_vec(), sequence }),
                    };
                    sequence += 1;
                    if upstream_tunnel.enqueue_request(frame).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let downstream = tokio::spawn(async move {
        loop {
            match timeout(WEBSOCKET_IDLE_TIMEOUT, mailbox.recv()).await {
                Ok(Some(MailboxMessage::Response(frame))) => {
                    let Payload::Tcp(chunk) = frame.payload else { continue };
                    if chunk.bytes.is_empty() || frame.end_of_stream {
                        break;
                    }
                    if write_half.write_all(&chunk.bytes).await.is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }
    tunnel.remove_pending(request_id, MailboxKind::WebSocket);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_protocol::HeaderMultiMap;

    #[test]
    fn accounted_size_matches_convention() {
        let mut headers = HeaderMultiMap::new();
        headers.insert("X-A", "1");
        let payload = HttpPayload::request("GET", "/path", "q=1", headers, vec![1, 2, 3], "1.2.3.4");
        let expected = STATUS_LINE_OVERHEAD + 3 /* GET */ + 5 /* /path */ + 3 /* q=1 */ + (4 + 1 + 4) + 3;
        assert_eq!(accounted_request_size(&payload), expected);
    }

    #[test]
    fn websocket_headers_are_detected() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("connection", "Upgrade".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));
    }
}
