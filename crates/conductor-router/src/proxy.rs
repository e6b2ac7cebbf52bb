use std::fmt::Display;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use conductor_common::ModelRunnerEndpoint;

use crate::error::RouteError;
use crate::rewrite::{rewrite_body, RewriteContext};
use crate::{RouteDecision, RouteRequest, Router};

pub const HEADER_VMR_ID: &str = "x-conductor-vmr-id";
pub const HEADER_ENDPOINT_ID: &str = "x-conductor-endpoint-id";
pub const HEADER_MODEL: &str = "x-conductor-model";
pub const HEADER_SESSION_PINNED: &str = "x-conductor-session-pinned";
pub const HEADER_REQUEST_ID: &str = "x-request-id";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const STREAMING_CONTENT_TYPES: &[&str] = &[
    "text/event-stream",
    "application/x-ndjson",
    "application/stream+json",
    "jsonl",
];

/// Settings shared by every forwarded request.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub max_body_bytes: usize,
    /// Scheme sent in `X-Forwarded-Proto` when the client supplied none.
    /// Set to `https` when TLS terminates in front of the gateway.
    pub forwarded_proto: String,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: 32 * 1024 * 1024,
            forwarded_proto: "http".to_string(),
        }
    }
}

fn classify_reqwest_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        return "timeout";
    }
    if error.is_connect() {
        return "connect";
    }
    "other"
}

fn is_hop_by_hop(name: &str, connection_tokens: &[String]) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        || connection_tokens.iter().any(|t| name.eq_ignore_ascii_case(t))
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Headers sent upstream: the client's minus hop-by-hop, host, length and
/// credentials, plus the endpoint's key and forwarding information.
pub fn outbound_headers(
    inbound: &HeaderMap,
    endpoint: &ModelRunnerEndpoint,
    peer: Option<IpAddr>,
    host: Option<&str>,
    forwarded_proto: &str,
) -> HeaderMap {
    let tokens = connection_tokens(inbound);
    let mut out = HeaderMap::with_capacity(inbound.len() + 4);
    for (name, value) in inbound.iter() {
        if is_hop_by_hop(name.as_str(), &tokens)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::AUTHORIZATION
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Some(key) = endpoint.api_key.as_deref().filter(|k| !k.is_empty()) {
        if let Ok(v) = HeaderValue::from_str(&format!("Bearer {key}")) {
            out.insert(header::AUTHORIZATION, v);
        }
    }

    if let Some(ip) = peer {
        let forwarded = match inbound.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.trim().is_empty() => format!("{}, {ip}", prior.trim()),
            _ => ip.to_string(),
        };
        if let Ok(v) = HeaderValue::from_str(&forwarded) {
            out.insert(HeaderName::from_static("x-forwarded-for"), v);
        }
    }
    if !out.contains_key("x-forwarded-host") {
        if let Some(v) = host.and_then(|h| HeaderValue::from_str(h).ok()) {
            out.insert(HeaderName::from_static("x-forwarded-host"), v);
        }
    }
    if !out.contains_key("x-forwarded-proto") {
        if let Ok(v) = HeaderValue::from_str(forwarded_proto) {
            out.insert(HeaderName::from_static("x-forwarded-proto"), v);
        }
    }
    out
}

pub fn is_streaming(headers: &HeaderMap) -> bool {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    if STREAMING_CONTENT_TYPES.iter().any(|t| content_type.contains(t)) {
        return true;
    }
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn copy_response_headers(src: &HeaderMap, dst: &mut Response) {
    let tokens = connection_tokens(src);
    for (name, value) in src.iter() {
        if is_hop_by_hop(name.as_str(), &tokens) || name == header::CONTENT_LENGTH {
            continue;
        }
        dst.headers_mut().append(name.clone(), value.clone());
    }
}

/// How a streaming relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { bytes: u64 },
    ClientGone,
    DeadlineExceeded,
    UpstreamFailed,
}

/// Copy upstream chunks to `tx` until the upstream ends, the receiver goes
/// away or `deadline` passes. A completed relay ends with one empty chunk.
///
/// Sends are bounded by `deadline` too, so a caller that stays connected but
/// stops reading cannot hold the relay open.
pub async fn relay_chunks<S, E>(
    mut upstream: S,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    deadline: Instant,
) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut relayed = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => return RelayOutcome::ClientGone,
            _ = tokio::time::sleep_until(deadline) => return deadline_exceeded(&tx),
            next = upstream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                relayed += chunk.len() as u64;
                match tokio::time::timeout_at(deadline, tx.send(Ok(chunk))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return RelayOutcome::ClientGone,
                    Err(_) => return deadline_exceeded(&tx),
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error=%e, relayed, "upstream stream failed");
                let _ = tokio::time::timeout_at(deadline, tx.send(Err(io::Error::other(e.to_string()))))
                    .await;
                return RelayOutcome::UpstreamFailed;
            }
            None => {
                return match tokio::time::timeout_at(deadline, tx.send(Ok(Bytes::new()))).await {
                    Ok(Ok(())) => RelayOutcome::Completed { bytes: relayed },
                    Ok(Err(_)) => RelayOutcome::ClientGone,
                    Err(_) => deadline_exceeded(&tx),
                };
            }
        }
    }
}

fn deadline_exceeded(tx: &mpsc::Sender<Result<Bytes, io::Error>>) -> RelayOutcome {
    // best effort: a full channel means the caller is not reading anyway
    let _ = tx.try_send(Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "upstream deadline exceeded",
    )));
    RelayOutcome::DeadlineExceeded
}

fn set_header(resp: &mut Response, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        resp.headers_mut().insert(HeaderName::from_static(name), v);
    }
}

/// Run one request through the full pipeline. Errors become JSON responses.
pub async fn handle(
    router: &Router,
    http: &reqwest::Client,
    req: Request<Body>,
    peer: Option<SocketAddr>,
    opts: &ProxyOptions,
) -> Response {
    match forward(router, http, req, peer, opts).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(status = e.status().as_u16(), error=%e, "request rejected");
            e.into_response()
        }
    }
}

pub async fn forward(
    router: &Router,
    http: &reqwest::Client,
    req: Request<Body>,
    peer: Option<SocketAddr>,
    opts: &ProxyOptions,
) -> Result<Response, RouteError> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, opts.max_body_bytes)
        .await
        .map_err(|_| RouteError::PayloadTooLarge("request body too large".into()))?;

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host());
    let peer_ip = peer.map(|a| a.ip());
    let request_id = parts
        .headers
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4()));

    let RouteDecision {
        vmr,
        endpoint,
        kind,
        relative_path,
        session_pinned,
        guard,
    } = router
        .route(&RouteRequest {
            path: parts.uri.path(),
            host,
            headers: &parts.headers,
            peer: peer_ip,
        })
        .await?;

    let catalog = if kind.is_inference() {
        router.model_catalog(&vmr).await
    } else {
        Default::default()
    };
    let rewritten = rewrite_body(
        body,
        &RewriteContext {
            vmr: &vmr,
            kind,
            definitions: &catalog.definitions,
            configurations: &catalog.configurations,
        },
    )?;

    let query = parts
        .uri
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let url = format!("{}{relative_path}{query}", endpoint.base_url());
    let timeout = Duration::from_millis(endpoint.timeout_ms.max(1));
    let deadline = Instant::now() + timeout;

    let mut headers = outbound_headers(&parts.headers, &endpoint, peer_ip, host, &opts.forwarded_proto);
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static(HEADER_REQUEST_ID), v);
    }
    let upstream = http
        .request(parts.method.clone(), &url)
        .headers(headers)
        .timeout(timeout)
        .body(rewritten.body)
        .send()
        .await;
    let resp = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            router.inc_upstream_errors();
            let class = classify_reqwest_error(&e);
            tracing::error!(
                request_id=%request_id,
                vmr_id=%vmr.id,
                endpoint_id=%endpoint.id,
                error=%e,
                kind=class,
                "upstream request failed"
            );
            return Err(RouteError::BadGateway(format!("upstream request failed ({class})")));
        }
    };

    let status = resp.status();
    let resp_headers = resp.headers().clone();

    let mut out = if is_streaming(&resp_headers) {
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(64);
        let upstream = Box::pin(resp.bytes_stream());
        let request_id = request_id.clone();
        let endpoint_id = endpoint.id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = relay_chunks(upstream, tx, deadline).await;
            tracing::debug!(request_id=%request_id, endpoint_id=%endpoint_id, ?outcome, "stream relay finished");
        });
        Response::builder()
            .status(status)
            .body(Body::from_stream(ReceiverStream::new(rx)))
            .map_err(|e| RouteError::BadGateway(e.to_string()))?
    } else {
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                router.inc_upstream_errors();
                let class = classify_reqwest_error(&e);
                tracing::error!(request_id=%request_id, vmr_id=%vmr.id, endpoint_id=%endpoint.id, error=%e, kind=class, "reading upstream body failed");
                return Err(RouteError::BadGateway(format!("upstream request failed ({class})")));
            }
        };
        drop(guard);
        Response::builder()
            .status(status)
            .body(Body::from(bytes))
            .map_err(|e| RouteError::BadGateway(e.to_string()))?
    };

    copy_response_headers(&resp_headers, &mut out);
    set_header(&mut out, HEADER_REQUEST_ID, &request_id);
    set_header(&mut out, HEADER_VMR_ID, &vmr.id);
    set_header(&mut out, HEADER_ENDPOINT_ID, &endpoint.id);
    if let Some(model) = rewritten.model.as_deref() {
        set_header(&mut out, HEADER_MODEL, model);
    }
    set_header(
        &mut out,
        HEADER_SESSION_PINNED,
        if session_pinned { "true" } else { "false" },
    );
    Ok(out)
}
