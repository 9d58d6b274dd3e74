//! Per-route permission enforcement. Every route under `/v1` names the
//! [`Permission`] it requires and wraps itself with [`require`] — the gateway
//! does the rest (API-key lookup, IP allow-list, rate limiting, audit).

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use bpmn_engine::auth::{AuthGateway, Permission};

use crate::error::ApiError;

const API_KEY_HEADER: &str = "x-api-key";

pub fn require(
    auth: Arc<AuthGateway>,
    permission: Permission,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Result<Response, ApiError>> + Send>> + Clone {
    move |req: Request, next: Next| {
        let auth = auth.clone();
        Box::pin(async move {
            let api_key = req
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let client_ip = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

            auth.authorize(&api_key, client_ip, permission).await?;
            Ok(next.run(req).await)
        })
    }
}
