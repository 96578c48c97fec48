//! WebSocket upgrade endpoint for subscribers.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, FromRequestParts, Query, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use log::info;
use serde::Deserialize;

use super::client::{ClientIdentity, serve_client};
use super::error::HubError;
use crate::api::{ApiError, ApiResult, AppState, CurrentUser};

/// Best guess at the subscriber's address: first `X-Forwarded-For` entry,
/// then `X-Real-IP`, then the socket peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr(pub Option<String>);

impl ClientAddr {
    fn from_headers(headers: &HeaderMap) -> Option<String> {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return Some(ip.to_string());
        }

        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = Self::from_headers(&parts.headers).or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });
        Ok(ClientAddr(ip))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeQuery {
    /// Comma separated, case-insensitive topic names.
    #[serde(default)]
    pub event_types: Option<String>,
}

impl SubscribeQuery {
    fn requested(&self) -> Vec<String> {
        self.event_types
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// GET /api/v1/events/subscribe?event_types=vm,host
pub async fn subscribe_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientAddr(remote_ip): ClientAddr,
    Query(query): Query<SubscribeQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    let hub = state.hub.clone();
    if !hub.is_running() {
        return Err(HubError::NotRunning.into());
    }

    if !hub.settings().allow_multiple_connections_per_ip
        && let Some(ip) = remote_ip.as_deref()
        && hub.has_active_connection_from_ip(ip)
    {
        return Err(HubError::ConnectionLimit(ip.to_string()).into());
    }

    let ws = ws.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let requested = query.requested();
    let identity = ClientIdentity {
        user_id: user.id().to_string(),
        username: user.username().to_string(),
    };
    info!(
        "subscriber upgrade from {} ({})",
        identity.username,
        remote_ip.as_deref().unwrap_or("unknown")
    );

    Ok(ws
        .on_upgrade(move |socket| serve_client(socket, hub, identity, remote_ip, requested))
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_for_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(
            ClientAddr::from_headers(&headers).as_deref(),
            Some("203.0.113.7")
        );

        headers.remove("x-forwarded-for");
        assert_eq!(ClientAddr::from_headers(&headers).as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn query_splits_topics() {
        let query = SubscribeQuery {
            event_types: Some(" vm, HOST ,,".to_string()),
        };
        assert_eq!(query.requested(), vec!["vm".to_string(), "HOST".to_string()]);
        assert!(SubscribeQuery::default().requested().is_empty());
    }
}
