// packages/runify/src/transport/channel.rs
//! Session-scoped Transport Channel
//!
//! A small HTTP/1 server the browser-resident runtime talks back to. It is
//! started before the runtime exists; its address and a per-session token
//! are embedded in the bootstrap. Two routes, both under the token:
//!
//! ```text
//! GET  /<token>/        host page carrying the bootstrap payload
//! POST /<token>/event   one RuntimeEvent as JSON → EventQueue
//! ```
//!
//! The first peer that posts an event binds the session; events from any
//! other peer are refused.

use crate::protocol::RuntimeEvent;
use crate::transport::event_queue::EventQueue;
use crate::utils::errors::{HarnessError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Endpoints currently owned by a live channel, keyed to their session token
static BOUND_ENDPOINTS: Lazy<DashMap<SocketAddr, String>> = Lazy::new(DashMap::new);

/// Configuration for a Transport Channel
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local address to bind (port 0 picks a free port)
    pub bind: SocketAddr,

    /// Host name the runtime should use to reach us (defaults to the bind IP)
    pub advertise_host: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise_host: None,
        }
    }
}

struct ChannelState {
    token: String,
    events: Arc<EventQueue>,
    page: RwLock<Option<String>>,
    bound_peer: Mutex<Option<IpAddr>>,
}

/// Running Transport Channel for one agent session
pub struct TransportChannel {
    local_addr: SocketAddr,
    advertise_host: String,
    state: Arc<ChannelState>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl TransportChannel {
    /// Bind the listening socket and start serving
    pub async fn bind(config: TransportConfig, events: Arc<EventQueue>) -> Result<Self> {
        if config.bind.port() != 0 && BOUND_ENDPOINTS.contains_key(&config.bind) {
            return Err(HarnessError::ConfigurationError(format!(
                "transport endpoint {} is already bound by another session",
                config.bind
            )));
        }

        let listener = TcpListener::bind(config.bind).await.map_err(|e| {
            HarnessError::Transport(format!("Failed to bind {}: {}", config.bind, e))
        })?;
        let local_addr = listener.local_addr()?;

        let token = ulid::Ulid::new().to_string().to_lowercase();

        if BOUND_ENDPOINTS.insert(local_addr, token.clone()).is_some() {
            return Err(HarnessError::ConfigurationError(format!(
                "transport endpoint {} is already bound by another session",
                local_addr
            )));
        }

        let advertise_host = config
            .advertise_host
            .unwrap_or_else(|| local_addr.ip().to_string());

        let state = Arc::new(ChannelState {
            token,
            events,
            page: RwLock::new(None),
            bound_peer: Mutex::new(None),
        });

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(Self::serve(listener, Arc::clone(&state), shutdown.clone()));

        info!("Transport channel listening on {}", local_addr);

        Ok(Self {
            local_addr,
            advertise_host,
            state,
            shutdown,
            server: Mutex::new(Some(server)),
        })
    }

    /// Accept loop; one task per connection
    async fn serve(listener: TcpListener, state: Arc<ChannelState>, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&state);
                    let shutdown = shutdown.clone();

                    tokio::spawn(async move {
                        debug!("Accepted transport connection from {}", peer);

                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { Ok::<_, Infallible>(Self::handle(req, peer, &state).await) }
                        });

                        let connection = http1::Builder::new().serve_connection(io, service);

                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            result = connection => {
                                if let Err(e) = result {
                                    debug!("Transport connection from {} ended: {}", peer, e);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept transport connection: {}", e);
                }
            }
        }

        debug!("Transport accept loop stopped");
    }

    /// Route one request
    async fn handle(
        req: Request<Incoming>,
        peer: SocketAddr,
        state: &ChannelState,
    ) -> Response<Full<Bytes>> {
        let prefix = format!("/{}/", state.token);
        let path = req.uri().path().to_string();

        let Some(route) = path.strip_prefix(&prefix) else {
            warn!("Refusing transport request for foreign path {}", path);
            return Self::respond(StatusCode::NOT_FOUND, "unknown session");
        };

        match (req.method(), route) {
            (&Method::GET, "") => match state.page.read().clone() {
                Some(html) => {
                    let mut response = Response::new(Full::new(Bytes::from(html)));
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/html; charset=utf-8"),
                    );
                    response
                }
                None => Self::respond(StatusCode::SERVICE_UNAVAILABLE, "host page not ready"),
            },
            (&Method::POST, "event") => {
                {
                    let mut bound = state.bound_peer.lock();
                    match *bound {
                        Some(ip) if ip != peer.ip() => {
                            warn!("Refusing event from {}; session bound to {}", peer, ip);
                            return Self::respond(StatusCode::CONFLICT, "session already bound");
                        }
                        Some(_) => {}
                        None => {
                            info!("Transport session bound to {}", peer.ip());
                            *bound = Some(peer.ip());
                        }
                    }
                }

                let body = match req.into_body().collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) => {
                        warn!("Failed to read event body: {}", e);
                        return Self::respond(StatusCode::BAD_REQUEST, "unreadable body");
                    }
                };

                match RuntimeEvent::from_json(&body) {
                    Ok(event) => {
                        debug!("Transport event: {:?}", event);
                        if state.events.push(event).is_err() {
                            return Self::respond(StatusCode::GONE, "session closed");
                        }
                        Self::respond(StatusCode::NO_CONTENT, "")
                    }
                    Err(e) => {
                        warn!("{}", e);
                        Self::respond(StatusCode::BAD_REQUEST, "malformed event")
                    }
                }
            }
            _ => Self::respond(StatusCode::NOT_FOUND, "no such route"),
        }
    }

    fn respond(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
        *response.status_mut() = status;
        response
    }

    /// Publish the host page served at the session URL
    pub fn set_host_page(&self, html: String) {
        *self.state.page.write() = Some(html);
    }

    /// Base URL the runtime uses, e.g. `http://127.0.0.1:40123`
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.advertise_host, self.local_addr.port())
    }

    /// URL of the host page
    pub fn session_url(&self) -> String {
        format!("{}/{}/", self.endpoint(), self.state.token)
    }

    /// URL the runtime posts events to
    pub fn event_url(&self) -> String {
        format!("{}/{}/event", self.endpoint(), self.state.token)
    }

    pub fn token(&self) -> &str {
        &self.state.token
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving and release the endpoint
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        self.shutdown.cancel();
        BOUND_ENDPOINTS.remove(&self.local_addr);

        let server = self.server.lock().take();
        if let Some(handle) = server {
            if let Err(e) = handle.await {
                warn!("Transport server task failed: {}", e);
            }
        }

        info!("Transport channel on {} closed", self.local_addr);
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
        BOUND_ENDPOINTS.remove(&self.local_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn channel() -> (TransportChannel, Arc<EventQueue>) {
        let events = Arc::new(EventQueue::new());
        let channel = TransportChannel::bind(TransportConfig::default(), Arc::clone(&events))
            .await
            .unwrap();
        (channel, events)
    }

    #[tokio::test]
    async fn test_event_lands_in_queue() {
        let (channel, events) = channel().await;

        let client = reqwest::Client::new();
        let response = client
            .post(channel.event_url())
            .body(r#"{"type":"print","seq":1,"text":"a"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 204);

        let event = tokio::time::timeout(Duration::from_secs(5), events.pop())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(RuntimeEvent::Print {
                seq: Some(1),
                text: "a".into()
            })
        );

        channel.close().await;
    }

    #[tokio::test]
    async fn test_serves_host_page() {
        let (channel, _events) = channel().await;
        let client = reqwest::Client::new();

        let early = client.get(channel.session_url()).send().await.unwrap();
        assert_eq!(early.status().as_u16(), 503);

        channel.set_host_page("<html><body>boot</body></html>".into());
        let page = client.get(channel.session_url()).send().await.unwrap();
        assert_eq!(page.status().as_u16(), 200);
        assert!(page.text().await.unwrap().contains("boot"));

        channel.close().await;
    }

    #[tokio::test]
    async fn test_foreign_token_refused() {
        let (channel, events) = channel().await;
        let client = reqwest::Client::new();

        let url = format!("{}/someone-else/event", channel.endpoint());
        let response = client
            .post(url)
            .body(r#"{"type":"destroy"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        assert!(events.is_empty());

        channel.close().await;
    }

    #[tokio::test]
    async fn test_malformed_event_rejected() {
        let (channel, events) = channel().await;
        let client = reqwest::Client::new();

        let response = client
            .post(channel.event_url())
            .body("{nope")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        assert!(events.is_empty());

        channel.close().await;
    }

    #[tokio::test]
    async fn test_endpoint_is_exclusive() {
        let (first, _events) = channel().await;

        let config = TransportConfig {
            bind: first.local_addr(),
            advertise_host: None,
        };
        let second = TransportChannel::bind(config.clone(), Arc::new(EventQueue::new())).await;
        assert!(matches!(second, Err(HarnessError::ConfigurationError(_))));

        first.close().await;

        // released endpoints can be bound again
        let third = TransportChannel::bind(config, Arc::new(EventQueue::new())).await;
        if let Ok(third) = third {
            third.close().await;
        }
    }

    #[tokio::test]
    async fn test_advertised_host() {
        let events = Arc::new(EventQueue::new());
        let config = TransportConfig {
            advertise_host: Some("10.31.0.120".into()),
            ..Default::default()
        };
        let channel = TransportChannel::bind(config, events).await.unwrap();

        assert!(channel.endpoint().starts_with("http://10.31.0.120:"));
        assert!(channel.session_url().ends_with(&format!("/{}/", channel.token())));

        channel.close().await;
    }
}
