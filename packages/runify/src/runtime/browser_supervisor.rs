// packages/runify/src/runtime/browser_supervisor.rs
//! Supervisor for WebDriver-driven browsers
//!
//! ```text
//! host ──execute/sync──▶ driver ──▶ page (__runify__.receive)
//!   ▲                                  │
//!   └──── EventQueue ◀── channel ◀─────┘  sync XHR POST /<token>/event
//! ```
//!
//! The page is served by the session's Transport Channel, so its events
//! are same-origin posts. Requests are injected through the driver on a
//! background task: a script that never returns must not hold the caller.

use crate::bootstrap::{Bootstrap, HostFamily};
use crate::protocol::{Request, RuntimeEvent};
use crate::runtime::webdriver::{
    merge_capabilities, BrowserProduct, WebDriverClient, WebDriverSession,
};
use crate::transport::{EventQueue, TransportChannel, TransportConfig};
use crate::utils::config::SupervisorConfig;
use crate::utils::errors::{HarnessError, Result};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Script run through `execute/sync` for every request
const DISPATCH_SCRIPT: &str = "window.__runify__.receive(arguments[0]); return true;";

/// Everything needed to open one browser session
#[derive(Debug, Clone)]
pub struct BrowserLaunch<'a> {
    pub product: BrowserProduct,
    pub webdriver_server: &'a str,
    pub host_path: Option<&'a Path>,
    pub capabilities: &'a Map<String, Value>,
    pub web_host: Option<&'a str>,
}

/// Supervisor managing one browser session
pub struct BrowserSupervisor {
    channel: TransportChannel,
    session: WebDriverSession,
    events: Arc<EventQueue>,
    product: BrowserProduct,
    kill_timeout: Duration,
    closed: AtomicBool,
}

impl BrowserSupervisor {
    /// Bind the channel, open a session and load the host page
    pub async fn start(
        launch: BrowserLaunch<'_>,
        bootstrap: Bootstrap,
        config: &SupervisorConfig,
        events: Arc<EventQueue>,
    ) -> Result<Self> {
        if bootstrap.family() != HostFamily::Browser {
            return Err(HarnessError::ConfigurationError(format!(
                "{} payload handed to a browser",
                bootstrap.family().name()
            )));
        }

        let bind: SocketAddr = config.transport_bind.parse().map_err(|e| {
            HarnessError::ConfigurationError(format!(
                "invalid transport_bind {:?}: {}",
                config.transport_bind, e
            ))
        })?;

        let channel = TransportChannel::bind(
            TransportConfig {
                bind,
                advertise_host: launch.web_host.map(str::to_string),
            },
            Arc::clone(&events),
        )
        .await?;

        let page = bootstrap.with_event_url(channel.event_url()).host_page()?;
        channel.set_host_page(page);

        let mut capabilities = launch.product.default_capabilities(launch.host_path);
        merge_capabilities(&mut capabilities, launch.capabilities);

        info!(
            "Opening {} session on {}",
            launch.product.browser_name(),
            launch.webdriver_server
        );

        let session = match open_session(&launch, capabilities, config, &channel).await {
            Ok(session) => session,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };

        Ok(Self {
            channel,
            session,
            events,
            product: launch.product,
            kill_timeout: config.kill_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    /// Inject one request into the page
    ///
    /// Returns once the injection is under way; failures surface as a
    /// `Disconnected` event.
    pub async fn deliver(&self, request: &Request) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HarnessError::BackendCrashedError(
                "browser session is closed".into(),
            ));
        }

        let frame = serde_json::to_string(request)?;
        let session = self.session.clone();
        let events = Arc::clone(&self.events);
        let op = request.op();
        let seq = request.seq();

        tokio::spawn(async move {
            if let Err(e) = session
                .execute_sync(DISPATCH_SCRIPT, vec![Value::String(frame)])
                .await
            {
                warn!("Injecting {} #{} failed: {}", op, seq, e);
                let _ = events.push(RuntimeEvent::Disconnected {
                    reason: e.to_string(),
                });
            }
        });

        Ok(())
    }

    /// Delete the session and close the channel
    pub async fn terminate(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let deleted = tokio::time::timeout(self.kill_timeout, self.session.delete()).await;
        self.channel.close().await;

        match deleted {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HarnessError::WebDriver(format!(
                "session {} was not deleted within {:?}",
                self.session.id(),
                self.kill_timeout
            ))),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        debug!("Shutting down {} session", self.product.browser_name());
        self.terminate().await
    }

    pub fn channel(&self) -> &TransportChannel {
        &self.channel
    }
}

async fn open_session(
    launch: &BrowserLaunch<'_>,
    capabilities: Value,
    config: &SupervisorConfig,
    channel: &TransportChannel,
) -> Result<WebDriverSession> {
    let client = WebDriverClient::new(launch.webdriver_server)?;
    let session = client.new_session(capabilities).await?;

    let prepared = async {
        session
            .set_script_timeout(Duration::from_millis(config.script_timeout_ms))
            .await?;
        session.navigate(&channel.session_url()).await
    };

    if let Err(e) = prepared.await {
        let _ = session.delete().await;
        return Err(e);
    }

    Ok(session)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::completion::CompletionKind;
    use crate::protocol::PROTOCOL_VERSION;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Method, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::convert::Infallible;
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    const SESSION: &str = "fake-session";

    /// Stand-in WebDriver server whose "page" answers over the Transport Channel
    ///
    /// An `eval` prints its code and completes normally, except for two
    /// codes: `hang` prints `started` and blocks until the session is
    /// deleted, and `vanish` fails the command as if the window was closed.
    pub(crate) struct FakeDriver {
        pub(crate) url: String,
        state: Arc<DriverState>,
    }

    #[derive(Default)]
    struct DriverState {
        event_url: Mutex<Option<String>>,
        commands: Mutex<Vec<String>>,
        deleted: Notify,
    }

    impl FakeDriver {
        pub(crate) async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let state = Arc::new(DriverState::default());

            let shared = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let state = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { Ok::<_, Infallible>(state.handle(req).await) }
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
            });

            Self { url, state }
        }

        /// `METHOD /path` of every command received so far
        pub(crate) fn commands(&self) -> Vec<String> {
            self.state.commands.lock().clone()
        }
    }

    impl DriverState {
        async fn handle(&self, req: hyper::Request<Incoming>) -> Response<Full<Bytes>> {
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            self.commands.lock().push(format!("{} {}", method, path));

            let body = match req.into_body().collect().await {
                Ok(collected) => serde_json::from_slice(&collected.to_bytes()).unwrap_or(Value::Null),
                Err(_) => Value::Null,
            };

            let session = format!("/session/{}", SESSION);
            match (method, path.strip_prefix(&session)) {
                (Method::POST, None) if path == "/session" => {
                    reply(json!({ "sessionId": SESSION, "capabilities": {} }))
                }
                (Method::POST, Some("/timeouts")) => reply(Value::Null),
                (Method::POST, Some("/url")) => {
                    let page = body["url"].as_str().unwrap_or_default();
                    *self.event_url.lock() = Some(format!("{}event", page));
                    self.post(RuntimeEvent::Ready {
                        protocol: PROTOCOL_VERSION,
                        engine: Some("fake-browser".into()),
                    })
                    .await;
                    reply(Value::Null)
                }
                (Method::POST, Some("/execute/sync")) => self.execute(&body).await,
                (Method::DELETE, Some("")) => {
                    self.deleted.notify_one();
                    reply(Value::Null)
                }
                _ => fail(StatusCode::NOT_FOUND, "unknown command"),
            }
        }

        async fn execute(&self, body: &Value) -> Response<Full<Bytes>> {
            let frame = body["args"][0].as_str().unwrap_or_default();
            let Ok(request) = serde_json::from_str::<Request>(frame) else {
                return fail(StatusCode::BAD_REQUEST, "javascript error");
            };

            let seq = request.seq();
            match request {
                Request::Eval { code, .. } if code == "vanish" => {
                    return fail(StatusCode::NOT_FOUND, "no such window");
                }
                Request::Eval { code, .. } if code == "hang" => {
                    self.print(seq, "started").await;
                    self.deleted.notified().await;
                    return fail(StatusCode::NOT_FOUND, "invalid session id");
                }
                Request::Eval { code, .. } => {
                    self.print(seq, &code).await;
                    self.post(RuntimeEvent::Completion {
                        seq,
                        kind: CompletionKind::Normal,
                        error: None,
                    })
                    .await;
                }
                Request::GetGlobal { .. } => {
                    self.post(RuntimeEvent::Result {
                        seq,
                        value: Some(json!(42)),
                    })
                    .await;
                }
                _ => self.post(RuntimeEvent::Result { seq, value: None }).await,
            }
            reply(json!(true))
        }

        async fn print(&self, seq: u64, text: &str) {
            self.post(RuntimeEvent::Print {
                seq: Some(seq),
                text: text.into(),
            })
            .await;
        }

        /// What the page's synchronous XHR would send
        async fn post(&self, event: RuntimeEvent) {
            let Some(url) = self.event_url.lock().clone() else {
                return;
            };
            let _ = reqwest::Client::new().post(url).json(&event).send().await;
        }
    }

    fn reply(value: Value) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(
            json!({ "value": value }).to_string(),
        )));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    fn fail(status: StatusCode, error: &str) -> Response<Full<Bytes>> {
        let mut response = reply(json!({ "error": error, "message": "fake driver" }));
        *response.status_mut() = status;
        response
    }

    fn launch<'a>(server: &'a str, caps: &'a Map<String, Value>) -> BrowserLaunch<'a> {
        BrowserLaunch {
            product: BrowserProduct::Chrome,
            webdriver_server: server,
            host_path: None,
            capabilities: caps,
            web_host: None,
        }
    }

    async fn next(events: &EventQueue) -> Option<RuntimeEvent> {
        tokio::time::timeout(Duration::from_secs(5), events.pop())
            .await
            .expect("event within timeout")
    }

    #[tokio::test]
    async fn test_rejects_process_payload() {
        let caps = Map::new();
        let result = BrowserSupervisor::start(
            launch("http://127.0.0.1:1", &caps),
            Bootstrap::new(HostFamily::Node, None).unwrap(),
            &SupervisorConfig::default(),
            Arc::new(EventQueue::new()),
        )
        .await;
        assert!(matches!(result, Err(HarnessError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_unreachable_driver_fails_start() {
        // port 1 on loopback refuses connections
        let caps = Map::new();
        let result = BrowserSupervisor::start(
            launch("http://127.0.0.1:1", &caps),
            Bootstrap::new(HostFamily::Browser, None).unwrap(),
            &SupervisorConfig::default(),
            Arc::new(EventQueue::new()),
        )
        .await;
        assert!(matches!(result, Err(HarnessError::WebDriver(_))));
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let driver = FakeDriver::start().await;
        let events = Arc::new(EventQueue::new());
        let caps = Map::new();

        let supervisor = BrowserSupervisor::start(
            launch(&driver.url, &caps),
            Bootstrap::new(HostFamily::Browser, None).unwrap(),
            &SupervisorConfig::default(),
            Arc::clone(&events),
        )
        .await
        .unwrap();

        assert!(matches!(
            next(&events).await,
            Some(RuntimeEvent::Ready { .. })
        ));

        supervisor
            .deliver(&Request::Eval {
                seq: 1,
                realm: crate::realm::RealmId::ROOT,
                code: "print('hi')".into(),
                is_async: false,
            })
            .await
            .unwrap();
        assert_eq!(
            next(&events).await,
            Some(RuntimeEvent::Print {
                seq: Some(1),
                text: "print('hi')".into()
            })
        );
        assert!(matches!(
            next(&events).await,
            Some(RuntimeEvent::Completion { seq: 1, .. })
        ));

        supervisor.terminate().await.unwrap();
        supervisor.terminate().await.unwrap();

        let commands = driver.commands();
        assert_eq!(commands[0], "POST /session");
        assert!(commands.contains(&format!("POST /session/{}/timeouts", SESSION)));
        assert!(commands.contains(&format!("POST /session/{}/url", SESSION)));
        assert_eq!(
            commands
                .iter()
                .filter(|c| *c == &format!("DELETE /session/{}", SESSION))
                .count(),
            1
        );
        assert!(matches!(
            supervisor.deliver(&Request::DestroyRealm {
                seq: 2,
                realm: crate::realm::RealmId::ROOT
            })
            .await,
            Err(HarnessError::BackendCrashedError(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_injection_disconnects() {
        let driver = FakeDriver::start().await;
        let events = Arc::new(EventQueue::new());
        let caps = Map::new();

        let supervisor = BrowserSupervisor::start(
            launch(&driver.url, &caps),
            Bootstrap::new(HostFamily::Browser, None).unwrap(),
            &SupervisorConfig::default(),
            Arc::clone(&events),
        )
        .await
        .unwrap();
        next(&events).await;

        supervisor
            .deliver(&Request::Eval {
                seq: 1,
                realm: crate::realm::RealmId::ROOT,
                code: "vanish".into(),
                is_async: false,
            })
            .await
            .unwrap();

        match next(&events).await {
            Some(RuntimeEvent::Disconnected { reason }) => {
                assert!(reason.contains("no such window"), "{}", reason)
            }
            other => panic!("unexpected event {:?}", other),
        }
        supervisor.terminate().await.unwrap();
    }
}
