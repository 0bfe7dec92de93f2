// packages/runify/src/agent/backend.rs
//! Closed set of backend supervisors behind one launcher contract

use crate::agent::options::{AgentOptions, BackendFamily, BackendKind};
use crate::bootstrap::{Bootstrap, HostFamily, DEFAULT_SHORT_NAME};
use crate::protocol::Request;
use crate::runtime::{BrowserLaunch, BrowserSupervisor, ProcessSupervisor, QuickJsHost};
use crate::transport::EventQueue;
use crate::utils::errors::{HarnessError, Result};
use std::sync::Arc;

pub(crate) enum Backend {
    Process(ProcessSupervisor),
    Browser(BrowserSupervisor),
    InProcess(QuickJsHost),
}

impl Backend {
    /// Start the supervisor for `kind`; runtime events go to `events`
    pub(crate) async fn start(
        kind: BackendKind,
        options: &AgentOptions,
        events: Arc<EventQueue>,
    ) -> Result<Self> {
        let short_name = options.short_name.as_deref();

        match kind.family() {
            BackendFamily::Process(process_type) => {
                let bootstrap = Bootstrap::new(process_type.family(), short_name)?;
                let supervisor = ProcessSupervisor::start(
                    process_type,
                    options.host_path.as_deref(),
                    &bootstrap,
                    &options.supervisor,
                    events,
                )
                .await?;
                Ok(Backend::Process(supervisor))
            }

            BackendFamily::Browser(product) => {
                let product = match product {
                    Some(product) => product,
                    None => options.remote_product()?,
                };
                let webdriver_server = options.webdriver_server.as_deref().ok_or_else(|| {
                    HarnessError::ConfigurationError(format!(
                        "webdriverServer is required for {}",
                        kind
                    ))
                })?;

                let launch = BrowserLaunch {
                    product,
                    webdriver_server,
                    host_path: options.host_path.as_deref(),
                    capabilities: &options.capabilities,
                    web_host: options.web_host.as_deref(),
                };
                let bootstrap = Bootstrap::new(HostFamily::Browser, short_name)?;
                let supervisor =
                    BrowserSupervisor::start(launch, bootstrap, &options.supervisor, events)
                        .await?;
                Ok(Backend::Browser(supervisor))
            }

            BackendFamily::InProcess => {
                let host = QuickJsHost::start(
                    short_name.unwrap_or(DEFAULT_SHORT_NAME),
                    events,
                    options.supervisor.kill_timeout(),
                )?;
                Ok(Backend::InProcess(host))
            }
        }
    }

    pub(crate) async fn deliver(&self, request: &Request) -> Result<()> {
        match self {
            Backend::Process(supervisor) => supervisor.deliver(request).await,
            Backend::Browser(supervisor) => supervisor.deliver(request).await,
            Backend::InProcess(host) => host.deliver(request),
        }
    }

    /// Forced termination of whatever is running
    pub(crate) async fn terminate(&self) -> Result<()> {
        match self {
            Backend::Process(supervisor) => supervisor.terminate().await,
            Backend::Browser(supervisor) => supervisor.terminate().await,
            Backend::InProcess(host) => host.terminate().await,
        }
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        match self {
            Backend::Process(supervisor) => supervisor.shutdown().await,
            Backend::Browser(supervisor) => supervisor.shutdown().await,
            Backend::InProcess(host) => host.shutdown().await,
        }
    }

    /// Extra context for crash reports
    pub(crate) fn crash_detail(&self) -> Option<String> {
        match self {
            Backend::Process(supervisor) => {
                Some(supervisor.stderr_tail()).filter(|tail| !tail.is_empty())
            }
            Backend::Browser(_) | Backend::InProcess(_) => None,
        }
    }
}
