// packages/runify/src/agent/mod.rs
//! Agent: the caller-facing façade over one engine session
//!
//! An [`Agent`] owns one backend supervisor and one realm tree. Every
//! operation is a single request/reply exchange with the Injected Runtime:
//!
//! ```text
//!  Starting ──ready──▶ Ready ◀──▶ Evaluating
//!                        │            │
//!                        │  stop() / crash
//!                        ▼            ▼
//!                     Destroyed ◀── Stopped
//! ```
//!
//! Output is tagged with the sequence number of the request that produced
//! it, so late output from an earlier evaluation never leaks into a later
//! one. `stop()` is the only cancellation primitive: it resolves the
//! in-flight evaluation with an interrupted completion and leaves the
//! agent Stopped.

mod backend;
pub mod options;

pub use options::{AgentOptions, BackendFamily, BackendKind, EvalOptions};

use crate::completion::{Completion, CompletionKind, ErrorDescriptor};
use crate::observability::{
    BACKEND_CRASHES_TOTAL, EVALUATIONS_TOTAL, EVAL_DURATION_SECONDS, STOPS_TOTAL,
};
use crate::protocol::{Request, RuntimeEvent};
use crate::realm::{RealmId, RealmOptions, RealmTree, Teardown};
use crate::transport::EventQueue;
use crate::utils::errors::{HarnessError, Result};
use backend::Backend;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgentState {
    Starting,
    Ready,
    Evaluating,
    Stopped,
    Destroyed,
}

/// Outcome of one request/reply exchange
enum Reply {
    Completion(Completion),
    Value(Option<Value>),
    Failure(String),
    Interrupted,
}

#[derive(Default)]
struct OutputBuffer {
    text: String,

    /// Set by stop/destroy; later output is dropped
    frozen: bool,
}

/// A live session with one engine
pub struct Agent {
    kind: BackendKind,
    backend: Backend,
    events: Arc<EventQueue>,
    state: Mutex<AgentState>,
    in_flight: AtomicBool,
    next_seq: AtomicU64,
    output: Mutex<OutputBuffer>,
    cancel: CancellationToken,
    realms: Mutex<RealmTree>,
    engine: Option<String>,
}

impl Agent {
    /// Start a backend and wait for its runtime handshake
    pub async fn create(kind: BackendKind, options: AgentOptions) -> Result<Agent> {
        options.validate(kind)?;
        info!("Creating {} agent", kind);

        let events = Arc::new(EventQueue::new());
        let backend = Backend::start(kind, &options, Arc::clone(&events)).await?;
        let agent = Self::from_backend(
            kind,
            backend,
            events,
            options.supervisor.startup_timeout(),
        )
        .await?;

        for (name, value) in options.globals {
            agent.set_global(RealmId::ROOT, &name, value).await?;
        }

        Ok(agent)
    }

    pub(crate) async fn from_backend(
        kind: BackendKind,
        backend: Backend,
        events: Arc<EventQueue>,
        startup_timeout: Duration,
    ) -> Result<Agent> {
        let engine = match handshake(&events, startup_timeout).await {
            Ok(engine) => engine,
            Err(e) => {
                if let Err(kill) = backend.terminate().await {
                    warn!("Cleanup after failed start: {}", kill);
                }
                return Err(match (e, backend.crash_detail()) {
                    (HarnessError::BackendCrashedError(reason), Some(detail)) => {
                        HarnessError::BackendCrashedError(format!("{}\n{}", reason, detail))
                    }
                    (e, _) => e,
                });
            }
        };

        info!(
            "{} agent ready ({})",
            kind,
            engine.as_deref().unwrap_or("unknown engine")
        );

        Ok(Self {
            kind,
            backend,
            events,
            state: Mutex::new(AgentState::Ready),
            in_flight: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            output: Mutex::new(OutputBuffer::default()),
            cancel: CancellationToken::new(),
            realms: Mutex::new(RealmTree::new()),
            engine,
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    /// Engine description reported in the handshake
    pub fn engine(&self) -> Option<&str> {
        self.engine.as_deref()
    }

    /// Handle on the root realm
    pub fn root(&self) -> Realm<'_> {
        Realm {
            agent: self,
            id: RealmId::ROOT,
        }
    }

    /// Handle on any realm this agent created
    pub fn realm(&self, id: RealmId) -> Result<Realm<'_>> {
        self.realms.lock().ensure_live(id)?;
        Ok(Realm { agent: self, id })
    }

    pub fn live_realms(&self) -> usize {
        self.realms.lock().live_count()
    }

    /// Evaluate `code` in the root realm
    pub async fn eval_script(&self, code: &str, options: EvalOptions) -> Result<Completion> {
        self.eval_in(RealmId::ROOT, code, options).await
    }

    /// Evaluate `code` in the global scope of `realm`
    pub async fn eval_in(
        &self,
        realm: RealmId,
        code: &str,
        options: EvalOptions,
    ) -> Result<Completion> {
        let _guard = self.begin(true)?;
        self.realms.lock().ensure_live(realm)?;

        let seq = self.seq();
        let started = Instant::now();
        let reply = self
            .exchange(Request::Eval {
                seq,
                realm,
                code: code.to_string(),
                is_async: options.is_async,
            })
            .await?;

        metrics::counter!(EVALUATIONS_TOTAL, "backend" => self.kind.as_str())
            .increment(1);
        metrics::histogram!(EVAL_DURATION_SECONDS, "backend" => self.kind.as_str())
            .record(started.elapsed().as_secs_f64());

        match reply {
            Reply::Completion(completion) => Ok(completion),
            Reply::Interrupted => Ok(Completion::interrupted(self.output.lock().text.clone())),
            Reply::Failure(message) => Err(HarnessError::RuntimeError(message)),
            Reply::Value(_) => Err(HarnessError::Protocol(format!(
                "eval #{} answered with a result",
                seq
            ))),
        }
    }

    /// Create a child of `parent`; `options.globals` exist before any user code
    pub async fn create_realm(&self, parent: RealmId, options: RealmOptions) -> Result<RealmId> {
        let _guard = self.begin(false)?;
        let id = self.realms.lock().next_child_id(parent)?;
        let RealmOptions { globals, destroy } = options;

        let seq = self.seq();
        match self
            .exchange(Request::CreateRealm {
                seq,
                realm: id,
                parent,
                globals,
            })
            .await?
        {
            Reply::Value(_) => {
                self.realms.lock().insert_child(parent, id, destroy)?;
                Ok(id)
            }
            Reply::Failure(message) => Err(HarnessError::RealmCreationError(message)),
            other => Err(self.unexpected(seq, other)),
        }
    }

    /// Read a global binding as JSON
    pub async fn get_global(&self, realm: RealmId, name: &str) -> Result<Value> {
        let _guard = self.begin(false)?;
        self.realms.lock().ensure_live(realm)?;

        let seq = self.seq();
        match self
            .exchange(Request::GetGlobal {
                seq,
                realm,
                name: name.to_string(),
            })
            .await?
        {
            Reply::Value(value) => Ok(value.unwrap_or(Value::Null)),
            Reply::Failure(message) => Err(HarnessError::RuntimeError(message)),
            other => Err(self.unexpected(seq, other)),
        }
    }

    pub async fn set_global(&self, realm: RealmId, name: &str, value: Value) -> Result<()> {
        let _guard = self.begin(false)?;
        self.realms.lock().ensure_live(realm)?;

        let seq = self.seq();
        match self
            .exchange(Request::SetGlobal {
                seq,
                realm,
                name: name.to_string(),
                value,
            })
            .await?
        {
            Reply::Value(_) => Ok(()),
            Reply::Failure(message) => Err(HarnessError::RuntimeError(message)),
            other => Err(self.unexpected(seq, other)),
        }
    }

    /// Destroy a realm and its descendants; destroying the root destroys the agent
    pub async fn destroy_realm(&self, realm: RealmId) -> Result<()> {
        if realm.is_root() {
            return self.destroy().await;
        }

        match self.realms.lock().ensure_live(realm) {
            Ok(()) => {}
            Err(HarnessError::RealmDestroyedError(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        let _guard = self.begin(false)?;
        let seq = self.seq();
        match self.exchange(Request::DestroyRealm { seq, realm }).await? {
            Reply::Value(_) => {
                self.realm_destroyed(realm);
                Ok(())
            }
            Reply::Failure(message) => Err(HarnessError::RuntimeError(message)),
            other => Err(self.unexpected(seq, other)),
        }
    }

    /// Forcibly end the in-flight evaluation and return its partial stdout
    pub async fn stop(&self) -> Result<String> {
        {
            let mut state = self.state.lock();
            match *state {
                AgentState::Destroyed => {
                    return Err(HarnessError::AgentUnavailable(AgentState::Destroyed))
                }
                AgentState::Stopped => return Ok(self.output.lock().text.clone()),
                _ => *state = AgentState::Stopped,
            }
        }

        let partial = {
            let mut output = self.output.lock();
            output.frozen = true;
            if self.in_flight.load(Ordering::Acquire) {
                output.text.clone()
            } else {
                output.text.clear();
                String::new()
            }
        };
        self.cancel.cancel();

        metrics::counter!(STOPS_TOTAL, "backend" => self.kind.as_str()).increment(1);
        info!("Stopping {} agent", self.kind);

        self.backend.terminate().await?;
        Ok(partial)
    }

    /// Release the backend and tear down every realm; idempotent
    pub async fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == AgentState::Destroyed {
                return Ok(());
            }
            *state = AgentState::Destroyed;
        }

        self.output.lock().frozen = true;
        self.cancel.cancel();

        let shutdown = self.backend.shutdown().await;
        self.events.close();

        // the guard is gone before callbacks run; they may call back in
        let teardown = self.realms.lock().destroy(RealmId::ROOT);
        let torn_down = teardown.map(Teardown::run);
        info!("Destroyed {} agent", self.kind);

        shutdown?;
        torn_down.map(|_| ())
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Claim the single operation slot
    fn begin(&self, evaluating: bool) -> Result<OpGuard<'_>> {
        let mut state = self.state.lock();
        match *state {
            AgentState::Ready | AgentState::Evaluating => {}
            other => return Err(HarnessError::AgentUnavailable(other)),
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HarnessError::AgentBusyError);
        }

        if evaluating {
            *state = AgentState::Evaluating;
        }
        Ok(OpGuard { agent: self })
    }

    /// Send one request and wait for its reply, stop, or a crash
    async fn exchange(&self, request: Request) -> Result<Reply> {
        let seq = request.seq();
        let async_eval = matches!(request, Request::Eval { is_async: true, .. });

        self.drain_stale()?;
        self.output.lock().text.clear();

        debug!("→ {} #{}", request.op(), seq);
        if let Err(e) = self.backend.deliver(&request).await {
            if self.cancel.is_cancelled() {
                return Ok(Reply::Interrupted);
            }
            return Err(self.crashed(e.to_string()));
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Reply::Interrupted),
                event = self.events.pop() => event,
            };

            let outcome = match event {
                Some(event) => self.apply(event, seq, async_eval),
                None => Err("runtime event stream ended".to_string()),
            };

            match outcome {
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => {}
                Err(_) if self.cancel.is_cancelled() => return Ok(Reply::Interrupted),
                Err(reason) => return Err(self.crashed(reason)),
            }
        }
    }

    /// Fold one event into the current operation; `Err` carries a disconnect reason
    fn apply(
        &self,
        event: RuntimeEvent,
        seq: u64,
        async_eval: bool,
    ) -> std::result::Result<Option<Reply>, String> {
        match event {
            RuntimeEvent::Print { seq: tag, text } => {
                if tag.map_or(true, |t| t == seq) {
                    let mut output = self.output.lock();
                    if !output.frozen {
                        output.text.push_str(&text);
                        output.text.push('\n');
                    }
                } else {
                    debug!("Dropping print from #{:?} during #{}", tag, seq);
                }
                Ok(None)
            }

            RuntimeEvent::Completion {
                seq: tag,
                kind,
                error,
            } if tag == seq => {
                let stdout = self.output.lock().text.clone();
                let completion = match kind {
                    CompletionKind::Throw => Completion::throw(
                        stdout,
                        ErrorDescriptor::from_raw(error.unwrap_or_default()),
                    ),
                    CompletionKind::Normal => Completion::normal(stdout),
                };
                Ok(Some(Reply::Completion(completion)))
            }

            RuntimeEvent::Result { seq: tag, value } if tag == seq => {
                Ok(Some(Reply::Value(value)))
            }

            RuntimeEvent::Failure { seq: tag, message } if tag == seq => {
                Ok(Some(Reply::Failure(message)))
            }

            RuntimeEvent::RealmDestroyed { realm } => {
                self.realm_destroyed(realm);
                Ok(None)
            }

            RuntimeEvent::Destroy {} if async_eval => {
                let stdout = self.output.lock().text.clone();
                Ok(Some(Reply::Completion(Completion::normal(stdout))))
            }

            RuntimeEvent::Disconnected { reason } => Err(reason),

            other => {
                debug!("Ignoring {:?} during #{}", other, seq);
                Ok(None)
            }
        }
    }

    /// Consume events that arrived between operations
    fn drain_stale(&self) -> Result<()> {
        while let Some(event) = self.events.try_pop() {
            match event {
                RuntimeEvent::RealmDestroyed { realm } => self.realm_destroyed(realm),
                RuntimeEvent::Disconnected { reason } => return Err(self.crashed(reason)),
                other => debug!("Dropping stale {:?}", other),
            }
        }
        Ok(())
    }

    /// Mirror an engine-side realm teardown into the host tree
    fn realm_destroyed(&self, realm: RealmId) {
        let teardown = self.realms.lock().destroy(realm);
        match teardown.map(Teardown::run) {
            Ok(order) if !order.is_empty() => debug!("Realms {:?} torn down", order),
            Ok(_) => {}
            Err(e) => warn!("Runtime reported teardown of {}: {}", realm, e),
        }
    }

    fn crashed(&self, reason: String) -> HarnessError {
        {
            let mut state = self.state.lock();
            if *state != AgentState::Destroyed {
                *state = AgentState::Stopped;
            }
        }

        metrics::counter!(BACKEND_CRASHES_TOTAL, "backend" => self.kind.as_str())
            .increment(1);
        warn!("{} backend crashed: {}", self.kind, reason);

        match self.backend.crash_detail() {
            Some(detail) => HarnessError::BackendCrashedError(format!("{}\n{}", reason, detail)),
            None => HarnessError::BackendCrashedError(reason),
        }
    }

    fn unexpected(&self, seq: u64, reply: Reply) -> HarnessError {
        match reply {
            Reply::Interrupted => HarnessError::AgentUnavailable(self.state()),
            _ => HarnessError::Protocol(format!("unexpected reply to #{}", seq)),
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if *self.state.get_mut() != AgentState::Destroyed {
            debug!("{} agent dropped without destroy()", self.kind);
            self.cancel.cancel();
        }
    }
}

/// Releases the operation slot when an operation ends, however it ends
struct OpGuard<'a> {
    agent: &'a Agent,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.agent.state.lock();
        if *state == AgentState::Evaluating {
            *state = AgentState::Ready;
        }
        self.agent.in_flight.store(false, Ordering::Release);
    }
}

/// Wait for the runtime's `ready` event
async fn handshake(events: &EventQueue, timeout: Duration) -> Result<Option<String>> {
    tokio::time::timeout(timeout, await_ready(events))
        .await
        .map_err(|_| HarnessError::StartupTimeout(timeout.as_millis() as u64))?
}

async fn await_ready(events: &EventQueue) -> Result<Option<String>> {
    loop {
        match events.pop().await {
            Some(event @ RuntimeEvent::Ready { .. }) => {
                event.check_ready()?;
                if let RuntimeEvent::Ready { engine, .. } = event {
                    return Ok(engine);
                }
            }
            Some(RuntimeEvent::Disconnected { reason }) => {
                return Err(HarnessError::BackendCrashedError(reason))
            }
            Some(other) => debug!("Ignoring {:?} before handshake", other),
            None => {
                return Err(HarnessError::BackendCrashedError(
                    "runtime exited before the handshake".into(),
                ))
            }
        }
    }
}

/// Borrowed handle on one realm of an agent
#[derive(Clone, Copy)]
pub struct Realm<'a> {
    agent: &'a Agent,
    id: RealmId,
}

impl<'a> Realm<'a> {
    pub fn id(&self) -> RealmId {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.agent.realms.lock().is_live(self.id)
    }

    pub async fn eval_script(&self, code: &str, options: EvalOptions) -> Result<Completion> {
        self.agent.eval_in(self.id, code, options).await
    }

    pub async fn create_realm(&self, options: RealmOptions) -> Result<Realm<'a>> {
        let id = self.agent.create_realm(self.id, options).await?;
        Ok(Realm {
            agent: self.agent,
            id,
        })
    }

    pub async fn get_global(&self, name: &str) -> Result<Value> {
        self.agent.get_global(self.id, name).await
    }

    pub async fn set_global(&self, name: &str, value: Value) -> Result<()> {
        self.agent.set_global(self.id, name, value).await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.agent.destroy_realm(self.id).await
    }
}
