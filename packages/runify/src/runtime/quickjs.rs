// packages/runify/src/runtime/quickjs.rs
//! In-process backend on an embedded QuickJS engine
//!
//! The engine lives on a dedicated OS thread. It receives protocol
//! requests over a crossbeam channel and pushes the same runtime events a
//! bootstrap would, so the agent cannot tell it apart from an external
//! runtime.
//!
//! Every realm owns a `Runtime` and `Context` of its own. A running script
//! holds its runtime's lock, so this is what lets script code create,
//! evaluate in and destroy other realms. Values crossing between realms are
//! copied as JSON, the same way host globals are.

use crate::bootstrap::validate_short_name;
use crate::completion::{CompletionKind, RawError};
use crate::protocol::{Request, RuntimeEvent, PROTOCOL_VERSION};
use crate::realm::RealmId;
use crate::transport::EventQueue;
use crate::utils::errors::{HarnessError, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rquickjs::function::Rest;
use rquickjs::{
    Coerced, Context, Ctx, Exception, FromJs, Function, IntoJs, Object, Persistent, Runtime, Value,
};
use serde_json::Map;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

const PRELUDE: &str = include_str!("quickjs_prelude.js");

/// Deepest nesting converted when reading a global back to JSON
const MAX_JSON_DEPTH: usize = 64;

enum EngineCommand {
    Request(Request),
    Shutdown,
}

/// Host handle for the engine thread
pub struct QuickJsHost {
    commands: Sender<EngineCommand>,
    interrupt: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    kill_timeout: Duration,
}

impl QuickJsHost {
    /// Spawn the engine thread; it announces itself with a `ready` event
    pub fn start(short_name: &str, events: Arc<EventQueue>, kill_timeout: Duration) -> Result<Self> {
        validate_short_name(short_name)?;

        let (commands, receiver) = crossbeam_channel::unbounded();
        let interrupt = Arc::new(AtomicBool::new(false));

        let thread = {
            let interrupt = Arc::clone(&interrupt);
            let short_name = short_name.to_string();
            std::thread::Builder::new()
                .name("runify-quickjs".into())
                .spawn(move || run_engine(receiver, events, interrupt, short_name))?
        };

        info!("Started embedded QuickJS engine");
        Ok(Self {
            commands,
            interrupt,
            thread: Mutex::new(Some(thread)),
            kill_timeout,
        })
    }

    pub fn deliver(&self, request: &Request) -> Result<()> {
        self.commands
            .send(EngineCommand::Request(request.clone()))
            .map_err(|_| HarnessError::BackendCrashedError("engine thread has exited".into()))
    }

    /// Interrupt running script and stop the engine thread
    pub async fn terminate(&self) -> Result<()> {
        self.interrupt.store(true, Ordering::Release);
        let _ = self.commands.send(EngineCommand::Shutdown);
        self.join().await
    }

    /// Stop the engine thread after the current request
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.commands.send(EngineCommand::Shutdown);
        self.join().await
    }

    async fn join(&self) -> Result<()> {
        let Some(thread) = self.thread.lock().take() else {
            return Ok(());
        };

        let joined = tokio::time::timeout(
            self.kill_timeout,
            tokio::task::spawn_blocking(move || thread.join()),
        )
        .await;

        match joined {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(_))) => Err(HarnessError::BackendCrashedError(
                "engine thread panicked".into(),
            )),
            Ok(Err(e)) => Err(HarnessError::RuntimeError(format!(
                "engine join task failed: {}",
                e
            ))),
            Err(_) => Err(HarnessError::RuntimeError(format!(
                "engine thread did not stop within {:?}",
                self.kill_timeout
            ))),
        }
    }
}

impl Drop for QuickJsHost {
    fn drop(&mut self) {
        self.interrupt.store(true, Ordering::Release);
        let _ = self.commands.send(EngineCommand::Shutdown);
    }
}

/// Closes the event stream however the engine thread ends, panics included
struct CloseOnExit(Arc<EventQueue>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        let _ = self.0.push(RuntimeEvent::Disconnected {
            reason: "embedded engine stopped".into(),
        });
        self.0.close();
    }
}

fn run_engine(
    commands: Receiver<EngineCommand>,
    events: Arc<EventQueue>,
    interrupt: Arc<AtomicBool>,
    short_name: String,
) {
    let _close = CloseOnExit(Arc::clone(&events));

    let engine = match Engine::new(Arc::clone(&events), Arc::clone(&interrupt), short_name) {
        Ok(engine) => engine,
        Err(e) => {
            error!("QuickJS engine failed to start: {}", e);
            let _ = events.push(RuntimeEvent::Disconnected {
                reason: e.to_string(),
            });
            return;
        }
    };

    let _ = events.push(RuntimeEvent::Ready {
        protocol: PROTOCOL_VERSION,
        engine: Some("quickjs".into()),
    });

    while let Ok(command) = commands.recv() {
        match command {
            EngineCommand::Shutdown => break,
            EngineCommand::Request(request) => engine.handle(request),
        }
        if interrupt.load(Ordering::Acquire) {
            debug!("QuickJS engine interrupted");
            break;
        }
    }
}

/// First id handed to realms created by script code, clear of host ids
const SCRIPT_REALM_BASE: u64 = 1 << 40;

struct EngineRealm {
    id: RealmId,
    parent: Option<RealmId>,

    /// Realm whose script holds the handle; `None` for host-created realms
    owner: Option<RealmId>,

    // persistent values drop before the context, the context before its runtime
    child_destroyed: Persistent<Function<'static>>,
    context: Context,
    runtime: Runtime,
}

/// Engine state, also reached from the native functions of every realm
struct EngineShared {
    realms: RefCell<HashMap<RealmId, Rc<EngineRealm>>>,

    /// Realms whose runtime is locked by the current call stack
    entered: RefCell<Vec<RealmId>>,
    next_script_id: Cell<u64>,

    events: Arc<EventQueue>,
    current_seq: Arc<AtomicU64>,

    /// Realms whose `$.destroy()` ran during the current request
    destroy_requests: RefCell<Vec<RealmId>>,
    short_name: String,
    interrupt: Arc<AtomicBool>,
}

struct Engine {
    shared: Rc<EngineShared>,
}

impl Engine {
    fn new(events: Arc<EventQueue>, interrupt: Arc<AtomicBool>, short_name: String) -> Result<Self> {
        let shared = Rc::new(EngineShared {
            realms: RefCell::new(HashMap::new()),
            entered: RefCell::new(Vec::new()),
            next_script_id: Cell::new(SCRIPT_REALM_BASE),
            events,
            current_seq: Arc::new(AtomicU64::new(0)),
            destroy_requests: RefCell::new(Vec::new()),
            short_name,
            interrupt,
        });
        shared.add_realm(RealmId::ROOT, None, None, &Map::new())?;
        Ok(Self { shared })
    }

    fn handle(&self, request: Request) {
        self.shared.handle(request);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // natives only hold weak references, so the realms go here
        let realms = std::mem::take(&mut *self.shared.realms.borrow_mut());
        drop(realms);
    }
}

impl EngineShared {
    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.push(event);
    }

    fn realm(&self, id: RealmId) -> Option<Rc<EngineRealm>> {
        self.realms.borrow().get(&id).cloned()
    }

    fn is_entered(&self, id: RealmId) -> bool {
        self.entered.borrow().contains(&id)
    }

    fn next_script_id(&self) -> RealmId {
        let id = self.next_script_id.get();
        self.next_script_id.set(id + 1);
        RealmId::from_raw(id)
    }

    /// Run `f` inside a realm's context, tracking the lock it takes
    fn enter<R>(&self, realm: &EngineRealm, f: impl for<'js> FnOnce(Ctx<'js>) -> R) -> R {
        self.entered.borrow_mut().push(realm.id);
        let out = realm.context.with(f);
        self.entered.borrow_mut().pop();
        out
    }

    /// Look up a realm a script handle points at
    fn reachable<'js>(&self, ctx: &Ctx<'js>, id: f64) -> rquickjs::Result<Rc<EngineRealm>> {
        let id = RealmId::from_raw(id as u64);
        if self.is_entered(id) {
            return Err(Exception::throw_message(
                ctx,
                &format!("realm {} is already running", id),
            ));
        }
        self.realm(id).ok_or_else(|| {
            Exception::throw_message(ctx, &format!("realm {} has been destroyed", id))
        })
    }

    fn handle(self: &Rc<Self>, request: Request) {
        let seq = request.seq();
        self.current_seq.store(seq, Ordering::Release);
        debug!("quickjs ← {} #{}", request.op(), seq);

        match request {
            Request::Eval {
                realm,
                code,
                is_async,
                ..
            } => self.eval(seq, realm, &code, is_async),

            Request::CreateRealm {
                realm,
                parent,
                globals,
                ..
            } => {
                let event = match self.add_realm(realm, Some(parent), None, &globals) {
                    Ok(()) => RuntimeEvent::Result { seq, value: None },
                    Err(e) => RuntimeEvent::Failure {
                        seq,
                        message: e.to_string(),
                    },
                };
                self.emit(event);
            }

            Request::GetGlobal { realm, name, .. } => {
                let event = match self.realm(realm) {
                    Some(entry) => match self.enter(&entry, |ctx| read_global(&ctx, &name)) {
                        Ok(value) => RuntimeEvent::Result {
                            seq,
                            value: Some(value),
                        },
                        Err(message) => RuntimeEvent::Failure { seq, message },
                    },
                    None => unknown_realm(seq, realm),
                };
                self.emit(event);
            }

            Request::SetGlobal {
                realm, name, value, ..
            } => {
                let event = match self.realm(realm) {
                    Some(entry) => {
                        match self.enter(&entry, |ctx| write_global(&ctx, &name, &value)) {
                            Ok(()) => RuntimeEvent::Result { seq, value: None },
                            Err(message) => RuntimeEvent::Failure { seq, message },
                        }
                    }
                    None => unknown_realm(seq, realm),
                };
                self.emit(event);
            }

            Request::DestroyRealm { realm, .. } => {
                let event = match self.destroy_realm(realm, None) {
                    Ok(()) => RuntimeEvent::Result { seq, value: None },
                    Err(message) => RuntimeEvent::Failure { seq, message },
                };
                self.emit(event);
            }
        }

        self.drain_jobs();

        let requested = std::mem::take(&mut *self.destroy_requests.borrow_mut());
        for realm in requested {
            if let Err(message) = self.destroy_realm(realm, None) {
                debug!("Deferred destroy of realm {} failed: {}", realm, message);
            }
        }
    }

    fn eval(&self, seq: u64, realm: RealmId, code: &str, is_async: bool) {
        let Some(entry) = self.realm(realm) else {
            self.emit(unknown_realm(seq, realm));
            return;
        };

        match self.enter(&entry, |ctx| run_script(&ctx, code)) {
            Some(error) => self.emit(RuntimeEvent::Completion {
                seq,
                kind: CompletionKind::Throw,
                error: Some(error),
            }),
            None if !is_async => self.emit(RuntimeEvent::Completion {
                seq,
                kind: CompletionKind::Normal,
                error: None,
            }),
            // finalized by the root realm's $.destroy()
            None => {}
        }
    }

    /// Run queued promise jobs in every realm until none are left
    fn drain_jobs(&self) {
        loop {
            let realms: Vec<Rc<EngineRealm>> = self.realms.borrow().values().cloned().collect();
            let mut progressed = false;

            for realm in realms {
                if self.realm(realm.id).is_none() {
                    continue;
                }
                self.entered.borrow_mut().push(realm.id);
                progressed |= run_jobs(&realm.runtime, &self.interrupt);
                self.entered.borrow_mut().pop();

                if self.interrupt.load(Ordering::Acquire) {
                    return;
                }
            }

            if !progressed {
                break;
            }
        }
    }

    fn add_realm(
        self: &Rc<Self>,
        id: RealmId,
        parent: Option<RealmId>,
        owner: Option<RealmId>,
        globals: &Map<String, serde_json::Value>,
    ) -> Result<()> {
        if let Some(parent) = parent {
            if !self.realms.borrow().contains_key(&parent) {
                return Err(HarnessError::UnknownRealm(parent));
            }
        }

        let runtime = Runtime::new().map_err(engine_error)?;
        let flag = Arc::clone(&self.interrupt);
        runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));

        let context = Context::full(&runtime)
            .map_err(|e| HarnessError::RealmCreationError(e.to_string()))?;

        let child_destroyed = context
            .with(|ctx| match install_realm(&ctx, id, self, globals) {
                Ok(callback) => Ok(Persistent::save(&ctx, callback)),
                Err(e) => Err(describe(&ctx, e)),
            })
            .map_err(HarnessError::RealmCreationError)?;

        self.realms.borrow_mut().insert(
            id,
            Rc::new(EngineRealm {
                id,
                parent,
                owner,
                child_destroyed,
                context,
                runtime,
            }),
        );
        Ok(())
    }

    /// Drop `id` and its descendants, children first
    ///
    /// Host-created realms are reported with `realmDestroyed`; realms made
    /// by script code run the destroy callback their owner registered.
    /// `caller` is the realm whose script asked for the teardown, if any.
    fn destroy_realm<'js>(
        &self,
        id: RealmId,
        caller: Option<(RealmId, &Ctx<'js>)>,
    ) -> std::result::Result<(), String> {
        if id.is_root() {
            return Ok(());
        }

        let order = self.post_order(id);
        if let Some(running) = order.iter().find(|realm| self.is_entered(**realm)) {
            return Err(format!("realm {} is running and cannot be destroyed", running));
        }

        for realm_id in order {
            let Some(realm) = self.realms.borrow_mut().remove(&realm_id) else {
                continue;
            };
            match realm.owner {
                Some(owner) => self.notify_owner(owner, realm_id, caller),
                None => self.emit(RuntimeEvent::RealmDestroyed { realm: realm_id }),
            }
            drop(realm);
        }
        Ok(())
    }

    fn notify_owner<'js>(
        &self,
        owner: RealmId,
        child: RealmId,
        caller: Option<(RealmId, &Ctx<'js>)>,
    ) {
        let Some(owner_realm) = self.realm(owner) else {
            return;
        };

        let outcome = match caller {
            Some((current, ctx)) if current == owner => {
                call_child_destroyed(ctx, &owner_realm, child)
            }
            _ if self.is_entered(owner) => {
                debug!("Owner of realm {} is busy, skipping its destroy callback", child);
                return;
            }
            _ => self.enter(&owner_realm, |ctx| {
                call_child_destroyed(&ctx, &owner_realm, child)
            }),
        };

        if let Err(message) = outcome {
            debug!("Destroy callback for realm {} threw: {}", child, message);
        }
    }

    fn post_order(&self, id: RealmId) -> Vec<RealmId> {
        let realms = self.realms.borrow();
        let mut order = Vec::new();
        collect_post_order(&realms, id, &mut order);
        order
    }
}

fn collect_post_order(
    realms: &HashMap<RealmId, Rc<EngineRealm>>,
    id: RealmId,
    order: &mut Vec<RealmId>,
) {
    if !realms.contains_key(&id) {
        return;
    }
    let mut children: Vec<RealmId> = realms
        .values()
        .filter(|realm| realm.parent == Some(id))
        .map(|realm| realm.id)
        .collect();
    children.sort();
    for child in children {
        collect_post_order(realms, child, order);
    }
    order.push(id);
}

fn run_jobs(runtime: &Runtime, interrupt: &AtomicBool) -> bool {
    let mut ran = false;
    loop {
        match runtime.execute_pending_job() {
            Ok(true) => ran = true,
            Ok(false) => break,
            Err(_) => {
                if interrupt.load(Ordering::Acquire) {
                    break;
                }
                debug!("QuickJS pending job threw");
                ran = true;
            }
        }
    }
    ran
}

fn run_script(ctx: &Ctx<'_>, code: &str) -> Option<RawError> {
    match ctx.eval::<(), _>(code) {
        Ok(()) => None,
        Err(rquickjs::Error::Exception) => Some(raw_error(ctx, ctx.catch())),
        Err(e) => Some(RawError {
            message: Some(e.to_string()),
            ..Default::default()
        }),
    }
}

fn read_global(ctx: &Ctx<'_>, name: &str) -> std::result::Result<serde_json::Value, String> {
    ctx.globals()
        .get::<_, Value>(name)
        .and_then(|value| js_to_json(&value, 0))
        .map_err(|e| describe(ctx, e))
}

fn write_global(
    ctx: &Ctx<'_>,
    name: &str,
    value: &serde_json::Value,
) -> std::result::Result<(), String> {
    json_to_js(ctx, value)
        .and_then(|value| ctx.globals().set(name, value))
        .map_err(|e| describe(ctx, e))
}

fn call_child_destroyed(
    ctx: &Ctx<'_>,
    owner: &EngineRealm,
    child: RealmId,
) -> std::result::Result<(), String> {
    owner
        .child_destroyed
        .clone()
        .restore(ctx)
        .and_then(|callback| callback.call::<_, ()>((child.as_u64() as f64,)))
        .map_err(|e| describe(ctx, e))
}

/// Error text, clearing the pending exception if there is one
fn describe(ctx: &Ctx<'_>, e: rquickjs::Error) -> String {
    match e {
        rquickjs::Error::Exception => {
            let raw = raw_error(ctx, ctx.catch());
            match (raw.name, raw.message) {
                (Some(name), Some(message)) => format!("{}: {}", name, message),
                (None, Some(message)) => message,
                (Some(name), None) => name,
                (None, None) => "uncaught exception".into(),
            }
        }
        other => other.to_string(),
    }
}

/// A thrown value from another realm, rebuilt as a plain error-like object
fn error_object<'js>(ctx: &Ctx<'js>, raw: RawError) -> rquickjs::Result<Object<'js>> {
    let object = Object::new(ctx.clone())?;
    object.set("name", raw.name.or(raw.constructor))?;
    object.set("message", raw.message)?;
    object.set("stack", raw.stack)?;
    Ok(object)
}

fn upgrade(ctx: &Ctx<'_>, shared: &Weak<EngineShared>) -> rquickjs::Result<Rc<EngineShared>> {
    shared
        .upgrade()
        .ok_or_else(|| Exception::throw_message(ctx, "embedded engine has shut down"))
}

/// Install `print`, the entry point and the caller's globals into a realm
///
/// Returns the realm's hook for running destroy callbacks of realms it
/// created through `createRealm`.
fn install_realm<'js>(
    ctx: &Ctx<'js>,
    id: RealmId,
    shared: &Rc<EngineShared>,
    globals: &Map<String, serde_json::Value>,
) -> rquickjs::Result<Function<'js>> {
    let global = ctx.globals();

    let print = {
        let events = Arc::clone(&shared.events);
        let seq = Arc::clone(&shared.current_seq);
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            let text = args
                .0
                .into_iter()
                .map(|arg| arg.0)
                .collect::<Vec<_>>()
                .join(" ");
            let _ = events.push(RuntimeEvent::Print {
                seq: Some(seq.load(Ordering::Acquire)),
                text,
            });
        })?
    };
    global.set("print", print)?;

    let host = Object::new(ctx.clone())?;
    let weak = Rc::downgrade(shared);

    host.set("destroySelf", {
        let weak = weak.clone();
        Function::new(ctx.clone(), move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if id.is_root() {
                shared.emit(RuntimeEvent::Destroy {});
            } else {
                shared.destroy_requests.borrow_mut().push(id);
            }
        })?
    })?;

    host.set("createRealm", {
        let weak = weak.clone();
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, parent: f64, globals: Value<'js>| -> rquickjs::Result<f64> {
                let shared = upgrade(&ctx, &weak)?;
                let globals = match js_to_json(&globals, 0)? {
                    serde_json::Value::Object(fields) => fields,
                    _ => Map::new(),
                };
                let child = shared.next_script_id();
                shared
                    .add_realm(child, Some(RealmId::from_raw(parent as u64)), Some(id), &globals)
                    .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))?;
                Ok(child.as_u64() as f64)
            },
        )?
    })?;

    host.set("evalIn", {
        let weak = weak.clone();
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, target: f64, code: String| -> rquickjs::Result<Object<'js>> {
                let shared = upgrade(&ctx, &weak)?;
                let realm = shared.reachable(&ctx, target)?;
                let thrown = shared.enter(&realm, |inner| run_script(&inner, &code));

                let completion = Object::new(ctx.clone())?;
                match thrown {
                    None => completion.set("type", "normal")?,
                    Some(raw) => {
                        completion.set("type", "throw")?;
                        completion.set("value", error_object(&ctx, raw)?)?;
                    }
                }
                Ok(completion)
            },
        )?
    })?;

    host.set("getGlobal", {
        let weak = weak.clone();
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, target: f64, name: String| -> rquickjs::Result<Value<'js>> {
                let shared = upgrade(&ctx, &weak)?;
                let realm = shared.reachable(&ctx, target)?;
                let value = shared
                    .enter(&realm, |inner| read_global(&inner, &name))
                    .map_err(|message| Exception::throw_message(&ctx, &message))?;
                json_to_js(&ctx, &value)
            },
        )?
    })?;

    host.set("setGlobal", {
        let weak = weak.clone();
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, target: f64, name: String, value: Value<'js>| -> rquickjs::Result<()> {
                let shared = upgrade(&ctx, &weak)?;
                let realm = shared.reachable(&ctx, target)?;
                let value = js_to_json(&value, 0)?;
                shared
                    .enter(&realm, |inner| write_global(&inner, &name, &value))
                    .map_err(|message| Exception::throw_message(&ctx, &message))
            },
        )?
    })?;

    host.set("destroyRealm", {
        let weak = weak.clone();
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, target: f64| -> rquickjs::Result<()> {
                let shared = upgrade(&ctx, &weak)?;
                shared
                    .destroy_realm(RealmId::from_raw(target as u64), Some((id, &ctx)))
                    .map_err(|message| Exception::throw_message(&ctx, &message))
            },
        )?
    })?;

    let install: Function = ctx.eval(PRELUDE)?;
    let child_destroyed: Function = install.call((
        global.clone(),
        shared.short_name.as_str(),
        id.as_u64() as f64,
        host,
    ))?;

    for (name, value) in globals {
        global.set(name.as_str(), json_to_js(ctx, value)?)?;
    }

    Ok(child_destroyed)
}

fn string_prop(object: &Object<'_>, key: &str) -> Option<String> {
    let value: Value = object.get(key).ok()?;
    value.as_string()?.to_string().ok()
}

/// Read name, constructor, message and stack off a caught value
fn raw_error<'js>(ctx: &Ctx<'js>, caught: Value<'js>) -> RawError {
    match caught.as_object() {
        Some(object) => RawError {
            name: string_prop(object, "name"),
            constructor: object
                .get::<_, Object>("constructor")
                .ok()
                .and_then(|c| string_prop(&c, "name")),
            message: string_prop(object, "message"),
            stack: string_prop(object, "stack"),
            line: None,
            column: None,
        },
        None => RawError {
            message: Coerced::<String>::from_js(ctx, caught.clone())
                .map(|c| c.0)
                .ok(),
            ..Default::default()
        },
    }
}

fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(i) => Ok(Value::new_int(ctx.clone(), i)),
            None => Ok(Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN))),
        },
        serde_json::Value::String(s) => s.as_str().into_js(ctx),
        serde_json::Value::Array(items) => {
            let array = rquickjs::Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(array.into_value())
        }
        serde_json::Value::Object(fields) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in fields {
                object.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            Ok(object.into_value())
        }
    }
}

/// Engine value to JSON; functions, symbols and over-deep values read as null
fn js_to_json(value: &Value<'_>, depth: usize) -> rquickjs::Result<serde_json::Value> {
    if depth > MAX_JSON_DEPTH
        || value.is_undefined()
        || value.is_null()
        || value.is_function()
        || value.is_symbol()
    {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(serde_json::json!(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(serde_json::json!(f));
    }
    if let Some(s) = value.as_string() {
        return Ok(serde_json::Value::String(s.to_string()?));
    }
    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for i in 0..array.len() {
            let item: Value = array.get(i)?;
            items.push(js_to_json(&item, depth + 1)?);
        }
        return Ok(serde_json::Value::Array(items));
    }
    if let Some(object) = value.as_object() {
        let mut fields = Map::new();
        for prop in object.props::<String, Value>() {
            let (key, item) = prop?;
            fields.insert(key, js_to_json(&item, depth + 1)?);
        }
        return Ok(serde_json::Value::Object(fields));
    }
    Ok(serde_json::Value::Null)
}

fn engine_error(e: rquickjs::Error) -> HarnessError {
    HarnessError::RuntimeError(format!("quickjs: {}", e))
}

fn unknown_realm(seq: u64, realm: RealmId) -> RuntimeEvent {
    RuntimeEvent::Failure {
        seq,
        message: format!("unknown realm {}", realm),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn start() -> (QuickJsHost, Arc<EventQueue>) {
        let events = Arc::new(EventQueue::new());
        let host = QuickJsHost::start("$", Arc::clone(&events), Duration::from_secs(5)).unwrap();
        (host, events)
    }

    async fn next(events: &EventQueue) -> Option<RuntimeEvent> {
        tokio::time::timeout(Duration::from_secs(5), events.pop())
            .await
            .expect("event within timeout")
    }

    fn eval(seq: u64, code: &str) -> Request {
        Request::Eval {
            seq,
            realm: RealmId::ROOT,
            code: code.into(),
            is_async: false,
        }
    }

    #[tokio::test]
    async fn test_ready_print_and_throw() {
        let (host, events) = start();
        assert!(matches!(
            next(&events).await,
            Some(RuntimeEvent::Ready { protocol: PROTOCOL_VERSION, .. })
        ));

        host.deliver(&eval(1, "print('a', 1); throw new TypeError('m');"))
            .unwrap();

        assert_eq!(
            next(&events).await,
            Some(RuntimeEvent::Print {
                seq: Some(1),
                text: "a 1".into()
            })
        );
        match next(&events).await {
            Some(RuntimeEvent::Completion {
                seq: 1,
                kind: CompletionKind::Throw,
                error: Some(error),
            }) => {
                assert_eq!(error.name.as_deref(), Some("TypeError"));
                assert_eq!(error.message.as_deref(), Some("m"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_thrown_primitive() {
        let (host, events) = start();
        next(&events).await;

        host.deliver(&eval(1, "throw 42;")).unwrap();
        match next(&events).await {
            Some(RuntimeEvent::Completion {
                error: Some(error), ..
            }) => {
                assert_eq!(error.name, None);
                assert_eq!(error.message.as_deref(), Some("42"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_globals_round_trip() {
        let (host, events) = start();
        next(&events).await;

        host.deliver(&Request::SetGlobal {
            seq: 1,
            realm: RealmId::ROOT,
            name: "cfg".into(),
            value: json!({"n": 1, "list": [true, "x"], "big": 1e20}),
        })
        .unwrap();
        assert!(matches!(
            next(&events).await,
            Some(RuntimeEvent::Result { seq: 1, .. })
        ));

        host.deliver(&Request::GetGlobal {
            seq: 2,
            realm: RealmId::ROOT,
            name: "cfg".into(),
        })
        .unwrap();
        match next(&events).await {
            Some(RuntimeEvent::Result {
                seq: 2,
                value: Some(value),
            }) => {
                assert_eq!(value["n"], 1);
                assert_eq!(value["list"][1], "x");
                assert_eq!(value["big"], 1e20);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_child_destroy_is_deferred_and_reported() {
        let (host, events) = start();
        next(&events).await;

        host.deliver(&Request::CreateRealm {
            seq: 1,
            realm: RealmId::from_raw(1),
            parent: RealmId::ROOT,
            globals: Map::new(),
        })
        .unwrap();
        next(&events).await;

        host.deliver(&Request::Eval {
            seq: 2,
            realm: RealmId::from_raw(1),
            code: "$.destroy(); print('still running');".into(),
            is_async: false,
        })
        .unwrap();

        assert!(matches!(
            next(&events).await,
            Some(RuntimeEvent::Print { .. })
        ));
        assert!(matches!(
            next(&events).await,
            Some(RuntimeEvent::Completion {
                kind: CompletionKind::Normal,
                ..
            })
        ));
        assert_eq!(
            next(&events).await,
            Some(RuntimeEvent::RealmDestroyed {
                realm: RealmId::from_raw(1)
            })
        );
    }

    async fn printed_until_completion(events: &EventQueue) -> (Vec<String>, Option<RawError>) {
        let mut printed = Vec::new();
        loop {
            match next(events).await {
                Some(RuntimeEvent::Print { text, .. }) => printed.push(text),
                Some(RuntimeEvent::Completion { error, .. }) => return (printed, error),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_script_created_realms() {
        let (host, events) = start();
        next(&events).await;

        host.deliver(&eval(
            1,
            r#"
            var x = 1;
            var child = $.createRealm({ globals: { y: 5 } });
            child.evalScript("var x = 2; print(typeof x, x, y);");
            var grandchild = child.createRealm({});
            grandchild.evalScript("print('nested')");
            child.setGlobal("z", { list: [1, 2] });
            print(x, child.getGlobal("x"), child.getGlobal("z").list[1], child.global.y);
            var outcome = child.evalScript("x+++");
            print(outcome.type, outcome.value.name);
            "#,
        ))
        .unwrap();

        let (printed, error) = printed_until_completion(&events).await;
        assert_eq!(error, None);
        assert_eq!(
            printed,
            vec!["number 2 5", "nested", "1 2 2 5", "throw SyntaxError"]
        );

        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_script_realm_destroy_callbacks_run_children_first() {
        let (host, events) = start();
        next(&events).await;

        host.deliver(&eval(
            1,
            r#"
            var child = $.createRealm({ destroy: function () { print("child destroyed"); } });
            child.createRealm({ destroy: function () { print("grandchild destroyed"); } });
            child.destroy();
            child.destroy();
            try {
                child.evalScript("1");
            } catch (e) {
                print("gone");
            }
            "#,
        ))
        .unwrap();

        let (printed, error) = printed_until_completion(&events).await;
        assert_eq!(error, None);
        assert_eq!(printed, vec!["grandchild destroyed", "child destroyed", "gone"]);

        // script-created realms are never reported to the host
        host.deliver(&eval(2, "print('after')")).unwrap();
        assert!(matches!(
            next(&events).await,
            Some(RuntimeEvent::Print { seq: Some(2), .. })
        ));

        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_host_destroy_reaches_script_realms() {
        let (host, events) = start();
        next(&events).await;

        host.deliver(&Request::CreateRealm {
            seq: 1,
            realm: RealmId::from_raw(1),
            parent: RealmId::ROOT,
            globals: Map::new(),
        })
        .unwrap();
        next(&events).await;

        host.deliver(&Request::Eval {
            seq: 2,
            realm: RealmId::from_raw(1),
            code: "$.createRealm({ destroy: function () { print('inner destroyed'); } });".into(),
            is_async: false,
        })
        .unwrap();
        printed_until_completion(&events).await;

        host.deliver(&Request::DestroyRealm {
            seq: 3,
            realm: RealmId::from_raw(1),
        })
        .unwrap();

        assert_eq!(
            next(&events).await,
            Some(RuntimeEvent::Print {
                seq: Some(3),
                text: "inner destroyed".into()
            })
        );
        assert_eq!(
            next(&events).await,
            Some(RuntimeEvent::RealmDestroyed {
                realm: RealmId::from_raw(1)
            })
        );
        assert!(matches!(
            next(&events).await,
            Some(RuntimeEvent::Result { seq: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_interrupts_infinite_loop() {
        let (host, events) = start();
        next(&events).await;

        host.deliver(&eval(1, "print(1); while (true) {}")).unwrap();
        assert!(matches!(
            next(&events).await,
            Some(RuntimeEvent::Print { .. })
        ));

        let started = Instant::now();
        host.terminate().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        // the stream ends once the thread is gone
        let mut tail = Vec::new();
        while let Some(event) = next(&events).await {
            tail.push(event);
        }
        assert!(matches!(
            tail.last(),
            Some(RuntimeEvent::Disconnected { .. })
        ));
        assert!(host.deliver(&eval(2, "1")).is_err());
    }
}
