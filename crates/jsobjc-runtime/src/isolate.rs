//! Isolates
//!
//! An isolate is one bridge plus the loop that drives it, pinned to the
//! thread that created it. Nothing in an isolate is shared with another
//! isolate; other threads reach it only through a [`LoopHandle`].

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use jsobjc_engine::Bridge;
use jsobjc_sdk::{JsError, JsObject, JsResult, JsValue};
use rustc_hash::FxHashMap;

use crate::config::RuntimeConfig;
use crate::console::Console;
use crate::error::RuntimeResult;
use crate::promise::Promise;
use crate::run_loop::{LoopHandle, RunLoop, TimerId};
use crate::worker::{Worker, WorkerBody, WorkerScope};

type UncaughtHandler = Rc<dyn Fn(&JsError)>;

fn log_uncaught(error: &JsError) {
    tracing::error!(
        name = %error.name(),
        stack = error.stack().as_deref().unwrap_or(""),
        "uncaught exception: {}",
        error.message()
    );
}

struct IsolateInner {
    config: RuntimeConfig,
    bridge: Rc<Bridge>,
    run_loop: RunLoop,
    global: JsObject,
    console: Rc<Console>,
    thread: ThreadId,
    uncaught: RefCell<UncaughtHandler>,
    next_promise: Cell<u64>,
    promises: RefCell<FxHashMap<u64, Promise>>,
    workers: RefCell<FxHashMap<u64, Worker>>,
    worker_bodies: RefCell<FxHashMap<String, WorkerBody>>,
    scope: RefCell<Option<WorkerScope>>,
}

/// One scripting context with its own bridge, globals and run loop.
///
/// Cloning yields another handle to the same isolate. `Isolate` is not
/// `Send`; use [`Isolate::spawn_handle`] to reach it from other threads.
#[derive(Clone)]
pub struct Isolate {
    inner: Rc<IsolateInner>,
}

/// Non-owning reference to an isolate
#[derive(Clone)]
pub struct WeakIsolate(Weak<IsolateInner>);

impl WeakIsolate {
    /// The isolate, if it is still alive
    pub fn upgrade(&self) -> Option<Isolate> {
        self.0.upgrade().map(|inner| Isolate { inner })
    }
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("thread", &self.inner.thread)
            .field("timers", &self.inner.run_loop.pending_timers())
            .finish()
    }
}

/// A function argument, or a TypeError naming `what`
fn function_arg(args: &[JsValue], index: usize, what: &str) -> JsResult<JsObject> {
    match args.get(index) {
        Some(JsValue::Object(o)) if o.is_function() => Ok(o.clone()),
        other => Err(JsError::type_error(format!(
            "{} is not a function ({})",
            other.map_or_else(|| "undefined".to_string(), JsValue::to_js_string),
            what
        ))),
    }
}

/// Milliseconds from a script delay argument; NaN and negatives are zero
fn delay_arg(value: Option<&JsValue>) -> Duration {
    let ms = value.map_or(0.0, JsValue::to_number);
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}

impl Isolate {
    /// Create an isolate on the current thread
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        let bridge = Bridge::new(config.bridge.clone())?;
        let run_loop = RunLoop::new(Duration::from_millis(config.timer_resolution_ms));
        let isolate = Isolate {
            inner: Rc::new(IsolateInner {
                config,
                bridge,
                run_loop,
                global: JsObject::new(),
                console: Rc::new(Console::default()),
                thread: thread::current().id(),
                uncaught: RefCell::new(Rc::new(log_uncaught) as UncaughtHandler),
                next_promise: Cell::new(1),
                promises: RefCell::new(FxHashMap::default()),
                workers: RefCell::new(FxHashMap::default()),
                worker_bodies: RefCell::new(FxHashMap::default()),
                scope: RefCell::new(None),
            }),
        };
        let weak = isolate.downgrade();
        isolate.inner.bridge.set_uncaught_handler(move |error| {
            if let Some(isolate) = weak.upgrade() {
                isolate.report_uncaught(error.clone());
            }
        });
        isolate.install_globals();
        tracing::debug!(thread = ?isolate.inner.thread, "created isolate");
        Ok(isolate)
    }

    /// A non-owning reference
    pub fn downgrade(&self) -> WeakIsolate {
        WeakIsolate(Rc::downgrade(&self.inner))
    }

    /// The configuration the isolate was created with
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The isolate's bridge
    pub fn bridge(&self) -> &Rc<Bridge> {
        &self.inner.bridge
    }

    /// The global object
    pub fn global(&self) -> &JsObject {
        &self.inner.global
    }

    /// The console sink
    pub fn console(&self) -> &Rc<Console> {
        &self.inner.console
    }

    /// The thread the isolate runs on
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread
    }

    /// A `Send + Clone` handle that posts work to this isolate
    pub fn spawn_handle(&self) -> LoopHandle {
        self.inner.run_loop.handle().clone()
    }

    pub(crate) fn run_loop(&self) -> &RunLoop {
        &self.inner.run_loop
    }

    /// Look up a global: the isolate's own globals first, then native
    /// classes, protocols, structs and functions
    pub fn global_value(&self, name: &str) -> Option<JsValue> {
        if self.inner.global.has(name) {
            return Some(self.inner.global.get(name));
        }
        self.inner.bridge.global(name)
    }

    /// Call the global function `name`
    pub fn call_global(&self, name: &str, args: &[JsValue]) -> JsResult<JsValue> {
        match self.global_value(name) {
            Some(JsValue::Object(f)) if f.is_function() => f.call(&JsValue::Undefined, args),
            _ => Err(JsError::type_error(format!("{} is not a function", name))),
        }
    }

    /// Run until no work is left
    pub fn run_until_idle(&self) {
        self.inner.run_loop.run_until_idle(self);
    }

    /// Queue a microtask
    pub fn queue_microtask(&self, task: impl FnOnce(&Isolate) -> JsResult<()> + 'static) {
        self.inner.run_loop.queue_microtask(Box::new(task));
    }

    /// Queue a macrotask on this thread
    pub fn queue_task(&self, task: impl FnOnce(&Isolate) -> JsResult<()> + 'static) {
        self.inner.run_loop.queue_macrotask(Box::new(task));
    }

    /// `setTimeout` with a Rust callback
    pub fn set_timeout(&self, delay: Duration, callback: impl Fn(&Isolate) -> JsResult<()> + 'static) -> TimerId {
        self.inner.run_loop.add_timer(delay, false, Rc::new(callback))
    }

    /// `setInterval` with a Rust callback
    pub fn set_interval(&self, period: Duration, callback: impl Fn(&Isolate) -> JsResult<()> + 'static) -> TimerId {
        self.inner.run_loop.add_timer(period, true, Rc::new(callback))
    }

    /// Cancel a timer. Returns whether it was still pending.
    pub fn clear_timer(&self, id: TimerId) -> bool {
        self.inner.run_loop.clear_timer(id)
    }

    /// A new pending promise owned by this isolate
    pub fn promise(&self) -> Promise {
        Promise::new(self)
    }

    pub(crate) fn next_promise_id(&self) -> u64 {
        let id = self.inner.next_promise.get();
        self.inner.next_promise.set(id + 1);
        id
    }

    pub(crate) fn track_promise(&self, id: u64, promise: Promise) {
        self.inner.promises.borrow_mut().insert(id, promise);
    }

    pub(crate) fn untrack_promise(&self, id: u64) -> Option<Promise> {
        self.inner.promises.borrow_mut().remove(&id)
    }

    /// Replace the handler for exceptions no script caller can catch
    pub fn set_uncaught_handler(&self, handler: impl Fn(&JsError) + 'static) {
        *self.inner.uncaught.borrow_mut() = Rc::new(handler);
    }

    /// Hand an exception to the uncaught handler
    pub fn report_uncaught(&self, error: JsError) {
        let handler = self.inner.uncaught.borrow().clone();
        handler(&error);
    }

    /// Register a worker body that script can start with `Worker(name)`
    pub fn define_worker(
        &self,
        name: &str,
        body: impl Fn(&WorkerScope) -> RuntimeResult<()> + Send + Sync + 'static,
    ) {
        self.inner
            .worker_bodies
            .borrow_mut()
            .insert(name.to_string(), Arc::new(body));
    }

    /// Start a worker running `body` on its own thread and isolate
    pub fn spawn_worker(
        &self,
        body: impl FnOnce(&WorkerScope) -> RuntimeResult<()> + Send + 'static,
    ) -> RuntimeResult<Worker> {
        let worker = Worker::spawn(self, self.inner.config.clone(), body)?;
        self.inner.workers.borrow_mut().insert(worker.id(), worker.clone());
        Ok(worker)
    }

    pub(crate) fn worker(&self, id: u64) -> Option<Worker> {
        self.inner.workers.borrow().get(&id).cloned()
    }

    pub(crate) fn forget_worker(&self, id: u64) {
        self.inner.workers.borrow_mut().remove(&id);
    }

    /// The scope of the worker this isolate runs, if it is a worker isolate
    pub fn worker_scope(&self) -> Option<WorkerScope> {
        self.inner.scope.borrow().clone()
    }

    pub(crate) fn install_worker_scope(&self, scope: WorkerScope) {
        let global = &self.inner.global;
        let weak = self.downgrade();
        global.set(
            "postMessage",
            JsValue::Object(JsObject::function("postMessage", move |_, args| {
                let scope = weak.upgrade().and_then(|isolate| isolate.worker_scope());
                match scope {
                    Some(scope) => scope.post_message(args).map(|_| JsValue::Undefined),
                    None => Ok(JsValue::Undefined),
                }
            })),
        );
        let weak = self.downgrade();
        global.set(
            "close",
            JsValue::Object(JsObject::function("close", move |_, _| {
                if let Some(scope) = weak.upgrade().and_then(|isolate| isolate.worker_scope()) {
                    scope.close();
                }
                Ok(JsValue::Undefined)
            })),
        );
        *self.inner.scope.borrow_mut() = Some(scope);
    }

    fn timer_function(&self, name: &'static str, repeat: bool) -> JsValue {
        let weak = self.downgrade();
        JsValue::Object(JsObject::function(name, move |_, args| {
            let callback = function_arg(args, 0, name)?;
            let delay = delay_arg(args.get(1));
            let extra: Vec<JsValue> = args.iter().skip(2).cloned().collect();
            let Some(isolate) = weak.upgrade() else {
                return Ok(JsValue::Undefined);
            };
            let id = isolate.inner.run_loop.add_timer(
                delay,
                repeat,
                Rc::new(move |_: &Isolate| callback.call(&JsValue::Undefined, &extra).map(|_| ())),
            );
            Ok(JsValue::from(id))
        }))
    }

    fn clear_function(&self, name: &'static str) -> JsValue {
        let weak = self.downgrade();
        JsValue::Object(JsObject::function(name, move |_, args| {
            let id = args.first().map_or(0.0, JsValue::to_number);
            if let Some(isolate) = weak.upgrade() {
                if id.is_finite() && id >= 1.0 {
                    isolate.clear_timer(id as TimerId);
                }
            }
            Ok(JsValue::Undefined)
        }))
    }

    fn install_globals(&self) {
        let global = &self.inner.global;
        let bridge = &self.inner.bridge;
        global.set("globalThis", JsValue::Object(global.clone()));
        global.set("interop", JsValue::Object(bridge.interop_object()));
        global.set("console", JsValue::Object(self.inner.console.to_object()));
        global.set("setTimeout", self.timer_function("setTimeout", false));
        global.set("setInterval", self.timer_function("setInterval", true));
        global.set("clearTimeout", self.clear_function("clearTimeout"));
        global.set("clearInterval", self.clear_function("clearInterval"));

        let weak = self.downgrade();
        global.set(
            "queueMicrotask",
            JsValue::Object(JsObject::function("queueMicrotask", move |_, args| {
                let callback = function_arg(args, 0, "queueMicrotask")?;
                if let Some(isolate) = weak.upgrade() {
                    isolate.queue_microtask(move |_| callback.call(&JsValue::Undefined, &[]).map(|_| ()));
                }
                Ok(JsValue::Undefined)
            })),
        );

        let weak = Rc::downgrade(bridge);
        global.set(
            "releaseNativeCounterpart",
            JsValue::Object(JsObject::function("releaseNativeCounterpart", move |_, args| {
                let Some(bridge) = weak.upgrade() else {
                    return Ok(JsValue::Undefined);
                };
                bridge
                    .release_native_counterpart(args)
                    .map(|_| JsValue::Undefined)
                    .map_err(|e| bridge.to_js_error(e))
            })),
        );

        let weak = self.downgrade();
        global.set(
            "Worker",
            JsValue::Object(JsObject::function("Worker", move |_, args| {
                let Some(isolate) = weak.upgrade() else {
                    return Ok(JsValue::Undefined);
                };
                let name = args.first().map(JsValue::to_js_string).unwrap_or_default();
                let body = isolate.inner.worker_bodies.borrow().get(&name).cloned();
                let body = body.ok_or_else(|| {
                    JsError::type_error(format!("No worker named \"{}\" is defined", name))
                })?;
                let worker = isolate
                    .spawn_worker(move |scope| body(scope))
                    .map_err(|e| JsError::error(e.to_string()))?;
                Ok(JsValue::Object(worker.object()))
            })),
        );
    }
}
