//! Workers
//!
//! A worker is an OS thread with its own [`Isolate`]: its own bridge, wrapper
//! table and caches. The two sides talk only by message; each message is a
//! structural copy made through `serde_json::Value` and is delivered as a
//! macrotask on the receiving loop.
//!
//! `terminate()` from the owner and `close()` from inside both stop the
//! worker's loop. After `terminate()` nothing more is delivered in either
//! direction. After `close()` the worker receives nothing more, but messages
//! it posted before closing still arrive.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel;
use jsobjc_engine::BridgeError;
use jsobjc_sdk::json::{from_json, to_json};
use jsobjc_sdk::{JsError, JsObject, JsResult, JsValue};
use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::isolate::Isolate;
use crate::run_loop::{KeepAlive, LoopHandle};

/// A worker body that can be started more than once
pub type WorkerBody = Arc<dyn Fn(&WorkerScope) -> RuntimeResult<()> + Send + Sync>;

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

/// State both threads of a worker see
struct WorkerShared {
    id: u64,
    terminated: AtomicBool,
    closed: AtomicBool,
    /// Keeps the owner's loop running while the worker lives
    owner_alive: Mutex<Option<KeepAlive>>,
}

impl WorkerShared {
    fn release_owner(&self) {
        drop(self.owner_alive.lock().take());
    }
}

/// The one-argument check and structural copy of `postMessage`
fn clone_message(args: &[JsValue]) -> JsResult<serde_json::Value> {
    if args.len() != 1 {
        return Err(JsError::new(
            "ArgumentCountError",
            BridgeError::argument_count(args.len(), 1).to_string(),
        ));
    }
    Ok(to_json(&args[0])?)
}

/// `{ data }`, the argument of `onmessage`
fn message_event(data: JsValue) -> JsValue {
    let event = JsObject::new();
    event.set("data", data);
    JsValue::Object(event)
}

fn dispatch(isolate: &Isolate, handler: JsValue, data: &serde_json::Value) {
    let Some(handler) = handler.as_object().filter(|h| h.is_function()).cloned() else {
        tracing::debug!("message dropped: no onmessage handler");
        return;
    };
    if let Err(e) = handler.call(&JsValue::Undefined, &[message_event(from_json(data))]) {
        isolate.report_uncaught(e);
    }
}

struct WorkerPort {
    shared: Arc<WorkerShared>,
    worker_loop: LoopHandle,
    object: JsObject,
    thread: RefCell<Option<thread::JoinHandle<()>>>,
    owner: crate::isolate::WeakIsolate,
}

/// The owner's handle to a worker
#[derive(Clone)]
pub struct Worker {
    port: Rc<WorkerPort>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.port.shared.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Worker {
    /// Start `body` on a new thread named `jsobjc-worker-<n>`.
    ///
    /// Returns once the worker's isolate exists; the body then runs on the
    /// worker thread, followed by the worker's loop.
    pub(crate) fn spawn(
        owner: &Isolate,
        config: RuntimeConfig,
        body: impl FnOnce(&WorkerScope) -> RuntimeResult<()> + Send + 'static,
    ) -> RuntimeResult<Worker> {
        let id = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);
        let owner_loop = owner.spawn_handle();
        let shared = Arc::new(WorkerShared {
            id,
            terminated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            owner_alive: Mutex::new(Some(owner_loop.keep_alive())),
        });
        let (ready_tx, ready_rx) = channel::bounded::<Result<LoopHandle, String>>(1);

        let thread_shared = shared.clone();
        let stack_size = config.worker_stack_size;
        let handle = thread::Builder::new()
            .name(format!("jsobjc-worker-{}", id))
            .stack_size(stack_size)
            .spawn(move || {
                run_worker(config, thread_shared.clone(), owner_loop, ready_tx, body);
                thread_shared.release_owner();
            })?;

        let worker_loop = match ready_rx.recv() {
            Ok(Ok(worker_loop)) => worker_loop,
            Ok(Err(message)) => {
                shared.release_owner();
                return Err(RuntimeError::Worker(message));
            }
            Err(_) => {
                shared.release_owner();
                return Err(RuntimeError::Worker(format!("worker {} exited during startup", id)));
            }
        };
        tracing::debug!(worker = id, "spawned worker");

        let port = Rc::new_cyclic(|weak: &Weak<WorkerPort>| WorkerPort {
            shared,
            worker_loop,
            object: port_object(weak.clone()),
            thread: RefCell::new(Some(handle)),
            owner: owner.downgrade(),
        });
        Ok(Worker { port })
    }

    /// Process-unique worker id
    pub fn id(&self) -> u64 {
        self.port.shared.id
    }

    /// The script-visible worker object. Assigning its `onmessage` sets the
    /// handler for messages from the worker.
    pub fn object(&self) -> JsObject {
        self.port.object.clone()
    }

    /// Set the handler for messages from the worker
    pub fn set_onmessage(&self, handler: JsObject) {
        self.port.object.set("onmessage", JsValue::Object(handler));
    }

    /// Send one message to the worker
    pub fn post_message(&self, args: &[JsValue]) -> JsResult<()> {
        let data = clone_message(args)?;
        let shared = &self.port.shared;
        if shared.terminated.load(Ordering::Acquire) || shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let receiver = shared.clone();
        // A loop that already stopped drops the message
        let _ = self.port.worker_loop.post(move |isolate| {
            if receiver.terminated.load(Ordering::Acquire) || receiver.closed.load(Ordering::Acquire) {
                return;
            }
            dispatch(isolate, isolate.global().get("onmessage"), &data);
        });
        Ok(())
    }

    /// Stop the worker. Repeated calls do nothing.
    pub fn terminate(&self) {
        let shared = &self.port.shared;
        if shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.port.worker_loop.shutdown();
        shared.release_owner();
        if let Some(owner) = self.port.owner.upgrade() {
            owner.forget_worker(shared.id);
        }
        tracing::debug!(worker = shared.id, "terminated worker");
    }

    /// Whether [`terminate`](Self::terminate) has been called
    pub fn is_terminated(&self) -> bool {
        self.port.shared.terminated.load(Ordering::Acquire)
    }

    /// Wait for the worker thread to exit
    pub fn join(&self) -> RuntimeResult<()> {
        let handle = self.port.thread.borrow_mut().take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| RuntimeError::Worker(format!("worker {} panicked", self.id()))),
            None => Ok(()),
        }
    }

    fn deliver(&self, isolate: &Isolate, data: &serde_json::Value) {
        if self.is_terminated() {
            return;
        }
        dispatch(isolate, self.port.object.get("onmessage"), data);
    }
}

fn port_object(port: Weak<WorkerPort>) -> JsObject {
    let object = JsObject::new();
    let post = port.clone();
    object.set(
        "postMessage",
        JsValue::Object(JsObject::function("postMessage", move |_, args| {
            if let Some(port) = post.upgrade() {
                Worker { port }.post_message(args)?;
            }
            Ok(JsValue::Undefined)
        })),
    );
    object.set(
        "terminate",
        JsValue::Object(JsObject::function("terminate", move |_, _| {
            if let Some(port) = port.upgrade() {
                Worker { port }.terminate();
            }
            Ok(JsValue::Undefined)
        })),
    );
    object
}

fn run_worker(
    config: RuntimeConfig,
    shared: Arc<WorkerShared>,
    owner_loop: LoopHandle,
    ready: channel::Sender<Result<LoopHandle, String>>,
    body: impl FnOnce(&WorkerScope) -> RuntimeResult<()>,
) {
    let isolate = match Isolate::new(config) {
        Ok(isolate) => isolate,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    let own_loop = isolate.spawn_handle();
    let scope = WorkerScope {
        inner: Rc::new(ScopeInner {
            isolate: isolate.downgrade(),
            shared,
            owner_loop,
            own_loop: own_loop.clone(),
            alive: RefCell::new(Some(own_loop.keep_alive())),
        }),
    };
    isolate.install_worker_scope(scope.clone());
    if ready.send(Ok(own_loop)).is_err() {
        return;
    }
    if let Err(e) = body(&scope) {
        match e {
            RuntimeError::Script(error) => isolate.report_uncaught(error),
            other => tracing::error!(worker = scope.id(), error = %other, "worker body failed"),
        }
    }
    isolate.run_until_idle();
    tracing::debug!(worker = scope.id(), "worker loop finished");
}

struct ScopeInner {
    isolate: crate::isolate::WeakIsolate,
    shared: Arc<WorkerShared>,
    owner_loop: LoopHandle,
    own_loop: LoopHandle,
    /// Keeps the worker's loop waiting for messages until `close()`
    alive: RefCell<Option<KeepAlive>>,
}

/// The worker side: what a worker body sees
#[derive(Clone)]
pub struct WorkerScope {
    inner: Rc<ScopeInner>,
}

impl std::fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScope").field("id", &self.id()).finish()
    }
}

impl WorkerScope {
    /// The worker's id
    pub fn id(&self) -> u64 {
        self.inner.shared.id
    }

    /// The worker's own isolate
    pub fn isolate(&self) -> Option<Isolate> {
        self.inner.isolate.upgrade()
    }

    /// Set the handler for messages from the owner
    pub fn set_onmessage(&self, handler: JsObject) {
        if let Some(isolate) = self.isolate() {
            isolate.global().set("onmessage", JsValue::Object(handler));
        }
    }

    /// Send one message to the owner
    pub fn post_message(&self, args: &[JsValue]) -> JsResult<()> {
        let data = clone_message(args)?;
        let shared = &self.inner.shared;
        if shared.terminated.load(Ordering::Acquire) || shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let id = shared.id;
        let _ = self.inner.owner_loop.post(move |isolate| {
            if let Some(worker) = isolate.worker(id) {
                worker.deliver(isolate, &data);
            }
        });
        Ok(())
    }

    /// Stop this worker from the inside
    pub fn close(&self) {
        if self.inner.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.inner.alive.borrow_mut().take());
        self.inner.own_loop.shutdown();
    }

    /// Whether the worker has been closed or terminated
    pub fn is_closed(&self) -> bool {
        let shared = &self.inner.shared;
        shared.closed.load(Ordering::Acquire) || shared.terminated.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clone_message_checks_arity_and_data() {
        let err = clone_message(&[]).unwrap_err();
        assert_eq!(err.name(), "ArgumentCountError");
        assert_eq!(err.message(), "Actual arguments count: \"0\". Expected: \"1\".");

        let err = clone_message(&[JsValue::Object(JsObject::function("f", |_, _| Ok(JsValue::Undefined)))])
            .unwrap_err();
        assert_eq!(err.name(), "DataCloneError");

        assert_eq!(clone_message(&[JsValue::from(3)]).unwrap(), serde_json::json!(3.0));
    }

    #[test]
    fn test_worker_thread_is_named() {
        let isolate = Isolate::new(RuntimeConfig::default()).unwrap();
        let worker = isolate
            .spawn_worker(|scope| {
                let name = thread::current().name().unwrap_or_default().to_string();
                scope.post_message(&[JsValue::from(name)])?;
                scope.close();
                Ok(())
            })
            .unwrap();
        let names = Rc::new(RefCell::new(Vec::new()));
        let sink = names.clone();
        worker.set_onmessage(JsObject::function("onmessage", move |_, args| {
            let data = args[0].as_object().unwrap().get("data");
            sink.borrow_mut().push(data.to_js_string());
            Ok(JsValue::Undefined)
        }));
        isolate.run_until_idle();
        worker.join().unwrap();
        assert_eq!(*names.borrow(), vec![format!("jsobjc-worker-{}", worker.id())]);
    }
}
