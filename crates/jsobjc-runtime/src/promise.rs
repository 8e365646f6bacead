//! Promises with thread affinity
//!
//! A promise belongs to the isolate that created it. Reactions always run
//! as microtasks on that isolate, in the order the promise settled. Other
//! threads settle a promise through a [`PromiseResolver`], which posts the
//! settlement back to the owning loop.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread::ThreadId;

use jsobjc_sdk::json::{from_json, to_json};
use jsobjc_sdk::{HostObject, JsError, JsObject, JsResult, JsValue};

use crate::error::RuntimeResult;
use crate::isolate::{Isolate, WeakIsolate};
use crate::run_loop::{KeepAlive, LoopHandle};

/// Settlement state
#[derive(Debug, Clone)]
pub enum PromiseState {
    /// Not settled yet
    Pending,
    /// Resolved with a value
    Fulfilled(JsValue),
    /// Rejected with a reason
    Rejected(JsValue),
}

type Outcome = Result<JsValue, JsValue>;
type Reaction = Box<dyn FnOnce(&Isolate, Outcome) -> JsResult<()>>;

#[doc(hidden)]
pub struct PromiseInner {
    id: u64,
    state: RefCell<PromiseState>,
    reactions: RefCell<Vec<Reaction>>,
    isolate: WeakIsolate,
    thread: ThreadId,
}

impl HostObject for PromiseInner {
    fn class_name(&self) -> &str {
        "Promise"
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

/// A promise owned by one isolate
#[derive(Clone)]
pub struct Promise {
    inner: Rc<PromiseInner>,
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Promise {
    /// A pending promise owned by `isolate`
    pub fn new(isolate: &Isolate) -> Self {
        Self {
            inner: Rc::new(PromiseInner {
                id: isolate.next_promise_id(),
                state: RefCell::new(PromiseState::Pending),
                reactions: RefCell::new(Vec::new()),
                isolate: isolate.downgrade(),
                thread: isolate.thread_id(),
            }),
        }
    }

    /// A promise already fulfilled with `value`
    pub fn resolved(isolate: &Isolate, value: JsValue) -> Self {
        let promise = Self::new(isolate);
        promise.resolve(value);
        promise
    }

    /// The promise behind a script value, if it is one
    pub fn from_value(value: &JsValue) -> Option<Self> {
        value
            .as_object()
            .and_then(|o| o.host_data::<PromiseInner>())
            .map(|inner| Self { inner })
    }

    /// The thread the promise was created on
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread
    }

    /// Current state
    pub fn state(&self) -> PromiseState {
        self.inner.state.borrow().clone()
    }

    /// Whether the promise has settled
    pub fn is_settled(&self) -> bool {
        !matches!(*self.inner.state.borrow(), PromiseState::Pending)
    }

    /// Resolve with `value`. A promise value is adopted.
    pub fn resolve(&self, value: JsValue) {
        if let Some(other) = Self::from_value(&value) {
            if Rc::ptr_eq(&other.inner, &self.inner) {
                self.settle(Err(JsError::type_error("Chaining cycle detected for promise").into_value()));
                return;
            }
            let this = self.clone();
            other.on_settled(Box::new(move |_, outcome| {
                this.settle(outcome);
                Ok(())
            }));
            return;
        }
        self.settle(Ok(value));
    }

    /// Reject with `reason`
    pub fn reject(&self, reason: JsValue) {
        self.settle(Err(reason));
    }

    fn settle(&self, outcome: Outcome) {
        {
            let mut state = self.inner.state.borrow_mut();
            if !matches!(*state, PromiseState::Pending) {
                return;
            }
            *state = match &outcome {
                Ok(value) => PromiseState::Fulfilled(value.clone()),
                Err(reason) => PromiseState::Rejected(reason.clone()),
            };
        }
        let reactions = std::mem::take(&mut *self.inner.reactions.borrow_mut());
        tracing::trace!(promise = self.inner.id, reactions = reactions.len(), "settled promise");
        for reaction in reactions {
            self.schedule(reaction, outcome.clone());
        }
    }

    fn schedule(&self, reaction: Reaction, outcome: Outcome) {
        // A promise that outlived its isolate has no loop to run on
        if let Some(isolate) = self.inner.isolate.upgrade() {
            isolate.queue_microtask(move |isolate| reaction(isolate, outcome));
        }
    }

    fn on_settled(&self, reaction: Reaction) {
        let outcome = match &*self.inner.state.borrow() {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(value) => Some(Ok(value.clone())),
            PromiseState::Rejected(reason) => Some(Err(reason.clone())),
        };
        match outcome {
            Some(outcome) => self.schedule(reaction, outcome),
            None => self.inner.reactions.borrow_mut().push(reaction),
        }
    }

    fn derived(&self) -> Promise {
        match self.inner.isolate.upgrade() {
            Some(isolate) => Promise::new(&isolate),
            None => Promise {
                inner: Rc::new(PromiseInner {
                    id: 0,
                    state: RefCell::new(PromiseState::Pending),
                    reactions: RefCell::new(Vec::new()),
                    isolate: self.inner.isolate.clone(),
                    thread: self.inner.thread,
                }),
            },
        }
    }

    /// `promise.then(onFulfilled, onRejected)`
    pub fn then(&self, on_fulfilled: Option<JsObject>, on_rejected: Option<JsObject>) -> Promise {
        let next = self.derived();
        let target = next.clone();
        self.on_settled(Box::new(move |_, outcome| {
            let (handler, argument, fulfilled) = match outcome {
                Ok(value) => (on_fulfilled, value, true),
                Err(reason) => (on_rejected, reason, false),
            };
            match handler {
                Some(handler) => match handler.call(&JsValue::Undefined, &[argument]) {
                    Ok(result) => target.resolve(result),
                    Err(e) => target.reject(e.into_value()),
                },
                None if fulfilled => target.resolve(argument),
                None => target.reject(argument),
            }
            Ok(())
        }));
        next
    }

    /// `promise.catch(onRejected)`
    pub fn catch(&self, on_rejected: JsObject) -> Promise {
        self.then(None, Some(on_rejected))
    }

    /// `promise.finally(onFinally)`: runs on either outcome and passes the
    /// outcome through unless the handler throws
    pub fn finally(&self, on_finally: JsObject) -> Promise {
        let next = self.derived();
        let target = next.clone();
        self.on_settled(Box::new(move |_, outcome| {
            match on_finally.call(&JsValue::Undefined, &[]) {
                Err(e) => target.reject(e.into_value()),
                Ok(_) => match outcome {
                    Ok(value) => target.resolve(value),
                    Err(reason) => target.reject(reason),
                },
            }
            Ok(())
        }));
        next
    }

    /// Run `f` on the owning thread once settled
    pub fn on_complete(&self, f: impl FnOnce(&Isolate, Result<JsValue, JsValue>) + 'static) {
        self.on_settled(Box::new(move |isolate, outcome| {
            f(isolate, outcome);
            Ok(())
        }));
    }

    /// A `Send` handle that settles this promise from any thread.
    ///
    /// The owning loop stays alive until the resolver is used or dropped.
    pub fn resolver(&self) -> RuntimeResult<PromiseResolver> {
        let isolate = self
            .inner
            .isolate
            .upgrade()
            .ok_or_else(|| crate::error::RuntimeError::Terminated("Isolate".to_string()))?;
        isolate.track_promise(self.inner.id, self.clone());
        let handle = isolate.spawn_handle();
        Ok(PromiseResolver {
            id: self.inner.id,
            keep_alive: handle.keep_alive(),
            handle,
        })
    }

    /// The script-visible promise object with `then`, `catch` and `finally`
    pub fn to_value(&self) -> JsValue {
        let object = JsObject::host(self.inner.clone());
        let promise = self.clone();
        object.set(
            "then",
            JsValue::Object(JsObject::function("then", move |_, args| {
                let fulfilled = callable(args.first());
                let rejected = callable(args.get(1));
                Ok(promise.then(fulfilled, rejected).to_value())
            })),
        );
        let promise = self.clone();
        object.set(
            "catch",
            JsValue::Object(JsObject::function("catch", move |_, args| {
                Ok(promise.then(None, callable(args.first())).to_value())
            })),
        );
        let promise = self.clone();
        object.set(
            "finally",
            JsValue::Object(JsObject::function("finally", move |_, args| {
                Ok(match callable(args.first()) {
                    Some(f) => promise.finally(f).to_value(),
                    None => promise.then(None, None).to_value(),
                })
            })),
        );
        JsValue::Object(object)
    }
}

fn callable(value: Option<&JsValue>) -> Option<JsObject> {
    value.and_then(JsValue::as_object).filter(|o| o.is_function()).cloned()
}

/// Settles a promise from any thread through its owning loop.
///
/// Values cross as JSON.
#[derive(Debug)]
pub struct PromiseResolver {
    id: u64,
    handle: LoopHandle,
    keep_alive: KeepAlive,
}

impl PromiseResolver {
    /// Fulfil the promise
    pub fn resolve(self, value: serde_json::Value) -> RuntimeResult<()> {
        self.settle(Ok(value))
    }

    /// Reject the promise
    pub fn reject(self, reason: serde_json::Value) -> RuntimeResult<()> {
        self.settle(Err(reason))
    }

    /// Fulfil with a copy of a script value. Must be called on a thread
    /// that owns `value`.
    pub fn resolve_value(self, value: &JsValue) -> RuntimeResult<()> {
        let json = to_json(value).map_err(JsError::from)?;
        self.resolve(json)
    }

    fn settle(self, outcome: Result<serde_json::Value, serde_json::Value>) -> RuntimeResult<()> {
        let id = self.id;
        let keep_alive = self.keep_alive;
        self.handle.post(move |isolate| {
            if let Some(promise) = isolate.untrack_promise(id) {
                match outcome {
                    Ok(value) => promise.resolve(from_json(&value)),
                    Err(reason) => promise.reject(from_json(&reason)),
                }
            }
            drop(keep_alive);
        })
    }
}
