//! Bridge call stack
//!
//! Tracks the native entry points currently executing on behalf of script,
//! innermost last. The outermost entry owns an autorelease pool that is
//! drained when it returns. When a call fails, the frames active at the
//! innermost failure point are captured for the error's `stack`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bridge::Bridge;
use crate::error::BridgeResult;
use crate::objc::ClassId;

/// Active bridge frames of one isolate
#[derive(Debug, Default)]
pub struct CallStack {
    frames: RefCell<Vec<Rc<str>>>,
    captured: RefCell<Option<String>>,
    /// Classes whose script implementation is running, innermost last;
    /// `super` calls resolve against the top entry
    implementing: RefCell<Vec<ClassId>>,
}

impl CallStack {
    /// An empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active frames
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Current frames rendered innermost first
    pub fn render(&self) -> Option<String> {
        let frames = self.frames.borrow();
        if frames.is_empty() {
            return None;
        }
        Some(
            frames
                .iter()
                .rev()
                .map(|f| format!("{}@[native code]", f))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Take the stack captured at the most recent failure
    pub fn take_captured(&self) -> Option<String> {
        self.captured.borrow_mut().take()
    }

    fn capture(&self) {
        if self.captured.borrow().is_none() {
            let rendered = self.render();
            *self.captured.borrow_mut() = rendered;
        }
    }

    pub(crate) fn implementing_class(&self) -> Option<ClassId> {
        self.implementing.borrow().last().copied()
    }

    pub(crate) fn push_implementation(&self, class: ClassId) {
        self.implementing.borrow_mut().push(class);
    }

    pub(crate) fn pop_implementation(&self) {
        self.implementing.borrow_mut().pop();
    }
}

impl Bridge {
    /// Run `f` as bridge frame `symbol`
    pub(crate) fn in_frame<T>(&self, symbol: &str, f: impl FnOnce() -> BridgeResult<T>) -> BridgeResult<T> {
        let stack = &self.call_stack;
        let outermost = stack.depth() == 0;
        if outermost {
            stack.captured.borrow_mut().take();
            self.runtime().push_autorelease_pool();
        }
        stack.frames.borrow_mut().push(Rc::from(symbol));
        let result = f();
        if result.is_err() {
            stack.capture();
        }
        stack.frames.borrow_mut().pop();
        if outermost {
            if let Err(e) = self.runtime().pop_autorelease_pool() {
                tracing::warn!(error = %e, "exception while draining autorelease pool");
                self.report_uncaught(self.native_exception_to_js(e));
            }
            self.collect_deferred();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOptions;
    use crate::error::BridgeError;

    #[test]
    fn test_failure_captures_innermost_frames() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let result: BridgeResult<()> = bridge.in_frame("outer", || {
            bridge.in_frame("inner", || Err(BridgeError::Type("boom".to_string())))
        });
        assert!(result.is_err());
        assert_eq!(bridge.call_stack.depth(), 0);
        assert_eq!(
            bridge.call_stack.take_captured().as_deref(),
            Some("inner@[native code]\nouter@[native code]")
        );
    }

    #[test]
    fn test_outermost_frame_drains_pool() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let runtime = bridge.runtime();
        let class = runtime.class_named("NSObject").unwrap();
        let handle = bridge
            .in_frame("f", || Ok(runtime.autorelease(runtime.alloc_instance(class))))
            .unwrap();
        assert!(!runtime.is_live(handle));
        assert_eq!(runtime.pool_depth(), 0);
    }
}
