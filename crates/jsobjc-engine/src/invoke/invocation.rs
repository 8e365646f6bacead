//! Reflective invocation
//!
//! An `Invocation` collects a target, a selector and arguments by index
//! (0 and 1 are the receiver and selector), then performs the message send
//! when `invoke()` is called.

use std::cell::RefCell;
use std::rc::Rc;

use jsobjc_sdk::{HostObject, JsObject, JsValue};

use super::Target;
use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::{ClassWrapper, ObjcWrapper};
use crate::metadata::{MethodFlags, MethodKind};
use crate::objc::{ClassId, Id};

/// A message send assembled step by step
#[derive(Debug, Default)]
pub struct Invocation {
    target: RefCell<JsValue>,
    selector: RefCell<Option<Rc<str>>>,
    arguments: RefCell<Vec<Option<JsValue>>>,
    return_value: RefCell<JsValue>,
}

impl HostObject for Invocation {
    fn class_name(&self) -> &str {
        "Invocation"
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

fn index_argument(value: Option<&JsValue>) -> BridgeResult<usize> {
    match value {
        Some(JsValue::Number(n)) if n.fract() == 0.0 && *n >= 0.0 => Ok(*n as usize),
        Some(other) => Err(BridgeError::Type(format!("{} is not a valid argument index", other.to_js_string()))),
        None => Err(BridgeError::argument_count(1, 2)),
    }
}

impl Bridge {
    /// `new Invocation([target[, selector]])`
    pub fn new_invocation(&self, args: &[JsValue]) -> BridgeResult<JsValue> {
        let invocation = Invocation::default();
        if let Some(target) = args.first() {
            *invocation.target.borrow_mut() = target.clone();
        }
        if let Some(selector) = args.get(1) {
            let selector = selector
                .as_str()
                .ok_or_else(|| BridgeError::Type(format!("{} is not a selector", selector.to_js_string())))?;
            *invocation.selector.borrow_mut() = Some(Rc::from(selector));
        }
        Ok(JsValue::Object(JsObject::host(Rc::new(invocation))))
    }

    /// Methods of an invocation value
    pub(crate) fn invocation_method(
        &self,
        invocation: &Invocation,
        name: &str,
        args: &[JsValue],
    ) -> Option<BridgeResult<JsValue>> {
        let first = args.first().cloned().unwrap_or_default();
        Some(match name {
            "setTarget" => {
                *invocation.target.borrow_mut() = first;
                Ok(JsValue::Undefined)
            }
            "target" => Ok(invocation.target.borrow().clone()),
            "setSelector" => match first.as_str() {
                Some(selector) => {
                    *invocation.selector.borrow_mut() = Some(Rc::from(selector));
                    Ok(JsValue::Undefined)
                }
                None => Err(BridgeError::Type(format!("{} is not a selector", first.to_js_string()))),
            },
            "selector" => Ok(invocation
                .selector
                .borrow()
                .as_ref()
                .map_or(JsValue::Null, |s| JsValue::string(&**s))),
            "setArgumentAtIndex" => index_argument(args.get(1)).and_then(|index| {
                if index < 2 {
                    return Err(BridgeError::Type(format!(
                        "Argument index {} is reserved for the receiver and selector",
                        index
                    )));
                }
                let mut arguments = invocation.arguments.borrow_mut();
                if arguments.len() <= index - 2 {
                    arguments.resize(index - 1, None);
                }
                arguments[index - 2] = Some(first);
                Ok(JsValue::Undefined)
            }),
            "invoke" => self.invoke_invocation(invocation).map(|value| {
                *invocation.return_value.borrow_mut() = value;
                JsValue::Undefined
            }),
            "returnValue" => Ok(invocation.return_value.borrow().clone()),
            _ => return None,
        })
    }

    fn invocation_receiver(&self, target: &JsValue) -> BridgeResult<(Id, ClassId, Vec<Rc<str>>, MethodKind)> {
        let object = target.as_object();
        if let Some(wrapper) = object.and_then(|o| o.host_data::<ObjcWrapper>()) {
            return Ok((wrapper.handle(), wrapper.class(), wrapper.protocols().to_vec(), MethodKind::Instance));
        }
        if let Some(class) = object.and_then(|o| o.host_data::<ClassWrapper>()) {
            let handle = self.runtime().class_object(class.class());
            return Ok((handle, class.class(), Vec::new(), MethodKind::Class));
        }
        Err(BridgeError::Type(format!(
            "{} is not a valid invocation target",
            target.to_js_string()
        )))
    }

    fn invoke_invocation(&self, invocation: &Invocation) -> BridgeResult<JsValue> {
        let target = invocation.target.borrow().clone();
        let selector = invocation
            .selector
            .borrow()
            .clone()
            .ok_or_else(|| BridgeError::Type("Invocation has no selector".to_string()))?;
        let (receiver, class, protocols, kind) = self.invocation_receiver(&target)?;
        self.in_frame(&selector, || {
            let runtime = self.runtime();
            let sel = runtime.sel(&selector);
            let class_name = self.metadata_class_name(class);
            let declared = self
                .registry
                .borrow()
                .method_by_selector(&class_name, &protocols, &selector, kind);
            let (layout, flags) = match declared {
                Some(meta) => (self.method_layout(&meta)?, meta.flags),
                None => match runtime.lookup(receiver, sel) {
                    Some(entry) => (entry.layout.clone(), MethodFlags::empty()),
                    None => {
                        return Err(BridgeError::NativeException {
                            name: "NSInvalidArgumentException".to_string(),
                            reason: format!("{}: unrecognized selector sent to {}", selector, target.to_js_string()),
                        })
                    }
                },
            };
            let expected = layout.explicit_arg_count();
            let set = invocation.arguments.borrow();
            if set.len() > expected {
                return Err(BridgeError::argument_count(set.len(), expected));
            }
            let args: Vec<JsValue> = (0..expected)
                .map(|i| set.get(i).cloned().flatten().unwrap_or_default())
                .collect();
            drop(set);
            let performed = self.perform(&Target::Message { receiver, sel }, layout, flags, &args)?;
            self.return_value(&performed, flags)
        })
    }
}
