//! Overload resolution
//!
//! Picks one declaration from an overload set for a call site. A single
//! plain-object argument to a constructor is matched by its key set against
//! initializer parameter-name tokens. When no token set matches, the object
//! can still fill a lone struct parameter whose fields it names; anything
//! else is a resolution error. Other calls are matched by argument count,
//! then by argument shape in declaration order.

use jsobjc_sdk::{JsValue, ObjectKind};
use rustc_hash::FxHashSet;

use crate::bridge::Bridge;
use crate::encoding::TypeDescriptor;
use crate::error::{BridgeError, BridgeResult};
use crate::interop::{Pointer, Reference};
use crate::lifetime::{ClassWrapper, ObjcWrapper, ProtocolWrapper};
use crate::marshal::StructValue;
use crate::metadata::{MethodFlags, MethodMeta};

/// The chosen declaration and the positional arguments to call it with
#[derive(Debug)]
pub(crate) struct Resolved {
    pub meta: MethodMeta,
    pub args: Vec<JsValue>,
}

/// Whether `value` can be passed for `ty`. The strict pass only accepts
/// values of the matching kind; the lenient pass also accepts values the
/// marshaller converts.
fn accepts(value: &JsValue, ty: &TypeDescriptor, strict: bool) -> bool {
    let nullish = value.is_nullish();
    match ty {
        TypeDescriptor::Void | TypeDescriptor::Opaque(_) => false,
        TypeDescriptor::Bool => matches!(value, JsValue::Bool(_)) || (!strict && (nullish || matches!(value, JsValue::Number(_)))),
        TypeDescriptor::Int { .. } | TypeDescriptor::Float | TypeDescriptor::Double => {
            matches!(value, JsValue::Number(_) | JsValue::BigInt(_)) || (!strict && matches!(value, JsValue::Bool(_)))
        }
        TypeDescriptor::Selector => nullish || matches!(value, JsValue::String(_)),
        TypeDescriptor::CString => {
            nullish
                || matches!(value, JsValue::String(_))
                || value.as_object().is_some_and(|o| {
                    o.host_data::<Pointer>().is_some()
                        || o.host_data::<Reference>().is_some()
                        || matches!(o.kind(), ObjectKind::TypedArray(_) | ObjectKind::ArrayBuffer(_))
                })
        }
        TypeDescriptor::Id(_) | TypeDescriptor::Class | TypeDescriptor::Protocol => match value {
            JsValue::Object(o) => {
                if o.host_data::<ObjcWrapper>().is_some()
                    || o.host_data::<ClassWrapper>().is_some()
                    || o.host_data::<ProtocolWrapper>().is_some()
                {
                    return true;
                }
                match o.kind() {
                    ObjectKind::Array(_) | ObjectKind::Function(_) => true,
                    ObjectKind::Ordinary => !strict,
                    _ => false,
                }
            }
            _ => true,
        },
        TypeDescriptor::Block(_) => {
            nullish
                || value
                    .as_object()
                    .is_some_and(|o| o.is_function() || o.host_data::<ObjcWrapper>().is_some())
        }
        TypeDescriptor::FunctionPointer(_) => {
            nullish
                || value
                    .as_object()
                    .is_some_and(|o| o.is_function() || o.host_data::<Pointer>().is_some())
        }
        TypeDescriptor::Pointer(inner) | TypeDescriptor::IncompleteArray(inner) | TypeDescriptor::ConstantArray(inner, _) => {
            match value {
                JsValue::Undefined | JsValue::Null => true,
                JsValue::String(_) => matches!(**inner, TypeDescriptor::Int { .. } | TypeDescriptor::Void),
                JsValue::Object(o) => !o.is_function() && o.host_data::<ClassWrapper>().is_none(),
                _ => false,
            }
        }
        TypeDescriptor::Struct(layout) => match value.as_object() {
            Some(o) => match o.host_data::<StructValue>() {
                Some(sv) => sv.layout().name == layout.name,
                None => o.is_ordinary(),
            },
            None => false,
        },
    }
}

/// The single plain object a constructor was called with, as its key set
fn token_argument(args: &[JsValue]) -> Option<(&jsobjc_sdk::JsObject, FxHashSet<String>)> {
    let [JsValue::Object(object)] = args else {
        return None;
    };
    if !object.is_ordinary() {
        return None;
    }
    let keys: FxHashSet<String> = object.keys().iter().map(|k| k.to_string()).collect();
    (!keys.is_empty()).then_some((object, keys))
}

impl Bridge {
    /// Choose the overload of `candidates` that `args` calls.
    ///
    /// `kind` and `target` name the call site in resolution errors.
    /// `by_tokens` enables key-set matching of a single plain object.
    pub(crate) fn resolve_overload(
        &self,
        candidates: &[MethodMeta],
        args: &[JsValue],
        kind: &'static str,
        target: &str,
        by_tokens: bool,
    ) -> BridgeResult<Resolved> {
        let mut seen = FxHashSet::default();
        let candidates: Vec<&MethodMeta> = candidates
            .iter()
            .filter(|m| seen.insert(m.selector.clone()))
            .collect();

        if by_tokens {
            if let Some(resolved) = self.resolve_by_tokens(&candidates, args, target)? {
                return Ok(resolved);
            }
            if let Some((_, keys)) = token_argument(args) {
                return self.resolve_struct_initializer(&candidates, args, &keys, kind, target);
            }
        }
        if let [only] = candidates.as_slice() {
            // Arity and marshalling errors are reported against the only choice
            return Ok(Resolved {
                meta: (*only).clone(),
                args: args.to_vec(),
            });
        }

        let mut fitting = Vec::new();
        for meta in &candidates {
            let layout = self.method_layout(meta)?;
            let fixed = layout.explicit_arg_count();
            let error_slot = meta.flags.contains(MethodFlags::HAS_ERROR_OUT_PARAM)
                && layout
                    .explicit_slot(fixed.saturating_sub(1))
                    .is_some_and(|s| s.ty.is_object_out_pointer());
            let fits = args.len() == fixed
                || (error_slot && args.len() + 1 == fixed)
                || (meta.flags.contains(MethodFlags::VARIADIC) && args.len() >= fixed);
            if fits {
                let params: Vec<TypeDescriptor> = (0..fixed)
                    .filter_map(|i| layout.explicit_slot(i).map(|s| s.ty.clone()))
                    .collect();
                fitting.push((*meta, params));
            }
        }
        for strict in [true, false] {
            let chosen = fitting.iter().find(|(_, params)| {
                args.iter()
                    .zip(params.iter())
                    .all(|(value, ty)| accepts(value, ty, strict))
            });
            if let Some((meta, _)) = chosen {
                tracing::trace!(selector = &*meta.selector, strict, "resolved overload");
                return Ok(Resolved {
                    meta: (*meta).clone(),
                    args: args.to_vec(),
                });
            }
        }
        Err(BridgeError::Resolution {
            kind,
            target: target.to_string(),
            arity: args.len(),
        })
    }

    /// An initializer taking one struct whose field names include every key
    fn resolve_struct_initializer(
        &self,
        candidates: &[&MethodMeta],
        args: &[JsValue],
        keys: &FxHashSet<String>,
        kind: &'static str,
        target: &str,
    ) -> BridgeResult<Resolved> {
        for meta in candidates {
            let layout = self.method_layout(meta)?;
            if layout.explicit_arg_count() != 1 {
                continue;
            }
            let Some(TypeDescriptor::Struct(fields)) = layout.explicit_slot(0).map(|s| &s.ty) else {
                continue;
            };
            if keys.iter().all(|k| fields.field(k).is_some()) {
                tracing::trace!(selector = &*meta.selector, "object literal passed as struct");
                return Ok(Resolved {
                    meta: (*meta).clone(),
                    args: args.to_vec(),
                });
            }
        }
        Err(BridgeError::Resolution {
            kind,
            target: target.to_string(),
            arity: args.len(),
        })
    }

    fn resolve_by_tokens(
        &self,
        candidates: &[&MethodMeta],
        args: &[JsValue],
        target: &str,
    ) -> BridgeResult<Option<Resolved>> {
        let Some((object, keys)) = token_argument(args) else {
            return Ok(None);
        };
        let matches: Vec<(&MethodMeta, Vec<String>)> = candidates
            .iter()
            .filter_map(|meta| {
                let tokens = meta.initializer_tokens()?;
                let set: FxHashSet<String> = tokens.iter().cloned().collect();
                (!tokens.is_empty() && set == keys).then_some((*meta, tokens))
            })
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [(meta, tokens)] => Ok(Some(Resolved {
                meta: (*meta).clone(),
                args: tokens.iter().map(|t| object.get(t)).collect(),
            })),
            _ => Err(BridgeError::Resolution {
                kind: "unique initializer",
                target: target.to_string(),
                arity: args.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use jsobjc_sdk::JsObject;

    use super::*;
    use crate::bridge::BridgeOptions;

    fn plain(pairs: &[(&str, JsValue)]) -> JsValue {
        let object = JsObject::new();
        for (k, v) in pairs {
            object.set(k, v.clone());
        }
        JsValue::Object(object)
    }

    fn initializers() -> Vec<MethodMeta> {
        vec![
            MethodMeta::instance("initWithInt:", "@@:i"),
            MethodMeta::instance("initWithString:", "@@:@"),
            MethodMeta::instance("initWithX:andY:", "@@:ii"),
            MethodMeta::instance("init", "@@:"),
        ]
    }

    #[test]
    fn test_tokens_select_by_key_set() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let args = [plain(&[("andY", JsValue::from(2)), ("x", JsValue::from(1))])];
        let resolved = bridge
            .resolve_overload(&initializers(), &args, "initializer", "constructor", true)
            .unwrap();
        assert_eq!(&*resolved.meta.selector, "initWithX:andY:");
        assert_eq!(resolved.args, vec![JsValue::from(1), JsValue::from(2)]);
    }

    #[test]
    fn test_partial_key_sets_do_not_match() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        for args in [
            [plain(&[("x", JsValue::from(1))])],
            [plain(&[("x", JsValue::from(1)), ("andY", JsValue::from(2)), ("z", JsValue::from(3))])],
        ] {
            let err = bridge
                .resolve_overload(&initializers(), &args, "initializer", "constructor", true)
                .unwrap_err();
            assert_eq!(err.error_name(), "ResolutionError");
            assert!(err.to_string().starts_with("No initializer found"), "{err}");
        }
    }

    #[test]
    fn test_unmatched_keys_can_fill_a_struct_parameter() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let mut candidates = initializers();
        candidates.push(MethodMeta::instance("initWithOrigin:", "@@:{Vec2=\"x\"d\"y\"d}"));
        let args = [plain(&[("y", JsValue::from(2)), ("x", JsValue::from(1))])];
        let resolved = bridge
            .resolve_overload(&candidates, &args, "initializer", "constructor", true)
            .unwrap();
        assert_eq!(&*resolved.meta.selector, "initWithOrigin:");
        assert_eq!(resolved.args, args.to_vec());

        // A key the struct lacks is still an error
        let args = [plain(&[("x", JsValue::from(1)), ("w", JsValue::from(2))])];
        let err = bridge
            .resolve_overload(&candidates, &args, "initializer", "constructor", true)
            .unwrap_err();
        assert_eq!(err.error_name(), "ResolutionError");
    }

    #[test]
    fn test_positional_prefers_strict_shape() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let by_number = bridge
            .resolve_overload(&initializers(), &[JsValue::from(5)], "initializer", "constructor", true)
            .unwrap();
        assert_eq!(&*by_number.meta.selector, "initWithInt:");
        let by_string = bridge
            .resolve_overload(&initializers(), &[JsValue::from("s")], "initializer", "constructor", true)
            .unwrap();
        assert_eq!(&*by_string.meta.selector, "initWithString:");
    }

    #[test]
    fn test_no_fitting_arity_is_a_resolution_error() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let args = [JsValue::from(1), JsValue::from(2), JsValue::from(3)];
        let err = bridge
            .resolve_overload(&initializers(), &args, "initializer", "constructor", true)
            .unwrap_err();
        assert_eq!(err.error_name(), "ResolutionError");
        assert!(err.to_string().contains("arguments count: 3"));
    }

    #[test]
    fn test_duplicate_token_sets_are_ambiguous() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let candidates = vec![
            MethodMeta::instance("initWithValue:", "@@:i"),
            MethodMeta::instance("initValue:", "@@:@"),
        ];
        let args = [plain(&[("value", JsValue::from(1))])];
        let err = bridge
            .resolve_overload(&candidates, &args, "initializer", "constructor", true)
            .unwrap_err();
        assert!(err.to_string().starts_with("No unique initializer found"));
    }
}
