//! Host-side values addressed by guest handles.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::closure::ClosureRecord;
use crate::error::HostError;

/// Upcast helpers for [`HostObject`] downcasting.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn into_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// An opaque host object the guest can hold a handle to.
pub trait HostObject: AsAny + fmt::Debug {
    /// Constructor name reported by `debug_string` and type errors.
    fn class_name(&self) -> &str;
}

/// A value living on the host side of the boundary.
#[derive(Debug, Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Bytes(Rc<[u8]>),
    Words(Rc<[u32]>),
    Object(Rc<dyn HostObject>),
    Function(Rc<ClosureRecord>),
    Error(Rc<HostError>),
}

impl HostValue {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        HostValue::String(s.into())
    }

    pub fn object<T: HostObject>(obj: T) -> Self {
        HostValue::Object(Rc::new(obj))
    }

    pub fn error(err: HostError) -> Self {
        HostValue::Error(Rc::new(err))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// True for values with identity: objects, functions, errors and typed
    /// arrays.
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            HostValue::Object(_)
                | HostValue::Function(_)
                | HostValue::Error(_)
                | HostValue::Bytes(_)
                | HostValue::Words(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_words(&self) -> Option<&[u32]> {
        match self {
            HostValue::Words(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Rc<ClosureRecord>> {
        match self {
            HostValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Downcast an object value to a concrete host type.
    pub fn downcast<T: HostObject>(&self) -> Option<Rc<T>> {
        match self {
            HostValue::Object(obj) => Rc::clone(obj).into_any_rc().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Borrowing variant of [`HostValue::downcast`].
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        match self {
            HostValue::Object(obj) => (**obj).as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Name used in type errors.
    pub fn type_name(&self) -> &str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Bytes(_) => "Uint8Array",
            HostValue::Words(_) => "Uint32Array",
            HostValue::Object(obj) => obj.class_name(),
            HostValue::Function(_) => "function",
            HostValue::Error(err) => err.name.as_str(),
        }
    }

    /// Human-readable rendering used by the `debug_string` intrinsic.
    pub fn debug_string(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".to_string(),
            HostValue::Null => "null".to_string(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => format_number(*n),
            HostValue::String(s) => format!("{s:?}"),
            HostValue::Bytes(b) => format!("Uint8Array({})", b.len()),
            HostValue::Words(w) => format!("Uint32Array({})", w.len()),
            HostValue::Object(obj) => obj.class_name().to_string(),
            HostValue::Function(f) => format!("Function(closure {})", f.id()),
            HostValue::Error(err) => format!("{}: {}", err.name, err.message),
        }
    }

    /// Identity comparison: same primitive value or same allocation.
    pub fn same_value(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) | (HostValue::Null, HostValue::Null) => {
                true
            }
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Bytes(a), HostValue::Bytes(b)) => Rc::ptr_eq(a, b),
            (HostValue::Words(a), HostValue::Words(b)) => Rc::ptr_eq(a, b),
            (HostValue::Object(a), HostValue::Object(b)) => {
                std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
            }
            (HostValue::Function(a), HostValue::Function(b)) => Rc::ptr_eq(a, b),
            (HostValue::Error(a), HostValue::Error(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.into())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s.into())
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<HostError> for HostValue {
    fn from(err: HostError) -> Self {
        HostValue::error(err)
    }
}

/// Render a number the way a script host prints it: integral values have
/// no fractional part.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        (if n > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Canvas {
        width: u32,
    }

    impl HostObject for Canvas {
        fn class_name(&self) -> &str {
            "HTMLCanvasElement"
        }
    }

    #[test]
    fn numbers_render_like_script_values() {
        assert_eq!(HostValue::Number(42.0).debug_string(), "42");
        assert_eq!(HostValue::Number(-0.5).debug_string(), "-0.5");
        assert_eq!(HostValue::Number(f64::NAN).debug_string(), "NaN");
        assert_eq!(HostValue::Number(f64::NEG_INFINITY).debug_string(), "-Infinity");
    }

    #[test]
    fn strings_render_quoted() {
        assert_eq!(HostValue::from("hi").debug_string(), "\"hi\"");
    }

    #[test]
    fn objects_downcast_to_their_concrete_type() {
        let value = HostValue::object(Canvas { width: 640 });
        assert_eq!(value.downcast_ref::<Canvas>().map(|c| c.width), Some(640));
        let rc = value.downcast::<Canvas>().unwrap();
        assert_eq!(rc.width, 640);
        assert_eq!(value.debug_string(), "HTMLCanvasElement");
        assert!(value.is_object());
    }

    #[test]
    fn same_value_compares_identity_for_objects() {
        let a = HostValue::object(Canvas { width: 1 });
        let b = HostValue::object(Canvas { width: 1 });
        assert!(a.same_value(&a.clone()));
        assert!(!a.same_value(&b));
        assert!(HostValue::from("x").same_value(&HostValue::from("x")));
    }
}
