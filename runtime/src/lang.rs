//! Builtin classes
//!
//! `java/lang/Object`, `java/lang/String`, the primitive type classes and the
//! array classes over them. All are submitted to the global table through
//! [`register_class!`](crate::register_class).

use std::mem::size_of;
use std::sync::Arc;

use crate::abi::{jboolean, jint, jsize, JEnv, JObject, JNI_FALSE, JNI_TRUE};
use crate::descriptor::Class;
use crate::object::{ArrayObject, Object, StringObject, STRING_CLASSNAME, STRING_CLASSPATH};
use crate::safety::{report_violation, SafetyViolation};

pub const OBJECT_CLASSNAME: &str = "Object";
pub const OBJECT_ARRAY: &str = "[Ljava/lang/Object;";

/// `(class name, descriptor char, byte width)` of every primitive type
pub const PRIMITIVES: [(&str, char, usize); 8] = [
    ("boolean", 'Z', 1),
    ("byte", 'B', 1),
    ("char", 'C', 2),
    ("short", 'S', 2),
    ("int", 'I', 4),
    ("long", 'J', 8),
    ("float", 'F', 4),
    ("double", 'D', 8),
];

/// Element class name and width for an array class name.
///
/// ```
/// use jnishim_runtime::lang::element_type;
///
/// assert_eq!(element_type("[J"), Some(("long".to_string(), 8)));
/// assert_eq!(element_type("[Ldemo/Point;"), Some(("demo/Point".to_string(), 8)));
/// assert_eq!(element_type("I"), None);
/// ```
pub fn element_type(array_class: &str) -> Option<(String, jsize)> {
    let element = array_class.strip_prefix('[')?;
    if let Some(name) = element.strip_prefix('L').and_then(|e| e.strip_suffix(';')) {
        return Some((name.to_string(), size_of::<JObject>() as jsize));
    }
    if element.starts_with('[') {
        return Some((element.to_string(), size_of::<JObject>() as jsize));
    }
    let mut chars = element.chars();
    let descriptor = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    PRIMITIVES
        .iter()
        .find(|(_, d, _)| *d == descriptor)
        .map(|(name, _, width)| (name.to_string(), *width as jsize))
}

// ============================================================================
// java/lang/Object
// ============================================================================

fn object_hash_code(_env: JEnv, this: JObject) -> jint {
    let addr = this.0 as usize as u64;
    (addr ^ (addr >> 32)) as jint
}

pub fn object_class() -> Arc<Class> {
    Class::build_for::<Object>("java/lang", OBJECT_CLASSNAME, |c| {
        c.virtual_method("hashCode", "()I", object_hash_code);
    })
}

// ============================================================================
// java/lang/String
// ============================================================================

fn receiver_string<'a>(this: JObject, function: &str) -> Option<&'a StringObject> {
    // SAFETY: a non-null receiver points at a live instance.
    let string = unsafe { this.downcast_ref::<StringObject>() };
    if string.is_none() {
        report_violation(SafetyViolation::ClassMismatch, function, "receiver is not a String");
    }
    string
}

fn string_length(_env: JEnv, this: JObject) -> jint {
    receiver_string(this, "String.length")
        .map(|s| s.utf16_len() as jint)
        .unwrap_or(0)
}

fn string_is_empty(_env: JEnv, this: JObject) -> jboolean {
    match receiver_string(this, "String.isEmpty") {
        Some(s) if s.as_c_str().to_bytes().is_empty() => JNI_TRUE,
        Some(_) => JNI_FALSE,
        None => JNI_TRUE,
    }
}

/// `s[0]*31^(n-1) + ... + s[n-1]` over UTF-16 units
fn string_hash_code(_env: JEnv, this: JObject) -> jint {
    receiver_string(this, "String.hashCode")
        .map(|s| {
            s.as_c_str()
                .to_string_lossy()
                .encode_utf16()
                .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
        })
        .unwrap_or(0)
}

pub fn string_class() -> Arc<Class> {
    Class::build_for::<StringObject>(STRING_CLASSPATH, STRING_CLASSNAME, |c| {
        c.virtual_method("length", "()I", string_length)
            .virtual_method("isEmpty", "()Z", string_is_empty)
            .virtual_method("hashCode", "()I", string_hash_code);
    })
}

crate::register_class!(object_class);
crate::register_class!(string_class);

// ============================================================================
// Primitive and array classes
// ============================================================================

macro_rules! primitive_classes {
    ($($class_fn:ident, $array_fn:ident => $name:literal, $array:literal, $width:expr;)*) => {
        $(
            pub fn $class_fn() -> Arc<Class> {
                Class::build("", $name, $width, |_| {})
            }

            pub fn $array_fn() -> Arc<Class> {
                Class::build("", $array, size_of::<ArrayObject>(), |_| {})
            }

            crate::register_class!($class_fn);
            crate::register_class!($array_fn);
        )*
    };
}

primitive_classes! {
    boolean_class, boolean_array_class => "boolean", "[Z", 1;
    byte_class, byte_array_class => "byte", "[B", 1;
    char_class, char_array_class => "char", "[C", 2;
    short_class, short_array_class => "short", "[S", 2;
    int_class, int_array_class => "int", "[I", 4;
    long_class, long_array_class => "long", "[J", 8;
    float_class, float_array_class => "float", "[F", 4;
    double_class, double_array_class => "double", "[D", 8;
}

pub fn object_array_class() -> Arc<Class> {
    Class::build("", OBJECT_ARRAY, size_of::<ArrayObject>(), |_| {})
}

crate::register_class!(object_array_class);

#[cfg(all(test, not(feature = "panic-on-safety-violation")))]
mod tests {
    use super::*;
    use crate::abi::Value;
    use crate::dispatch::CallFrame;

    fn leak(class: Arc<Class>) -> &'static Class {
        &**Box::leak(Box::new(class))
    }

    fn call(class: &Class, name: &str, sig: &str, this: JObject) -> Option<Value> {
        let method = class.find_method(name, sig).unwrap();
        unsafe { method.invoke_array(CallFrame::virtual_call(JEnv::null(), this), std::ptr::null()) }
    }

    #[test]
    fn test_string_methods() {
        let class = leak(string_class());
        let hello = StringObject::new_owned(class, "h\u{e9}llo").unwrap();
        let this = JObject::from(hello.as_handle());

        assert_eq!(call(class, "length", "()I", this), Some(Value::Int(5)));
        assert_eq!(call(class, "isEmpty", "()Z", this), Some(Value::Boolean(JNI_FALSE)));

        let empty = StringObject::new_owned(class, "").unwrap();
        let this = JObject::from(empty.as_handle());
        assert_eq!(call(class, "isEmpty", "()Z", this), Some(Value::Boolean(JNI_TRUE)));
        assert_eq!(call(class, "hashCode", "()I", this), Some(Value::Int(0)));
    }

    #[test]
    fn test_string_hash_matches_managed_definition() {
        let class = leak(string_class());
        let s = StringObject::new_owned(class, "ab").unwrap();
        let this = JObject::from(s.as_handle());
        assert_eq!(call(class, "hashCode", "()I", this), Some(Value::Int(97 * 31 + 98)));
    }

    #[test]
    fn test_non_string_receiver_is_rejected() {
        let strings = leak(string_class());
        let objects = leak(object_class());
        let mut plain = unsafe { Object::new(objects) };
        assert_eq!(
            call(strings, "length", "()I", JObject::from_instance(&mut plain)),
            Some(Value::Int(0))
        );
        assert_eq!(call(strings, "length", "()I", JObject::null()), Some(Value::Int(0)));
    }

    #[test]
    fn test_object_hash_is_stable() {
        let class = leak(object_class());
        let mut obj = unsafe { Object::new(class) };
        let this = JObject::from_instance(&mut obj);
        let first = call(class, "hashCode", "()I", this);
        assert_eq!(first, call(class, "hashCode", "()I", this));
    }

    #[test]
    fn test_element_types() {
        assert_eq!(element_type("[Z"), Some(("boolean".to_string(), 1)));
        assert_eq!(element_type("[D"), Some(("double".to_string(), 8)));
        assert_eq!(element_type(OBJECT_ARRAY), Some(("java/lang/Object".to_string(), 8)));
        assert_eq!(element_type("[[I"), Some(("[I".to_string(), 8)));
        assert_eq!(element_type("[IJ"), None);
        assert_eq!(element_type("[Q"), None);
    }

    #[test]
    fn test_array_classes_are_arrays() {
        assert!(int_array_class().is_array());
        assert!(object_array_class().is_array());
        assert!(!int_class().is_array());
        assert_eq!(long_class().instance_size, 8);
    }
}
