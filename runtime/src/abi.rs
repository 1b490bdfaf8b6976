//! Native-interface value types
//!
//! Primitive aliases, opaque handles and the packed argument slot exactly as
//! foreign modules see them. Handles are `#[repr(transparent)]` over raw
//! pointers so they can be passed through `extern "C"` boundaries unchanged.

#![allow(non_camel_case_types)]

use crate::descriptor::{Class, FieldId, ManagedMethod};
use crate::env::JniEnv;
use crate::object::{ArrayObject, Object, ObjectLayout, StringObject};

pub type jboolean = u8;
pub type jbyte = i8;
pub type jchar = u16;
pub type jshort = i16;
pub type jint = i32;
pub type jlong = i64;
pub type jfloat = f32;
pub type jdouble = f64;
pub type jsize = jint;

pub const JNI_FALSE: jboolean = 0;
pub const JNI_TRUE: jboolean = 1;

pub const JNI_OK: jint = 0;
pub const JNI_ERR: jint = -1;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident => $target:ty) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub $target);

        impl $name {
            pub const fn null() -> Self {
                $name(std::ptr::null_mut())
            }

            pub fn is_null(self) -> bool {
                self.0.is_null()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::null()
            }
        }
    };
}

handle!(
    /// Reference to any instance; points at its [`Object`] header.
    JObject => *mut Object
);
handle!(
    /// Reference to a registered [`Class`] descriptor.
    JClass => *mut Class
);
handle!(JString => *mut StringObject);
handle!(JArray => *mut ArrayObject);
handle!(
    /// Environment handle, the first prelude parameter of every method.
    JEnv => *mut JniEnv
);
handle!(
    /// Method id handed to foreign modules.
    JMethodId => *mut ManagedMethod
);
handle!(JFieldId => *mut FieldId);

impl JObject {
    /// Handle spanning the whole of `instance`, so its fields may be written
    /// through it.
    pub fn from_instance<T: ObjectLayout>(instance: &mut T) -> Self {
        JObject(instance as *mut T as *mut Object)
    }

    /// The instance header only; fields are reached through the handle itself.
    ///
    /// # Safety
    /// The handle must be null or point at a live instance.
    pub unsafe fn as_ref<'a>(self) -> Option<&'a Object> {
        self.0.as_ref()
    }

    /// # Safety
    /// See [`JObject::as_ref`].
    pub unsafe fn class(self) -> Option<&'static Class> {
        self.as_ref().map(Object::class)
    }

    /// View the instance as the concrete layout `T`, if its class tag allows.
    ///
    /// # Safety
    /// See [`JObject::as_ref`]; the instance must outlive `'a`.
    pub unsafe fn downcast_ref<'a, T: ObjectLayout>(self) -> Option<&'a T> {
        let class = self.class()?;
        if T::accepts(class) {
            Some(&*(self.0 as *const T))
        } else {
            None
        }
    }

    /// # Safety
    /// See [`JObject::downcast_ref`]; the handle must have been made from a
    /// unique borrow and no other reference to the instance may be live.
    pub unsafe fn downcast_mut<'a, T: ObjectLayout>(self) -> Option<&'a mut T> {
        let class = self.class()?;
        if T::accepts(class) {
            Some(&mut *(self.0 as *mut T))
        } else {
            None
        }
    }
}

impl JClass {
    pub fn from_class(class: &Class) -> Self {
        JClass(class as *const Class as *mut Class)
    }

    /// # Safety
    /// The handle must be null or point at a class that outlives `'a`.
    pub unsafe fn as_ref<'a>(self) -> Option<&'a Class> {
        self.0.as_ref()
    }
}

impl JEnv {
    pub fn from_env(env: &JniEnv) -> Self {
        JEnv(env as *const JniEnv as *mut JniEnv)
    }

    /// # Safety
    /// The handle must be null or point at an environment that outlives `'a`.
    pub unsafe fn as_ref<'a>(self) -> Option<&'a JniEnv> {
        self.0.as_ref()
    }
}

impl JMethodId {
    pub fn from_method(method: &ManagedMethod) -> Self {
        JMethodId(method as *const ManagedMethod as *mut ManagedMethod)
    }

    /// # Safety
    /// The handle must be null or point at a method of a class that outlives `'a`.
    pub unsafe fn as_ref<'a>(self) -> Option<&'a ManagedMethod> {
        self.0.as_ref()
    }
}

impl JFieldId {
    pub fn from_field(field: &FieldId) -> Self {
        JFieldId(field as *const FieldId as *mut FieldId)
    }

    /// # Safety
    /// The handle must be null or point at a field of a class that outlives `'a`.
    pub unsafe fn as_ref<'a>(self) -> Option<&'a FieldId> {
        self.0.as_ref()
    }
}

impl From<JString> for JObject {
    fn from(s: JString) -> Self {
        JObject(s.0 as *mut Object)
    }
}

impl From<JArray> for JObject {
    fn from(a: JArray) -> Self {
        JObject(a.0 as *mut Object)
    }
}

/// One slot of a packed argument array.
///
/// Every slot is eight bytes wide whatever member was written.
#[repr(C)]
#[derive(Clone, Copy)]
pub union JValue {
    pub z: jboolean,
    pub b: jbyte,
    pub c: jchar,
    pub s: jshort,
    pub i: jint,
    pub j: jlong,
    pub f: jfloat,
    pub d: jdouble,
    pub l: JObject,
}

impl Default for JValue {
    fn default() -> Self {
        JValue { j: 0 }
    }
}

impl std::fmt::Debug for JValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SAFETY: every constructor initialises all eight bytes.
        write!(f, "JValue({:#018x})", unsafe { self.j })
    }
}

impl From<Value> for JValue {
    fn from(value: Value) -> Self {
        let mut slot = JValue::default();
        match value {
            Value::Boolean(v) => slot.z = v,
            Value::Byte(v) => slot.b = v,
            Value::Char(v) => slot.c = v,
            Value::Short(v) => slot.s = v,
            Value::Int(v) => slot.i = v,
            Value::Long(v) => slot.j = v,
            Value::Float(v) => slot.f = v,
            Value::Double(v) => slot.d = v,
            Value::Object(v) => slot.l = v,
        }
        slot
    }
}

/// A single typed value crossing the call boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Boolean(jboolean),
    Byte(jbyte),
    Char(jchar),
    Short(jshort),
    Int(jint),
    Long(jlong),
    Float(jfloat),
    Double(jdouble),
    Object(JObject),
}

impl Value {
    pub fn as_boolean(self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(v != JNI_FALSE),
            _ => None,
        }
    }

    pub fn as_int(self) -> Option<jint> {
        match self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(self) -> Option<jlong> {
        match self {
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(self) -> Option<jfloat> {
        match self {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double(self) -> Option<jdouble> {
        match self {
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(self) -> Option<JObject> {
        match self {
            Value::Object(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<JValue>(), 8);
        assert_eq!(std::mem::size_of::<JObject>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn test_narrow_value_zeroes_slot() {
        let slot = JValue::from(Value::Boolean(JNI_TRUE));
        assert_eq!(unsafe { slot.j }, 1);

        let slot = JValue::from(Value::Int(-1));
        assert_eq!(unsafe { slot.i }, -1);
        assert_eq!(unsafe { slot.j } as u64 >> 32, 0);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::Int(7).as_long(), None);
        assert_eq!(Value::Boolean(JNI_TRUE).as_boolean(), Some(true));
        assert!(Value::Object(JObject::null()).as_object().unwrap().is_null());
    }
}
