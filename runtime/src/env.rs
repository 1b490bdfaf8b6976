//! Host call surface
//!
//! [`JniEnv`] is what the `JEnv` prelude handle points at. It exposes lookups
//! against a sealed [`ClassTable`] and checked calls through either stored
//! entry point of a [`ManagedMethod`]. Lookups follow the native-interface
//! convention of returning a null handle on a miss; calls and accesses return
//! a `Result`.
//!
//! The first word of a `JniEnv` points at a [`NativeInterface`] function
//! table, which is how foreign modules call back into the host through the
//! opaque environment pointer.

use std::ffi::c_void;
use std::sync::OnceLock;

use jnishim_plugin::{NativeInterface, INTERFACE_VERSION};

use crate::abi::{
    jint, jsize, JArray, JClass, JEnv, JFieldId, JMethodId, JObject, JString, JValue, Value,
    JNI_ERR, JNI_OK,
};
use crate::access::{self, AccessError};
use crate::descriptor::{Class, FieldId, FieldKind, ManagedMethod};
use crate::dispatch::{ArgCursor, CallFrame, CallShape};
use crate::lang;
use crate::object::{
    ArrayObject, Object, ObjectError, ObjectLayout, StringObject, STRING_CLASSNAME, STRING_CLASSPATH,
};
use crate::registry::{self, ClassTable, RegistryError};
use crate::safety::{report_violation, SafetyViolation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A required handle was null
    NullHandle(&'static str),
    ShapeMismatch {
        method: String,
        expected: CallShape,
        actual: CallShape,
    },
    ArityMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },
    /// Method is not declared by the class it was called through
    ClassMismatch { method: String, class: String },
    /// Class is not present in the table
    UnknownClass(String),
    Object(ObjectError),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::NullHandle(what) => write!(f, "null {} handle", what),
            CallError::ShapeMismatch {
                method,
                expected,
                actual,
            } => write!(
                f,
                "'{}' is a {} method, called as {}",
                method, actual, expected
            ),
            CallError::ArityMismatch {
                method,
                expected,
                actual,
            } => write!(
                f,
                "'{}' takes {} argument(s), {} supplied",
                method, expected, actual
            ),
            CallError::ClassMismatch { method, class } => {
                write!(f, "'{}' is not declared by {}", method, class)
            }
            CallError::UnknownClass(name) => write!(f, "unknown class '{}'", name),
            CallError::Object(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CallError {}

impl From<ObjectError> for CallError {
    fn from(e: ObjectError) -> Self {
        CallError::Object(e)
    }
}

/// Environment over one sealed class table.
#[repr(C)]
pub struct JniEnv {
    functions: &'static NativeInterface,
    table: &'static ClassTable,
}

static GLOBAL_ENV: OnceLock<JniEnv> = OnceLock::new();

impl JniEnv {
    pub fn new(table: &'static ClassTable) -> Self {
        JniEnv {
            functions: &NATIVE_INTERFACE,
            table,
        }
    }

    /// Environment over [`registry::global`]
    pub fn global() -> Result<&'static JniEnv, RegistryError> {
        let table = registry::global()?;
        Ok(GLOBAL_ENV.get_or_init(|| JniEnv::new(table)))
    }

    pub fn table(&self) -> &'static ClassTable {
        self.table
    }

    /// Handle passed as the first prelude parameter
    pub fn handle(&self) -> JEnv {
        JEnv::from_env(self)
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// Class by fully qualified name; null if absent
    pub fn find_class(&self, name: &str) -> JClass {
        match self.table.find(name) {
            Some(class) => class.handle(),
            None => {
                log::debug!("find_class: '{}' not found", name);
                JClass::null()
            }
        }
    }

    /// Instance method (virtual or non-virtual shape); null if absent
    pub fn get_method_id(&self, class: JClass, name: &str, signature: &str) -> JMethodId {
        self.method_id(class, name, signature, |shape| shape != CallShape::Static)
    }

    pub fn get_static_method_id(&self, class: JClass, name: &str, signature: &str) -> JMethodId {
        self.method_id(class, name, signature, |shape| shape == CallShape::Static)
    }

    pub fn get_field_id(&self, class: JClass, name: &str, signature: &str) -> JFieldId {
        self.field_id(class, name, signature, FieldKind::Instance)
    }

    pub fn get_static_field_id(&self, class: JClass, name: &str, signature: &str) -> JFieldId {
        self.field_id(class, name, signature, FieldKind::Static)
    }

    pub fn get_object_class(&self, obj: JObject) -> JClass {
        // SAFETY: a non-null object handle points at a live header.
        match unsafe { obj.as_ref() } {
            Some(object) => object.class().handle(),
            None => {
                report_violation(SafetyViolation::NullHandle, "get_object_class", "null object");
                JClass::null()
            }
        }
    }

    fn method_id(
        &self,
        class: JClass,
        name: &str,
        signature: &str,
        accept: impl Fn(CallShape) -> bool,
    ) -> JMethodId {
        // SAFETY: class handles are only minted from live descriptors.
        let Some(class) = (unsafe { class.as_ref() }) else {
            report_violation(SafetyViolation::NullHandle, "get_method_id", name);
            return JMethodId::null();
        };
        class
            .managed_methods
            .iter()
            .find(|m| m.name == name && m.signature == signature && accept(m.shape))
            .map(ManagedMethod::id)
            .unwrap_or_default()
    }

    fn field_id(&self, class: JClass, name: &str, signature: &str, kind: FieldKind) -> JFieldId {
        // SAFETY: class handles are only minted from live descriptors.
        let Some(class) = (unsafe { class.as_ref() }) else {
            report_violation(SafetyViolation::NullHandle, "get_field_id", name);
            return JFieldId::null();
        };
        class
            .fields
            .iter()
            .find(|f| f.name == name && f.signature == signature && f.kind == kind)
            .map(FieldId::id)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    /// Call a virtual method with packed arguments.
    pub fn call_method_a(
        &self,
        obj: JObject,
        method: JMethodId,
        args: &[JValue],
    ) -> Result<Option<Value>, CallError> {
        let method = checked_method(method, CallShape::Virtual)?;
        non_null_receiver(obj)?;
        check_arity(method, args.len())?;
        let frame = CallFrame::virtual_call(self.handle(), obj);
        // SAFETY: arity checked against the slice length.
        Ok(unsafe { method.invoke_array(frame, args.as_ptr()) })
    }

    /// Call a virtual method reading arguments from a cursor.
    pub fn call_method_v(
        &self,
        obj: JObject,
        method: JMethodId,
        args: &mut dyn ArgCursor,
    ) -> Result<Option<Value>, CallError> {
        let method = checked_method(method, CallShape::Virtual)?;
        non_null_receiver(obj)?;
        Ok(method.invoke_variadic(CallFrame::virtual_call(self.handle(), obj), args))
    }

    pub fn call_static_method_a(
        &self,
        class: JClass,
        method: JMethodId,
        args: &[JValue],
    ) -> Result<Option<Value>, CallError> {
        let method = checked_method(method, CallShape::Static)?;
        check_declared_by(method, class)?;
        check_arity(method, args.len())?;
        let frame = CallFrame::static_call(self.handle(), class);
        // SAFETY: arity checked against the slice length.
        Ok(unsafe { method.invoke_array(frame, args.as_ptr()) })
    }

    pub fn call_static_method_v(
        &self,
        class: JClass,
        method: JMethodId,
        args: &mut dyn ArgCursor,
    ) -> Result<Option<Value>, CallError> {
        let method = checked_method(method, CallShape::Static)?;
        check_declared_by(method, class)?;
        Ok(method.invoke_variadic(CallFrame::static_call(self.handle(), class), args))
    }

    /// Call the implementation declared by `class`, bypassing the receiver's
    /// own class.
    pub fn call_nonvirtual_method_a(
        &self,
        obj: JObject,
        class: JClass,
        method: JMethodId,
        args: &[JValue],
    ) -> Result<Option<Value>, CallError> {
        let method = checked_method(method, CallShape::NonVirtual)?;
        non_null_receiver(obj)?;
        check_declared_by(method, class)?;
        check_arity(method, args.len())?;
        let frame = CallFrame::nonvirtual_call(self.handle(), obj, class);
        // SAFETY: arity checked against the slice length.
        Ok(unsafe { method.invoke_array(frame, args.as_ptr()) })
    }

    pub fn call_nonvirtual_method_v(
        &self,
        obj: JObject,
        class: JClass,
        method: JMethodId,
        args: &mut dyn ArgCursor,
    ) -> Result<Option<Value>, CallError> {
        let method = checked_method(method, CallShape::NonVirtual)?;
        non_null_receiver(obj)?;
        check_declared_by(method, class)?;
        let frame = CallFrame::nonvirtual_call(self.handle(), obj, class);
        Ok(method.invoke_variadic(frame, args))
    }

    // ------------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------------

    /// # Safety
    /// `obj` must be null or live; `T` must be the field's type.
    pub unsafe fn get_field<T: Copy>(&self, obj: JObject, field: JFieldId) -> Result<T, AccessError> {
        let field = field_ref(field, "get_field")?;
        access::get_field(field, obj)
    }

    /// # Safety
    /// As [`JniEnv::get_field`]; `obj` must also have been made with
    /// [`JObject::from_instance`].
    pub unsafe fn set_field<T: Copy>(
        &self,
        obj: JObject,
        field: JFieldId,
        value: T,
    ) -> Result<(), AccessError> {
        let field = field_ref(field, "set_field")?;
        access::set_field(field, obj, value)
    }

    /// # Safety
    /// `T` must be the field's type.
    pub unsafe fn get_static_field<T: Copy>(&self, field: JFieldId) -> Result<T, AccessError> {
        let field = field_ref(field, "get_static_field")?;
        access::get_field(field, JObject::null())
    }

    /// # Safety
    /// As [`JniEnv::get_static_field`].
    pub unsafe fn set_static_field<T: Copy>(&self, field: JFieldId, value: T) -> Result<(), AccessError> {
        let field = field_ref(field, "set_static_field")?;
        access::set_field(field, JObject::null(), value)
    }

    // ------------------------------------------------------------------------
    // Strings and arrays
    // ------------------------------------------------------------------------

    /// New `java/lang/String` owned by the caller.
    pub fn new_string_utf(&self, text: &str) -> Result<Box<StringObject>, CallError> {
        let class = self.class_ref(STRING_CLASSPATH, STRING_CLASSNAME)?;
        Ok(StringObject::new_owned(class, text)?)
    }

    /// UTF-16 length of a string, 0 for null or a non-string
    pub fn get_string_length(&self, string: JString) -> jsize {
        // SAFETY: a non-null handle points at a live instance.
        match unsafe { checked_instance::<StringObject>(string.into(), "get_string_length") } {
            Ok(s) => s.utf16_len() as jsize,
            Err(_) => 0,
        }
    }

    /// New zeroed array of class `array_class` (e.g. `[I`) owned by the caller.
    pub fn new_array(&self, array_class: &str, count: jsize) -> Result<Box<ArrayObject>, CallError> {
        let (element, width) = lang::element_type(array_class)
            .ok_or_else(|| CallError::UnknownClass(array_class.to_string()))?;
        let array = self.class_by_name(array_class)?;
        let element = self.class_by_name(&element)?;
        Ok(ArrayObject::new(array, element, count, width)?)
    }

    /// Element count, 0 for null or a non-array
    pub fn get_array_length(&self, array: JArray) -> jsize {
        // SAFETY: a non-null handle points at a live instance.
        match unsafe { checked_instance::<ArrayObject>(array.into(), "get_array_length") } {
            Ok(a) => a.len(),
            Err(_) => 0,
        }
    }

    /// # Safety
    /// `array` must be null or live; every bit pattern of its element width
    /// must be a valid `T`.
    pub unsafe fn get_array_region<T: Copy>(
        &self,
        array: JArray,
        start: jsize,
        out: &mut [T],
    ) -> Result<(), AccessError> {
        let array = checked_instance::<ArrayObject>(array.into(), "get_array_region")?;
        access::get_region(array, start, out)
    }

    /// # Safety
    /// `array` must be null or live, made with [`ArrayObject::as_handle`], and
    /// not otherwise borrowed.
    pub unsafe fn set_array_region<T: Copy>(
        &self,
        array: JArray,
        start: jsize,
        values: &[T],
    ) -> Result<(), AccessError> {
        let handle = JObject::from(array);
        checked_instance::<ArrayObject>(handle, "set_array_region")?;
        let Some(array) = handle.downcast_mut::<ArrayObject>() else {
            return Err(AccessError::MissingInstance("array".to_string()));
        };
        access::set_region(array, start, values)
    }

    fn class_ref(&self, classpath: &str, classname: &str) -> Result<&'static Class, CallError> {
        self.table
            .get(classpath, classname)
            .map(|class| &**class)
            .ok_or_else(|| CallError::UnknownClass(format!("{}/{}", classpath, classname)))
    }

    fn class_by_name(&self, name: &str) -> Result<&'static Class, CallError> {
        self.table
            .find(name)
            .map(|class| &**class)
            .ok_or_else(|| CallError::UnknownClass(name.to_string()))
    }
}

impl std::fmt::Debug for JniEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JniEnv")
            .field("version", &self.functions.version)
            .field("classes", &self.table.len())
            .finish()
    }
}

fn checked_method<'a>(method: JMethodId, expected: CallShape) -> Result<&'a ManagedMethod, CallError> {
    // SAFETY: method ids are only minted from live descriptors.
    let method = unsafe { method.as_ref() }.ok_or(CallError::NullHandle("method"))?;
    if method.shape != expected {
        return Err(CallError::ShapeMismatch {
            method: method.name.to_string(),
            expected,
            actual: method.shape,
        });
    }
    Ok(method)
}

fn check_arity(method: &ManagedMethod, supplied: usize) -> Result<(), CallError> {
    if method.arg_count() != supplied {
        return Err(CallError::ArityMismatch {
            method: method.name.to_string(),
            expected: method.arg_count(),
            actual: supplied,
        });
    }
    Ok(())
}

fn non_null_receiver(obj: JObject) -> Result<(), CallError> {
    if obj.is_null() {
        report_violation(SafetyViolation::NullHandle, "call", "null receiver");
        return Err(CallError::NullHandle("receiver"));
    }
    Ok(())
}

fn check_declared_by(method: &ManagedMethod, class: JClass) -> Result<(), CallError> {
    // SAFETY: class handles are only minted from live descriptors.
    let class = unsafe { class.as_ref() }.ok_or(CallError::NullHandle("class"))?;
    let declared = method
        .owner()
        .map(|owner| std::ptr::eq(&*owner, class))
        .unwrap_or(false);
    if !declared {
        return Err(CallError::ClassMismatch {
            method: method.name.to_string(),
            class: class.full_name(),
        });
    }
    Ok(())
}

fn field_ref<'a>(field: JFieldId, function: &str) -> Result<&'a FieldId, AccessError> {
    // SAFETY: field ids are only minted from live descriptors.
    unsafe { field.as_ref() }.ok_or_else(|| {
        report_violation(SafetyViolation::NullHandle, function, "null field id");
        AccessError::MissingInstance("field id".to_string())
    })
}

/// Downcast `obj` to `T`, reporting a null handle or a foreign class.
///
/// # Safety
/// `obj` must be null or point at a live instance.
unsafe fn checked_instance<'a, T: ObjectLayout>(obj: JObject, function: &str) -> Result<&'a T, AccessError> {
    let Some(class) = obj.class() else {
        report_violation(SafetyViolation::NullHandle, function, "null instance");
        return Err(AccessError::MissingInstance(function.to_string()));
    };
    obj.downcast_ref::<T>().ok_or_else(|| {
        report_violation(
            SafetyViolation::ClassMismatch,
            function,
            &format!("instance of {}", class.full_name()),
        );
        AccessError::InstanceClass {
            function: function.to_string(),
            class: class.full_name(),
        }
    })
}

// ============================================================================
// Native interface table
// ============================================================================

static NATIVE_INTERFACE: NativeInterface = NativeInterface {
    version: INTERFACE_VERSION,
    find_class: native_find_class,
    call_method_a: native_call_method_a,
    call_static_method_a: native_call_static_method_a,
    get_array_length: native_get_array_length,
};

unsafe fn env_from<'a>(env: *mut c_void) -> Option<&'a JniEnv> {
    let env = (env as *const JniEnv).as_ref();
    if env.is_none() {
        report_violation(SafetyViolation::NullHandle, "native interface", "null environment");
    }
    env
}

unsafe fn arg_slots<'a>(method: JMethodId, args: *const u64) -> &'a [JValue] {
    let count = method.as_ref().map(ManagedMethod::arg_count).unwrap_or(0);
    if args.is_null() || count == 0 {
        return &[];
    }
    std::slice::from_raw_parts(args as *const JValue, count)
}

unsafe fn finish_call(result: Result<Option<Value>, CallError>, out: *mut u64) -> jint {
    match result {
        Ok(value) => {
            if !out.is_null() {
                *out = value.map(JValue::from).unwrap_or_default().j as u64;
            }
            JNI_OK
        }
        Err(e) => {
            log::error!("native call failed: {}", e);
            JNI_ERR
        }
    }
}

unsafe extern "C" fn native_find_class(env: *mut c_void, name: *const u8, name_len: usize) -> *mut c_void {
    let Some(env) = env_from(env) else {
        return std::ptr::null_mut();
    };
    if name.is_null() {
        return std::ptr::null_mut();
    }
    match std::str::from_utf8(std::slice::from_raw_parts(name, name_len)) {
        Ok(name) => env.find_class(name).0 as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    }
}

unsafe extern "C" fn native_call_method_a(
    env: *mut c_void,
    obj: *mut c_void,
    method: *const c_void,
    args: *const u64,
    out: *mut u64,
) -> jint {
    let Some(env) = env_from(env) else {
        return JNI_ERR;
    };
    let method = JMethodId(method as *mut ManagedMethod);
    let result = env.call_method_a(JObject(obj as *mut Object), method, arg_slots(method, args));
    finish_call(result, out)
}

unsafe extern "C" fn native_call_static_method_a(
    env: *mut c_void,
    class: *mut c_void,
    method: *const c_void,
    args: *const u64,
    out: *mut u64,
) -> jint {
    let Some(env) = env_from(env) else {
        return JNI_ERR;
    };
    let method = JMethodId(method as *mut ManagedMethod);
    let result = env.call_static_method_a(JClass(class as *mut Class), method, arg_slots(method, args));
    finish_call(result, out)
}

unsafe extern "C" fn native_get_array_length(env: *mut c_void, array: *mut c_void) -> jint {
    match env_from(env) {
        Some(env) => env.get_array_length(JArray(array as *mut ArrayObject)),
        None => 0,
    }
}
