//! Class, method and field descriptors
//!
//! A [`Class`] is built once, during initialisation, and never mutated
//! afterwards apart from the bindable slots of its [`NativeMethod`]s. Members
//! keep a [`Weak`] back-reference to their class; the registry owns the
//! strong reference for the rest of the process.
//!
//! ```
//! use jnishim_runtime::abi::{jint, JEnv, JObject};
//! use jnishim_runtime::descriptor::Class;
//!
//! fn answer(_env: JEnv, _this: JObject) -> jint {
//!     42
//! }
//!
//! let class = Class::build("demo", "Oracle", 0, |c| {
//!     c.virtual_method("answer", "()I", answer);
//! });
//! assert!(class.find_method("answer", "()I").is_some());
//! ```
//!
//! A function whose leading parameters do not match the chosen shape is
//! rejected at compile time, for every shape:
//!
//! ```compile_fail
//! use jnishim_runtime::abi::{jint, JObject};
//! use jnishim_runtime::descriptor::Class;
//!
//! fn no_env(_this: JObject, x: jint) -> jint { x }
//!
//! Class::build("demo", "Broken", 0, |c| { c.virtual_method("f", "(I)I", no_env); });
//! ```
//!
//! ```compile_fail
//! use jnishim_runtime::abi::{jint, JObject};
//! use jnishim_runtime::descriptor::Class;
//!
//! fn no_env(_this: JObject, x: jint) -> jint { x }
//!
//! Class::build("demo", "Broken", 0, |c| { c.static_method("f", "(I)I", no_env); });
//! ```
//!
//! ```compile_fail
//! use jnishim_runtime::abi::{jint, JObject};
//! use jnishim_runtime::descriptor::Class;
//!
//! fn no_env(_this: JObject, x: jint) -> jint { x }
//!
//! Class::build("demo", "Broken", 0, |c| { c.nonvirtual_method("f", "(I)I", no_env); });
//! ```
//!
//! A static method takes a class handle, not a receiver:
//!
//! ```compile_fail
//! use jnishim_runtime::abi::{jint, JEnv, JObject};
//! use jnishim_runtime::descriptor::Class;
//!
//! fn instance_only(_env: JEnv, _this: JObject) -> jint { 0 }
//!
//! Class::build("demo", "Broken", 0, |c| { c.static_method("f", "()I", instance_only); });
//! ```
//!
//! A non-virtual method needs all three prelude handles:
//!
//! ```compile_fail
//! use jnishim_runtime::abi::{jint, JEnv, JObject};
//! use jnishim_runtime::descriptor::Class;
//!
//! fn short(_env: JEnv, _this: JObject) -> jint { 0 }
//!
//! Class::build("demo", "Broken", 0, |c| { c.nonvirtual_method("f", "()I", short); });
//! ```

use std::ffi::c_void;
use std::fmt::Write as _;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

use crate::abi::{JClass, JFieldId, JMethodId, JValue, Value};
use crate::dispatch::{
    ArgCursor, CallFrame, CallShape, Dispatch, NonVirtualPrelude, ReturnValue, StaticPrelude,
    VirtualPrelude,
};

type VariadicEntry = Box<dyn Fn(CallFrame, &mut dyn ArgCursor) -> Option<Value> + Send + Sync>;
type ArrayEntry = Box<dyn Fn(CallFrame, *const JValue) -> Option<Value> + Send + Sync>;

// ============================================================================
// Class
// ============================================================================

/// Descriptor for one type.
#[derive(Debug)]
pub struct Class {
    /// Package path, `/`-separated (e.g. `java/lang`); empty for array and
    /// primitive classes
    pub classpath: &'static str,
    pub classname: &'static str,
    pub managed_methods: Vec<ManagedMethod>,
    pub native_methods: Vec<NativeMethod>,
    pub fields: Vec<FieldId>,
    /// Byte size of one instance, header included
    pub instance_size: usize,
}

impl Class {
    /// Build a class; `define` adds its members.
    pub fn build(
        classpath: &'static str,
        classname: &'static str,
        instance_size: usize,
        define: impl FnOnce(&mut ClassBuilder),
    ) -> Arc<Class> {
        Arc::new_cyclic(|this| {
            let mut builder = ClassBuilder {
                owner: this.clone(),
                classpath,
                classname,
                managed_methods: Vec::new(),
                native_methods: Vec::new(),
                fields: Vec::new(),
            };
            define(&mut builder);

            Class {
                classpath,
                classname,
                managed_methods: builder.managed_methods,
                native_methods: builder.native_methods,
                fields: builder.fields,
                instance_size,
            }
        })
    }

    /// Build a class whose instances are laid out as `T`.
    pub fn build_for<T>(
        classpath: &'static str,
        classname: &'static str,
        define: impl FnOnce(&mut ClassBuilder),
    ) -> Arc<Class> {
        Self::build(classpath, classname, std::mem::size_of::<T>(), define)
    }

    /// Fully qualified name, e.g. `java/lang/String`
    pub fn full_name(&self) -> String {
        qualified_name(self.classpath, self.classname)
    }

    pub fn matches(&self, classpath: &str, classname: &str) -> bool {
        self.classpath == classpath && self.classname == classname
    }

    pub fn is_array(&self) -> bool {
        self.classname.starts_with('[')
    }

    pub fn handle(&self) -> JClass {
        JClass::from_class(self)
    }

    pub fn find_method(&self, name: &str, signature: &str) -> Option<&ManagedMethod> {
        self.managed_methods
            .iter()
            .find(|m| m.name == name && m.signature == signature)
    }

    pub fn find_native_method(&self, name: &str, signature: &str) -> Option<&NativeMethod> {
        self.native_methods
            .iter()
            .find(|m| m.name == name && m.signature == signature)
    }

    pub fn find_field(&self, name: &str, signature: &str) -> Option<&FieldId> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.signature == signature)
    }
}

pub(crate) fn qualified_name(classpath: &str, classname: &str) -> String {
    if classpath.is_empty() {
        classname.to_string()
    } else {
        format!("{}/{}", classpath, classname)
    }
}

/// Collects the members of a class under construction.
pub struct ClassBuilder {
    owner: Weak<Class>,
    classpath: &'static str,
    classname: &'static str,
    managed_methods: Vec<ManagedMethod>,
    native_methods: Vec<NativeMethod>,
    fields: Vec<FieldId>,
}

impl ClassBuilder {
    /// Add an instance method: `f(env, this, args...)`
    pub fn virtual_method<F, Args>(
        &mut self,
        name: &'static str,
        signature: &'static str,
        f: F,
    ) -> &mut Self
    where
        F: Dispatch<VirtualPrelude, Args>,
        Args: 'static,
    {
        let method = ManagedMethod::register_virtual(&self.owner, name, signature, f);
        self.push_managed(method)
    }

    /// Add a static method: `f(env, class, args...)`
    pub fn static_method<F, Args>(
        &mut self,
        name: &'static str,
        signature: &'static str,
        f: F,
    ) -> &mut Self
    where
        F: Dispatch<StaticPrelude, Args>,
        Args: 'static,
    {
        let method = ManagedMethod::register_static(&self.owner, name, signature, f);
        self.push_managed(method)
    }

    /// Add a non-virtual method: `f(env, this, class, args...)`
    pub fn nonvirtual_method<F, Args>(
        &mut self,
        name: &'static str,
        signature: &'static str,
        f: F,
    ) -> &mut Self
    where
        F: Dispatch<NonVirtualPrelude, Args>,
        Args: 'static,
    {
        let method = ManagedMethod::register_nonvirtual(&self.owner, name, signature, f);
        self.push_managed(method)
    }

    /// Declare a method implemented inside the foreign module `soname`.
    pub fn native_method(
        &mut self,
        name: &'static str,
        signature: &'static str,
        soname: &'static str,
    ) -> &mut Self {
        log::debug!(
            "declared native {}.{}{} in '{}'",
            qualified_name(self.classpath, self.classname),
            name,
            signature,
            soname
        );
        self.native_methods.push(NativeMethod {
            clazz: self.owner.clone(),
            name,
            signature,
            soname,
            slot: AtomicPtr::new(std::ptr::null_mut()),
        });
        self
    }

    /// Add a field produced by [`instance_field!`](crate::instance_field) or
    /// [`static_field!`](crate::static_field).
    pub fn field(&mut self, spec: FieldSpec) -> &mut Self {
        self.fields.push(FieldId {
            clazz: self.owner.clone(),
            name: spec.name,
            signature: spec.signature,
            address: spec.address,
            kind: spec.kind,
        });
        self
    }

    fn push_managed(&mut self, method: ManagedMethod) -> &mut Self {
        log::debug!(
            "registered {} method {}.{}{} ({} args)",
            method.shape,
            qualified_name(self.classpath, self.classname),
            method.name,
            method.signature,
            method.arg_count
        );
        self.managed_methods.push(method);
        self
    }
}

// ============================================================================
// Managed methods
// ============================================================================

/// A host-implemented method callable from foreign modules.
///
/// Holds both generated entry points of the underlying function behind a
/// uniform contract: the prelude comes from a [`CallFrame`], arguments from
/// either a cursor or packed slots.
pub struct ManagedMethod {
    clazz: Weak<Class>,
    pub name: &'static str,
    /// Opaque lookup key, compared by exact equality
    pub signature: &'static str,
    pub shape: CallShape,
    arg_count: usize,
    variadic: VariadicEntry,
    array: ArrayEntry,
}

impl ManagedMethod {
    /// Register `f(env, this, args...)`.
    pub fn register_virtual<F, Args>(
        clazz: &Weak<Class>,
        name: &'static str,
        signature: &'static str,
        f: F,
    ) -> Self
    where
        F: Dispatch<VirtualPrelude, Args>,
        Args: 'static,
    {
        let f = Arc::new(f);
        let fa = Arc::clone(&f);
        ManagedMethod {
            clazz: clazz.clone(),
            name,
            signature,
            shape: CallShape::Virtual,
            arg_count: F::ARG_COUNT,
            variadic: Box::new(move |frame: CallFrame, cursor: &mut dyn ArgCursor| {
                <F as Dispatch<VirtualPrelude, Args>>::dispatch_variadic(
                    &f,
                    (frame.env, frame.receiver),
                    cursor,
                )
                .into_value()
            }),
            array: Box::new(move |frame: CallFrame, args: *const JValue| {
                // SAFETY: callers of invoke_array guarantee ARG_COUNT slots.
                unsafe {
                    <F as Dispatch<VirtualPrelude, Args>>::dispatch_array(
                        &fa,
                        (frame.env, frame.receiver),
                        args,
                    )
                }
                .into_value()
            }),
        }
    }

    /// Register `f(env, class, args...)`.
    pub fn register_static<F, Args>(
        clazz: &Weak<Class>,
        name: &'static str,
        signature: &'static str,
        f: F,
    ) -> Self
    where
        F: Dispatch<StaticPrelude, Args>,
        Args: 'static,
    {
        let f = Arc::new(f);
        let fa = Arc::clone(&f);
        ManagedMethod {
            clazz: clazz.clone(),
            name,
            signature,
            shape: CallShape::Static,
            arg_count: F::ARG_COUNT,
            variadic: Box::new(move |frame: CallFrame, cursor: &mut dyn ArgCursor| {
                <F as Dispatch<StaticPrelude, Args>>::dispatch_variadic(
                    &f,
                    (frame.env, frame.class),
                    cursor,
                )
                .into_value()
            }),
            array: Box::new(move |frame: CallFrame, args: *const JValue| {
                // SAFETY: callers of invoke_array guarantee ARG_COUNT slots.
                unsafe {
                    <F as Dispatch<StaticPrelude, Args>>::dispatch_array(
                        &fa,
                        (frame.env, frame.class),
                        args,
                    )
                }
                .into_value()
            }),
        }
    }

    /// Register `f(env, this, class, args...)`.
    pub fn register_nonvirtual<F, Args>(
        clazz: &Weak<Class>,
        name: &'static str,
        signature: &'static str,
        f: F,
    ) -> Self
    where
        F: Dispatch<NonVirtualPrelude, Args>,
        Args: 'static,
    {
        let f = Arc::new(f);
        let fa = Arc::clone(&f);
        ManagedMethod {
            clazz: clazz.clone(),
            name,
            signature,
            shape: CallShape::NonVirtual,
            arg_count: F::ARG_COUNT,
            variadic: Box::new(move |frame: CallFrame, cursor: &mut dyn ArgCursor| {
                <F as Dispatch<NonVirtualPrelude, Args>>::dispatch_variadic(
                    &f,
                    (frame.env, frame.receiver, frame.class),
                    cursor,
                )
                .into_value()
            }),
            array: Box::new(move |frame: CallFrame, args: *const JValue| {
                // SAFETY: callers of invoke_array guarantee ARG_COUNT slots.
                unsafe {
                    <F as Dispatch<NonVirtualPrelude, Args>>::dispatch_array(
                        &fa,
                        (frame.env, frame.receiver, frame.class),
                        args,
                    )
                }
                .into_value()
            }),
        }
    }

    /// Owning class; `None` only while the class is still being built
    pub fn owner(&self) -> Option<Arc<Class>> {
        self.clazz.upgrade()
    }

    /// Parameters after the prelude
    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    pub fn id(&self) -> JMethodId {
        JMethodId::from_method(self)
    }

    /// Call through the variadic entry point.
    pub fn invoke_variadic(&self, frame: CallFrame, cursor: &mut dyn ArgCursor) -> Option<Value> {
        (self.variadic)(frame, cursor)
    }

    /// Call through the array entry point.
    ///
    /// # Safety
    /// `args` must point at [`arg_count`](Self::arg_count) slots, each written
    /// through the member matching the parameter's type.
    pub unsafe fn invoke_array(&self, frame: CallFrame, args: *const JValue) -> Option<Value> {
        (self.array)(frame, args)
    }
}

impl std::fmt::Debug for ManagedMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedMethod")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("shape", &self.shape)
            .field("arg_count", &self.arg_count)
            .finish()
    }
}

// ============================================================================
// Native methods
// ============================================================================

/// A method implemented inside a foreign module.
///
/// The slot is empty until the module named by `soname` is resolved.
#[derive(Debug)]
pub struct NativeMethod {
    clazz: Weak<Class>,
    pub name: &'static str,
    pub signature: &'static str,
    /// Name of the foreign module providing the implementation
    pub soname: &'static str,
    slot: AtomicPtr<c_void>,
}

impl NativeMethod {
    pub fn owner(&self) -> Option<Arc<Class>> {
        self.clazz.upgrade()
    }

    pub fn bind(&self, target: NonNull<c_void>) {
        self.slot.store(target.as_ptr(), Ordering::Release);
    }

    /// Bound implementation address, if resolved
    pub fn bound(&self) -> Option<NonNull<c_void>> {
        NonNull::new(self.slot.load(Ordering::Acquire))
    }

    pub fn is_bound(&self) -> bool {
        self.bound().is_some()
    }

    /// Short and long JNI symbol names, in lookup order
    pub fn symbol_candidates(&self, class: &Class) -> [String; 2] {
        let full = class.full_name();
        [
            jni_short_name(&full, self.name),
            jni_long_name(&full, self.name, self.signature),
        ]
    }
}

/// `Java_<class>_<method>`
pub fn jni_short_name(class_name: &str, method: &str) -> String {
    let mut out = String::from("Java_");
    mangle_into(&mut out, class_name);
    out.push('_');
    mangle_into(&mut out, method);
    out
}

/// `Java_<class>_<method>__<argument types>`, used for overloaded methods
pub fn jni_long_name(class_name: &str, method: &str, signature: &str) -> String {
    let mut out = jni_short_name(class_name, method);
    out.push_str("__");
    let args = signature
        .strip_prefix('(')
        .and_then(|s| s.split(')').next())
        .unwrap_or("");
    mangle_into(&mut out, args);
    out
}

fn mangle_into(out: &mut String, name: &str) {
    for ch in name.chars() {
        match ch {
            '/' => out.push('_'),
            '_' => out.push_str("_1"),
            ';' => out.push_str("_2"),
            '[' => out.push_str("_3"),
            c if c.is_ascii_alphanumeric() => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "_0{:04x}", unit);
                }
            }
        }
    }
}

// ============================================================================
// Fields
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Static,
    Instance,
}

/// Field description before it is attached to a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub signature: &'static str,
    pub address: usize,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn instance(name: &'static str, signature: &'static str, offset: usize) -> Self {
        FieldSpec {
            name,
            signature,
            address: offset,
            kind: FieldKind::Instance,
        }
    }

    pub fn static_at(name: &'static str, signature: &'static str, address: usize) -> Self {
        FieldSpec {
            name,
            signature,
            address,
            kind: FieldKind::Static,
        }
    }
}

/// Describes one field of a class.
#[derive(Debug)]
pub struct FieldId {
    clazz: Weak<Class>,
    pub name: &'static str,
    pub signature: &'static str,
    /// Absolute address for static fields, offset from the instance base for
    /// instance fields
    pub address: usize,
    pub kind: FieldKind,
}

impl FieldId {
    pub fn owner(&self) -> Option<Arc<Class>> {
        self.clazz.upgrade()
    }

    pub fn is_static(&self) -> bool {
        self.kind == FieldKind::Static
    }

    /// Byte offset of an instance field
    pub fn offset(&self) -> Option<usize> {
        match self.kind {
            FieldKind::Instance => Some(self.address),
            FieldKind::Static => None,
        }
    }

    pub fn id(&self) -> JFieldId {
        JFieldId::from_field(self)
    }
}

/// Describe an instance field of a `#[repr(C)]` instance type.
///
/// ```
/// use jnishim_runtime::abi::jint;
/// use jnishim_runtime::instance_field;
/// use jnishim_runtime::object::Object;
///
/// #[repr(C)]
/// struct Point {
///     header: Object,
///     x: jint,
/// }
///
/// let spec = instance_field!(Point, x, "I");
/// assert_eq!(spec.address, std::mem::offset_of!(Point, x));
/// ```
#[macro_export]
macro_rules! instance_field {
    ($ty:ty, $field:ident, $sig:expr) => {
        $crate::descriptor::FieldSpec::instance(
            stringify!($field),
            $sig,
            ::core::mem::offset_of!($ty, $field),
        )
    };
}

/// Describe a static field backed by a Rust `static`.
///
/// The static must have interior mutability (an atomic or a cell) if
/// foreign code is allowed to write it.
#[macro_export]
macro_rules! static_field {
    ($var:ident, $sig:expr) => {
        $crate::static_field!(stringify!($var), $var, $sig)
    };
    ($name:expr, $var:path, $sig:expr) => {
        $crate::descriptor::FieldSpec::static_at(
            $name,
            $sig,
            ::core::ptr::addr_of!($var) as usize,
        )
    };
}
