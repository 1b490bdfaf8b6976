//! Dispatch generation
//!
//! For a function `F(prelude..., args...)` this module derives two entry
//! points that differ only in where `args` come from:
//!
//! - **variadic**: an [`ArgCursor`] over a C-style variable argument stream,
//!   one promoted read per parameter;
//! - **array**: a pointer to packed [`JValue`] slots, one slot per parameter.
//!
//! Both extract every argument into its own binding, in declaration order,
//! before the call is made. Each extraction consumes input, so the order is
//! part of the contract and is never left to argument evaluation.
//!
//! The prelude (environment handle plus receiver and/or class handle) is
//! supplied by the caller's context and passed through untouched.

use std::ffi::c_void;

use crate::abi::{
    jboolean, jbyte, jchar, jdouble, jfloat, jint, jlong, jshort, JArray, JClass, JEnv, JObject,
    JString, JValue, Value,
};
use crate::introspect::Signature;
use crate::safety::{report_violation, SafetyViolation};

/// Prelude of an instance method: environment and receiver.
pub type VirtualPrelude = (JEnv, JObject);
/// Prelude of a static method: environment and class.
pub type StaticPrelude = (JEnv, JClass);
/// Prelude of a non-virtual call: environment, receiver and the class whose
/// implementation is forced.
pub type NonVirtualPrelude = (JEnv, JObject, JClass);

/// Which prelude a managed method was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Virtual,
    Static,
    NonVirtual,
}

impl CallShape {
    /// Number of leading parameters supplied by the call context
    pub const fn prelude_len(self) -> usize {
        match self {
            CallShape::Virtual | CallShape::Static => 2,
            CallShape::NonVirtual => 3,
        }
    }
}

impl std::fmt::Display for CallShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallShape::Virtual => write!(f, "virtual"),
            CallShape::Static => write!(f, "static"),
            CallShape::NonVirtual => write!(f, "nonvirtual"),
        }
    }
}

/// Call context handed to a stored entry point.
///
/// Each shape reads only the handles its prelude contains.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallFrame {
    pub env: JEnv,
    pub receiver: JObject,
    pub class: JClass,
}

impl CallFrame {
    pub fn virtual_call(env: JEnv, receiver: JObject) -> Self {
        CallFrame {
            env,
            receiver,
            class: JClass::null(),
        }
    }

    pub fn static_call(env: JEnv, class: JClass) -> Self {
        CallFrame {
            env,
            receiver: JObject::null(),
            class,
        }
    }

    pub fn nonvirtual_call(env: JEnv, receiver: JObject, class: JClass) -> Self {
        CallFrame {
            env,
            receiver,
            class,
        }
    }
}

// ============================================================================
// Argument sources
// ============================================================================

/// Sequential reader over a variable argument stream.
///
/// Mirrors what `va_arg` can see after C default argument promotion: every
/// integer narrower than `int` arrives as `int`, `float` arrives as `double`.
/// Each call consumes exactly one argument.
pub trait ArgCursor {
    fn next_int(&mut self) -> jint;
    fn next_long(&mut self) -> jlong;
    fn next_double(&mut self) -> jdouble;
    fn next_object(&mut self) -> JObject;
}

/// One promoted variadic argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VarArg {
    Int(jint),
    Long(jlong),
    Double(jdouble),
    Pointer(*mut c_void),
}

impl From<Value> for VarArg {
    fn from(value: Value) -> Self {
        match value {
            Value::Boolean(v) => VarArg::Int(v as jint),
            Value::Byte(v) => VarArg::Int(v as jint),
            Value::Char(v) => VarArg::Int(v as jint),
            Value::Short(v) => VarArg::Int(v as jint),
            Value::Int(v) => VarArg::Int(v),
            Value::Long(v) => VarArg::Long(v),
            Value::Float(v) => VarArg::Double(v as jdouble),
            Value::Double(v) => VarArg::Double(v),
            Value::Object(v) => VarArg::Pointer(v.0 as *mut c_void),
        }
    }
}

/// Owned variadic argument list.
///
/// Reading past the end, or reading an argument as a different promoted
/// class than it was pushed as, is a caller protocol violation: it is
/// reported and yields zero instead of reading foreign memory.
#[derive(Debug, Clone, Default)]
pub struct VarArgs {
    args: Vec<VarArg>,
    pos: usize,
}

impl VarArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from typed values, applying default argument promotion.
    pub fn from_values(values: &[Value]) -> Self {
        VarArgs {
            args: values.iter().copied().map(VarArg::from).collect(),
            pos: 0,
        }
    }

    pub fn int(mut self, v: jint) -> Self {
        self.args.push(VarArg::Int(v));
        self
    }

    pub fn long(mut self, v: jlong) -> Self {
        self.args.push(VarArg::Long(v));
        self
    }

    pub fn double(mut self, v: jdouble) -> Self {
        self.args.push(VarArg::Double(v));
        self
    }

    pub fn object(mut self, v: JObject) -> Self {
        self.args.push(VarArg::Pointer(v.0 as *mut c_void));
        self
    }

    /// Arguments not yet consumed
    pub fn remaining(&self) -> usize {
        self.args.len() - self.pos
    }

    fn take(&mut self, wanted: &str) -> Option<VarArg> {
        match self.args.get(self.pos) {
            Some(arg) => {
                self.pos += 1;
                Some(*arg)
            }
            None => {
                report_violation(
                    SafetyViolation::ArgumentUnderflow,
                    "VarArgs::take",
                    &format!(
                        "read {} as argument #{} of {}",
                        wanted,
                        self.pos + 1,
                        self.args.len()
                    ),
                );
                None
            }
        }
    }

    fn mismatch(&self, wanted: &str, got: VarArg) {
        report_violation(
            SafetyViolation::ArgumentClassMismatch,
            "VarArgs::take",
            &format!("argument #{} read as {}, passed as {:?}", self.pos, wanted, got),
        );
    }
}

impl ArgCursor for VarArgs {
    fn next_int(&mut self) -> jint {
        match self.take("int") {
            Some(VarArg::Int(v)) => v,
            Some(other) => {
                self.mismatch("int", other);
                0
            }
            None => 0,
        }
    }

    fn next_long(&mut self) -> jlong {
        match self.take("long") {
            Some(VarArg::Long(v)) => v,
            Some(other) => {
                self.mismatch("long", other);
                0
            }
            None => 0,
        }
    }

    fn next_double(&mut self) -> jdouble {
        match self.take("double") {
            Some(VarArg::Double(v)) => v,
            Some(other) => {
                self.mismatch("double", other);
                0.0
            }
            None => 0.0,
        }
    }

    fn next_object(&mut self) -> JObject {
        match self.take("pointer") {
            Some(VarArg::Pointer(p)) => JObject(p as *mut _),
            Some(other) => {
                self.mismatch("pointer", other);
                JObject::null()
            }
            None => JObject::null(),
        }
    }
}

/// Cursor over packed argument slots; advances one slot per read.
pub struct ArrayCursor {
    next: *const JValue,
}

impl ArrayCursor {
    /// # Safety
    /// `args` must point at as many initialised slots as will be read.
    pub unsafe fn new(args: *const JValue) -> Self {
        ArrayCursor { next: args }
    }

    /// # Safety
    /// At least one unread slot must remain.
    #[inline]
    pub unsafe fn advance(&mut self) -> JValue {
        let slot = *self.next;
        self.next = self.next.add(1);
        slot
    }
}

// ============================================================================
// Parameter and return conversions
// ============================================================================

/// A type that can appear after the prelude of a registered function.
pub trait JniArg: Copy + 'static {
    /// Read one argument, narrowing from its promoted class.
    fn from_variadic(cursor: &mut dyn ArgCursor) -> Self;

    /// Reinterpret one packed slot.
    ///
    /// # Safety
    /// The slot must have been written through the member matching `Self`.
    unsafe fn from_slot(slot: JValue) -> Self;
}

macro_rules! int_arg {
    ($($ty:ty => $member:ident),*) => {
        $(
            impl JniArg for $ty {
                #[inline]
                fn from_variadic(cursor: &mut dyn ArgCursor) -> Self {
                    cursor.next_int() as $ty
                }

                #[inline]
                unsafe fn from_slot(slot: JValue) -> Self {
                    slot.$member
                }
            }
        )*
    };
}

int_arg!(jboolean => z, jbyte => b, jchar => c, jshort => s, jint => i);

impl JniArg for jlong {
    #[inline]
    fn from_variadic(cursor: &mut dyn ArgCursor) -> Self {
        cursor.next_long()
    }

    #[inline]
    unsafe fn from_slot(slot: JValue) -> Self {
        slot.j
    }
}

impl JniArg for jfloat {
    #[inline]
    fn from_variadic(cursor: &mut dyn ArgCursor) -> Self {
        cursor.next_double() as jfloat
    }

    #[inline]
    unsafe fn from_slot(slot: JValue) -> Self {
        slot.f
    }
}

impl JniArg for jdouble {
    #[inline]
    fn from_variadic(cursor: &mut dyn ArgCursor) -> Self {
        cursor.next_double()
    }

    #[inline]
    unsafe fn from_slot(slot: JValue) -> Self {
        slot.d
    }
}

macro_rules! handle_arg {
    ($($ty:ident),*) => {
        $(
            impl JniArg for $ty {
                #[inline]
                fn from_variadic(cursor: &mut dyn ArgCursor) -> Self {
                    $ty(cursor.next_object().0 as *mut _)
                }

                #[inline]
                unsafe fn from_slot(slot: JValue) -> Self {
                    $ty(slot.l.0 as *mut _)
                }
            }
        )*
    };
}

handle_arg!(JObject, JClass, JString, JArray);

/// Result of a registered function as seen by the caller.
///
/// `()` produces no value at all; everything else is wrapped in a [`Value`].
pub trait ReturnValue {
    fn into_value(self) -> Option<Value>;
}

impl ReturnValue for () {
    #[inline]
    fn into_value(self) -> Option<Value> {
        None
    }
}

macro_rules! return_value {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl ReturnValue for $ty {
                #[inline]
                fn into_value(self) -> Option<Value> {
                    Some(Value::$variant(self))
                }
            }
        )*
    };
}

return_value!(
    jboolean => Boolean,
    jbyte => Byte,
    jchar => Char,
    jshort => Short,
    jint => Int,
    jlong => Long,
    jfloat => Float,
    jdouble => Double,
    JObject => Object
);

impl ReturnValue for JClass {
    fn into_value(self) -> Option<Value> {
        Some(Value::Object(JObject(self.0 as *mut _)))
    }
}

impl ReturnValue for JString {
    fn into_value(self) -> Option<Value> {
        Some(Value::Object(self.into()))
    }
}

impl ReturnValue for JArray {
    fn into_value(self) -> Option<Value> {
        Some(Value::Object(self.into()))
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// The two generated entry points of a function whose leading parameters are
/// `Pre` and whose remaining parameters are `Args`.
///
/// Implemented for every function with a two- or three-handle prelude
/// followed by up to eight [`JniArg`] parameters. A function whose leading
/// parameters are not exactly `Pre` does not implement `Dispatch<Pre, _>`.
pub trait Dispatch<Pre, Args>: Send + Sync + 'static {
    type Output: ReturnValue;

    /// Number of parameters after the prelude
    const ARG_COUNT: usize;

    fn dispatch_variadic(&self, prelude: Pre, cursor: &mut dyn ArgCursor) -> Self::Output;

    /// # Safety
    /// `args` must point at `ARG_COUNT` slots written with matching members.
    unsafe fn dispatch_array(&self, prelude: Pre, args: *const JValue) -> Self::Output;
}

macro_rules! impl_dispatch {
    ([$($pre:ident),+]; $count:expr; $($arg:ident),*) => {
        impl<Func, Ret, $($pre,)+ $($arg,)*> Dispatch<($($pre,)+), ($($arg,)*)> for Func
        where
            Func: Signature<($($pre,)+ $($arg,)*), Return = Ret>,
            Ret: ReturnValue,
            $($arg: JniArg,)*
        {
            type Output = Ret;

            const ARG_COUNT: usize = $count;

            #[inline]
            #[allow(non_snake_case, unused_variables)]
            fn dispatch_variadic(
                &self,
                ($($pre,)+): ($($pre,)+),
                cursor: &mut dyn ArgCursor,
            ) -> Ret {
                $(let $arg = <$arg as JniArg>::from_variadic(cursor);)*
                self.apply(($($pre,)+ $($arg,)*))
            }

            #[inline]
            #[allow(non_snake_case, unused_variables, unused_mut)]
            unsafe fn dispatch_array(
                &self,
                ($($pre,)+): ($($pre,)+),
                args: *const JValue,
            ) -> Ret {
                let mut cursor = ArrayCursor::new(args);
                $(let $arg = <$arg as JniArg>::from_slot(cursor.advance());)*
                self.apply(($($pre,)+ $($arg,)*))
            }
        }
    };
}

macro_rules! impl_dispatch_for_prelude {
    ($pre:tt) => {
        impl_dispatch!($pre; 0;);
        impl_dispatch!($pre; 1; A1);
        impl_dispatch!($pre; 2; A1, A2);
        impl_dispatch!($pre; 3; A1, A2, A3);
        impl_dispatch!($pre; 4; A1, A2, A3, A4);
        impl_dispatch!($pre; 5; A1, A2, A3, A4, A5);
        impl_dispatch!($pre; 6; A1, A2, A3, A4, A5, A6);
        impl_dispatch!($pre; 7; A1, A2, A3, A4, A5, A6, A7);
        impl_dispatch!($pre; 8; A1, A2, A3, A4, A5, A6, A7, A8);
    };
}

impl_dispatch_for_prelude!([E, R]);
impl_dispatch_for_prelude!([E, R, C]);

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn sum3(_env: JEnv, _this: JObject, a: jint, b: jlong, c: jdouble) -> jdouble {
        a as jdouble + b as jdouble + c
    }

    fn concat_digits(_env: JEnv, _class: JClass, a: jint, b: jint, c: jint) -> jint {
        a * 100 + b * 10 + c
    }

    fn narrow(_env: JEnv, _this: JObject, z: jboolean, b: jbyte, c: jchar, s: jshort, f: jfloat) -> jdouble {
        z as jdouble + b as jdouble + c as jdouble + s as jdouble + f as jdouble
    }

    thread_local! {
        static VOID_CALLS: Cell<u32> = const { Cell::new(0) };
        static READS: RefCell<Vec<jint>> = const { RefCell::new(Vec::new()) };
    }

    fn touch(_env: JEnv, _this: JObject, n: jint) {
        VOID_CALLS.with(|c| c.set(c.get() + n as u32));
    }

    /// Argument type that logs every time it is extracted.
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Tracked(jint);

    impl JniArg for Tracked {
        fn from_variadic(cursor: &mut dyn ArgCursor) -> Self {
            let v = cursor.next_int();
            READS.with(|r| r.borrow_mut().push(v));
            Tracked(v)
        }

        unsafe fn from_slot(slot: JValue) -> Self {
            READS.with(|r| r.borrow_mut().push(slot.i));
            Tracked(slot.i)
        }
    }

    fn tracked(_env: JEnv, _this: JObject, a: Tracked, b: Tracked, c: Tracked) -> jint {
        a.0 * 100 + b.0 * 10 + c.0
    }

    fn slots(values: &[Value]) -> Vec<JValue> {
        values.iter().copied().map(JValue::from).collect()
    }

    fn virtual_prelude() -> VirtualPrelude {
        (JEnv::null(), JObject::null())
    }

    #[test]
    fn test_array_reads_in_declaration_order() {
        READS.with(|r| r.borrow_mut().clear());
        let args = slots(&[Value::Int(1), Value::Int(2), Value::Int(3)]);
        let out = unsafe { tracked.dispatch_array(virtual_prelude(), args.as_ptr()) };
        assert_eq!(out, 123);
        READS.with(|r| assert_eq!(*r.borrow(), vec![1, 2, 3]));
    }

    #[test]
    fn test_variadic_reads_in_declaration_order() {
        READS.with(|r| r.borrow_mut().clear());
        let mut cursor = VarArgs::new().int(7).int(8).int(9);
        let out = tracked.dispatch_variadic(virtual_prelude(), &mut cursor);
        assert_eq!(out, 789);
        assert_eq!(cursor.remaining(), 0);
        READS.with(|r| assert_eq!(*r.borrow(), vec![7, 8, 9]));
    }

    #[test]
    fn test_static_prelude_order() {
        let args = slots(&[Value::Int(4), Value::Int(5), Value::Int(6)]);
        let prelude = (JEnv::null(), JClass::null());
        let out = unsafe { concat_digits.dispatch_array(prelude, args.as_ptr()) };
        assert_eq!(out, 456);
    }

    #[test]
    fn test_variadic_and_array_agree() {
        let values = [Value::Int(3), Value::Long(1 << 40), Value::Double(0.5)];
        let args = slots(&values);
        let from_array = unsafe { sum3.dispatch_array(virtual_prelude(), args.as_ptr()) };
        let from_list = sum3.dispatch_variadic(virtual_prelude(), &mut VarArgs::from_values(&values));
        assert_eq!(from_array, from_list);
        assert_eq!(from_array, 3.0 + (1u64 << 40) as f64 + 0.5);
    }

    #[test]
    fn test_promoted_arguments_narrow() {
        let values = [
            Value::Boolean(1),
            Value::Byte(-2),
            Value::Char(3),
            Value::Short(-4),
            Value::Float(1.5),
        ];
        let args = slots(&values);
        let from_array = unsafe { narrow.dispatch_array(virtual_prelude(), args.as_ptr()) };
        let from_list =
            narrow.dispatch_variadic(virtual_prelude(), &mut VarArgs::from_values(&values));
        assert_eq!(from_array, -0.5);
        assert_eq!(from_list, -0.5);
    }

    #[test]
    fn test_void_return_calls_once() {
        VOID_CALLS.with(|c| c.set(0));
        let args = slots(&[Value::Int(1)]);
        let out = unsafe { touch.dispatch_array(virtual_prelude(), args.as_ptr()) };
        assert_eq!(out.into_value(), None);
        VOID_CALLS.with(|c| assert_eq!(c.get(), 1));

        let out = touch.dispatch_variadic(virtual_prelude(), &mut VarArgs::new().int(1));
        assert_eq!(out.into_value(), None);
        VOID_CALLS.with(|c| assert_eq!(c.get(), 2));
    }

    #[test]
    fn test_arg_count() {
        fn count<F: Dispatch<VirtualPrelude, A>, A>(_f: &F) -> usize {
            F::ARG_COUNT
        }
        assert_eq!(count(&sum3), 3);
        assert_eq!(count(&touch), 1);
    }

    #[cfg(not(feature = "panic-on-safety-violation"))]
    #[test]
    fn test_underflow_yields_zero() {
        let mut cursor = VarArgs::new().int(5);
        assert_eq!(cursor.next_int(), 5);
        assert_eq!(cursor.next_int(), 0);
        assert_eq!(cursor.next_double(), 0.0);
    }

    #[cfg(not(feature = "panic-on-safety-violation"))]
    #[test]
    fn test_wrong_class_yields_zero() {
        let mut cursor = VarArgs::new().double(2.0).int(9);
        assert_eq!(cursor.next_int(), 0);
        assert_eq!(cursor.next_int(), 9);
    }

    #[test]
    fn test_shape_prelude_len() {
        assert_eq!(CallShape::Virtual.prelude_len(), 2);
        assert_eq!(CallShape::Static.prelude_len(), 2);
        assert_eq!(CallShape::NonVirtual.prelude_len(), 3);
    }
}
