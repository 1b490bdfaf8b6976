//! Sample foreign module
//!
//! Implements the native methods of `demo/Greeter` and calls back into the
//! host through the environment's function table. Built as a `cdylib`; the
//! host binds it with `jnishim resolve` or `jnishim demo`.

#![allow(non_snake_case)]

use std::ffi::c_void;
use std::ptr;

use jnishim_plugin::{declare_jni_imports, export_jni_imports, interface};

declare_jni_imports! {
    IMPORTS;
    "demo",      "Greeter", "twice",  "(I)I", static  => GREETER_TWICE;
    "java/lang", "String",  "length", "()I",  virtual => STRING_LENGTH;
}

export_jni_imports!(IMPORTS);

const JNI_ERR: i32 = -1;

fn int_slot(value: i32) -> u64 {
    let mut slot = 0u64;
    // SAFETY: an int argument occupies the first four bytes of its slot.
    unsafe { ptr::write(&mut slot as *mut u64 as *mut i32, value) };
    slot
}

fn slot_int(slot: &u64) -> i32 {
    // SAFETY: as above.
    unsafe { ptr::read(slot as *const u64 as *const i32) }
}

/// `static native int add(int a, int b)`
#[no_mangle]
pub extern "C" fn Java_demo_Greeter_add(_env: *mut c_void, _class: *mut c_void, a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

/// `static native int shout(int x)`: `twice(x) + 1`, computed by the host
///
/// # Safety
/// Called by the host with its own environment and class handles.
#[no_mangle]
pub unsafe extern "C" fn Java_demo_Greeter_shout(env: *mut c_void, class: *mut c_void, x: i32) -> i32 {
    if !GREETER_TWICE.is_bound() {
        return JNI_ERR;
    }
    let functions = interface(env);
    let args = [int_slot(x)];
    let mut out = 0u64;
    let status = (functions.call_static_method_a)(env, class, GREETER_TWICE.get(), args.as_ptr(), &mut out);
    if status != 0 {
        return JNI_ERR;
    }
    slot_int(&out).wrapping_add(1)
}

/// `static native int measure(String s)`: `s.length()`, computed by the host
///
/// # Safety
/// Called by the host with its own environment and a live string handle.
#[no_mangle]
pub unsafe extern "C" fn Java_demo_Greeter_measure(env: *mut c_void, _class: *mut c_void, s: *mut c_void) -> i32 {
    if !STRING_LENGTH.is_bound() {
        return JNI_ERR;
    }
    let functions = interface(env);
    let mut out = 0u64;
    let status = (functions.call_method_a)(env, s, STRING_LENGTH.get(), ptr::null(), &mut out);
    if status != 0 {
        return JNI_ERR;
    }
    slot_int(&out)
}
