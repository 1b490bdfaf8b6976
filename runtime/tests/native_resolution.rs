//! Resolving a module described by an external loader through the C entry

use std::ffi::c_void;
use std::sync::Arc;

use jnishim_plugin::{declare_jni_imports, ForeignModuleDesc, JniImportDesc};
use jnishim_runtime::abi::{jint, JEnv, JMethodId, JObject, JNI_ERR, JNI_OK};
use jnishim_runtime::dispatch::CallFrame;
use jnishim_runtime::resolve::{is_resolved, jnishim_resolve_native};
use jnishim_runtime::{registry, Class};

fn doubled(_env: JEnv, _this: JObject, x: jint) -> jint {
    x * 2
}

fn gauge_class() -> Arc<Class> {
    Class::build("it", "Gauge", 0, |c| {
        c.virtual_method("doubled", "(I)I", doubled)
            .native_method("read", "(I)I", "libgauge.so")
            .native_method("reset", "()V", "libgauge.so")
            .native_method("calibrate", "()V", "libbroken.so");
    })
}

jnishim_runtime::register_class!(gauge_class);

extern "C" fn java_read(_env: JEnv, _this: JObject, x: jint) -> jint {
    x + 1
}

extern "C" fn java_reset(_env: JEnv, _this: JObject) {}

unsafe extern "C" fn lookup(_ctx: *mut c_void, name: *const u8, len: usize) -> *const c_void {
    let name = std::str::from_utf8_unchecked(std::slice::from_raw_parts(name, len));
    match name {
        "Java_it_Gauge_read" => java_read as *const c_void,
        "Java_it_Gauge_reset__" => java_reset as *const c_void,
        _ => std::ptr::null(),
    }
}

declare_jni_imports! {
    GAUGE_IMPORTS;
    "it", "Gauge", "doubled", "(I)I", virtual => GAUGE_DOUBLED;
}

declare_jni_imports! {
    BROKEN_IMPORTS;
    "it", "Gauge", "doubled", "(I)I", virtual => BROKEN_DOUBLED;
    "it", "Gauge", "tripled", "(I)I", virtual => BROKEN_TRIPLED;
}

fn describe(name: &'static str, imports: &'static [JniImportDesc]) -> ForeignModuleDesc {
    ForeignModuleDesc {
        name: name.as_ptr(),
        name_len: name.len(),
        ctx: std::ptr::null_mut(),
        lookup,
        imports: imports.as_ptr(),
        import_count: imports.len(),
    }
}

#[test]
fn test_c_entry_binds_both_directions() {
    jnishim_runtime::logging::init_test();
    let desc = describe("libgauge.so", GAUGE_IMPORTS);
    assert_eq!(unsafe { jnishim_resolve_native(&desc) }, JNI_OK);
    assert!(is_resolved("libgauge.so"));

    let table = registry::global().unwrap();
    let gauge = table.find("it/Gauge").unwrap();

    let read = gauge.find_native_method("read", "(I)I").unwrap().bound().unwrap();
    let read: extern "C" fn(JEnv, JObject, jint) -> jint = unsafe { std::mem::transmute(read.as_ptr()) };
    assert_eq!(read(JEnv::null(), JObject::null(), 41), 42);
    assert!(gauge.find_native_method("reset", "()V").unwrap().is_bound());
    assert!(!gauge.find_native_method("calibrate", "()V").unwrap().is_bound());

    let id = JMethodId(GAUGE_DOUBLED.get() as *mut _);
    let method = unsafe { id.as_ref() }.unwrap();
    assert_eq!(method.name, "doubled");
    let out = method.invoke_variadic(
        CallFrame::virtual_call(JEnv::null(), JObject::null()),
        &mut jnishim_runtime::dispatch::VarArgs::new().int(21),
    );
    assert_eq!(out.and_then(|v| v.as_int()), Some(42));

    assert_eq!(unsafe { jnishim_resolve_native(&desc) }, JNI_ERR);
}

#[test]
fn test_c_entry_fails_whole_module_on_any_miss() {
    let desc = describe("libbroken.so", BROKEN_IMPORTS);
    assert_eq!(unsafe { jnishim_resolve_native(&desc) }, JNI_ERR);
    assert!(!is_resolved("libbroken.so"));
    assert!(!BROKEN_DOUBLED.is_bound());
    assert!(!BROKEN_TRIPLED.is_bound());
}

#[test]
fn test_c_entry_rejects_null_descriptor() {
    assert_eq!(unsafe { jnishim_resolve_native(std::ptr::null()) }, JNI_ERR);
}
