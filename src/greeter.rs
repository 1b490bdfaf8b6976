//! Host side of the `jnishim-demo` module

use std::ffi::c_void;
use std::sync::Arc;

use jnishim_runtime::abi::{jint, JClass, JEnv, JObject};
use jnishim_runtime::{Class, JniEnv};

/// File name the demo cdylib is built as on this platform
pub const DEMO_MODULE: &str = if cfg!(target_os = "macos") {
    "libjnishim_demo.dylib"
} else if cfg!(target_os = "windows") {
    "jnishim_demo.dll"
} else {
    "libjnishim_demo.so"
};

fn twice(_env: JEnv, _class: JClass, x: jint) -> jint {
    x.wrapping_mul(2)
}

pub fn greeter_class() -> Arc<Class> {
    Class::build("demo", "Greeter", 0, |c| {
        c.static_method("twice", "(I)I", twice)
            .native_method("add", "(II)I", DEMO_MODULE)
            .native_method("shout", "(I)I", DEMO_MODULE)
            .native_method("measure", "(Ljava/lang/String;)I", DEMO_MODULE);
    })
}

jnishim_runtime::register_class!(greeter_class);

fn bound(class: &Class, name: &str, signature: &str) -> Result<*mut c_void, String> {
    class
        .find_native_method(name, signature)
        .and_then(|m| m.bound())
        .map(|p| p.as_ptr())
        .ok_or_else(|| format!("native {}{} is not bound", name, signature))
}

/// Call every native of `demo/Greeter` once; the module must be resolved.
pub fn exercise(env: &JniEnv) -> Result<Vec<(String, jint)>, String> {
    let class = env
        .table()
        .find("demo/Greeter")
        .ok_or_else(|| "demo/Greeter is not registered".to_string())?;
    let handle = class.handle();
    let mut results = Vec::new();

    // SAFETY: the bound addresses are the module's exports for these
    // signatures, and the module stays loaded.
    unsafe {
        let add: extern "C" fn(JEnv, JClass, jint, jint) -> jint =
            std::mem::transmute(bound(class, "add", "(II)I")?);
        results.push(("add(2, 40)".to_string(), add(env.handle(), handle, 2, 40)));

        let shout: extern "C" fn(JEnv, JClass, jint) -> jint =
            std::mem::transmute(bound(class, "shout", "(I)I")?);
        results.push(("shout(20)".to_string(), shout(env.handle(), handle, 20)));

        let text = env.new_string_utf("hello, world").map_err(|e| e.to_string())?;
        let measure: extern "C" fn(JEnv, JClass, JObject) -> jint =
            std::mem::transmute(bound(class, "measure", "(Ljava/lang/String;)I")?);
        results.push((
            "measure(\"hello, world\")".to_string(),
            measure(env.handle(), handle, text.as_handle().into()),
        ));
    }

    Ok(results)
}
