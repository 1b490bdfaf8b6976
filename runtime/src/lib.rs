//! jnishim runtime
//!
//! Host side of a native-interface bridge: foreign shared libraries call
//! host-implemented methods through generated entry points, and the host
//! calls back into `Java_…` exports of those libraries.
//!
//! # Architecture
//!
//! - **Descriptors**: every class is built once into a [`Class`] holding its
//!   managed methods, native methods and fields, then registered in a
//!   [`ClassRegistry`] and sealed into a read-only [`ClassTable`]
//! - **Dispatch**: each host function gets a variadic and a packed-array entry
//!   point, generated from its Rust signature; the required prelude is checked
//!   when the method is registered, at compile time
//! - **Resolution**: [`resolve_native`] binds a foreign module's imports and
//!   `Java_…` exports in one all-or-nothing pass
//!
//! # Example
//!
//! ```
//! use jnishim_runtime::abi::{jint, JEnv, JObject, JValue, Value};
//! use jnishim_runtime::dispatch::CallFrame;
//! use jnishim_runtime::{Class, ClassRegistry};
//!
//! fn scale(_env: JEnv, _this: JObject, x: jint, by: jint) -> jint {
//!     x * by
//! }
//!
//! let mut registry = ClassRegistry::new();
//! registry
//!     .register(Class::build("demo", "Scaler", 0, |c| {
//!         c.virtual_method("scale", "(II)I", scale);
//!     }))
//!     .unwrap();
//! let table = registry.seal();
//!
//! let method = table.get("demo", "Scaler").unwrap().find_method("scale", "(II)I").unwrap();
//! let args = [JValue::from(Value::Int(6)), JValue::from(Value::Int(7))];
//! let frame = CallFrame::virtual_call(JEnv::null(), JObject::null());
//! assert_eq!(unsafe { method.invoke_array(frame, args.as_ptr()) }, Some(Value::Int(42)));
//! ```

pub mod abi;          // Primitive aliases, handles, JValue
pub mod introspect;   // Function signature introspection
pub mod dispatch;     // Variadic and packed-array entry points
pub mod descriptor;   // Class, method and field descriptors
pub mod object;       // Object header, arrays, strings
pub mod access;       // Field and array element access
pub mod registry;     // Class registry and global table
pub mod resolve;      // Native resolution
pub mod loader;       // libloading-backed foreign modules
pub mod env;          // Host call surface
pub mod lang;         // Builtin classes
pub mod logging;
pub mod safety;

// Re-export main types
pub use descriptor::{Class, ClassBuilder, FieldId, ManagedMethod, NativeMethod};
pub use env::JniEnv;
pub use loader::LibraryModule;
pub use object::{ArrayObject, Object, StringObject};
pub use registry::{ClassRegistry, ClassTable};
pub use resolve::{resolve_native, ForeignModule};

#[doc(hidden)]
pub use inventory;
