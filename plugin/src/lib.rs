//! Import tables for foreign modules
//!
//! A foreign module (a shared library written against the native-interface
//! ABI) declares which host methods it calls by publishing a table of
//! [`JniImportDesc`] entries. The host reads the table after `dlopen`, looks
//! every entry up in its class registry and writes the resulting method id
//! into the entry's [`ImportSlot`].
//!
//! # Declaring imports
//!
//! ```rust,ignore
//! use jnishim_plugin::{declare_jni_imports, export_jni_imports};
//!
//! declare_jni_imports! {
//!     IMPORTS;
//!     // classpath,   classname, method,    signature, shape    => slot
//!     "java/lang",    "String",  "length",  "()I",     virtual  => STRING_LENGTH;
//!     "demo",         "Counter", "create",  "(I)V",    static   => COUNTER_CREATE;
//! }
//!
//! export_jni_imports!(IMPORTS);
//! ```
//!
//! Descriptors are `#[repr(C)]` and only hold pointers to static data, so the
//! same layout is valid on both sides of the dlopen boundary.

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Symbol exported by [`export_jni_imports!`] and read by the host loader.
pub const IMPORTS_SYMBOL: &str = "jnishim_module_imports";

/// Calling shape tags for [`JniImportDesc::shape`].
pub mod shape {
    pub const VIRTUAL: u8 = 0;
    pub const STATIC: u8 = 1;
    pub const NONVIRTUAL: u8 = 2;
}

/// Receives the method id the host binds for one import.
///
/// Null until the host has resolved the owning module.
#[repr(transparent)]
pub struct ImportSlot(AtomicPtr<c_void>);

impl ImportSlot {
    pub const fn new() -> Self {
        ImportSlot(AtomicPtr::new(std::ptr::null_mut()))
    }

    /// Current binding, null when unresolved
    pub fn get(&self) -> *const c_void {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, method_id: *const c_void) {
        self.0.store(method_id as *mut c_void, Ordering::Release);
    }

    pub fn is_bound(&self) -> bool {
        !self.get().is_null()
    }
}

impl Default for ImportSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Describes a single host method imported by a foreign module.
///
/// Strings are `(*const u8, usize)` pairs pointing at static data inside the
/// module's image.
#[repr(C)]
pub struct JniImportDesc {
    pub classpath: *const u8,
    pub classpath_len: usize,
    pub classname: *const u8,
    pub classname_len: usize,
    pub method: *const u8,
    pub method_len: usize,
    pub signature: *const u8,
    pub signature_len: usize,
    /// One of the [`shape`] tags
    pub shape: u8,
    pub slot: *const ImportSlot,
}

// SAFETY: JniImportDesc only points at static strings and at an ImportSlot,
// which is itself atomic. Safe to share across threads.
unsafe impl Send for JniImportDesc {}
unsafe impl Sync for JniImportDesc {}

impl JniImportDesc {
    /// `None` when the bytes are not valid UTF-8.
    ///
    /// # Safety
    /// The pointer/length pairs must describe bytes that outlive `'a`.
    pub unsafe fn classpath<'a>(&self) -> Option<&'a str> {
        str_from_raw(self.classpath, self.classpath_len)
    }

    /// # Safety
    /// See [`JniImportDesc::classpath`].
    pub unsafe fn classname<'a>(&self) -> Option<&'a str> {
        str_from_raw(self.classname, self.classname_len)
    }

    /// # Safety
    /// See [`JniImportDesc::classpath`].
    pub unsafe fn method<'a>(&self) -> Option<&'a str> {
        str_from_raw(self.method, self.method_len)
    }

    /// # Safety
    /// See [`JniImportDesc::classpath`].
    pub unsafe fn signature<'a>(&self) -> Option<&'a str> {
        str_from_raw(self.signature, self.signature_len)
    }

    /// # Safety
    /// `slot` must point at a live [`ImportSlot`].
    pub unsafe fn slot<'a>(&self) -> &'a ImportSlot {
        &*self.slot
    }
}

unsafe fn str_from_raw<'a>(ptr: *const u8, len: usize) -> Option<&'a str> {
    if ptr.is_null() || len == 0 {
        return Some("");
    }
    std::str::from_utf8(std::slice::from_raw_parts(ptr, len)).ok()
}

/// Symbol lookup callback handed to the host by a C loader.
pub type LookupFn =
    unsafe extern "C" fn(ctx: *mut c_void, name: *const u8, name_len: usize) -> *const c_void;

/// A loaded module as described by an external (C) loader.
///
/// Passed to the host's resolution entry point when the loader, rather than
/// the host, performed the `dlopen`.
#[repr(C)]
pub struct ForeignModuleDesc {
    pub name: *const u8,
    pub name_len: usize,
    pub ctx: *mut c_void,
    pub lookup: LookupFn,
    pub imports: *const JniImportDesc,
    pub import_count: usize,
}

/// Function table at the start of every environment the host hands out.
///
/// A foreign module receives the environment as an opaque pointer whose first
/// word points at this table, so it can call back into the host without
/// linking against it. Argument and result slots are 8-byte values laid out
/// like the host's `JValue`.
#[repr(C)]
pub struct NativeInterface {
    pub version: i32,
    /// Class handle by fully qualified name; null if absent
    pub find_class:
        unsafe extern "C" fn(env: *mut c_void, name: *const u8, name_len: usize) -> *mut c_void,
    /// Virtual call; writes the result to `out` (if non-null) and returns a status
    pub call_method_a: unsafe extern "C" fn(
        env: *mut c_void,
        obj: *mut c_void,
        method: *const c_void,
        args: *const u64,
        out: *mut u64,
    ) -> i32,
    pub call_static_method_a: unsafe extern "C" fn(
        env: *mut c_void,
        class: *mut c_void,
        method: *const c_void,
        args: *const u64,
        out: *mut u64,
    ) -> i32,
    pub get_array_length: unsafe extern "C" fn(env: *mut c_void, array: *mut c_void) -> i32,
}

/// Version reported in [`NativeInterface::version`]
pub const INTERFACE_VERSION: i32 = 0x0001_0000;

/// Function table of an environment pointer.
///
/// # Safety
/// `env` must be an environment pointer handed out by the host.
pub unsafe fn interface<'a>(env: *mut c_void) -> &'a NativeInterface {
    &**(env as *const *const NativeInterface)
}

/// Declare a static table of host-method imports.
///
/// Generates one `pub static` [`ImportSlot`] per entry and a `static` slice of
/// [`JniImportDesc`] named after the first token.
///
/// **Shape tokens**: `virtual`, `static`, `nonvirtual`
#[macro_export]
macro_rules! declare_jni_imports {
    (
        $name:ident;
        $($classpath:literal, $classname:literal, $method:literal, $sig:literal,
          $shape:ident => $slot:ident;)*
    ) => {
        $(pub static $slot: $crate::ImportSlot = $crate::ImportSlot::new();)*

        static $name: &[$crate::JniImportDesc] = &[
            $(
                $crate::JniImportDesc {
                    classpath: $classpath.as_ptr(),
                    classpath_len: $classpath.len(),
                    classname: $classname.as_ptr(),
                    classname_len: $classname.len(),
                    method: $method.as_ptr(),
                    method_len: $method.len(),
                    signature: $sig.as_ptr(),
                    signature_len: $sig.len(),
                    shape: $crate::_shape!($shape),
                    slot: &$slot,
                },
            )*
        ];
    };
}

/// Export an import table under [`IMPORTS_SYMBOL`] for the host loader.
#[macro_export]
macro_rules! export_jni_imports {
    ($name:ident) => {
        #[no_mangle]
        pub extern "C" fn jnishim_module_imports(
            out_count: *mut usize,
        ) -> *const $crate::JniImportDesc {
            if !out_count.is_null() {
                unsafe {
                    *out_count = $name.len();
                }
            }
            $name.as_ptr()
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! _shape {
    (virtual) => {
        $crate::shape::VIRTUAL
    };
    (static) => {
        $crate::shape::STATIC
    };
    (nonvirtual) => {
        $crate::shape::NONVIRTUAL
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    declare_jni_imports! {
        TEST_IMPORTS;
        "java/lang", "String", "length", "()I", virtual => LENGTH;
        "demo", "Counter", "create", "(I)Ldemo/Counter;", static => CREATE;
    }

    #[test]
    fn test_table_layout() {
        assert_eq!(TEST_IMPORTS.len(), 2);
        unsafe {
            assert_eq!(TEST_IMPORTS[0].classpath(), Some("java/lang"));
            assert_eq!(TEST_IMPORTS[0].classname(), Some("String"));
            assert_eq!(TEST_IMPORTS[0].method(), Some("length"));
            assert_eq!(TEST_IMPORTS[0].signature(), Some("()I"));
            assert_eq!(TEST_IMPORTS[1].signature(), Some("(I)Ldemo/Counter;"));
        }
        assert_eq!(TEST_IMPORTS[0].shape, shape::VIRTUAL);
        assert_eq!(TEST_IMPORTS[1].shape, shape::STATIC);
    }

    #[test]
    fn test_invalid_utf8_is_not_a_str() {
        static BYTES: [u8; 2] = [0xff, 0xfe];
        static SLOT: ImportSlot = ImportSlot::new();
        let desc = JniImportDesc {
            classpath: BYTES.as_ptr(),
            classpath_len: BYTES.len(),
            classname: std::ptr::null(),
            classname_len: 0,
            method: "m".as_ptr(),
            method_len: 1,
            signature: "()V".as_ptr(),
            signature_len: 3,
            shape: shape::STATIC,
            slot: &SLOT,
        };
        unsafe {
            assert_eq!(desc.classpath(), None);
            assert_eq!(desc.classname(), Some(""));
            assert_eq!(desc.method(), Some("m"));
        }
    }

    #[test]
    fn test_slot_binding() {
        assert!(!LENGTH.is_bound());
        let target = 0x1000usize as *const c_void;
        unsafe { TEST_IMPORTS[0].slot() }.set(target);
        assert!(LENGTH.is_bound());
        assert_eq!(LENGTH.get(), target);
        assert!(!CREATE.is_bound());
    }
}
