//! Shared-library foreign modules
//!
//! [`LibraryModule`] opens a foreign module with `libloading` and presents it
//! to the resolver. A module that imports host methods exports its import
//! table under [`IMPORTS_SYMBOL`]; a module without the export simply imports
//! nothing.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use jnishim_plugin::{JniImportDesc, IMPORTS_SYMBOL};
use libloading::Library;

use crate::abi::JMethodId;
use crate::resolve::{import_requests, ForeignModule, ImportRequest, KeepAlive};

type ImportsFn = unsafe extern "C" fn(out_count: *mut usize) -> *const JniImportDesc;

#[derive(Debug)]
pub enum LoadError {
    /// dlopen failed
    Open { path: PathBuf, reason: String },
    /// Path has no usable file name to match native methods against
    InvalidName(PathBuf),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Open { path, reason } => {
                write!(f, "failed to load {}: {}", path.display(), reason)
            }
            LoadError::InvalidName(path) => {
                write!(f, "cannot derive a module name from {}", path.display())
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// A foreign module loaded from a shared library.
///
/// Its name is the library's file name (e.g. `libdemo.so`), which is what
/// native methods list as their `soname`. Once resolved, the library stays
/// loaded after the `LibraryModule` is dropped.
pub struct LibraryModule {
    name: String,
    path: PathBuf,
    imports: *const JniImportDesc,
    import_count: usize,
    // Keeps `imports` and every resolved symbol mapped; shared with the
    // resolver once the module is bound.
    library: Arc<Library>,
}

impl LibraryModule {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| LoadError::InvalidName(path.clone()))?;

        // SAFETY: loading runs the library's initialisers; foreign modules are
        // trusted code.
        let library = unsafe { Library::new(&path) }.map_err(|e| LoadError::Open {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut import_count = 0usize;
        let imports = match unsafe { library.get::<ImportsFn>(IMPORTS_SYMBOL.as_bytes()) } {
            Ok(describe) => unsafe { describe(&mut import_count) },
            Err(_) => {
                log::debug!("{} exports no import table", name);
                std::ptr::null()
            }
        };
        if imports.is_null() {
            import_count = 0;
        }

        log::info!(
            "loaded foreign module '{}' from {} ({} import(s))",
            name,
            path.display(),
            import_count
        );

        Ok(LibraryModule {
            name,
            path,
            imports,
            import_count,
            library: Arc::new(library),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The module's published import table
    pub fn import_table(&self) -> &[JniImportDesc] {
        if self.imports.is_null() {
            return &[];
        }
        // SAFETY: the table is static data of the still-loaded library.
        unsafe { std::slice::from_raw_parts(self.imports, self.import_count) }
    }
}

impl ForeignModule for LibraryModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
        // SAFETY: the address is only stored, never called here.
        let symbol = unsafe { self.library.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        NonNull::new(*symbol)
    }

    fn imports(&self) -> Vec<ImportRequest> {
        import_requests(self.import_table())
    }

    fn bind_import(&mut self, index: usize, method: JMethodId) {
        if let Some(desc) = self.import_table().get(index) {
            // SAFETY: slots are statics of the still-loaded library.
            unsafe { desc.slot() }.set(method.0 as *const c_void);
        }
    }

    fn keep_alive(&self) -> Option<KeepAlive> {
        Some(Box::new(Arc::clone(&self.library)))
    }
}

impl std::fmt::Debug for LibraryModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("import_count", &self.import_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_an_error() {
        let err = LibraryModule::open("/nonexistent/libnothing.so").unwrap_err();
        assert!(matches!(err, LoadError::Open { .. }));
        assert!(err.to_string().contains("libnothing.so"));
    }

    #[test]
    fn test_name_required() {
        assert!(matches!(
            LibraryModule::open("/"),
            Err(LoadError::InvalidName(_))
        ));
    }
}
