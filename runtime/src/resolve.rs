//! Native resolution
//!
//! Connects a loaded foreign module with the class table in both directions:
//!
//! - every [`NativeMethod`](crate::descriptor::NativeMethod) whose `soname`
//!   names the module is bound to the module's `Java_…` export (short symbol
//!   first, then the long overload form);
//! - every host method the module imports is looked up by
//!   [`MemberKey`] and its [`JMethodId`] written into the module's slot.
//!
//! Resolution is all-or-nothing. Every target is located before anything is
//! bound, and a single miss fails the module with the full list of misses.
//! A resolved module's [`KeepAlive`] is held here for the rest of the
//! process, so bound addresses stay mapped after the caller drops its handle.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;

use jnishim_plugin::{shape, ForeignModuleDesc, JniImportDesc};
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::abi::{jint, JMethodId, JNI_ERR, JNI_OK};
use crate::descriptor::NativeMethod;
use crate::dispatch::CallShape;
use crate::registry::{self, ClassTable, MemberKey, RegistryError};

/// Keeps a module's code and data mapped while held.
pub type KeepAlive = Box<dyn Any + Send>;

enum ModuleState {
    /// Claimed by a resolution in progress
    Resolving,
    Resolved { _keep_alive: Option<KeepAlive> },
}

lazy_static! {
    /// Modules claimed or resolved so far in this process, by name
    static ref RESOLVED_MODULES: Mutex<HashMap<String, ModuleState>> = Mutex::new(HashMap::new());
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    AlreadyResolved(String),
    /// Every member that could not be located; nothing was bound
    Unresolved { module: String, missing: Vec<String> },
    Registry(RegistryError),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::AlreadyResolved(module) => {
                write!(f, "module '{}' is already resolved", module)
            }
            ResolveError::Unresolved { module, missing } => write!(
                f,
                "module '{}' has {} unresolved member(s): {}",
                module,
                missing.len(),
                missing.join(", ")
            ),
            ResolveError::Registry(e) => write!(f, "class table unavailable: {}", e),
        }
    }
}

impl std::error::Error for ResolveError {}

impl From<RegistryError> for ResolveError {
    fn from(e: RegistryError) -> Self {
        ResolveError::Registry(e)
    }
}

/// One host method a foreign module asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    /// Slot index handed back to [`ForeignModule::bind_import`]
    pub index: usize,
    pub classpath: String,
    pub classname: String,
    pub method: String,
    pub signature: String,
    /// `None` when the module declared an unknown shape
    pub shape: Option<CallShape>,
    /// First descriptor string that is not valid UTF-8
    pub malformed: Option<&'static str>,
}

impl ImportRequest {
    pub fn key(&self) -> MemberKey<'_> {
        MemberKey {
            classpath: &self.classpath,
            classname: &self.classname,
            name: &self.method,
            signature: &self.signature,
        }
    }
}

/// A loaded foreign module, as seen by the resolver.
pub trait ForeignModule {
    /// Module name; matched against `NativeMethod::soname`
    fn name(&self) -> &str;

    /// Address of an exported symbol
    fn symbol(&self, name: &str) -> Option<NonNull<c_void>>;

    /// Host methods the module imports
    fn imports(&self) -> Vec<ImportRequest>;

    /// Store the id of import `index`
    fn bind_import(&mut self, index: usize, method: JMethodId);

    /// Handle that keeps the module's exports and import slots mapped. The
    /// resolver holds it once the module is bound; `None` when something else
    /// owns the mapping.
    fn keep_alive(&self) -> Option<KeepAlive> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub module: String,
    pub natives_bound: usize,
    pub imports_bound: usize,
}

/// Map a [`jnishim_plugin::shape`] tag to a call shape.
pub fn shape_from_tag(tag: u8) -> Option<CallShape> {
    match tag {
        shape::VIRTUAL => Some(CallShape::Virtual),
        shape::STATIC => Some(CallShape::Static),
        shape::NONVIRTUAL => Some(CallShape::NonVirtual),
        _ => None,
    }
}

/// Resolve `module` against `table`.
///
/// Fails without binding anything if any native method or import cannot be
/// located, or if a module of the same name was already resolved.
pub fn resolve_native(
    table: &ClassTable,
    module: &mut dyn ForeignModule,
) -> Result<ResolveReport, ResolveError> {
    let name = module.name().to_string();
    {
        let mut modules = RESOLVED_MODULES.lock();
        if modules.contains_key(&name) {
            log::error!("module '{}' resolved twice", name);
            return Err(ResolveError::AlreadyResolved(name));
        }
        modules.insert(name.clone(), ModuleState::Resolving);
    }

    // The ledger is not locked here: lookups and slot writes call into the
    // module, which may resolve other modules.
    let outcome = bind_module(table, module, &name);
    let keep_alive = if outcome.is_ok() { module.keep_alive() } else { None };

    let mut modules = RESOLVED_MODULES.lock();
    match outcome {
        Ok(report) => {
            modules.insert(
                name,
                ModuleState::Resolved {
                    _keep_alive: keep_alive,
                },
            );
            Ok(report)
        }
        Err(e) => {
            modules.remove(&name);
            Err(e)
        }
    }
}

fn bind_module(
    table: &ClassTable,
    module: &mut dyn ForeignModule,
    name: &str,
) -> Result<ResolveReport, ResolveError> {
    let mut missing = Vec::new();

    let mut natives: Vec<(&NativeMethod, NonNull<c_void>)> = Vec::new();
    for class in table.enumerate() {
        for native in class.native_methods.iter().filter(|m| m.soname == name) {
            let found = native
                .symbol_candidates(class)
                .iter()
                .find_map(|symbol| module.symbol(symbol));
            match found {
                Some(target) => natives.push((native, target)),
                None => {
                    let [short, long] = native.symbol_candidates(class);
                    missing.push(format!("native {} (tried {}, {})", short, short, long));
                }
            }
        }
    }

    let mut imports: Vec<(usize, JMethodId)> = Vec::new();
    for request in module.imports() {
        if let Some(field) = request.malformed {
            missing.push(format!(
                "import #{} has a {} that is not valid UTF-8",
                request.index, field
            ));
            continue;
        }
        let key = request.key();
        match (table.find_method(&key), request.shape) {
            (Some(method), Some(shape)) if method.shape == shape => {
                imports.push((request.index, method.id()))
            }
            (Some(method), Some(shape)) => missing.push(format!(
                "import {} declared {} but registered {}",
                key, shape, method.shape
            )),
            (Some(_), None) => missing.push(format!("import {} has an unknown call shape", key)),
            (None, _) => missing.push(format!("import {}", key)),
        }
    }

    if !missing.is_empty() {
        for miss in missing.iter() {
            log::error!("module '{}': unresolved {}", name, miss);
        }
        return Err(ResolveError::Unresolved {
            module: name.to_string(),
            missing,
        });
    }

    for (native, target) in natives.iter() {
        native.bind(*target);
        log::debug!("bound native {}{} -> {:p}", native.name, native.signature, target.as_ptr());
    }
    for (index, id) in imports.iter() {
        module.bind_import(*index, *id);
    }

    log::info!(
        "resolved module '{}': {} native(s), {} import(s)",
        name,
        natives.len(),
        imports.len()
    );

    Ok(ResolveReport {
        module: name.to_string(),
        natives_bound: natives.len(),
        imports_bound: imports.len(),
    })
}

/// Resolve `module` against the process-wide [`registry::global`] table.
pub fn resolve_global(module: &mut dyn ForeignModule) -> Result<ResolveReport, ResolveError> {
    let table = registry::global()?;
    resolve_native(table, module)
}

/// Whether a module of this name has been resolved
pub fn is_resolved(module: &str) -> bool {
    matches!(
        RESOLVED_MODULES.lock().get(module),
        Some(ModuleState::Resolved { .. })
    )
}

// ============================================================================
// Modules described by an external loader
// ============================================================================

/// [`ForeignModule`] over a [`ForeignModuleDesc`] filled in by a C loader.
pub struct RawModule<'a> {
    desc: &'a ForeignModuleDesc,
    name: String,
}

impl<'a> RawModule<'a> {
    /// # Safety
    /// Every pointer in `desc` must be valid for the lifetime `'a`, and
    /// `desc.lookup` must be callable with `desc.ctx`.
    pub unsafe fn new(desc: &'a ForeignModuleDesc) -> Self {
        let name = if desc.name.is_null() {
            String::new()
        } else {
            let bytes = std::slice::from_raw_parts(desc.name, desc.name_len);
            String::from_utf8_lossy(bytes).into_owned()
        };
        RawModule { desc, name }
    }

    fn table(&self) -> &'a [JniImportDesc] {
        if self.desc.imports.is_null() {
            return &[];
        }
        // SAFETY: guaranteed by the contract of RawModule::new.
        unsafe { std::slice::from_raw_parts(self.desc.imports, self.desc.import_count) }
    }
}

impl ForeignModule for RawModule<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
        // SAFETY: guaranteed by the contract of RawModule::new.
        let ptr = unsafe { (self.desc.lookup)(self.desc.ctx, name.as_ptr(), name.len()) };
        NonNull::new(ptr as *mut c_void)
    }

    fn imports(&self) -> Vec<ImportRequest> {
        import_requests(self.table())
    }

    fn bind_import(&mut self, index: usize, method: JMethodId) {
        if let Some(desc) = self.table().get(index) {
            // SAFETY: slot pointers in the table are live for 'a.
            unsafe { desc.slot() }.set(method.0 as *const c_void);
        }
    }
}

/// Decode an import table published by a foreign module.
///
/// An entry whose strings are not UTF-8 is kept, marked `malformed`, so the
/// resolver fails the module on it.
pub(crate) fn import_requests(table: &[JniImportDesc]) -> Vec<ImportRequest> {
    table
        .iter()
        .enumerate()
        .map(|(index, desc)| {
            let mut malformed = None;
            let mut text = |field: &'static str, value: Option<&str>| match value {
                Some(value) => value.to_string(),
                None => {
                    malformed.get_or_insert(field);
                    String::new()
                }
            };
            // SAFETY: descriptor strings point at static data of the module.
            let (classpath, classname, method, signature) = unsafe {
                (
                    text("classpath", desc.classpath()),
                    text("classname", desc.classname()),
                    text("method", desc.method()),
                    text("signature", desc.signature()),
                )
            };
            ImportRequest {
                index,
                classpath,
                classname,
                method,
                signature,
                shape: shape_from_tag(desc.shape),
                malformed,
            }
        })
        .collect()
}

/// C entry point for loaders that perform the `dlopen` themselves.
///
/// Returns [`JNI_OK`] when every member of the module was bound and
/// [`JNI_ERR`] otherwise; failures are logged.
///
/// # Safety
/// `desc` must be null or point at a valid [`ForeignModuleDesc`].
#[no_mangle]
pub unsafe extern "C" fn jnishim_resolve_native(desc: *const ForeignModuleDesc) -> jint {
    let Some(desc) = desc.as_ref() else {
        log::error!("jnishim_resolve_native: null module descriptor");
        return JNI_ERR;
    };
    let mut module = RawModule::new(desc);
    match resolve_global(&mut module) {
        Ok(_) => JNI_OK,
        Err(e) => {
            log::error!("jnishim_resolve_native: {}", e);
            JNI_ERR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{jint, JEnv, JObject};
    use crate::descriptor::Class;
    use crate::registry::ClassRegistry;
    use jnishim_plugin::ImportSlot;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn ping(_env: JEnv, _this: JObject) -> jint {
        1
    }

    struct FakeModule {
        name: &'static str,
        symbols: HashMap<String, usize>,
        imports: Vec<ImportRequest>,
        bound: HashMap<usize, JMethodId>,
        mapping: Option<Arc<Mapping>>,
    }

    /// Stands in for a loaded library; records when it is released.
    struct Mapping(Arc<AtomicBool>);

    impl Drop for Mapping {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl FakeModule {
        fn new(name: &'static str) -> Self {
            FakeModule {
                name,
                symbols: HashMap::new(),
                imports: Vec::new(),
                bound: HashMap::new(),
                mapping: None,
            }
        }

        fn mapped(mut self, unmapped: &Arc<AtomicBool>) -> Self {
            self.mapping = Some(Arc::new(Mapping(Arc::clone(unmapped))));
            self
        }

        fn export(mut self, symbol: &str, addr: usize) -> Self {
            self.symbols.insert(symbol.to_string(), addr);
            self
        }

        fn import(mut self, cp: &str, cn: &str, m: &str, sig: &str, shape: CallShape) -> Self {
            self.imports.push(ImportRequest {
                index: self.imports.len(),
                classpath: cp.to_string(),
                classname: cn.to_string(),
                method: m.to_string(),
                signature: sig.to_string(),
                shape: Some(shape),
                malformed: None,
            });
            self
        }
    }

    impl ForeignModule for FakeModule {
        fn name(&self) -> &str {
            self.name
        }

        fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
            self.symbols
                .get(name)
                .and_then(|&addr| NonNull::new(addr as *mut c_void))
        }

        fn imports(&self) -> Vec<ImportRequest> {
            self.imports.clone()
        }

        fn bind_import(&mut self, index: usize, method: JMethodId) {
            self.bound.insert(index, method);
        }

        fn keep_alive(&self) -> Option<KeepAlive> {
            self.mapping
                .as_ref()
                .map(|mapping| Box::new(Arc::clone(mapping)) as KeepAlive)
        }
    }

    fn table(soname: &'static str) -> ClassTable {
        let mut registry = ClassRegistry::new();
        registry
            .register(Class::build("demo", "Widget", 0, |c| {
                c.virtual_method("ping", "()I", ping)
                    .native_method("draw", "()V", soname)
                    .native_method("scale", "(I)V", soname)
                    .native_method("other", "()V", "libother.so");
            }))
            .unwrap();
        registry.seal()
    }

    fn widget(table: &ClassTable) -> &Arc<Class> {
        table.get("demo", "Widget").unwrap()
    }

    #[test]
    fn test_binds_natives_and_imports() {
        let table = table("libwidget_ok.so");
        let mut module = FakeModule::new("libwidget_ok.so")
            .export("Java_demo_Widget_draw", 0x10)
            .export("Java_demo_Widget_scale__I", 0x20)
            .import("demo", "Widget", "ping", "()I", CallShape::Virtual);

        let report = resolve_native(&table, &mut module).unwrap();
        assert_eq!(report.natives_bound, 2);
        assert_eq!(report.imports_bound, 1);

        let class = widget(&table);
        let draw = class.find_native_method("draw", "()V").unwrap();
        assert_eq!(draw.bound().unwrap().as_ptr() as usize, 0x10);
        let scale = class.find_native_method("scale", "(I)V").unwrap();
        assert_eq!(scale.bound().unwrap().as_ptr() as usize, 0x20);
        assert!(!class.find_native_method("other", "()V").unwrap().is_bound());

        let ping = class.find_method("ping", "()I").unwrap();
        assert_eq!(module.bound[&0], ping.id());
        assert!(is_resolved("libwidget_ok.so"));
    }

    #[test]
    fn test_short_symbol_preferred() {
        let table = table("libwidget_short.so");
        let mut module = FakeModule::new("libwidget_short.so")
            .export("Java_demo_Widget_draw", 0x10)
            .export("Java_demo_Widget_draw__", 0x11)
            .export("Java_demo_Widget_scale", 0x20);
        resolve_native(&table, &mut module).unwrap();
        let draw = widget(&table).find_native_method("draw", "()V").unwrap();
        assert_eq!(draw.bound().unwrap().as_ptr() as usize, 0x10);
    }

    #[test]
    fn test_any_miss_binds_nothing() {
        let table = table("libwidget_miss.so");
        let mut module = FakeModule::new("libwidget_miss.so")
            .export("Java_demo_Widget_draw", 0x10)
            .import("demo", "Widget", "ping", "()I", CallShape::Virtual)
            .import("demo", "Widget", "missing", "()V", CallShape::Static);

        let err = resolve_native(&table, &mut module).unwrap_err();
        match err {
            ResolveError::Unresolved { module: name, missing } => {
                assert_eq!(name, "libwidget_miss.so");
                assert_eq!(missing.len(), 2);
                assert!(missing[0].contains("Java_demo_Widget_scale"));
                assert!(missing[1].contains("demo/Widget.missing()V"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let class = widget(&table);
        assert!(!class.find_native_method("draw", "()V").unwrap().is_bound());
        assert!(module.bound.is_empty());
        assert!(!is_resolved("libwidget_miss.so"));
    }

    #[test]
    fn test_import_shape_must_match() {
        let table = table("libwidget_shape.so");
        let mut module = FakeModule::new("libwidget_shape.so")
            .export("Java_demo_Widget_draw", 0x10)
            .export("Java_demo_Widget_scale", 0x20)
            .import("demo", "Widget", "ping", "()I", CallShape::Static);
        assert!(matches!(
            resolve_native(&table, &mut module),
            Err(ResolveError::Unresolved { .. })
        ));
    }

    #[test]
    fn test_module_resolved_once() {
        let table = table("libwidget_twice.so");
        let mut module = FakeModule::new("libwidget_twice.so")
            .export("Java_demo_Widget_draw", 0x10)
            .export("Java_demo_Widget_scale", 0x20);
        resolve_native(&table, &mut module).unwrap();
        assert_eq!(
            resolve_native(&table, &mut module).unwrap_err(),
            ResolveError::AlreadyResolved("libwidget_twice.so".to_string())
        );
    }

    #[test]
    fn test_shape_tags() {
        assert_eq!(shape_from_tag(shape::VIRTUAL), Some(CallShape::Virtual));
        assert_eq!(shape_from_tag(shape::STATIC), Some(CallShape::Static));
        assert_eq!(shape_from_tag(shape::NONVIRTUAL), Some(CallShape::NonVirtual));
        assert_eq!(shape_from_tag(9), None);
    }

    #[test]
    fn test_resolved_module_stays_mapped() {
        let table = table("libwidget_kept.so");
        let unmapped = Arc::new(AtomicBool::new(false));
        let mut module = FakeModule::new("libwidget_kept.so")
            .export("Java_demo_Widget_draw", 0x10)
            .export("Java_demo_Widget_scale", 0x20)
            .mapped(&unmapped);
        resolve_native(&table, &mut module).unwrap();
        drop(module);

        assert!(!unmapped.load(Ordering::SeqCst));
        assert!(widget(&table).find_native_method("draw", "()V").unwrap().is_bound());
        assert!(is_resolved("libwidget_kept.so"));
    }

    #[test]
    fn test_failed_module_is_released() {
        let table = table("libwidget_dropped.so");
        let unmapped = Arc::new(AtomicBool::new(false));
        let mut module = FakeModule::new("libwidget_dropped.so")
            .export("Java_demo_Widget_draw", 0x10)
            .mapped(&unmapped);
        assert!(resolve_native(&table, &mut module).is_err());
        drop(module);
        assert!(unmapped.load(Ordering::SeqCst));

        let mut retry = FakeModule::new("libwidget_dropped.so")
            .export("Java_demo_Widget_draw", 0x10)
            .export("Java_demo_Widget_scale", 0x20);
        assert!(resolve_native(&table, &mut retry).is_ok());
    }

    /// Resolves another module from inside its own symbol lookup.
    struct NestingModule {
        table: &'static ClassTable,
        nested: parking_lot::Mutex<Option<Result<ResolveReport, ResolveError>>>,
    }

    impl ForeignModule for NestingModule {
        fn name(&self) -> &str {
            "libwidget_outer.so"
        }

        fn symbol(&self, _name: &str) -> Option<NonNull<c_void>> {
            let mut nested = self.nested.lock();
            if nested.is_none() {
                let mut inner = FakeModule::new("libwidget_inner.so");
                *nested = Some(resolve_native(self.table, &mut inner));
            }
            NonNull::new(0x30 as *mut c_void)
        }

        fn imports(&self) -> Vec<ImportRequest> {
            Vec::new()
        }

        fn bind_import(&mut self, _index: usize, _method: JMethodId) {}
    }

    #[test]
    fn test_lookup_may_resolve_another_module() {
        let table: &'static ClassTable = Box::leak(Box::new(table("libwidget_outer.so")));
        let mut module = NestingModule {
            table,
            nested: parking_lot::Mutex::new(None),
        };
        let report = resolve_native(table, &mut module).unwrap();
        assert_eq!(report.natives_bound, 2);

        let nested = module.nested.lock().take().unwrap().unwrap();
        assert_eq!(nested.module, "libwidget_inner.so");
        assert!(is_resolved("libwidget_inner.so"));
    }

    static GOOD_SLOT: ImportSlot = ImportSlot::new();
    static BAD_SLOT: ImportSlot = ImportSlot::new();
    static BAD_CLASSPATH: [u8; 2] = [0xff, 0xfe];

    unsafe extern "C" fn no_symbols(_ctx: *mut c_void, _name: *const u8, _len: usize) -> *const c_void {
        std::ptr::null()
    }

    fn import_desc(classpath: &'static [u8], slot: &'static ImportSlot) -> JniImportDesc {
        JniImportDesc {
            classpath: classpath.as_ptr(),
            classpath_len: classpath.len(),
            classname: "Widget".as_ptr(),
            classname_len: 6,
            method: "ping".as_ptr(),
            method_len: 4,
            signature: "()I".as_ptr(),
            signature_len: 3,
            shape: shape::VIRTUAL,
            slot,
        }
    }

    #[test]
    fn test_non_utf8_import_fails_module() {
        let table = table("libwidget_elsewhere.so");
        let imports = [
            import_desc(b"demo", &GOOD_SLOT),
            import_desc(&BAD_CLASSPATH, &BAD_SLOT),
        ];
        let name = "libwidget_bytes.so";
        let desc = ForeignModuleDesc {
            name: name.as_ptr(),
            name_len: name.len(),
            ctx: std::ptr::null_mut(),
            lookup: no_symbols,
            imports: imports.as_ptr(),
            import_count: imports.len(),
        };
        let mut module = unsafe { RawModule::new(&desc) };

        let requests = module.imports();
        assert_eq!(requests[0].malformed, None);
        assert_eq!(requests[1].malformed, Some("classpath"));
        assert!(requests[1].classpath.is_empty());

        match resolve_native(&table, &mut module).unwrap_err() {
            ResolveError::Unresolved { missing, .. } => {
                assert_eq!(missing.len(), 1);
                assert!(missing[0].contains("import #1"));
                assert!(missing[0].contains("classpath"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!GOOD_SLOT.is_bound());
        assert!(!BAD_SLOT.is_bound());
    }
}
