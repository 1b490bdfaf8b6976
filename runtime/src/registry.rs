//! Class registry
//!
//! Registration happens in two phases. A [`ClassRegistry`] is filled during
//! initialisation through `&mut` access and rejects duplicate names and
//! instance fields lying outside their instance. [`ClassRegistry::seal`]
//! freezes it into a [`ClassTable`], which is read-only and shared freely.
//!
//! Classes defined anywhere in the link can also be submitted with
//! [`register_class!`](crate::register_class); [`global`] collects them into the
//! process-wide table on first use.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::descriptor::{qualified_name, Class, FieldId, ManagedMethod};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateClass { name: String },
    FieldOutOfBounds {
        class: String,
        field: String,
        offset: usize,
        instance_size: usize,
    },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateClass { name } => {
                write!(f, "class '{}' is already registered", name)
            }
            RegistryError::FieldOutOfBounds {
                class,
                field,
                offset,
                instance_size,
            } => write!(
                f,
                "field '{}.{}' at offset {} lies outside instance size {}",
                class, field, offset, instance_size
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Identifies one member of one class: `(classpath, classname, name, signature)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberKey<'a> {
    pub classpath: &'a str,
    pub classname: &'a str,
    pub name: &'a str,
    pub signature: &'a str,
}

impl std::fmt::Display for MemberKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}{}",
            qualified_name(self.classpath, self.classname),
            self.name,
            self.signature
        )
    }
}

// ============================================================================
// Building phase
// ============================================================================

/// Append-only collection of classes under construction.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<Arc<Class>>,
    by_name: HashMap<String, usize>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a class; the registry is unchanged on error.
    pub fn register(&mut self, class: Arc<Class>) -> Result<(), RegistryError> {
        let name = class.full_name();
        if self.by_name.contains_key(&name) {
            log::error!("duplicate class registration: {}", name);
            return Err(RegistryError::DuplicateClass { name });
        }

        for field in class.fields.iter() {
            if let Some(offset) = field.offset() {
                if offset >= class.instance_size {
                    return Err(RegistryError::FieldOutOfBounds {
                        class: name,
                        field: field.name.to_string(),
                        offset,
                        instance_size: class.instance_size,
                    });
                }
            }
        }

        log::debug!(
            "registered class {} ({} managed, {} native, {} fields)",
            name,
            class.managed_methods.len(),
            class.native_methods.len(),
            class.fields.len()
        );
        self.by_name.insert(name, self.classes.len());
        self.classes.push(class);
        Ok(())
    }

    /// Classes in registration order
    pub fn enumerate(&self) -> impl Iterator<Item = &Arc<Class>> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Freeze the registry.
    pub fn seal(self) -> ClassTable {
        log::debug!("sealed class table with {} classes", self.classes.len());
        ClassTable {
            classes: self.classes,
            by_name: self.by_name,
        }
    }

    /// Registry holding every class submitted with
    /// [`register_class!`](crate::register_class), ordered by full name.
    pub fn from_inventory() -> Result<Self, RegistryError> {
        let mut classes: Vec<Arc<Class>> = inventory::iter::<ClassRegistration>
            .into_iter()
            .map(|registration| (registration.build)())
            .collect();
        classes.sort_by_key(|class| class.full_name());

        let mut registry = ClassRegistry::new();
        for class in classes {
            registry.register(class)?;
        }
        Ok(registry)
    }
}

// ============================================================================
// Sealed table
// ============================================================================

/// Read-only class table produced by [`ClassRegistry::seal`].
#[derive(Debug)]
pub struct ClassTable {
    classes: Vec<Arc<Class>>,
    by_name: HashMap<String, usize>,
}

impl ClassTable {
    pub fn enumerate(&self) -> impl Iterator<Item = &Arc<Class>> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, classpath: &str, classname: &str) -> Option<&Arc<Class>> {
        self.find(&qualified_name(classpath, classname))
    }

    /// Look up by fully qualified name, e.g. `java/lang/String`
    pub fn find(&self, full_name: &str) -> Option<&Arc<Class>> {
        self.by_name.get(full_name).map(|&i| &self.classes[i])
    }

    pub fn find_method(&self, key: &MemberKey<'_>) -> Option<&ManagedMethod> {
        self.get(key.classpath, key.classname)?
            .find_method(key.name, key.signature)
    }

    pub fn find_field(&self, key: &MemberKey<'_>) -> Option<&FieldId> {
        self.get(key.classpath, key.classname)?
            .find_field(key.name, key.signature)
    }
}

// ============================================================================
// Link-time registration
// ============================================================================

/// A class constructor submitted with [`register_class!`](crate::register_class).
pub struct ClassRegistration {
    pub build: fn() -> Arc<Class>,
}

inventory::collect!(ClassRegistration);

/// Submit a class constructor to the process-wide table.
///
/// ```rust,ignore
/// fn point_class() -> Arc<Class> {
///     Class::build("demo", "Point", 0, |_| {})
/// }
///
/// jnishim_runtime::register_class!(point_class);
/// ```
#[macro_export]
macro_rules! register_class {
    ($build:path) => {
        $crate::inventory::submit! {
            $crate::registry::ClassRegistration { build: $build }
        }
    };
}

static GLOBAL: OnceLock<Result<ClassTable, RegistryError>> = OnceLock::new();

/// Process-wide table of every submitted class, sealed on first use.
pub fn global() -> Result<&'static ClassTable, RegistryError> {
    GLOBAL
        .get_or_init(|| ClassRegistry::from_inventory().map(ClassRegistry::seal))
        .as_ref()
        .map_err(Clone::clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{jint, JEnv, JObject};
    use crate::descriptor::FieldSpec;

    fn ping(_env: JEnv, _this: JObject) -> jint {
        1
    }

    fn class(cp: &'static str, cn: &'static str) -> Arc<Class> {
        Class::build(cp, cn, 16, |c| {
            c.virtual_method("ping", "()I", ping);
        })
    }

    #[test]
    fn test_register_preserves_order() {
        let mut registry = ClassRegistry::new();
        registry.register(class("demo", "B")).unwrap();
        registry.register(class("demo", "A")).unwrap();
        registry.register(class("", "[I")).unwrap();

        let names: Vec<String> = registry.enumerate().map(|c| c.full_name()).collect();
        assert_eq!(names, vec!["demo/B", "demo/A", "[I"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_duplicate_rejected_and_registry_unchanged() {
        let mut registry = ClassRegistry::new();
        registry.register(class("demo", "A")).unwrap();
        let err = registry.register(class("demo", "A")).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateClass {
                name: "demo/A".to_string()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_name_different_package_is_distinct() {
        let mut registry = ClassRegistry::new();
        registry.register(class("a", "Thing")).unwrap();
        registry.register(class("b", "Thing")).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_field_outside_instance_rejected() {
        let broken = Class::build("demo", "Broken", 8, |c| {
            c.field(FieldSpec::instance("tail", "J", 8));
        });
        let mut registry = ClassRegistry::new();
        assert!(matches!(
            registry.register(broken),
            Err(RegistryError::FieldOutOfBounds { offset: 8, .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sealed_lookup() {
        let mut registry = ClassRegistry::new();
        registry.register(class("demo", "A")).unwrap();
        registry.register(class("", "[I")).unwrap();
        let table = registry.seal();

        assert!(table.get("demo", "A").is_some());
        assert!(table.find("[I").is_some());
        assert!(table.get("demo", "Missing").is_none());

        let key = MemberKey {
            classpath: "demo",
            classname: "A",
            name: "ping",
            signature: "()I",
        };
        assert_eq!(table.find_method(&key).unwrap().name, "ping");
        assert!(table
            .find_method(&MemberKey {
                signature: "()J",
                ..key
            })
            .is_none());
        assert_eq!(key.to_string(), "demo/A.ping()I");
    }
}
