//! Runtime instance layout
//!
//! Every instance starts with an [`Object`] header naming its class. Concrete
//! layouts (`ArrayObject`, `StringObject`, user instance types) are
//! `#[repr(C)]` structs whose first field is that header, so a pointer to
//! any instance is also a pointer to its header. Going back from a handle to
//! a concrete layout is only done through
//! [`JObject::downcast_ref`](crate::abi::JObject::downcast_ref), which checks
//! the class tag first. Handles are made from the whole instance, never from
//! a borrow of its header.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::{c_char, CStr, CString};
use std::ptr::{self, NonNull};

use crate::abi::{jsize, JArray, JString};
use crate::descriptor::Class;

/// Alignment of array element buffers
const ELEMENT_ALIGN: usize = 8;

pub const STRING_CLASSPATH: &str = "java/lang";
pub const STRING_CLASSNAME: &str = "String";

/// Common header of every instance.
#[repr(C)]
#[derive(Debug)]
pub struct Object {
    clazz: NonNull<Class>,
}

impl Object {
    /// # Safety
    /// The header must become the first field of a `#[repr(C)]` instance
    /// whose layout is the one `clazz` describes.
    pub unsafe fn new(clazz: &'static Class) -> Self {
        Object {
            clazz: NonNull::from(clazz),
        }
    }

    pub fn class(&self) -> &'static Class {
        // SAFETY: constructed from a 'static reference and never changed.
        unsafe { self.clazz.as_ref() }
    }

    pub fn is_instance_of(&self, class: &Class) -> bool {
        ptr::eq(self.class(), class)
    }
}

/// A `#[repr(C)]` layout that begins with an [`Object`] header.
///
/// # Safety
/// Implementors must be `#[repr(C)]` with the header as first field, and
/// `accepts` must only return true for classes whose instances use `Self`.
pub unsafe trait ObjectLayout {
    fn header(&self) -> &Object;

    fn accepts(class: &Class) -> bool;
}

unsafe impl ObjectLayout for Object {
    fn header(&self) -> &Object {
        self
    }

    fn accepts(_class: &Class) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    /// Class cannot describe this layout
    ClassMismatch { expected: String, actual: String },
    NegativeLength(jsize),
    /// Zero or negative element size
    InvalidElementSize(jsize),
    /// `count * element_size` does not fit in memory
    TooLarge { count: jsize, element_size: jsize },
    /// Interior NUL in string contents
    InteriorNul(usize),
}

impl std::fmt::Display for ObjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectError::ClassMismatch { expected, actual } => {
                write!(f, "class '{}' cannot be used as {}", actual, expected)
            }
            ObjectError::NegativeLength(n) => write!(f, "negative array length {}", n),
            ObjectError::InvalidElementSize(n) => write!(f, "invalid element size {}", n),
            ObjectError::TooLarge {
                count,
                element_size,
            } => write!(f, "array of {} x {} bytes is too large", count, element_size),
            ObjectError::InteriorNul(pos) => write!(f, "string has interior NUL at byte {}", pos),
        }
    }
}

impl std::error::Error for ObjectError {}

// ============================================================================
// Arrays
// ============================================================================

/// Array instance: header plus a heap buffer of `count * element_size` bytes.
#[repr(C)]
#[derive(Debug)]
pub struct ArrayObject {
    header: Object,
    /// Class of the elements
    instance_clazz: NonNull<Class>,
    count: jsize,
    element_size: jsize,
    elements: *mut u8,
}

impl ArrayObject {
    /// Allocate a zero-filled array.
    pub fn new(
        array_class: &'static Class,
        element_class: &'static Class,
        count: jsize,
        element_size: jsize,
    ) -> Result<Box<ArrayObject>, ObjectError> {
        if !array_class.is_array() {
            return Err(ObjectError::ClassMismatch {
                expected: "an array class".to_string(),
                actual: array_class.full_name(),
            });
        }
        if count < 0 {
            return Err(ObjectError::NegativeLength(count));
        }
        if element_size <= 0 {
            return Err(ObjectError::InvalidElementSize(element_size));
        }

        let len = (count as usize)
            .checked_mul(element_size as usize)
            .ok_or(ObjectError::TooLarge {
                count,
                element_size,
            })?;

        let elements = if len == 0 {
            ptr::null_mut()
        } else {
            let layout = Layout::from_size_align(len, ELEMENT_ALIGN).map_err(|_| {
                ObjectError::TooLarge {
                    count,
                    element_size,
                }
            })?;
            // SAFETY: layout has non-zero size.
            let data = unsafe { alloc_zeroed(layout) };
            if data.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            data
        };

        Ok(Box::new(ArrayObject {
            // SAFETY: array_class was checked to describe an array layout.
            header: unsafe { Object::new(array_class) },
            instance_clazz: NonNull::from(element_class),
            count,
            element_size,
            elements,
        }))
    }

    pub fn len(&self) -> jsize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn element_size(&self) -> jsize {
        self.element_size
    }

    pub fn element_class(&self) -> &'static Class {
        // SAFETY: constructed from a 'static reference.
        unsafe { self.instance_clazz.as_ref() }
    }

    /// Length of the data buffer in bytes
    pub fn data_len(&self) -> usize {
        self.count as usize * self.element_size as usize
    }

    pub fn data_ptr(&self) -> *mut u8 {
        self.elements
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.elements.is_null() {
            return &[];
        }
        // SAFETY: buffer holds data_len initialised bytes.
        unsafe { std::slice::from_raw_parts(self.elements, self.data_len()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.elements.is_null() {
            return &mut [];
        }
        // SAFETY: buffer holds data_len initialised bytes, uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.elements, self.data_len()) }
    }

    pub fn as_object(&self) -> &Object {
        &self.header
    }

    /// Handle through which elements may be written
    pub fn as_handle(&mut self) -> JArray {
        JArray(self as *mut ArrayObject)
    }
}

impl Drop for ArrayObject {
    fn drop(&mut self) {
        if self.elements.is_null() {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(self.data_len(), ELEMENT_ALIGN) {
            // SAFETY: allocated in new() with this exact layout.
            unsafe { dealloc(self.elements, layout) };
        }
    }
}

unsafe impl ObjectLayout for ArrayObject {
    fn header(&self) -> &Object {
        &self.header
    }

    fn accepts(class: &Class) -> bool {
        class.is_array()
    }
}

// ============================================================================
// Strings
// ============================================================================

/// String instance over a NUL-terminated byte buffer.
///
/// The buffer is owned when built with [`StringObject::new_owned`] and
/// borrowed from static data when built with [`StringObject::from_static`].
#[repr(C)]
#[derive(Debug)]
pub struct StringObject {
    header: Object,
    str: *const c_char,
    storage: Option<CString>,
}

impl StringObject {
    /// Copy `s` into a new owned buffer.
    pub fn new_owned(class: &'static Class, s: &str) -> Result<Box<StringObject>, ObjectError> {
        check_string_class(class)?;
        let storage = CString::new(s).map_err(|e| ObjectError::InteriorNul(e.nul_position()))?;
        Ok(Box::new(StringObject {
            // SAFETY: class was checked to be the string class.
            header: unsafe { Object::new(class) },
            str: storage.as_ptr(),
            storage: Some(storage),
        }))
    }

    /// Borrow static contents without copying.
    pub fn from_static(
        class: &'static Class,
        s: &'static CStr,
    ) -> Result<Box<StringObject>, ObjectError> {
        check_string_class(class)?;
        Ok(Box::new(StringObject {
            // SAFETY: class was checked to be the string class.
            header: unsafe { Object::new(class) },
            str: s.as_ptr(),
            storage: None,
        }))
    }

    pub fn is_owned(&self) -> bool {
        self.storage.is_some()
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.str
    }

    pub fn as_c_str(&self) -> &CStr {
        // SAFETY: points at a NUL-terminated buffer living as long as self.
        unsafe { CStr::from_ptr(self.str) }
    }

    /// Length in UTF-16 code units, as the managed side counts it
    pub fn utf16_len(&self) -> usize {
        String::from_utf8_lossy(self.as_c_str().to_bytes())
            .encode_utf16()
            .count()
    }

    pub fn as_object(&self) -> &Object {
        &self.header
    }

    pub fn as_handle(&self) -> JString {
        JString(self as *const StringObject as *mut StringObject)
    }
}

fn check_string_class(class: &Class) -> Result<(), ObjectError> {
    if class.matches(STRING_CLASSPATH, STRING_CLASSNAME) {
        Ok(())
    } else {
        Err(ObjectError::ClassMismatch {
            expected: format!("{}/{}", STRING_CLASSPATH, STRING_CLASSNAME),
            actual: class.full_name(),
        })
    }
}

unsafe impl ObjectLayout for StringObject {
    fn header(&self) -> &Object {
        &self.header
    }

    fn accepts(class: &Class) -> bool {
        class.matches(STRING_CLASSPATH, STRING_CLASSNAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::JObject;
    use std::sync::Arc;

    fn leak(class: Arc<Class>) -> &'static Class {
        &**Box::leak(Box::new(class))
    }

    fn int_array_class() -> &'static Class {
        leak(Class::build("", "[I", std::mem::size_of::<ArrayObject>(), |_| {}))
    }

    fn int_class() -> &'static Class {
        leak(Class::build("", "int", 4, |_| {}))
    }

    fn string_class() -> &'static Class {
        leak(Class::build_for::<StringObject>(STRING_CLASSPATH, STRING_CLASSNAME, |_| {}))
    }

    #[test]
    fn test_array_buffer_length() {
        let array = ArrayObject::new(int_array_class(), int_class(), 5, 4).unwrap();
        assert_eq!(array.len(), 5);
        assert_eq!(array.data_len(), 20);
        assert_eq!(array.as_bytes().len(), 20);
        assert!(array.as_bytes().iter().all(|b| *b == 0));
        assert_eq!(array.data_ptr() as usize % ELEMENT_ALIGN, 0);
    }

    #[test]
    fn test_empty_array() {
        let array = ArrayObject::new(int_array_class(), int_class(), 0, 4).unwrap();
        assert!(array.is_empty());
        assert!(array.as_bytes().is_empty());
    }

    #[test]
    fn test_array_rejects_bad_shapes() {
        assert_eq!(
            ArrayObject::new(int_array_class(), int_class(), -1, 4).unwrap_err(),
            ObjectError::NegativeLength(-1)
        );
        assert_eq!(
            ArrayObject::new(int_array_class(), int_class(), 1, 0).unwrap_err(),
            ObjectError::InvalidElementSize(0)
        );
        assert!(matches!(
            ArrayObject::new(int_class(), int_class(), 1, 4),
            Err(ObjectError::ClassMismatch { .. })
        ));
    }

    #[test]
    fn test_header_is_first() {
        let array = ArrayObject::new(int_array_class(), int_class(), 2, 4).unwrap();
        let header = array.as_object();
        assert_eq!(header as *const Object as usize, &*array as *const ArrayObject as usize);
        assert!(header.class().is_array());
    }

    #[test]
    fn test_downcast_checks_class_tag() {
        let mut array = ArrayObject::new(int_array_class(), int_class(), 2, 4).unwrap();
        let handle = JObject::from(array.as_handle());
        unsafe {
            assert_eq!(handle.downcast_ref::<ArrayObject>().unwrap().len(), 2);
            assert!(handle.downcast_ref::<StringObject>().is_none());
            assert!(JObject::null().downcast_ref::<ArrayObject>().is_none());
        }

        let s = StringObject::new_owned(string_class(), "hi").unwrap();
        let handle = JObject::from(s.as_handle());
        unsafe {
            assert!(handle.downcast_ref::<StringObject>().is_some());
            assert!(handle.downcast_ref::<ArrayObject>().is_none());
        }
    }

    #[test]
    fn test_downcast_mut_reaches_whole_instance() {
        let mut array = ArrayObject::new(int_array_class(), int_class(), 3, 4).unwrap();
        let handle = JObject::from(array.as_handle());
        let view = unsafe { handle.downcast_mut::<ArrayObject>() }.unwrap();
        view.as_bytes_mut()[4] = 9;
        assert_eq!(array.as_bytes()[4], 9);
    }

    #[test]
    fn test_string_ownership() {
        let owned = StringObject::new_owned(string_class(), "h\u{e9}llo").unwrap();
        assert!(owned.is_owned());
        assert_eq!(owned.as_c_str().to_str().unwrap(), "h\u{e9}llo");
        assert_eq!(owned.utf16_len(), 5);

        static TEXT: &CStr = c"static";
        let borrowed = StringObject::from_static(string_class(), TEXT).unwrap();
        assert!(!borrowed.is_owned());
        assert_eq!(borrowed.as_ptr(), TEXT.as_ptr());
    }

    #[test]
    fn test_string_rejects_nul_and_wrong_class() {
        assert_eq!(
            StringObject::new_owned(string_class(), "a\0b").unwrap_err(),
            ObjectError::InteriorNul(1)
        );
        assert!(StringObject::new_owned(int_class(), "x").is_err());
    }
}
