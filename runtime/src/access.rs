//! Field and array element access
//!
//! Builds on the layout contract of [`crate::object`] and the addressing
//! contract of [`FieldId`]: a static field lives at its recorded address, an
//! instance field at `instance base + offset`. Array accesses are checked
//! against `[0, count)` and against the element size before any memory is
//! touched.

use std::mem::size_of;
use std::ptr;

use crate::abi::{jsize, JObject};
use crate::descriptor::{FieldId, FieldKind};
use crate::object::ArrayObject;
use crate::safety::{report_violation, SafetyViolation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    IndexOutOfBounds { index: jsize, count: jsize },
    /// Region `[start, start + len)` leaves the array
    RegionOutOfBounds { start: jsize, len: usize, count: jsize },
    /// Accessed type width differs from the array's element size
    ElementSizeMismatch { expected: usize, actual: usize },
    /// Instance field accessed without an instance
    MissingInstance(String),
    /// Instance does not belong to the field's class
    ClassMismatch { field: String, instance_class: String },
    /// Value would extend past the end of the instance
    FieldOverrun { field: String, end: usize, instance_size: usize },
    /// Handle names an instance of a class the operation does not accept
    InstanceClass { function: String, class: String },
}

impl std::fmt::Display for AccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessError::IndexOutOfBounds { index, count } => {
                write!(f, "index {} out of bounds for length {}", index, count)
            }
            AccessError::RegionOutOfBounds { start, len, count } => write!(
                f,
                "region [{}, {}+{}) out of bounds for length {}",
                start, start, len, count
            ),
            AccessError::ElementSizeMismatch { expected, actual } => write!(
                f,
                "element size is {} bytes, accessed as {} bytes",
                expected, actual
            ),
            AccessError::MissingInstance(field) => {
                write!(f, "instance field '{}' accessed without an instance", field)
            }
            AccessError::ClassMismatch {
                field,
                instance_class,
            } => write!(
                f,
                "field '{}' does not belong to class '{}'",
                field, instance_class
            ),
            AccessError::FieldOverrun {
                field,
                end,
                instance_size,
            } => write!(
                f,
                "field '{}' ends at byte {} past instance size {}",
                field, end, instance_size
            ),
            AccessError::InstanceClass { function, class } => {
                write!(f, "{} does not accept an instance of '{}'", function, class)
            }
        }
    }
}

impl std::error::Error for AccessError {}

// ============================================================================
// Fields
// ============================================================================

/// Address of a field's storage for a value of `width` bytes.
///
/// `instance` is ignored for static fields and required for instance fields.
/// The returned address carries the provenance of `instance`, so it is
/// writable when the handle was made with [`JObject::from_instance`].
///
/// # Safety
/// `instance` must be null or point at a live instance.
pub unsafe fn field_address(
    field: &FieldId,
    instance: JObject,
    width: usize,
) -> Result<*mut u8, AccessError> {
    match field.kind {
        FieldKind::Static => Ok(field.address as *mut u8),
        FieldKind::Instance => {
            let class = instance.class().ok_or_else(|| {
                report_violation(SafetyViolation::NullHandle, "field_address", field.name);
                AccessError::MissingInstance(field.name.to_string())
            })?;

            let owned = field
                .owner()
                .map(|owner| ptr::eq(&*owner, class))
                .unwrap_or(false);
            if !owned {
                report_violation(
                    SafetyViolation::ClassMismatch,
                    "field_address",
                    &format!("{} on {}", field.name, class.full_name()),
                );
                return Err(AccessError::ClassMismatch {
                    field: field.name.to_string(),
                    instance_class: class.full_name(),
                });
            }

            let end = field.address + width;
            if end > class.instance_size {
                return Err(AccessError::FieldOverrun {
                    field: field.name.to_string(),
                    end,
                    instance_size: class.instance_size,
                });
            }

            // offset + width lies within the instance
            Ok((instance.0 as *mut u8).add(field.address))
        }
    }
}

/// Read a field as `T`.
///
/// # Safety
/// `T` must match the field's declared type, and a static field's address
/// must still be live. `instance` as for [`field_address`].
pub unsafe fn get_field<T: Copy>(field: &FieldId, instance: JObject) -> Result<T, AccessError> {
    let addr = field_address(field, instance, size_of::<T>())?;
    Ok(ptr::read_unaligned(addr as *const T))
}

/// Write a field as `T`.
///
/// # Safety
/// As [`get_field`]; the storage must also be writable (a static field needs
/// interior mutability, an instance handle must come from
/// [`JObject::from_instance`] and no other reference to it may be live).
pub unsafe fn set_field<T: Copy>(
    field: &FieldId,
    instance: JObject,
    value: T,
) -> Result<(), AccessError> {
    let addr = field_address(field, instance, size_of::<T>())?;
    ptr::write_unaligned(addr as *mut T, value);
    Ok(())
}

// ============================================================================
// Arrays
// ============================================================================

/// Address of element `index`, rejecting indices outside `[0, count)`.
pub fn element_ptr(array: &ArrayObject, index: jsize) -> Result<*mut u8, AccessError> {
    if index < 0 || index >= array.len() {
        report_violation(
            SafetyViolation::IndexOutOfBounds,
            "element_ptr",
            &format!("index {} for length {}", index, array.len()),
        );
        return Err(AccessError::IndexOutOfBounds {
            index,
            count: array.len(),
        });
    }
    let offset = index as usize * array.element_size() as usize;
    // SAFETY: index < count, so offset is inside the data buffer.
    Ok(unsafe { array.data_ptr().add(offset) })
}

fn check_width<T>(array: &ArrayObject) -> Result<(), AccessError> {
    let expected = array.element_size() as usize;
    if size_of::<T>() != expected {
        return Err(AccessError::ElementSizeMismatch {
            expected,
            actual: size_of::<T>(),
        });
    }
    Ok(())
}

/// Read element `index` as `T`.
///
/// # Safety
/// Every bit pattern of the element's width must be a valid `T`.
pub unsafe fn get_element<T: Copy>(array: &ArrayObject, index: jsize) -> Result<T, AccessError> {
    check_width::<T>(array)?;
    let addr = element_ptr(array, index)?;
    Ok(ptr::read_unaligned(addr as *const T))
}

pub fn set_element<T: Copy>(array: &mut ArrayObject, index: jsize, value: T) -> Result<(), AccessError> {
    check_width::<T>(array)?;
    let addr = element_ptr(array, index)?;
    // SAFETY: in bounds, width checked, buffer is 8-aligned and uniquely borrowed.
    unsafe { ptr::write_unaligned(addr as *mut T, value) };
    Ok(())
}

fn check_region(array: &ArrayObject, start: jsize, len: usize) -> Result<usize, AccessError> {
    let count = array.len();
    let in_bounds = start >= 0
        && (start as usize)
            .checked_add(len)
            .map(|end| end <= count as usize)
            .unwrap_or(false);
    if !in_bounds {
        report_violation(
            SafetyViolation::IndexOutOfBounds,
            "check_region",
            &format!("region {}+{} for length {}", start, len, count),
        );
        return Err(AccessError::RegionOutOfBounds { start, len, count });
    }
    Ok(start as usize * array.element_size() as usize)
}

/// Copy `out.len()` elements starting at `start` into `out`.
///
/// # Safety
/// Every bit pattern of the element's width must be a valid `T`.
pub unsafe fn get_region<T: Copy>(
    array: &ArrayObject,
    start: jsize,
    out: &mut [T],
) -> Result<(), AccessError> {
    check_width::<T>(array)?;
    let offset = check_region(array, start, out.len())?;
    if out.is_empty() {
        return Ok(());
    }
    ptr::copy_nonoverlapping(
        array.data_ptr().add(offset),
        out.as_mut_ptr() as *mut u8,
        out.len() * size_of::<T>(),
    );
    Ok(())
}

/// Copy `values` into the array starting at `start`.
pub fn set_region<T: Copy>(
    array: &mut ArrayObject,
    start: jsize,
    values: &[T],
) -> Result<(), AccessError> {
    check_width::<T>(array)?;
    let offset = check_region(array, start, values.len())?;
    if values.is_empty() {
        return Ok(());
    }
    // SAFETY: region checked against the buffer, widths match.
    unsafe {
        ptr::copy_nonoverlapping(
            values.as_ptr() as *const u8,
            array.data_ptr().add(offset),
            values.len() * size_of::<T>(),
        );
    }
    Ok(())
}
