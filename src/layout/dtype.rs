//! Element datatypes and the conversions needed when copying raw data.

use super::LayoutError;
use crate::heap::VL_REF_SIZE;

/// Size of an object reference element.
pub const REFERENCE_SIZE: usize = 8;

/// Byte order of a fixed-size element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    /// Plain numeric data of `size` bytes.
    Fixed { size: usize, order: ByteOrder },
    /// Variable-length sequence of `base_size`-byte items, stored in the
    /// global heap; each element is a [`VlRef`](crate::heap::VlRef).
    VarLen { base_size: usize },
    /// Object reference; meaningless outside the file that wrote it.
    Reference,
}

impl Datatype {
    /// Little-endian fixed-size type.
    pub fn le(size: usize) -> Self {
        Datatype::Fixed {
            size,
            order: ByteOrder::Little,
        }
    }

    pub fn be(size: usize) -> Self {
        Datatype::Fixed {
            size,
            order: ByteOrder::Big,
        }
    }

    /// Size of one element as stored in the dataset.
    pub fn size(&self) -> usize {
        match self {
            Datatype::Fixed { size, .. } => *size,
            Datatype::VarLen { .. } => VL_REF_SIZE,
            Datatype::Reference => REFERENCE_SIZE,
        }
    }

    /// Whether moving elements from `self` to `dst` needs more than a byte copy.
    pub fn needs_conversion(&self, dst: &Datatype) -> bool {
        match (self, dst) {
            (Datatype::Fixed { size: a, order: x }, Datatype::Fixed { size: b, order: y }) => {
                a != b || (x != y && *a > 1)
            }
            _ => true,
        }
    }

    /// Fail unless elements can be converted from `self` to `dst`.
    pub fn check_convertible(&self, dst: &Datatype) -> Result<(), LayoutError> {
        let ok = match (self, dst) {
            (Datatype::Fixed { size: a, .. }, Datatype::Fixed { size: b, .. }) => a == b,
            (Datatype::VarLen { base_size: a }, Datatype::VarLen { base_size: b }) => a == b,
            (Datatype::Reference, Datatype::Reference) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(LayoutError::TypeMismatch(format!("cannot convert {self:?} to {dst:?}")))
        }
    }
}

/// Reverse the bytes of every `size`-byte element of `buf` in place.
pub fn swap_bytes(buf: &mut [u8], size: usize) {
    if size > 1 {
        for elem in buf.chunks_exact_mut(size) {
            elem.reverse();
        }
    }
}
