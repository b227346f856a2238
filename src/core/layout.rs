//! Memory layout of IR types.
//!
//! Sizes, alignments and field offsets follow the x86-64 System V C layout.
//! Both the interpreter memory model and the x86-64 lowering place values
//! according to this table, so a byte image produced by one is readable by
//! the other.

use super::types::{Type, TypeKind};

/// Size of a pointer in bytes.
pub const POINTER_SIZE: u64 = 8;

/// Size in bytes of the storage used for an integer of `width` bits.
pub fn int_store_size(width: u32) -> u64 {
    match width {
        0..=8 => 1,
        9..=16 => 2,
        17..=32 => 4,
        33..=64 => 8,
        _ => 16,
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Allocation size of `ty` in bytes, including tail padding.
pub fn size_of(ty: &Type) -> u64 {
    match ty.kind() {
        TypeKind::Void | TypeKind::Function(_) => 0,
        TypeKind::Int(width) => int_store_size(*width),
        TypeKind::Pointer(_) => POINTER_SIZE,
        TypeKind::Vector { elem, count } => {
            let raw = size_of(elem) * u64::from(*count);
            align_up(raw, align_of(ty))
        }
        TypeKind::Struct { fields, packed } => {
            let mut offset = 0;
            for field in fields {
                if !*packed {
                    offset = align_up(offset, align_of(field));
                }
                offset += size_of(field);
            }
            align_up(offset, align_of(ty))
        }
    }
}

/// ABI alignment of `ty` in bytes.
pub fn align_of(ty: &Type) -> u64 {
    match ty.kind() {
        TypeKind::Void | TypeKind::Function(_) => 1,
        TypeKind::Int(width) => int_store_size(*width),
        TypeKind::Pointer(_) => POINTER_SIZE,
        TypeKind::Vector { elem, count } => {
            let raw = size_of(elem) * u64::from(*count);
            raw.next_power_of_two().min(16)
        }
        TypeKind::Struct { fields, packed } => {
            if *packed {
                1
            } else {
                fields.iter().map(align_of).max().unwrap_or(1)
            }
        }
    }
}

/// Byte offset of field `index` inside a struct, or of lane `index` inside a vector.
pub fn element_offset(ty: &Type, index: u32) -> Option<u64> {
    match ty.kind() {
        TypeKind::Struct { fields, packed } => {
            if index as usize >= fields.len() {
                return None;
            }
            let mut offset = 0;
            for (i, field) in fields.iter().enumerate() {
                if !*packed {
                    offset = align_up(offset, align_of(field));
                }
                if i == index as usize {
                    return Some(offset);
                }
                offset += size_of(field);
            }
            None
        }
        TypeKind::Vector { elem, count } => {
            (index < *count).then(|| size_of(elem) * u64::from(index))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_layout() {
        assert_eq!(size_of(&Type::int(1)), 1);
        assert_eq!(size_of(&Type::int(32)), 4);
        assert_eq!(size_of(&Type::int(33)), 8);
        assert_eq!(align_of(&Type::int(64)), 8);
        assert_eq!(size_of(&Type::pointer_to(&Type::int(8))), 8);
    }

    #[test]
    fn test_struct_layout() {
        let i8_ty = Type::int(8);
        let i32_ty = Type::int(32);
        let padded = Type::structure(vec![i8_ty.clone(), i32_ty.clone(), i8_ty.clone()], false);
        assert_eq!(size_of(&padded), 12);
        assert_eq!(align_of(&padded), 4);
        assert_eq!(element_offset(&padded, 1), Some(4));
        assert_eq!(element_offset(&padded, 2), Some(8));
        assert_eq!(element_offset(&padded, 3), None);

        let packed = Type::structure(vec![i8_ty, i32_ty], true);
        assert_eq!(size_of(&packed), 5);
        assert_eq!(element_offset(&packed, 1), Some(1));
    }

    #[test]
    fn test_slice_like_record() {
        // pointer, length, capacity
        let i64_ty = Type::int(64);
        let record = Type::structure(
            vec![Type::pointer_to(&Type::int(8)), i64_ty.clone(), i64_ty],
            false,
        );
        assert_eq!(size_of(&record), 24);
        assert_eq!(element_offset(&record, 2), Some(16));
    }

    #[test]
    fn test_vector_layout() {
        let v4 = Type::vector_of(&Type::int(32), 4);
        assert_eq!(size_of(&v4), 16);
        assert_eq!(align_of(&v4), 16);
        assert_eq!(element_offset(&v4, 3), Some(12));
        assert_eq!(element_offset(&v4, 4), None);

        let v3 = Type::vector_of(&Type::int(32), 3);
        assert_eq!(size_of(&v3), 16);
    }
}
