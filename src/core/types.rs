//! Type registry.
//!
//! Types are immutable, reference counted and compared structurally. The
//! [`TypeRegistry`] interns them so that two requests with identical
//! arguments hand back the same shared instance.

use super::error::{ConstructionError, ConstructionResult};
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;

/// Widest integer type accepted by the registry.
pub const MAX_INT_WIDTH: u32 = 128;

/// A structurally compared IR type.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Type(Arc<TypeKind>);

/// The shape of a [`Type`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// No value. Only valid as a function return type.
    Void,
    /// Integer of the given bit width.
    Int(u32),
    /// Pointer to a value of the given type.
    Pointer(Type),
    /// Fixed-width vector.
    Vector { elem: Type, count: u32 },
    /// Literal aggregate with ordered fields.
    Struct { fields: Vec<Type>, packed: bool },
    /// Function signature.
    Function(FunctionType),
}

/// Return and parameter types of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub ret: Type,
    pub params: Vec<Type>,
    pub variadic: bool,
}

impl Type {
    fn new(kind: TypeKind) -> Self {
        Type(Arc::new(kind))
    }

    pub(crate) fn void() -> Self {
        Type::new(TypeKind::Void)
    }

    pub(crate) fn int(width: u32) -> Self {
        Type::new(TypeKind::Int(width))
    }

    pub(crate) fn pointer_to(pointee: &Type) -> Self {
        Type::new(TypeKind::Pointer(pointee.clone()))
    }

    #[cfg(test)]
    pub(crate) fn vector_of(elem: &Type, count: u32) -> Self {
        Type::new(TypeKind::Vector {
            elem: elem.clone(),
            count,
        })
    }

    #[cfg(test)]
    pub(crate) fn structure(fields: Vec<Type>, packed: bool) -> Self {
        Type::new(TypeKind::Struct { fields, packed })
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0
    }

    pub fn is_void(&self) -> bool {
        matches!(*self.0, TypeKind::Void)
    }

    pub fn is_int(&self) -> bool {
        matches!(*self.0, TypeKind::Int(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(*self.0, TypeKind::Pointer(_))
    }

    pub fn is_vector(&self) -> bool {
        matches!(*self.0, TypeKind::Vector { .. })
    }

    pub fn is_struct(&self) -> bool {
        matches!(*self.0, TypeKind::Struct { .. })
    }

    /// Whether values of this type can be produced by an instruction.
    pub fn is_first_class(&self) -> bool {
        !matches!(*self.0, TypeKind::Void | TypeKind::Function(_))
    }

    pub fn int_width(&self) -> Option<u32> {
        match *self.0 {
            TypeKind::Int(width) => Some(width),
            _ => None,
        }
    }

    pub fn pointee(&self) -> Option<&Type> {
        match &*self.0 {
            TypeKind::Pointer(pointee) => Some(pointee),
            _ => None,
        }
    }

    /// Element type and lane count of a vector type.
    pub fn vector_parts(&self) -> Option<(&Type, u32)> {
        match &*self.0 {
            TypeKind::Vector { elem, count } => Some((elem, *count)),
            _ => None,
        }
    }

    pub fn struct_fields(&self) -> Option<&[Type]> {
        match &*self.0 {
            TypeKind::Struct { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn is_packed(&self) -> bool {
        matches!(&*self.0, TypeKind::Struct { packed: true, .. })
    }

    pub fn as_function(&self) -> Option<&FunctionType> {
        match &*self.0 {
            TypeKind::Function(sig) => Some(sig),
            _ => None,
        }
    }

    /// Integer type, or integer vector type.
    pub fn is_int_or_int_vector(&self) -> bool {
        match self.vector_parts() {
            Some((elem, _)) => elem.is_int(),
            None => self.is_int(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            TypeKind::Void => write!(f, "void"),
            TypeKind::Int(width) => write!(f, "i{width}"),
            TypeKind::Pointer(pointee) => write!(f, "{pointee}*"),
            TypeKind::Vector { elem, count } => write!(f, "<{count} x {elem}>"),
            TypeKind::Struct { fields, packed } => {
                if fields.is_empty() {
                    return if *packed { write!(f, "<{{}}>") } else { write!(f, "{{}}") };
                }
                if *packed {
                    write!(f, "<")?;
                }
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, " }}")?;
                if *packed {
                    write!(f, ">")?;
                }
                Ok(())
            }
            TypeKind::Function(sig) => write!(f, "{sig}"),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({self})")
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        if self.variadic {
            if !self.params.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}

/// Interning constructor for [`Type`]s.
///
/// Every constructor validates its arguments and fails with
/// [`ConstructionError::InvalidTypeSpec`] on widths or counts of zero and on
/// compositions the IR cannot express.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    interned: HashMap<TypeKind, Type>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct types handed out so far.
    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }

    fn intern(&mut self, kind: TypeKind) -> Type {
        self.interned
            .entry(kind)
            .or_insert_with_key(|kind| Type::new(kind.clone()))
            .clone()
    }

    pub fn void_type(&mut self) -> Type {
        self.intern(TypeKind::Void)
    }

    pub fn integer_type(&mut self, width: u32) -> ConstructionResult<Type> {
        if width == 0 || width > MAX_INT_WIDTH {
            return Err(invalid(format!(
                "integer width {width} outside 1..={MAX_INT_WIDTH}"
            )));
        }
        Ok(self.intern(TypeKind::Int(width)))
    }

    pub fn i1(&mut self) -> Type {
        self.intern(TypeKind::Int(1))
    }

    pub fn i8(&mut self) -> Type {
        self.intern(TypeKind::Int(8))
    }

    pub fn i32(&mut self) -> Type {
        self.intern(TypeKind::Int(32))
    }

    pub fn i64(&mut self) -> Type {
        self.intern(TypeKind::Int(64))
    }

    pub fn pointer_type(&mut self, pointee: &Type) -> ConstructionResult<Type> {
        if pointee.is_void() {
            return Err(invalid("pointer to void; use a pointer to i8"));
        }
        Ok(self.intern(TypeKind::Pointer(pointee.clone())))
    }

    pub fn vector_type(&mut self, elem: &Type, count: u32) -> ConstructionResult<Type> {
        if count == 0 {
            return Err(invalid("vector with zero lanes"));
        }
        if !(elem.is_int() || elem.is_pointer()) {
            return Err(invalid(format!("vector element must be integer or pointer, got {elem}")));
        }
        Ok(self.intern(TypeKind::Vector {
            elem: elem.clone(),
            count,
        }))
    }

    pub fn struct_type(&mut self, fields: &[Type], packed: bool) -> ConstructionResult<Type> {
        if let Some(bad) = fields.iter().find(|field| !field.is_first_class()) {
            return Err(invalid(format!("struct field of type {bad}")));
        }
        Ok(self.intern(TypeKind::Struct {
            fields: fields.to_vec(),
            packed,
        }))
    }

    pub fn function_type(
        &mut self,
        ret: &Type,
        params: &[Type],
        variadic: bool,
    ) -> ConstructionResult<Type> {
        if !(ret.is_void() || ret.is_first_class()) {
            return Err(invalid(format!("function returning {ret}")));
        }
        if let Some(bad) = params.iter().find(|param| !param.is_first_class()) {
            return Err(invalid(format!("function parameter of type {bad}")));
        }
        Ok(self.intern(TypeKind::Function(FunctionType {
            ret: ret.clone(),
            params: params.to_vec(),
            variadic,
        })))
    }
}

fn invalid(reason: impl Into<String>) -> ConstructionError {
    ConstructionError::InvalidTypeSpec {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_returns_shared_instances() {
        let mut types = TypeRegistry::new();
        let a = types.integer_type(32).unwrap();
        let b = types.integer_type(32).unwrap();
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.0, &b.0));

        let p1 = types.pointer_type(&a).unwrap();
        let p2 = types.pointer_type(&b).unwrap();
        assert!(Arc::ptr_eq(&p1.0, &p2.0));
        assert_eq!(types.len(), 2);
    }

    #[test]
    fn test_structural_equality_without_registry() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let interned = types.pointer_type(&i32_ty).unwrap();
        assert_eq!(interned, Type::pointer_to(&Type::int(32)));
    }

    #[test]
    fn test_invalid_specs() {
        let mut types = TypeRegistry::new();
        assert!(matches!(
            types.integer_type(0),
            Err(ConstructionError::InvalidTypeSpec { .. })
        ));
        assert!(types.integer_type(129).is_err());

        let i32_ty = types.i32();
        assert!(types.vector_type(&i32_ty, 0).is_err());

        let record = types.struct_type(&[i32_ty.clone()], false).unwrap();
        assert!(types.vector_type(&record, 4).is_err());

        let void = types.void_type();
        assert!(types.pointer_type(&void).is_err());
        assert!(types.function_type(&i32_ty, &[void.clone()], false).is_err());
        assert!(types.struct_type(&[void], false).is_err());
    }

    #[test]
    fn test_display() {
        let mut types = TypeRegistry::new();
        let i32_ty = types.i32();
        let ptr = types.pointer_type(&i32_ty).unwrap();
        let vec = types.vector_type(&i32_ty, 4).unwrap();
        let record = types.struct_type(&[ptr.clone(), i32_ty.clone(), i32_ty.clone()], false).unwrap();
        let i8_ty = types.i8();
        let packed = types.struct_type(&[i8_ty, i32_ty.clone()], true).unwrap();
        let sig = types.function_type(&i32_ty, &[record.clone(), ptr.clone()], true).unwrap();

        assert_eq!(ptr.to_string(), "i32*");
        assert_eq!(vec.to_string(), "<4 x i32>");
        assert_eq!(record.to_string(), "{ i32*, i32, i32 }");
        assert_eq!(packed.to_string(), "<{ i8, i32 }>");
        assert_eq!(sig.to_string(), "i32 ({ i32*, i32, i32 }, i32*, ...)");
    }
}
