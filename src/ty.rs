//! The seam between the layout engine and the host compiler's IR type
//! system.
//!
//! The engine never owns types; it asks structural questions through
//! [`TypeStore`] and uses the store's handle type as the key of its struct
//! layout cache.

use std::fmt;
use std::hash::Hash;

use crate::Align;

/// Kind discrimination for IR types, as coarse as the layout rules need.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TyKind {
    Void,
    Label,
    Integer,
    Float,
    Double,
    Pointer,
    Vector,
    Array,
    Struct,
}

/// Structural queries the engine makes against the caller's type system.
///
/// `Ty` is a cheap, stable handle: two handles compare equal exactly when
/// they denote the same type, for as long as the type is alive. Methods are
/// only called for the kinds they are documented for.
///
/// Contract: while an engine holding cached layouts is alive, the
/// implementation must call
/// [`TargetData::invalidate_struct_layout`](crate::TargetData::invalidate_struct_layout)
/// before mutating the field list of a struct type or destroying it.
pub trait TypeStore {
    type Ty: Copy + Eq + Hash + fmt::Debug;

    fn kind(&self, ty: Self::Ty) -> TyKind;

    /// Whether a value of this type has a knowable concrete size.
    fn is_sized(&self, ty: Self::Ty) -> bool;

    /// Bit width of an `Integer` or `Vector` type. Vector widths are a whole
    /// number of bytes.
    fn bit_width(&self, ty: Self::Ty) -> u32;

    /// Pointee of a `Pointer`, or element type of an `Array` or `Vector`.
    fn element_type(&self, ty: Self::Ty) -> Self::Ty;

    /// Number of elements of an `Array`.
    fn element_count(&self, ty: Self::Ty) -> u64;

    /// Number of fields of a `Struct`.
    fn field_count(&self, ty: Self::Ty) -> u32;

    /// Type of field `index` of a `Struct`, in declaration order.
    fn field_type(&self, ty: Self::Ty, index: u32) -> Self::Ty;
}

/// A global variable, as seen by the preferred-alignment heuristic.
pub trait GlobalVar {
    type Ty;

    /// The type of the value the global holds.
    fn value_type(&self) -> Self::Ty;

    /// The explicit alignment attribute, if the global carries one.
    fn explicit_align(&self) -> Option<Align>;

    /// Whether the global is defined in this module. Externally declared
    /// globals have no initializer here and their final size may differ.
    fn has_initializer(&self) -> bool;
}

/// How `void` answers size queries.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum VoidPolicy {
    /// `void` occupies one byte, so that address arithmetic through a void
    /// pointer is plain byte arithmetic.
    #[default]
    ByteSized,
    /// Sizing `void` is a precondition violation.
    Unsized,
}
