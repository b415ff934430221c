//! Struct layout computation, the per-descriptor layout cache, and the
//! size/alignment/offset queries over IR types.

use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::ty::{GlobalVar, TyKind, TypeStore, VoidPolicy};
use crate::{
    AbiAndPrefAlign, Align, AlignKind, AlignSpec, HasDataLayout, Integer, Size, TargetDataLayout,
};

/// Byte offsets of one struct type's fields, with the struct's total size
/// and alignment. Immutable once built; the cache hands it out behind an
/// `Arc`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StructLayout {
    size: Size,
    align: Align,
    offsets: Box<[Size]>,
}

impl StructLayout {
    /// Total size, including tail padding.
    #[inline]
    pub fn size(&self) -> Size {
        self.size
    }

    /// The alignment dictated by the fields (1 for an empty struct).
    #[inline]
    pub fn align(&self) -> Align {
        self.align
    }

    /// Byte offset of each field, in declaration order.
    #[inline]
    pub fn field_offsets(&self) -> &[Size] {
        &self.offsets
    }

    #[inline]
    pub fn offset_of(&self, field: usize) -> Size {
        self.offsets[field]
    }

    /// Given a byte offset into the struct, the index of the field whose
    /// storage (or trailing padding) contains it.
    pub fn field_containing_offset(&self, offset: Size) -> usize {
        let idx = self.offsets.partition_point(|&field_offset| field_offset <= offset);
        assert!(idx > 0, "field_containing_offset: offset {:?} not within the struct", offset);
        idx - 1
    }
}

/// A target data layout descriptor paired with the struct layout cache it
/// owns.
///
/// `Ty` is the type handle of the caller's [`TypeStore`]. The descriptor is
/// immutable, layouts are built on demand and shared, so any number of
/// threads can query a `TargetData` concurrently; dropping it drops every
/// cached layout with it.
pub struct TargetData<Ty> {
    dl: TargetDataLayout,
    void: VoidPolicy,
    layouts: RwLock<FxHashMap<Ty, Arc<StructLayout>>>,
}

impl<Ty> TargetData<Ty>
where
    Ty: Copy + Eq + Hash + fmt::Debug,
{
    pub fn new(dl: TargetDataLayout) -> TargetData<Ty> {
        TargetData::with_void_policy(dl, VoidPolicy::default())
    }

    pub fn with_void_policy(dl: TargetDataLayout, void: VoidPolicy) -> TargetData<Ty> {
        TargetData { dl, void, layouts: RwLock::new(FxHashMap::default()) }
    }

    /// Size in bytes of a value of type `ty`.
    pub fn type_size<S>(&self, types: &S, ty: Ty) -> Size
    where
        S: TypeStore<Ty = Ty>,
    {
        assert!(types.is_sized(ty), "type_size: cannot size unsized type {:?}", ty);
        match types.kind(ty) {
            TyKind::Label | TyKind::Pointer => self.dl.pointer_size,
            TyKind::Void => match self.void {
                VoidPolicy::ByteSized => Size::from_bytes(1),
                VoidPolicy::Unsized => {
                    panic!("type_size: void is unsized under VoidPolicy::Unsized")
                }
            },
            TyKind::Integer => Integer::fit_width(types.bit_width(ty).into()).size(),
            TyKind::Float => Size::from_bytes(4),
            TyKind::Double => Size::from_bytes(8),
            TyKind::Vector => {
                let bits = u64::from(types.bit_width(ty));
                assert!(
                    bits % 8 == 0,
                    "type_size: vector width of {} bits is not a whole number of bytes",
                    bits
                );
                Size::from_bytes(bits / 8)
            }
            TyKind::Array => {
                let elem = types.element_type(ty);
                let stride = self.type_size(types, elem).align_to(self.abi_align(types, elem));
                stride * types.element_count(ty)
            }
            TyKind::Struct => self.struct_layout(types, ty).size(),
        }
    }

    /// Size in bits. Integers answer their declared bit width (an `i36`
    /// answers 36); every other kind answers 8 times its byte size.
    pub fn type_size_bits<S>(&self, types: &S, ty: Ty) -> u64
    where
        S: TypeStore<Ty = Ty>,
    {
        if types.kind(ty) == TyKind::Integer {
            types.bit_width(ty).into()
        } else {
            self.type_size(types, ty).bits()
        }
    }

    /// ABI and preferred alignment of `ty`.
    pub fn align_of<S>(&self, types: &S, ty: Ty) -> AbiAndPrefAlign
    where
        S: TypeStore<Ty = Ty>,
    {
        assert!(types.is_sized(ty), "align_of: cannot align unsized type {:?}", ty);
        let (kind, bit_width) = match types.kind(ty) {
            TyKind::Label | TyKind::Pointer => return self.dl.pointer_align,
            // Arrays inherit their element's alignment.
            TyKind::Array => return self.align_of(types, types.element_type(ty)),
            TyKind::Struct => {
                let layout = self.struct_layout(types, ty);
                let entry = self.table_entry(AlignKind::Aggregate, 0);
                // The aggregate entry can raise, never lower, the alignment
                // dictated by the fields; its default of 0 always defers.
                let to_align = |bytes: u8| {
                    Align::from_bytes(bytes.into()).unwrap_or_else(|err| {
                        panic!("bad aggregate alignment entry: {}", err)
                    })
                };
                let agg = AbiAndPrefAlign { abi: to_align(entry.abi), pref: to_align(entry.pref) };
                return agg.max(AbiAndPrefAlign::new(layout.align()));
            }
            TyKind::Integer => (AlignKind::Integer, types.bit_width(ty)),
            TyKind::Void => (AlignKind::Integer, 8),
            TyKind::Float => (AlignKind::Float, 32),
            TyKind::Double => (AlignKind::Float, 64),
            TyKind::Vector => (AlignKind::Vector, types.bit_width(ty)),
        };

        let entry = self.table_entry(kind, bit_width);
        AbiAndPrefAlign {
            abi: self.entry_align(entry.abi, kind, bit_width),
            pref: self.entry_align(entry.pref, kind, bit_width),
        }
    }

    #[inline]
    pub fn abi_align<S>(&self, types: &S, ty: Ty) -> Align
    where
        S: TypeStore<Ty = Ty>,
    {
        self.align_of(types, ty).abi
    }

    #[inline]
    pub fn pref_align<S>(&self, types: &S, ty: Ty) -> Align
    where
        S: TypeStore<Ty = Ty>,
    {
        self.align_of(types, ty).pref
    }

    /// The alignment record for `(kind, bit_width)`, accepting the
    /// next-larger width of the same kind on an exact miss. No record of the
    /// kind at or above the width is a fatal lookup failure.
    fn table_entry(&self, kind: AlignKind, bit_width: u32) -> AlignSpec {
        match self.dl.alignment_entry(kind, bit_width) {
            Some(entry) if entry.kind == kind => *entry,
            _ => panic!("no alignment entry for {:?} of width {} in data layout", kind, bit_width),
        }
    }

    /// A raw table byte count as a concrete alignment; 0 is fatal here, the
    /// aggregate fallback is resolved by the caller.
    fn entry_align(&self, bytes: u8, kind: AlignKind, bit_width: u32) -> Align {
        assert!(bytes != 0, "alignment for {:?} of width {} is unspecified", kind, bit_width);
        Align::from_bytes(bytes.into()).unwrap_or_else(|err| {
            panic!("bad alignment entry for {:?} of width {}: {}", kind, bit_width, err)
        })
    }

    /// The layout of struct type `ty`, built on first query and cached for
    /// the lifetime of the engine (or until invalidated).
    pub fn struct_layout<S>(&self, types: &S, ty: Ty) -> Arc<StructLayout>
    where
        S: TypeStore<Ty = Ty>,
    {
        assert_eq!(types.kind(ty), TyKind::Struct, "struct_layout: {:?} is not a struct", ty);
        if let Some(layout) = self.layouts.read().get(&ty) {
            return layout.clone();
        }

        // Build outside the lock: placing the fields recurses into the
        // oracle, which may demand other struct layouts and re-enter the
        // cache. Struct element types are sized, hence acyclic, so a
        // re-entrant query for `ty` itself cannot occur; two threads racing
        // on the same key both build, and the first insert wins.
        let layout = Arc::new(self.build_struct_layout(types, ty));
        self.layouts.write().entry(ty).or_insert(layout).clone()
    }

    fn build_struct_layout<S>(&self, types: &S, ty: Ty) -> StructLayout
    where
        S: TypeStore<Ty = Ty>,
    {
        let field_count = types.field_count(ty);
        let mut offsets = Vec::with_capacity(field_count as usize);
        let mut size = Size::ZERO;
        let mut align: Option<Align> = None;

        for i in 0..field_count {
            let field = types.field_type(ty, i);
            let field_align = self.abi_align(types, field);
            let field_size = self.type_size(types, field);

            // Pad so the field starts on its ABI alignment, and keep track
            // of the worst-case alignment constraint.
            size = size.align_to(field_align);
            align = Some(align.map_or(field_align, |a| a.max(field_align)));

            offsets.push(size);
            size += field_size;
        }

        // Empty structs have an alignment of one byte.
        let align = align.unwrap_or(Align::ONE);

        // Tail padding, so the struct can tile an array with every element
        // aligned.
        let size = size.align_to(align);

        trace!(?ty, size = size.bytes(), align = align.bytes(), "built struct layout");
        StructLayout { size, align, offsets: offsets.into_boxed_slice() }
    }

    /// Drops the cached layout for struct type `ty`, if any.
    ///
    /// The type-system collaborator must call this before mutating the field
    /// list of a struct type, or destroying it, while the engine is alive.
    pub fn invalidate_struct_layout(&self, ty: Ty) {
        if self.layouts.write().remove(&ty).is_some() {
            debug!(?ty, "invalidated cached struct layout");
        }
    }

    /// Byte offset from a base pointer of type `ptr_ty` after walking
    /// `indices` through the pointee.
    ///
    /// The first index steps through the pointee; each further index either
    /// selects a struct field (the index must be an in-range unsigned 32-bit
    /// constant) or an element of a sequential type (the index is signed and
    /// scales by the element size). Arithmetic wraps in 64 bits, so negative
    /// steps are two's-complement subtractions on the returned offset.
    pub fn indexed_offset<S>(&self, types: &S, ptr_ty: Ty, indices: &[i64]) -> u64
    where
        S: TypeStore<Ty = Ty>,
    {
        assert_eq!(
            types.kind(ptr_ty),
            TyKind::Pointer,
            "indexed_offset: base {:?} is not a pointer",
            ptr_ty
        );
        let mut ty = ptr_ty;
        let mut offset: u64 = 0;

        for &idx in indices {
            match types.kind(ty) {
                TyKind::Struct => {
                    let field = u32::try_from(idx).unwrap_or_else(|_| {
                        panic!("indexed_offset: invalid struct field index {}", idx)
                    });
                    assert!(
                        field < types.field_count(ty),
                        "indexed_offset: field {} out of range for {:?}",
                        field,
                        ty
                    );
                    offset = offset
                        .wrapping_add(self.struct_layout(types, ty).offset_of(field as usize).bytes());
                    ty = types.field_type(ty, field);
                }
                TyKind::Pointer | TyKind::Array | TyKind::Vector => {
                    ty = types.element_type(ty);
                    let elem_size = self.type_size(types, ty).bytes() as i64;
                    offset = offset.wrapping_add(idx.wrapping_mul(elem_size) as u64);
                }
                kind => panic!("indexed_offset: cannot index into {:?} {:?}", kind, ty),
            }
        }

        offset
    }

    /// The preferred alignment of `ty` in log2 form.
    #[inline]
    pub fn pref_align_shift<S>(&self, types: &S, ty: Ty) -> u8
    where
        S: TypeStore<Ty = Ty>,
    {
        self.pref_align(types, ty).log2()
    }

    /// The preferred alignment of a global variable, in log2 form.
    ///
    /// Starts from the value type's preferred alignment; an explicit
    /// alignment attribute can raise it, and defined globals larger than 128
    /// bytes are raised to 16-byte alignment. Externally declared globals
    /// are left alone since their final size may differ.
    pub fn preferred_global_align_shift<S, G>(&self, types: &S, global: &G) -> u8
    where
        S: TypeStore<Ty = Ty>,
        G: GlobalVar<Ty = Ty>,
    {
        let value_ty = global.value_type();
        let mut shift = self.pref_align_shift(types, value_ty);
        if let Some(explicit) = global.explicit_align() {
            if explicit.bytes() > (1u64 << shift) {
                shift = explicit.log2();
            }
        }
        if global.has_initializer()
            && shift < 4
            && self.type_size(types, value_ty).bytes() > 128
        {
            shift = 4;
        }
        shift
    }
}

impl<Ty> Deref for TargetData<Ty> {
    type Target = TargetDataLayout;

    #[inline]
    fn deref(&self) -> &TargetDataLayout {
        &self.dl
    }
}

impl<Ty> HasDataLayout for TargetData<Ty> {
    #[inline]
    fn data_layout(&self) -> &TargetDataLayout {
        &self.dl
    }
}

impl<Ty: fmt::Debug> fmt::Debug for TargetData<Ty> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetData")
            .field("dl", &self.dl)
            .field("void", &self.void)
            .field("cached_layouts", &self.layouts.read().len())
            .finish()
    }
}
