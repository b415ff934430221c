//! Size, alignment and field-offset facts about IR types on a chosen target.
//!
//! The entry points are [`TargetDataLayout`], an immutable descriptor parsed
//! from a compact specification string (endianness, pointer width, per-kind
//! type alignments), and [`TargetData`], which pairs a descriptor with a lazy
//! per-struct layout cache and answers the actual queries: how many bytes a
//! type occupies, what alignment it requires, and at which byte offset a
//! field or element lives.
//!
//! The IR type system itself stays outside the crate; callers hand in an
//! implementation of [`TypeStore`] and the engine asks it structural
//! questions (kind, element types, field counts) as it walks types.

pub use Integer::*;

use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub};

pub mod data_layout;
pub mod layout;
pub mod ty;

pub use data_layout::{AlignKind, AlignSpec, DataLayoutError, HasDataLayoutString, TargetDataLayout};
pub use layout::{StructLayout, TargetData};
pub use ty::{GlobalVar, TyKind, TypeStore, VoidPolicy};

/// Contexts that carry a data layout descriptor.
pub trait HasDataLayout {
    fn data_layout(&self) -> &TargetDataLayout;
}

/// Endianness of the target.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Little => "little",
            Self::Big => "big",
        }
    }
}

impl fmt::Debug for Endian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size of a type in bytes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Size {
    raw: u64,
}

impl Size {
    pub const ZERO: Size = Size { raw: 0 };

    /// Rounds `bits` up to the next-higher byte boundary, if `bits` is
    /// not a whole number of bytes.
    #[inline]
    pub fn from_bits(bits: u64) -> Size {
        // Avoid potential overflow from `bits + 7`.
        Size { raw: bits / 8 + ((bits % 8) + 7) / 8 }
    }

    #[inline]
    pub fn from_bytes(bytes: u64) -> Size {
        Size { raw: bytes }
    }

    #[inline]
    pub fn bytes(self) -> u64 {
        self.raw
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.raw.checked_mul(8).unwrap_or_else(|| {
            panic!("Size::bits: {} bytes doesn't fit in u64 bits", self.raw)
        })
    }

    /// Rounds up to the nearest multiple of `align`.
    #[inline]
    pub fn align_to(self, align: Align) -> Size {
        let mask = align.bytes() - 1;
        Size::from_bytes((self.bytes() + mask) & !mask)
    }

    #[inline]
    pub fn is_aligned(self, align: Align) -> bool {
        let mask = align.bytes() - 1;
        self.bytes() & mask == 0
    }
}

// Panicking arithmetic for convenience; every overflow here is a compiler
// invariant violation, not a recoverable condition.

impl Add for Size {
    type Output = Size;
    #[inline]
    fn add(self, other: Size) -> Size {
        Size::from_bytes(self.bytes().checked_add(other.bytes()).unwrap_or_else(|| {
            panic!("Size::add: {} + {} doesn't fit in u64", self.bytes(), other.bytes())
        }))
    }
}

impl Sub for Size {
    type Output = Size;
    #[inline]
    fn sub(self, other: Size) -> Size {
        Size::from_bytes(self.bytes().checked_sub(other.bytes()).unwrap_or_else(|| {
            panic!("Size::sub: {} - {} would result in negative size", self.bytes(), other.bytes())
        }))
    }
}

impl AddAssign for Size {
    #[inline]
    fn add_assign(&mut self, other: Size) {
        *self = *self + other;
    }
}

impl Mul<u64> for Size {
    type Output = Size;
    #[inline]
    fn mul(self, count: u64) -> Size {
        match self.bytes().checked_mul(count) {
            Some(bytes) => Size::from_bytes(bytes),
            None => panic!("Size::mul: {} * {} doesn't fit in u64", self.bytes(), count),
        }
    }
}

impl Mul<Size> for u64 {
    type Output = Size;
    #[inline]
    fn mul(self, size: Size) -> Size {
        size * self
    }
}

/// Alignment of a type in bytes (always a power of two).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Align {
    pow2: u8,
}

impl Align {
    pub const ONE: Align = Align { pow2: 0 };

    #[inline]
    pub fn from_bits(bits: u64) -> Result<Align, String> {
        Align::from_bytes(Size::from_bits(bits).bytes())
    }

    /// An alignment of 0 bytes is treated like 1-byte alignment.
    #[inline]
    pub fn from_bytes(align: u64) -> Result<Align, String> {
        if align == 0 {
            return Ok(Align::ONE);
        }

        #[cold]
        fn not_power_of_2(align: u64) -> String {
            format!("`{}` is not a power of 2", align)
        }

        #[cold]
        fn too_large(align: u64) -> String {
            format!("`{}` is too large", align)
        }

        let mut bytes = align;
        let mut pow2: u8 = 0;
        while (bytes & 1) == 0 {
            pow2 += 1;
            bytes >>= 1;
        }
        if bytes != 1 {
            return Err(not_power_of_2(align));
        }
        if pow2 > 29 {
            return Err(too_large(align));
        }

        Ok(Align { pow2 })
    }

    #[inline]
    pub fn bytes(self) -> u64 {
        1 << self.pow2
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.bytes() * 8
    }

    /// The base-2 logarithm of the alignment, in bytes.
    #[inline]
    pub fn log2(self) -> u8 {
        self.pow2
    }
}

/// A pair of alignments, ABI-mandated and preferred.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct AbiAndPrefAlign {
    pub abi: Align,
    pub pref: Align,
}

impl AbiAndPrefAlign {
    #[inline]
    pub fn new(align: Align) -> AbiAndPrefAlign {
        AbiAndPrefAlign { abi: align, pref: align }
    }

    #[inline]
    pub fn min(self, other: AbiAndPrefAlign) -> AbiAndPrefAlign {
        AbiAndPrefAlign { abi: self.abi.min(other.abi), pref: self.pref.min(other.pref) }
    }

    #[inline]
    pub fn max(self, other: AbiAndPrefAlign) -> AbiAndPrefAlign {
        AbiAndPrefAlign { abi: self.abi.max(other.abi), pref: self.pref.max(other.pref) }
    }
}

/// The whole-byte integer widths a value can be widened to for storage.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Integer {
    I8,
    I16,
    I32,
    I64,
}

impl Integer {
    #[inline]
    pub fn size(self) -> Size {
        match self {
            I8 => Size::from_bytes(1),
            I16 => Size::from_bytes(2),
            I32 => Size::from_bytes(4),
            I64 => Size::from_bytes(8),
        }
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.size().bits()
    }

    /// Finds the smallest Integer that holds `bits` bits.
    ///
    /// Arbitrary-width IR integers are stored widened to the next whole-byte
    /// width; widths above 64 bits are not supported.
    #[inline]
    pub fn fit_width(bits: u64) -> Integer {
        match bits {
            0..=8 => I8,
            9..=16 => I16,
            17..=32 => I32,
            33..=64 => I64,
            _ => panic!("fit_width: integer types wider than 64 bits are not supported (i{})", bits),
        }
    }
}
