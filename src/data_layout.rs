//! The target data layout descriptor.
//!
//! A descriptor is parsed once from a specification string such as
//! `"E-p:64:64:64-i32:32:32-f64:0:64"` and is immutable afterwards: a
//! sequence of hyphen-delimited specifiers for endianness, pointer size and
//! alignment, and per-kind type alignments. Alignments come in two flavors:
//! ABI alignment dictates how a type is aligned inside an aggregate and when
//! passed as an argument; preferred alignment applies when the type is
//! emitted standalone, e.g. as a global.
//!
//! All values in the string are bit counts; internally alignments and the
//! pointer size are kept in bytes (bits divided by 8, truncating).

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::{AbiAndPrefAlign, Align, Endian, HasDataLayout, Integer, Size};

/// Coarse classification of a type for alignment-table purposes.
///
/// The variant order is the sort order of the alignment table and therefore
/// the order of entries in the canonical printed form.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum AlignKind {
    Integer,
    Float,
    Vector,
    Aggregate,
}

impl AlignKind {
    fn as_char(self) -> char {
        match self {
            AlignKind::Integer => 'i',
            AlignKind::Float => 'f',
            AlignKind::Vector => 'v',
            AlignKind::Aggregate => 'a',
        }
    }
}

/// One alignment record of the descriptor's table.
///
/// Alignments are raw byte counts; 0 means "not specified", which the
/// aggregate entry uses to defer to the computed struct alignment and the
/// seeded `i64`/`f64` entries use until the pointer-width fixup resolves
/// them.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct AlignSpec {
    pub kind: AlignKind,
    pub bit_width: u16,
    /// ABI alignment in bytes.
    pub abi: u8,
    /// Preferred alignment in bytes.
    pub pref: u8,
}

impl AlignSpec {
    #[inline]
    fn key(&self) -> (AlignKind, u16) {
        (self.kind, self.bit_width)
    }
}

/// Errors reported by [`TargetDataLayout::parse_strict`].
///
/// The default parser never reports these; it degrades malformed input to
/// the seeded defaults instead, for compatibility with hand-edited partial
/// strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataLayoutError {
    #[error("unknown specifier `{0}` in data layout string")]
    UnknownSpecifier(String),
    #[error("invalid {what} `{value}` for `{cause}` in data layout string")]
    InvalidNumber { what: &'static str, value: String, cause: String },
    #[error("missing alignment for `{0}` in data layout string")]
    MissingAlignment(String),
    #[error("invalid alignment of {bytes} bytes for `{cause}`: not a power of two")]
    InvalidAlignment { bytes: u64, cause: String },
}

/// A compilation unit that records the data layout string of the target it
/// was built for.
pub trait HasDataLayoutString {
    fn data_layout_string(&self) -> &str;
}

/// Parsed data layout for a target: endianness, pointer parameters, and the
/// sorted per-(kind, bit-width) alignment table.
///
/// Construct with [`parse`](Self::parse) (or [`parse_strict`](Self::parse_strict));
/// afterwards the descriptor is read-only and can be shared freely.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TargetDataLayout {
    pub endian: Endian,
    pub pointer_size: Size,
    pub pointer_align: AbiAndPrefAlign,
    /// Sorted by `(kind, bit_width)`, at most one entry per key.
    alignments: Vec<AlignSpec>,
}

impl TargetDataLayout {
    /// The descriptor seeded with defaults only, before any string
    /// overrides and before the pointer-width fixups.
    fn seed() -> TargetDataLayout {
        let align = |bytes| Align::from_bytes(bytes).unwrap();
        let mut dl = TargetDataLayout {
            endian: Endian::Big,
            pointer_size: Size::from_bytes(8),
            pointer_align: AbiAndPrefAlign::new(align(8)),
            alignments: Vec::new(),
        };
        dl.set_alignment(AlignKind::Integer, 1, 1, 1);
        dl.set_alignment(AlignKind::Integer, 1, 1, 8);
        dl.set_alignment(AlignKind::Integer, 2, 2, 16);
        dl.set_alignment(AlignKind::Integer, 4, 4, 32);
        dl.set_alignment(AlignKind::Integer, 0, 8, 64);
        dl.set_alignment(AlignKind::Float, 4, 4, 32);
        dl.set_alignment(AlignKind::Float, 0, 8, 64);
        dl.set_alignment(AlignKind::Vector, 8, 8, 64);
        dl.set_alignment(AlignKind::Vector, 16, 16, 128);
        dl.set_alignment(AlignKind::Aggregate, 0, 0, 0);
        dl
    }

    /// Parses a data layout specification string.
    ///
    /// Unknown specifiers are skipped and malformed numbers read as 0
    /// ("not specified"), so any input degrades to a usable descriptor.
    pub fn parse(input: &str) -> TargetDataLayout {
        match Self::parse_inner(input, false) {
            Ok(dl) => dl,
            // Lenient parsing swallows every error.
            Err(_) => unreachable!(),
        }
    }

    /// Parses a data layout specification string, rejecting what
    /// [`parse`](Self::parse) would silently ignore.
    pub fn parse_strict(input: &str) -> Result<TargetDataLayout, DataLayoutError> {
        Self::parse_inner(input, true)
    }

    /// Builds the descriptor from a module-supplied configuration string.
    pub fn from_module<M: HasDataLayoutString>(module: &M) -> TargetDataLayout {
        TargetDataLayout::parse(module.data_layout_string())
    }

    fn parse_inner(input: &str, strict: bool) -> Result<TargetDataLayout, DataLayoutError> {
        let mut dl = TargetDataLayout::seed();

        // Reads a numeric field given in bits. A missing field reads as 0;
        // in lenient mode so does a malformed one.
        let number = |field: Option<&str>, what: &'static str, cause: &str| {
            let Some(s) = field else { return Ok(0) };
            match s.parse::<u64>() {
                Ok(n) => Ok(n),
                Err(_) if !strict => {
                    debug!(field = s, cause, "malformed number in data layout string read as 0");
                    Ok(0)
                }
                Err(_) => Err(DataLayoutError::InvalidNumber {
                    what,
                    value: s.to_string(),
                    cause: cause.to_string(),
                }),
            }
        };

        // Converts a byte count to a pointer alignment. In lenient mode a
        // non-power-of-two count degrades to "not specified".
        let align_from = |bytes: u64, cause: &str| match Align::from_bytes(bytes) {
            Ok(a) => Ok(a),
            Err(_) if !strict => Ok(Align::ONE),
            Err(_) => Err(DataLayoutError::InvalidAlignment { bytes, cause: cause.to_string() }),
        };

        for token in input.split('-') {
            let parts = token.split(':').collect::<Vec<_>>();
            let head = parts[0];

            match head.as_bytes().first().copied() {
                None => {}
                Some(b'E') => dl.endian = Endian::Big,
                Some(b'e') => dl.endian = Endian::Little,
                Some(b'p') => {
                    if strict && parts.len() < 3 {
                        return Err(DataLayoutError::MissingAlignment("p".to_string()));
                    }
                    let size_bits = number(parts.get(1).copied(), "size", "p")?;
                    let abi_bytes = number(parts.get(2).copied(), "alignment", "p")? / 8;
                    let mut pref_bytes = number(parts.get(3).copied(), "alignment", "p")? / 8;
                    if pref_bytes == 0 {
                        pref_bytes = abi_bytes;
                    }
                    dl.pointer_size = Size::from_bytes(size_bits / 8);
                    dl.pointer_align = AbiAndPrefAlign {
                        abi: align_from(abi_bytes, "p")?,
                        pref: align_from(pref_bytes, "p")?,
                    };
                }
                Some(c @ (b'i' | b'f' | b'v' | b'a')) => {
                    let kind = match c {
                        b'i' => AlignKind::Integer,
                        b'f' => AlignKind::Float,
                        b'v' => AlignKind::Vector,
                        _ => AlignKind::Aggregate,
                    };
                    let width_str = &head[1..];
                    let bit_width = if width_str.is_empty() {
                        0
                    } else {
                        match width_str.parse::<u16>() {
                            Ok(w) => w,
                            Err(_) if !strict => {
                                debug!(token, "malformed bit width in data layout string read as 0");
                                0
                            }
                            Err(_) => {
                                return Err(DataLayoutError::InvalidNumber {
                                    what: "size",
                                    value: width_str.to_string(),
                                    cause: head.to_string(),
                                });
                            }
                        }
                    };
                    if strict && parts.len() < 2 {
                        return Err(DataLayoutError::MissingAlignment(head.to_string()));
                    }
                    let abi_bytes = number(parts.get(1).copied(), "alignment", head)? / 8;
                    let mut pref_bytes = number(parts.get(2).copied(), "alignment", head)? / 8;
                    if pref_bytes == 0 {
                        pref_bytes = abi_bytes;
                    }
                    if strict {
                        for bytes in [abi_bytes, pref_bytes] {
                            if bytes != 0 && Align::from_bytes(bytes).is_err() {
                                return Err(DataLayoutError::InvalidAlignment {
                                    bytes,
                                    cause: head.to_string(),
                                });
                            }
                        }
                    }
                    dl.set_alignment(kind, abi_bytes as u8, pref_bytes as u8, bit_width);
                }
                Some(_) => {
                    if strict {
                        return Err(DataLayoutError::UnknownSpecifier(token.to_string()));
                    }
                    debug!(token, "ignoring unknown specifier in data layout string");
                }
            }
        }

        // Unless a spec says otherwise, the alignment of 64-bit integers and
        // doubles is capped by the pointer width: a seeded ABI alignment of 0
        // means "not specified".
        let pointer_bytes = dl.pointer_size.bytes() as u8;
        for kind in [AlignKind::Integer, AlignKind::Float] {
            if dl.exact_entry(kind, 64).is_some_and(|e| e.abi == 0) {
                dl.set_alignment(kind, pointer_bytes, pointer_bytes, 64);
            }
        }

        Ok(dl)
    }

    /// Overwrites the `(kind, bit_width)` record if present, inserts it in
    /// sort order otherwise.
    fn set_alignment(&mut self, kind: AlignKind, abi: u8, pref: u8, bit_width: u16) {
        let spec = AlignSpec { kind, bit_width, abi, pref };
        match self.alignments.binary_search_by_key(&spec.key(), AlignSpec::key) {
            Ok(i) => {
                let entry = &mut self.alignments[i];
                entry.abi = abi;
                entry.pref = pref;
            }
            Err(i) => self.alignments.insert(i, spec),
        }
    }

    /// Returns the first record at or after `(kind, bit_width)`.
    ///
    /// On an exact miss this is the next-larger entry, which for integer
    /// queries realizes "round up to the nearest declared width": an `i24`
    /// lookup on a table without an `i24` entry lands on `i32`. Callers must
    /// check the returned record's kind; running past the end of a kind's
    /// entries yields the following kind's first record, or `None` at the end
    /// of the table.
    pub fn alignment_entry(&self, kind: AlignKind, bit_width: u32) -> Option<&AlignSpec> {
        let idx = self
            .alignments
            .partition_point(|e| (e.kind, u32::from(e.bit_width)) < (kind, bit_width));
        self.alignments.get(idx)
    }

    fn exact_entry(&self, kind: AlignKind, bit_width: u16) -> Option<&AlignSpec> {
        self.alignments
            .binary_search_by_key(&(kind, bit_width), AlignSpec::key)
            .ok()
            .map(|i| &self.alignments[i])
    }

    /// The alignment table in sorted order.
    pub fn alignments(&self) -> &[AlignSpec] {
        &self.alignments
    }

    /// Returns the unsigned integer width matching the pointer width.
    #[inline]
    pub fn pointer_sized_integer(&self) -> Integer {
        match self.pointer_size.bytes() {
            2 => Integer::I16,
            4 => Integer::I32,
            8 => Integer::I64,
            bytes => panic!("pointer_sized_integer: unknown pointer byte size {}", bytes),
        }
    }
}

impl Default for TargetDataLayout {
    /// Equivalent to `parse("")`: the seeded defaults with the pointer-width
    /// fixups applied.
    fn default() -> TargetDataLayout {
        TargetDataLayout::parse("")
    }
}

impl fmt::Display for TargetDataLayout {
    /// The canonical string form; [`parse`](TargetDataLayout::parse) of the
    /// output reproduces the descriptor.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.endian {
            Endian::Little => "e",
            Endian::Big => "E",
        })?;
        write!(
            f,
            "-p:{}:{}:{}",
            self.pointer_size.bits(),
            self.pointer_align.abi.bits(),
            self.pointer_align.pref.bits()
        )?;
        for e in &self.alignments {
            write!(
                f,
                "-{}{}:{}:{}",
                e.kind.as_char(),
                e.bit_width,
                u32::from(e.abi) * 8,
                u32::from(e.pref) * 8
            )?;
        }
        Ok(())
    }
}

impl HasDataLayout for TargetDataLayout {
    #[inline]
    fn data_layout(&self) -> &TargetDataLayout {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL_DEFAULT: &str = "E-p:64:64:64-i1:8:8-i8:8:8-i16:16:16-i32:32:32\
                                     -i64:64:64-f32:32:32-f64:64:64-v64:64:64-v128:128:128-a0:0:0";

    #[test]
    fn default_is_fixed_up_seed() {
        let dl = TargetDataLayout::default();
        assert_eq!(dl.endian, Endian::Big);
        assert_eq!(dl.pointer_size.bytes(), 8);
        assert_eq!(dl.pointer_align.abi.bytes(), 8);
        // The seeded i64/f64 entries start unspecified and get capped at the
        // pointer width.
        assert_eq!(dl.exact_entry(AlignKind::Integer, 64).unwrap().abi, 8);
        assert_eq!(dl.exact_entry(AlignKind::Integer, 64).unwrap().pref, 8);
        assert_eq!(dl.exact_entry(AlignKind::Float, 64).unwrap().abi, 8);
        assert_eq!(dl.to_string(), CANONICAL_DEFAULT);
    }

    #[test]
    fn parse_round_trips() {
        let spec = "E-p:64:64:64-i1:8:8-i8:8:8-i16:16:16-i32:32:32-i64:0:64\
                    -f32:32:32-f64:0:64-v64:64:64-v128:128:128-a0:0:0";
        let dl = TargetDataLayout::parse(spec);
        // i64:0:64 and f64:0:64 resolve to the pointer width, the rest prints
        // back verbatim in table order.
        assert_eq!(dl.to_string(), CANONICAL_DEFAULT);
        assert_eq!(TargetDataLayout::parse(&dl.to_string()), dl);
    }

    #[test]
    fn overrides_round_trip() {
        for spec in
            ["e-p:32:32:32", "E-p:16:16:16-i64:64:64", "e-p:64:64:64-a0:0:64-v256:256:256"]
        {
            let dl = TargetDataLayout::parse(spec);
            assert_eq!(TargetDataLayout::parse(&dl.to_string()), dl);
        }
    }

    #[test]
    fn pointer_caps_i64_and_f64() {
        let dl = TargetDataLayout::parse("E-p:32:32:32");
        assert_eq!(dl.pointer_size.bytes(), 4);
        let i64_entry = dl.exact_entry(AlignKind::Integer, 64).unwrap();
        assert_eq!((i64_entry.abi, i64_entry.pref), (4, 4));
        let f64_entry = dl.exact_entry(AlignKind::Float, 64).unwrap();
        assert_eq!((f64_entry.abi, f64_entry.pref), (4, 4));

        // An explicit i64 entry suppresses the fixup.
        let dl = TargetDataLayout::parse("E-p:32:32:32-i64:64");
        let i64_entry = dl.exact_entry(AlignKind::Integer, 64).unwrap();
        assert_eq!((i64_entry.abi, i64_entry.pref), (8, 8));
    }

    #[test]
    fn omitted_pref_falls_back_to_abi() {
        let dl = TargetDataLayout::parse("e-i16:32");
        let entry = dl.exact_entry(AlignKind::Integer, 16).unwrap();
        assert_eq!((entry.abi, entry.pref), (4, 4));
    }

    #[test]
    fn set_updates_in_place() {
        let before = TargetDataLayout::default().alignments().len();
        let dl = TargetDataLayout::parse("i32:64:64");
        assert_eq!(dl.alignments().len(), before);
        let entry = dl.exact_entry(AlignKind::Integer, 32).unwrap();
        assert_eq!((entry.abi, entry.pref), (8, 8));
    }

    #[test]
    fn lookup_rounds_up_within_kind() {
        let dl = TargetDataLayout::default();
        let entry = dl.alignment_entry(AlignKind::Integer, 24).unwrap();
        assert_eq!((entry.kind, entry.bit_width), (AlignKind::Integer, 32));

        // Past the last entry of a kind the search lands on the next kind;
        // the oracle is responsible for treating that as fatal.
        let entry = dl.alignment_entry(AlignKind::Vector, 256).unwrap();
        assert_eq!(entry.kind, AlignKind::Aggregate);
        assert!(dl.alignment_entry(AlignKind::Aggregate, 1).is_none());
    }

    #[test]
    fn lenient_parse_never_fails() {
        let dl = TargetDataLayout::parse("E-m:e-S128-n8:16:32:64-ifoo:bar-p270:32:32");
        // Unknown specifiers and garbage numbers degrade; the endianness
        // survives. ("p270" parses as a pointer token whose size field is the
        // second part, per the first-character dispatch.)
        assert_eq!(dl.endian, Endian::Big);
        let dl = TargetDataLayout::parse("e");
        assert_eq!(dl.endian, Endian::Little);
    }

    #[test]
    fn strict_parse_reports() {
        assert_eq!(
            TargetDataLayout::parse_strict("E-q:32"),
            Err(DataLayoutError::UnknownSpecifier("q:32".to_string()))
        );
        assert_eq!(
            TargetDataLayout::parse_strict("i32"),
            Err(DataLayoutError::MissingAlignment("i32".to_string()))
        );
        assert_eq!(
            TargetDataLayout::parse_strict("p:64"),
            Err(DataLayoutError::MissingAlignment("p".to_string()))
        );
        assert!(matches!(
            TargetDataLayout::parse_strict("ix:8:8"),
            Err(DataLayoutError::InvalidNumber { .. })
        ));
        assert_eq!(
            TargetDataLayout::parse_strict("i32:24"),
            Err(DataLayoutError::InvalidAlignment { bytes: 3, cause: "i32".to_string() })
        );
        // Everything the lenient parser accepts as-is also passes strict.
        let canonical = TargetDataLayout::default().to_string();
        assert_eq!(TargetDataLayout::parse_strict(&canonical).unwrap().to_string(), canonical);
    }

    #[test]
    fn descriptor_comes_from_the_module_string() {
        struct Module {
            data_layout: String,
        }

        impl HasDataLayoutString for Module {
            fn data_layout_string(&self) -> &str {
                &self.data_layout
            }
        }

        let module = Module { data_layout: "e-p:32:32:32".to_string() };
        let dl = TargetDataLayout::from_module(&module);
        assert_eq!(dl.endian, Endian::Little);
        assert_eq!(dl.pointer_size.bytes(), 4);
    }

    #[test]
    fn pointer_sized_integer_matches_width() {
        let dl = TargetDataLayout::default();
        assert_eq!(dl.pointer_sized_integer(), Integer::I64);
        assert_eq!(dl.pointer_sized_integer().bits(), dl.pointer_size.bits());
        assert_eq!(TargetDataLayout::parse("p:32:32").pointer_sized_integer(), Integer::I32);
        assert_eq!(TargetDataLayout::parse("p:16:16").pointer_sized_integer(), Integer::I16);
    }
}
