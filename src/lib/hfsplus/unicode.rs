//! HFS Plus names: up to 255 UTF-16 code units, big-endian on disk, with a
//! 16-bit length prefix.
//!
//! Catalog keys sort names either by case-folded code unit (HFS+ and most
//! HFSX volumes) or by raw code unit (HFSX volumes created case-sensitive).

use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

use crate::bytes::ReadBeExt;
use crate::internal::KEY_COMPARE_BINARY;
use crate::{Error, Result};

pub const MAX_NAME_UNITS: usize = 255;

/// Rendering of an embedded NUL code unit.
const NUL_REPLACEMENT: char = '\u{2400}';

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum NameOrder {
    #[default]
    CaseFolding,
    Binary,
}

impl NameOrder {
    /// Picks the ordering from a B-tree header's `keyCompareType` byte.
    pub fn from_compare_type(key_compare_type: u8) -> Self {
        if key_compare_type == KEY_COMPARE_BINARY {
            NameOrder::Binary
        } else {
            NameOrder::CaseFolding
        }
    }

    pub fn compare(self, a: &[u16], b: &[u16]) -> Ordering {
        match self {
            NameOrder::CaseFolding => compare_folded(a, b),
            NameOrder::Binary => a.cmp(b),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct HfsName(Vec<u16>);

impl HfsName {
    pub fn new() -> Self {
        HfsName(Vec::new())
    }

    pub fn from_units(units: Vec<u16>) -> Result<Self> {
        if units.len() > MAX_NAME_UNITS {
            return Err(Error::NameTooLong(units.len()));
        }
        Ok(HfsName(units))
    }

    /// Encodes a UTF-8 string as-is; no Unicode normalization is applied.
    pub fn from_utf8(s: &str) -> Result<Self> {
        Self::from_units(s.encode_utf16().collect())
    }

    /// Decodes a length-prefixed name at `offset`, returning it together with
    /// the number of bytes it occupies.
    pub fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize)> {
        let count = usize::from(buf.read_u16_be_at(offset)?);
        if count > MAX_NAME_UNITS {
            return Err(Error::NameTooLong(count));
        }
        let raw = buf.bytes_at(offset + 2, count * 2)?;
        let units = raw
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok((HfsName(units), 2 + count * 2))
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.0.len() as u16).to_be_bytes());
        for unit in &self.0 {
            out.extend_from_slice(&unit.to_be_bytes());
        }
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.0.len() * 2
    }

    pub fn units(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn compare(&self, other: &HfsName, order: NameOrder) -> Ordering {
        order.compare(&self.0, &other.0)
    }

    pub fn to_string_lossy(&self) -> String {
        self.chars().collect()
    }

    fn chars(&self) -> impl Iterator<Item = char> + '_ {
        char::decode_utf16(self.0.iter().copied()).map(|c| match c {
            Ok('\0') => NUL_REPLACEMENT,
            Ok(c) => c,
            Err(_) => char::REPLACEMENT_CHARACTER,
        })
    }
}

impl fmt::Debug for HfsName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"")?;
        for c in self.chars() {
            write!(f, "{}", c.escape_debug())?;
        }
        write!(f, "\"")
    }
}

impl fmt::Display for HfsName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for c in self.chars() {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Folds a code unit for catalog comparison with the fixed HFS Plus
/// lower-case table. Returns 0 for units the comparison skips; NUL folds to
/// 0xFFFF so it sorts after everything else.
///
/// The table predates Unicode 2.0 and is frozen: precomposed letters such as
/// U+00C9 keep their case, and only the Latin, Greek, Cyrillic, Armenian,
/// Georgian, letterlike, fullwidth and formatting pages carry mappings.
pub fn fold_case(unit: u16) -> u16 {
    match unit {
        0x0000 => 0xffff,

        0x0041..=0x005a | 0x00c6 | 0x00d0 | 0x00d8 | 0x00de => unit + 0x20,

        0x0110 | 0x0126 | 0x0132 | 0x013f | 0x0141 | 0x014a | 0x0152 | 0x0166 => unit + 1,
        0x0182 | 0x0184 | 0x0187 | 0x018b | 0x0191 | 0x0198 | 0x01a2 | 0x01a4 | 0x01a7
        | 0x01ac | 0x01b3 | 0x01b5 | 0x01b8 | 0x01bc | 0x01e4 => unit + 1,
        0x0181 => 0x0253,
        0x0186 => 0x0254,
        0x0189 => 0x0256,
        0x018a => 0x0257,
        0x018e => 0x01dd,
        0x018f => 0x0259,
        0x0190 => 0x025b,
        0x0193 => 0x0260,
        0x0194 => 0x0263,
        0x0196 => 0x0269,
        0x0197 => 0x0268,
        0x019c => 0x026f,
        0x019d => 0x0272,
        0x019f => 0x0275,
        0x01a9 => 0x0283,
        0x01ae => 0x0288,
        0x01b1 => 0x028a,
        0x01b2 => 0x028b,
        0x01b7 => 0x0292,
        0x01c4 | 0x01c5 => 0x01c6,
        0x01c7 | 0x01c8 => 0x01c9,
        0x01ca | 0x01cb => 0x01cc,
        0x01f1 | 0x01f2 => 0x01f3,

        0x0391..=0x03a1 | 0x03a3..=0x03a9 => unit + 0x20,
        0x03e2..=0x03ee if unit % 2 == 0 => unit + 1,

        0x0402 | 0x0404..=0x0406 | 0x0408..=0x040b | 0x040f => unit + 0x50,
        0x0410..=0x0418 | 0x041a..=0x042f => unit + 0x20,
        0x0460..=0x0480 if unit % 2 == 0 && unit != 0x0476 => unit + 1,
        0x0490..=0x04be if unit % 2 == 0 => unit + 1,
        0x04c3 | 0x04c7 | 0x04cb => unit + 1,

        0x0531..=0x0556 => unit + 0x30,
        0x10a0..=0x10c5 => unit + 0x30,

        0x200c..=0x200f | 0x202a..=0x202e | 0x206a..=0x206f | 0xfeff => 0,
        0x2160..=0x216f => unit + 0x10,
        0xff21..=0xff3a => unit + 0x20,

        _ => unit,
    }
}

/// Case-insensitive ordering over code units, skipping ignorable units.
pub fn compare_folded(a: &[u16], b: &[u16]) -> Ordering {
    let mut left = a.iter().map(|&u| fold_case(u)).filter(|&u| u != 0);
    let mut right = b.iter().map(|&u| fold_case(u)).filter(|&u| u != 0);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l != r => return l.cmp(&r),
            _ => {}
        }
    }
}
