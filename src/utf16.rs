//! UTF-16LE name handling and upcase-aware comparison.
//!
//! All names in the image format are stored as length-prefixed UTF-16LE with
//! no terminator.  Lookups compare a UTF-8 needle against stored names scalar
//! by scalar, upcasing BMP scalars through the image's embedded upcase table.
//! Surrogate pairs are decoded but never upcased.

use std::cmp::Ordering;

use crate::format::UPCASE_TABLE_LENGTH;

/// Decodes a UTF-16LE byte slice into a string, substituting the replacement
/// character for unpaired surrogates.
pub(crate) fn parse_utf16le(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Encodes a string as UTF-16LE bytes.
pub(crate) fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn upcase_scalar(scalar: u32, upcase: &[u16]) -> u32 {
    if (scalar as usize) < upcase.len() {
        upcase[scalar as usize] as u32
    } else {
        scalar
    }
}

/// Iterator over the Unicode scalar values of a UTF-16LE byte slice.  An
/// unpaired surrogate is yielded as its raw code unit value, which keeps the
/// comparison total over arbitrary table contents.
struct Utf16LeScalars<'a> {
    bytes: &'a [u8],
}

impl Iterator for Utf16LeScalars<'_> {
    type Item = (u32, bool);

    /// Yields the scalar value and whether it came from the BMP (and so is
    /// subject to upcasing).
    fn next(&mut self) -> Option<(u32, bool)> {
        if self.bytes.len() < 2 {
            return None;
        }
        let unit = u16::from_le_bytes([self.bytes[0], self.bytes[1]]);
        self.bytes = &self.bytes[2..];
        if (0xd800..0xdc00).contains(&unit) && self.bytes.len() >= 2 {
            let low = u16::from_le_bytes([self.bytes[0], self.bytes[1]]);
            if (0xdc00..0xe000).contains(&low) {
                self.bytes = &self.bytes[2..];
                let scalar =
                    0x10000 + (((unit as u32 - 0xd800) << 10) | (low as u32 - 0xdc00));
                return Some((scalar, false));
            }
        }
        let bmp = !(0xd800..0xe000).contains(&unit);
        Some((unit as u32, bmp))
    }
}

/// Compares a UTF-8 string against a UTF-16LE name, upcasing both sides
/// through `upcase`.
pub(crate) fn cmp_utf8_utf16le(a: &str, b: &[u8], upcase: &[u16]) -> Ordering {
    let mut b_scalars = Utf16LeScalars { bytes: b };
    for a_char in a.chars() {
        let a_scalar = upcase_scalar(a_char as u32, upcase);
        let Some((b_raw, b_bmp)) = b_scalars.next() else {
            return Ordering::Greater;
        };
        let b_scalar = if b_bmp {
            upcase_scalar(b_raw, upcase)
        } else {
            b_raw
        };
        match a_scalar.cmp(&b_scalar) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    if b_scalars.next().is_some() {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// The upcased scalar sequence of a name.  Sorting by this key yields the
/// same order the lookup comparator expects.
pub(crate) fn upcase_key(name: &str, upcase: &[u16]) -> Vec<u32> {
    name.chars()
        .map(|c| upcase_scalar(c as u32, upcase))
        .collect()
}

/// Builds an upcase table mapping each BMP code point to its upcased
/// counterpart.  Only 1:1 mappings that stay within the BMP are applied;
/// everything else (including the surrogate range) maps to itself.
pub(crate) fn build_upcase_table() -> Vec<u16> {
    let mut table: Vec<u16> = (0..UPCASE_TABLE_LENGTH).map(|c| c as u16).collect();
    for (code, entry) in table.iter_mut().enumerate() {
        if let Some(c) = char::from_u32(code as u32) {
            let mut upper = c.to_uppercase();
            if let Some(u) = upper.next() {
                if upper.next().is_none() && (u as u32) < UPCASE_TABLE_LENGTH as u32 {
                    *entry = u as u16;
                }
            }
        }
    }
    table
}
