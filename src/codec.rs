//! Register word codec
//!
//! Pure conversions between raw 16-bit Modbus register words and the typed
//! values mappings expose: 32-bit integer and float merges in both word
//! orders, ASCII / Latin-1 string packing, single-bit separation and the
//! two's-complement 16-bit reinterprets.
//!
//! Word-order convention, applied symmetrically on encode and decode:
//! `Endian::Big` means index 0 carries the **high** half of a 32-bit value,
//! `Endian::Little` means index 1 does. Round-trip tests pin this down.

use serde::{Deserialize, Serialize};

use crate::error::{ModbusMapperError, Result};

/// Word order of a two-register merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Endian {
    /// Index 0 is the high word
    Big,
    /// Index 1 is the high word
    Little,
}

fn expect_two_words(words: &[u16]) -> Result<(u16, u16)> {
    match words {
        [first, second] => Ok((*first, *second)),
        _ => Err(ModbusMapperError::InvalidArgument(format!(
            "32-bit conversions take exactly 2 register words, got {}",
            words.len()
        ))),
    }
}

/// Merge two register words into a `u32`
pub fn registers_to_u32(words: &[u16], endian: Endian) -> Result<u32> {
    let (first, second) = expect_two_words(words)?;
    let (high, low) = match endian {
        Endian::Big => (first, second),
        Endian::Little => (second, first),
    };
    Ok((u32::from(high) << 16) | u32::from(low))
}

/// Merge two register words into an `i32` (two's-complement reinterpret)
pub fn registers_to_i32(words: &[u16], endian: Endian) -> Result<i32> {
    Ok(registers_to_u32(words, endian)? as i32)
}

/// Merge two register words into an IEEE-754 `f32`
pub fn registers_to_f32(words: &[u16], endian: Endian) -> Result<f32> {
    Ok(f32::from_bits(registers_to_u32(words, endian)?))
}

/// Split a `u32` into two register words
pub fn u32_to_registers(value: u32, endian: Endian) -> [u16; 2] {
    let high = (value >> 16) as u16;
    let low = (value & 0xFFFF) as u16;
    match endian {
        Endian::Big => [high, low],
        Endian::Little => [low, high],
    }
}

/// Split an `i32` into two register words
pub fn i32_to_registers(value: i32, endian: Endian) -> [u16; 2] {
    u32_to_registers(value as u32, endian)
}

/// Split an IEEE-754 `f32` into two register words
pub fn f32_to_registers(value: f32, endian: Endian) -> [u16; 2] {
    u32_to_registers(value.to_bits(), endian)
}

/// Decode register words into a string of ASCII characters
///
/// Each word yields two bytes; for `Endian::Big` the high byte precedes the
/// low byte, for `Endian::Little` the order reverses. A NUL byte suppresses
/// emission for that position only, so embedded padding does not truncate
/// the rest of the string.
pub fn registers_to_ascii_string(words: &[u16], endian: Endian) -> String {
    registers_to_byte_string(words, endian)
}

/// Decode register words into a string of Latin-1 code points (0..=255)
pub fn registers_to_unicode_string(words: &[u16], endian: Endian) -> String {
    registers_to_byte_string(words, endian)
}

fn registers_to_byte_string(words: &[u16], endian: Endian) -> String {
    let mut out = String::with_capacity(words.len() * 2);
    for word in words {
        let [high, low] = word.to_be_bytes();
        let (first, second) = match endian {
            Endian::Big => (high, low),
            Endian::Little => (low, high),
        };
        if first != 0 {
            out.push(char::from(first));
        }
        if second != 0 {
            out.push(char::from(second));
        }
    }
    out
}

/// Encode an ASCII string into register words
///
/// The byte length must be even; pad with NUL on the caller side when it is
/// not. Non-ASCII input is rejected.
pub fn ascii_string_to_registers(text: &str, endian: Endian) -> Result<Vec<u16>> {
    if !text.is_ascii() {
        return Err(ModbusMapperError::InvalidArgument(
            "ASCII encoding given non-ASCII input".to_string(),
        ));
    }
    bytes_to_registers(text.as_bytes(), endian)
}

/// Encode a string of Latin-1 code points (0..=255) into register words
pub fn unicode_string_to_registers(text: &str, endian: Endian) -> Result<Vec<u16>> {
    let bytes = text
        .chars()
        .map(|c| {
            u8::try_from(u32::from(c)).map_err(|_| {
                ModbusMapperError::InvalidArgument(format!(
                    "code point U+{:04X} does not fit a register byte",
                    u32::from(c)
                ))
            })
        })
        .collect::<Result<Vec<u8>>>()?;
    bytes_to_registers(&bytes, endian)
}

fn bytes_to_registers(bytes: &[u8], endian: Endian) -> Result<Vec<u16>> {
    if bytes.len() % 2 != 0 {
        return Err(ModbusMapperError::InvalidArgument(format!(
            "string encoding takes an even byte count, got {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| match endian {
            Endian::Big => u16::from_be_bytes([pair[0], pair[1]]),
            Endian::Little => u16::from_be_bytes([pair[1], pair[0]]),
        })
        .collect())
}

/// Separate a register word into its 16 bits, LSB at index 0
pub fn separate_bits(word: u16) -> [bool; 16] {
    std::array::from_fn(|i| (word >> i) & 1 == 1)
}

/// Reinterpret a `u16` as a two's-complement `i16`
pub fn u16_to_i16(value: u16) -> i16 {
    value as i16
}

/// Reinterpret an `i16` as a `u16`
pub fn i16_to_u16(value: i16) -> u16 {
    value as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_big_endian_merges_high_word_first() {
        // 0x1234_5678 split across two registers, high word at index 0
        assert_eq!(
            registers_to_u32(&[0x1234, 0x5678], Endian::Big).unwrap(),
            0x1234_5678
        );
        assert_eq!(
            registers_to_u32(&[0x1234, 0x5678], Endian::Little).unwrap(),
            0x5678_1234
        );
    }

    #[test]
    fn u32_round_trips_both_endians() {
        for value in [0u32, 1, 0x1234_5678, 0xFFFF_FFFF, 0x8000_0001] {
            for endian in [Endian::Big, Endian::Little] {
                let words = u32_to_registers(value, endian);
                assert_eq!(registers_to_u32(&words, endian).unwrap(), value);
            }
        }
    }

    #[test]
    fn i32_round_trips_negative_values() {
        for value in [0i32, -1, i32::MIN, i32::MAX, -123_456] {
            for endian in [Endian::Big, Endian::Little] {
                let words = i32_to_registers(value, endian);
                assert_eq!(registers_to_i32(&words, endian).unwrap(), value);
            }
        }
    }

    #[test]
    fn f32_round_trips_bit_patterns() {
        for value in [0.0f32, -0.0, 1.5, -273.15, f32::MAX, f32::MIN_POSITIVE] {
            for endian in [Endian::Big, Endian::Little] {
                let words = f32_to_registers(value, endian);
                let decoded = registers_to_f32(&words, endian).unwrap();
                assert_eq!(decoded.to_bits(), value.to_bits());
            }
        }
    }

    #[test]
    fn f32_big_endian_layout() {
        // 25.0 is 0x41C80000 in IEEE 754
        assert_eq!(
            registers_to_f32(&[0x41C8, 0x0000], Endian::Big).unwrap(),
            25.0
        );
        assert_eq!(
            registers_to_f32(&[0x0000, 0x41C8], Endian::Little).unwrap(),
            25.0
        );
    }

    #[test]
    fn wrong_word_count_is_rejected() {
        assert!(registers_to_u32(&[1], Endian::Big).is_err());
        assert!(registers_to_u32(&[1, 2, 3], Endian::Big).is_err());
        assert!(registers_to_f32(&[], Endian::Little).is_err());
    }

    #[test]
    fn ascii_decode_skips_nul_padding() {
        // "Hello" packed big-endian with a trailing NUL in the last register
        let words = [0x4865, 0x6C6C, 0x6F00];
        assert_eq!(registers_to_ascii_string(&words, Endian::Big), "Hello");
    }

    #[test]
    fn ascii_decode_little_endian_swaps_bytes() {
        let words = [0x6548, 0x6C6C, 0x006F];
        assert_eq!(registers_to_ascii_string(&words, Endian::Little), "Hello");
    }

    #[test]
    fn embedded_nul_does_not_truncate() {
        // NUL in the high byte of the middle register only drops that byte
        let words = [0x4142, 0x0043, 0x4445];
        assert_eq!(registers_to_ascii_string(&words, Endian::Big), "ABCDE");
    }

    #[test]
    fn ascii_strings_round_trip() {
        for text in ["", "Hi", "Hello!", "register bank"] {
            let padded = if text.len() % 2 == 0 {
                text.to_string()
            } else {
                format!("{text}\0")
            };
            for endian in [Endian::Big, Endian::Little] {
                let words = ascii_string_to_registers(&padded, endian).unwrap();
                assert_eq!(
                    registers_to_ascii_string(&words, endian),
                    padded.trim_end_matches('\0')
                );
            }
        }
    }

    #[test]
    fn unicode_strings_round_trip_latin1() {
        let text = "caf\u{E9}";
        for endian in [Endian::Big, Endian::Little] {
            let words = unicode_string_to_registers(text, endian).unwrap();
            assert_eq!(registers_to_unicode_string(&words, endian), text);
        }
    }

    #[test]
    fn unicode_rejects_wide_code_points() {
        assert!(unicode_string_to_registers("\u{4E2D}\u{6587}", Endian::Big).is_err());
    }

    #[test]
    fn odd_byte_count_is_rejected() {
        assert!(ascii_string_to_registers("abc", Endian::Big).is_err());
    }

    #[test]
    fn separate_bits_lsb_first() {
        let bits = separate_bits(0b0000_0000_0000_0101);
        assert!(bits[0]);
        assert!(!bits[1]);
        assert!(bits[2]);
        assert!(bits[3..].iter().all(|b| !b));
    }

    #[test]
    fn bits_reconstruct_the_word() {
        for word in [0u16, 1, 0xAAAA, 0x8000, 0xFFFF, 12345] {
            let bits = separate_bits(word);
            let rebuilt = bits
                .iter()
                .enumerate()
                .fold(0u16, |acc, (i, &b)| acc | (u16::from(b) << i));
            assert_eq!(rebuilt, word);
        }
    }

    #[test]
    fn sixteen_bit_reinterprets() {
        assert_eq!(u16_to_i16(0xFFFF), -1);
        assert_eq!(u16_to_i16(0x7FFF), i16::MAX);
        assert_eq!(i16_to_u16(-1), 0xFFFF);
        assert_eq!(i16_to_u16(i16::MIN), 0x8000);
    }
}
