// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Field types and value payload codec.
//!
//! Values travel as big-endian element arrays. String elements occupy a
//! fixed 40-byte NUL-padded cell so that element counts stay meaningful
//! across all types.

use std::fmt;

/// Fixed cell size for one string element.
pub const STRING_CELL: usize = 40;

/// Native field types a server can expose for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FieldType {
    Str = 0,
    I8 = 1,
    I16 = 2,
    I32 = 3,
    F32 = 4,
    F64 = 5,
    /// Enumerated state; wire representation is an i16 index.
    Enum = 6,
}

impl FieldType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => FieldType::Str,
            1 => FieldType::I8,
            2 => FieldType::I16,
            3 => FieldType::I32,
            4 => FieldType::F32,
            5 => FieldType::F64,
            6 => FieldType::Enum,
            _ => return None,
        })
    }

    /// Bytes per element on the wire.
    pub fn element_size(self) -> usize {
        match self {
            FieldType::Str => STRING_CELL,
            FieldType::I8 => 1,
            FieldType::I16 | FieldType::Enum => 2,
            FieldType::I32 | FieldType::F32 => 4,
            FieldType::F64 => 8,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Str => "string",
            FieldType::I8 => "i8",
            FieldType::I16 => "i16",
            FieldType::I32 => "i32",
            FieldType::F32 => "f32",
            FieldType::F64 => "f64",
            FieldType::Enum => "enum",
        };
        write!(f, "{}", name)
    }
}

/// A decoded process-variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(Vec<String>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Enum(Vec<i16>),
}

impl Value {
    /// Wire field type of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Str(_) => FieldType::Str,
            Value::I8(_) => FieldType::I8,
            Value::I16(_) => FieldType::I16,
            Value::I32(_) => FieldType::I32,
            Value::F32(_) => FieldType::F32,
            Value::F64(_) => FieldType::F64,
            Value::Enum(_) => FieldType::Enum,
        }
    }

    /// Element count.
    pub fn count(&self) -> u32 {
        let n = match self {
            Value::Str(v) => v.len(),
            Value::I8(v) => v.len(),
            Value::I16(v) | Value::Enum(v) => v.len(),
            Value::I32(v) => v.len(),
            Value::F32(v) => v.len(),
            Value::F64(v) => v.len(),
        };
        n as u32
    }

    /// Unpadded wire size of this value.
    pub fn wire_size(&self) -> usize {
        self.field_type().element_size() * self.count() as usize
    }

    /// Append big-endian wire bytes to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Str(v) => {
                for s in v {
                    let mut cell = [0u8; STRING_CELL];
                    let bytes = s.as_bytes();
                    // Keep one NUL terminator inside the cell.
                    let n = bytes.len().min(STRING_CELL - 1);
                    cell[..n].copy_from_slice(&bytes[..n]);
                    buf.extend_from_slice(&cell);
                }
            }
            Value::I8(v) => {
                for x in v {
                    buf.push(*x as u8);
                }
            }
            Value::I16(v) | Value::Enum(v) => {
                for x in v {
                    buf.extend_from_slice(&x.to_be_bytes());
                }
            }
            Value::I32(v) => {
                for x in v {
                    buf.extend_from_slice(&x.to_be_bytes());
                }
            }
            Value::F32(v) => {
                for x in v {
                    buf.extend_from_slice(&x.to_be_bytes());
                }
            }
            Value::F64(v) => {
                for x in v {
                    buf.extend_from_slice(&x.to_be_bytes());
                }
            }
        }
    }

    /// Decode `count` elements of `ty` from the front of `payload`.
    ///
    /// Returns `None` when the payload is too short, which the circuit
    /// treats as a protocol error.
    pub fn decode(ty: FieldType, count: u32, payload: &[u8]) -> Option<Value> {
        let count = count as usize;
        let needed = ty.element_size().checked_mul(count)?;
        if payload.len() < needed {
            return None;
        }
        let data = &payload[..needed];
        Some(match ty {
            FieldType::Str => Value::Str(
                data.chunks_exact(STRING_CELL)
                    .map(|cell| {
                        let end = cell.iter().position(|&b| b == 0).unwrap_or(cell.len());
                        String::from_utf8_lossy(&cell[..end]).into_owned()
                    })
                    .collect(),
            ),
            FieldType::I8 => Value::I8(data.iter().map(|&b| b as i8).collect()),
            FieldType::I16 => Value::I16(decode_be(data, i16::from_be_bytes)),
            FieldType::Enum => Value::Enum(decode_be(data, i16::from_be_bytes)),
            FieldType::I32 => Value::I32(decode_be(data, i32::from_be_bytes)),
            FieldType::F32 => Value::F32(decode_be(data, f32::from_be_bytes)),
            FieldType::F64 => Value::F64(decode_be(data, f64::from_be_bytes)),
        })
    }
}

fn decode_be<T, const N: usize>(data: &[u8], from: fn([u8; N]) -> T) -> Vec<T> {
    data.chunks_exact(N)
        .map(|chunk| {
            let mut arr = [0u8; N];
            arr.copy_from_slice(chunk);
            from(arr)
        })
        .collect()
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: &Value) -> Value {
        let mut buf = Vec::new();
        v.encode_into(&mut buf);
        Value::decode(v.field_type(), v.count(), &buf).expect("Value should decode")
    }

    #[test]
    fn test_numeric_roundtrip() {
        let v = Value::F64(vec![1.5, -2.25, 0.0]);
        assert_eq!(roundtrip(&v), v);
        let v = Value::I32(vec![i32::MIN, 0, i32::MAX]);
        assert_eq!(roundtrip(&v), v);
        let v = Value::Enum(vec![0, 3]);
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn test_string_cells() {
        let v = Value::Str(vec!["RAMP".into(), "".into()]);
        assert_eq!(v.wire_size(), 2 * STRING_CELL);
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn test_string_truncated_to_cell() {
        let long = "x".repeat(STRING_CELL * 2);
        let v = Value::Str(vec![long]);
        let out = roundtrip(&v);
        match out {
            Value::Str(strings) => assert_eq!(strings[0].len(), STRING_CELL - 1),
            other => panic!("expected string value, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_short_payload_fails() {
        assert_eq!(Value::decode(FieldType::F64, 2, &[0u8; 8]), None);
    }

    #[test]
    fn test_decode_ignores_padding_tail() {
        // Frames pad payloads to 8 bytes; decode must only consume
        // element bytes.
        let v = Value::I16(vec![7]);
        let mut buf = Vec::new();
        v.encode_into(&mut buf);
        buf.resize(8, 0);
        assert_eq!(Value::decode(FieldType::I16, 1, &buf), Some(v));
    }

    #[test]
    fn test_field_type_table() {
        for raw in 0..7u16 {
            let ty = FieldType::from_u16(raw).expect("Known field type");
            assert_eq!(ty as u16, raw);
            assert!(ty.element_size() > 0);
        }
        assert_eq!(FieldType::from_u16(99), None);
    }
}
