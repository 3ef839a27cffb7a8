//! Typed shard keys over a canonical byte encoding.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, ShardManagementError};

/// Primitive type of a shard key.
///
/// The declared order of the variants is only used to keep [`ShardKey`]'s
/// `Ord` total for container use; callers compare keys through
/// [`ShardKey::try_compare`], which rejects cross-type comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShardKeyType {
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 128-bit GUID.
    Guid,
    /// Variable-length binary.
    Binary,
    /// UTC timestamp with millisecond precision.
    DateTime,
    /// UTF-8 string.
    String,
}

impl ShardKeyType {
    /// Fixed encoded width in bytes, `None` for variable-length types.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ShardKeyType::Int32 => Some(4),
            ShardKeyType::Int64 | ShardKeyType::DateTime => Some(8),
            ShardKeyType::Guid => Some(16),
            ShardKeyType::Binary | ShardKeyType::String => None,
        }
    }
}

impl fmt::Display for ShardKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKeyType::Int32 => write!(f, "int32"),
            ShardKeyType::Int64 => write!(f, "int64"),
            ShardKeyType::Guid => write!(f, "guid"),
            ShardKeyType::Binary => write!(f, "binary"),
            ShardKeyType::DateTime => write!(f, "datetime"),
            ShardKeyType::String => write!(f, "string"),
        }
    }
}

/// A typed shard key.
///
/// The raw encoding is chosen so that unsigned byte-wise comparison equals the
/// logical ordering of the underlying value: signed integers and timestamps
/// are stored big-endian with the sign bit flipped, GUIDs as their 16 bytes,
/// strings as UTF-8. A raw value of `None` is the **Max** sentinel, strictly
/// greater than every representable value of the same type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKey {
    key_type: ShardKeyType,
    raw: Option<Bytes>,
}

impl ShardKey {
    /// Key over a 32-bit signed integer.
    pub fn new_int32(value: i32) -> Self {
        let encoded = (value as u32) ^ 0x8000_0000;
        Self {
            key_type: ShardKeyType::Int32,
            raw: Some(Bytes::copy_from_slice(&encoded.to_be_bytes())),
        }
    }

    /// Key over a 64-bit signed integer.
    pub fn new_int64(value: i64) -> Self {
        Self {
            key_type: ShardKeyType::Int64,
            raw: Some(Bytes::copy_from_slice(&Self::encode_i64(value))),
        }
    }

    /// Key over a GUID.
    pub fn new_guid(value: Uuid) -> Self {
        Self {
            key_type: ShardKeyType::Guid,
            raw: Some(Bytes::copy_from_slice(value.as_bytes())),
        }
    }

    /// Key over raw binary.
    pub fn new_binary(value: impl Into<Bytes>) -> Self {
        Self {
            key_type: ShardKeyType::Binary,
            raw: Some(value.into()),
        }
    }

    /// Key over a UTC timestamp, millisecond precision.
    pub fn new_datetime(value: DateTime<Utc>) -> Self {
        Self {
            key_type: ShardKeyType::DateTime,
            raw: Some(Bytes::copy_from_slice(&Self::encode_i64(
                value.timestamp_millis(),
            ))),
        }
    }

    /// Key over a UTF-8 string.
    pub fn new_string(value: impl AsRef<str>) -> Self {
        Self {
            key_type: ShardKeyType::String,
            raw: Some(Bytes::copy_from_slice(value.as_ref().as_bytes())),
        }
    }

    /// The Max sentinel for the given key type, greater than every concrete
    /// key of that type.
    pub fn max(key_type: ShardKeyType) -> Self {
        Self {
            key_type,
            raw: None,
        }
    }

    /// Reconstruct a key from its canonical raw encoding.
    ///
    /// `None` raw produces the Max sentinel. Fixed-width types reject raw
    /// values of the wrong length.
    pub fn from_raw(key_type: ShardKeyType, raw: Option<Bytes>) -> Result<Self> {
        if let (Some(width), Some(bytes)) = (key_type.fixed_width(), raw.as_ref()) {
            if bytes.len() != width {
                return Err(ShardManagementError::InvalidKeyEncoding {
                    key_type,
                    reason: format!("expected {} bytes, got {}", width, bytes.len()),
                });
            }
        }
        Ok(Self { key_type, raw })
    }

    /// The key's type.
    pub fn key_type(&self) -> ShardKeyType {
        self.key_type
    }

    /// Whether this key is the Max sentinel.
    pub fn is_max(&self) -> bool {
        self.raw.is_none()
    }

    /// The canonical raw encoding. Fails for the Max sentinel, which has no
    /// concrete value.
    pub fn raw_value(&self) -> Result<&Bytes> {
        self.raw
            .as_ref()
            .ok_or(ShardManagementError::MaxKeyHasNoRawValue)
    }

    /// Compare with another key of the same type.
    ///
    /// Comparing keys of different types fails with `KeyTypeMismatch` rather
    /// than producing a coerced result.
    pub fn try_compare(&self, other: &ShardKey) -> Result<Ordering> {
        if self.key_type != other.key_type {
            return Err(ShardManagementError::KeyTypeMismatch {
                left: self.key_type,
                right: other.key_type,
            });
        }
        Ok(self.cmp(other))
    }

    /// The smallest key strictly greater than this one.
    ///
    /// Fixed-width keys increment their encoding with carry; an increment
    /// that overflows yields the Max sentinel. Variable-length keys append a
    /// zero byte. The Max sentinel itself cannot be incremented.
    pub fn next_key(&self) -> Result<ShardKey> {
        let raw = self
            .raw
            .as_ref()
            .ok_or(ShardManagementError::MaxKeyCannotBeIncremented)?;

        let next = match self.key_type.fixed_width() {
            Some(_) => {
                let mut bytes = raw.to_vec();
                let mut overflow = true;
                for b in bytes.iter_mut().rev() {
                    let (v, carry) = b.overflowing_add(1);
                    *b = v;
                    if !carry {
                        overflow = false;
                        break;
                    }
                }
                if overflow {
                    return Ok(ShardKey::max(self.key_type));
                }
                Some(Bytes::from(bytes))
            }
            None => {
                let mut bytes = raw.to_vec();
                bytes.push(0);
                Some(Bytes::from(bytes))
            }
        };

        Ok(Self {
            key_type: self.key_type,
            raw: next,
        })
    }

    /// Decode back to an `i32`, when this is a concrete int32 key.
    pub fn as_int32(&self) -> Result<i32> {
        let raw = self.expect_type(ShardKeyType::Int32)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(raw);
        Ok((u32::from_be_bytes(buf) ^ 0x8000_0000) as i32)
    }

    /// Decode back to an `i64`, when this is a concrete int64 key.
    pub fn as_int64(&self) -> Result<i64> {
        let raw = self.expect_type(ShardKeyType::Int64)?;
        Ok(Self::decode_i64(raw))
    }

    /// Decode back to a GUID, when this is a concrete guid key.
    pub fn as_guid(&self) -> Result<Uuid> {
        let raw = self.expect_type(ShardKeyType::Guid)?;
        let mut buf = [0u8; 16];
        buf.copy_from_slice(raw);
        Ok(Uuid::from_bytes(buf))
    }

    /// Decode back to a timestamp, when this is a concrete datetime key.
    pub fn as_datetime(&self) -> Result<DateTime<Utc>> {
        let raw = self.expect_type(ShardKeyType::DateTime)?;
        let millis = Self::decode_i64(raw);
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or(ShardManagementError::InvalidKeyEncoding {
                key_type: ShardKeyType::DateTime,
                reason: format!("timestamp out of range: {}", millis),
            })
    }

    fn expect_type(&self, expected: ShardKeyType) -> Result<&Bytes> {
        if self.key_type != expected {
            return Err(ShardManagementError::KeyTypeMismatch {
                left: self.key_type,
                right: expected,
            });
        }
        self.raw_value()
    }

    fn encode_i64(value: i64) -> [u8; 8] {
        ((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
    }

    fn decode_i64(raw: &Bytes) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        (u64::from_be_bytes(buf) ^ 0x8000_0000_0000_0000) as i64
    }
}

// Containers hold keys of one type per shard map, so the total order only
// needs to be meaningful within a type; across types it falls back to the
// type tag to stay total. Public callers go through `try_compare`.
impl Ord for ShardKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_type
            .cmp(&other.key_type)
            .then_with(|| match (&self.raw, &other.raw) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for ShardKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            None => write!(f, "{}:+inf", self.key_type),
            Some(raw) => {
                write!(f, "{}:", self.key_type)?;
                for b in raw.iter() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}
