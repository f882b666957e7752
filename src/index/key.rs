//! Order-preserving key encoding.
//!
//! The B+ tree compares keys as raw unsigned bytes, so column values
//! are translated into a byte form whose lexicographic order equals the
//! value order: sign-flipped big-endian integers, total-order IEEE
//! bits for floats, and zero-escaped terminated strings. Null sorts
//! before every value via the presence prefix.

use crate::error::{DbError, DbResult};
use crate::table::value::Value;
use crate::types::PageId;

const NULL_PREFIX: u8 = 0x00;
const VALUE_PREFIX: u8 = 0x01;

/// Bytes appended by [`compose_key`]: big-endian page id and offset.
pub const LOCATOR_SUFFIX_LEN: usize = 6;

/// Encode a column value into its memcomparable form.
pub fn encode_key(value: &Value) -> DbResult<Vec<u8>> {
    let mut key = Vec::new();
    match value {
        Value::Null => {
            key.push(NULL_PREFIX);
            return Ok(key);
        }
        _ => key.push(VALUE_PREFIX),
    }

    match value {
        Value::Null => unreachable!(),
        Value::Boolean(v) => key.push(*v as u8),
        Value::Integer(v) => {
            key.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes());
        }
        Value::BigInt(v) => {
            key.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
        }
        Value::Float(v) => {
            key.extend_from_slice(&order_f32_bits(*v).to_be_bytes());
        }
        Value::Double(v) => {
            key.extend_from_slice(&order_f64_bits(*v).to_be_bytes());
        }
        Value::Varchar(s) | Value::Text(s) => {
            // zero bytes are escaped so no encoded string is a prefix
            // of another; the terminator sorts shorter strings first
            for &b in s.as_bytes() {
                if b == 0x00 {
                    key.push(0x00);
                    key.push(0xFF);
                } else {
                    key.push(b);
                }
            }
            key.push(0x00);
            key.push(0x00);
        }
    }
    Ok(key)
}

/// Append the record locator so equal column values stay unique in the
/// tree. The value encoding is a clean prefix of the composed key.
pub fn compose_key(mut value_key: Vec<u8>, page_id: PageId, offset: u16) -> Vec<u8> {
    value_key.extend_from_slice(&(page_id as u32).to_be_bytes());
    value_key.extend_from_slice(&offset.to_be_bytes());
    value_key
}

/// Inclusive range covering every composed key with this value prefix.
pub fn prefix_range(value_key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut lo = value_key.to_vec();
    lo.extend_from_slice(&[0x00; LOCATOR_SUFFIX_LEN]);
    let mut hi = value_key.to_vec();
    hi.extend_from_slice(&[0xFF; LOCATOR_SUFFIX_LEN]);
    (lo, hi)
}

/// Values indexable by a B+ tree key; long strings are not.
pub fn check_indexable(value: &Value) -> DbResult<()> {
    let key = encode_key(value)?;
    if key.len() + LOCATOR_SUFFIX_LEN > crate::index::node::MAX_KEY_LEN {
        return Err(DbError::invalid(format!(
            "value too long to index ({} key bytes)",
            key.len()
        )));
    }
    Ok(())
}

fn order_f32_bits(v: f32) -> u32 {
    let bits = v.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

fn order_f64_bits(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & 0x8000_0000_0000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000_0000_0000
    }
}
