//! Deterministic, order-stable, null-aware row fingerprints.
//!
//! A fingerprint is computed in two steps:
//!
//! 1. The selected columns of a row are encoded into a canonical record: for
//!    every column, in the given order, the column name followed by a typed
//!    value tag and the value bytes. Nulls get their own tag, so a null is
//!    never confused with the text `"null"`.
//! 2. The record is hashed with SHA-256 and the first eight bytes are read as
//!    a big-endian `i64`.
//!
//! The encoding depends only on the values and the ordered column list, never
//! on physical row order or session state, so fingerprints are stable across
//! calls, processes, and runs. The same engine backs the `fingerprint` SQL
//! function registered by [`crate::store::DataFusionStore`], which is what the
//! key selector and the shard planner evaluate.
//!
//! ```rust
//! use term_export::fingerprint::{FingerprintEngine, FieldValue};
//!
//! let a = FingerprintEngine::fingerprint(&[
//!     ("id", FieldValue::Int(1)),
//!     ("name", FieldValue::Null),
//! ]);
//! let b = FingerprintEngine::fingerprint(&[
//!     ("id", FieldValue::Int(1)),
//!     ("name", FieldValue::Text("null".to_string())),
//! ]);
//! assert_ne!(a, b);
//! ```

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, LargeBinaryArray, LargeStringArray, StringArray,
    StringViewArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::datatypes::DataType;
use arrow::util::display::array_value_to_string;
use sha2::{Digest, Sha256};

use crate::error::{ExportError, Result};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_TEXT: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_OTHER: u8 = 7;

/// A single cell value in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// Any signed integer width
    Int(i64),
    /// Any unsigned integer width
    UInt(u64),
    /// Any float width
    Float(f64),
    /// Text of any string encoding
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Any other type, identified by its type name and display form
    Other {
        /// Arrow type name, e.g. `Date32`
        type_name: String,
        /// Display representation of the value
        repr: String,
    },
}

impl FieldValue {
    /// Reads the value at `row` of an Arrow array.
    pub fn from_array(array: &dyn Array, row: usize) -> Result<Self> {
        if array.is_null(row) {
            return Ok(Self::Null);
        }

        macro_rules! downcast {
            ($ty:ty) => {
                array.as_any().downcast_ref::<$ty>().ok_or_else(|| {
                    ExportError::Internal(format!(
                        "array of type {} failed to downcast",
                        array.data_type()
                    ))
                })?
            };
        }

        let value = match array.data_type() {
            DataType::Null => Self::Null,
            DataType::Boolean => Self::Bool(downcast!(BooleanArray).value(row)),
            DataType::Int8 => Self::Int(i64::from(downcast!(Int8Array).value(row))),
            DataType::Int16 => Self::Int(i64::from(downcast!(Int16Array).value(row))),
            DataType::Int32 => Self::Int(i64::from(downcast!(Int32Array).value(row))),
            DataType::Int64 => Self::Int(downcast!(Int64Array).value(row)),
            DataType::UInt8 => Self::UInt(u64::from(downcast!(UInt8Array).value(row))),
            DataType::UInt16 => Self::UInt(u64::from(downcast!(UInt16Array).value(row))),
            DataType::UInt32 => Self::UInt(u64::from(downcast!(UInt32Array).value(row))),
            DataType::UInt64 => Self::UInt(downcast!(UInt64Array).value(row)),
            DataType::Float32 => Self::Float(f64::from(downcast!(Float32Array).value(row))),
            DataType::Float64 => Self::Float(downcast!(Float64Array).value(row)),
            DataType::Utf8 => Self::Text(downcast!(StringArray).value(row).to_string()),
            DataType::LargeUtf8 => Self::Text(downcast!(LargeStringArray).value(row).to_string()),
            DataType::Utf8View => Self::Text(downcast!(StringViewArray).value(row).to_string()),
            DataType::Binary => Self::Bytes(downcast!(BinaryArray).value(row).to_vec()),
            DataType::LargeBinary => Self::Bytes(downcast!(LargeBinaryArray).value(row).to_vec()),
            other => Self::Other {
                type_name: other.to_string(),
                repr: array_value_to_string(array, row)?,
            },
        };
        Ok(value)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null => out.push(TAG_NULL),
            Self::Bool(v) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*v));
            }
            Self::Int(v) => {
                out.push(TAG_INT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::UInt(v) => {
                out.push(TAG_UINT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Float(v) => {
                out.push(TAG_FLOAT);
                // -0.0 and 0.0 compare equal in SQL; all NaNs group together
                let canonical = if *v == 0.0 {
                    0.0f64
                } else if v.is_nan() {
                    f64::NAN
                } else {
                    *v
                };
                out.extend_from_slice(&canonical.to_bits().to_be_bytes());
            }
            Self::Text(v) => {
                out.push(TAG_TEXT);
                encode_bytes(v.as_bytes(), out);
            }
            Self::Bytes(v) => {
                out.push(TAG_BYTES);
                encode_bytes(v, out);
            }
            Self::Other { type_name, repr } => {
                out.push(TAG_OTHER);
                encode_bytes(type_name.as_bytes(), out);
                encode_bytes(repr.as_bytes(), out);
            }
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Computes fingerprints for rows and record batches.
pub struct FingerprintEngine;

impl FingerprintEngine {
    /// Encodes the ordered `(column, value)` pairs into the canonical record.
    pub fn canonical_record<S: AsRef<str>>(fields: &[(S, FieldValue)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(fields.len() * 24);
        out.extend_from_slice(&(fields.len() as u64).to_be_bytes());
        for (name, value) in fields {
            encode_bytes(name.as_ref().as_bytes(), &mut out);
            value.encode_into(&mut out);
        }
        out
    }

    /// Hashes a canonical record into a fingerprint.
    pub fn hash_record(record: &[u8]) -> i64 {
        let digest = Sha256::digest(record);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(head)
    }

    /// Fingerprints one row given as ordered `(column, value)` pairs.
    pub fn fingerprint<S: AsRef<str>>(fields: &[(S, FieldValue)]) -> i64 {
        Self::hash_record(&Self::canonical_record(fields))
    }

    /// Fingerprints every row of a set of equally long column arrays.
    ///
    /// `names` and `columns` are parallel: `names[i]` labels `columns[i]`.
    pub fn fingerprint_columns(names: &[String], columns: &[ArrayRef]) -> Result<Int64Array> {
        if names.len() != columns.len() {
            return Err(ExportError::Internal(format!(
                "fingerprint received {} names for {} columns",
                names.len(),
                columns.len()
            )));
        }

        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        if columns.iter().any(|c| c.len() != num_rows) {
            return Err(ExportError::Internal(
                "fingerprint columns have different lengths".to_string(),
            ));
        }

        let mut fingerprints = Vec::with_capacity(num_rows);
        let mut fields: Vec<(&str, FieldValue)> = Vec::with_capacity(names.len());
        for row in 0..num_rows {
            fields.clear();
            for (name, column) in names.iter().zip(columns) {
                fields.push((name.as_str(), FieldValue::from_array(column.as_ref(), row)?));
            }
            fingerprints.push(Self::fingerprint(&fields));
        }

        Ok(Int64Array::from(fingerprints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let row = [
            ("id", FieldValue::Int(42)),
            ("email", FieldValue::Text("a@example.com".to_string())),
        ];
        assert_eq!(
            FingerprintEngine::fingerprint(&row),
            FingerprintEngine::fingerprint(&row)
        );
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        let ab = [("a", FieldValue::Int(1)), ("b", FieldValue::Int(2))];
        let ba = [("b", FieldValue::Int(2)), ("a", FieldValue::Int(1))];
        assert_ne!(
            FingerprintEngine::fingerprint(&ab),
            FingerprintEngine::fingerprint(&ba)
        );
    }

    #[test]
    fn test_null_differs_from_null_text() {
        let null = [("c", FieldValue::Null)];
        let text = [("c", FieldValue::Text("null".to_string()))];
        let empty = [("c", FieldValue::Text(String::new()))];
        let fp_null = FingerprintEngine::fingerprint(&null);
        assert_ne!(fp_null, FingerprintEngine::fingerprint(&text));
        assert_ne!(fp_null, FingerprintEngine::fingerprint(&empty));
    }

    #[test]
    fn test_value_boundaries_are_unambiguous() {
        // ("ab", "c") must not collide with ("a", "bc")
        let left = [
            ("x", FieldValue::Text("ab".to_string())),
            ("y", FieldValue::Text("c".to_string())),
        ];
        let right = [
            ("x", FieldValue::Text("a".to_string())),
            ("y", FieldValue::Text("bc".to_string())),
        ];
        assert_ne!(
            FingerprintEngine::canonical_record(&left),
            FingerprintEngine::canonical_record(&right)
        );
    }

    #[test]
    fn test_integer_widths_share_encoding() {
        let narrow: ArrayRef = Arc::new(Int32Array::from(vec![7]));
        let wide: ArrayRef = Arc::new(Int64Array::from(vec![7]));
        let names = vec!["n".to_string()];
        let a = FingerprintEngine::fingerprint_columns(&names, &[narrow]).unwrap();
        let b = FingerprintEngine::fingerprint_columns(&names, &[wide]).unwrap();
        assert_eq!(a.value(0), b.value(0));
    }

    #[test]
    fn test_fingerprint_columns_matches_row_api() {
        let ids: ArrayRef = Arc::new(Int64Array::from(vec![Some(1), None]));
        let names: ArrayRef = Arc::new(StringArray::from(vec![Some("x"), Some("y")]));
        let labels = vec!["id".to_string(), "name".to_string()];

        let fps = FingerprintEngine::fingerprint_columns(&labels, &[ids, names]).unwrap();
        assert_eq!(fps.len(), 2);
        assert_eq!(
            fps.value(1),
            FingerprintEngine::fingerprint(&[
                ("id", FieldValue::Null),
                ("name", FieldValue::Text("y".to_string())),
            ])
        );
    }

    #[test]
    fn test_mismatched_inputs_are_rejected() {
        let ids: ArrayRef = Arc::new(Int64Array::from(vec![1, 2]));
        let short: ArrayRef = Arc::new(Int64Array::from(vec![1]));
        let names = vec!["a".to_string(), "b".to_string()];
        assert!(FingerprintEngine::fingerprint_columns(&names[..1], &[ids.clone(), short.clone()]).is_err());
        assert!(FingerprintEngine::fingerprint_columns(&names, &[ids, short]).is_err());
    }
}
