//! Scalar SQL functions backing fingerprinting and shard assignment.
//!
//! Both functions delegate to the Rust implementations
//! ([`FingerprintEngine`] and [`ShardPlanner::shard_of`]), so a fingerprint
//! computed in SQL during planning is bit-identical to one computed during
//! extraction or in a unit test.

use std::any::Any;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array};
use arrow::datatypes::DataType;
use datafusion::common::{exec_err, DataFusionError, Result as DFResult, ScalarValue};
use datafusion::logical_expr::{
    ColumnarValue, ScalarFunctionArgs, ScalarUDF, ScalarUDFImpl, Signature, Volatility,
};

use crate::fingerprint::FingerprintEngine;
use crate::shard::ShardPlanner;
use crate::store::query::{FINGERPRINT_FUNCTION, SHARD_OF_FUNCTION};

/// `fingerprint(name1, col1, name2, col2, ...) -> BIGINT`
///
/// Names are string literals labelling the column that follows them.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct FingerprintUdf {
    signature: Signature,
}

impl FingerprintUdf {
    pub fn new() -> Self {
        Self {
            signature: Signature::variadic_any(Volatility::Immutable),
        }
    }
}

impl Default for FingerprintUdf {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalarUDFImpl for FingerprintUdf {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        FINGERPRINT_FUNCTION
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn return_type(&self, _arg_types: &[DataType]) -> DFResult<DataType> {
        Ok(DataType::Int64)
    }

    fn invoke_with_args(&self, args: ScalarFunctionArgs) -> DFResult<ColumnarValue> {
        if args.args.is_empty() || args.args.len() % 2 != 0 {
            return exec_err!(
                "{FINGERPRINT_FUNCTION} expects (name, column) pairs, got {} arguments",
                args.args.len()
            );
        }

        let num_rows = args.number_rows;
        let mut names = Vec::with_capacity(args.args.len() / 2);
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(args.args.len() / 2);
        for pair in args.args.chunks(2) {
            let name = match &pair[0] {
                ColumnarValue::Scalar(
                    ScalarValue::Utf8(Some(s))
                    | ScalarValue::LargeUtf8(Some(s))
                    | ScalarValue::Utf8View(Some(s)),
                ) => s.clone(),
                other => {
                    return exec_err!(
                        "{FINGERPRINT_FUNCTION} column labels must be string literals, got {}",
                        other.data_type()
                    )
                }
            };
            names.push(name);
            columns.push(pair[1].clone().into_array(num_rows)?);
        }

        let fingerprints = FingerprintEngine::fingerprint_columns(&names, &columns)
            .map_err(|e| DataFusionError::Execution(e.to_string()))?;
        Ok(ColumnarValue::Array(Arc::new(fingerprints)))
    }
}

/// `shard_of(fingerprint BIGINT, n_shards BIGINT) -> BIGINT`
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ShardOfUdf {
    signature: Signature,
}

impl ShardOfUdf {
    pub fn new() -> Self {
        Self {
            signature: Signature::exact(
                vec![DataType::Int64, DataType::Int64],
                Volatility::Immutable,
            ),
        }
    }
}

impl Default for ShardOfUdf {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalarUDFImpl for ShardOfUdf {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        SHARD_OF_FUNCTION
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn return_type(&self, _arg_types: &[DataType]) -> DFResult<DataType> {
        Ok(DataType::Int64)
    }

    fn invoke_with_args(&self, args: ScalarFunctionArgs) -> DFResult<ColumnarValue> {
        let [fingerprints, shards] = args.args.as_slice() else {
            return exec_err!("{SHARD_OF_FUNCTION} expects 2 arguments");
        };
        let num_rows = args.number_rows;
        let fingerprints = fingerprints.clone().into_array(num_rows)?;
        let shards = shards.clone().into_array(num_rows)?;

        let (Some(fingerprints), Some(shards)) = (
            fingerprints.as_any().downcast_ref::<Int64Array>(),
            shards.as_any().downcast_ref::<Int64Array>(),
        ) else {
            return exec_err!("{SHARD_OF_FUNCTION} expects BIGINT arguments");
        };

        let mut out = Vec::with_capacity(num_rows);
        for row in 0..fingerprints.len() {
            if fingerprints.is_null(row) || shards.is_null(row) {
                out.push(None);
                continue;
            }
            let n_shards = u32::try_from(shards.value(row)).map_err(|_| {
                DataFusionError::Execution(format!(
                    "{SHARD_OF_FUNCTION} shard count {} is out of range",
                    shards.value(row)
                ))
            })?;
            let shard = ShardPlanner::shard_of(fingerprints.value(row), n_shards)
                .map_err(|e| DataFusionError::Execution(e.to_string()))?;
            out.push(Some(i64::from(shard)));
        }
        Ok(ColumnarValue::Array(Arc::new(Int64Array::from(out))))
    }
}

/// The UDFs every store session registers.
pub fn export_udfs() -> Vec<ScalarUDF> {
    vec![
        ScalarUDF::from(FingerprintUdf::new()),
        ScalarUDF::from(ShardOfUdf::new()),
    ]
}
