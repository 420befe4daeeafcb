//! Common test fixtures for key discovery and export scenarios.
//!
//! The contexts are plain DataFusion sessions backed by in-memory tables;
//! wrap them with [`crate::store::DataFusionStore::from_context`] to get a
//! query executor with the export functions registered.

use std::sync::Arc;

use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use datafusion::datasource::MemTable;
use datafusion::prelude::*;

use crate::crypto::{RecipientKey, RecipientSecret};
use crate::error::Result;
use crate::selector::{KeySelectionResult, SelectionStep};
use crate::store::TableRef;

/// Creates a context with an `accounts` table of `rows` rows in which
/// `region` and `seq` are jointly unique while no single column is.
///
/// | column | values                                      |
/// |--------|---------------------------------------------|
/// | region | `north`, `south` alternating                |
/// | seq    | `i / 2`, so every value appears twice       |
/// | status | `active`/`inactive`, a function of `seq`    |
/// | note   | mostly null, two repeating values otherwise |
///
/// With `rows == 0` the table is empty but keeps the schema.
pub async fn create_unique_pair_context(rows: usize) -> Result<SessionContext> {
    let ctx = SessionContext::new();

    let schema = Arc::new(Schema::new(vec![
        Field::new("region", DataType::Utf8, false),
        Field::new("seq", DataType::Int64, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("note", DataType::Utf8, true),
    ]));

    let region: Vec<&str> = (0..rows).map(|i| ["north", "south"][i % 2]).collect();
    let seq: Vec<i64> = (0..rows).map(|i| (i / 2) as i64).collect();
    let status: Vec<&str> = (0..rows)
        .map(|i| ["active", "inactive"][(i / 2) % 2])
        .collect();
    let note: Vec<Option<&str>> = (0..rows)
        .map(|i| (i % 5 == 0).then(|| ["vip", "flagged"][(i / 5) % 2]))
        .collect();

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(region)),
            Arc::new(Int64Array::from(seq)),
            Arc::new(StringArray::from(status)),
            Arc::new(StringArray::from(note)),
        ],
    )?;

    let table = MemTable::try_new(schema, vec![vec![batch]])?;
    ctx.register_table("accounts", Arc::new(table))?;

    Ok(ctx)
}

/// Creates a context with a six-row `events` table:
/// `id` is unique, `kind` repeats, and `tag` is half null with two values.
pub async fn create_nulls_and_duplicates_context() -> Result<SessionContext> {
    let ctx = SessionContext::new();

    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("tag", DataType::Utf8, true),
        Field::new("amount", DataType::Float64, true),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5, 6])),
            Arc::new(StringArray::from(vec![
                "click", "view", "click", "view", "click", "click",
            ])),
            Arc::new(StringArray::from(vec![
                Some("a"),
                None,
                Some("b"),
                None,
                Some("a"),
                None,
            ])),
            Arc::new(Float64Array::from(vec![
                Some(1.5),
                Some(2.0),
                None,
                Some(2.0),
                Some(0.5),
                None,
            ])),
        ],
    )?;

    let table = MemTable::try_new(schema, vec![vec![batch]])?;
    ctx.register_table("events", Arc::new(table))?;

    Ok(ctx)
}

/// Generates a recipient key pair for `email`.
pub fn recipient_pair(email: &str) -> Result<(RecipientSecret, RecipientKey)> {
    let secret = RecipientSecret::generate(vec![email.to_string()]);
    let public = secret.recipient()?;
    Ok((secret, public))
}

/// A fully populated key-selection record for audit tests.
pub fn sample_key_selection(table: &str, columns: &[&str]) -> KeySelectionResult {
    let selected: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    KeySelectionResult {
        table: TableRef::bare(table),
        selection_path: (1..=selected.len())
            .map(|k| SelectionStep {
                k,
                columns: selected[..k].to_vec(),
                distinct_count: 50 * k as u64,
                ratio: (50 * k as u64) as f64 / 100.0,
            })
            .collect(),
        selected_columns: selected,
        total_rows: 100,
        distinct_row_count: 100,
        uniqueness_ratio: 1.0,
        exact_unique: true,
        threshold_met: true,
        column_stats: Vec::new(),
        sample_fraction: 0.02,
        uniqueness_threshold: 0.9999,
        computed_at: Utc::now(),
    }
}
