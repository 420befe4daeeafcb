//! A small parameterized query builder.
//!
//! Identifiers and literal values never meet as raw strings: identifiers are
//! wrapped in [`Ident`] (validated when caller-supplied, escaped when read
//! from a schema, always quoted) and values in [`Literal`] (escaped or checked
//! by type). Every statement the crate issues is produced by a [`Query`]
//! constructor, so the set of SQL shapes is closed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::security::{InputValidator, SqlSecurity};

/// Name of the fingerprint scalar function registered in the store.
pub const FINGERPRINT_FUNCTION: &str = "fingerprint";

/// Name of the shard assignment scalar function registered in the store.
pub const SHARD_OF_FUNCTION: &str = "shard_of";

/// A quoted SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident {
    name: String,
}

impl Ident {
    /// Creates an identifier from caller input, rejecting anything outside
    /// the plain identifier pattern.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        SqlSecurity::validate_identifier(&name)?;
        Ok(Self { name })
    }

    /// Creates an identifier from a name read back from a table schema.
    pub fn from_schema(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        InputValidator::validate_no_null_bytes(&name, "column name")?;
        Ok(Self { name })
    }

    /// The unquoted name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The quoted, escaped SQL form.
    pub fn sql(&self) -> String {
        SqlSecurity::quote_identifier(&self.name)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A literal value bound into a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    /// Renders the literal as SQL.
    pub fn sql(&self) -> Result<String> {
        match self {
            Self::Int(v) => Ok(v.to_string()),
            Self::Float(v) => {
                InputValidator::validate_threshold(*v, "float literal")?;
                // Debug formatting always keeps a decimal point or exponent
                Ok(format!("{v:?}"))
            }
            Self::Text(v) => SqlSecurity::quote_literal(v),
        }
    }
}

/// Identity of a table: optional catalog and schema plus the table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    /// A table in the default catalog and schema.
    pub fn bare(table: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            table: table.into(),
        }
    }

    /// A fully qualified table.
    pub fn full(
        catalog: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            catalog: Some(catalog.into()),
            schema: Some(schema.into()),
            table: table.into(),
        }
    }

    /// Parses `table`, `schema.table` or `catalog.schema.table`.
    pub fn parse(qualified: &str) -> Result<Self> {
        let parts: Vec<&str> = qualified.split('.').collect();
        let table = match parts.as_slice() {
            [t] => Self::bare(*t),
            [s, t] => Self {
                catalog: None,
                schema: Some((*s).to_string()),
                table: (*t).to_string(),
            },
            [c, s, t] => Self::full(*c, *s, *t),
            _ => {
                return Err(ExportError::Configuration(format!(
                    "table reference '{qualified}' has too many parts"
                )))
            }
        };
        table.validate()?;
        Ok(table)
    }

    /// Validates every part as a caller-supplied identifier.
    pub fn validate(&self) -> Result<()> {
        for part in self.parts() {
            SqlSecurity::validate_identifier(part)?;
        }
        Ok(())
    }

    fn parts(&self) -> impl Iterator<Item = &str> {
        self.catalog
            .as_deref()
            .into_iter()
            .chain(self.schema.as_deref())
            .chain(std::iter::once(self.table.as_str()))
    }

    /// The quoted SQL form, e.g. `"db"."public"."orders"`.
    pub fn sql(&self) -> Result<String> {
        let quoted = self
            .parts()
            .map(SqlSecurity::escape_identifier)
            .collect::<Result<Vec<_>>>()?;
        Ok(quoted.join("."))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.parts().collect();
        f.write_str(&parts.join("."))
    }
}

/// The fingerprint expression over an ordered column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintExpr {
    columns: Vec<Ident>,
}

impl FingerprintExpr {
    pub fn new(columns: Vec<Ident>) -> Result<Self> {
        if columns.is_empty() {
            return Err(ExportError::Configuration(
                "fingerprint requires at least one column".to_string(),
            ));
        }
        Ok(Self { columns })
    }

    /// Builds the expression from schema-derived column names.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let columns = names
            .iter()
            .map(|n| Ident::from_schema(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(columns)
    }

    pub fn columns(&self) -> &[Ident] {
        &self.columns
    }

    /// Renders `fingerprint('a', "a", 'b', "b", ...)`.
    pub fn sql(&self) -> Result<String> {
        let mut args = Vec::with_capacity(self.columns.len() * 2);
        for column in &self.columns {
            args.push(Literal::Text(column.name().to_string()).sql()?);
            args.push(column.sql());
        }
        Ok(format!("{FINGERPRINT_FUNCTION}({})", args.join(", ")))
    }

    /// Renders `shard_of(fingerprint(...), n)`.
    pub fn shard_sql(&self, n_shards: u32) -> Result<String> {
        if n_shards == 0 {
            return Err(ExportError::Configuration(
                "shard count must be at least 1".to_string(),
            ));
        }
        Ok(format!(
            "{SHARD_OF_FUNCTION}({}, {})",
            self.sql()?,
            Literal::Int(i64::from(n_shards)).sql()?
        ))
    }
}

/// The logical operation a query performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    RowCount,
    Probe,
    Sample,
    Profile,
    DistinctFingerprints,
    GroupCount,
    ShardCounts,
    ShardExtract,
}

/// A rendered statement together with its logical kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: QueryKind,
    sql: String,
}

/// Column aliases used by [`Query::profile`].
pub fn profile_aliases(index: usize) -> (String, String) {
    (format!("ndv_{index}"), format!("non_null_{index}"))
}

impl Query {
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// `SELECT COUNT(*) AS row_count FROM t`
    pub fn row_count(table: &TableRef) -> Result<Self> {
        Ok(Self {
            kind: QueryKind::RowCount,
            sql: format!("SELECT COUNT(*) AS row_count FROM {}", table.sql()?),
        })
    }

    /// Reads at most one row; used to confirm read access.
    pub fn probe(table: &TableRef) -> Result<Self> {
        Ok(Self {
            kind: QueryKind::Probe,
            sql: format!("SELECT * FROM {} LIMIT 1", table.sql()?),
        })
    }

    /// Per-row Bernoulli sample of approximately `fraction` of the rows.
    pub fn sample(table: &TableRef, fraction: f64) -> Result<Self> {
        InputValidator::validate_fraction(fraction, "sample_fraction")?;
        Ok(Self {
            kind: QueryKind::Sample,
            sql: format!(
                "SELECT * FROM {} WHERE random() < {}",
                table.sql()?,
                Literal::Float(fraction).sql()?
            ),
        })
    }

    /// Sampled row count plus approximate distinct and non-null counts per
    /// column, aliased by position (see [`profile_aliases`]).
    pub fn profile(table: &TableRef, columns: &[Ident]) -> Result<Self> {
        let mut select = vec!["COUNT(*) AS sample_rows".to_string()];
        for (i, column) in columns.iter().enumerate() {
            let (ndv, non_null) = profile_aliases(i);
            let col = column.sql();
            select.push(format!("APPROX_DISTINCT(CAST({col} AS VARCHAR)) AS {ndv}"));
            select.push(format!("COUNT({col}) AS {non_null}"));
        }
        Ok(Self {
            kind: QueryKind::Profile,
            sql: format!("SELECT {} FROM {}", select.join(", "), table.sql()?),
        })
    }

    /// Exact number of distinct fingerprints across the full table.
    pub fn distinct_fingerprints(table: &TableRef, fp: &FingerprintExpr) -> Result<Self> {
        Ok(Self {
            kind: QueryKind::DistinctFingerprints,
            sql: format!(
                "SELECT COUNT(DISTINCT {}) AS distinct_count FROM {}",
                fp.sql()?,
                table.sql()?
            ),
        })
    }

    /// Number of groups when grouping the table by `columns`.
    pub fn group_count(table: &TableRef, columns: &[Ident]) -> Result<Self> {
        if columns.is_empty() {
            return Err(ExportError::Configuration(
                "group count requires at least one column".to_string(),
            ));
        }
        let cols: Vec<String> = columns.iter().map(Ident::sql).collect();
        Ok(Self {
            kind: QueryKind::GroupCount,
            sql: format!(
                "SELECT COUNT(*) AS group_count FROM (SELECT 1 AS one FROM {} GROUP BY {}) grouped",
                table.sql()?,
                cols.join(", ")
            ),
        })
    }

    /// Row count per shard, ordered by shard id.
    pub fn shard_counts(table: &TableRef, fp: &FingerprintExpr, n_shards: u32) -> Result<Self> {
        Ok(Self {
            kind: QueryKind::ShardCounts,
            sql: format!(
                "SELECT shard_id, COUNT(*) AS row_count FROM (SELECT {} AS shard_id FROM {}) assigned GROUP BY shard_id ORDER BY shard_id",
                fp.shard_sql(n_shards)?,
                table.sql()?
            ),
        })
    }

    /// All rows of one shard.
    pub fn shard_extract(
        table: &TableRef,
        fp: &FingerprintExpr,
        n_shards: u32,
        shard_id: u32,
    ) -> Result<Self> {
        if shard_id >= n_shards {
            return Err(ExportError::Configuration(format!(
                "shard {shard_id} is out of range for {n_shards} shards"
            )));
        }
        Ok(Self {
            kind: QueryKind::ShardExtract,
            sql: format!(
                "SELECT * FROM {} WHERE {} = {}",
                table.sql()?,
                fp.shard_sql(n_shards)?,
                Literal::Int(i64::from(shard_id)).sql()?
            ),
        })
    }
}
