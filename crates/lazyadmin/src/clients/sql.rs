//! SQL resource client.

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Scalar-query client over one declared Postgres resource.
#[derive(Clone)]
pub struct SqlClient {
    pool: PgPool,
}

impl SqlClient {
    /// Connect a small pool; establishes one connection eagerly so a bad DSN
    /// surfaces at startup, not on first use.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(dsn)
            .await
            .map_err(|e| Error::Transport(format!("connect postgres: {e}")))?;
        Ok(Self { pool })
    }

    /// Execute `query` and read exactly one column from exactly one row,
    /// coerced to text. Zero rows, extra rows and extra columns are errors.
    pub async fn run_scalar(&self, cancel: &CancellationToken, query: &str) -> Result<String> {
        let fetch = sqlx::query(query).fetch_all(&self.pool);
        let rows = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("sql query cancelled".into()));
            }
            res = fetch => res.map_err(|e| Error::Transport(e.to_string()))?,
        };

        if rows.len() != 1 {
            return Err(Error::Transport(format!(
                "scalar query returned {} rows, want exactly 1",
                rows.len()
            )));
        }
        let row = &rows[0];
        if row.columns().len() != 1 {
            return Err(Error::Transport(format!(
                "scalar query returned {} columns, want exactly 1",
                row.columns().len()
            )));
        }

        scalar_text(row)
    }
}

/// Render the single column of `row` as text.
fn scalar_text(row: &PgRow) -> Result<String> {
    fn get<'r, T>(row: &'r PgRow) -> Result<Option<T>>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(0)
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn text<T: ToString>(value: Option<T>) -> String {
        value.map(|v| v.to_string()).unwrap_or_else(|| "NULL".into())
    }

    let type_name = row.columns()[0].type_info().name().to_string();
    let rendered = match type_name.as_str() {
        "BOOL" => text(get::<bool>(row)?),
        "INT2" => text(get::<i16>(row)?),
        "INT4" => text(get::<i32>(row)?),
        "INT8" => text(get::<i64>(row)?),
        "FLOAT4" => text(get::<f32>(row)?),
        "FLOAT8" => text(get::<f64>(row)?),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => text(get::<String>(row)?),
        "TIMESTAMPTZ" => text(get::<chrono::DateTime<chrono::Utc>>(row)?.map(|t| t.to_rfc3339())),
        "TIMESTAMP" => text(get::<chrono::NaiveDateTime>(row)?),
        "DATE" => text(get::<chrono::NaiveDate>(row)?),
        _ => {
            // Last resort before giving up: many extension types decode as text.
            match get::<String>(row) {
                Ok(v) => text(v),
                Err(_) => {
                    return Err(Error::Transport(format!(
                        "unsupported scalar column type {type_name}"
                    )))
                }
            }
        }
    };

    Ok(rendered)
}
