//! Data Access Layer
//!
//! All interaction with PostgreSQL goes through [`Db`]. Queries are bound at
//! runtime so the crate builds without a live database.

use anyhow::{Context, Result};
use quote_core::QuotePayload;
use sqlx::{PgPool, types::Json};
use uuid::Uuid;

use crate::models::{QuoteRow, StoredQuote};

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Stores a finalized quote.
    pub async fn insert_quote(&self, payload: &QuotePayload) -> Result<StoredQuote> {
        let row = sqlx::query_as::<_, QuoteRow>(
            r#"
            INSERT INTO quotes (id, payload, complete)
            VALUES ($1, $2, $3)
            RETURNING id, payload, complete, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(Json(payload))
        .bind(payload.is_complete())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert quote")?;
        Ok(row.into())
    }

    pub async fn get_quote(&self, id: Uuid) -> Result<Option<StoredQuote>> {
        let row = sqlx::query_as::<_, QuoteRow>(
            "SELECT id, payload, complete, created_at FROM quotes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch quote")?;
        Ok(row.map(Into::into))
    }

    /// Lists quotes, most recent first.
    pub async fn list_quotes(&self) -> Result<Vec<StoredQuote>> {
        let rows = sqlx::query_as::<_, QuoteRow>(
            "SELECT id, payload, complete, created_at FROM quotes ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list quotes")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
