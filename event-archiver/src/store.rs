use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use crate::error::StoreError;
use crate::types::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No entry existed for this id; a row was written.
    Inserted,
    /// An entry already existed for this id; the write was a no-op.
    /// Not an error: redelivery is expected under at-least-once intake.
    Duplicate,
}

impl WriteOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, WriteOutcome::Duplicate)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub duplicates: u64,
}

/// The document store the archiver persists records into, keyed by record
/// id with insert-if-absent semantics. A trait so the pipeline can be
/// exercised against an in-memory store in tests.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_if_absent(&self, record: &Record) -> Result<WriteOutcome, StoreError>;

    /// One unordered bulk operation: a conflict on one row does not block
    /// the independent rows in the same call.
    async fn insert_batch(&self, records: &[Record]) -> Result<BatchOutcome, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn insert_if_absent(&self, record: &Record) -> Result<WriteOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO archived_events (id, event_type, source, event_time, payload)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(&record.id)
        .bind(&record.event_type)
        .bind(&record.source)
        .bind(record.time)
        .bind(Value::Object(record.payload.clone()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(WriteOutcome::Inserted)
        } else {
            Ok(WriteOutcome::Duplicate)
        }
    }

    async fn insert_batch(&self, records: &[Record]) -> Result<BatchOutcome, StoreError> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut ids = Vec::with_capacity(records.len());
        let mut event_types = Vec::with_capacity(records.len());
        let mut sources = Vec::with_capacity(records.len());
        let mut times = Vec::with_capacity(records.len());
        let mut payloads = Vec::with_capacity(records.len());
        for record in records {
            ids.push(record.id.clone());
            event_types.push(record.event_type.clone());
            sources.push(record.source.clone());
            times.push(record.time);
            payloads.push(Value::Object(record.payload.clone()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO archived_events (id, event_type, source, event_time, payload)
                (SELECT * FROM UNNEST(
                    $1::text[],
                    $2::text[],
                    $3::text[],
                    $4::timestamptz[],
                    $5::jsonb[])) ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(&ids)
        .bind(&event_types)
        .bind(&sources)
        .bind(&times)
        .bind(&payloads)
        .execute(&self.pool)
        .await?;

        // The statement is atomic: it either failed above as a whole, or
        // succeeded with conflicting rows skipped, so every non-inserted
        // row really is a duplicate.
        let inserted = result.rows_affected();
        Ok(BatchOutcome {
            inserted,
            duplicates: records.len() as u64 - inserted,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
