//! In-memory doubles for the pipeline's external collaborators, used by the
//! unit tests here and the integration tests under `tests/`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common_kafka::kafka_consumer::OffsetErr;
use serde_json::json;

use crate::dead_letter::{DeadLetterSink, FailedRecord};
use crate::error::{DeadLetterError, StoreError};
use crate::pipeline::LogMessage;
use crate::store::{BatchOutcome, RecordStore, WriteOutcome};
use crate::types::Record;

pub fn record(id: &str) -> Record {
    serde_json::from_value(json!({
        "id": id,
        "type": "user.created",
        "source": "accounts",
        "time": "2024-06-01T12:00:00Z",
        "plan": "pro"
    }))
    .expect("test record is valid")
}

pub fn record_bytes(id: &str) -> Vec<u8> {
    serde_json::to_vec(&record(id)).expect("test record serializes")
}

/// Store double: a HashMap keyed like the real table, with an outage switch.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Store calls observed, including ones that failed.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.lock().unwrap().contains_key(id)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected store outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_if_absent(&self, record: &Record) -> Result<WriteOutcome, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.id) {
            Ok(WriteOutcome::Duplicate)
        } else {
            records.insert(record.id.clone(), record.clone());
            Ok(WriteOutcome::Inserted)
        }
    }

    async fn insert_batch(&self, batch: &[Record]) -> Result<BatchOutcome, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        let mut outcome = BatchOutcome::default();
        for record in batch {
            if records.contains_key(&record.id) {
                outcome.duplicates += 1;
            } else {
                records.insert(record.id.clone(), record.clone());
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[derive(Debug, Clone)]
pub struct CapturedDeadLetter {
    pub payload: Vec<u8>,
    pub key: Option<Vec<u8>>,
    pub reason: String,
}

/// Dead-letter double: records every append, with an outage switch.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    entries: Mutex<Vec<CapturedDeadLetter>>,
    failing: AtomicBool,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<CapturedDeadLetter> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(
        &self,
        record: FailedRecord<'_>,
        error_reason: &str,
    ) -> Result<(), DeadLetterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Unavailable(
                "injected dead letter outage".to_string(),
            ));
        }
        self.entries.lock().unwrap().push(CapturedDeadLetter {
            payload: record.payload.to_vec(),
            key: record.key.map(|k| k.to_vec()),
            reason: error_reason.to_string(),
        });
        Ok(())
    }
}

/// A log message whose commit lands in a shared, ordered commit log.
pub struct TestMessage {
    payload: Option<Vec<u8>>,
    key: Option<Vec<u8>>,
    headers: Vec<(String, Vec<u8>)>,
    offset: i64,
    committed: Arc<Mutex<Vec<i64>>>,
}

impl TestMessage {
    pub fn new(offset: i64, payload: Vec<u8>, committed: Arc<Mutex<Vec<i64>>>) -> Self {
        Self {
            payload: Some(payload),
            key: None,
            headers: Vec::new(),
            offset,
            committed,
        }
    }

    pub fn valid(offset: i64, id: &str, committed: Arc<Mutex<Vec<i64>>>) -> Self {
        Self::new(offset, record_bytes(id), committed)
    }
}

impl LogMessage for TestMessage {
    fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    fn headers(&self) -> &[(String, Vec<u8>)] {
        &self.headers
    }

    fn commit(self) -> Result<(), OffsetErr> {
        self.committed.lock().unwrap().push(self.offset);
        Ok(())
    }
}
