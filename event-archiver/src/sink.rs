use std::sync::Arc;

use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::WriteError;
use crate::metrics_consts::{
    BATCH_WRITE_TIME, CIRCUIT_OPEN_REJECTIONS, CIRCUIT_STATE, RECORDS_DUPLICATE, RECORDS_INSERTED,
    WRITE_ATTEMPTS, WRITE_FAILURES, WRITE_TIME,
};
use crate::store::{BatchOutcome, RecordStore, WriteOutcome};
use crate::types::Record;

/// Idempotent persistence against the store, gated by the circuit breaker.
///
/// The writer owns the breaker: it is the only component that consults or
/// feeds it, once per call, based on the call's overall outcome. A duplicate
/// is a success here, the store already holds the record.
pub struct SinkWriter {
    store: Arc<dyn RecordStore>,
    breaker: CircuitBreaker,
}

impl SinkWriter {
    pub fn new(store: Arc<dyn RecordStore>, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::new("store", breaker_config),
        }
    }

    pub async fn write(&self, record: &Record) -> Result<WriteOutcome, WriteError> {
        if !self.breaker.can_execute() {
            metrics::counter!(CIRCUIT_OPEN_REJECTIONS).increment(1);
            return Err(WriteError::CircuitOpen);
        }

        metrics::counter!(WRITE_ATTEMPTS).increment(1);
        let timer = common_metrics::timing_guard(WRITE_TIME, &[]);
        let result = self.store.insert_if_absent(record).await;
        match result {
            Ok(outcome) => {
                self.breaker.record_success();
                timer.label("result", "success").fin();
                match outcome {
                    WriteOutcome::Inserted => {
                        metrics::counter!(RECORDS_INSERTED).increment(1);
                    }
                    WriteOutcome::Duplicate => {
                        debug!(record_id = record.id, "record already archived");
                        metrics::counter!(RECORDS_DUPLICATE).increment(1);
                    }
                }
                self.export_state();
                Ok(outcome)
            }
            Err(error) => {
                self.breaker.record_failure();
                timer.label("result", "failed").fin();
                metrics::counter!(WRITE_FAILURES).increment(1);
                self.export_state();
                Err(WriteError::Store(error))
            }
        }
    }

    pub async fn write_batch(&self, records: &[Record]) -> Result<BatchOutcome, WriteError> {
        if !self.breaker.can_execute() {
            metrics::counter!(CIRCUIT_OPEN_REJECTIONS).increment(1);
            return Err(WriteError::CircuitOpen);
        }

        metrics::counter!(WRITE_ATTEMPTS).increment(1);
        let timer = common_metrics::timing_guard(BATCH_WRITE_TIME, &[]);
        let result = self.store.insert_batch(records).await;
        match result {
            Ok(outcome) => {
                self.breaker.record_success();
                timer.label("result", "success").fin();
                metrics::counter!(RECORDS_INSERTED).increment(outcome.inserted);
                metrics::counter!(RECORDS_DUPLICATE).increment(outcome.duplicates);
                self.export_state();
                Ok(outcome)
            }
            Err(error) => {
                self.breaker.record_failure();
                timer.label("result", "failed").fin();
                metrics::counter!(WRITE_FAILURES).increment(1);
                self.export_state();
                Err(WriteError::Store(error))
            }
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    fn export_state(&self) {
        metrics::gauge!(CIRCUIT_STATE).set(self.breaker.state().as_gauge());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::test_utils::{record, MemoryStore};
    use std::time::Duration;

    fn writer(store: Arc<MemoryStore>, failure_threshold: u32) -> SinkWriter {
        SinkWriter::new(
            store,
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 2,
                open_timeout: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn second_write_of_the_same_id_is_a_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let writer = writer(store.clone(), 3);

        let r = record("evt-1");
        assert_eq!(writer.write(&r).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(writer.write(&r).await.unwrap(), WriteOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn batch_write_reports_aggregate_counts() {
        let store = Arc::new(MemoryStore::new());
        let writer = writer(store.clone(), 3);

        writer.write(&record("evt-1")).await.unwrap();
        let outcome = writer
            .write_batch(&[record("evt-1"), record("evt-2"), record("evt-3")])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                inserted: 2,
                duplicates: 1
            }
        );
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn circuit_opens_and_rejects_without_touching_the_store() {
        let store = Arc::new(MemoryStore::new());
        let writer = writer(store.clone(), 2);
        store.set_failing(true);

        let r = record("evt-1");
        assert!(matches!(
            writer.write(&r).await,
            Err(WriteError::Store(_))
        ));
        assert!(matches!(
            writer.write(&r).await,
            Err(WriteError::Store(_))
        ));
        assert_eq!(writer.circuit_state(), CircuitState::Open);
        assert_eq!(store.attempts(), 2);

        // Rejected up front: the store never sees the third call
        assert!(matches!(writer.write(&r).await, Err(WriteError::CircuitOpen)));
        assert_eq!(store.attempts(), 2);
    }

    #[tokio::test]
    async fn circuit_recovers_through_half_open_probes() {
        let store = Arc::new(MemoryStore::new());
        let writer = writer(store.clone(), 2);
        store.set_failing(true);

        let r = record("evt-1");
        let _unused = writer.write(&r).await;
        let _unused2 = writer.write(&r).await;
        assert_eq!(writer.circuit_state(), CircuitState::Open);

        store.set_failing(false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(writer.write(&r).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(writer.circuit_state(), CircuitState::HalfOpen);
        assert_eq!(writer.write(&r).await.unwrap(), WriteOutcome::Duplicate);
        assert_eq!(writer.circuit_state(), CircuitState::Closed);
    }
}
