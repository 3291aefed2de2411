pub const MESSAGES_RECEIVED: &str = "archiver_messages_received";
pub const MESSAGES_PROCESSED: &str = "archiver_messages_processed";
pub const MESSAGES_FAILED: &str = "archiver_messages_failed";
pub const INVALID_RECORDS: &str = "archiver_invalid_records";
pub const DEAD_LETTERS_SENT: &str = "archiver_dead_letters_sent";
pub const DEAD_LETTER_FAILURES: &str = "archiver_dead_letter_failures";
pub const BATCHES_PROCESSED: &str = "archiver_batches_processed";
pub const BATCH_SIZE: &str = "archiver_batch_size";
pub const BATCH_PROCESS_TIME: &str = "archiver_batch_process_time_ms";
pub const WRITE_ATTEMPTS: &str = "archiver_store_write_attempts";
pub const RECORDS_INSERTED: &str = "archiver_store_records_inserted";
pub const RECORDS_DUPLICATE: &str = "archiver_store_records_duplicate";
pub const WRITE_FAILURES: &str = "archiver_store_write_failures";
pub const WRITE_RETRIES: &str = "archiver_store_write_retries";
pub const WRITE_TIME: &str = "archiver_store_write_time_ms";
pub const BATCH_WRITE_TIME: &str = "archiver_store_batch_write_time_ms";
pub const CIRCUIT_OPEN_REJECTIONS: &str = "archiver_circuit_open_rejections";
pub const CIRCUIT_STATE: &str = "archiver_circuit_breaker_state";
pub const CIRCUIT_TRANSITIONS: &str = "archiver_circuit_breaker_transitions";
pub const SHUTDOWN_ABANDONED: &str = "archiver_shutdown_abandoned_records";
