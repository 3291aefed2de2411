use event_archiver::store::{BatchOutcome, PostgresStore, RecordStore, WriteOutcome};
use event_archiver::test_utils::record;
use serde_json::json;
use sqlx::PgPool;

#[sqlx::test(migrations = "./migrations")]
async fn second_write_of_the_same_id_is_a_noop(db: PgPool) {
    let store = PostgresStore::new(db.clone());

    let r = record("evt-1");
    assert_eq!(
        store.insert_if_absent(&r).await.unwrap(),
        WriteOutcome::Inserted
    );
    assert_eq!(
        store.insert_if_absent(&r).await.unwrap(),
        WriteOutcome::Duplicate
    );

    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM archived_events WHERE id = $1")
        .bind(&r.id)
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn payload_fields_survive_the_round_trip(db: PgPool) {
    let store = PostgresStore::new(db.clone());

    let r = record("evt-1");
    store.insert_if_absent(&r).await.unwrap();

    let payload: serde_json::Value =
        sqlx::query_scalar("SELECT payload FROM archived_events WHERE id = $1")
            .bind(&r.id)
            .fetch_one(&db)
            .await
            .unwrap();
    assert_eq!(payload, json!({"plan": "pro"}));
}

#[sqlx::test(migrations = "./migrations")]
async fn bulk_insert_skips_existing_rows(db: PgPool) {
    let store = PostgresStore::new(db.clone());

    store.insert_if_absent(&record("evt-1")).await.unwrap();
    let outcome = store
        .insert_batch(&[record("evt-1"), record("evt-2"), record("evt-3")])
        .await
        .unwrap();

    assert_eq!(
        outcome,
        BatchOutcome {
            inserted: 2,
            duplicates: 1
        }
    );

    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM archived_events")
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[sqlx::test(migrations = "./migrations")]
async fn bulk_insert_handles_duplicates_within_the_batch(db: PgPool) {
    let store = PostgresStore::new(db.clone());

    let outcome = store
        .insert_batch(&[record("evt-1"), record("evt-1")])
        .await
        .unwrap();

    assert_eq!(
        outcome,
        BatchOutcome {
            inserted: 1,
            duplicates: 1
        }
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn empty_batch_is_a_noop(db: PgPool) {
    let store = PostgresStore::new(db.clone());
    assert_eq!(
        store.insert_batch(&[]).await.unwrap(),
        BatchOutcome::default()
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn ping_succeeds_against_a_live_database(db: PgPool) {
    let store = PostgresStore::new(db);
    store.ping().await.unwrap();
}
