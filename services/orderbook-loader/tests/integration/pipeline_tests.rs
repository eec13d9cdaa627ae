//! Integration tests: the ingestion loop over in-memory queue and store

use crate::common::*;
use crate::init_test_logging;
use orderbook_loader::{CycleOutcome, IngestionLoop, QueueError, StoreFault};
use pretty_assertions::assert_eq;
use rstest::*;
use rust_decimal::prelude::ToPrimitive;
use services_common::venue_date;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

type TestLoop = IngestionLoop<FakeQueue, FakeDatabase>;

fn pipeline(commit_count: usize, queue: &FakeQueue, db: &FakeDatabase) -> TestLoop {
    IngestionLoop::new(&test_config(commit_count), queue.clone(), db.clone())
}

#[fixture]
fn ready_db() -> FakeDatabase {
    FakeDatabase::with_schema("BTC", &[date(2023, 11, 15), date(2023, 11, 16)])
}

#[tokio::test(start_paused = true)]
async fn test_first_batch_provisions_schema_and_acknowledges() {
    init_test_logging();
    let db = FakeDatabase::new();
    let queue = FakeQueue::with_payloads(payloads("KRW-BTC", TMS_NOV_15, 5));
    let mut pipeline = pipeline(100, &queue, &db);

    let started = Instant::now();
    let outcome = pipeline.run_cycle().await;

    assert_eq!(outcome, CycleOutcome::Acknowledged { written: 5, dropped: 0 });
    // one repair, one cooldown
    assert_eq!(started.elapsed(), TEST_COOLDOWN);
    assert_eq!(db.committed_rows().len(), 5);
    assert!(db.committed_tables().contains("btc_upbit_orderbook"));
    assert!(db.committed_partitions().contains_key("btc_upbit_orderbook_20231115"));

    let queue_state = queue.state();
    assert_eq!(queue_state.checkpoint, 5);
    assert_eq!(queue_state.commits, 1);
    drop(queue_state);

    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.messages_received, 5);
    assert_eq!(stats.schema_repairs, 1);
    assert_eq!(stats.checkpoints, 1);
    assert_eq!(pipeline.cycle_state().unflushed, 0);
}

#[rstest]
#[tokio::test]
async fn test_empty_poll_is_idle(ready_db: FakeDatabase) {
    let queue = FakeQueue::default();
    let mut pipeline = pipeline(10, &queue, &ready_db);

    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Idle);

    assert_eq!(queue.state().commits, 0);
    assert!(ready_db.state().log.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_malformed_messages_dropped_and_batch_acknowledged(ready_db: FakeDatabase) {
    let queue = FakeQueue::with_payloads(vec![
        payload("KRW-BTC", TMS_NOV_15, 0),
        b"not json at all".to_vec(),
        payload("KRW", TMS_NOV_15 + 1, 1),
        payload("KRW-BTC", TMS_NOV_15 + 2, 2),
    ]);
    let mut pipeline = pipeline(10, &queue, &ready_db);

    let outcome = pipeline.run_cycle().await;

    assert_eq!(outcome, CycleOutcome::Acknowledged { written: 2, dropped: 2 });
    assert_eq!(ready_db.committed_rows().len(), 2);
    assert_eq!(queue.state().checkpoint, 4);
    assert_eq!(pipeline.stats().snapshot().malformed_dropped, 2);
}

#[rstest]
#[tokio::test]
async fn test_all_malformed_batch_still_acknowledged(ready_db: FakeDatabase) {
    let queue = FakeQueue::with_payloads(vec![b"{}".to_vec()]);
    let mut pipeline = pipeline(10, &queue, &ready_db);

    assert_eq!(
        pipeline.run_cycle().await,
        CycleOutcome::Acknowledged { written: 0, dropped: 1 }
    );
    assert_eq!(queue.state().checkpoint, 1);
    assert!(ready_db.log_matching("UPSERT").is_empty());
}

#[rstest]
#[tokio::test]
async fn test_checkpoint_follows_durable_flush(ready_db: FakeDatabase) {
    // batch smaller than commit_count still gets committed before the ack
    let queue = FakeQueue::with_payloads(payloads("KRW-BTC", TMS_NOV_15, 2));
    let mut pipeline = pipeline(100, &queue, &ready_db);

    pipeline.run_cycle().await;

    assert_eq!(ready_db.state().commits, 1);
    assert_eq!(ready_db.committed_rows().len(), 2);
    assert_eq!(queue.state().checkpoint, 2);
    assert_eq!(pipeline.writer().unflushed(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_transaction_abort_withholds_checkpoint(ready_db: FakeDatabase) {
    let queue = FakeQueue::with_payloads(payloads("KRW-BTC", TMS_NOV_15, 4));
    let mut pipeline = pipeline(100, &queue, &ready_db);
    let deadlock = StoreFault::Transaction("deadlock detected".into());
    ready_db.script_upserts(vec![None, None, Some(deadlock)]);

    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Abandoned);

    assert!(ready_db.committed_rows().is_empty());
    {
        let queue_state = queue.state();
        assert_eq!(queue_state.checkpoint, 0);
        assert_eq!(queue_state.position, 0);
        assert_eq!(queue_state.rewinds, 1);
        assert_eq!(queue_state.commits, 0);
    }
    assert_eq!(pipeline.cycle_state().unflushed, 0);

    // re-delivered on the next poll
    assert_eq!(
        pipeline.run_cycle().await,
        CycleOutcome::Acknowledged { written: 4, dropped: 0 }
    );
    assert_eq!(ready_db.committed_rows().len(), 4);
    assert_eq!(queue.state().checkpoint, 4);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_mid_batch_commit_then_abort_replays_safely(ready_db: FakeDatabase) {
    let queue = FakeQueue::with_payloads(payloads("KRW-BTC", TMS_NOV_15, 5));
    let mut pipeline = pipeline(2, &queue, &ready_db);
    let timeout = StoreFault::Transaction("statement timeout".into());
    ready_db.script_upserts(vec![None, None, None, Some(timeout)]);

    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Abandoned);
    // the first commit_count writes were durable before the fault
    assert_eq!(ready_db.committed_rows().len(), 2);
    assert_eq!(queue.state().checkpoint, 0);

    assert_eq!(
        pipeline.run_cycle().await,
        CycleOutcome::Acknowledged { written: 5, dropped: 0 }
    );
    assert_eq!(ready_db.committed_rows().len(), 5);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_connection_loss_rebuilds_session(ready_db: FakeDatabase) {
    let queue = FakeQueue::with_payloads(payloads("KRW-BTC", TMS_NOV_15, 3));
    let mut pipeline = pipeline(10, &queue, &ready_db);
    ready_db.kill_connection();

    let started = Instant::now();
    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Abandoned);
    assert_eq!(started.elapsed(), TEST_COOLDOWN);
    assert_eq!(ready_db.state().reconnects, 1);
    assert_eq!(pipeline.stats().snapshot().connection_resets, 1);

    assert_eq!(
        pipeline.run_cycle().await,
        CycleOutcome::Acknowledged { written: 3, dropped: 0 }
    );
    assert_eq!(ready_db.committed_rows().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_batch_spanning_two_days_gets_both_partitions() {
    let db = FakeDatabase::new();
    let mut messages = payloads("KRW-BTC", TMS_NOV_15, 3);
    messages.extend(payloads("KRW-BTC", TMS_NOV_16, 3));
    let queue = FakeQueue::with_payloads(messages);
    let mut pipeline = pipeline(100, &queue, &db);

    let outcome = pipeline.run_cycle().await;

    assert_eq!(outcome, CycleOutcome::Acknowledged { written: 6, dropped: 0 });
    let partitions = db.committed_partitions();
    assert_eq!(
        partitions.keys().cloned().collect::<Vec<_>>(),
        vec!["btc_upbit_orderbook_20231115", "btc_upbit_orderbook_20231116"]
    );

    // every row lies in the partition its event_time derives
    let rows = db.committed_rows();
    assert_eq!(rows.len(), 6);
    for (table, event_time, event_date) in rows.keys() {
        let millis = (*event_time * rust_decimal::Decimal::from(1000)).to_i64().unwrap();
        assert_eq!(venue_date(millis, kst()), Some(*event_date));
        assert!(partitions.values().any(|p| {
            &p.parent == table && p.from <= *event_date && *event_date < p.to
        }));
    }
    assert_eq!(pipeline.stats().snapshot().schema_repairs, 2);
}

#[tokio::test(start_paused = true)]
async fn test_repair_replays_writes_rolled_back_by_it() {
    let db = FakeDatabase::with_schema("BTC", &[date(2023, 11, 15)]);
    let mut messages = payloads("KRW-BTC", TMS_NOV_15, 3);
    messages.push(payload("KRW-BTC", TMS_NOV_16, 9));
    let queue = FakeQueue::with_payloads(messages);
    let mut pipeline = pipeline(100, &queue, &db);

    let outcome = pipeline.run_cycle().await;

    assert_eq!(outcome, CycleOutcome::Acknowledged { written: 4, dropped: 0 });
    assert_eq!(db.committed_rows().len(), 4);
    assert_eq!(
        db.log_matching("CREATE PARTITION"),
        vec!["CREATE PARTITION btc_upbit_orderbook_20231116"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unstorable_snapshot_counted_once_across_replays() {
    let db = FakeDatabase::with_schema("BTC", &[date(2023, 11, 15)]);
    let oversized = format!("KRW-{}", "A".repeat(50));
    let queue = FakeQueue::with_payloads(vec![
        payload(&oversized, TMS_NOV_15, 0),
        payload("KRW-BTC", TMS_NOV_16, 1),
    ]);
    let mut pipeline = pipeline(100, &queue, &db);

    let outcome = pipeline.run_cycle().await;

    assert_eq!(outcome, CycleOutcome::Acknowledged { written: 1, dropped: 1 });
    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.schema_repairs, 1);
    assert_eq!(stats.malformed_dropped, 1);
    assert_eq!(db.committed_rows().len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_repeated_repairs_are_bounded(ready_db: FakeDatabase) {
    let queue = FakeQueue::with_payloads(payloads("KRW-BTC", TMS_NOV_15, 1));
    let mut pipeline = pipeline(100, &queue, &ready_db);
    let missing = || Some(StoreFault::UndefinedRelation("relation does not exist".into()));
    ready_db.script_upserts(vec![missing(), None, missing(), None, missing(), None]);

    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Abandoned);

    assert_eq!(pipeline.stats().snapshot().schema_repairs, 3);
    assert_eq!(pipeline.stats().snapshot().abandoned_batches, 1);
    assert_eq!(queue.state().checkpoint, 0);
    assert_eq!(queue.state().rewinds, 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_queue_commit_failure_rewinds_durable_batch(ready_db: FakeDatabase) {
    let queue = FakeQueue::with_payloads(payloads("KRW-BTC", TMS_NOV_15, 2));
    let mut pipeline = pipeline(10, &queue, &ready_db);
    queue.fail_next_commit(QueueError::Commit("coordinator not available".into()));

    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Abandoned);
    let durable = ready_db.committed_rows();
    assert_eq!(durable.len(), 2);
    assert_eq!(queue.state().position, 0);

    assert_eq!(
        pipeline.run_cycle().await,
        CycleOutcome::Acknowledged { written: 2, dropped: 0 }
    );
    // replay is idempotent
    assert_eq!(ready_db.committed_rows(), durable);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_poll_error_cools_down(ready_db: FakeDatabase) {
    let queue = FakeQueue::default();
    let mut pipeline = pipeline(10, &queue, &ready_db);
    queue.fail_next_poll(QueueError::Poll("broker transport failure".into()));

    let started = Instant::now();
    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Idle);
    assert_eq!(started.elapsed(), TEST_COOLDOWN);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown(ready_db: FakeDatabase) {
    let queue = FakeQueue::with_payloads(payloads("KRW-BTC", TMS_NOV_15, 3));
    queue.set_max_poll(2);
    let mut pipeline = pipeline(10, &queue, &ready_db);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let stopper = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(450)).await;
        let _ = stopper.send(());
    });
    pipeline.run(shutdown_rx).await;

    let queue_state = queue.state();
    assert_eq!(queue_state.checkpoint, 3);
    assert_eq!(queue_state.commits, 2);
    assert!(queue_state.polls >= 3);
    drop(queue_state);
    assert_eq!(ready_db.committed_rows().len(), 3);
}

#[rstest]
#[tokio::test]
async fn test_run_exits_when_sender_dropped(ready_db: FakeDatabase) {
    let queue = FakeQueue::with_payloads(payloads("KRW-BTC", TMS_NOV_15, 1));
    let mut pipeline = pipeline(10, &queue, &ready_db);
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    drop(shutdown_tx);

    pipeline.run(shutdown_rx).await;

    assert_eq!(queue.state().polls, 0);
}
