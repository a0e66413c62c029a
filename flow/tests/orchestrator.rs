mod common;

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use common::{eventually, user, users_schema, Fixture};
use flow::Phase;
use peer_core::{error::classify, CdcError, Column, Event, MetadataStore, Table};
use pt::{CdcStatus, DumperState, SyncMode, TaskStatus, TaskTableMetric};
use value::Type;

async fn wait_for_phase(fx: &Fixture, id: &str, phase: Phase) {
    eventually(&format!("task {} to reach {:?}", id, phase), || {
        fx.runtime.task(id).map(|t| t.phase()) == Some(phase)
    })
    .await;
}

#[tokio::test]
async fn snapshot_then_stream() {
    let fx = Fixture::new().await;
    fx.seed_users(3);
    fx.add_task("t1", |_| {}).await;

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Streaming).await;

    assert!(fx.destination.schema("users").is_some());
    assert_eq!(fx.destination.ids("users"), vec![1, 2, 3]);
    let table = fx.task_table("t1", "users").await;
    assert_eq!(table.dumper_state, DumperState::Completed);
    assert_eq!(table.total_dumped, 3);
    let before = fx.task("t1").await.last_cdc_position;
    assert_eq!(fx.task("t1").await.cdc_status, CdcStatus::Running);

    fx.source.change(Event::insert("app", "users", user(4, "late")));
    eventually("the streamed row", || {
        fx.destination.ids("users") == vec![1, 2, 3, 4]
    })
    .await;
    fx.save_until("t1", "users", |task, table| {
        table.total_inserted == 1 && task.last_cdc_position != before
    })
    .await;
    fx.runtime.shutdown().await;
}

#[tokio::test]
async fn events_apply_in_log_order() {
    let fx = Fixture::new().await;
    fx.seed_users(0);
    fx.destination.create(users_schema());
    fx.add_task("t1", |t| t.dumper_enabled = false).await;

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Streaming).await;

    fx.source.change(Event::insert("app", "users", user(1, "a")));
    fx.source
        .change(Event::update("app", "users", user(1, "a"), user(1, "b")));
    fx.source.change(Event::delete("app", "users", user(1, "b")));
    fx.source.change(Event::insert("app", "users", user(2, "c")));
    eventually("the last event", || {
        fx.destination.ids("users") == vec![2]
    })
    .await;
    fx.save_until("t1", "users", |task, table| {
        task.last_cdc_position == "4"
            && (table.total_inserted, table.total_updated, table.total_deleted) == (2, 1, 1)
    })
    .await;
    fx.runtime.shutdown().await;
}

#[tokio::test]
async fn resumed_dump_skips_rows_already_written() {
    let fx = Fixture::new().await;
    fx.seed_users(10);
    fx.destination.create(users_schema());
    fx.add_task("t1", |t| t.cdc_enabled = false).await;

    fx.store
        .create_task_table("t1", "users", DumperState::Running)
        .await
        .unwrap();
    let interrupted = TaskTableMetric {
        mode: SyncMode::Dumper,
        inserted: 4,
        last_synced_keys: Some(serde_json::from_str(r#"{"id":4}"#).unwrap()),
        ..Default::default()
    };
    fx.store
        .flush_metric("t1", "users", &interrupted)
        .await
        .unwrap();

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Stopped).await;

    assert_eq!(fx.destination.ids("users"), vec![5, 6, 7, 8, 9, 10]);
    let table = fx.task_table("t1", "users").await;
    assert_eq!(table.dumper_state, DumperState::Completed);
    assert_eq!(table.total_dumped, 10);
    assert_eq!(table.last_dumper_key.as_deref(), Some(r#"{"id":10}"#));
}

#[tokio::test]
async fn finished_tables_are_not_dumped_again() {
    let fx = Fixture::new().await;
    fx.seed_users(3);
    fx.destination.create(users_schema());
    fx.add_task("t1", |t| t.cdc_enabled = false).await;
    fx.store
        .create_task_table("t1", "users", DumperState::Failed)
        .await
        .unwrap();

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Stopped).await;

    assert!(fx.destination.ids("users").is_empty());
    assert_eq!(
        fx.task_table("t1", "users").await.dumper_state,
        DumperState::Failed
    );
}

#[tokio::test]
async fn resync_dumps_the_table_from_scratch() {
    let fx = Fixture::new().await;
    fx.seed_users(3);
    fx.destination.create(users_schema());
    fx.add_task("t1", |t| {
        t.cdc_enabled = false;
        t.status = TaskStatus::Inactive;
    })
    .await;
    fx.store
        .create_task_table("t1", "users", DumperState::Completed)
        .await
        .unwrap();
    let done = TaskTableMetric {
        mode: SyncMode::Dumper,
        inserted: 10,
        last_synced_keys: Some(serde_json::from_str(r#"{"id":3}"#).unwrap()),
        ..Default::default()
    };
    fx.store.flush_metric("t1", "users", &done).await.unwrap();

    fx.runtime.resync_table("t1", "users").await.unwrap();
    let table = fx.task_table("t1", "users").await;
    assert_eq!(table.dumper_state, DumperState::Initialed);
    assert_eq!(table.total_dumped, 0);
    assert_eq!(table.last_dumper_key, None);
    assert!(fx.runtime.task("t1").is_none());

    fx.runtime.activate_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Stopped).await;
    assert_eq!(fx.destination.ids("users"), vec![1, 2, 3]);
    let table = fx.task_table("t1", "users").await;
    assert_eq!(table.dumper_state, DumperState::Completed);
    assert_eq!(table.total_dumped, 3);
}

#[tokio::test]
async fn dangling_connectors_are_not_found() {
    let fx = Fixture::new().await;
    fx.add_task("t1", |t| t.writer = "missing".to_string()).await;

    let err = fx.runtime.start_task("t1").await.unwrap_err();
    assert!(matches!(classify(&err), Some(CdcError::NotFound { .. })));
    assert!(fx.runtime.task("t1").is_none());
}

#[tokio::test]
async fn migration_requires_a_primary_key() {
    let fx = Fixture::new().await;
    fx.source.create(Table::new(
        "users",
        vec![Column::new("id", Type::Int), Column::new("name", Type::String)],
    ));
    fx.add_task("t1", |_| {}).await;

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Failed).await;
    assert!(fx.destination.schema("users").is_none());
}

#[tokio::test]
async fn existing_destination_tables_are_kept() {
    let fx = Fixture::new().await;
    fx.seed_users(2);
    let narrow = Table::new("users", vec![Column::new("id", Type::Int).primary_key()]);
    fx.destination.create(narrow.clone());
    fx.add_task("t1", |t| t.cdc_enabled = false).await;

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Stopped).await;

    assert_eq!(fx.destination.schema("users").as_deref(), Some(&narrow));
    let rows = fx.destination.rows("users");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.fields.len() == 1));
}

#[tokio::test]
async fn stopping_halts_streaming_and_shutdown_keeps_it() {
    let fx = Fixture::new().await;
    fx.seed_users(0);
    fx.destination.create(users_schema());
    fx.add_task("halted", |t| t.dumper_enabled = false).await;
    fx.add_task("suspended", |t| t.dumper_enabled = false).await;

    fx.runtime.start_task("halted").await.unwrap();
    fx.runtime.start_task("suspended").await.unwrap();
    wait_for_phase(&fx, "halted", Phase::Streaming).await;
    wait_for_phase(&fx, "suspended", Phase::Streaming).await;

    fx.runtime.stop_task("halted").await.unwrap();
    // a second stop is harmless
    fx.runtime.stop_task("halted").await.unwrap();
    assert_eq!(fx.task("halted").await.cdc_status, CdcStatus::Stopped);

    fx.runtime.shutdown().await;
    assert_eq!(fx.task("suspended").await.cdc_status, CdcStatus::Running);
    assert!(fx.runtime.task_ids().is_empty());
}

#[tokio::test]
async fn stopped_cdc_is_resumed_on_request() {
    let fx = Fixture::new().await;
    fx.seed_users(0);
    fx.destination.create(users_schema());
    fx.add_task("t1", |t| {
        t.dumper_enabled = false;
        t.cdc_status = CdcStatus::Stopped;
    })
    .await;

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Stopped).await;

    fx.runtime.resume_cdc("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Streaming).await;
    assert_eq!(fx.task("t1").await.cdc_status, CdcStatus::Running);
    fx.runtime.shutdown().await;
}

#[tokio::test]
async fn incomplete_updates_fail_the_stream() {
    let fx = Fixture::new().await;
    fx.seed_users(0);
    fx.destination.create(users_schema());
    fx.add_task("t1", |t| t.dumper_enabled = false).await;

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Streaming).await;

    let mut update = Event::update("app", "users", user(1, "a"), user(1, "b"));
    update.old_record = None;
    fx.source.append(update);
    wait_for_phase(&fx, "t1", Phase::Failed).await;
    assert_eq!(fx.task("t1").await.cdc_status, CdcStatus::Failed);
}

#[tokio::test]
async fn positions_rotate_only_while_inactive() {
    let fx = Fixture::new().await;
    fx.add_task("t1", |_| {}).await;

    let err = fx.runtime.rotate_position("t1", "42").await.unwrap_err();
    assert!(matches!(classify(&err), Some(CdcError::Configuration { .. })));

    fx.runtime.deactivate_task("t1").await.unwrap();
    fx.runtime.rotate_position("t1", "42").await.unwrap();
    let task = fx.task("t1").await;
    assert_eq!(task.status, TaskStatus::Inactive);
    assert_eq!(task.last_cdc_position, "42");
}

#[tokio::test]
async fn release_needs_an_inactive_task() {
    let fx = Fixture::new().await;
    fx.add_task("t1", |_| {}).await;

    assert!(fx.runtime.release_task("t1").await.is_err());
    fx.runtime.deactivate_task("t1").await.unwrap();
    fx.runtime.release_task("t1").await.unwrap();
    assert!(fx.source.released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn added_tables_can_skip_the_snapshot() {
    let fx = Fixture::new().await;
    fx.add_task("t1", |_| {}).await;
    fx.store
        .create_task_table("t1", "users", DumperState::Running)
        .await
        .unwrap();

    fx.runtime
        .mark_tables_completed("t1", &["users".to_string(), "orders".to_string()])
        .await
        .unwrap();
    assert_eq!(
        fx.task_table("t1", "users").await.dumper_state,
        DumperState::Running
    );
    assert_eq!(
        fx.task_table("t1", "orders").await.dumper_state,
        DumperState::Completed
    );
}

#[tokio::test]
async fn prepare_starts_active_tasks_only() {
    let fx = Fixture::new().await;
    fx.seed_users(1);
    fx.add_task("on", |t| t.cdc_enabled = false).await;
    fx.add_task("off", |t| t.status = TaskStatus::Inactive).await;

    fx.runtime.prepare().await.unwrap();
    assert_eq!(fx.runtime.task_ids(), vec!["on".to_string()]);
    wait_for_phase(&fx, "on", Phase::Stopped).await;
    assert_eq!(fx.destination.ids("users"), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_sources_fail_once_retries_run_out() {
    let fx = Fixture::new().await;
    fx.seed_users(0);
    fx.destination.create(users_schema());
    fx.source.unreachable.store(true, Ordering::SeqCst);
    fx.add_task("t1", |t| t.dumper_enabled = false).await;

    fx.runtime.start_task("t1").await.unwrap();
    tokio::time::timeout(Duration::from_secs(600), async {
        while fx.runtime.task("t1").map(|t| t.phase()) != Some(Phase::Failed) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("the retry budget runs out");

    assert_eq!(fx.source.reader_starts.load(Ordering::SeqCst), 11);
    assert_eq!(fx.task("t1").await.cdc_status, CdcStatus::Failed);
}

#[tokio::test]
async fn a_failing_table_does_not_stop_its_siblings() {
    let fx = Fixture::new().await;
    fx.seed_users(3);
    fx.seed("orders", 2);
    fx.source.fail_fetches("orders");
    fx.add_task("t1", |t| {
        t.tables = "users,orders".to_string();
        t.cdc_enabled = false;
    })
    .await;

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Failed).await;

    let users = fx.task_table("t1", "users").await;
    assert_eq!(users.dumper_state, DumperState::Completed);
    assert_eq!(users.total_dumped, 3);
    assert_eq!(fx.destination.ids("users"), vec![1, 2, 3]);
    assert_eq!(
        fx.task_table("t1", "orders").await.dumper_state,
        DumperState::Failed
    );
    assert!(fx.destination.ids("orders").is_empty());
}

#[tokio::test]
async fn restarting_replaces_the_live_instance() {
    let fx = Fixture::new().await;
    fx.seed_users(0);
    fx.destination.create(users_schema());
    fx.add_task("t1", |t| t.dumper_enabled = false).await;

    fx.runtime.start_task("t1").await.unwrap();
    wait_for_phase(&fx, "t1", Phase::Streaming).await;
    let old = fx.runtime.task("t1").unwrap();

    fx.runtime.start_task("t1").await.unwrap();
    assert!(!old.phase().is_active());
    let new = fx.runtime.task("t1").unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(fx.runtime.task_ids(), vec!["t1".to_string()]);
    wait_for_phase(&fx, "t1", Phase::Streaming).await;

    fx.source.change(Event::insert("app", "users", user(1, "a")));
    eventually("the row streamed by the new instance", || {
        fx.destination.ids("users") == vec![1]
    })
    .await;
    assert_eq!(fx.source.reader_starts.load(Ordering::SeqCst), 2);
    assert_eq!(fx.source.max_active_readers.load(Ordering::SeqCst), 1);
    fx.runtime.shutdown().await;
}
