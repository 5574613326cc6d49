use rowttl::binlog::BinlogEvent;
use rowttl::catalog::schema::ColumnDef;
use rowttl::catalog::types::{ColumnType, Row, Value};
use rowttl::clock::MICROS_PER_SEC;
use rowttl::query::plan::{Assignment, Expr, Select};
use rowttl::replication::{ApplyOutcome, channel_sink, spawn_applier, verify_convergence};
use rowttl::{ManualClock, TtlConfig, TtlDb, TtlErrorCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_700_000_000 * MICROS_PER_SEC;

fn node(clock: &ManualClock) -> TtlDb {
    let config = TtlConfig {
        reaper_enabled: false,
        ..TtlConfig::development()
    };
    TtlDb::in_memory_with_clock(config, Arc::new(clock.clone())).expect("open")
}

fn create_sz(db: &TtlDb) {
    db.create_table_with_comment(
        "sz",
        vec![
            ColumnDef::new("col_a", ColumnType::Integer).not_null(),
            ColumnDef::new("col_b", ColumnType::Timestamp),
            ColumnDef::new("col_c", ColumnType::Integer),
        ],
        &["col_a"],
        "NDB_TABLE=TTL=10@col_b,FULLY_REPLICATED=1",
    )
    .expect("create sz");
}

fn sz_row(a: i64, b: i64, c: i64) -> Row {
    Row::from_values(vec![
        Value::Integer(a),
        Value::Timestamp(b),
        Value::Integer(c),
    ])
}

fn by_key(a: i64) -> Expr {
    Expr::eq("col_a", Value::Integer(a))
}

/// Applies everything queued so far; returns the events applied.
fn drain(rx: &mut UnboundedReceiver<BinlogEvent>, replica: &TtlDb) -> Vec<BinlogEvent> {
    let mut applied = Vec::new();
    while let Ok(event) = rx.try_recv() {
        replica.apply_binlog_event(&event).expect("apply");
        applied.push(event);
    }
    applied
}

async fn wait_for_upstream_seq(replica: &TtlDb, seq: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while replica.replication_stats().last_upstream_seq < seq {
        assert!(
            tokio::time::Instant::now() < deadline,
            "replica stuck at {:?}",
            replica.replication_stats()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replica_converges_including_reaper_deletes() {
    let primary_clock = ManualClock::new(T0);
    let replica_clock = ManualClock::new(T0);
    let primary = node(&primary_clock);
    let replica = Arc::new(node(&replica_clock));
    let (sink, rx) = channel_sink();
    primary.add_replication_sink(sink);
    let cancel = CancellationToken::new();
    let applier = spawn_applier(Arc::clone(&replica), rx, cancel.clone());

    create_sz(&primary);
    let mut session = primary.session();
    session
        .insert_many(
            "sz",
            vec![
                sz_row(1, T0, 1),
                sz_row(2, T0, 2),
                sz_row(3, T0, 3),
                sz_row(4, T0 + 20 * MICROS_PER_SEC, 4),
            ],
        )
        .expect("seed");
    session
        .update_where("sz", Some(&by_key(4)), &[Assignment::Add("col_c".into(), 10)])
        .expect("update");
    session.delete_where("sz", Some(&by_key(3)), None).expect("delete");

    wait_for_upstream_seq(&replica, primary.head_seq()).await;
    verify_convergence(&primary, &replica, T0).expect("converged at T0");

    primary_clock.advance_secs(15);
    replica_clock.advance_secs(15);
    let now = T0 + 15 * MICROS_PER_SEC;
    verify_convergence(&primary, &replica, now).expect("both hide expired rows");

    let report = primary.reaper().sweep_once(now);
    assert_eq!(report.rows_reaped, 2);
    wait_for_upstream_seq(&replica, primary.head_seq()).await;
    assert_eq!(replica.physical_row_count("sz").expect("count"), 1);
    assert_eq!(
        replica.visible_rows("sz", now).expect("rows"),
        vec![sz_row(4, T0 + 20 * MICROS_PER_SEC, 14)]
    );
    verify_convergence(&primary, &replica, now).expect("converged after reaping");

    cancel.cancel();
    let applier_report = applier.await.expect("applier join");
    assert!(applier_report.cancelled);
    assert_eq!(applier_report.errors, 0);
    assert_eq!(applier_report.events_applied, primary.head_seq());
}

#[test]
fn deletes_of_rows_the_replica_already_reaped_are_counted() {
    let primary_clock = ManualClock::new(T0);
    let replica_clock = ManualClock::new(T0);
    let primary = node(&primary_clock);
    let replica = node(&replica_clock);
    let (sink, mut rx) = channel_sink();
    primary.add_replication_sink(sink);

    create_sz(&primary);
    primary
        .session()
        .insert_many("sz", vec![sz_row(1, T0, 1), sz_row(2, T0, 2), sz_row(3, T0, 3)])
        .expect("seed");
    drain(&mut rx, &replica);

    let now = T0 + 11 * MICROS_PER_SEC;
    assert_eq!(replica.reaper().sweep_once(now).rows_reaped, 3);
    assert_eq!(primary.reaper().sweep_once(now).rows_reaped, 3);

    let event = rx.try_recv().expect("reaper event");
    let outcome = replica.apply_binlog_event(&event).expect("apply");
    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            local_seq: None,
            missing_deletes: 3
        }
    );
    assert_eq!(replica.replication_stats().missing_deletes, 3);
    verify_convergence(&primary, &replica, now).expect("converged");
}

#[test]
fn redelivered_events_are_skipped() {
    let clock = ManualClock::new(T0);
    let primary = node(&clock);
    let replica = node(&clock);
    let (sink, mut rx) = channel_sink();
    primary.add_replication_sink(sink);

    create_sz(&primary);
    primary.session().insert("sz", sz_row(1, T0, 1)).expect("insert");
    let events = drain(&mut rx, &replica);
    assert_eq!(events.len(), 2);

    for event in &events {
        assert_eq!(
            replica.apply_binlog_event(event).expect("reapply"),
            ApplyOutcome::Skipped
        );
    }
    let stats = replica.replication_stats();
    assert_eq!(stats.events_applied, 2);
    assert_eq!(stats.events_skipped, 2);
    assert_eq!(stats.last_upstream_seq, primary.head_seq());
    assert_eq!(replica.physical_row_count("sz").expect("count"), 1);
}

#[test]
fn applier_ignores_replica_expiry_and_locks() {
    let clock = ManualClock::new(T0);
    let primary = node(&clock);
    let replica = node(&clock);
    let (sink, mut rx) = channel_sink();
    primary.add_replication_sink(sink);

    create_sz(&primary);
    primary
        .session()
        .insert_many("sz", vec![sz_row(1, T0, 1), sz_row(2, T0 - 60 * MICROS_PER_SEC, 2)])
        .expect("seed");
    drain(&mut rx, &replica);
    assert_eq!(replica.physical_row_count("sz").expect("count"), 2);

    let mut local = replica.session();
    local.begin().expect("begin");
    let locked = local
        .select(&Select::from("sz").filter(by_key(1)).for_update())
        .expect("lock on replica");
    assert_eq!(locked.len(), 1);

    primary
        .session()
        .delete_where("sz", Some(&by_key(1)), None)
        .expect("delete on primary");
    drain(&mut rx, &replica);
    local.commit().expect("commit");

    assert!(replica.visible_rows("sz", T0).expect("rows").is_empty());
    assert_eq!(replica.physical_row_count("sz").expect("count"), 1);
}

#[test]
fn primary_clock_ahead_of_replica_is_flagged_but_applied() {
    let primary_clock = ManualClock::new(T0 + 5 * MICROS_PER_SEC);
    let replica_clock = ManualClock::new(T0);
    let primary = node(&primary_clock);
    let replica = node(&replica_clock);
    let (sink, mut rx) = channel_sink();
    primary.add_replication_sink(sink);

    create_sz(&primary);
    drain(&mut rx, &replica);

    let stats = replica.replication_stats();
    assert_eq!(stats.events_applied, 1);
    assert_eq!(stats.skew_warnings, 1);
    assert!(replica.table_names().contains(&"sz".to_string()));
}

#[test]
fn divergent_nodes_are_reported() {
    let clock = ManualClock::new(T0);
    let primary = node(&clock);
    let replica = node(&clock);
    let (sink, mut rx) = channel_sink();
    primary.add_replication_sink(sink);

    create_sz(&primary);
    drain(&mut rx, &replica);
    replica
        .session()
        .insert("sz", sz_row(7, T0, 7))
        .expect("stray local write");

    let err = verify_convergence(&primary, &replica, T0).expect_err("diverged");
    assert_eq!(err.code(), TtlErrorCode::ReplicationDivergence);

    let lonely = node(&clock);
    let err = verify_convergence(&primary, &lonely, T0).expect_err("missing table");
    assert_eq!(err.code(), TtlErrorCode::ReplicationDivergence);
}
