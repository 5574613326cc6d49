use rowttl::binlog::{binlog_path, read_binlog};
use rowttl::catalog::schema::ColumnDef;
use rowttl::catalog::types::{ColumnType, Row, Value};
use rowttl::checkpoint::CHECKPOINT_FILE_NAME;
use rowttl::clock::MICROS_PER_SEC;
use rowttl::query::plan::{Expr, Select};
use rowttl::{ManualClock, TtlConfig, TtlDb, TtlErrorCode};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const T0: i64 = 1_700_000_000 * MICROS_PER_SEC;

fn durable_config() -> TtlConfig {
    TtlConfig {
        reaper_enabled: false,
        durable_binlog: true,
        lock_wait_timeout_ms: 2_000,
        ..TtlConfig::default()
    }
}

fn open(dir: &Path, clock: &ManualClock) -> TtlDb {
    TtlDb::open_with_clock(durable_config(), dir, Arc::new(clock.clone())).expect("open")
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
        "NDB_TABLE=TTL=10@col_b",
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

#[test]
fn reopen_replays_the_binlog_and_keeps_expiry() {
    let dir = tempdir().expect("temp");
    let clock = ManualClock::new(T0);
    let head = {
        let db = open(dir.path(), &clock);
        create_sz(&db);
        let mut session = db.session();
        session
            .insert_many(
                "sz",
                vec![sz_row(1, T0, 1), sz_row(2, T0 + 30 * MICROS_PER_SEC, 2)],
            )
            .expect("seed");
        session
            .delete_where("sz", Some(&Expr::eq("col_a", Value::Integer(2))), None)
            .expect("delete");
        session
            .insert("sz", sz_row(3, T0 + 30 * MICROS_PER_SEC, 3))
            .expect("insert");
        db.head_seq()
    };
    assert_eq!(read_binlog(&binlog_path(dir.path())).expect("binlog").len(), 4);

    clock.advance_secs(12);
    let db = open(dir.path(), &clock);
    assert_eq!(db.head_seq(), head);
    assert_eq!(db.physical_row_count("sz").expect("count"), 2);
    let visible = db.session().select(&Select::from("sz")).expect("select");
    assert_eq!(visible, vec![sz_row(3, T0 + 30 * MICROS_PER_SEC, 3)]);

    let report = db.reaper().sweep_once(T0 + 12 * MICROS_PER_SEC);
    assert_eq!(report.rows_reaped, 1);
    assert_eq!(db.head_seq(), head + 1);
}

#[test]
fn checkpoint_truncates_the_binlog_and_reopen_combines_both() {
    let dir = tempdir().expect("temp");
    let clock = ManualClock::new(T0);
    {
        let db = open(dir.path(), &clock);
        create_sz(&db);
        db.session().insert("sz", sz_row(1, T0, 1)).expect("insert");
        assert_eq!(db.checkpoint_now().expect("checkpoint"), 2);
        assert!(dir.path().join(CHECKPOINT_FILE_NAME).exists());
        assert!(read_binlog(&binlog_path(dir.path())).expect("binlog").is_empty());

        db.session().insert("sz", sz_row(2, T0, 2)).expect("insert after checkpoint");
        let tail = read_binlog(&binlog_path(dir.path())).expect("binlog");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 3);
    }

    let db = open(dir.path(), &clock);
    assert_eq!(db.head_seq(), 3);
    assert_eq!(
        db.visible_rows("sz", T0).expect("rows"),
        vec![sz_row(1, T0, 1), sz_row(2, T0, 2)]
    );
}

#[test]
fn torn_binlog_tail_is_cut_on_open() {
    let dir = tempdir().expect("temp");
    let clock = ManualClock::new(T0);
    {
        let db = open(dir.path(), &clock);
        create_sz(&db);
        db.session().insert("sz", sz_row(1, T0, 1)).expect("insert");
        db.session().insert("sz", sz_row(2, T0, 2)).expect("insert");
    }
    let path = binlog_path(dir.path());
    let full_len = fs::metadata(&path).expect("meta").len();
    let file = OpenOptions::new().write(true).open(&path).expect("open binlog");
    file.set_len(full_len - 3).expect("tear tail");
    drop(file);

    let db = open(dir.path(), &clock);
    assert_eq!(db.head_seq(), 2);
    assert_eq!(db.visible_rows("sz", T0).expect("rows"), vec![sz_row(1, T0, 1)]);
    let kept = fs::metadata(&path).expect("meta").len();
    assert!(kept < full_len - 3);

    db.session()
        .insert("sz", sz_row(2, T0, 20))
        .expect("append after repair");
    let events = read_binlog(&path).expect("binlog");
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].seq, 3);
}

#[tokio::test]
async fn shutdown_writes_a_final_checkpoint() {
    let dir = tempdir().expect("temp");
    let clock = ManualClock::new(T0);
    {
        let db = open(dir.path(), &clock);
        create_sz(&db);
        db.session().insert("sz", sz_row(1, T0, 1)).expect("insert");
        db.shutdown().await.expect("shutdown");
    }
    assert!(dir.path().join(CHECKPOINT_FILE_NAME).exists());
    assert!(read_binlog(&binlog_path(dir.path())).expect("binlog").is_empty());

    let db = open(dir.path(), &clock);
    assert_eq!(db.head_seq(), 2);
    assert_eq!(db.physical_row_count("sz").expect("count"), 1);
}

#[tokio::test]
async fn open_transaction_cannot_commit_after_shutdown() {
    let dir = tempdir().expect("temp");
    let clock = ManualClock::new(T0);
    let config = TtlConfig {
        durable_binlog: false,
        ..durable_config()
    };
    {
        let db = TtlDb::open_with_clock(config.clone(), dir.path(), Arc::new(clock.clone()))
            .expect("open");
        create_sz(&db);
        db.session().insert("sz", sz_row(1, T0, 1)).expect("insert");

        let mut late = db.session();
        late.begin().expect("begin");
        late.insert("sz", sz_row(2, T0, 2)).expect("buffered insert");
        db.shutdown().await.expect("shutdown");

        let err = late.commit().expect_err("closed");
        assert_eq!(err.code(), TtlErrorCode::Shutdown);
        late.rollback().expect("rollback still allowed");
    }

    let db = TtlDb::open_with_clock(config, dir.path(), Arc::new(clock.clone())).expect("reopen");
    assert_eq!(db.visible_rows("sz", T0).expect("rows"), vec![sz_row(1, T0, 1)]);
}
