use rowttl::backup::{BACKUP_MANIFEST_FILE, load_backup_manifest};
use rowttl::catalog::schema::ColumnDef;
use rowttl::catalog::types::{ColumnType, Row, Value};
use rowttl::clock::MICROS_PER_SEC;
use rowttl::replication::verify_convergence;
use rowttl::{ManualClock, TtlConfig, TtlDb, TtlErrorCode};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

const T0: i64 = 1_700_000_000 * MICROS_PER_SEC;

fn backup_test_config() -> TtlConfig {
    TtlConfig {
        reaper_enabled: false,
        ..TtlConfig::development()
    }
    .with_hmac_key(vec![5u8; 32])
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

/// One row expired but unreaped at T0+12s, two rows still live.
fn seeded_primary(clock: &ManualClock) -> TtlDb {
    let db = TtlDb::in_memory_with_clock(backup_test_config(), Arc::new(clock.clone()))
        .expect("open");
    create_sz(&db);
    db.session()
        .insert_many(
            "sz",
            vec![
                sz_row(1, T0, 1),
                sz_row(2, T0 + 8 * MICROS_PER_SEC, 2),
                sz_row(3, T0 + 11 * MICROS_PER_SEC, 3),
            ],
        )
        .expect("seed");
    clock.set(T0 + 12 * MICROS_PER_SEC);
    db
}

#[test]
fn restored_node_shows_the_same_rows_as_time_passes() {
    let clock = ManualClock::new(T0);
    let primary = seeded_primary(&clock);
    let backup_dir = tempdir().expect("backup dir");
    let manifest = primary.backup_full(backup_dir.path()).expect("backup");
    assert_eq!(manifest.seq, primary.head_seq());
    assert_eq!(manifest.table_rows.get("sz"), Some(&3));

    let restore_root = tempdir().expect("restore root");
    let data_dir = restore_root.path().join("node2");
    let restored_clock = ManualClock::new(T0 + 12 * MICROS_PER_SEC);
    let restored = TtlDb::restore_from_backup_with_clock(
        backup_dir.path(),
        &data_dir,
        backup_test_config(),
        Arc::new(restored_clock.clone()),
    )
    .expect("restore");

    assert_eq!(restored.physical_row_count("sz").expect("count"), 3);
    assert_eq!(restored.head_seq(), manifest.seq);
    let now = T0 + 12 * MICROS_PER_SEC;
    assert_eq!(
        restored.visible_rows("sz", now).expect("rows"),
        vec![
            sz_row(2, T0 + 8 * MICROS_PER_SEC, 2),
            sz_row(3, T0 + 11 * MICROS_PER_SEC, 3)
        ]
    );
    verify_convergence(&primary, &restored, now).expect("same view at restore time");

    clock.advance_secs(7);
    restored_clock.advance_secs(7);
    let later = T0 + 19 * MICROS_PER_SEC;
    verify_convergence(&primary, &restored, later).expect("same view later");
    assert_eq!(
        restored.visible_rows("sz", later).expect("rows"),
        vec![sz_row(3, T0 + 11 * MICROS_PER_SEC, 3)]
    );
    assert_eq!(restored.get_ttl_config("sz").expect("cfg").map(|c| c.duration_secs), Some(10));
}

#[test]
fn restored_node_reaps_what_expired_before_the_backup() {
    let clock = ManualClock::new(T0);
    let primary = seeded_primary(&clock);
    let backup_dir = tempdir().expect("backup dir");
    primary.backup_full(backup_dir.path()).expect("backup");

    let restore_root = tempdir().expect("restore root");
    let restored = TtlDb::restore_from_backup_with_clock(
        backup_dir.path(),
        &restore_root.path().join("node2"),
        backup_test_config(),
        Arc::new(clock.clone()),
    )
    .expect("restore");
    let report = restored.reaper().sweep_once(T0 + 12 * MICROS_PER_SEC);
    assert_eq!(report.rows_reaped, 1);
    assert_eq!(restored.physical_row_count("sz").expect("count"), 2);
}

#[test]
fn tampered_or_unsigned_backups_are_rejected() {
    let clock = ManualClock::new(T0);
    let primary = seeded_primary(&clock);
    let backup_dir = tempdir().expect("backup dir");
    let manifest = primary.backup_full(backup_dir.path()).expect("backup");

    let restore_root = tempdir().expect("restore root");
    let wrong_key = backup_test_config().with_hmac_key(vec![6u8; 32]);
    let err = TtlDb::restore_from_backup(
        backup_dir.path(),
        &restore_root.path().join("wrong-key"),
        wrong_key,
    )
    .err()
    .expect("wrong key rejected");
    assert_eq!(err.code(), TtlErrorCode::IntegrityError);

    let manifest_path = backup_dir.path().join(BACKUP_MANIFEST_FILE);
    let original = fs::read_to_string(&manifest_path).expect("read manifest");
    let forged = original.replace(
        &format!("\"seq\": {}", manifest.seq),
        &format!("\"seq\": {}", manifest.seq + 100),
    );
    assert_ne!(forged, original);
    fs::write(&manifest_path, forged).expect("forge manifest");
    let err = load_backup_manifest(backup_dir.path(), Some(&[5u8; 32]))
        .expect_err("forged manifest");
    assert_eq!(err.code(), TtlErrorCode::IntegrityError);
    fs::write(&manifest_path, original).expect("restore manifest");

    let image_path = backup_dir.path().join(&manifest.checkpoint_file);
    let mut image = fs::read(&image_path).expect("read image");
    let mid = image.len() / 2;
    image[mid] ^= 0xFF;
    fs::write(&image_path, image).expect("corrupt image");
    let err = TtlDb::restore_from_backup(
        backup_dir.path(),
        &restore_root.path().join("corrupt"),
        backup_test_config(),
    )
    .err()
    .expect("corrupt image rejected");
    assert_eq!(err.code(), TtlErrorCode::IntegrityError);
}

#[test]
fn restore_refuses_a_non_empty_target() {
    let clock = ManualClock::new(T0);
    let primary = seeded_primary(&clock);
    let backup_dir = tempdir().expect("backup dir");
    primary.backup_full(backup_dir.path()).expect("backup");

    let occupied = tempdir().expect("occupied");
    fs::write(occupied.path().join("leftover"), b"x").expect("write leftover");
    let err = TtlDb::restore_from_backup(backup_dir.path(), occupied.path(), backup_test_config())
        .err()
        .expect("non-empty target");
    assert_eq!(err.code(), TtlErrorCode::Validation);
}
