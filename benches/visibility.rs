use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use rowttl::catalog::schema::{ColumnDef, TableOptions, TableSchema};
use rowttl::catalog::types::{ColumnType, Row, Value};
use rowttl::clock::MICROS_PER_SEC;
use rowttl::query::plan::{Expr, Select};
use rowttl::{Clock, ManualClock, TtlConfig, TtlDb};
use std::sync::Arc;

const TABLE_NAME: &str = "sessions";
const SEEDED_ROWS: i64 = 10_000;
const TTL_SECS: u64 = 60;
const START_MICROS: i64 = 1_700_000_000 * MICROS_PER_SEC;

fn sessions_schema() -> TableSchema {
    TableSchema {
        table_name: TABLE_NAME.into(),
        columns: vec![
            ColumnDef::new("id", ColumnType::Integer).not_null(),
            ColumnDef::new("owner", ColumnType::Text),
            ColumnDef::new("touched_at", ColumnType::Timestamp),
        ],
        primary_key: vec!["id".into()],
        options: TableOptions::with_ttl("touched_at", TTL_SECS),
    }
}

/// Seeds rows whose stamps are spread over two TTL windows, so roughly half
/// are expired once the clock has moved two windows past the start.
fn setup_db(seed_rows: i64) -> (ManualClock, TtlDb) {
    let clock = ManualClock::new(START_MICROS);
    let config = TtlConfig {
        reaper_enabled: false,
        ..TtlConfig::development()
    };
    let db = TtlDb::in_memory_with_clock(config, Arc::new(clock.clone())).expect("open");
    db.create_table(sessions_schema()).expect("table");
    let window = TTL_SECS as i64 * MICROS_PER_SEC;
    let rows: Vec<Row> = (1..=seed_rows)
        .map(|id| {
            let stamp = START_MICROS + (id * 2 * window / seed_rows);
            Row::from_values(vec![
                Value::Integer(id),
                Value::text(&format!("owner-{}", id % 64)),
                Value::Timestamp(stamp),
            ])
        })
        .collect();
    let mut session = db.session();
    session.insert_many(TABLE_NAME, rows).expect("seed rows");
    clock.advance_secs(2 * TTL_SECS as i64);
    (clock, db)
}

fn bench_visibility(c: &mut Criterion) {
    let (clock, db) = setup_db(SEEDED_ROWS);
    let now = clock.now_micros();

    c.bench_function("visible_entries_half_expired", |b| {
        b.iter(|| {
            let rows = db
                .visible_entries(black_box(TABLE_NAME), black_box(now))
                .expect("scan");
            black_box(rows.len())
        })
    });

    let mut session = db.session();
    let full_scan = Select::from(TABLE_NAME);
    c.bench_function("select_full_scan_half_expired", |b| {
        b.iter(|| {
            let rows = session.select(black_box(&full_scan)).expect("select");
            black_box(rows.len())
        })
    });

    let point = Select::from(TABLE_NAME).filter(Expr::eq("id", Value::Integer(SEEDED_ROWS)));
    c.bench_function("select_point_live_row", |b| {
        b.iter(|| {
            let rows = session.select(black_box(&point)).expect("select");
            black_box(rows.len())
        })
    });
}

fn bench_reaper(c: &mut Criterion) {
    c.bench_function("reaper_sweep_10k_rows_half_expired", |b| {
        b.iter_batched(
            || setup_db(SEEDED_ROWS),
            |(clock, db)| {
                let report = db.reaper().sweep_once(clock.now_micros());
                black_box(report.rows_reaped)
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_visibility, bench_reaper);
criterion_main!(benches);
