use rowttl::backup::{load_backup_manifest, resolve_checkpoint, verify_backup_files};
use rowttl::binlog::{BinlogReader, DdlChange};
use rowttl::checkpoint::load_checkpoint;
use rowttl::clock::wall_clock_micros;
use rowttl::expiry::row_is_expired;
use std::path::Path;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "backup" => match args.get(2).map(String::as_str) {
            Some("verify") => cmd_backup_verify(&args[3..]),
            Some("inspect") => cmd_backup_inspect(&args[3..]),
            Some(other) => Err(format!("unknown backup command: {other}")),
            None => Err("missing backup subcommand".into()),
        },
        "binlog" => match args.get(2).map(String::as_str) {
            Some("dump") => cmd_binlog_dump(&args[3..]),
            Some(other) => Err(format!("unknown binlog command: {other}")),
            None => Err("missing binlog subcommand".into()),
        },
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_backup_verify(args: &[String]) -> Result<(), String> {
    let backup_dir = parse_flag_value(args, "--dir").ok_or("--dir is required")?;
    let hmac_key = parse_hmac_key_hex(args)?;
    let dir = Path::new(&backup_dir);
    let manifest = load_backup_manifest(dir, hmac_key.as_deref())
        .map_err(|e| format!("load manifest: {e}"))?;
    verify_backup_files(dir, &manifest).map_err(|e| format!("verify files: {e}"))?;
    println!(
        "ok\t{}\t{}\t{}",
        backup_dir, manifest.backup_id, manifest.seq
    );
    Ok(())
}

/// Rows per table in a backup, and how many of them are expired right now.
fn cmd_backup_inspect(args: &[String]) -> Result<(), String> {
    let backup_dir = parse_flag_value(args, "--dir").ok_or("--dir is required")?;
    let hmac_key = parse_hmac_key_hex(args)?;
    let dir = Path::new(&backup_dir);
    let manifest = load_backup_manifest(dir, hmac_key.as_deref())
        .map_err(|e| format!("load manifest: {e}"))?;
    let path = resolve_checkpoint(dir, &manifest).map_err(|e| format!("checkpoint: {e}"))?;
    let image = load_checkpoint(&path).map_err(|e| format!("load checkpoint: {e}"))?;
    let now = wall_clock_micros();
    println!("backup\t{}\tseq={}", manifest.backup_id, image.seq);
    for table in image.catalog.table_names() {
        let ttl = image
            .catalog
            .get_ttl_config(&table)
            .map_err(|e| format!("ttl config: {e}"))?;
        let rows: Vec<_> = image
            .keyspace
            .table(&table)
            .map(|data| data.rows.values().collect())
            .unwrap_or_default();
        let expired = match &ttl {
            Some(cfg) => rows
                .iter()
                .filter(|stored| row_is_expired(cfg, &stored.row, now))
                .count(),
            None => 0,
        };
        let ttl_desc = ttl
            .map(|cfg| format!("{}s@{}", cfg.duration_secs, cfg.column))
            .unwrap_or_else(|| "-".into());
        println!(
            "{table}\trows={}\texpired={expired}\tttl={ttl_desc}",
            rows.len()
        );
    }
    Ok(())
}

fn cmd_binlog_dump(args: &[String]) -> Result<(), String> {
    let file = parse_flag_value(args, "--file").ok_or("--file is required")?;
    let mut reader =
        BinlogReader::open(Path::new(&file)).map_err(|e| format!("open binlog: {e}"))?;
    let mut count = 0usize;
    while let Some(event) = reader.next_event().map_err(|e| format!("read binlog: {e}"))? {
        let ddl = match &event.ddl {
            Some(DdlChange::CreateTable(schema)) => format!("create:{}", schema.table_name),
            Some(DdlChange::DropTable { table }) => format!("drop:{table}"),
            None => "-".into(),
        };
        let deletes = event.deletes();
        println!(
            "{}\t{}\t{:?}\twrites={}\tdeletes={}\tddl={}",
            event.seq,
            event.commit_ts_micros,
            event.origin,
            event.changes.len() - deletes,
            deletes,
            ddl
        );
        count += 1;
    }
    if reader.torn_tail() {
        println!("torn tail after {} intact bytes", reader.valid_len());
    }
    println!("events\t{count}");
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn parse_hmac_key_hex(args: &[String]) -> Result<Option<Vec<u8>>, String> {
    let Some(hex_key) = parse_flag_value(args, "--hmac-key-hex") else {
        return Ok(None);
    };
    hex::decode(hex_key)
        .map(Some)
        .map_err(|e| format!("invalid --hmac-key-hex: {e}"))
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  rowttl backup verify --dir <backup-dir> [--hmac-key-hex <hex>]");
    eprintln!("  rowttl backup inspect --dir <backup-dir> [--hmac-key-hex <hex>]");
    eprintln!("  rowttl binlog dump --file <binlog.rttl>");
}
