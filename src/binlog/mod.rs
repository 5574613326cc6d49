pub mod frame;

use crate::binlog::frame::{FrameError, FrameReader, FrameWriter, PayloadKind};
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Row, RowKey};
use crate::error::TtlError;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const BINLOG_FILE_NAME: &str = "binlog.rttl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrigin {
    User,
    Reaper,
    Replicated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowChange {
    Write { table: String, key: RowKey, row: Row },
    Delete { table: String, key: RowKey },
}

impl RowChange {
    pub fn table(&self) -> &str {
        match self {
            RowChange::Write { table, .. } | RowChange::Delete { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlChange {
    CreateTable(TableSchema),
    DropTable { table: String },
}

/// One committed transaction, in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogEvent {
    pub seq: u64,
    pub commit_ts_micros: i64,
    pub origin: EventOrigin,
    pub changes: Vec<RowChange>,
    #[serde(default)]
    pub ddl: Option<DdlChange>,
}

impl BinlogEvent {
    pub fn encode(&self) -> Result<Vec<u8>, TtlError> {
        rmp_serde::to_vec(self).map_err(|e| TtlError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TtlError> {
        rmp_serde::from_slice(bytes).map_err(|e| TtlError::Decode(e.to_string()))
    }

    pub fn deletes(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, RowChange::Delete { .. }))
            .count()
    }
}

pub fn binlog_path(dir: &Path) -> PathBuf {
    dir.join(BINLOG_FILE_NAME)
}

/// Append-only durable binlog.
pub struct BinlogWriter {
    frames: FrameWriter<BufWriter<File>>,
}

impl BinlogWriter {
    pub fn open(dir: &Path) -> Result<Self, TtlError> {
        let path = binlog_path(dir);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            frames: FrameWriter::new(BufWriter::new(file)),
        })
    }

    /// Appends and fsyncs one event.
    pub fn append(&mut self, event: &BinlogEvent) -> Result<(), TtlError> {
        let payload = event.encode()?;
        self.frames
            .append(
                event.seq,
                event.commit_ts_micros,
                PayloadKind::Event,
                &payload,
            )
            .map_err(frame_error)?;
        let out = self.frames.get_mut();
        out.flush()?;
        out.get_ref().sync_data()?;
        Ok(())
    }

    /// Drops every frame. Called once a checkpoint covers them.
    pub fn truncate(&mut self) -> Result<(), TtlError> {
        let out = self.frames.get_mut();
        out.flush()?;
        let file = out.get_ref();
        file.set_len(0)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Sequential reader over a binlog file.
pub struct BinlogReader {
    frames: FrameReader<BufReader<File>>,
    last_seq: u64,
    valid_len: u64,
    torn_tail: bool,
}

impl BinlogReader {
    pub fn open(path: &Path) -> Result<Self, TtlError> {
        let file = File::open(path)?;
        Ok(Self {
            frames: FrameReader::new(BufReader::new(file)),
            last_seq: 0,
            valid_len: 0,
            torn_tail: false,
        })
    }

    /// Byte length of the intact prefix read so far.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Next event, `None` at end of log. A torn final frame ends the log.
    pub fn next_event(&mut self) -> Result<Option<BinlogEvent>, TtlError> {
        if self.torn_tail {
            return Ok(None);
        }
        let frame = match self.frames.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(FrameError::Truncation) => {
                warn!(last_seq = self.last_seq, "binlog ends in a torn frame; ignoring tail");
                self.torn_tail = true;
                return Ok(None);
            }
            Err(e) => return Err(frame_error(e)),
        };
        if frame.seq <= self.last_seq {
            return Err(TtlError::IntegrityError {
                message: format!(
                    "binlog sequence regression: {} after {}",
                    frame.seq, self.last_seq
                ),
            });
        }
        let event = BinlogEvent::decode(&frame.payload)?;
        if event.seq != frame.seq {
            return Err(TtlError::IntegrityError {
                message: format!(
                    "binlog frame seq {} does not match event seq {}",
                    frame.seq, event.seq
                ),
            });
        }
        self.last_seq = frame.seq;
        self.valid_len += frame.encoded_len() as u64;
        Ok(Some(event))
    }

    pub fn torn_tail(&self) -> bool {
        self.torn_tail
    }
}

impl Iterator for BinlogReader {
    type Item = Result<BinlogEvent, TtlError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

pub fn read_binlog(path: &Path) -> Result<Vec<BinlogEvent>, TtlError> {
    BinlogReader::open(path)?.collect()
}

/// Cuts a torn tail off so later appends follow the last intact frame.
pub fn truncate_binlog(path: &Path, valid_len: u64) -> Result<(), TtlError> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(valid_len)?;
    file.sync_all()?;
    Ok(())
}

fn frame_error(e: FrameError) -> TtlError {
    match e {
        FrameError::Io(msg) => TtlError::Io(std::io::Error::other(msg)),
        other => TtlError::IntegrityError {
            message: format!("binlog {other}"),
        },
    }
}
