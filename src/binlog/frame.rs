//! Length-prefixed, CRC32C-checked frames.
//!
//! Layout (big endian): `len:u32 | seq:u64 | commit_ts:i64 | kind:u8 |
//! payload | crc32c:u32`. `len` counts everything after itself; the CRC
//! covers the length prefix and the body up to the checksum.

use crc32c::crc32c;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAX_FRAME_BODY_BYTES: usize = 64 * 1024 * 1024;
const HEADER_BYTES: usize = 8 + 8 + 1;
const CRC_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    Event = 0x01,
}

impl PayloadKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(PayloadKind::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub commit_ts_micros: i64,
    pub kind: PayloadKind,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Bytes this frame occupies on disk, length prefix included.
    pub fn encoded_len(&self) -> usize {
        4 + HEADER_BYTES + self.payload.len() + CRC_BYTES
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The stream ended inside a frame, e.g. a torn tail write.
    #[error("truncated frame")]
    Truncation,
    #[error("corrupt frame: {0}")]
    Corruption(&'static str),
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn append(
        &mut self,
        seq: u64,
        commit_ts_micros: i64,
        kind: PayloadKind,
        payload: &[u8],
    ) -> Result<(), FrameError> {
        let body_len = HEADER_BYTES + payload.len() + CRC_BYTES;
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(FrameError::Corruption("payload too large"));
        }
        let frame_length =
            u32::try_from(body_len).map_err(|_| FrameError::Corruption("payload too large"))?;

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&frame_length.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&commit_ts_micros.to_be_bytes());
        buf.push(kind as u8);
        buf.extend_from_slice(payload);
        let crc = crc32c(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());

        self.inner.write_all(&buf)?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut len_buf = [0u8; 4];
        let first = self.inner.read(&mut len_buf[0..1])?;
        if first == 0 {
            return Ok(None);
        }
        read_exact_or_truncated(&mut self.inner, &mut len_buf[1..4])?;
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if body_len < HEADER_BYTES + CRC_BYTES {
            return Err(FrameError::Corruption("frame shorter than header"));
        }
        if body_len > MAX_FRAME_BODY_BYTES {
            return Err(FrameError::Corruption("frame length over limit"));
        }

        let mut body = vec![0u8; body_len];
        read_exact_or_truncated(&mut self.inner, &mut body)?;

        let crc_offset = body_len - CRC_BYTES;
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&body[crc_offset..]);
        let mut crc_input = Vec::with_capacity(4 + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if u32::from_be_bytes(stored) != crc32c(&crc_input) {
            return Err(FrameError::Corruption("checksum mismatch"));
        }

        let mut seq = [0u8; 8];
        seq.copy_from_slice(&body[0..8]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&body[8..16]);
        let kind =
            PayloadKind::from_byte(body[16]).ok_or(FrameError::Corruption("unknown payload kind"))?;

        Ok(Some(Frame {
            seq: u64::from_be_bytes(seq),
            commit_ts_micros: i64::from_be_bytes(ts),
            kind,
            payload: body[HEADER_BYTES..crc_offset].to_vec(),
        }))
    }
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Truncation),
        Err(e) => Err(FrameError::Io(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameError, FrameReader, FrameWriter, MAX_FRAME_BODY_BYTES, PayloadKind};
    use std::io::Cursor;

    fn written(n: u64) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::<u8>::new());
        for i in 1..=n {
            writer
                .append(i, -(i as i64), PayloadKind::Event, format!("event-{i}").as_bytes())
                .expect("append");
        }
        writer.into_inner()
    }

    #[test]
    fn reads_back_frames_in_order() {
        let mut reader = FrameReader::new(Cursor::new(written(50)));
        for i in 1..=50u64 {
            let frame = reader.next_frame().expect("next").expect("frame");
            assert_eq!(frame.seq, i);
            assert_eq!(frame.commit_ts_micros, -(i as i64));
            assert_eq!(frame.payload, format!("event-{i}").as_bytes());
        }
        assert!(reader.next_frame().expect("eof").is_none());
    }

    #[test]
    fn flipped_payload_byte_is_corruption() {
        let mut bytes = written(3);
        let second = {
            let first_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
            4 + first_len
        };
        bytes[second + 4 + 17] ^= 0x5a;
        let mut reader = FrameReader::new(Cursor::new(bytes));
        reader.next_frame().expect("first ok").expect("frame");
        assert_eq!(
            reader.next_frame().expect_err("corrupt"),
            FrameError::Corruption("checksum mismatch")
        );
    }

    #[test]
    fn torn_tail_is_truncation() {
        let bytes = written(4);
        for cut in 1..12 {
            let mut reader = FrameReader::new(Cursor::new(&bytes[..bytes.len() - cut]));
            let mut seen = 0;
            let err = loop {
                match reader.next_frame() {
                    Ok(Some(_)) => seen += 1,
                    Ok(None) => panic!("tail cut must not look like clean eof"),
                    Err(e) => break e,
                }
            };
            assert_eq!(seen, 3);
            assert_eq!(err, FrameError::Truncation);
        }
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let len = (MAX_FRAME_BODY_BYTES as u32) + 1;
        let mut reader = FrameReader::new(Cursor::new(len.to_be_bytes().to_vec()));
        assert!(matches!(
            reader.next_frame().expect_err("oversized"),
            FrameError::Corruption(_)
        ));
    }
}
