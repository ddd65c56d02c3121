//! Message framing on the worker's stdout.
//!
//! Each message is `[tag: u8][len: u32 BE][payload]`. Frames carry the
//! sequence number followed by the JPEG; readings carry Celsius, humidity
//! (NaN when absent) and a Unix millisecond timestamp.

use crate::capture::{Frame, InitReport, TargetState};
use crate::sensor::Reading;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use thiserror::Error;

const TAG_FRAME: u8 = 1;
const TAG_READING: u8 = 2;
const TAG_SENSOR_UNAVAILABLE: u8 = 3;
const TAG_HARDWARE: u8 = 4;

const HEADER_LEN: usize = 5;
/// Upper bound on a single payload; anything larger is a corrupt stream.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Something the capture worker reports to the server.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Frame(Frame),
    Reading(Reading),
    SensorUnavailable,
    Hardware(InitReport),
}

/// Errors decoding the worker stream.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("payload of {0} bytes exceeds limit")]
    Oversize(usize),
    #[error("malformed {0} message")]
    Malformed(&'static str),
    #[error("stream ended mid-message")]
    Truncated,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Appends one encoded message to `out`.
pub fn encode(event: &WorkerEvent, out: &mut BytesMut) {
    match event {
        WorkerEvent::Frame(frame) => {
            let jpeg = frame.bytes();
            out.reserve(HEADER_LEN + 8 + jpeg.len());
            out.put_u8(TAG_FRAME);
            out.put_u32((8 + jpeg.len()) as u32);
            out.put_u64(frame.sequence());
            out.put_slice(jpeg);
        }
        WorkerEvent::Reading(reading) => {
            out.put_u8(TAG_READING);
            out.put_u32(16);
            out.put_f32(reading.celsius);
            out.put_f32(reading.humidity.unwrap_or(f32::NAN));
            out.put_i64(reading.taken_at.timestamp_millis());
        }
        WorkerEvent::SensorUnavailable => {
            out.put_u8(TAG_SENSOR_UNAVAILABLE);
            out.put_u32(0);
        }
        WorkerEvent::Hardware(report) => {
            out.put_u8(TAG_HARDWARE);
            out.put_u32(2);
            out.put_u8(report.camera.as_code());
            out.put_u8(report.sensor.as_code());
        }
    }
}

/// Whether `event` encodes within [`MAX_PAYLOAD`], so the reader accepts it.
pub fn fits(event: &WorkerEvent) -> bool {
    match event {
        WorkerEvent::Frame(frame) => 8 + frame.bytes().len() <= MAX_PAYLOAD,
        _ => true,
    }
}

/// Writes one message and flushes it.
pub fn write_event(writer: &mut impl Write, event: &WorkerEvent) -> io::Result<()> {
    let mut buf = BytesMut::new();
    encode(event, &mut buf);
    writer.write_all(&buf)?;
    writer.flush()
}

/// Reads one message. Returns `None` when the stream ends cleanly between
/// messages.
pub fn read_event(reader: &mut impl Read) -> Result<Option<WorkerEvent>, WireError> {
    let mut header = [0u8; HEADER_LEN];
    loop {
        match reader.read(&mut header[..1]) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    if let Err(e) = reader.read_exact(&mut header[1..]) {
        return match e.kind() {
            io::ErrorKind::UnexpectedEof => Err(WireError::Truncated),
            _ => Err(e.into()),
        };
    }
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(WireError::Oversize(len));
    }
    let mut payload = Vec::with_capacity(len.min(64 * 1024));
    reader.by_ref().take(len as u64).read_to_end(&mut payload)?;
    if payload.len() < len {
        return Err(WireError::Truncated);
    }
    parse(header[0], Bytes::from(payload)).map(Some)
}

fn parse(tag: u8, mut payload: Bytes) -> Result<WorkerEvent, WireError> {
    match tag {
        TAG_FRAME => {
            if payload.len() < 8 {
                return Err(WireError::Malformed("frame"));
            }
            let sequence = payload.get_u64();
            Ok(WorkerEvent::Frame(Frame::new(payload, sequence)))
        }
        TAG_READING => {
            if payload.len() != 16 {
                return Err(WireError::Malformed("reading"));
            }
            let celsius = payload.get_f32();
            let humidity = payload.get_f32();
            let millis = payload.get_i64();
            let taken_at: DateTime<Utc> = DateTime::from_timestamp_millis(millis)
                .ok_or(WireError::Malformed("reading"))?;
            Ok(WorkerEvent::Reading(Reading {
                celsius,
                humidity: (!humidity.is_nan()).then_some(humidity),
                taken_at,
            }))
        }
        TAG_SENSOR_UNAVAILABLE => Ok(WorkerEvent::SensorUnavailable),
        TAG_HARDWARE => {
            if payload.len() != 2 {
                return Err(WireError::Malformed("hardware"));
            }
            let camera = TargetState::from_code(payload[0]);
            let sensor = TargetState::from_code(payload[1]);
            match (camera, sensor) {
                (Some(camera), Some(sensor)) => Ok(WorkerEvent::Hardware(InitReport { camera, sensor })),
                _ => Err(WireError::Malformed("hardware")),
            }
        }
        other => Err(WireError::UnknownTag(other)),
    }
}
