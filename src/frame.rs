//! Length delimited wire frames.
//!
//! ```text
//! +-----------------+------------------+----------------------+-----------+
//! | frame length u32| protocol id u32  | payload length u32   | payload   |
//! +-----------------+------------------+----------------------+-----------+
//! ```
//!
//! All integers are big endian. The frame length counts every byte after itself.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Protocol id of DHT messages.
pub const PID_DHT: u32 = 0;
/// Protocol id of payloads handed to the raw data consumer.
pub const PID_EXT: u32 = 0xff;

/// Version advertised for [PID_DHT] in handshakes.
pub const DHT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A protocol tagged payload, as written on the wire.
pub struct Package {
    pub pid: u32,
    /// Payload length as declared by the sender.
    pub payload_length: u32,
    pub payload: Bytes,
}

impl Package {
    pub fn new(pid: u32, payload: Bytes) -> Result<Self> {
        let payload_length = frame_length(payload.len())? - HEADER_SIZE as u32;

        Ok(Package {
            pid,
            payload_length,
            payload,
        })
    }

    pub fn is_dht(&self) -> bool {
        self.pid == PID_DHT
    }

    /// Checks the declared payload length is positive and matches the payload.
    pub fn validate(&self) -> Result<()> {
        if self.payload_length == 0 {
            return Err(Error::Protocol("empty payload"));
        }

        if self.payload.len() != self.payload_length as usize {
            return Err(Error::Protocol("payload length mismatched"));
        }

        Ok(())
    }

    /// Encode into a single buffer, frame length prefix included.
    pub fn encode(&self) -> Result<Bytes> {
        let length = frame_length(self.payload.len())?;
        let mut buf = BytesMut::with_capacity(4 + length as usize);

        buf.put_u32(length);
        buf.put_u32(self.pid);
        buf.put_u32(self.payload_length);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }
}

/// Value of the frame length prefix for a payload of `payload_len` bytes.
fn frame_length(payload_len: usize) -> Result<u32> {
    payload_len
        .checked_add(HEADER_SIZE)
        .and_then(|length| u32::try_from(length).ok())
        .ok_or(Error::Parameter("payload too large"))
}

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, package: &Package) -> Result<()> {
    writer.write_all(&package.encode()?)?;
    writer.flush()?;

    Ok(())
}

/// Read exactly one frame, rejecting frames longer than `max_size`.
///
/// The payload length field is returned as declared, see [Package::validate].
pub fn read_frame<R: Read>(reader: &mut R, max_size: usize) -> Result<Package> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;

    let length = u32::from_be_bytes(prefix) as usize;

    if length < HEADER_SIZE {
        return Err(Error::Protocol("frame shorter than its header"));
    }
    if length > max_size {
        return Err(Error::Protocol("frame exceeds max package size"));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    let mut body = Bytes::from(body);
    let header = body.split_to(HEADER_SIZE);

    Ok(Package {
        pid: u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
        payload_length: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        payload: body,
    })
}
