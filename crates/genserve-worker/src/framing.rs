//! Length-prefixed framing for worker messages.
//!
//! Each frame is a 4-byte big-endian payload length followed by that many
//! bytes of JSON.

use std::io::{self, Read, Write};

use super::ipc_types::WorkerMessage;

/// Upper bound on a single frame; larger lengths mean a corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub fn write_frame<W: Write>(writer: &mut W, message: &WorkerMessage) -> io::Result<()> {
    let body = serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", body.len()),
        ));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<WorkerMessage>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
