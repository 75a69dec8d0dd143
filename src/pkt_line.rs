//! pkt-line framing, see gitprotocol-common(5) "pkt-line Format".
//!
//! A frame is four ASCII hex digits giving the total length including the
//! prefix, followed by the payload; the special length `0000` is the
//! flush-pkt, represented as `None` throughout this module.

use std::io;
use std::io::prelude::*;
use std::str;

fn io_err_invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Parse a 4-byte length prefix. Returns the length of the following data
/// (excluding the prefix itself), or `None` for a flush-pkt.
///
/// Note: there are more special packets (for example 0001 is a delimiter),
/// but the v1 negotiation only ever sends flush, so a simple Option does.
pub fn decode_len(buf: &[u8; 4]) -> io::Result<Option<usize>> {
    let Ok(len) = str::from_utf8(buf) else {
        return Err(io_err_invalid("invalid pkt-line length: not UTF-8"));
    };
    let Ok(len) = usize::from_str_radix(len, 16) else {
        return Err(io_err_invalid("invalid pkt-line length: not hex"));
    };

    if len == 0 {
        return Ok(None);
    }
    if len < 4 {
        return Err(io_err_invalid(&format!("invalid pkt-line length: {}", len)));
    }

    Ok(Some(len - 4))
}

/// Read the length of a packet line from a stream.
pub fn read_pkt_line_len(src: &mut impl Read) -> io::Result<Option<usize>> {
    let mut buf = [0; 4];
    src.read_exact(&mut buf)?;
    decode_len(&buf)
}

/// Read one whole packet line. `None` is a flush-pkt.
pub fn read_pkt_line(src: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let Some(len) = read_pkt_line_len(src)? else {
        return Ok(None);
    };
    let mut data = vec![0; len];
    src.read_exact(&mut data)?;
    Ok(Some(data))
}

/// Append one frame (or a flush-pkt for `None`) to a request body.
pub fn write_pkt_line(out: &mut Vec<u8>, frame: Option<&[u8]>) {
    match frame {
        Some(data) => {
            out.extend_from_slice(format!("{:04x}", data.len() + 4).as_bytes());
            out.extend_from_slice(data);
        }
        None => out.extend_from_slice(b"0000"),
    }
}
