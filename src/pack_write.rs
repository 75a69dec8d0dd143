//! Re-encoding of filtered packs.
//!
//! Two dialects share the entry encoding (canonical object header, zlib
//! payload):
//! - the streaming dialect writes an object count of zero, terminates the
//!   entries with a single type-0 header byte and pads a 21-byte zero
//!   pseudo-trailer; it never needs to seek and is what the archive uses;
//! - the file dialect patches the real count into the header afterwards
//!   and appends the SHA-1 of everything before it, producing a packfile
//!   any git implementation accepts.

use anyhow::{Context, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::fs;
use std::io::prelude::*;
use std::io::SeekFrom;

use crate::pack_read::{Counts, PackReader};
use crate::varint;

const PACK_HEADER: &[u8; 12] = b"PACK\x00\x00\x00\x02\x00\x00\x00\x00";

/// Drain the parser into `out`, one re-encoded entry per retained object.
fn write_entries<W: Write, R: Read>(
    out: &mut W,
    pack: &mut PackReader<R>,
    level: Compression,
) -> Result<u32> {
    let mut written = 0;
    while let Some(obj) = pack.next_object().context("parsing pack entry")? {
        let mut head = Vec::with_capacity(16);
        varint::write_obj_header(obj.obj_type().code(), obj.raw().len() as u64, &mut head);
        out.write_all(&head).context("writing object header")?;

        let mut z = ZlibEncoder::new(&mut *out, level);
        z.write_all(obj.raw()).context("compressing object")?;
        z.finish().context("closing zlib stream")?;
        written += 1;
    }
    Ok(written)
}

/// Write a streaming-dialect pack from the parser's retained objects.
///
/// The archive keeps these at compression level 0; the file as a whole is
/// gzipped, so compressing twice buys nothing.
pub fn write_pack_stream<W: Write, R: Read>(out: &mut W, pack: &mut PackReader<R>) -> Result<()> {
    out.write_all(PACK_HEADER).context("writing pack header")?;
    write_entries(out, pack, Compression::none())?;
    out.write_all(&[0u8; 21]).context("writing pack trailer")?;
    Ok(())
}

/// Write a standalone packfile: real object count, real SHA-1 trailer.
pub fn write_pack_file<R: Read>(file: &mut fs::File, src: R) -> Result<Counts> {
    let mut pack = PackReader::new(src)?;
    file.write_all(PACK_HEADER).context("writing pack header")?;
    let written = write_entries(file, &mut pack, Compression::default())?;
    let num = pack.finish()?;

    file.seek(SeekFrom::Start(8)).context("seeking to object count")?;
    file.write_all(&written.to_be_bytes())
        .context("patching object count")?;

    file.seek(SeekFrom::Start(0)).context("rewinding pack file")?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf).context("hashing pack file")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    file.write_all(&digest).context("writing pack checksum")?;

    Ok(num)
}
