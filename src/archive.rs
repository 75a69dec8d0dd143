//! The archive format: record framing and the resume scanner.
//!
//! An archive is a gzip-compressed stream opening with a 4-byte magic,
//! followed by one record per repository:
//!
//! ```text
//! "REPO " <owner> "/" <name> 0x00
//! "PACK" 00 00 00 02  <count: u32 BE, 0 = streaming>
//! ( <obj-header> <zlib payload> )*
//! 0x00                 ; type-0 terminator
//! <20 zero bytes>      ; pseudo-trailer
//! ```
//!
//! Records only ever contain commits and trees. The scanner walks an
//! existing archive past every complete record so an interrupted run can
//! be continued from the last good byte.

use anyhow::{Context, Result};
use std::io::prelude::*;
use std::str;

use crate::obj_type::{ObjType, PackEntryType};
use crate::pack_read::{inflate_discard, Counts, PackReader};
use crate::pack_write::write_pack_stream;
use crate::scratch::Scratch;
use crate::varint;

/// First four bytes of the decompressed archive stream.
pub const ARCHIVE_MAGIC: [u8; 4] = [0x30, 0x9e, 0xb9, 0x08];

/// File name suffix of archive files in the data directory.
pub const ARCHIVE_SUFFIX: &str = ".packrat.gz";

/// Parse the pack from `src`, filter it, and append one record to `out`.
pub fn write_repo_record<W: Write, R: Read>(
    out: &mut W,
    src: R,
    owner: &str,
    name: &str,
) -> Result<Counts> {
    write!(out, "REPO {owner}/{name}\0").context("writing record header")?;
    let mut pack = PackReader::new(src).context("opening pack stream")?;
    write_pack_stream(out, &mut pack)?;
    pack.finish()
}

/// Walk an archive positioned just past the magic and report the
/// repositories whose records are complete, together with the byte offset
/// just past the last complete record (relative to the start position).
///
/// Anything that does not parse (a truncated tail after a crash, a gzip
/// stream ending early) simply ends the walk; resuming copies only the
/// bytes up to the returned offset, so invalid data is truncated away.
pub fn scan_archive<R: Read>(src: R) -> (Vec<(String, String)>, u64) {
    let mut scratch = Scratch::new(src);
    let mut repos = Vec::new();
    let mut offset_last = 0;

    while let Ok(Some(repo)) = scan_record(&mut scratch) {
        println!("Found repository {}/{}", repo.0, repo.1);
        repos.push(repo);
        offset_last = scratch.offset();
    }

    (repos, offset_last)
}

/// Walk one record. `Ok(None)` is a clean end of the archive; any error
/// means the record is incomplete or malformed.
fn scan_record<R: Read>(scratch: &mut Scratch<R>) -> Result<Option<(String, String)>> {
    scratch.top_up()?;
    if scratch.buffered().is_empty() {
        return Ok(None);
    }

    // "REPO " <owner> "/" <name> 0x00. The name is bounded well below the
    // guaranteed buffer, so it never straddles a refill.
    let buf = scratch.buffered();
    let head = buf.get(..5).context("truncated record header")?;
    anyhow::ensure!(head == b"REPO ", "bad record header");
    let nul = buf[5..]
        .iter()
        .take(95)
        .position(|&b| b == 0)
        .context("unterminated repository name")?;
    let full = str::from_utf8(&buf[5..5 + nul]).context("repository name is not UTF-8")?;
    let (owner, name) = full
        .split_once('/')
        .context("repository name has no owner")?;
    let repo = (owner.to_string(), name.to_string());
    scratch.consume(5 + nul + 1);

    anyhow::ensure!(scratch.ensure(12)?, "truncated pack header");
    anyhow::ensure!(
        &scratch.buffered()[..8] == b"PACK\x00\x00\x00\x02",
        "bad pack header"
    );
    scratch.consume(12);

    loop {
        scratch.top_up()?;
        let (code, _size, used) = varint::read_obj_header(scratch.buffered())?;
        if code == 0 {
            scratch.consume(1);
            break;
        }
        match PackEntryType::from_code(code)? {
            PackEntryType::Base(ObjType::Commit | ObjType::Tree) => {}
            t => anyhow::bail!("unexpected entry in archive record: {:?}", t),
        }
        scratch.consume(used);
        inflate_discard(scratch)?;
    }

    anyhow::ensure!(scratch.ensure(20)?, "truncated record trailer");
    scratch.consume(20);

    Ok(Some(repo))
}
