//! Streaming parser for packfiles, filtering blobs and tags out.
//!
//! The parser walks the pack object by object through the scratch buffer.
//! Commits and trees are inflated, hashed and yielded; blobs and tags are
//! inflated straight into the void. Deltas are reconstructed only when
//! their base was retained, so any chain rooted in a blob falls away on
//! its own. Three maps keyed by object id and pack offset carry the state
//! a later delta may need.
//!
//! Useful documentation:
//! - gitformat-pack(5) <https://git-scm.com/docs/gitformat-pack>
//! - <https://codewords.recurse.com/issues/three/unpacking-git-packfiles>

use anyhow::{bail, ensure, Context, Result};
use flate2::{Decompress, FlushDecompress, Status};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::prelude::*;
use std::time::Instant;

use crate::commit_read::Commit;
use crate::obj_type::{ObjType, PackEntryType};
use crate::scratch::Scratch;
use crate::tree_read::Tree;
use crate::varint;

/// Per-pack tallies, reported after each repository.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counts {
    pub commits: u64,
    pub trees: u64,
    pub skipped: u64,
    pub total: u32,
}

/// An object retained by the parser: a commit or a tree, with its id and
/// its exact payload (inside the parsed value) for re-encoding.
pub enum PackObject {
    Commit { id: String, commit: Commit },
    Tree { id: String, tree: Tree },
}

impl PackObject {
    pub fn id(&self) -> &str {
        match self {
            PackObject::Commit { id, .. } => id,
            PackObject::Tree { id, .. } => id,
        }
    }

    pub fn obj_type(&self) -> ObjType {
        match self {
            PackObject::Commit { .. } => ObjType::Commit,
            PackObject::Tree { .. } => ObjType::Tree,
        }
    }

    pub fn raw(&self) -> &[u8] {
        match self {
            PackObject::Commit { commit, .. } => &commit.raw,
            PackObject::Tree { tree, .. } => &tree.raw,
        }
    }
}

/// Offset map entry: the id of the object at that offset, or `None` when
/// the object was skipped.
type OffsetEntry = Option<String>;

pub struct PackReader<R> {
    scratch: Scratch<R>,
    payload_by_id: HashMap<String, Vec<u8>>,
    type_by_id: HashMap<String, ObjType>,
    id_by_offset: HashMap<u64, OffsetEntry>,
    num: Counts,
    /// Objects still expected; `None` for the streaming dialect, which is
    /// terminated by a type-0 header instead of a count.
    left: Option<u32>,
    done: bool,
    last_report: Instant,
}

impl<R: Read> PackReader<R> {
    /// Start parsing. The reader must be positioned at the 12-byte pack
    /// header; a zero object count selects the streaming dialect.
    pub fn new(src: R) -> Result<Self> {
        let mut scratch = Scratch::new(src);
        ensure!(scratch.ensure(12)?, "truncated pack header");
        let head = &scratch.buffered()[..12];
        ensure!(
            &head[..8] == b"PACK\x00\x00\x00\x02",
            "invalid pack header: {:?}",
            &head[..8]
        );
        let total = u32::from_be_bytes(head[8..12].try_into().expect("slice size is 4"));
        scratch.consume(12);

        Ok(PackReader {
            scratch,
            payload_by_id: HashMap::new(),
            type_by_id: HashMap::new(),
            id_by_offset: HashMap::new(),
            num: Counts {
                total,
                ..Counts::default()
            },
            left: if total == 0 { None } else { Some(total) },
            done: false,
            last_report: Instant::now(),
        })
    }

    /// Parse until the next retained object and yield it; `None` once the
    /// pack is exhausted. Call [`PackReader::finish`] afterwards to check
    /// the trailer.
    pub fn next_object(&mut self) -> Result<Option<PackObject>> {
        loop {
            if self.done || self.left == Some(0) {
                self.done = true;
                return Ok(None);
            }

            self.scratch.top_up()?;
            self.report_progress();
            if self.scratch.buffered().is_empty() {
                self.done = true;
                return Ok(None);
            }

            let offset = self.scratch.offset();
            let (code, size, used) =
                varint::read_obj_header(self.scratch.buffered()).context("reading object header")?;
            let entry = PackEntryType::from_code(code)?;
            if entry == PackEntryType::End {
                self.scratch.consume(used);
                self.done = true;
                return Ok(None);
            }
            self.scratch.consume(used);
            self.left = self.left.map(|n| n - 1);

            match entry {
                PackEntryType::End => unreachable!(),
                PackEntryType::Base(typ @ (ObjType::Commit | ObjType::Tree)) => {
                    let data = inflate_exact(&mut self.scratch, size as usize)
                        .with_context(|| format!("inflating object at offset {offset}"))?;
                    return Ok(Some(self.retain(typ, data, offset)?));
                }
                PackEntryType::Base(_) => self.skip(offset)?,
                PackEntryType::OfsDelta => {
                    let (rel, used) = varint::read_ofs_varint(self.scratch.buffered())
                        .context("reading delta offset")?;
                    self.scratch.consume(used);
                    let base_offset = offset
                        .checked_sub(rel)
                        .context("delta offset points before the pack start")?;
                    let base = self
                        .id_by_offset
                        .get(&base_offset)
                        .with_context(|| {
                            format!("delta references unknown offset {base_offset}")
                        })?
                        .clone();
                    if let Some(obj) = self.resolve_delta(base, size as usize, offset)? {
                        return Ok(Some(obj));
                    }
                }
                PackEntryType::RefDelta => {
                    ensure!(self.scratch.ensure(20)?, "truncated delta base id");
                    let base = hex::encode(&self.scratch.buffered()[..20]);
                    self.scratch.consume(20);
                    let base = self.payload_by_id.contains_key(&base).then_some(base);
                    if let Some(obj) = self.resolve_delta(base, size as usize, offset)? {
                        return Ok(Some(obj));
                    }
                }
            }
        }
    }

    /// Check and consume the 20-byte trailing checksum, and hand back the
    /// tallies. The checksum bytes themselves are not verified; every
    /// retained object was already verified individually by its id.
    pub fn finish(mut self) -> Result<Counts> {
        ensure!(self.done, "pack parsing is not complete");
        let more = self.scratch.ensure(21)?;
        ensure!(
            !more && self.scratch.buffered().len() == 20,
            "expected exactly the 20-byte pack checksum at the end, found {} bytes",
            self.scratch.buffered().len()
        );
        self.scratch.consume(20);
        Ok(self.num)
    }

    pub fn counts(&self) -> Counts {
        self.num
    }

    /// Reconstruct a delta whose base id is `base` (`None` when the base
    /// was skipped or never retained), or skip it the same way.
    fn resolve_delta(
        &mut self,
        base: Option<String>,
        size: usize,
        offset: u64,
    ) -> Result<Option<PackObject>> {
        let Some(base) = base.filter(|id| self.payload_by_id.contains_key(id)) else {
            self.skip(offset)?;
            return Ok(None);
        };
        let delta = inflate_exact(&mut self.scratch, size)
            .with_context(|| format!("inflating delta at offset {offset}"))?;
        let src = &self.payload_by_id[&base];
        let data = crate::delta::patch_delta(src, &delta)
            .with_context(|| format!("applying delta at offset {offset} to {base}"))?;
        let typ = self.type_by_id[&base];
        Ok(Some(self.retain(typ, data, offset)?))
    }

    /// Inflate-and-discard the payload of an object we do not keep.
    fn skip(&mut self, offset: u64) -> Result<()> {
        inflate_discard(&mut self.scratch)
            .with_context(|| format!("skipping object at offset {offset}"))?;
        self.num.skipped += 1;
        self.id_by_offset.insert(offset, None);
        Ok(())
    }

    /// Hash a retained payload, record it in the per-parse maps, and parse
    /// it into its yielded form.
    ///
    /// The id is the SHA-1 of `"<typename> <len>\0"` followed by the
    /// payload, the same framing loose objects are hashed with.
    fn retain(&mut self, typ: ObjType, data: Vec<u8>, offset: u64) -> Result<PackObject> {
        let mut hasher = Sha1::new();
        hasher.update(format!("{} {}\0", typ.to_str(), data.len()).as_bytes());
        hasher.update(&data);
        let id = format!("{:x}", hasher.finalize());

        self.payload_by_id.insert(id.clone(), data.clone());
        self.type_by_id.insert(id.clone(), typ);
        self.id_by_offset.insert(offset, Some(id.clone()));

        match typ {
            ObjType::Commit => {
                self.num.commits += 1;
                let commit = Commit::parse(data)
                    .with_context(|| format!("parsing commit {id}"))?;
                Ok(PackObject::Commit { id, commit })
            }
            ObjType::Tree => {
                self.num.trees += 1;
                let tree = Tree::parse(data).with_context(|| format!("parsing tree {id}"))?;
                Ok(PackObject::Tree { id, tree })
            }
            _ => bail!("retained object must be a commit or a tree"),
        }
    }

    fn report_progress(&mut self) {
        if self.last_report.elapsed().as_secs() < 1 {
            return;
        }
        self.last_report = Instant::now();
        match self.left {
            Some(left) => println!("Downloading... ({}/{})", self.num.total - left, self.num.total),
            None => println!(
                "Reading... ({})",
                self.num.commits + self.num.trees + self.num.skipped
            ),
        }
    }
}

/// Inflate one zlib stream from the scratch buffer, expecting exactly
/// `expected` decompressed bytes. Surplus compressed bytes stay buffered.
pub fn inflate_exact<R: Read>(scratch: &mut Scratch<R>, expected: usize) -> Result<Vec<u8>> {
    // One spare byte so the inflater can report the stream end instead of
    // stalling on a full output buffer when the object is oversized.
    let mut out = Vec::with_capacity(expected + 1);
    let mut z = Decompress::new(true);
    loop {
        let (in_before, out_before) = (z.total_in(), z.total_out());
        let status = z
            .decompress_vec(scratch.buffered(), &mut out, FlushDecompress::None)
            .context("corrupt zlib stream")?;
        scratch.consume((z.total_in() - in_before) as usize);

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                let stalled = z.total_in() == in_before && z.total_out() == out_before;
                if scratch.buffered().is_empty() {
                    ensure!(scratch.fill()? > 0, "unexpected end of zlib stream");
                } else if stalled {
                    bail!("zlib stream longer than the declared object size");
                }
            }
        }
    }
    ensure!(
        out.len() == expected,
        "object size mismatch: header said {}, payload has {}",
        expected,
        out.len()
    );
    Ok(out)
}

/// Inflate one zlib stream from the scratch buffer and throw the output
/// away. Surplus compressed bytes stay buffered.
pub fn inflate_discard<R: Read>(scratch: &mut Scratch<R>) -> Result<()> {
    let mut sink = [0u8; 8192];
    let mut z = Decompress::new(true);
    loop {
        let in_before = z.total_in();
        let status = z
            .decompress(scratch.buffered(), &mut sink, FlushDecompress::None)
            .context("corrupt zlib stream")?;
        scratch.consume((z.total_in() - in_before) as usize);

        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {
                if scratch.buffered().is_empty() {
                    ensure!(scratch.fill()? > 0, "unexpected end of zlib stream");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use std::io::Cursor;

    fn parse_all(pack: Vec<u8>) -> (Vec<(String, ObjType, Vec<u8>)>, Counts) {
        let mut reader = PackReader::new(Cursor::new(pack)).unwrap();
        let mut out = Vec::new();
        while let Some(obj) = reader.next_object().unwrap() {
            out.push((obj.id().to_string(), obj.obj_type(), obj.raw().to_vec()));
        }
        (out, reader.finish().unwrap())
    }

    #[test]
    fn empty_pack_streaming_dialect() {
        let pack = pack_stream(&[]);
        let (objs, num) = parse_all(pack);
        assert!(objs.is_empty());
        assert_eq!(num.total, 0);
        assert_eq!(num.skipped, 0);
    }

    #[test]
    fn single_commit() {
        let tree_id = "0".repeat(40);
        let payload = commit_payload(&tree_id, &[]);
        let pack = pack_counted(&[entry(ObjType::Commit.code(), &payload)]);

        let mut reader = PackReader::new(Cursor::new(pack)).unwrap();
        let obj = reader.next_object().unwrap().unwrap();
        let PackObject::Commit { id, commit } = &obj else {
            panic!("expected a commit");
        };
        assert_eq!(*id, sha_id(ObjType::Commit, &payload));
        assert_eq!(commit.tree, tree_id);
        assert!(commit.parents.is_empty());
        assert!(reader.next_object().unwrap().is_none());
        let num = reader.finish().unwrap();
        assert_eq!((num.commits, num.trees, num.skipped), (1, 0, 0));
    }

    #[test]
    fn ofs_delta_to_retained_tree() {
        let base = tree_payload(&[("100644", "a", 0x11)]);
        let target = tree_payload(&[("100644", "a", 0x11), ("100644", "b", 0x22)]);
        let delta = delta_payload(&base, &target);

        // base tree at offset 12, delta entry right after it
        let base_entry = entry(ObjType::Tree.code(), &base);
        let delta_entry = ofs_delta_entry(base_entry.len() as u64, &delta);
        let pack = pack_counted(&[base_entry.clone(), delta_entry]);

        let mut reader = PackReader::new(Cursor::new(pack)).unwrap();
        let first = reader.next_object().unwrap().unwrap();
        assert_eq!(first.raw(), &base[..]);
        let second = reader.next_object().unwrap().unwrap();
        assert_eq!(second.obj_type(), ObjType::Tree);
        assert_eq!(second.raw(), &target[..]);
        assert_eq!(second.id(), sha_id(ObjType::Tree, &target));
        assert!(reader.next_object().unwrap().is_none());

        assert_eq!(
            reader.id_by_offset.get(&12).unwrap().as_deref(),
            Some(sha_id(ObjType::Tree, &base).as_str())
        );
        assert_eq!(
            reader
                .id_by_offset
                .get(&(12 + base_entry.len() as u64))
                .unwrap()
                .as_deref(),
            Some(sha_id(ObjType::Tree, &target).as_str())
        );
        let num = reader.finish().unwrap();
        assert_eq!((num.commits, num.trees, num.skipped), (0, 2, 0));
    }

    #[test]
    fn ref_delta_resolves_by_id() {
        let base = tree_payload(&[("100644", "a", 0x11)]);
        let target = tree_payload(&[("40000", "dir", 0x33)]);
        let delta = delta_payload(&base, &target);
        let base_id = sha_id(ObjType::Tree, &base);

        let pack = pack_counted(&[
            entry(ObjType::Tree.code(), &base),
            ref_delta_entry(&base_id, &delta),
        ]);
        let (objs, num) = parse_all(pack);
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[1].0, sha_id(ObjType::Tree, &target));
        assert_eq!(objs[1].2, target);
        assert_eq!(num.skipped, 0);
    }

    #[test]
    fn delta_on_blob_is_skipped() {
        let blob = b"file contents\n".to_vec();
        let delta = delta_payload(&blob, b"file contents, edited\n");
        let blob_entry = entry(ObjType::Blob.code(), &blob);
        let delta_entry = ofs_delta_entry(blob_entry.len() as u64, &delta);
        let pack = pack_counted(&[blob_entry, delta_entry]);

        let (objs, num) = parse_all(pack);
        assert!(objs.is_empty());
        assert_eq!(num.skipped, 2);
    }

    #[test]
    fn ref_delta_on_unknown_base_is_skipped() {
        let delta = delta_payload(b"xyz", b"xyzw");
        let pack = pack_counted(&[ref_delta_entry(&"ab".repeat(20), &delta)]);
        let (objs, num) = parse_all(pack);
        assert!(objs.is_empty());
        assert_eq!(num.skipped, 1);
    }

    #[test]
    fn tag_is_skipped() {
        let tag = b"object 0000000000000000000000000000000000000000\ntype commit\n".to_vec();
        let pack = pack_counted(&[entry(ObjType::Tag.code(), &tag)]);
        let (objs, num) = parse_all(pack);
        assert!(objs.is_empty());
        assert_eq!(num.skipped, 1);
    }

    #[test]
    fn bad_magic_fails() {
        let mut pack = pack_counted(&[]);
        pack[0] = b'K';
        assert!(PackReader::new(Cursor::new(pack)).is_err());
    }

    #[test]
    fn missing_trailer_fails() {
        let mut pack = pack_stream(&[]);
        pack.truncate(pack.len() - 1);
        let mut reader = PackReader::new(Cursor::new(pack)).unwrap();
        assert!(reader.next_object().unwrap().is_none());
        assert!(reader.finish().is_err());
    }

    #[test]
    fn size_mismatch_fails() {
        // Header promises 3 bytes, stream holds 5.
        let mut e = Vec::new();
        crate::varint::write_obj_header(ObjType::Commit.code(), 3, &mut e);
        e.extend_from_slice(&deflate(b"12345"));
        let pack = pack_counted(&[e]);
        let mut reader = PackReader::new(Cursor::new(pack)).unwrap();
        assert!(reader.next_object().is_err());
    }

    #[test]
    fn counts_and_counts_accessor_agree() {
        let payload = commit_payload(&"1".repeat(40), &[]);
        let pack = pack_counted(&[entry(ObjType::Commit.code(), &payload)]);
        let mut reader = PackReader::new(Cursor::new(pack)).unwrap();
        while reader.next_object().unwrap().is_some() {}
        assert_eq!(reader.counts().commits, 1);
        assert_eq!(reader.finish().unwrap().commits, 1);
    }
}
