//! Builders for synthetic packs, shared by the test modules.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::io::prelude::*;

use crate::obj_type::ObjType;
use crate::varint;

/// zlib-deflate at the default level.
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut z = ZlibEncoder::new(Vec::new(), Compression::default());
    z.write_all(data).unwrap();
    z.finish().unwrap()
}

/// The id an object with this type and payload hashes to.
pub fn sha_id(typ: ObjType, payload: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {}\0", typ.to_str(), payload.len()).as_bytes());
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// One plain pack entry: header + deflated payload.
pub fn entry(code: u8, payload: &[u8]) -> Vec<u8> {
    let mut e = Vec::new();
    varint::write_obj_header(code, payload.len() as u64, &mut e);
    e.extend_from_slice(&deflate(payload));
    e
}

/// An OFS_DELTA entry referencing the object `rel` bytes back.
pub fn ofs_delta_entry(rel: u64, delta: &[u8]) -> Vec<u8> {
    let mut e = Vec::new();
    varint::write_obj_header(6, delta.len() as u64, &mut e);
    varint::write_ofs_varint(rel, &mut e);
    e.extend_from_slice(&deflate(delta));
    e
}

/// A REF_DELTA entry referencing its base by hex id.
pub fn ref_delta_entry(base_id: &str, delta: &[u8]) -> Vec<u8> {
    let mut e = Vec::new();
    varint::write_obj_header(7, delta.len() as u64, &mut e);
    e.extend_from_slice(&hex::decode(base_id).unwrap());
    e.extend_from_slice(&deflate(delta));
    e
}

/// A pack with a real object count and a junk 20-byte trailer (the parser
/// does not verify it).
pub fn pack_counted(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut pack = b"PACK\x00\x00\x00\x02".to_vec();
    pack.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for e in entries {
        pack.extend_from_slice(e);
    }
    pack.extend_from_slice(&[0xddu8; 20]);
    pack
}

/// A pack in the streaming dialect: count 0, type-0 terminator, 21 zero
/// bytes of terminator-plus-pseudo-trailer.
pub fn pack_stream(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut pack = b"PACK\x00\x00\x00\x02\x00\x00\x00\x00".to_vec();
    for e in entries {
        pack.extend_from_slice(e);
    }
    pack.extend_from_slice(&[0u8; 21]);
    pack
}

/// A minimal commit payload.
pub fn commit_payload(tree_id: &str, parents: &[&str]) -> Vec<u8> {
    let mut p = format!("tree {tree_id}\n");
    for parent in parents {
        p.push_str(&format!("parent {parent}\n"));
    }
    p.push_str("author A U Thor <author@example.org> 0 +0000\n");
    p.push_str("committer A U Thor <author@example.org> 0 +0000\n\nmsg\n");
    p.into_bytes()
}

/// A tree payload from `(mode, name, id byte)` triples.
pub fn tree_payload(entries: &[(&str, &str, u8)]) -> Vec<u8> {
    let mut p = Vec::new();
    for (mode, name, id_byte) in entries {
        p.extend_from_slice(mode.as_bytes());
        p.push(b' ');
        p.extend_from_slice(name.as_bytes());
        p.push(0);
        p.extend_from_slice(&[*id_byte; 20]);
    }
    p
}

/// A delta that rewrites `src` into `target` with a single insert (plus a
/// leading copy when a common prefix exists).
pub fn delta_payload(src: &[u8], target: &[u8]) -> Vec<u8> {
    let mut d = Vec::new();
    varint::write_delta_varint(src.len() as u64, &mut d);
    varint::write_delta_varint(target.len() as u64, &mut d);

    let common = src
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count()
        .min(0xffff); // keep the copy length in two bytes
    if common > 0 {
        d.push(0xb0); // copy: two length bytes, offset 0
        d.extend_from_slice(&(common as u16).to_le_bytes());
    }
    for chunk in target[common..].chunks(127) {
        d.push(chunk.len() as u8);
        d.extend_from_slice(chunk);
    }
    d
}
