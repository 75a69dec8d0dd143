//! Parser for tree payloads.

use anyhow::{Context, Result};

/// An entry in a tree: `<octal mode> <name>\0<20-byte id>` on the wire.
///
/// Mode and name are kept as raw bytes; names need not be UTF-8 and modes
/// are never interpreted here, only carried.
pub struct TreeEntry {
    pub mode: Vec<u8>,
    pub name: Vec<u8>,
    pub id: String,
}

/// A tree, parsed into its entries. `raw` holds the exact payload for
/// re-encoding.
pub struct Tree {
    pub entries: Vec<TreeEntry>,
    pub raw: Vec<u8>,
}

impl Tree {
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let mut entries = Vec::new();
        let mut i = 0;
        while i < raw.len() {
            let sp = raw[i..]
                .iter()
                .position(|&b| b == b' ')
                .context("tree entry has no mode terminator")?
                + i;
            let nul = raw[sp + 1..]
                .iter()
                .position(|&b| b == 0)
                .context("tree entry has no name terminator")?
                + sp
                + 1;
            let id = raw
                .get(nul + 1..nul + 21)
                .context("truncated id in tree entry")?;
            entries.push(TreeEntry {
                mode: raw[i..sp].to_vec(),
                name: raw[sp + 1..nul].to_vec(),
                id: hex::encode(id),
            });
            i = nul + 21;
        }
        Ok(Tree { entries, raw })
    }
}
