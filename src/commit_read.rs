//! Parser for commit payloads.

use anyhow::{ensure, Context, Result};
use std::str;

/// A commit, parsed just far enough to walk the history graph.
///
/// Only the `tree` line and the `parent` lines are interpreted; author,
/// committer and message stay inside `raw`, which holds the exact payload
/// for re-encoding.
pub struct Commit {
    pub tree: String,
    pub parents: Vec<String>,
    pub raw: Vec<u8>,
}

impl Commit {
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let mut lines = raw.split(|&b| b == b'\n');

        let first = lines.next().context("empty commit payload")?;
        let tree = first
            .strip_prefix(b"tree ")
            .context("commit does not start with a tree line")?;
        let tree = id_from_bytes(tree).context("malformed tree id in commit")?;

        let mut parents = Vec::new();
        for line in lines {
            let Some(parent) = line.strip_prefix(b"parent ") else {
                break;
            };
            parents.push(id_from_bytes(parent).context("malformed parent id in commit")?);
        }

        Ok(Commit { tree, parents, raw })
    }
}

fn id_from_bytes(b: &[u8]) -> Result<String> {
    ensure!(b.len() == 40, "object id has {} bytes, expected 40", b.len());
    let s = str::from_utf8(b).context("object id is not ASCII")?;
    ensure!(
        s.bytes().all(|c| c.is_ascii_hexdigit()),
        "object id is not hex"
    );
    Ok(s.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: &str = "97b49d4c943e3715fe30f141cc6f27a8548cee0e";
    const P1: &str = "29b49d4c943e3715fe30f141cc6f27a8548cee0e";
    const P2: &str = "39b49d4c943e3715fe30f141cc6f27a8548cee0e";

    #[test]
    fn root_commit() {
        let raw = format!("tree {T}\nauthor A <a@b> 0 +0000\n\nmsg\n").into_bytes();
        let c = Commit::parse(raw.clone()).unwrap();
        assert_eq!(c.tree, T);
        assert!(c.parents.is_empty());
        assert_eq!(c.raw, raw);
    }

    #[test]
    fn merge_commit() {
        let raw = format!("tree {T}\nparent {P1}\nparent {P2}\nauthor A <a@b> 0 +0000\n")
            .into_bytes();
        let c = Commit::parse(raw).unwrap();
        assert_eq!(c.parents, vec![P1.to_string(), P2.to_string()]);
    }

    #[test]
    fn missing_tree_line_fails() {
        assert!(Commit::parse(b"author A <a@b> 0 +0000\n".to_vec()).is_err());
        assert!(Commit::parse(Vec::new()).is_err());
    }
}
