//! The on-disk index of archive files and the repositories they hold.
//!
//! A small JSON document with two maps: file name to `[size, offset]`
//! (the on-disk size when last written, and the count of valid
//! decompressed bytes), and `"owner/name"` to file name. A file whose
//! recorded size no longer matches the filesystem is dropped on load,
//! along with every repository pointing at it; acquisition then falls
//! back to scanning the file itself.

use anyhow::{ensure, Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::archive::{scan_archive, ARCHIVE_MAGIC, ARCHIVE_SUFFIX};

#[derive(Default, Serialize, Deserialize)]
pub struct Index {
    /// file name -> (size on disk, valid decompressed offset)
    files: BTreeMap<String, (u64, u64)>,
    /// "owner/name" -> file name
    repos: BTreeMap<String, String>,
    #[serde(skip)]
    path: PathBuf,
}

pub fn repo_key(owner: &str, name: &str) -> String {
    format!("{owner}/{name}")
}

impl Index {
    /// Load the index from the data directory, dropping stale entries.
    /// With `rebuild`, additionally scan every unindexed archive file and
    /// save the result (the `genindex` subcommand).
    pub fn load(data_dir: &Path, index_name: &str, rebuild: bool) -> Result<Self> {
        ensure!(
            data_dir.is_dir(),
            "{} does not exist or is not a directory",
            data_dir.display()
        );
        let path = data_dir.join(index_name);
        ensure!(
            !path.is_dir(),
            "{} is a directory, was supposed to be an index file",
            path.display()
        );

        let mut idx: Index = if path.is_file() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("reading index {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("parsing index {}", path.display()))?
        } else {
            Index::default()
        };
        idx.path = path;

        let archives = list_archives(data_dir)?;
        if rebuild {
            println!("Found {} files to index", archives.len());
        }

        // Size-based invalidation of stale entries.
        let mut up_to_date = HashSet::new();
        for dname in idx.files.keys().cloned().collect::<Vec<_>>() {
            let fname = data_dir.join(&dname);
            let good = fs::metadata(&fname)
                .map(|m| m.len() == idx.files[&dname].0)
                .unwrap_or(false);
            if good {
                if rebuild {
                    println!("File {dname} is already indexed, no changes detected");
                }
                up_to_date.insert(dname);
            } else {
                idx.files.remove(&dname);
            }
        }
        idx.repos.retain(|_, v| up_to_date.contains(v));

        if rebuild {
            for dname in archives {
                if up_to_date.contains(&dname) {
                    continue;
                }
                let fname = data_dir.join(&dname);
                println!("Currently indexing {}...", fname.display());
                let mut gz = GzDecoder::new(
                    fs::File::open(&fname)
                        .with_context(|| format!("opening {}", fname.display()))?,
                );
                let mut magic = [0u8; 4];
                let is_archive =
                    gz.read_exact(&mut magic).is_ok() && magic == ARCHIVE_MAGIC;
                if !is_archive {
                    eprintln!("File {dname} is not an archive, skipping");
                    continue;
                }
                let (repos, offset) = scan_archive(gz);
                let size = fs::metadata(&fname)
                    .with_context(|| format!("stat {}", fname.display()))?
                    .len();
                idx.set_file(&dname, size, offset + ARCHIVE_MAGIC.len() as u64, &repos);
            }
            idx.save()?;
        }

        Ok(idx)
    }

    /// Record a file's size and valid offset, and point its repositories
    /// at it. A repository already mapped to a different file keeps its
    /// old mapping, with a warning.
    pub fn set_file(&mut self, dname: &str, size: u64, offset: u64, repos: &[(String, String)]) {
        self.files.insert(dname.to_string(), (size, offset));
        for (owner, name) in repos {
            let key = repo_key(owner, name);
            match self.repos.get(&key) {
                Some(existing) if existing != dname => {
                    println!(
                        "Warning: Repository {key} is contained in both {dname} and {existing}"
                    );
                }
                _ => {
                    self.repos.insert(key, dname.to_string());
                }
            }
        }
    }

    pub fn contains_repo(&self, owner: &str, name: &str) -> Option<&str> {
        self.repos.get(&repo_key(owner, name)).map(String::as_str)
    }

    /// The recorded (size, valid offset) of a file, if indexed.
    pub fn file_entry(&self, dname: &str) -> Option<(u64, u64)> {
        self.files.get(dname).copied()
    }

    /// All repositories recorded as living in the given file.
    pub fn repos_in_file(&self, dname: &str) -> Vec<(String, String)> {
        self.repos
            .iter()
            .filter(|(_, v)| v.as_str() == dname)
            .filter_map(|(k, _)| {
                k.split_once('/')
                    .map(|(o, n)| (o.to_string(), n.to_string()))
            })
            .collect()
    }

    pub fn save(&self) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("serializing index")?;
        fs::write(&self.path, data)
            .with_context(|| format!("writing index {}", self.path.display()))
    }
}

fn list_archives(data_dir: &Path) -> Result<Vec<String>> {
    let mut archives = Vec::new();
    for entry in fs::read_dir(data_dir)
        .with_context(|| format!("listing {}", data_dir.display()))?
    {
        let entry = entry.context("listing data directory")?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.ends_with(ARCHIVE_SUFFIX) && entry.path().is_file() {
            archives.push(name);
        }
    }
    archives.sort();
    Ok(archives)
}
