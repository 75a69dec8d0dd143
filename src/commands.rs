//! Functions implementing each subcommand from the CLI.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::ffi::OsStr;
use std::fs;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::archive::{scan_archive, write_repo_record, ARCHIVE_MAGIC, ARCHIVE_SUFFIX};
use crate::common::stop_requested;
use crate::github::ApiClient;
use crate::index::Index;
use crate::network;
use crate::pack_read::Counts;

/// Global options shared by every subcommand.
pub struct Options {
    pub data: PathBuf,
    pub index: String,
    pub token_file: PathBuf,
    pub files_max_refs: usize,
    pub files_max_num: usize,
    pub small_min: u64,
    pub small_max: u64,
    pub user_agent: String,
}

/// The "acquire" command: fetch the given repositories into one archive.
pub fn acquire(opts: &Options, archive: &str, repos: &[String]) -> Result<()> {
    let mut dname = archive.to_string();
    if !dname.ends_with(ARCHIVE_SUFFIX) {
        println!("Warning: {dname} does not end with {ARCHIVE_SUFFIX}, adding it");
        dname.push_str(ARCHIVE_SUFFIX);
    }

    let mut parsed = Vec::new();
    for repo in repos {
        let Some((owner, name)) = repo.split_once('/') else {
            bail!("each repository must be in the form <owner>/<name>, got {repo}");
        };
        parsed.push((owner.to_string(), name.to_string()));
    }

    ensure_data_dir(&opts.data)?;
    let mut idx = Index::load(&opts.data, &opts.index, false)?;
    let mut api = ApiClient::new(&opts.token_file, &opts.user_agent)?;
    acquire_into(opts, &opts.data.join(&dname), parsed, &mut idx, &mut api)
}

/// The "by_language" command: top-100 repositories per listed language.
pub fn by_language(opts: &Options, list: &Path) -> Result<()> {
    anyhow::ensure!(
        list.is_file(),
        "{} does not exist or is not a file",
        list.display()
    );
    ensure_data_dir(&opts.data)?;
    let mut idx = Index::load(&opts.data, &opts.index, false)?;
    let mut api = ApiClient::new(&opts.token_file, &opts.user_agent)?;

    let langs = fs::read_to_string(list)
        .with_context(|| format!("reading {}", list.display()))?;
    let langs: Vec<&str> = langs
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();

    for lang in langs {
        let repos = api.top_repos_for_language(lang)?;
        let dname = format!("top100_{}{}", fileify(lang), ARCHIVE_SUFFIX);
        acquire_into(opts, &opts.data.join(&dname), repos, &mut idx, &mut api)?;
        if stop_requested() {
            break;
        }
    }
    Ok(())
}

/// The "small" command: walk search pages of small repositories forever.
pub fn small(opts: &Options, start_page: Option<u64>) -> Result<()> {
    ensure_data_dir(&opts.data)?;
    let mut idx = Index::load(&opts.data, &opts.index, false)?;
    let mut api = ApiClient::new(&opts.token_file, &opts.user_agent)?;

    let mut page = start_page.unwrap_or(1).max(1);
    loop {
        let repos = api.small_repos(page, opts.small_min, opts.small_max)?;
        if repos.is_empty() {
            println!("No more repositories.");
            break;
        }
        let dname = format!("small_page{page}{ARCHIVE_SUFFIX}");
        acquire_into(opts, &opts.data.join(&dname), repos, &mut idx, &mut api)?;
        if stop_requested() {
            break;
        }
        page += 1;
    }
    Ok(())
}

/// The "genindex" command.
pub fn genindex(opts: &Options) -> Result<()> {
    Index::load(&opts.data, &opts.index, true)?;
    Ok(())
}

fn ensure_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        println!("{} does not exist, will be created", data_dir.display());
        fs::create_dir_all(data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;
    }
    Ok(())
}

/// Turn a language name into something safe for a file name.
fn fileify(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| !" /\\?*:|\"'<>".contains(*c) && !c.is_control())
        .collect()
}

/// Acquire `repos` into the archive at `fname`, resuming whatever the file
/// already holds. The index is rewritten after every completed repository
/// and once more at teardown, so an interrupted run loses at most the
/// repository it was working on.
fn acquire_into(
    opts: &Options,
    fname: &Path,
    repos: Vec<(String, String)>,
    idx: &mut Index,
    api: &mut ApiClient,
) -> Result<()> {
    let dname = fname
        .file_name()
        .and_then(OsStr::to_str)
        .context("archive name is not valid UTF-8")?
        .to_string();

    let mut pending = Vec::new();
    for repo in repos {
        match idx.contains_repo(&repo.0, &repo.1) {
            Some(existing) => println!(
                "Skipping repository {}/{}, already exists in file {existing}",
                repo.0, repo.1
            ),
            None => pending.push(repo),
        }
    }
    if pending.is_empty() {
        println!("No repositories left to acquire.");
        return Ok(());
    }

    // Open the archive: fresh, fast-forwarded from the index, or resumed
    // by scanning. `written` counts decompressed bytes in the new file,
    // `valid` the offset of the last complete record (0 = nothing yet).
    let mut have: Vec<(String, String)> = Vec::new();
    let mut written: u64;
    let mut valid: u64;
    let mut out: GzEncoder<fs::File>;

    if fname.exists() {
        println!("Found already existing file {}", fname.display());
        let bak = rotate_backup(fname)?;
        if let Some((_, offset)) = idx.file_entry(&dname) {
            println!("File {dname} is in the index, skipping right ahead...");
            out = copy_archive_prefix(&bak, fname, offset)?;
            fs::remove_file(&bak)
                .with_context(|| format!("removing backup {}", bak.display()))?;
            have = idx.repos_in_file(&dname);
            written = offset;
            valid = offset;
        } else {
            let mut probe = GzDecoder::new(
                fs::File::open(&bak).with_context(|| format!("opening {}", bak.display()))?,
            );
            let mut magic = [0u8; 4];
            if probe.read_exact(&mut magic).is_err() || magic != ARCHIVE_MAGIC {
                println!("File is not an archive, has been moved to {}", bak.display());
                out = fresh_archive(fname)?;
                written = ARCHIVE_MAGIC.len() as u64;
                valid = 0;
            } else {
                println!("Detected archive file, trying to resume...");
                let (recovered, offset) = scan_archive(probe);
                let offset = offset + ARCHIVE_MAGIC.len() as u64;
                if recovered.is_empty() {
                    println!(
                        "Warning: no repositories found, backup kept at {}",
                        bak.display()
                    );
                    out = fresh_archive(fname)?;
                    written = ARCHIVE_MAGIC.len() as u64;
                    valid = 0;
                } else {
                    println!("Found {} repositories.", recovered.len());
                    out = copy_archive_prefix(&bak, fname, offset)?;
                    fs::remove_file(&bak)
                        .with_context(|| format!("removing backup {}", bak.display()))?;
                    pending.retain(|r| !recovered.contains(r));
                    have = recovered;
                    written = offset;
                    valid = offset;
                }
            }
        }
    } else {
        out = fresh_archive(fname)?;
        written = ARCHIVE_MAGIC.len() as u64;
        valid = 0;
    }

    let run = (|| -> Result<()> {
        for (owner, name) in &pending {
            println!("Acquiring {owner}/{name}...");
            let start = Instant::now();

            // The record is staged in memory and appended only when it is
            // complete; the archive never holds half a record.
            let mut record = Vec::new();
            match fetch_and_record(&mut record, api, opts, owner, name) {
                Ok(num) => {
                    out.write_all(&record).context("writing to archive")?;
                    out.flush().context("flushing archive")?;
                    written += record.len() as u64;
                    valid = written;
                    have.push((owner.clone(), name.clone()));

                    print_summary(&num);
                    println!("Done. ({:.2}s)", start.elapsed().as_secs_f64());

                    let size = fs::metadata(fname)
                        .with_context(|| format!("stat {}", fname.display()))?
                        .len();
                    idx.set_file(&dname, size, valid, &have);
                    idx.save()?;
                }
                Err(e) => {
                    eprintln!("Error: acquiring {owner}/{name} failed: {e:#}");
                }
            }

            if stop_requested() {
                println!("Interrupt received, stopping after the current repository.");
                break;
            }
        }
        Ok(())
    })();

    let closed = out
        .finish()
        .map(|_| ())
        .context("closing archive");
    if valid > 0 {
        if let Ok(meta) = fs::metadata(fname) {
            idx.set_file(&dname, meta.len(), valid, &have);
        }
    }
    let saved = idx.save();

    run?;
    closed?;
    saved
}

/// Fetch one repository's pack and append its filtered record to `record`.
fn fetch_and_record(
    record: &mut Vec<u8>,
    api: &mut ApiClient,
    opts: &Options,
    owner: &str,
    name: &str,
) -> Result<Counts> {
    let files = api.prefetch_file_ids(owner, name, opts.files_max_refs, opts.files_max_num);
    let pack = network::fetch_pack(api.http(), owner, name, &files, &opts.user_agent)?;
    write_repo_record(record, pack, owner, name)
}

fn print_summary(num: &Counts) {
    println!(
        "Commits: {}\nTrees:   {}\nSkipped: {}\nTotal:   {}",
        num.commits, num.trees, num.skipped, num.total
    );
}

/// Create a new archive file with the leading magic.
fn fresh_archive(fname: &Path) -> Result<GzEncoder<fs::File>> {
    let file = fs::File::create_new(fname)
        .with_context(|| format!("creating {}", fname.display()))?;
    let mut enc = GzEncoder::new(file, Compression::default());
    enc.write_all(&ARCHIVE_MAGIC).context("writing archive magic")?;
    Ok(enc)
}

/// Move an existing file to the first free `<name>.bak.<n>`.
fn rotate_backup(fname: &Path) -> Result<PathBuf> {
    let mut i = 0;
    let bak = loop {
        let candidate = PathBuf::from(format!("{}.bak.{}", fname.display(), i));
        if !candidate.exists() {
            break candidate;
        }
        i += 1;
    };
    fs::rename(fname, &bak)
        .with_context(|| format!("moving {} to {}", fname.display(), bak.display()))?;
    Ok(bak)
}

/// Start a new archive holding the first `offset` decompressed bytes of
/// the old one, and leave it open for appending.
fn copy_archive_prefix(old: &Path, new: &Path, offset: u64) -> Result<GzEncoder<fs::File>> {
    let mut src = GzDecoder::new(
        fs::File::open(old).with_context(|| format!("opening {}", old.display()))?,
    );
    let file = fs::File::create_new(new)
        .with_context(|| format!("creating {}", new.display()))?;
    let mut enc = GzEncoder::new(file, Compression::default());
    copy_exact(&mut src, &mut enc, offset)
        .with_context(|| format!("copying {offset} bytes from {}", old.display()))?;
    Ok(enc)
}

/// Copy exactly `nbytes` bytes, reporting progress at most once a second.
fn copy_exact(src: &mut impl Read, dst: &mut impl Write, nbytes: u64) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    let mut last_report = Instant::now();
    while copied < nbytes {
        if last_report.elapsed().as_secs() >= 1 {
            last_report = Instant::now();
            println!("Copying... ({:2.2}%)", copied as f64 / nbytes as f64 * 100.0);
        }
        let want = buf.len().min((nbytes - copied) as usize);
        let n = src.read(&mut buf[..want]).context("reading old archive")?;
        anyhow::ensure!(n > 0, "old archive ended {} bytes early", nbytes - copied);
        dst.write_all(&buf[..n]).context("writing new archive")?;
        copied += n as u64;
    }
    Ok(())
}
