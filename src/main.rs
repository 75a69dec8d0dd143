//! An archiver of repository metadata hosted on GitHub.
//!
//! For each repository, a minimal fetch is negotiated over the smart-HTTP
//! git protocol; the received pack is filtered down to commits and trees
//! while it streams (file contents never touch memory or disk) and the
//! result is appended to a gzip-compressed archive. An index tracks which
//! repositories live in which archive, so interrupted runs resume where
//! they left off.
//!
//! Major restrictions:
//! - Only the first advertised ref of each repository is fetched.
//! - The pack's trailing checksum is not verified; retained objects are
//!   verified individually by their ids instead.

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

// Use a flat structure
mod archive;
mod commands;
mod commit_read;
mod common;
mod delta;
mod github;
mod index;
mod network;
mod obj_type;
mod pack_read;
mod pack_write;
mod pkt_line;
mod scratch;
#[cfg(test)]
mod testutil;
mod tree_read;
mod varint;

use commands::Options;

#[derive(Parser)]
#[command(version)]
/// Fetch and archive commit and tree metadata of GitHub repositories
struct Cli {
    /// Location of the data directory; most things happen relative to it
    #[arg(short, long, default_value = "data")]
    data: PathBuf,
    /// Name of the index file
    #[arg(short, long, default_value = "packrat.idx")]
    index: String,
    /// File to read the GitHub API token from
    #[arg(short, long, default_value = "token")]
    token_file: PathBuf,
    /// Maximum number of refs to load when prefetching files
    #[arg(short = 'B', long, default_value_t = 1)]
    files_max_refs: usize,
    /// Maximum number of prefetched file ids passed to the server while
    /// negotiating packs (bigger files are passed first)
    #[arg(short = 'F', long, default_value_t = 5000)]
    files_max_num: usize,
    /// Minimum size of a repository to be considered small (in KiB)
    #[arg(short = 'm', long, default_value_t = 10_000)]
    small_min: u64,
    /// Maximum size of a repository to be considered small (in KiB)
    #[arg(short = 'M', long, default_value_t = 100_000)]
    small_max: u64,
    /// String to send as user-agent in API and pack-negotiation requests
    #[arg(short, long, default_value = concat!("packrat/", env!("CARGO_PKG_VERSION")))]
    user_agent: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire repositories and write them into an archive file
    ///
    /// If the file is already an archive, the data is appended; otherwise
    /// it is moved away first. The index is used to skip repositories that
    /// were already downloaded.
    Acquire {
        /// Archive file, relative to the data directory
        archive: String,
        /// Repositories in the form <owner>/<name>
        #[arg(required = true)]
        repos: Vec<String>,
    },
    /// Acquire the top100 repositories for each language in a file
    #[command(name = "by_language")]
    ByLanguage {
        /// File with one language per line ('#' starts a comment)
        list: PathBuf,
    },
    /// Acquire small repositories into the data directory, page by page
    Small {
        /// Search page to start from
        start_page: Option<u64>,
    },
    /// Generate or update the index for the files in the data directory
    Genindex,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::from(2);
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    if let Err(e) = common::install_stop_handler() {
        eprintln!("Error: {e:#}");
        return ExitCode::from(3);
    }

    let opts = Options {
        data: cli.data,
        index: cli.index,
        token_file: cli.token_file,
        files_max_refs: cli.files_max_refs,
        files_max_num: cli.files_max_num,
        small_min: cli.small_min,
        small_max: cli.small_max,
        user_agent: cli.user_agent,
    };

    let result = match cli.command {
        Commands::Acquire { archive, repos } => commands::acquire(&opts, &archive, &repos),
        Commands::ByLanguage { list } => commands::by_language(&opts, &list),
        Commands::Small { start_page } => commands::small(&opts, start_page),
        Commands::Genindex => commands::genindex(&opts),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(3)
        }
    }
}
