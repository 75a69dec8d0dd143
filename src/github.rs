//! The GitHub REST API: rate-limit bookkeeping, the file prefetcher, and
//! the repository discovery queries.

use anyhow::{ensure, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::io::prelude::*;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const API_BASE: &str = "https://api.github.com";

/// The search API serves at most this many pages per query; deeper pages
/// are reached by narrowing the query instead (see [`ApiClient::small_repos`]).
const SEARCH_MAX_PAGES: u64 = 10;

/// One rate-limit window as reported by the API: requests remaining, and
/// the Unix time at which the window resets (with 2 s of slack added).
#[derive(Debug, Default, Clone, Copy)]
struct RateWindow {
    left: u64,
    reset: u64,
}

impl RateWindow {
    /// Whether `needed` requests can go out without sleeping.
    fn allows(&self, needed: u64) -> bool {
        self.left >= needed || self.reset < unix_now()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("live in the present")
        .as_secs()
}

#[derive(Deserialize)]
struct RateLimitBody {
    resources: RateLimitResources,
}

#[derive(Deserialize)]
struct RateLimitResources {
    core: RateLimitEntry,
    search: RateLimitEntry,
}

#[derive(Deserialize)]
struct RateLimitEntry {
    remaining: u64,
    reset: u64,
}

#[derive(Deserialize)]
struct RefEntry {
    object: ShaRef,
}

#[derive(Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Deserialize)]
struct CommitEntry {
    tree: ShaRef,
}

#[derive(Deserialize)]
struct TreeBody {
    tree: Vec<TreeItem>,
}

#[derive(Deserialize)]
struct TreeItem {
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct SearchBody {
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    name: String,
    owner: OwnerEntry,
    stargazers_count: u64,
}

#[derive(Deserialize)]
struct OwnerEntry {
    login: String,
}

/// Authenticated client for the GitHub API, tracking the core and search
/// rate-limit windows across requests.
pub struct ApiClient {
    http: Client,
    token: String,
    core: RateWindow,
    search: RateWindow,
    /// Highest star count still reachable in each sector of the small-repo
    /// walk; filled in lazily as page 10 of each sector is fetched.
    sector_max_stars: HashMap<u64, u64>,
}

impl ApiClient {
    /// Read the token file and seed the rate-limit windows from the API.
    pub fn new(token_file: &Path, user_agent: &str) -> Result<Self> {
        let token = std::fs::read_to_string(token_file)
            .with_context(|| format!("reading token file {}", token_file.display()))?
            .trim()
            .to_string();
        let http = Client::builder()
            .user_agent(user_agent)
            .build()
            .context("building HTTP client")?;

        let mut client = ApiClient {
            http,
            token,
            core: RateWindow::default(),
            search: RateWindow::default(),
            sector_max_stars: HashMap::new(),
        };

        let limits: RateLimitBody = client
            .get("/rate_limit", &[])
            .context("querying rate limit")?;
        client.core = RateWindow {
            left: limits.resources.core.remaining,
            reset: limits.resources.core.reset,
        };
        client.search = RateWindow {
            left: limits.resources.search.remaining,
            reset: limits.resources.search.reset,
        };
        Ok(client)
    }

    /// The underlying HTTP client (shared with the pack fetcher).
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Whether that many core and search requests can go out right now.
    pub fn has_requests_left(&self, core: u64, search: u64) -> bool {
        self.core.allows(core) && self.search.allows(search)
    }

    /// One authenticated GET, sleeping out an exhausted rate-limit window
    /// first and folding the reply's window headers back in.
    fn get<T: for<'de> Deserialize<'de>>(
        &mut self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let is_search = path.starts_with("/search");
        let window = if is_search { self.search } else { self.core };
        let now = unix_now();
        if window.left == 0 && window.reset > now {
            let dur = window.reset - now;
            println!("No api requests remaining, sleeping for {dur}s");
            thread::sleep(Duration::from_secs(dur));
        }

        let resp = self
            .http
            .get(format!("{API_BASE}{path}"))
            .header(ACCEPT, "application/vnd.github.v3+json")
            .header(AUTHORIZATION, format!("token {}", self.token))
            .query(query)
            .send()
            .with_context(|| format!("requesting {path}"))?;

        let left = header_number(resp.headers(), "x-ratelimit-remaining");
        let reset = header_number(resp.headers(), "x-ratelimit-reset");
        let window = if is_search {
            &mut self.search
        } else {
            &mut self.core
        };
        if let Some(left) = left {
            window.left = left;
        }
        if let Some(reset) = reset {
            window.reset = reset + 2;
        }

        ensure!(
            resp.status().is_success(),
            "api request {} failed: {}",
            path,
            resp.status()
        );
        resp.json().with_context(|| format!("decoding {path} reply"))
    }

    /// Ids of the blobs reachable from the first `max_refs` refs, biggest
    /// first, at most `max_files` of them. Best-effort: any failure is
    /// reported and yields an empty list, the fetch then simply pulls a
    /// complete pack.
    pub fn prefetch_file_ids(
        &mut self,
        owner: &str,
        repo: &str,
        max_refs: usize,
        max_files: usize,
    ) -> Vec<String> {
        match self.collect_blob_ids(owner, repo, max_refs) {
            Ok(mut files) => {
                files.truncate(max_files);
                files
            }
            Err(e) => {
                println!("Error.");
                eprintln!("downloading tree information failed: {e:#}");
                Vec::new()
            }
        }
    }

    fn collect_blob_ids(&mut self, owner: &str, repo: &str, max_refs: usize) -> Result<Vec<String>> {
        if !self.has_requests_left(1 + 2 * max_refs as u64, 0) {
            println!("Downloading tree information skipped, no api limit left");
            return Ok(Vec::new());
        }

        print!("Downloading tree information... ");
        let _ = io::stdout().flush();

        let refs: Vec<RefEntry> = self.get(&format!("/repos/{owner}/{repo}/git/refs"), &[])?;
        let commits: HashSet<String> = refs
            .into_iter()
            .take(max_refs)
            .map(|r| r.object.sha)
            .collect();

        let mut trees = HashSet::new();
        for sha in &commits {
            let commit: CommitEntry =
                self.get(&format!("/repos/{owner}/{repo}/git/commits/{sha}"), &[])?;
            trees.insert(commit.tree.sha);
        }

        // The set deduplicates blobs shared between refs; iterating it in
        // reverse puts the biggest files first.
        let mut files: BTreeSet<(u64, String)> = BTreeSet::new();
        for sha in &trees {
            let body: TreeBody = self.get(
                &format!("/repos/{owner}/{repo}/git/trees/{sha}"),
                &[("recursive", "1".to_string())],
            )?;
            files.extend(
                body.tree
                    .into_iter()
                    .filter(|item| item.kind == "blob")
                    .map(|item| (item.size, item.sha)),
            );
        }

        println!("Done.");
        println!("Found {} files", files.len());

        Ok(files.into_iter().rev().map(|(_, sha)| sha).collect())
    }

    /// The 100 most-starred repositories for a language.
    pub fn top_repos_for_language(&mut self, lang: &str) -> Result<Vec<(String, String)>> {
        print!("Querying top100 repositories for {lang}... ");
        let _ = io::stdout().flush();

        let body: SearchBody = self.get(
            "/search/repositories",
            &[
                ("q", format!("language:\"{lang}\"")),
                ("sort", "stars".to_string()),
                ("per_page", "100".to_string()),
            ],
        )?;
        println!("Done.");

        Ok(body
            .items
            .into_iter()
            .map(|i| (i.owner.login, i.name))
            .collect())
    }

    /// Page `page` (1-based) of the repositories whose size lies in
    /// `[small_min, small_max]` KiB, ordered by stars.
    ///
    /// The search API stops at page 10, so pages beyond it are mapped into
    /// sectors: sector N repeats the query bounded by `stars:<=` the star
    /// count of the last repository in sector N-1.
    pub fn small_repos(
        &mut self,
        page: u64,
        small_min: u64,
        small_max: u64,
    ) -> Result<Vec<(String, String)>> {
        print!("Querying small repositories, page {page}... ");
        let _ = io::stdout().flush();

        let sector = (page - 1) / SEARCH_MAX_PAGES;
        let page = page - sector * SEARCH_MAX_PAGES;
        let repos = self.small_repos_sector(sector, page, small_min, small_max)?;
        println!("Done.");
        Ok(repos)
    }

    fn small_repos_sector(
        &mut self,
        sector: u64,
        page: u64,
        small_min: u64,
        small_max: u64,
    ) -> Result<Vec<(String, String)>> {
        let query = if sector == 0 {
            format!("size:{small_min}..{small_max}")
        } else {
            if !self.sector_max_stars.contains_key(&sector) {
                // Walk the previous sector's last page to learn the bound.
                self.small_repos_sector(sector - 1, SEARCH_MAX_PAGES, small_min, small_max)?;
            }
            let max_stars = self
                .sector_max_stars
                .get(&sector)
                .context("previous search page was empty, cannot page further")?;
            format!("size:{small_min}..{small_max} stars:<={max_stars}")
        };

        let body: SearchBody = self.get(
            "/search/repositories",
            &[
                ("q", query),
                ("sort", "stars".to_string()),
                ("per_page", "100".to_string()),
                ("page", page.to_string()),
            ],
        )?;

        if page == SEARCH_MAX_PAGES {
            if let Some(last) = body.items.last() {
                self.sector_max_stars
                    .insert(sector + 1, last.stargazers_count);
            }
        }

        Ok(body
            .items
            .into_iter()
            .map(|i| (i.owner.login, i.name))
            .collect())
    }
}

fn header_number(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_allows_when_requests_remain_or_reset_passed() {
        let fresh = RateWindow {
            left: 10,
            reset: unix_now() + 3600,
        };
        assert!(fresh.allows(10));
        assert!(!fresh.allows(11));

        let expired = RateWindow {
            left: 0,
            reset: unix_now() - 10,
        };
        assert!(expired.allows(100));
    }

    #[test]
    fn biggest_files_come_first() {
        let mut files: BTreeSet<(u64, String)> = BTreeSet::new();
        files.insert((10, "aaa".into()));
        files.insert((3000, "bbb".into()));
        files.insert((200, "ccc".into()));
        files.insert((200, "ccc".into())); // duplicate collapses
        let order: Vec<String> = files.into_iter().rev().map(|(_, sha)| sha).collect();
        assert_eq!(order, vec!["bbb", "ccc", "aaa"]);
    }
}
