use std::{
    collections::HashSet,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::{Context, Result, anyhow};
use tokio::task;
use tracing::{info, warn};

const WHITELIST_PREFIX: &str = "whitelist";
const BLACKLIST_PREFIX: &str = "blacklist";

/// Lowercase FQDN form used for every list lookup.
pub fn normalize_domain(domain: &str) -> String {
    let lower = domain.trim().to_ascii_lowercase();
    if lower.ends_with('.') {
        lower
    } else {
        format!("{lower}.")
    }
}

/// One consistent whitelist/blacklist pair. Never mutated after construction.
#[derive(Debug, Default, Clone)]
pub struct DomainLists {
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
}

impl DomainLists {
    pub fn new<W, B>(whitelist: W, blacklist: B) -> Self
    where
        W: IntoIterator,
        W::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
    {
        Self {
            whitelist: whitelist
                .into_iter()
                .map(|d| normalize_domain(d.as_ref()))
                .collect(),
            blacklist: blacklist
                .into_iter()
                .map(|d| normalize_domain(d.as_ref()))
                .collect(),
        }
    }

    /// Read the highest-numbered `whitelist.<N>.txt` and `blacklist.<N>.txt`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let whitelist = read_latest_list(dir, WHITELIST_PREFIX).context("can't read whitelist")?;
        let blacklist = read_latest_list(dir, BLACKLIST_PREFIX).context("can't read blacklist")?;
        Ok(Self {
            whitelist,
            blacklist,
        })
    }

    /// Blacklisted and not whitelisted.
    pub fn is_restricted(&self, domain: &str) -> bool {
        let normalized = normalize_domain(domain);
        if self.whitelist.contains(&normalized) {
            return false;
        }
        self.blacklist.contains(&normalized)
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist.len()
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }
}

/// Shared holder of the current lists, swapped wholesale on reload.
#[derive(Debug)]
pub struct ListStore {
    directory: Option<PathBuf>,
    current: RwLock<Arc<DomainLists>>,
}

impl ListStore {
    /// Load the initial lists. Without a directory, filtering is disabled.
    pub fn open(directory: Option<PathBuf>) -> Result<Self> {
        let lists = match &directory {
            Some(dir) => {
                let lists = DomainLists::load_from_dir(dir)
                    .with_context(|| format!("Failed to load lists from {}", dir.display()))?;
                info!(
                    directory = %dir.display(),
                    whitelist = lists.whitelist_len(),
                    blacklist = lists.blacklist_len(),
                    "Loaded filtering lists"
                );
                lists
            }
            None => {
                info!("No filtering lists are used");
                DomainLists::default()
            }
        };
        Ok(Self {
            directory,
            current: RwLock::new(Arc::new(lists)),
        })
    }

    pub fn with_lists(lists: DomainLists) -> Self {
        Self {
            directory: None,
            current: RwLock::new(Arc::new(lists)),
        }
    }

    /// Consistent view of both lists.
    pub fn snapshot(&self) -> Arc<DomainLists> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn is_restricted(&self, domain: &str) -> bool {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        guard.is_restricted(domain)
    }

    /// Replace both lists in a single write.
    pub fn install(&self, lists: DomainLists) {
        let fresh = Arc::new(lists);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = fresh;
    }

    /// Rebuild both lists from disk. On failure the previous snapshot stays.
    pub async fn reload(&self) -> Result<()> {
        let Some(dir) = self.directory.clone() else {
            info!("No filtering lists are used; reload skipped");
            return Ok(());
        };
        let lists = task::spawn_blocking(move || DomainLists::load_from_dir(&dir))
            .await
            .context("List reload task failed")??;
        info!(
            whitelist = lists.whitelist_len(),
            blacklist = lists.blacklist_len(),
            "Reloaded filtering lists"
        );
        self.install(lists);
        Ok(())
    }
}

fn read_latest_list(dir: &Path, prefix: &str) -> Result<HashSet<String>> {
    let file_name = latest_list_file(dir, prefix)?;
    parse_list(&dir.join(file_name))
}

/// Name of the `<prefix>.<N>.txt` file with the largest `N`.
pub fn latest_list_file(dir: &Path, prefix: &str) -> Result<String> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Unable to read lists directory {}", dir.display()))?;

    let mut best: Option<(u64, String)> = None;
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(number) = list_file_number(&name, prefix) else {
            continue;
        };
        let Ok(number) = number.parse::<u64>() else {
            warn!(file = %name, "Unable to parse list file number");
            continue;
        };
        if best.as_ref().is_none_or(|(current, _)| number > *current) {
            best = Some((number, name));
        }
    }

    best.map(|(_, name)| name)
        .ok_or_else(|| anyhow!("no {prefix}.<N>.txt files found in {}", dir.display()))
}

fn list_file_number<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let digits = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".txt")?;
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        Some(digits)
    } else {
        None
    }
}

/// One domain per line; blank lines skipped, names forced to lowercase FQDN.
pub fn parse_list(path: &Path) -> Result<HashSet<String>> {
    let file =
        fs::File::open(path).with_context(|| format!("Unable to open list {}", path.display()))?;
    let mut result = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Unable to read list {}", path.display()))?;
        let domain = line.trim();
        if domain.is_empty() {
            continue;
        }
        result.insert(normalize_domain(domain));
    }
    Ok(result)
}
