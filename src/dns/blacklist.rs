//! Domain blacklist
//!
//! The forwarder answers `0.0.0.0` for names found on public ad/malware
//! hosts lists. The list set is downloaded concurrently from several URLs,
//! combined, and published wholesale: readers always hold a coherent
//! snapshot behind an `ArcSwap`, and a refresh is a single pointer swap.
//! Refresh happens once at daemon startup and again on every maintenance
//! cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{info, warn};

/// Hosts-file sources consulted when the configuration does not override them
pub const DEFAULT_HOSTS_URLS: &[&str] = &[
    "http://winhelp2002.mvps.org/hosts.txt",
    "http://pgl.yoyo.org/adservers/serverlist.php?hostformat=hosts&showintro=0&mimetype=plaintext",
    "http://www.malwaredomainlist.com/hostslist/hosts.txt",
    "http://someonewhocares.org/hosts/hosts",
];

/// Per-URL download deadline
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Shortest acceptable domain name in a hosts file
const MIN_NAME_LEN: usize = 4;

/// An immutable set of blocked names
///
/// Lookup succeeds for the exact name and for every parent suffix down to
/// two labels, so a blacklist entry `ads.example.com` also blocks
/// `banner.ads.example.com`.
#[derive(Debug, Default)]
pub struct Blacklist {
    names: HashSet<String>,
}

impl Blacklist {
    /// Build a set from an iterator of names, normalising to lowercase FQDN
    /// form without the trailing dot.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|n| n.as_ref().trim_end_matches('.').to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        Self { names }
    }

    /// Number of blocked names
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when no names are loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Membership test over the name and its parent suffixes.
    #[must_use]
    pub fn is_blocked(&self, name: &str) -> bool {
        if self.names.is_empty() {
            return false;
        }
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let mut labels: Vec<&str> = name.split('.').filter(|l| !l.is_empty()).collect();
        while labels.len() >= 2 {
            if self.names.contains(&labels.join(".")) {
                return true;
            }
            labels.remove(0);
        }
        false
    }
}

/// Extract domain names from hosts-file content.
///
/// Understands the Unix hosts syntax: optional leading address token,
/// whitespace, domain name, `#` comments. Local and overly short names are
/// rejected.
#[must_use]
pub fn extract_names_from_hosts(content: &str) -> Vec<String> {
    let mut names = Vec::with_capacity(16384);
    for line in content.lines() {
        let line = match line.split_once('#') {
            Some((before, _comment)) => before.trim(),
            None => line.trim(),
        };
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let first = match fields.next() {
            Some(f) => f,
            None => continue,
        };
        let name = match fields.next() {
            Some(second) => second,
            // A line may carry a bare domain without the address token
            None if first.parse::<std::net::IpAddr>().is_err() => first,
            None => continue,
        };
        let name = name.to_ascii_lowercase();
        if name.len() < MIN_NAME_LEN
            || name.ends_with("localhost")
            || name.ends_with("localdomain")
        {
            continue;
        }
        names.push(name);
    }
    names
}

/// Atomically refreshable blacklist holder
pub struct BlacklistStore {
    current: ArcSwap<Blacklist>,
    urls: Vec<String>,
    client: reqwest::Client,
}

impl BlacklistStore {
    /// Create a store that refreshes from the given URLs; an empty list
    /// falls back to [`DEFAULT_HOSTS_URLS`].
    #[must_use]
    pub fn new(urls: Vec<String>) -> Self {
        let urls = if urls.is_empty() {
            DEFAULT_HOSTS_URLS.iter().map(|u| (*u).to_string()).collect()
        } else {
            urls
        };
        Self {
            current: ArcSwap::new(Arc::new(Blacklist::default())),
            urls,
            client: reqwest::Client::builder()
                .timeout(DOWNLOAD_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Borrow the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<Blacklist> {
        self.current.load_full()
    }

    /// Replace the published set
    pub fn install(&self, blacklist: Blacklist) {
        self.current.store(Arc::new(blacklist));
    }

    /// Download every source concurrently and publish the combined set.
    ///
    /// A failing URL is logged and skipped. When every source fails the
    /// previous snapshot stays published, so a transient outage cannot wipe
    /// a working blacklist. Returns the size of the published set.
    pub async fn refresh(&self) -> usize {
        let mut handles = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            let url = url.clone();
            let client = self.client.clone();
            handles.push(tokio::spawn(async move {
                match download(&client, &url).await {
                    Ok(content) => {
                        let names = extract_names_from_hosts(&content);
                        info!(url = %url, names = names.len(), "downloaded blacklist source");
                        Some(names)
                    }
                    Err(err) => {
                        warn!(url = %url, error = %err, "blacklist download failed, skipping source");
                        None
                    }
                }
            }));
        }

        let mut combined: HashSet<String> = HashSet::new();
        let mut sources_ok = 0usize;
        for handle in handles {
            if let Ok(Some(names)) = handle.await {
                sources_ok += 1;
                combined.extend(names);
            }
        }

        if sources_ok == 0 {
            let kept = self.snapshot().len();
            warn!(kept, "every blacklist source failed, keeping previous snapshot");
            return kept;
        }
        let count = combined.len();
        self.install(Blacklist::from_names(combined));
        info!(names = count, sources_ok, "blacklist refreshed");
        count
    }
}

async fn download(client: &reqwest::Client, url: &str) -> Result<String, reqwest::Error> {
    client.get(url).send().await?.error_for_status()?.text().await
}
