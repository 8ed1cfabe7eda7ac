//! Cluster URL parsing and bootstrap identity derivation.

use crate::error::InitError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Parses a comma-separated list of peer URLs (e.g. `"http://10.0.0.1:2380,http://10.0.0.2:2380"`).
///
/// URLs are normalized to `scheme://host:port`, sorted and de-duplicated.
pub fn parse_urls(raw: &str) -> Result<Vec<String>, InitError> {
    let mut urls = BTreeSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        urls.insert(normalize_url(part)?);
    }
    if urls.is_empty() {
        return Err(InitError::InvalidOptions(format!(
            "no URLs found in {:?}",
            raw
        )));
    }
    Ok(urls.into_iter().collect())
}

fn normalize_url(raw: &str) -> Result<String, InitError> {
    let url = Url::parse(raw)
        .map_err(|e| InitError::InvalidOptions(format!("invalid URL {:?}: {}", raw, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(InitError::InvalidOptions(format!(
            "URL scheme must be http or https: {}",
            raw
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| InitError::InvalidOptions(format!("URL has no host: {}", raw)))?;
    let port = url.port_or_known_default().ok_or_else(|| {
        InitError::InvalidOptions(format!("URL address does not have the form host:port: {}", raw))
    })?;
    if !(url.path().is_empty() || url.path() == "/") || url.query().is_some() {
        return Err(InitError::InvalidOptions(format!(
            "URL must not contain a path or query: {}",
            raw
        )));
    }
    Ok(format!("{}://{}:{}", url.scheme(), host, port))
}

/// Mapping from member name to that member's peer URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlsMap(BTreeMap<String, BTreeSet<String>>);

impl UrlsMap {
    /// Parses an initial-cluster string such as `"etcd-0=http://10.0.0.1:2380"`.
    ///
    /// A name may appear several times to register several URLs.
    pub fn parse(raw: &str) -> Result<Self, InitError> {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, url) = pair.split_once('=').ok_or_else(|| {
                InitError::InvalidOptions(format!("expected name=url in initial cluster, got {:?}", pair))
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(InitError::InvalidOptions(format!(
                    "empty member name in initial cluster entry {:?}",
                    pair
                )));
            }
            map.entry(name.to_string())
                .or_default()
                .insert(normalize_url(url.trim())?);
        }
        Ok(Self(map))
    }

    /// Builds a map holding a single member.
    pub fn single(name: &str, urls: &[String]) -> Self {
        let mut map = BTreeMap::new();
        map.insert(name.to_string(), urls.iter().cloned().collect());
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// URLs registered for `name`, if any.
    pub fn urls(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Renders the initial-cluster descriptor, sorted by name then URL.
    pub fn initial_cluster(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for UrlsMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, urls) in &self.0 {
            for url in urls {
                if !first {
                    f.write_str(",")?;
                }
                write!(f, "{}={}", name, url)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Derives the member id for a freshly bootstrapped member.
///
/// Peer URLs are hashed in sorted order, so the id is stable for a given configuration.
pub fn member_id(name: &str, peer_urls: &[String], cluster_token: &str) -> u64 {
    let mut sorted: Vec<&str> = peer_urls.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for url in sorted {
        hasher.update(url.as_bytes());
    }
    hasher.update(cluster_token.as_bytes());
    hasher.update(name.as_bytes());
    truncate_digest(&hasher.finalize())
}

/// Derives the cluster id of the single-member cluster founded by `member_id`.
pub fn cluster_id(member_id: u64, cluster_token: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(member_id.to_be_bytes());
    hasher.update(cluster_token.as_bytes());
    truncate_digest(&hasher.finalize())
}

fn truncate_digest(digest: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
