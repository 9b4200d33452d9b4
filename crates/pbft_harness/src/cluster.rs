//! Cluster identities and addressing primitives.
//!
//! A deployment is split into independently addressed sub-clusters, each
//! named by a short [`ClusterTag`]. The declaration order of the tags in a
//! [`ClusterSet`] is significant: a tag's ordinal selects its port stride.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{HarnessError, Result};

/// Longest tag accepted; tags are concatenated into node ids and window names.
const MAX_TAG_LEN: usize = 8;

/// Short identifier for one sub-cluster (e.g. `N`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterTag(String);

impl ClusterTag {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_TAG_LEN {
            return Err(HarnessError::invalid(format!(
                "cluster tag {raw:?} must be 1..={MAX_TAG_LEN} characters"
            )));
        }
        if !raw.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(HarnessError::invalid(format!(
                "cluster tag {raw:?} must be ASCII letters only"
            )));
        }
        Ok(Self(raw))
    }

    pub(crate) fn from_static(raw: &'static str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClusterTag {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s.trim())
    }
}

/// Ordered, duplicate-free set of cluster tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSet {
    tags: Vec<ClusterTag>,
}

impl ClusterSet {
    pub fn new(tags: Vec<ClusterTag>) -> Result<Self> {
        if tags.is_empty() {
            return Err(HarnessError::invalid("cluster set must not be empty"));
        }
        for (i, tag) in tags.iter().enumerate() {
            if tags[..i].contains(tag) {
                return Err(HarnessError::invalid(format!(
                    "cluster tag {tag} declared more than once"
                )));
            }
        }
        Ok(Self { tags })
    }

    /// Zero-based position of `tag` in declaration order.
    pub fn ordinal(&self, tag: &ClusterTag) -> Option<usize> {
        self.tags.iter().position(|t| t == tag)
    }

    /// Like [`ClusterSet::ordinal`] but fails for undeclared tags.
    pub fn require(&self, tag: &ClusterTag) -> Result<usize> {
        self.ordinal(tag).ok_or_else(|| {
            HarnessError::invalid(format!(
                "cluster tag {tag} is not one of the declared clusters ({self})"
            ))
        })
    }

    pub fn contains(&self, tag: &ClusterTag) -> bool {
        self.ordinal(tag).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterTag> {
        self.tags.iter()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl Default for ClusterSet {
    fn default() -> Self {
        let tags = ["N", "M", "P", "J", "K"]
            .into_iter()
            .map(ClusterTag::from_static)
            .collect();
        Self { tags }
    }
}

impl fmt::Display for ClusterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .tags
            .iter()
            .map(ClusterTag::as_str)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

/// Parses a comma-separated list like `N,M,P`.
impl FromStr for ClusterSet {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        let tags = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(ClusterTag::new)
            .collect::<Result<Vec<_>>>()?;
        Self::new(tags)
    }
}

/// Logical node: a cluster plus an index within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity {
    pub cluster: ClusterTag,
    pub index: usize,
}

impl NodeIdentity {
    pub fn new(cluster: ClusterTag, index: usize) -> Self {
        Self { cluster, index }
    }

    /// Node id string passed to the node binary, e.g. `N3`.
    pub fn node_id(&self) -> String {
        format!("{}{}", self.cluster, self.index)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.cluster, self.index)
    }
}

/// Reachable `host:port` for one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        validate_host(&host)?;
        Ok(Self { host, port })
    }
}

impl Endpoint {
    /// Host as it appears in an authority: IPv6 literals are bracketed.
    pub fn authority_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.authority_host(), self.port)
    }
}

impl FromStr for Endpoint {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| HarnessError::invalid(format!("endpoint {s:?} is not host:port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| HarnessError::invalid(format!("endpoint {s:?} has an invalid port")))?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(|| {
                HarnessError::invalid(format!("endpoint {s:?} has an unclosed bracket"))
            })?,
            None if host.contains(':') => {
                return Err(HarnessError::invalid(format!(
                    "endpoint {s:?}: IPv6 hosts must be bracketed"
                )))
            }
            None => host,
        };
        Self::new(host, port)
    }
}

/// Accepts IP literals and RFC 1123 style hostnames.
pub fn validate_host(host: &str) -> Result<()> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if host.is_empty() || host.len() > 253 || !host.split('.').all(valid_label) {
        return Err(HarnessError::invalid(format!("invalid host {host:?}")));
    }
    Ok(())
}
