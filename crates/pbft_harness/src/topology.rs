//! Deterministic node-table generation.
//!
//! Every (cluster, index) pair maps to `server:port` where
//! `port = base_port + index + ordinal(cluster) * nodes_per_cluster`. The
//! stride keeps each cluster in its own port range on a shared host, and the
//! rendered file is grouped by cluster in declaration order, then by index.

use std::io::Write;
use std::path::Path;

use crate::cluster::{validate_host, ClusterSet, ClusterTag, Endpoint, NodeIdentity};
use crate::error::{HarnessError, Result};

/// First port handed out to `<first cluster>0`.
pub const DEFAULT_BASE_PORT: u16 = 2222;
/// Host written for the cluster that runs locally in a trial.
pub const LOCAL_OVERRIDE_HOST: &str = "0.0.0.0";

/// Computes node tables for a fixed cluster declaration and base port.
#[derive(Debug, Clone)]
pub struct TopologyGenerator {
    clusters: ClusterSet,
    base_port: u16,
}

impl TopologyGenerator {
    pub fn new(clusters: ClusterSet, base_port: u16) -> Self {
        Self {
            clusters,
            base_port,
        }
    }

    pub fn clusters(&self) -> &ClusterSet {
        &self.clusters
    }

    /// Port assigned to `index` within `cluster`.
    pub fn port(
        &self,
        cluster: &ClusterTag,
        index: usize,
        nodes_per_cluster: usize,
    ) -> Result<u16> {
        let ordinal = self.clusters.require(cluster)?;
        let port = ordinal
            .checked_mul(nodes_per_cluster)
            .and_then(|offset| offset.checked_add(index))
            .and_then(|offset| offset.checked_add(self.base_port as usize))
            .filter(|port| *port <= u16::MAX as usize)
            .ok_or_else(|| {
                HarnessError::invalid(format!(
                    "port for {cluster}{index} overflows (base {} stride {nodes_per_cluster})",
                    self.base_port
                ))
            })?;
        Ok(port as u16)
    }

    /// Builds the full table for every declared cluster.
    pub fn generate(&self, nodes_per_cluster: usize, server: &str) -> Result<NodeTable> {
        if nodes_per_cluster == 0 {
            return Err(HarnessError::invalid("nodes per cluster must be > 0"));
        }
        validate_host(server)?;

        let mut entries = Vec::with_capacity(self.clusters.len() * nodes_per_cluster);
        for cluster in self.clusters.iter() {
            for index in 0..nodes_per_cluster {
                let port = self.port(cluster, index, nodes_per_cluster)?;
                entries.push(TableEntry {
                    node: NodeIdentity::new(cluster.clone(), index),
                    endpoint: Endpoint {
                        host: server.to_string(),
                        port,
                    },
                });
            }
        }
        Ok(NodeTable { entries })
    }
}

impl Default for TopologyGenerator {
    fn default() -> Self {
        Self::new(ClusterSet::default(), DEFAULT_BASE_PORT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub node: NodeIdentity,
    pub endpoint: Endpoint,
}

/// Address book for one deployment, kept in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeTable {
    entries: Vec<TableEntry>,
}

impl NodeTable {
    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a node id such as `M2`.
    pub fn lookup(&self, node_id: &str) -> Option<&Endpoint> {
        self.entries
            .iter()
            .find(|e| e.node.node_id() == node_id)
            .map(|e| &e.endpoint)
    }

    pub fn cluster<'a>(&'a self, tag: &'a ClusterTag) -> impl Iterator<Item = &'a TableEntry> {
        self.entries.iter().filter(move |e| &e.node.cluster == tag)
    }

    /// Rewrites every endpoint of `tag` to [`LOCAL_OVERRIDE_HOST`].
    pub fn with_local_override(mut self, tag: &ClusterTag) -> Self {
        for entry in self.entries.iter_mut().filter(|e| &e.node.cluster == tag) {
            entry.endpoint.host = LOCAL_OVERRIDE_HOST.to_string();
        }
        self
    }

    /// One `<tag> <node id> <host:port>` line per entry.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!(
                "{} {} {}\n",
                entry.node.cluster,
                entry.node.node_id(),
                entry.endpoint
            ));
        }
        out
    }

    /// Inverse of [`NodeTable::render`]; blank lines are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let bad = |why: &str| {
                HarnessError::invalid(format!("node table line {}: {why}: {line:?}", lineno + 1))
            };
            let fields = line.split_whitespace().collect::<Vec<_>>();
            let [tag, node_id, addr] = fields.as_slice() else {
                return Err(bad("expected 3 fields"));
            };
            let cluster = ClusterTag::new(*tag).map_err(|_| bad("invalid cluster tag"))?;
            let index = node_id
                .strip_prefix(cluster.as_str())
                .and_then(|rest| rest.parse::<usize>().ok())
                .ok_or_else(|| bad("node id does not match cluster tag"))?;
            let endpoint = addr.parse::<Endpoint>().map_err(|_| bad("invalid endpoint"))?;
            entries.push(TableEntry {
                node: NodeIdentity::new(cluster, index),
                endpoint,
            });
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        Self::parse(&text)
    }

    /// Replaces `path` with the rendered table via a same-directory temp file
    /// and rename, so readers see either the old or the new table.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| HarnessError::io(dir, e))?;
        tmp.write_all(self.render().as_bytes())
            .map_err(|e| HarnessError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| HarnessError::io(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| HarnessError::io(path, e.error))?;
        Ok(())
    }
}
