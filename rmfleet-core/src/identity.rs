use crate::{IdentityError, IdentityResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Immutable identity of a provisioned node: the node id plus the
/// certificate material the operator impersonates it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub root_ca_path: PathBuf,
}

/// Node-id → identity map, built once at startup by walking the operator's
/// certificate directories.
pub struct IdentityStore {
    nodes: BTreeMap<String, NodeIdentity>,
}

const CERT_CANDIDATES: [&str; 3] = ["node.crt", "crt-node.crt", "certificate.crt"];
const KEY_CANDIDATES: [&str; 3] = ["node.key", "key-node.key", "private.key"];

impl IdentityStore {
    /// Discover node identities under the given roots.
    ///
    /// Two layouts are recognized: directories named after a 12-hex-digit
    /// MAC address holding `node.info`/`node.crt`/`node.key`, and
    /// `node_details` subtrees holding `node-*-<node_id>` directories.
    /// Nodes without a resolvable root CA are skipped with a warning.
    pub fn discover(roots: &[PathBuf], config_dir: &Path) -> IdentityResult<Self> {
        let mut nodes = BTreeMap::new();

        for root in roots {
            for (node_id, cert_path, key_path) in walk_certificates(root) {
                match resolve_root_ca(&cert_path, config_dir) {
                    Ok(root_ca_path) => {
                        debug!("Discovered node {node_id} under {}", root.display());
                        nodes.insert(
                            node_id.clone(),
                            NodeIdentity {
                                node_id,
                                cert_path,
                                key_path,
                                root_ca_path,
                            },
                        );
                    }
                    Err(e) => warn!("Skipping node {node_id}: {e}"),
                }
            }
        }

        if nodes.is_empty() {
            let shown = roots
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(IdentityError::NoNodes(shown));
        }

        Ok(Self { nodes })
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeIdentity> {
        self.nodes.get(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeIdentity> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Walk a directory tree and collect `(node_id, cert, key)` tuples from
/// both recognized layouts.
fn walk_certificates(root: &Path) -> Vec<(String, PathBuf, PathBuf)> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot read {}: {e}", dir.display());
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();

            if is_mac_dir_name(&name) {
                if let Some(tuple) = read_mac_layout(&path) {
                    found.push(tuple);
                    continue;
                }
            }
            if name == "node_details" {
                found.extend(read_node_details(&path));
                continue;
            }
            stack.push(path);
        }
    }

    found
}

/// A directory named as 12 hex digits is treated as a MAC-address layout
fn is_mac_dir_name(name: &str) -> bool {
    name.len() == 12 && name.chars().all(|c| c.is_ascii_hexdigit())
}

/// MAC layout: `node.info` holds the node id; certs are fixed names.
fn read_mac_layout(dir: &Path) -> Option<(String, PathBuf, PathBuf)> {
    let node_info = dir.join("node.info");
    let cert_path = dir.join("node.crt");
    let key_path = dir.join("node.key");
    if !(node_info.exists() && cert_path.exists() && key_path.exists()) {
        return None;
    }
    let node_id = std::fs::read_to_string(&node_info).ok()?.trim().to_string();
    if node_id.is_empty() {
        return None;
    }
    Some((node_id, cert_path, key_path))
}

/// `node_details` layout: `node-<seq>-<node_id>` directories with a
/// small set of candidate file names, first match wins.
fn read_node_details(dir: &Path) -> Vec<(String, PathBuf, PathBuf)> {
    let mut found = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return found,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(node_id) = node_id_from_dir_name(&name) else {
            continue;
        };
        let cert = first_existing(&path, &CERT_CANDIDATES);
        let key = first_existing(&path, &KEY_CANDIDATES);
        match (cert, key) {
            (Some(cert), Some(key)) => found.push((node_id.to_string(), cert, key)),
            _ => warn!("Certificate files not found for node {node_id} in {}", path.display()),
        }
    }

    found
}

fn node_id_from_dir_name(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("node-")?;
    let (_, node_id) = rest.split_once('-')?;
    if node_id.is_empty() {
        None
    } else {
        Some(node_id)
    }
}

fn first_existing(dir: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Resolve the root CA for a node certificate: `root.pem` next to the
/// certificate, falling back to `<config_dir>/certs/root.pem`.
pub fn resolve_root_ca(cert_path: &Path, config_dir: &Path) -> IdentityResult<PathBuf> {
    if let Some(cert_dir) = cert_path.parent() {
        let local = cert_dir.join("root.pem");
        if local.exists() {
            return Ok(local);
        }
    }

    let shared = config_dir.join("certs").join("root.pem");
    if shared.exists() {
        return Ok(shared);
    }

    Err(IdentityError::RootCaMissing(
        cert_path.display().to_string(),
    ))
}
