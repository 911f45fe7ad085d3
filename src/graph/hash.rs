//! Graph fingerprinting.

use super::Graph;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;

/// SHA-256 digest of a graph's adjacency structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphHash(pub [u8; 32]);

impl GraphHash {
    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(GraphHash(arr))
    }
}

impl fmt::Debug for GraphHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GraphHash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for GraphHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash the graph's topology.
///
/// Each node contributes one line `"<node> <neighbour> ...\n"`, nodes and
/// neighbours ascending, so the digest does not depend on insertion order.
/// Every edge is listed from both ends. The digest differs from hashes of a
/// networkx adjacency list, which lists each edge once in insertion order.
pub fn compute_graph_hash(graph: &Graph) -> GraphHash {
    let mut hasher = Sha256::new();
    let mut line = Vec::new();

    for node in graph.nodes() {
        line.clear();
        // Writing into a Vec cannot fail.
        let _ = write!(line, "{node}");
        for neighbour in graph.neighbours(node) {
            let _ = write!(line, " {neighbour}");
        }
        line.push(b'\n');
        hasher.update(&line);
    }

    GraphHash(hasher.finalize().into())
}
