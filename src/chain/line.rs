//! Record line grammar.
//!
//! Each record is one compact JSON value on its own line:
//!
//! - snapshot: `[d_0, d_1, ..., d_{n-1}]`, district ids by node
//! - delta: `[[nodes -> district 0], [nodes -> district 1], ...]`
//!
//! A delta keeps one list per district position; `[]` marks a district with
//! no arrivals. Ids are written in the chain's [`IndexConvention`].

use crate::convention::{IndexBase, IndexConvention};
use crate::types::{Delta, DistrictId, NodeId, PartitionState};
use serde::ser::{Serialize, Serializer};
use serde_json::Value;

/// Why a line was rejected.
pub type LineError = String;

struct ExternalNodes<'a> {
    nodes: &'a [NodeId],
    base: IndexBase,
}

impl Serialize for ExternalNodes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.nodes.iter().map(|&n| self.base.to_external(n as u64)))
    }
}

struct ExternalDelta<'a> {
    delta: &'a Delta,
    base: IndexBase,
}

impl Serialize for ExternalDelta<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.delta.arrivals().iter().map(|nodes| ExternalNodes {
            nodes,
            base: self.base,
        }))
    }
}

struct ExternalSnapshot<'a> {
    state: &'a PartitionState,
    base: IndexBase,
}

impl Serialize for ExternalSnapshot<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            self.state
                .assignment()
                .iter()
                .map(|&d| self.base.to_external(u64::from(d))),
        )
    }
}

/// Append the snapshot line for `state` (without terminator) to `out`.
pub fn encode_snapshot(
    state: &PartitionState,
    convention: IndexConvention,
    out: &mut Vec<u8>,
) -> serde_json::Result<()> {
    serde_json::to_writer(
        out,
        &ExternalSnapshot {
            state,
            base: convention.district_base,
        },
    )
}

/// Append the delta line for `delta` (without terminator) to `out`.
pub fn encode_delta(
    delta: &Delta,
    convention: IndexConvention,
    out: &mut Vec<u8>,
) -> serde_json::Result<()> {
    serde_json::to_writer(
        out,
        &ExternalDelta {
            delta,
            base: convention.node_base,
        },
    )
}

fn parse_value(line: &[u8]) -> Result<Value, LineError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    serde_json::from_slice(line).map_err(|e| format!("not valid JSON: {e}"))
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

fn parse_id(value: &Value, base: IndexBase, what: &str) -> Result<u64, LineError> {
    let id = value
        .as_u64()
        .ok_or_else(|| format!("{what} id must be a non-negative integer, got {value}"))?;
    base.to_internal(id)
        .ok_or_else(|| format!("{what} id {id} is below the index base"))
}

/// Parse a snapshot line into 0-based district ids.
pub fn parse_snapshot(line: &[u8], convention: IndexConvention) -> Result<Vec<DistrictId>, LineError> {
    let value = parse_value(line)?;
    let Value::Array(items) = value else {
        return Err(format!("expected a list of districts, got {}", describe(&value)));
    };
    if items.is_empty() {
        return Err("snapshot assigns no nodes".into());
    }

    items
        .iter()
        .map(|item| {
            let district = parse_id(item, convention.district_base, "district")?;
            DistrictId::try_from(district).map_err(|_| format!("district id {district} is too large"))
        })
        .collect()
}

/// Parse a delta line into per-district lists of 0-based node ids.
pub fn parse_delta(line: &[u8], convention: IndexConvention) -> Result<Vec<Vec<NodeId>>, LineError> {
    let value = parse_value(line)?;
    let Value::Array(districts) = value else {
        return Err(format!("expected a list of district lists, got {}", describe(&value)));
    };
    if districts.is_empty() {
        return Err("delta has no district positions".into());
    }

    districts
        .iter()
        .enumerate()
        .map(|(position, nodes)| {
            let Value::Array(nodes) = nodes else {
                return Err(format!(
                    "district position {position} must be a list of nodes, got {}",
                    describe(nodes)
                ));
            };
            nodes
                .iter()
                .map(|node| {
                    let node = parse_id(node, convention.node_base, "node")?;
                    NodeId::try_from(node).map_err(|_| format!("node id {node} is too large"))
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(districts: &[DistrictId]) -> PartitionState {
        PartitionState::new(districts.to_vec()).unwrap()
    }

    #[test]
    fn test_snapshot_uses_district_base() {
        let mut out = Vec::new();
        encode_snapshot(&state(&[0, 0, 1, 1]), IndexConvention::default(), &mut out).unwrap();
        assert_eq!(out, b"[1,1,2,2]");

        out.clear();
        encode_snapshot(&state(&[0, 0, 1, 1]), IndexConvention::zero_based(), &mut out).unwrap();
        assert_eq!(out, b"[0,0,1,1]");
    }

    #[test]
    fn test_delta_keeps_empty_positions() {
        let delta = Delta::between(&state(&[0, 0, 1, 1]), &state(&[1, 0, 1, 1])).unwrap();
        let mut out = Vec::new();
        encode_delta(&delta, IndexConvention::default(), &mut out).unwrap();
        assert_eq!(out, b"[[],[0]]");

        let one_based = IndexConvention {
            node_base: IndexBase::One,
            district_base: IndexBase::One,
        };
        out.clear();
        encode_delta(&delta, one_based, &mut out).unwrap();
        assert_eq!(out, b"[[],[1]]");
    }

    #[test]
    fn test_parse_snapshot() {
        let parsed = parse_snapshot(b"[1,1,2,2]\n", IndexConvention::default()).unwrap();
        assert_eq!(parsed, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_parse_snapshot_rejects_wrong_shapes() {
        let convention = IndexConvention::default();
        for line in [
            &b"42"[..],
            b"[]",
            b"{\"a\":1}",
            b"[1,\"2\"]",
            b"[1,-1]",
            b"[1,1.5]",
            b"[0,1]",
            b"[1,2",
        ] {
            assert!(parse_snapshot(line, convention).is_err(), "{:?}", line);
        }
    }

    #[test]
    fn test_parse_delta() {
        let parsed = parse_delta(b"[[],[0,3],[]]\n", IndexConvention::default()).unwrap();
        assert_eq!(parsed, vec![vec![], vec![0, 3], vec![]]);
    }

    #[test]
    fn test_parse_delta_rejects_wrong_shapes() {
        let convention = IndexConvention::default();
        for line in [&b"7"[..], b"[]", b"[1,2]", b"[[],3]", b"[[\"a\"]]", b"null"] {
            assert!(parse_delta(line, convention).is_err(), "{:?}", line);
        }
    }
}
