//! Core types for partition chains.

use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node id within a graph, dense in `[0, n)`.
pub type NodeId = usize;

/// Internal (0-based) district id.
pub type DistrictId = u32;

/// Upper bound on district ids. Delta lines carry one position per district,
/// so ids must stay small.
pub const MAX_DISTRICTS: usize = 1 << 16;

/// Assignment of every node to exactly one district.
///
/// Ids are stored 0-based; the external base is applied by the line codec.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionState {
    assignment: Vec<DistrictId>,
}

impl PartitionState {
    /// Build a state from 0-based district ids, indexed by node.
    pub fn new(assignment: Vec<DistrictId>) -> Result<Self> {
        if assignment.is_empty() {
            return Err(ChainError::InvalidState(
                "partition must assign at least one node".into(),
            ));
        }
        if let Some((node, &district)) = assignment
            .iter()
            .enumerate()
            .find(|(_, d)| **d as usize >= MAX_DISTRICTS)
        {
            return Err(ChainError::InvalidState(format!(
                "node {node} has district {district}, limit is {MAX_DISTRICTS}"
            )));
        }
        Ok(Self { assignment })
    }

    /// Build a state from district ids written in `base`.
    pub fn from_external(
        districts: &[u64],
        base: crate::convention::IndexBase,
    ) -> Result<Self> {
        let assignment = districts
            .iter()
            .enumerate()
            .map(|(node, &district)| {
                base.to_internal(district)
                    .and_then(|d| DistrictId::try_from(d).ok())
                    .ok_or_else(|| {
                        ChainError::InvalidState(format!(
                            "node {node} has out-of-range district {district}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(assignment)
    }

    /// District ids written in `base`.
    pub fn to_external(&self, base: crate::convention::IndexBase) -> Vec<u64> {
        self.assignment
            .iter()
            .map(|&d| base.to_external(u64::from(d)))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.assignment.len()
    }

    /// One more than the largest district id in use.
    pub fn district_count(&self) -> usize {
        self.assignment
            .iter()
            .max()
            .map(|&d| d as usize + 1)
            .unwrap_or(0)
    }

    pub fn district(&self, node: NodeId) -> Option<DistrictId> {
        self.assignment.get(node).copied()
    }

    pub fn assignment(&self) -> &[DistrictId] {
        &self.assignment
    }

    pub(crate) fn assign(&mut self, node: NodeId, district: DistrictId) {
        self.assignment[node] = district;
    }
}

impl fmt::Debug for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionState({:?})", self.assignment)
    }
}

/// Nodes that changed district between two consecutive states, grouped by
/// their new district.
///
/// Position `i` holds the arrivals of internal district `i`. Districts with no
/// arrivals keep an empty list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    arrivals: Vec<Vec<NodeId>>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_arrivals(arrivals: Vec<Vec<NodeId>>) -> Self {
        Self { arrivals }
    }

    /// Compute the delta that turns `prev` into `next`.
    pub fn between(prev: &PartitionState, next: &PartitionState) -> Result<Self> {
        let mut delta = Self::new();
        delta.compute(prev, next)?;
        Ok(delta)
    }

    /// Recompute in place, reusing the existing list allocations.
    ///
    /// Fails if the states cover different numbers of nodes.
    pub fn compute(&mut self, prev: &PartitionState, next: &PartitionState) -> Result<()> {
        if prev.node_count() != next.node_count() {
            return Err(ChainError::InvalidState(format!(
                "delta between {} and {} nodes",
                prev.node_count(),
                next.node_count()
            )));
        }

        for nodes in &mut self.arrivals {
            nodes.clear();
        }
        self.arrivals.resize(next.district_count(), Vec::new());

        for (node, (&old, &new)) in prev
            .assignment
            .iter()
            .zip(next.assignment.iter())
            .enumerate()
        {
            if old != new {
                self.arrivals[new as usize].push(node);
            }
        }
        Ok(())
    }

    pub fn arrivals(&self) -> &[Vec<NodeId>] {
        &self.arrivals
    }

    /// Number of district positions, including empty ones.
    pub fn district_count(&self) -> usize {
        self.arrivals.len()
    }

    /// Number of nodes that moved.
    pub fn moved(&self) -> usize {
        self.arrivals.iter().map(Vec::len).sum()
    }

    /// True if no node moved.
    pub fn is_empty(&self) -> bool {
        self.arrivals.iter().all(Vec::is_empty)
    }

    /// Apply to `state`, moving every listed node into its district.
    pub fn apply(&self, state: &mut PartitionState) -> Result<()> {
        for (position, nodes) in self.arrivals.iter().enumerate() {
            if nodes.is_empty() {
                continue;
            }
            if position >= MAX_DISTRICTS {
                return Err(ChainError::InvalidState(format!(
                    "district position {position} out of range"
                )));
            }
            let district = position as DistrictId;
            for &node in nodes {
                if node >= state.node_count() {
                    return Err(ChainError::InvalidState(format!(
                        "node {node} is outside the partition ({} nodes)",
                        state.node_count()
                    )));
                }
                state.assign(node, district);
            }
        }
        Ok(())
    }
}

/// What follows the first snapshot line of a chain record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordMode {
    /// Every step after the first is a full snapshot.
    Snapshot,
    /// Every step after the first is a delta against the previous step.
    #[default]
    Delta,
}

/// Outcome of a completed recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    /// Number of states written.
    pub steps: u64,
    /// Unix seconds when the recorder was opened.
    pub start_timestamp: i64,
    /// Unix seconds when the recorder finished.
    pub end_timestamp: i64,
}
