//! Index conventions for serialized node and district ids.
//!
//! Everything inside the crate works on 0-based ids. The base used in a
//! record line is a fixed property of the chain and is only applied when a
//! line is written or parsed.

use serde::{Deserialize, Serialize};

/// Numeric base of an id as it appears in a record line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexBase {
    #[default]
    Zero,
    One,
}

impl IndexBase {
    /// Offset added to an internal id.
    pub fn offset(self) -> u64 {
        match self {
            IndexBase::Zero => 0,
            IndexBase::One => 1,
        }
    }

    pub fn to_external(self, id: u64) -> u64 {
        id + self.offset()
    }

    /// Returns `None` for ids below the base (e.g. `0` in a 1-based record).
    pub fn to_internal(self, id: u64) -> Option<u64> {
        id.checked_sub(self.offset())
    }
}

/// Convert an internal id to its external form.
pub fn to_external(id: u64, base: IndexBase) -> u64 {
    base.to_external(id)
}

/// Convert an external id back to the internal form.
pub fn to_internal(id: u64, base: IndexBase) -> Option<u64> {
    base.to_internal(id)
}

/// Bases used for node ids and district ids of one chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexConvention {
    pub node_base: IndexBase,
    pub district_base: IndexBase,
}

impl Default for IndexConvention {
    /// 0-based nodes, 1-based districts.
    fn default() -> Self {
        Self {
            node_base: IndexBase::Zero,
            district_base: IndexBase::One,
        }
    }
}

impl IndexConvention {
    /// Both bases zero.
    pub fn zero_based() -> Self {
        Self {
            node_base: IndexBase::Zero,
            district_base: IndexBase::Zero,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_one_based_rejects_zero() {
        assert_eq!(to_internal(0, IndexBase::One), None);
        assert_eq!(to_internal(1, IndexBase::One), Some(0));
        assert_eq!(to_internal(0, IndexBase::Zero), Some(0));
    }

    #[test]
    fn test_default_convention() {
        let convention = IndexConvention::default();
        assert_eq!(convention.node_base, IndexBase::Zero);
        assert_eq!(convention.district_base, IndexBase::One);
    }

    proptest! {
        #[test]
        fn prop_internal_inverts_external(id in 0u64..u64::MAX - 1, one in any::<bool>()) {
            let base = if one { IndexBase::One } else { IndexBase::Zero };
            prop_assert_eq!(to_internal(to_external(id, base), base), Some(id));
        }
    }
}
