use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::domain::delegation::ApprovalDelegation;
use crate::domain::flow::FlowId;

pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 3;

#[derive(Clone, Copy, Debug)]
pub struct DelegationScope<'a> {
    pub entity_type: &'a str,
    pub flow_id: &'a FlowId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DelegationResolution {
    pub delegates: BTreeSet<String>,
    /// Set when the walk re-encountered a visited user. The non-cyclic
    /// prefix of the resolution still stands.
    pub cycle_detected: bool,
}

/// Pure, bounded-depth breadth-first resolution of effective delegates.
#[derive(Clone, Copy, Debug)]
pub struct DelegationResolver {
    max_depth: usize,
}

impl Default for DelegationResolver {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DELEGATION_DEPTH }
    }
}

impl DelegationResolver {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth: max_depth.max(1) }
    }

    /// Delegates holding the delegator's authority at instant `at`, walked
    /// transitively up to the depth bound. Cycles are broken by a visited
    /// set and reported as a configuration warning, never an error.
    pub fn effective_delegates(
        &self,
        delegations: &[ApprovalDelegation],
        delegator_id: &str,
        scope: DelegationScope<'_>,
        at: DateTime<Utc>,
    ) -> DelegationResolution {
        let mut resolution = DelegationResolution::default();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(delegator_id.to_string());

        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        frontier.push_back((delegator_id.to_string(), 0));

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= self.max_depth {
                continue;
            }
            for delegation in delegations {
                if delegation.delegator_id != current
                    || !delegation.active_at(at)
                    || !delegation.in_scope(scope.entity_type, scope.flow_id)
                {
                    continue;
                }
                if visited.contains(&delegation.delegate_id) {
                    resolution.cycle_detected = true;
                    tracing::warn!(
                        delegator = delegator_id,
                        revisited = delegation.delegate_id.as_str(),
                        delegation = delegation.id.0.as_str(),
                        "delegation walk revisited a user; truncating"
                    );
                    continue;
                }
                visited.insert(delegation.delegate_id.clone());
                resolution.delegates.insert(delegation.delegate_id.clone());
                frontier.push_back((delegation.delegate_id.clone(), depth + 1));
            }
        }

        resolution
    }
}
