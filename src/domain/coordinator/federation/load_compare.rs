use std::cmp::Ordering;

use crate::domain::coordinator::federation::gateway::ProviderCandidate;

/// Compares provider candidates by the load known to this gateway. It only
/// takes reservations into account that this gateway routed itself, so the
/// ordering may differ from the providers' real load ordering.
#[derive(Debug, Default)]
pub struct CandidateLoadCompare;

impl CandidateLoadCompare {
    /// Returns `Ordering::Less` if `a` should be preferred over `b`.
    ///
    /// Note: if the loads of `a` and `b` are equal, their registration
    /// indices (configuration order) decide.
    pub fn compare(&self, a: &ProviderCandidate, b: &ProviderCandidate) -> Ordering {
        match a.outstanding.cmp(&b.outstanding) {
            Ordering::Equal => a.registration_index.cmp(&b.registration_index),
            ord => ord,
        }
    }
}
