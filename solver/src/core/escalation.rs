//! Model-tier escalation across solve attempts.

use anyhow::{Result, bail};

use crate::core::types::ModelTier;

/// Ordered tiers consulted by attempt index.
///
/// Attempts past the end of the list repeat the last tier. The final attempt
/// of several runs on the strongest tier in the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationPolicy {
    tiers: Vec<ModelTier>,
}

impl EscalationPolicy {
    /// The first tier must be the cheapest tier listed.
    pub fn new(tiers: Vec<ModelTier>) -> Result<Self> {
        let Some(first) = tiers.first().copied() else {
            bail!("escalation must list at least one tier");
        };
        if tiers.iter().any(|tier| *tier < first) {
            bail!("escalation must start with its cheapest tier (got {first} first)");
        }
        Ok(Self { tiers })
    }

    /// Tier for the zero-based `attempt` out of `max_attempts`.
    pub fn tier_for(&self, attempt: u32, max_attempts: u32) -> ModelTier {
        if attempt > 0 && attempt + 1 >= max_attempts {
            return self.strongest();
        }
        let index = usize::try_from(attempt).unwrap_or(usize::MAX);
        self.tiers
            .get(index)
            .or(self.tiers.last())
            .copied()
            .unwrap_or(ModelTier::Fast)
    }

    pub fn strongest(&self) -> ModelTier {
        self.tiers.iter().max().copied().unwrap_or(ModelTier::Fast)
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![ModelTier::Fast, ModelTier::Strong],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_escalates_then_repeats() {
        let policy = EscalationPolicy::default();
        assert_eq!(policy.tier_for(0, 3), ModelTier::Fast);
        assert_eq!(policy.tier_for(1, 3), ModelTier::Strong);
        assert_eq!(policy.tier_for(2, 3), ModelTier::Strong);
        assert_eq!(policy.tier_for(7, 10), ModelTier::Strong);
    }

    #[test]
    fn final_attempt_uses_strongest_even_if_list_is_longer() {
        let policy = EscalationPolicy::new(vec![
            ModelTier::Fast,
            ModelTier::Fast,
            ModelTier::Fast,
            ModelTier::Strong,
        ])
        .expect("policy");
        assert_eq!(policy.tier_for(0, 3), ModelTier::Fast);
        assert_eq!(policy.tier_for(1, 3), ModelTier::Fast);
        assert_eq!(policy.tier_for(2, 3), ModelTier::Strong);
    }

    #[test]
    fn single_attempt_uses_first_tier() {
        let policy = EscalationPolicy::default();
        assert_eq!(policy.tier_for(0, 1), ModelTier::Fast);
    }

    #[test]
    fn rejects_empty_or_descending_lists() {
        assert!(EscalationPolicy::new(Vec::new()).is_err());
        assert!(EscalationPolicy::new(vec![ModelTier::Strong, ModelTier::Fast]).is_err());
        assert!(EscalationPolicy::new(vec![ModelTier::Strong]).is_ok());
    }
}
