//! Technology gating for recipes.
//!
//! The host's research system decides what is unlocked; the engine only asks.

use crate::id::TechId;
use std::collections::BTreeSet;

/// Answers whether a technology is unlocked.
pub trait TechnologyGate: Send {
    fn is_unlocked(&self, tech: &TechId) -> bool;
}

/// Gate that treats every technology as unlocked.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllUnlocked;

impl TechnologyGate for AllUnlocked {
    fn is_unlocked(&self, _tech: &TechId) -> bool {
        true
    }
}

/// Gate backed by an explicit set of unlocked technologies.
#[derive(Debug, Clone, Default)]
pub struct UnlockedTechnologies {
    unlocked: BTreeSet<TechId>,
}

impl UnlockedTechnologies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unlock(&mut self, tech: impl Into<TechId>) -> bool {
        self.unlocked.insert(tech.into())
    }

    pub fn lock(&mut self, tech: &str) -> bool {
        self.unlocked.remove(tech)
    }

    pub fn len(&self) -> usize {
        self.unlocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unlocked.is_empty()
    }
}

impl FromIterator<TechId> for UnlockedTechnologies {
    fn from_iter<I: IntoIterator<Item = TechId>>(iter: I) -> Self {
        Self {
            unlocked: iter.into_iter().collect(),
        }
    }
}

impl TechnologyGate for UnlockedTechnologies {
    fn is_unlocked(&self, tech: &TechId) -> bool {
        self.unlocked.contains(tech)
    }
}

impl<F> TechnologyGate for F
where
    F: Fn(&TechId) -> bool + Send,
{
    fn is_unlocked(&self, tech: &TechId) -> bool {
        self(tech)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_set_gates_by_membership() {
        let mut gate = UnlockedTechnologies::new();
        let fusion = TechId::from("fusion");
        assert!(!gate.is_unlocked(&fusion));
        gate.unlock("fusion");
        assert!(gate.is_unlocked(&fusion));
        assert!(gate.lock("fusion"));
        assert!(!gate.is_unlocked(&fusion));
    }

    #[test]
    fn closures_act_as_gates() {
        let gate = |tech: &TechId| tech.as_str().starts_with("basic");
        assert!(gate.is_unlocked(&TechId::from("basic-smelting")));
        assert!(!gate.is_unlocked(&TechId::from("warp")));
    }

    #[test]
    fn all_unlocked_allows_everything() {
        assert!(AllUnlocked.is_unlocked(&TechId::from("anything")));
    }
}
