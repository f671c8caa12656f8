//! Fork choice: highest cumulative work, bounded reorg depth

use serde::Serialize;

use super::validation::ValidationError;
use crate::constants::MAX_REORG_DEPTH;

/// Decides whether a competing branch replaces the current chain
#[derive(Debug, Clone, Copy)]
pub struct ReorgDetector {
    pub max_depth: u64,
}

impl Default for ReorgDetector {
    fn default() -> Self {
        Self {
            max_depth: MAX_REORG_DEPTH,
        }
    }
}

/// Summary of a performed reorg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReorgInfo {
    pub fork_height: u64,
    pub old_tip_height: u64,
    pub new_tip_height: u64,
    pub blocks_removed: u64,
    pub blocks_added: u64,
}

impl ReorgInfo {
    pub fn new(fork_height: u64, old_tip_height: u64, new_tip_height: u64) -> Self {
        Self {
            fork_height,
            old_tip_height,
            new_tip_height,
            blocks_removed: old_tip_height.saturating_sub(fork_height),
            blocks_added: new_tip_height.saturating_sub(fork_height),
        }
    }
}

impl ReorgDetector {
    /// Ok if the branch forking at `common_height` should replace our chain
    ///
    /// Depth is checked before work, so an over-deep branch is refused even
    /// when it is heavier.
    pub fn evaluate(
        &self,
        current_height: u64,
        current_work: u128,
        common_height: u64,
        branch_work: u128,
    ) -> Result<(), ValidationError> {
        let depth = current_height.saturating_sub(common_height);
        if depth > self.max_depth {
            return Err(ValidationError::ReorgTooDeep {
                depth,
                max: self.max_depth,
            });
        }
        if branch_work <= current_work {
            return Err(ValidationError::InsufficientWork);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heavier_shallow_branch_accepted() {
        let d = ReorgDetector::default();
        assert!(d.evaluate(50, 1_000, 45, 1_001).is_ok());
    }

    #[test]
    fn test_deep_branch_refused_even_if_heavier() {
        let d = ReorgDetector::default();
        assert_eq!(
            d.evaluate(160, 1_000, 10, u128::MAX),
            Err(ValidationError::ReorgTooDeep { depth: 150, max: 100 })
        );
        assert!(d.evaluate(110, 1_000, 10, 1_001).is_ok());
    }

    #[test]
    fn test_equal_work_keeps_current() {
        let d = ReorgDetector::default();
        assert_eq!(d.evaluate(10, 500, 9, 500), Err(ValidationError::InsufficientWork));
    }

    #[test]
    fn test_reorg_info() {
        let info = ReorgInfo::new(10, 15, 17);
        assert_eq!(info.blocks_removed, 5);
        assert_eq!(info.blocks_added, 7);
    }
}
