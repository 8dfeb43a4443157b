//! Cache Tier Definitions
//!
//! Defines the two-tier hierarchy (in-process local tier, shared remote
//! tier) and the per-call tier selection.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Cache Tier
// =============================================================================

/// Cache tier representing the storage hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// In-process tier (fastest, bounded)
    Local,
    /// Shared remote key-value store (slower, larger)
    Remote,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Local => write!(f, "local"),
            CacheTier::Remote => write!(f, "remote"),
        }
    }
}

// =============================================================================
// Tier Selection
// =============================================================================

/// Which tier(s) an operation reads from and writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierSelection {
    Local,
    Remote,
    #[default]
    Both,
}

impl TierSelection {
    /// Whether the local tier takes part
    #[inline]
    pub fn includes_local(&self) -> bool {
        matches!(self, TierSelection::Local | TierSelection::Both)
    }

    /// Whether the remote tier takes part
    #[inline]
    pub fn includes_remote(&self) -> bool {
        matches!(self, TierSelection::Remote | TierSelection::Both)
    }
}

impl fmt::Display for TierSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierSelection::Local => write!(f, "local"),
            TierSelection::Remote => write!(f, "remote"),
            TierSelection::Both => write!(f, "both"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_display() {
        assert_eq!(CacheTier::Local.to_string(), "local");
        assert_eq!(CacheTier::Remote.to_string(), "remote");
        assert_eq!(TierSelection::Both.to_string(), "both");
    }

    #[test]
    fn test_selection_membership() {
        assert!(TierSelection::Both.includes_local());
        assert!(TierSelection::Both.includes_remote());
        assert!(TierSelection::Local.includes_local());
        assert!(!TierSelection::Local.includes_remote());
        assert!(!TierSelection::Remote.includes_local());
        assert!(TierSelection::Remote.includes_remote());
    }

    #[test]
    fn test_selection_serde() {
        let parsed: TierSelection = serde_json::from_str("\"remote\"").unwrap();
        assert_eq!(parsed, TierSelection::Remote);
        assert_eq!(TierSelection::default(), TierSelection::Both);
    }
}
