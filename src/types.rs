// =============================================================================
// Core domain types shared across the trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Opaque instrument identifier drawn from the configured universe.
pub type Symbol = String;

/// Position / decision direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// The action an analyst, judge, or rule-based manager may recommend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
    Hold,
    Close,
    Reduce,
}

impl Action {
    /// CLOSE and REDUCE are exits: never suppressed by anti-churn, never
    /// blocked by the confidence floor.
    pub fn is_exit(self) -> bool {
        matches!(self, Action::Close | Action::Reduce)
    }

    pub fn is_entry(self) -> bool {
        matches!(self, Action::Buy | Action::Sell)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
            Action::Close => "CLOSE",
            Action::Reduce => "REDUCE",
        };
        write!(f, "{s}")
    }
}

/// Identifies an opinion-producing collaborator. `Collaborative` replaces the
/// donor's magic `"collaborative"` portfolio-id string with a typed variant
/// (Open Question c).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum AnalystId {
    Named(String),
    Collaborative,
    /// Sentinel winner for a FinalDecision with `action = HOLD`.
    None,
}

impl std::fmt::Display for AnalystId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalystId::Named(n) => write!(f, "{n}"),
            AnalystId::Collaborative => write!(f, "collaborative"),
            AnalystId::None => write!(f, "NONE"),
        }
    }
}

/// Margin mode forwarded to the exchange client on leverage/order calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarginMode::Cross => write!(f, "cross"),
            MarginMode::Isolated => write!(f, "isolated"),
        }
    }
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or a paper/demo account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_actions_are_close_and_reduce_only() {
        assert!(Action::Close.is_exit());
        assert!(Action::Reduce.is_exit());
        assert!(!Action::Buy.is_exit());
        assert!(!Action::Hold.is_exit());
    }

    #[test]
    fn side_opposite_round_trips() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite().opposite(), Side::Short);
    }
}
