//! Strategy identifiers.

use super::error::StrategyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    EvenOdd,
    OverUnder,
    Matches,
    Differs,
    RiseFall,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::EvenOdd,
        StrategyKind::OverUnder,
        StrategyKind::Matches,
        StrategyKind::Differs,
        StrategyKind::RiseFall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::EvenOdd => "even_odd",
            StrategyKind::OverUnder => "over_under",
            StrategyKind::Matches => "matches",
            StrategyKind::Differs => "differs",
            StrategyKind::RiseFall => "rise_fall",
        }
    }

    /// Slot in per-kind tables ordered like [`StrategyKind::ALL`].
    pub(crate) fn index(self) -> usize {
        match self {
            StrategyKind::EvenOdd => 0,
            StrategyKind::OverUnder => 1,
            StrategyKind::Matches => 2,
            StrategyKind::Differs => 3,
            StrategyKind::RiseFall => 4,
        }
    }

    /// Strategy started after a max-loss stop when switching is enabled.
    pub fn partner(&self) -> Option<StrategyKind> {
        match self {
            StrategyKind::EvenOdd => Some(StrategyKind::OverUnder),
            StrategyKind::OverUnder => Some(StrategyKind::EvenOdd),
            _ => None,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = StrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "even_odd" | "evenodd" => Ok(StrategyKind::EvenOdd),
            "over_under" | "overunder" => Ok(StrategyKind::OverUnder),
            "matches" | "match" => Ok(StrategyKind::Matches),
            "differs" | "differ" => Ok(StrategyKind::Differs),
            "rise_fall" | "risefall" => Ok(StrategyKind::RiseFall),
            _ => Err(StrategyError::UnknownStrategy(s.to_string())),
        }
    }
}
