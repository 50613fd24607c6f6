use serde::{Deserialize, Serialize};
use std::fmt;

use super::Trend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Buy,
    Sell,
    Hold,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Buy => "BUY",
            Decision::Sell => "SELL",
            Decision::Hold => "HOLD",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Validated, clipped output of the reasoning engine for a new-entry tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryVerdict {
    pub decision: Decision,
    pub confidence: f64,
    pub reasoning: String,
    pub suggested_leverage: u32,
    pub risk_level: RiskLevel,
    pub market_sentiment: Trend,
}

impl EntryVerdict {
    /// Conservative verdict used on transport failure, deadline or
    /// unparseable output.
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Hold,
            confidence: 0.1,
            reasoning: reason.into(),
            suggested_leverage: 5,
            risk_level: RiskLevel::Medium,
            market_sentiment: Trend::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionAction {
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "CLOSE_25")]
    Close25,
    #[serde(rename = "CLOSE_50")]
    Close50,
    #[serde(rename = "CLOSE_100")]
    Close100,
}

impl PositionAction {
    pub fn close_percentage(&self) -> Option<u8> {
        match self {
            PositionAction::Hold => None,
            PositionAction::Close25 => Some(25),
            PositionAction::Close50 => Some(50),
            PositionAction::Close100 => Some(100),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionAction::Hold => "HOLD",
            PositionAction::Close25 => "CLOSE_25",
            PositionAction::Close50 => "CLOSE_50",
            PositionAction::Close100 => "CLOSE_100",
        }
    }
}

/// Validated reasoning output while a position is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionVerdict {
    pub action: PositionAction,
    pub confidence: f64,
    pub reasoning: String,
    pub risk_level: RiskLevel,
}

impl PositionVerdict {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: PositionAction::Hold,
            confidence: 0.1,
            reasoning: reason.into(),
            risk_level: RiskLevel::Medium,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_percentage() {
        assert_eq!(PositionAction::Hold.close_percentage(), None);
        assert_eq!(PositionAction::Close25.close_percentage(), Some(25));
        assert_eq!(PositionAction::Close100.close_percentage(), Some(100));
    }

    #[test]
    fn test_conservative_hold() {
        let v = EntryVerdict::hold("timeout");
        assert_eq!(v.decision, Decision::Hold);
        assert!(v.confidence <= 0.1);
    }
}
