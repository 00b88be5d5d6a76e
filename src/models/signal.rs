//! Trade signal vocabulary returned by the decision oracle.

use serde::{Deserialize, Serialize};

use super::PositionSide;

/// Closed signal vocabulary; anything else from the oracle is a parse
/// failure and degrades to `Hold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSignal {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
}

impl TradeSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSignal::OpenLong => "open_long",
            TradeSignal::OpenShort => "open_short",
            TradeSignal::CloseLong => "close_long",
            TradeSignal::CloseShort => "close_short",
            TradeSignal::Hold => "hold",
        }
    }

    /// The position side this signal acts on (`None` for holds).
    pub fn side(&self) -> Option<PositionSide> {
        match self {
            TradeSignal::OpenLong | TradeSignal::CloseLong => Some(PositionSide::Long),
            TradeSignal::OpenShort | TradeSignal::CloseShort => Some(PositionSide::Short),
            TradeSignal::Hold => None,
        }
    }

    /// The signal that closes a position on the given side.
    pub fn closing(side: PositionSide) -> Self {
        match side {
            PositionSide::Long => TradeSignal::CloseLong,
            PositionSide::Short => TradeSignal::CloseShort,
        }
    }
}

impl std::fmt::Display for TradeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
