//! Domain models for trading models, positions, signals and snapshots.

mod model;
mod position;
mod signal;
mod snapshot;

pub use model::TradingModel;
pub use position::{Position, PositionSide};
pub use signal::TradeSignal;
pub use snapshot::{AccountSnapshot, PositionView};
