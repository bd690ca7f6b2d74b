pub mod position_manager;

pub use position_manager::{
    size_qty, Position, PositionLifecycleManager, PositionStatus, TradeSettings, TrailingState,
};
