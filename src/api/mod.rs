pub mod bybit;
pub mod gateway;

pub use bybit::BybitClient;
pub use gateway::{ExchangeGateway, OrderRef, OrderRequest, OrderType, PositionSnapshot};
