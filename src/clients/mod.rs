// Exchange transports and the gateway in front of them

pub mod gateway;
pub mod mexc;
pub mod paper;
pub mod rate_limit;

pub use gateway::{ExchangeApi, ExchangeGateway, FillCursor, TradeRecord};
pub use mexc::MexcClient;
pub use paper::{PaperExchange, PaperOp};
pub use rate_limit::TokenBucket;
