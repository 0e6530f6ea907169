pub mod error;
pub mod provider;

pub use error::{classify, FailureKind, ProviderError};
pub use provider::{HttpJsonMarketData, MarketDataGateway};
