//! Reference price feeds (gold, BTC, ...)

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReferenceError {
    #[error("Feed {feed} unavailable: {message}")]
    Unavailable { feed: String, message: String },
}

#[async_trait]
pub trait ReferencePriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_price(&self) -> Result<f64, ReferenceError>;
}
