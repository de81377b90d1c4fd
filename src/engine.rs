use crate::types::SentimentScores;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Engine {
    /// Class probabilities for `text`, aligned to `Sentiment::ORDER`.
    async fn predict(&self, text: String) -> Result<SentimentScores>;
}
