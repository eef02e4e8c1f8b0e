//! Retrieval gateway - ranked snippets from an external knowledge store.
//!
//! The pipeline only depends on [`Retriever`]. An empty result is a valid
//! answer and means the chapter is written without grounding.

mod http;
mod types;

pub use http::HttpRetriever;
pub use types::{ContextPack, ScopeFilter, Snippet};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetrievalError {
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),
}

/// Search contract consumed by the chapter generator.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `top_k` snippets for `query`, highest score first.
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        scope: Option<&ScopeFilter>,
    ) -> Result<Vec<Snippet>, RetrievalError>;
}

pub type SharedRetriever = Arc<dyn Retriever>;

/// Retriever used when no knowledge store is configured.
pub struct NoopRetriever;

#[async_trait]
impl Retriever for NoopRetriever {
    async fn search(
        &self,
        _query: &str,
        _top_k: usize,
        _scope: Option<&ScopeFilter>,
    ) -> Result<Vec<Snippet>, RetrievalError> {
        Ok(Vec::new())
    }
}

/// Sort descending by score and keep the first `top_k`.
pub fn rank(mut snippets: Vec<Snippet>, top_k: usize) -> Vec<Snippet> {
    snippets.sort_by(|a, b| b.score.total_cmp(&a.score));
    snippets.truncate(top_k);
    snippets
}
