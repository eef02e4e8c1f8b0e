//! HTTP client for the knowledge-store search endpoint.
//!
//! `GET {base}/search-drawings?query=..&top_k=..[&project=..]` answering
//! `{"results": [{"content": "...", "score": 0.8, "source": "..."}]}`.
//! Results without a score keep the server's order.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::types::{ScopeFilter, Snippet};
use super::{rank, RetrievalError, Retriever};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRetriever {
    client: Client,
    base_url: String,
}

impl HttpRetriever {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn search_url(&self, query: &str, top_k: usize, scope: Option<&ScopeFilter>) -> String {
        let mut url = format!(
            "{}/search-drawings?query={}&top_k={}",
            self.base_url,
            urlencoding::encode(query),
            top_k
        );
        if let Some(project) = scope.and_then(|s| s.project.as_deref()) {
            url.push_str(&format!("&project={}", urlencoding::encode(project)));
        }
        url
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        scope: Option<&ScopeFilter>,
    ) -> Result<Vec<Snippet>, RetrievalError> {
        let url = self.search_url(query, top_k, scope);
        tracing::debug!("Searching knowledge store: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RetrievalError::Unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Unavailable(format!(
                "search returned {}: {}",
                status, body
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RetrievalError::Unavailable(format!("failed to read body: {}", e)))?;
        parse_results(&body, top_k)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default, alias = "text")]
    content: String,
    #[serde(default, alias = "similarity")]
    score: Option<f64>,
    #[serde(default)]
    source: Option<String>,
}

fn parse_results(body: &str, top_k: usize) -> Result<Vec<Snippet>, RetrievalError> {
    let parsed: SearchResponse = serde_json::from_str(body)
        .map_err(|e| RetrievalError::Unavailable(format!("malformed search response: {}", e)))?;

    let count = parsed.results.len().max(1) as f64;
    let snippets = parsed
        .results
        .into_iter()
        .enumerate()
        .filter(|(_, hit)| !hit.content.trim().is_empty())
        .map(|(i, hit)| Snippet {
            text: hit.content,
            score: hit.score.unwrap_or(1.0 - i as f64 / count),
            source: hit.source,
        })
        .collect();

    Ok(rank(snippets, top_k))
}
