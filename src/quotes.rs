//! # quotes — Quote Source Port
//!
//! The quote feed is an external collaborator: it may be stale, slow or
//! down entirely. Everything here degrades to `None` — a missing quote is
//! never fatal, the pricing fallback chain (see [`crate::engine::pricing`])
//! absorbs it.
//!
//! ## Adapters
//! - [`HttpQuoteSource`] — JSON feed over HTTP with a hard per-request
//!   timeout
//! - [`StaticQuoteSource`] — in-memory map for mock mode and tests

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

// ─── Quote ────────────────────────────────────────────────────────────────────

/// Ephemeral market snapshot for one instrument token. Never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub last_trade_price: f64,
    pub prev_close_price: f64,
    /// When this snapshot was received; staleness is bounded by the caller.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl Quote {
    pub fn new(last_trade_price: f64, prev_close_price: f64) -> Self {
        Self {
            last_trade_price,
            prev_close_price,
            received_at: Utc::now(),
        }
    }

    /// True when the snapshot is older than `bound_secs`.
    pub fn is_stale(&self, bound_secs: i64) -> bool {
        (Utc::now() - self.received_at).num_seconds() > bound_secs
    }
}

// ─── Port ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Latest quote for `token`, or `None` when unavailable. Implementations
    /// must bound their own network calls — a slow feed must not stall the
    /// tick scan.
    async fn get_quote(&self, token: i64) -> Option<Quote>;

    /// Ask the feed to stream the given tokens. Best effort; failures are
    /// logged, not raised.
    async fn ensure_subscribed(&self, tokens: &[i64]);
}

// ─── HttpQuoteSource ──────────────────────────────────────────────────────────

/// Quote feed spoken over plain HTTP/JSON.
///
/// `GET {base}/quotes/{token}` → `{ "last_trade_price": f64,
/// "prev_close_price": f64 }`, `POST {base}/subscribe` with
/// `{ "tokens": [..] }`.
pub struct HttpQuoteSource {
    client:   reqwest::Client,
    base_url: String,
    timeout:  Duration,
}

#[derive(Debug, Deserialize)]
struct QuoteBody {
    last_trade_price: f64,
    prev_close_price: f64,
}

impl HttpQuoteSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn get_quote(&self, token: i64) -> Option<Quote> {
        let url = format!("{}/quotes/{token}", self.base_url);

        let response = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(token, error = %e, "Quote feed unreachable — degrading to fallbacks");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(token, status = %response.status(), "Quote feed returned non-success");
            return None;
        }

        match response.json::<QuoteBody>().await {
            Ok(body) => Some(Quote::new(body.last_trade_price, body.prev_close_price)),
            Err(e) => {
                warn!(token, error = %e, "Quote payload parse failed");
                None
            }
        }
    }

    async fn ensure_subscribed(&self, tokens: &[i64]) {
        if tokens.is_empty() {
            return;
        }
        let url = format!("{}/subscribe", self.base_url);
        let result = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "tokens": tokens }))
            .timeout(self.timeout)
            .send()
            .await;

        if let Err(e) = result {
            warn!(count = tokens.len(), error = %e, "Quote subscribe failed — feed will lag");
        }
    }
}

// ─── StaticQuoteSource ────────────────────────────────────────────────────────

/// In-memory quote map. Backs `QUOTE_FEED_URL=mock` and the test suite.
#[derive(Default)]
pub struct StaticQuoteSource {
    quotes:     RwLock<HashMap<i64, Quote>>,
    subscribed: RwLock<HashSet<i64>>,
}

impl StaticQuoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_quote(&self, token: i64, quote: Quote) {
        self.quotes.write().await.insert(token, quote);
    }

    pub async fn remove_quote(&self, token: i64) {
        self.quotes.write().await.remove(&token);
    }

    pub async fn subscribed_tokens(&self) -> HashSet<i64> {
        self.subscribed.read().await.clone()
    }
}

#[async_trait]
impl QuoteSource for StaticQuoteSource {
    async fn get_quote(&self, token: i64) -> Option<Quote> {
        self.quotes.read().await.get(&token).copied()
    }

    async fn ensure_subscribed(&self, tokens: &[i64]) {
        let mut subscribed = self.subscribed.write().await;
        for t in tokens {
            subscribed.insert(*t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_source_round_trip() {
        let source = StaticQuoteSource::new();
        source.set_quote(42, Quote::new(101.5, 99.0)).await;

        let q = source.get_quote(42).await.unwrap();
        assert_eq!(q.last_trade_price, 101.5);
        assert_eq!(q.prev_close_price, 99.0);
        assert!(source.get_quote(7).await.is_none());

        source.ensure_subscribed(&[42, 7]).await;
        assert_eq!(source.subscribed_tokens().await.len(), 2);
    }

    #[test]
    fn staleness_bound() {
        let mut q = Quote::new(100.0, 99.0);
        assert!(!q.is_stale(60));
        q.received_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(q.is_stale(60));
    }
}
