//! Spot price feed for the directional model
//!
//! Binance REST: `ticker/price` for the live spot and daily `klines` for the
//! close history that feeds the EWMA volatility estimate. Histories are cached
//! for five minutes per coin.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const HISTORY_TTL: Duration = Duration::from_secs(300);

#[async_trait]
pub trait SpotFeed: Send + Sync {
    async fn spot_price(&self, coin: &str) -> Result<f64>;

    /// Last `n` daily closes, oldest first
    async fn daily_closes(&self, coin: &str, n: usize) -> Result<Vec<f64>>;
}

fn trading_pair(coin: &str) -> String {
    format!("{}USDT", coin.to_uppercase())
}

pub struct BinanceSpotFeed {
    client: Client,
    base_url: String,
    history: Mutex<HashMap<String, (Instant, Vec<f64>)>>,
}

impl BinanceSpotFeed {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            history: Mutex::new(HashMap::new()),
        })
    }

    async fn fetch_closes(&self, coin: &str, n: usize) -> Result<Vec<f64>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval=1d&limit={}",
            self.base_url,
            trading_pair(coin),
            n.max(1)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch klines from Binance")?;
        if !response.status().is_success() {
            bail!("Binance klines returned error: {}", response.status());
        }

        // [[open_time, open, high, low, close, volume, close_time, ...], ...]
        let klines: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("Failed to parse Binance klines response")?;
        Ok(parse_closes(&klines))
    }
}

fn parse_closes(klines: &[Vec<serde_json::Value>]) -> Vec<f64> {
    klines
        .iter()
        .filter_map(|kline| kline.get(4)?.as_str()?.parse::<f64>().ok())
        .filter(|close| close.is_finite() && *close > 0.0)
        .collect()
}

#[async_trait]
impl SpotFeed for BinanceSpotFeed {
    async fn spot_price(&self, coin: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct TickerResponse {
            price: String,
        }

        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url,
            trading_pair(coin)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch Binance ticker")?;
        if !response.status().is_success() {
            bail!("Binance ticker returned error: {}", response.status());
        }
        let ticker: TickerResponse = response
            .json()
            .await
            .context("Failed to parse Binance ticker")?;
        ticker.price.parse().context("Invalid ticker price")
    }

    async fn daily_closes(&self, coin: &str, n: usize) -> Result<Vec<f64>> {
        let key = coin.to_uppercase();
        {
            let cache = self.history.lock().await;
            if let Some((fetched_at, closes)) = cache.get(&key) {
                if fetched_at.elapsed() < HISTORY_TTL && closes.len() >= n {
                    debug!(coin = %key, cached = closes.len(), "Using cached spot history");
                    return Ok(closes[closes.len() - n..].to_vec());
                }
            }
        }

        let closes = self.fetch_closes(&key, n).await?;
        info!(coin = %key, count = closes.len(), "📥 Spot history refreshed");
        self.history
            .lock()
            .await
            .insert(key, (Instant::now(), closes.clone()));
        Ok(closes)
    }
}

/// Fixed prices, for paper runs without network access and for tests
#[derive(Debug, Clone, Default)]
pub struct FixedSpotFeed {
    pub prices: HashMap<String, f64>,
    pub closes: HashMap<String, Vec<f64>>,
}

impl FixedSpotFeed {
    pub fn with_coin(mut self, coin: &str, spot: f64, closes: Vec<f64>) -> Self {
        self.prices.insert(coin.to_uppercase(), spot);
        self.closes.insert(coin.to_uppercase(), closes);
        self
    }
}

#[async_trait]
impl SpotFeed for FixedSpotFeed {
    async fn spot_price(&self, coin: &str) -> Result<f64> {
        self.prices
            .get(&coin.to_uppercase())
            .copied()
            .with_context(|| format!("no spot price for {}", coin))
    }

    async fn daily_closes(&self, coin: &str, n: usize) -> Result<Vec<f64>> {
        let closes = self
            .closes
            .get(&coin.to_uppercase())
            .with_context(|| format!("no history for {}", coin))?;
        let start = closes.len().saturating_sub(n);
        Ok(closes[start..].to_vec())
    }
}
