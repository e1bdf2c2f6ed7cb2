//! Market universe
//!
//! - [`GammaMarketSource`]: active binary markets from the Gamma API, filtered
//!   for market making, plus crypto threshold markets whose strike is parsed
//!   from the question text
//! - [`StaticMarketSource`]: markets listed in configuration

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::MarketSpec;
use crate::types::{Market, ThresholdDirection, ThresholdMarket, DEFAULT_TICK};

const CACHE_TTL: Duration = Duration::from_secs(600);
const PAGE_LIMIT: usize = 100;
const MAX_PAGES: usize = 20;

#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Binary markets eligible for two-sided quoting
    async fn quoting_markets(&self) -> Result<Vec<Market>>;

    /// Crypto threshold markets for the directional strategy
    async fn threshold_markets(&self) -> Result<Vec<ThresholdMarket>>;
}

/// Market from Gamma API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketResponse {
    pub condition_id: String,
    pub question: String,
    /// JSON string like "[\"Yes\", \"No\"]"
    #[serde(default, deserialize_with = "deserialize_json_string_opt")]
    pub outcomes: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_json_string_opt")]
    pub clob_token_ids: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_json_string_opt")]
    pub outcome_prices: Vec<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub enable_order_book: Option<bool>,
    #[serde(default)]
    pub order_price_min_tick_size: Option<f64>,
    #[serde(default)]
    pub volume_24hr: Option<f64>,
    #[serde(default)]
    pub liquidity_num: Option<f64>,
}

/// Helper to deserialize optional JSON string arrays
fn deserialize_json_string_opt<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        Some(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
        None => Ok(Vec::new()),
    }
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        })
}

impl MarketResponse {
    /// Binary market with both token ids, or None
    pub fn to_market(&self) -> Option<Market> {
        if self.clob_token_ids.len() != 2 || self.outcomes.len() != 2 {
            return None;
        }
        // Outcomes are usually ["Yes", "No"]; respect the order if reversed
        let (yes_idx, no_idx) = if self.outcomes[0].eq_ignore_ascii_case("no") {
            (1, 0)
        } else {
            (0, 1)
        };
        Some(Market {
            id: self.condition_id.clone(),
            question: self.question.clone(),
            yes_token: self.clob_token_ids[yes_idx].clone(),
            no_token: self.clob_token_ids[no_idx].clone(),
            tick_size: self.order_price_min_tick_size.unwrap_or(DEFAULT_TICK),
            end_date: parse_time(self.end_date.as_deref()),
            created_at: parse_time(self.created_at.as_deref()),
        })
    }

    fn yes_price(&self) -> Option<f64> {
        self.outcome_prices.first()?.parse().ok()
    }
}

/// Coin ticker, strike and direction from questions like
/// "Will BTC be above $70,000 on June 30?" or "Ethereum below 2.5k?"
pub fn parse_threshold_question(question: &str) -> Option<(String, f64, ThresholdDirection)> {
    let lower = question.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '?')
        .filter(|w| !w.is_empty())
        .collect();

    let coin_pos = words.iter().position(|w| {
        matches!(
            w.trim_matches(|c: char| !c.is_alphanumeric()),
            "btc" | "bitcoin" | "eth" | "ethereum"
        )
    })?;
    let coin = match words[coin_pos].trim_matches(|c: char| !c.is_alphanumeric()) {
        "btc" | "bitcoin" => "BTC",
        _ => "ETH",
    };

    let mut direction = None;
    let mut strike = None;
    for word in &words[coin_pos + 1..] {
        if direction.is_none() {
            direction = match *word {
                "above" | "over" | "reach" | "hit" | "exceed" | ">" | ">=" => {
                    Some(ThresholdDirection::Above)
                }
                "below" | "under" | "<" | "<=" => Some(ThresholdDirection::Below),
                _ => None,
            };
            continue;
        }
        if let Some(value) = parse_strike(word) {
            strike = Some(value);
            break;
        }
    }

    let strike = strike?;
    let min_strike = if coin == "BTC" { 1_000.0 } else { 50.0 };
    if strike < min_strike {
        debug!(question, strike, "Skipping implausible strike");
        return None;
    }
    Some((coin.to_string(), strike, direction?))
}

fn parse_strike(word: &str) -> Option<f64> {
    let cleaned: String = word
        .trim_start_matches('$')
        .trim_end_matches(|c: char| c == ',' || c == '.')
        .replace(',', "");
    if !cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let (number, multiplier) = match cleaned.chars().last()? {
        'k' => (&cleaned[..cleaned.len() - 1], 1_000.0),
        'm' => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        'b' => (&cleaned[..cleaned.len() - 1], 1_000_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };
    number.parse::<f64>().ok().map(|v| v * multiplier)
}

struct Cached {
    fetched_at: Instant,
    markets: Vec<MarketResponse>,
}

/// Gamma-backed market discovery with a 10-minute cache
pub struct GammaMarketSource {
    client: Client,
    gamma_url: String,
    max_markets: usize,
    cache: Mutex<Option<Cached>>,
}

impl GammaMarketSource {
    pub fn new(gamma_url: &str, max_markets: usize, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            gamma_url: gamma_url.trim_end_matches('/').to_string(),
            max_markets,
            cache: Mutex::new(None),
        })
    }

    async fn fetch_page(&self, offset: usize) -> Result<Vec<MarketResponse>> {
        let url = format!(
            "{}/markets?closed=false&active=true&limit={}&offset={}",
            self.gamma_url, PAGE_LIMIT, offset
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch markets")?;
        if !response.status().is_success() {
            bail!("Failed to get markets: {}", response.status());
        }
        response
            .json()
            .await
            .context("Failed to parse markets response")
    }

    async fn active_markets(&self) -> Result<Vec<MarketResponse>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Ok(cached.markets.clone());
            }
        }

        let mut all = Vec::new();
        for page in 0..MAX_PAGES {
            match self.fetch_page(page * PAGE_LIMIT).await {
                Ok(batch) => {
                    let done = batch.len() < PAGE_LIMIT;
                    all.extend(batch);
                    if done {
                        break;
                    }
                }
                Err(e) if !all.is_empty() => {
                    warn!(offset = page * PAGE_LIMIT, error = %e, "Gamma pagination stopped early");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        info!(count = all.len(), "Fetched active markets from Gamma");
        *cache = Some(Cached {
            fetched_at: Instant::now(),
            markets: all.clone(),
        });
        Ok(all)
    }
}

#[async_trait]
impl MarketSource for GammaMarketSource {
    async fn quoting_markets(&self) -> Result<Vec<Market>> {
        let raw = self.active_markets().await?;
        let mut candidates: Vec<(f64, Market)> = raw
            .iter()
            .filter(|m| m.enable_order_book != Some(false) && m.closed != Some(true))
            .filter(|m| matches!(m.yes_price(), Some(p) if (0.02..=0.98).contains(&p)))
            .filter(|m| parse_threshold_question(&m.question).is_none())
            .filter_map(|m| Some((m.volume_24hr.unwrap_or(0.0), m.to_market()?)))
            .collect();
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(candidates
            .into_iter()
            .take(self.max_markets)
            .map(|(_, m)| m)
            .collect())
    }

    async fn threshold_markets(&self) -> Result<Vec<ThresholdMarket>> {
        let raw = self.active_markets().await?;
        let now = Utc::now();
        Ok(raw
            .iter()
            .filter(|m| m.enable_order_book != Some(false))
            .filter_map(|m| {
                let (coin, strike, direction) = parse_threshold_question(&m.question)?;
                let market = m.to_market()?;
                // Needs a future expiry for the time-scaled model
                if market.end_date.map_or(true, |end| end <= now) {
                    return None;
                }
                Some(ThresholdMarket {
                    market,
                    coin,
                    strike,
                    direction,
                })
            })
            .collect())
    }
}

/// Markets fixed in configuration
#[derive(Debug, Clone, Default)]
pub struct StaticMarketSource {
    quoting: Vec<Market>,
    threshold: Vec<ThresholdMarket>,
}

impl StaticMarketSource {
    pub fn new(quoting: Vec<Market>, threshold: Vec<ThresholdMarket>) -> Self {
        Self { quoting, threshold }
    }

    pub fn from_specs(specs: &[MarketSpec]) -> Result<Self> {
        let mut source = Self::default();
        for spec in specs {
            let end_date = match spec.end_date.as_deref() {
                Some(raw) => Some(
                    parse_time(Some(raw))
                        .with_context(|| format!("invalid end_date '{}' for {}", raw, spec.id))?,
                ),
                None => None,
            };
            let market = Market {
                id: spec.id.clone(),
                question: spec.question.clone(),
                yes_token: spec.yes_token.clone(),
                no_token: spec.no_token.clone(),
                tick_size: spec.tick_size,
                end_date,
                created_at: None,
            };
            match &spec.threshold {
                Some(t) => {
                    let direction = match t.direction.to_lowercase().as_str() {
                        "above" => ThresholdDirection::Above,
                        "below" => ThresholdDirection::Below,
                        other => bail!("invalid threshold direction '{}' for {}", other, spec.id),
                    };
                    source.threshold.push(ThresholdMarket {
                        market,
                        coin: t.coin.to_uppercase(),
                        strike: t.strike,
                        direction,
                    });
                }
                None => source.quoting.push(market),
            }
        }
        Ok(source)
    }
}

#[async_trait]
impl MarketSource for StaticMarketSource {
    async fn quoting_markets(&self) -> Result<Vec<Market>> {
        Ok(self.quoting.clone())
    }

    async fn threshold_markets(&self) -> Result<Vec<ThresholdMarket>> {
        Ok(self.threshold.clone())
    }
}
