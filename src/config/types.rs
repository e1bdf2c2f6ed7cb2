//! Configuration enums

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which market-making pricing model produces quotes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingModel {
    Legacy,
    #[serde(alias = "avellaneda-stoikov", alias = "as")]
    AvellanedaStoikov,
}

impl Default for PricingModel {
    fn default() -> Self {
        PricingModel::Legacy
    }
}

impl fmt::Display for PricingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricingModel::Legacy => write!(f, "legacy"),
            PricingModel::AvellanedaStoikov => write!(f, "avellaneda_stoikov"),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

/// A market listed directly in configuration (paper mode / fixed universe)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSpec {
    pub id: String,
    #[serde(default)]
    pub question: String,
    pub yes_token: String,
    pub no_token: String,
    #[serde(default = "default_tick")]
    pub tick_size: f64,
    /// RFC 3339 resolution time
    #[serde(default)]
    pub end_date: Option<String>,
    /// Set for crypto threshold markets traded by the directional strategy
    #[serde(default)]
    pub threshold: Option<ThresholdSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub coin: String,
    pub strike: f64,
    /// "above" or "below"
    pub direction: String,
}

fn default_tick() -> f64 {
    0.01
}
