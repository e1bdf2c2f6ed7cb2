//! HTTP oracle backed by a hosted language-model messages API

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{
    extract_json, AdvisoryOracle, AnalysisContext, AnalysisReport, EntryContext, ExitContext,
    GuardMarketContext, GuardReport, OracleVerdict,
};
use crate::config::OracleConfig;
use crate::error::OracleError;

const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 600;

const SYSTEM_PROMPT: &str = "You are a risk reviewer for an automated Polymarket trading engine. \
Answer only with a single JSON object matching the requested schema.";

pub struct HttpOracle {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl HttpOracle {
    pub fn from_config(cfg: &OracleConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env)
            .with_context(|| format!("{} not set for advisory oracle", cfg.api_key_env))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("Failed to create oracle HTTP client")?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            api_key,
            model: cfg.model.clone(),
        })
    }

    async fn ask<T: DeserializeOwned>(&self, prompt: String) -> Result<T, OracleError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": SYSTEM_PROMPT,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout(0)
                } else {
                    OracleError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(OracleError::Transport(format!(
                "status {}",
                response.status()
            )));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        let text: String = parsed.content.into_iter().map(|b| b.text).collect();
        debug!(chars = text.len(), "Oracle response received");

        let value = extract_json(&text)
            .ok_or_else(|| OracleError::Malformed("no JSON object in response".to_string()))?;
        serde_json::from_value(value).map_err(|e| OracleError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl AdvisoryOracle for HttpOracle {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn validate_entry(&self, ctx: &EntryContext) -> Result<OracleVerdict, OracleError> {
        let context = serde_json::to_string(ctx).map_err(|e| OracleError::Malformed(e.to_string()))?;
        let prompt = format!(
            "A Student-t volatility model found a persistent edge on a crypto threshold market.\n\
             Context: {}\n\
             Consider volatility regime, scheduled catalysts and whether the market price \
             reflects information the model lacks.\n\
             Respond with {{\"approve\": true/false, \"confidence\": 0.0-1.0, \"rationale\": \"brief\"}}",
            context
        );
        self.ask(prompt).await
    }

    async fn confirm_exit(&self, ctx: &ExitContext) -> Result<OracleVerdict, OracleError> {
        let context = serde_json::to_string(ctx).map_err(|e| OracleError::Malformed(e.to_string()))?;
        let prompt = format!(
            "The model edge on an open directional position has reversed.\n\
             Context: {}\n\
             Should the position be closed now?\n\
             Respond with {{\"approve\": true/false, \"confidence\": 0.0-1.0, \"rationale\": \"brief\"}}",
            context
        );
        self.ask(prompt).await
    }

    async fn guard_markets(
        &self,
        markets: &[GuardMarketContext],
    ) -> Result<GuardReport, OracleError> {
        let blocks: Vec<String> = markets
            .iter()
            .map(|m| {
                let mut block = format!("Market: {}\nQuestion: {}\n", m.market_id, m.question);
                if let Some(hours) = m.hours_old {
                    block.push_str(&format!("Listed {:.1}h ago\n", hours));
                }
                block
            })
            .collect();
        let prompt = format!(
            "We provide two-sided liquidity on these markets:\n{}\n\
             For each, check for resolution-clause traps (ambiguous wording, unusual sources) \
             and imminent catalysts that could gap the price.\n\
             Respond with {{\"warnings\": [\"...\"], \"kill_markets\": [\"market id\", ...]}}. \
             Only list a market in kill_markets for a concrete, serious risk.",
            blocks.join("---\n")
        );
        self.ask(prompt).await
    }

    async fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisReport, OracleError> {
        let context = serde_json::to_string(ctx).map_err(|e| OracleError::Malformed(e.to_string()))?;
        let prompt = format!(
            "Review recent performance of a crypto-directional strategy (Student-t model, \
             EWMA volatility, fractional Kelly sizing).\n\
             Stats: {}\n\
             Respond with {{\"summary\": \"...\", \"parameter_suggestions\": {{\
             \"min_edge_pts\": null or value, \"kelly_fraction\": null or value, \
             \"student_t_nu\": null or value, \"stop_loss_pts\": null or value, \
             \"take_profit_pts\": null or value}}}}. Use null when no change is needed.",
            context
        );
        self.ask(prompt).await
    }
}
