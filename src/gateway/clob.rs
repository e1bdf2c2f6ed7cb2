//! Polymarket CLOB gateway
//!
//! REST endpoints (https://docs.polymarket.com/developers/CLOB):
//! - `GET /book`, `GET /midpoint` (public)
//! - `POST /order`, `DELETE /order/{id}`, `DELETE /cancel-all`
//! - `GET /data/order/{id}`, `GET /data/orders`
//! - `GET /balance-allowance` for collateral and outcome tokens
//!
//! Authenticated calls carry L2 HMAC headers; orders are EIP-712 signed.
//! Merge and split go on-chain through the Conditional Tokens contract.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, Response,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::signing::{self, UnsignedOrder};
use super::{ExecutionGateway, OrderRequest, OrderStatusReport, PlacedOrder};
use crate::config::ExecutionConfig;
use crate::error::GatewayError;
use crate::types::{BookLevel, Market, OrderBook, OrderSide, Outcome};

abigen!(
    ConditionalTokens,
    r#"[
        function splitPosition(address collateralToken, bytes32 parentCollectionId, bytes32 conditionId, uint256[] partition, uint256 amount) external
        function mergePositions(address collateralToken, bytes32 parentCollectionId, bytes32 conditionId, uint256[] partition, uint256 amount) external
    ]"#
);

const CTF_ADDRESS: &str = "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045";
const USDC_ADDRESS: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";

/// Balances come back in 1e6 base units
const BASE_UNITS: f64 = 1_000_000.0;

type CtfClient = SignerMiddleware<Provider<Http>, LocalWallet>;

#[derive(Debug, Clone)]
struct ApiCredentials {
    address: String,
    api_key: String,
    api_secret: String,
    api_passphrase: String,
}

fn resolve_env(var_names: &[&str]) -> Option<String> {
    for var in var_names {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn parse_book_level(price: &str, size: &str) -> Option<BookLevel> {
    let price = price.parse::<f64>().ok()?;
    let size = size.parse::<f64>().ok()?;
    Some(BookLevel::new(price, size))
}

fn value_f64(raw: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match raw.get(*key) {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    })
}

fn value_str(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        raw.get(*key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    })
}

fn parse_order_report(raw: &Value) -> Option<OrderStatusReport> {
    let order_id = value_str(raw, &["id", "orderID", "order_id"])?;
    let side = match value_str(raw, &["side"])?.to_uppercase().as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        _ => return None,
    };
    Some(OrderStatusReport {
        order_id,
        token_id: value_str(raw, &["asset_id", "token_id"]).unwrap_or_default(),
        side,
        price: value_f64(raw, &["price"]).unwrap_or(0.0),
        original_size: value_f64(raw, &["original_size", "size"]).unwrap_or(0.0),
        size_matched: value_f64(raw, &["size_matched"]).unwrap_or(0.0),
        status: value_str(raw, &["status"]).unwrap_or_else(|| "UNKNOWN".to_string()),
    })
}

/// Map a non-success response to a gateway error
async fn check_status(response: Response, what: &str) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let detail = format!("{} failed: {} - {}", what, status, text);
    Err(match status.as_u16() {
        401 | 403 => GatewayError::Auth(detail),
        404 => GatewayError::NotFound(detail),
        429 | 500..=599 => GatewayError::Transient(detail),
        400 => GatewayError::from_rejection(&text),
        _ => GatewayError::Rejected(detail),
    })
}

fn malformed(what: &str, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Transient(format!("malformed {} response: {}", what, err))
}

/// Unauthenticated market-data endpoints
pub struct PublicClob {
    client: Client,
    base_url: String,
}

impl PublicClob {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get_book(&self, token_id: &str) -> Result<OrderBook, GatewayError> {
        #[derive(Deserialize)]
        struct BookEntry {
            price: String,
            size: String,
        }

        #[derive(Deserialize)]
        struct BookResponse {
            #[serde(default)]
            bids: Vec<BookEntry>,
            #[serde(default)]
            asks: Vec<BookEntry>,
            #[serde(default)]
            tick_size: Option<String>,
        }

        let response = self
            .client
            .get(format!("{}/book?token_id={}", self.base_url, token_id))
            .send()
            .await?;
        let response = check_status(response, "get_book").await?;
        let resp: BookResponse = response.json().await.map_err(|e| malformed("book", e))?;

        let bids = resp
            .bids
            .iter()
            .filter_map(|e| parse_book_level(&e.price, &e.size))
            .collect();
        let asks = resp
            .asks
            .iter()
            .filter_map(|e| parse_book_level(&e.price, &e.size))
            .collect();
        let mut book = OrderBook::new(token_id, bids, asks);
        if let Some(tick) = resp.tick_size.and_then(|t| t.parse::<f64>().ok()) {
            book.tick_size = tick;
        }
        Ok(book)
    }

    pub async fn get_midpoint(&self, token_id: &str) -> Result<f64, GatewayError> {
        #[derive(Deserialize)]
        struct MidpointResponse {
            mid: String,
        }

        let response = self
            .client
            .get(format!("{}/midpoint?token_id={}", self.base_url, token_id))
            .send()
            .await?;
        let response = check_status(response, "get_midpoint").await?;
        let resp: MidpointResponse = response.json().await.map_err(|e| malformed("midpoint", e))?;
        resp.mid.parse().map_err(|e| malformed("midpoint", e))
    }
}

/// Live gateway against the Polymarket CLOB
pub struct ClobGateway {
    client: Client,
    public: PublicClob,
    base_url: String,
    chain_id: u64,
    signature_type: u8,
    wallet: LocalWallet,
    credentials: ApiCredentials,
    ctf: ConditionalTokens<CtfClient>,
    collateral: Address,
}

impl ClobGateway {
    /// Build from `PRIVATE_KEY` and API credentials in the environment,
    /// deriving L2 credentials through L1 auth when they are absent.
    pub async fn connect(cfg: &ExecutionConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        let private_key = resolve_env(&["PRIVATE_KEY"]).context("PRIVATE_KEY not set")?;
        let wallet: LocalWallet = private_key
            .parse::<LocalWallet>()
            .context("Invalid PRIVATE_KEY")?
            .with_chain_id(cfg.chain_id);

        let address = resolve_env(&["POLYMARKET_ADDRESS"])
            .unwrap_or_else(|| format!("{:#x}", wallet.address()));
        let base_url = cfg.clob_url.trim_end_matches('/').to_string();

        let credentials = match (
            resolve_env(&["POLY_API_KEY", "POLYMARKET_API_KEY"]),
            resolve_env(&["POLY_API_SECRET", "POLYMARKET_API_SECRET"]),
            resolve_env(&["POLY_API_PASSPHRASE", "POLYMARKET_API_PASSPHRASE"]),
        ) {
            (Some(api_key), Some(api_secret), Some(api_passphrase)) => ApiCredentials {
                address,
                api_key,
                api_secret,
                api_passphrase,
            },
            _ => {
                info!("API credentials not configured, deriving via L1 auth");
                let (api_key, api_secret, api_passphrase) =
                    derive_api_credentials(&client, &base_url, &wallet, cfg.chain_id).await?;
                ApiCredentials {
                    address,
                    api_key,
                    api_secret,
                    api_passphrase,
                }
            }
        };

        let provider = Provider::<Http>::try_from(cfg.polygon_rpc_url.as_str())
            .context("Invalid polygon_rpc_url")?;
        let signer = Arc::new(SignerMiddleware::new(provider, wallet.clone()));
        let ctf_address: Address = CTF_ADDRESS.parse().context("invalid CTF address")?;
        let collateral: Address = USDC_ADDRESS.parse().context("invalid USDC address")?;

        let public = PublicClob::new(&base_url, Duration::from_millis(cfg.request_timeout_ms))?;

        Ok(Self {
            client,
            public,
            base_url,
            chain_id: cfg.chain_id,
            signature_type: cfg.signature_type,
            ctf: ConditionalTokens::new(ctf_address, signer),
            wallet,
            credentials,
            collateral,
        })
    }

    fn l2_headers(&self, method: &str, request_path: &str, body: &str) -> Result<HeaderMap, GatewayError> {
        let timestamp = Utc::now().timestamp();
        let signature = signing::create_l2_signature(
            &self.credentials.api_secret,
            timestamp,
            method,
            request_path,
            body,
        )
        .map_err(|e| GatewayError::Auth(e.to_string()))?;

        let header = |value: &str| {
            HeaderValue::from_str(value).map_err(|e| GatewayError::Auth(e.to_string()))
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("POLY_ADDRESS", header(&self.credentials.address)?);
        headers.insert("POLY_SIGNATURE", header(&signature)?);
        headers.insert("POLY_TIMESTAMP", header(&timestamp.to_string())?);
        headers.insert("POLY_API_KEY", header(&self.credentials.api_key)?);
        headers.insert("POLY_PASSPHRASE", header(&self.credentials.api_passphrase)?);
        Ok(headers)
    }

    async fn authed_get(&self, request_path: &str, what: &str) -> Result<Value, GatewayError> {
        let headers = self.l2_headers("GET", request_path, "")?;
        let response = self
            .client
            .get(format!("{}{}", self.base_url, request_path))
            .headers(headers)
            .send()
            .await?;
        let response = check_status(response, what).await?;
        response.json().await.map_err(|e| malformed(what, e))
    }

    async fn authed_delete(&self, request_path: &str, body: &str, what: &str) -> Result<(), GatewayError> {
        let headers = self.l2_headers("DELETE", request_path, body)?;
        let mut request = self
            .client
            .delete(format!("{}{}", self.base_url, request_path))
            .headers(headers);
        if !body.is_empty() {
            request = request.body(body.to_string());
        }
        check_status(request.send().await?, what).await?;
        Ok(())
    }

    fn condition_id(market: &Market) -> Result<[u8; 32], GatewayError> {
        market
            .id
            .parse::<H256>()
            .map(|h| h.0)
            .map_err(|e| GatewayError::Rejected(format!("invalid condition id {}: {}", market.id, e)))
    }

    fn base_units(size: f64) -> U256 {
        U256::from((size.max(0.0) * BASE_UNITS).floor() as u128)
    }
}

/// Create or derive L2 credentials (POST /auth/api-key, then GET /auth/derive-api-key)
async fn derive_api_credentials(
    client: &Client,
    base_url: &str,
    wallet: &LocalWallet,
    chain_id: u64,
) -> Result<(String, String, String)> {
    let timestamp = Utc::now().timestamp();
    let nonce = 0u64;
    let signature = signing::create_l1_signature(wallet, chain_id, timestamp, nonce).await?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "POLY_ADDRESS",
        HeaderValue::from_str(&format!("{:#x}", wallet.address()))
            .context("Invalid POLY_ADDRESS header value")?,
    );
    headers.insert(
        "POLY_SIGNATURE",
        HeaderValue::from_str(&signature).context("Invalid POLY_SIGNATURE header value")?,
    );
    headers.insert(
        "POLY_TIMESTAMP",
        HeaderValue::from_str(&timestamp.to_string()).context("Invalid POLY_TIMESTAMP")?,
    );
    headers.insert(
        "POLY_NONCE",
        HeaderValue::from_str(&nonce.to_string()).context("Invalid POLY_NONCE")?,
    );

    let create = client
        .post(format!("{}/auth/api-key", base_url))
        .headers(headers.clone())
        .body("{}")
        .send()
        .await
        .context("Failed POST /auth/api-key")?;

    let raw: Value = if create.status().is_success() {
        create.json().await.context("Failed parsing /auth/api-key response")?
    } else {
        let derive = client
            .get(format!("{}/auth/derive-api-key", base_url))
            .headers(headers)
            .send()
            .await
            .context("Failed GET /auth/derive-api-key")?;
        if !derive.status().is_success() {
            anyhow::bail!(
                "L1 auth endpoints failed: create {}, derive {}",
                create.status(),
                derive.status()
            );
        }
        derive
            .json()
            .await
            .context("Failed parsing /auth/derive-api-key response")?
    };

    let data = raw.get("data").unwrap_or(&raw);
    let api_key = value_str(data, &["apiKey", "api_key", "key"]).context("Missing api key")?;
    let api_secret = value_str(data, &["secret", "apiSecret"]).context("Missing api secret")?;
    let passphrase =
        value_str(data, &["passphrase", "apiPassphrase"]).context("Missing passphrase")?;
    Ok((api_key, api_secret, passphrase))
}

#[async_trait]
impl ExecutionGateway for ClobGateway {
    fn name(&self) -> &'static str {
        "clob"
    }

    async fn get_book(&self, token_id: &str) -> Result<OrderBook, GatewayError> {
        self.public.get_book(token_id).await
    }

    async fn get_midpoint(&self, token_id: &str) -> Result<f64, GatewayError> {
        self.public.get_midpoint(token_id).await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, GatewayError> {
        let (maker_amount, taker_amount) =
            signing::order_amounts(request.side, request.price, request.size, request.tick_size)
                .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        let maker: Address = self
            .credentials
            .address
            .parse()
            .map_err(|e| GatewayError::Auth(format!("invalid maker address: {}", e)))?;

        let order = UnsignedOrder {
            salt: U256::from(rand::random::<u64>()),
            maker,
            token_id: request.token_id.clone(),
            maker_amount,
            taker_amount,
            expiration: 0,
            nonce: 0,
            side: request.side,
            signature_type: self.signature_type,
        };
        let signature = signing::sign_order(&order, &self.wallet, self.chain_id)
            .await
            .map_err(|e| GatewayError::Auth(e.to_string()))?;

        let maker_hex = format!("{:#x}", maker);
        let payload = serde_json::json!({
            "order": {
                "salt": order.salt.to_string(),
                "maker": maker_hex,
                "signer": format!("{:#x}", self.wallet.address()),
                "taker": signing::ZERO_ADDRESS,
                "tokenId": order.token_id,
                "makerAmount": order.maker_amount.to_string(),
                "takerAmount": order.taker_amount.to_string(),
                "expiration": "0",
                "nonce": "0",
                "feeRateBps": "0",
                "side": request.side.to_string(),
                "signatureType": order.signature_type,
                "signature": signature
            },
            "owner": self.credentials.api_key,
            "orderType": "GTC",
            "postOnly": request.post_only
        });
        let body = payload.to_string();
        let request_path = "/order";
        let headers = self.l2_headers("POST", request_path, &body)?;

        debug!(
            token = %request.token_id,
            side = %request.side,
            price = %signing::price_string(request.price, request.tick_size),
            size = request.size,
            post_only = request.post_only,
            "Submitting CLOB order"
        );

        let response = self
            .client
            .post(format!("{}{}", self.base_url, request_path))
            .headers(headers)
            .body(body)
            .send()
            .await?;
        let response = check_status(response, "place_order").await?;
        let raw: Value = response.json().await.map_err(|e| malformed("order", e))?;

        if let Some(err) = value_str(&raw, &["errorMsg", "error"]) {
            return Err(GatewayError::from_rejection(&err));
        }
        if raw.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(GatewayError::Rejected(raw.to_string()));
        }
        let order_id = value_str(&raw, &["orderID", "orderId", "order_id", "id"])
            .ok_or_else(|| malformed("order", format!("missing order id in {}", raw)))?;
        let status = value_str(&raw, &["status"]).unwrap_or_else(|| "LIVE".to_string());
        // makingAmount is denominated in what the maker gives
        let size_matched = if status.eq_ignore_ascii_case("MATCHED") {
            match request.side {
                OrderSide::Buy => value_f64(&raw, &["takingAmount"]),
                OrderSide::Sell => value_f64(&raw, &["makingAmount"]),
            }
            .unwrap_or(0.0)
        } else {
            0.0
        };

        Ok(PlacedOrder {
            order_id,
            size_matched,
            status,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let body = serde_json::json!({ "orderID": order_id }).to_string();
        self.authed_delete("/order", &body, "cancel_order").await
    }

    async fn cancel_all(&self) -> Result<(), GatewayError> {
        self.authed_delete("/cancel-all", "", "cancel_all").await
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderStatusReport, GatewayError> {
        let raw = self
            .authed_get(&format!("/data/order/{}", order_id), "get_order")
            .await?;
        let data = raw.get("data").unwrap_or(&raw);
        if data.is_null() {
            return Err(GatewayError::NotFound(order_id.to_string()));
        }
        parse_order_report(data).ok_or_else(|| malformed("order status", data.to_string()))
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderStatusReport>, GatewayError> {
        let raw = self.authed_get("/data/orders", "get_open_orders").await?;
        let items = match &raw {
            Value::Array(items) => items.clone(),
            other => other
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        };
        let orders: Vec<OrderStatusReport> = items.iter().filter_map(parse_order_report).collect();
        if orders.len() < items.len() {
            warn!(
                parsed = orders.len(),
                total = items.len(),
                "Skipped unparseable open orders"
            );
        }
        Ok(orders)
    }

    async fn get_balance(&self) -> Result<f64, GatewayError> {
        let path = format!(
            "/balance-allowance?asset_type=COLLATERAL&signature_type={}",
            self.signature_type
        );
        let raw = self.authed_get(&path, "get_balance").await?;
        value_f64(&raw, &["balance", "available", "amount"])
            .map(|units| units / BASE_UNITS)
            .ok_or_else(|| malformed("balance", raw.to_string()))
    }

    async fn get_token_balance(
        &self,
        market: &Market,
        outcome: Outcome,
    ) -> Result<f64, GatewayError> {
        let path = format!(
            "/balance-allowance?asset_type=CONDITIONAL&token_id={}&signature_type={}",
            market.token(outcome),
            self.signature_type
        );
        let raw = self.authed_get(&path, "get_token_balance").await?;
        value_f64(&raw, &["balance", "available", "amount"])
            .map(|units| units / BASE_UNITS)
            .ok_or_else(|| malformed("token balance", raw.to_string()))
    }

    async fn merge_positions(&self, market: &Market, size: f64) -> Result<(), GatewayError> {
        let condition = Self::condition_id(market)?;
        let call = self.ctf.merge_positions(
            self.collateral,
            [0u8; 32],
            condition,
            vec![U256::from(1u8), U256::from(2u8)],
            Self::base_units(size),
        );
        let pending = call
            .send()
            .await
            .map_err(|e| GatewayError::from_rejection(&e.to_string()))?;
        let receipt = pending
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        info!(
            market = %market.id,
            size = size,
            tx = ?receipt.map(|r| r.transaction_hash),
            "Merged complete sets"
        );
        Ok(())
    }

    async fn split_position(&self, market: &Market, size: f64) -> Result<(), GatewayError> {
        let condition = Self::condition_id(market)?;
        let call = self.ctf.split_position(
            self.collateral,
            [0u8; 32],
            condition,
            vec![U256::from(1u8), U256::from(2u8)],
            Self::base_units(size),
        );
        let pending = call
            .send()
            .await
            .map_err(|e| GatewayError::from_rejection(&e.to_string()))?;
        let receipt = pending
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        info!(
            market = %market.id,
            size = size,
            tx = ?receipt.map(|r| r.transaction_hash),
            "Split collateral into complete sets"
        );
        Ok(())
    }
}
