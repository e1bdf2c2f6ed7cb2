//! EIP-712 order signing and CLOB request authentication

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip712::{EIP712Domain, Eip712DomainType, TypedData, Types};
use ethers::types::{Address, U256};
use hmac::{Hmac, Mac};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde_json::Value;
use sha2::Sha256;

use crate::types::OrderSide;

const CTF_EXCHANGE_DOMAIN: &str = "Polymarket CTF Exchange";
const CLOB_AUTH_DOMAIN: &str = "ClobAuthDomain";
const DOMAIN_VERSION: &str = "1";
const CLOB_AUTH_MESSAGE: &str = "This message attests that I control the given wallet";

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

fn exchange_address(chain_id: u64) -> Result<Address> {
    match chain_id {
        137 => "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E"
            .parse()
            .context("invalid Polygon exchange address constant"),
        80002 => "0xdFE02Eb6733538f8Ea35D585af8DE5958AD99E40"
            .parse()
            .context("invalid Amoy exchange address constant"),
        _ => bail!("Unsupported chain_id {} for CLOB order signing", chain_id),
    }
}

/// Order fields covered by the exchange signature
#[derive(Debug, Clone)]
pub struct UnsignedOrder {
    pub salt: U256,
    pub maker: Address,
    pub token_id: String,
    pub maker_amount: U256,
    pub taker_amount: U256,
    pub expiration: u64,
    pub nonce: u64,
    pub side: OrderSide,
    pub signature_type: u8,
}

/// Maker/taker amounts in 1e6 base units.
///
/// Price is rounded to the tick, shares to 2 dp and notional to 4 dp before
/// scaling so the exchange sees exact tick multiples.
/// BUY gives USDC for shares, SELL gives shares for USDC.
pub fn order_amounts(side: OrderSide, price: f64, size: f64, tick: f64) -> Result<(U256, U256)> {
    let tick_dp = tick_decimals(tick);
    let price = Decimal::from_f64(price)
        .context("price not representable")?
        .round_dp(tick_dp);
    let shares = Decimal::from_f64(size.max(0.0))
        .context("size not representable")?
        .round_dp_with_strategy(2, RoundingStrategy::ToZero);
    let usdc = (shares * price).round_dp(4);

    let scale = dec!(1_000_000);
    let shares_scaled = (shares * scale)
        .trunc()
        .to_u128()
        .context("share amount overflow")?;
    let usdc_scaled = (usdc * scale)
        .trunc()
        .to_u128()
        .context("usdc amount overflow")?;

    Ok(match side {
        OrderSide::Buy => (U256::from(usdc_scaled), U256::from(shares_scaled)),
        OrderSide::Sell => (U256::from(shares_scaled), U256::from(usdc_scaled)),
    })
}

/// Decimal places implied by a tick size (0.01 -> 2, 0.001 -> 3)
pub fn tick_decimals(tick: f64) -> u32 {
    if tick <= 0.0 {
        return 2;
    }
    (-tick.log10()).ceil().max(0.0) as u32
}

/// Render a price at tick precision for the order payload
pub fn price_string(price: f64, tick: f64) -> String {
    Decimal::from_f64(price)
        .map(|d| d.round_dp(tick_decimals(tick)).normalize().to_string())
        .unwrap_or_else(|| format!("{:.2}", price))
}

fn field(name: &str, ty: &str) -> Eip712DomainType {
    Eip712DomainType {
        name: name.to_string(),
        r#type: ty.to_string(),
    }
}

fn order_typed_data(order: &UnsignedOrder, chain_id: u64) -> Result<TypedData> {
    let token_id = U256::from_dec_str(&order.token_id)
        .with_context(|| format!("Invalid token_id '{}' for order signing", order.token_id))?;

    let domain = EIP712Domain {
        name: Some(CTF_EXCHANGE_DOMAIN.to_string()),
        version: Some(DOMAIN_VERSION.to_string()),
        chain_id: Some(chain_id.into()),
        verifying_contract: Some(exchange_address(chain_id)?),
        salt: None,
    };

    let mut types: Types = BTreeMap::new();
    types.insert(
        "Order".to_string(),
        vec![
            field("salt", "uint256"),
            field("maker", "address"),
            field("signer", "address"),
            field("taker", "address"),
            field("tokenId", "uint256"),
            field("makerAmount", "uint256"),
            field("takerAmount", "uint256"),
            field("expiration", "uint256"),
            field("nonce", "uint256"),
            field("feeRateBps", "uint256"),
            field("side", "uint8"),
            field("signatureType", "uint8"),
        ],
    );

    let maker = format!("{:#x}", order.maker);
    let mut message = BTreeMap::<String, Value>::new();
    message.insert("salt".into(), Value::String(order.salt.to_string()));
    message.insert("maker".into(), Value::String(maker.clone()));
    message.insert("signer".into(), Value::String(maker));
    message.insert("taker".into(), Value::String(ZERO_ADDRESS.to_string()));
    message.insert("tokenId".into(), Value::String(token_id.to_string()));
    message.insert(
        "makerAmount".into(),
        Value::String(order.maker_amount.to_string()),
    );
    message.insert(
        "takerAmount".into(),
        Value::String(order.taker_amount.to_string()),
    );
    message.insert(
        "expiration".into(),
        Value::String(order.expiration.to_string()),
    );
    message.insert("nonce".into(), Value::String(order.nonce.to_string()));
    message.insert("feeRateBps".into(), Value::String("0".to_string()));
    message.insert(
        "side".into(),
        Value::from(match order.side {
            OrderSide::Buy => 0_u8,
            OrderSide::Sell => 1_u8,
        }),
    );
    message.insert("signatureType".into(), Value::from(order.signature_type));

    Ok(TypedData {
        domain,
        types,
        primary_type: "Order".to_string(),
        message,
    })
}

fn hex_signature(sig: String) -> String {
    if sig.starts_with("0x") {
        sig
    } else {
        format!("0x{}", sig)
    }
}

/// Sign an order with EIP-712, returning the 0x-prefixed signature
pub async fn sign_order(order: &UnsignedOrder, wallet: &LocalWallet, chain_id: u64) -> Result<String> {
    let typed = order_typed_data(order, chain_id)?;
    let signature = wallet
        .sign_typed_data(&typed)
        .await
        .context("Failed to sign order typed data")?;
    Ok(hex_signature(signature.to_string()))
}

/// L1 signature for the `/auth/*` endpoints
pub async fn create_l1_signature(
    wallet: &LocalWallet,
    chain_id: u64,
    timestamp: i64,
    nonce: u64,
) -> Result<String> {
    let domain = EIP712Domain {
        name: Some(CLOB_AUTH_DOMAIN.to_string()),
        version: Some(DOMAIN_VERSION.to_string()),
        chain_id: Some(chain_id.into()),
        verifying_contract: None,
        salt: None,
    };

    let mut types: Types = BTreeMap::new();
    types.insert(
        "ClobAuth".to_string(),
        vec![
            field("address", "address"),
            field("timestamp", "string"),
            field("nonce", "uint256"),
            field("message", "string"),
        ],
    );

    let mut message = BTreeMap::<String, Value>::new();
    message.insert(
        "address".into(),
        Value::String(format!("{:#x}", wallet.address())),
    );
    message.insert("timestamp".into(), Value::String(timestamp.to_string()));
    message.insert("nonce".into(), Value::String(nonce.to_string()));
    message.insert(
        "message".into(),
        Value::String(CLOB_AUTH_MESSAGE.to_string()),
    );

    let typed = TypedData {
        domain,
        types,
        primary_type: "ClobAuth".to_string(),
        message,
    };
    let sig = wallet
        .sign_typed_data(&typed)
        .await
        .context("Failed to sign L1 auth typed data")?;
    Ok(hex_signature(sig.to_string()))
}

/// L2 HMAC-SHA256 over `timestamp + METHOD + path + body`
pub fn create_l2_signature(
    api_secret: &str,
    timestamp: i64,
    method: &str,
    request_path: &str,
    body: &str,
) -> Result<String> {
    let secret_bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(api_secret)
        .or_else(|_| general_purpose::URL_SAFE.decode(api_secret))
        .context("Failed decoding API secret as url-safe base64")?;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(&secret_bytes).context("Failed to initialize HMAC")?;
    let payload = format!(
        "{}{}{}{}",
        timestamp,
        method.to_uppercase(),
        request_path,
        body
    );
    mac.update(payload.as_bytes());
    Ok(general_purpose::URL_SAFE.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0x59c6995e998f97a5a0044966f0945387dc9f5a59e86cdc84e64546a1d8f76d59";

    #[test]
    fn buy_amounts_are_usdc_for_shares() {
        let (maker, taker) = order_amounts(OrderSide::Buy, 0.47, 10.0, 0.01).unwrap();
        assert_eq!(maker, U256::from(4_700_000u64));
        assert_eq!(taker, U256::from(10_000_000u64));

        let (maker, taker) = order_amounts(OrderSide::Sell, 0.47, 10.0, 0.01).unwrap();
        assert_eq!(maker, U256::from(10_000_000u64));
        assert_eq!(taker, U256::from(4_700_000u64));
    }

    #[test]
    fn price_string_uses_tick_precision() {
        assert_eq!(price_string(0.1 + 0.2, 0.01), "0.3");
        assert_eq!(price_string(0.4567, 0.001), "0.457");
    }

    #[tokio::test]
    async fn sign_order_sets_hex_signature() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let (maker_amount, taker_amount) = order_amounts(OrderSide::Buy, 0.5, 10.0, 0.01).unwrap();
        let order = UnsignedOrder {
            salt: U256::from(7u64),
            maker: wallet.address(),
            token_id: "1".to_string(),
            maker_amount,
            taker_amount,
            expiration: 0,
            nonce: 0,
            side: OrderSide::Buy,
            signature_type: 0,
        };
        let sig = sign_order(&order, &wallet, 137).await.unwrap();
        assert!(sig.starts_with("0x"));
        assert!(sig.len() >= 130);
    }

    #[test]
    fn l2_signature_is_deterministic() {
        let secret = general_purpose::URL_SAFE.encode(b"secret-bytes");
        let a = create_l2_signature(&secret, 1_700_000_000, "get", "/data/orders", "").unwrap();
        let b = create_l2_signature(&secret, 1_700_000_000, "GET", "/data/orders", "").unwrap();
        assert_eq!(a, b);
    }
}
