//! Venue order adapters.
//!
//! The coordinator and hedger speak two small traits, mockable for tests.
//! Live implementations: Kalshi REST with RSA-PSS-signed headers, and the
//! Polymarket CLOB SDK with an EIP-712 local signer on Polygon.
//!
//! Both venues return fills synchronously for the order styles the engine
//! uses: Kalshi limit IOC reports taker fills in the order response, and a
//! Polymarket FOK either matches in full or dies.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::kalshi_ws::KalshiSigner;
use common::models::{Fill, Side};

/// Order placement attempts for transient venue errors (5xx, timeouts).
const MAX_ORDER_ATTEMPTS: u32 = 3;

/// Kalshi order entry. Limit IOC is the only aggressive style the engine
/// uses; passive limits exist for the hedger's fade strategy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KalshiOrderAdapter: Send + Sync {
    /// Aggressive limit priced at the implied ask, immediate-or-cancel.
    /// Returns whatever filled immediately.
    async fn place_limit_ioc(
        &self,
        ticker: &str,
        side: Side,
        price_cents: u32,
        qty: u64,
    ) -> Result<Fill>;

    /// Passive limit resting for `wait`, then cancelled. Returns the
    /// filled portion.
    async fn place_passive(
        &self,
        ticker: &str,
        side: Side,
        price_cents: u32,
        qty: u64,
        wait: Duration,
    ) -> Result<Fill>;

    /// Free cash balance in dollars.
    async fn balance(&self) -> Result<Decimal>;
}

/// Polymarket CLOB order entry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolymarketOrderAdapter: Send + Sync {
    /// Fill-or-kill buy: either matches in full immediately or reports an
    /// empty fill.
    async fn place_fok(&self, token_id: &str, price: Decimal, qty: u64) -> Result<Fill>;

    /// Passive limit resting for `wait`, then cancelled. Returns the
    /// filled portion.
    async fn place_passive(
        &self,
        token_id: &str,
        price: Decimal,
        qty: u64,
        wait: Duration,
    ) -> Result<Fill>;

    /// USDC balance in dollars.
    async fn balance(&self) -> Result<Decimal>;
}

// ---------------------------------------------------------------------------
// Kalshi
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct KalshiOrderRequest<'a> {
    ticker: &'a str,
    client_order_id: String,
    action: &'a str,
    side: &'a str,
    count: u64,
    #[serde(rename = "type")]
    order_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    yes_price: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_price: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_in_force: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct KalshiOrderPayload {
    pub order_id: String,
    pub status: String,
    pub taker_fill_count: Option<i64>,
    pub taker_fill_cost: Option<i64>,
    pub fill_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct KalshiOrderResponse {
    order: KalshiOrderPayload,
}

#[derive(Debug, Deserialize)]
struct KalshiBalanceResponse {
    /// Free balance in cents.
    balance: i64,
}

impl KalshiOrderPayload {
    /// Taker fill reported in the order response. `taker_fill_cost` is the
    /// total cents paid, which yields the average price.
    pub fn to_fill(&self, limit_price_cents: u32) -> Fill {
        let qty = self
            .taker_fill_count
            .or(self.fill_count)
            .unwrap_or(0)
            .max(0) as u64;
        if qty == 0 {
            return Fill::none();
        }
        let avg_price = match self.taker_fill_cost {
            Some(cost) if cost > 0 => {
                Decimal::new(cost, 2) / Decimal::from(qty)
            }
            _ => Decimal::new(limit_price_cents as i64, 2),
        };
        Fill { qty, avg_price }
    }
}

/// Kalshi REST order client. Every request carries the three RSA-PSS auth
/// headers over `{timestamp}{method}{path}`.
pub struct KalshiHttpAdapter {
    client: reqwest::Client,
    base_url: String,
    /// Path prefix of `base_url`, included in the signed message.
    base_path: String,
    signer: KalshiSigner,
}

impl KalshiHttpAdapter {
    pub fn new(base_url: &str, signer: KalshiSigner) -> Self {
        let base_path = url::Url::parse(base_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            base_path,
            signer,
        }
    }

    async fn signed_post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let path = format!("{}{}", self.base_path, endpoint);
        let mut attempt = 0;
        let mut delay = Duration::from_millis(250);
        loop {
            attempt += 1;
            let mut request = self
                .client
                .post(format!("{}{}", self.base_url, endpoint))
                .json(body);
            for (key, value) in self.signer.headers("POST", &path) {
                request = request.header(key, value);
            }
            let response = request.send().await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json().await.context("decode Kalshi response");
                }
                Ok(resp)
                    if (resp.status().is_server_error()
                        || resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS)
                        && attempt < MAX_ORDER_ATTEMPTS =>
                {
                    warn!(
                        "Kalshi POST {} attempt {} failed: {}",
                        endpoint,
                        attempt,
                        resp.status()
                    );
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(anyhow!("Kalshi POST {endpoint} failed: {status} {text}"));
                }
                Err(e) if attempt < MAX_ORDER_ATTEMPTS => {
                    warn!("Kalshi POST {} attempt {} failed: {}", endpoint, attempt, e);
                }
                Err(e) => return Err(e).context("Kalshi request failed"),
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    async fn signed_get<T: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> Result<T> {
        let path = format!("{}{}", self.base_path, endpoint);
        let mut request = self.client.get(format!("{}{}", self.base_url, endpoint));
        for (key, value) in self.signer.headers("GET", &path) {
            request = request.header(key, value);
        }
        let resp = request.send().await?.error_for_status()?;
        resp.json().await.context("decode Kalshi response")
    }

    async fn signed_delete(&self, endpoint: &str) -> Result<()> {
        let path = format!("{}{}", self.base_path, endpoint);
        let mut request = self
            .client
            .delete(format!("{}{}", self.base_url, endpoint));
        for (key, value) in self.signer.headers("DELETE", &path) {
            request = request.header(key, value);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }

    fn order_request<'a>(
        ticker: &'a str,
        side: Side,
        price_cents: u32,
        qty: u64,
        ioc: bool,
    ) -> KalshiOrderRequest<'a> {
        KalshiOrderRequest {
            ticker,
            client_order_id: Uuid::new_v4().to_string(),
            action: "buy",
            side: match side {
                Side::Yes => "yes",
                Side::No => "no",
            },
            count: qty,
            order_type: "limit",
            yes_price: (side == Side::Yes).then_some(price_cents),
            no_price: (side == Side::No).then_some(price_cents),
            time_in_force: ioc.then_some("immediate_or_cancel"),
        }
    }
}

#[async_trait]
impl KalshiOrderAdapter for KalshiHttpAdapter {
    async fn place_limit_ioc(
        &self,
        ticker: &str,
        side: Side,
        price_cents: u32,
        qty: u64,
    ) -> Result<Fill> {
        let body = Self::order_request(ticker, side, price_cents, qty, true);
        let response: KalshiOrderResponse =
            self.signed_post("/portfolio/orders", &body).await?;
        let fill = response.order.to_fill(price_cents);
        info!(
            "Kalshi IOC {} {} {}@{}c filled {}",
            ticker, side, qty, price_cents, fill.qty
        );
        Ok(fill)
    }

    async fn place_passive(
        &self,
        ticker: &str,
        side: Side,
        price_cents: u32,
        qty: u64,
        wait: Duration,
    ) -> Result<Fill> {
        let body = Self::order_request(ticker, side, price_cents, qty, false);
        let response: KalshiOrderResponse =
            self.signed_post("/portfolio/orders", &body).await?;
        let order_id = response.order.order_id.clone();

        let immediate = response.order.to_fill(price_cents);
        if immediate.qty >= qty {
            return Ok(immediate);
        }

        tokio::time::sleep(wait).await;

        if let Err(e) = self
            .signed_delete(&format!("/portfolio/orders/{order_id}"))
            .await
        {
            warn!("Kalshi cancel of {} failed: {}", order_id, e);
        }
        let status: KalshiOrderResponse = self
            .signed_get(&format!("/portfolio/orders/{order_id}"))
            .await?;
        Ok(status.order.to_fill(price_cents))
    }

    async fn balance(&self) -> Result<Decimal> {
        let response: KalshiBalanceResponse = self.signed_get("/portfolio/balance").await?;
        Ok(Decimal::new(response.balance, 2))
    }
}

// ---------------------------------------------------------------------------
// Polymarket
// ---------------------------------------------------------------------------

use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer as _;
use polymarket_client_sdk::clob::types::{OrderType as ClobOrderType, Side as ClobSide};
use polymarket_client_sdk::clob::{Client as ClobClient, Config as ClobConfig};
use polymarket_client_sdk::types::{Decimal as SdkDecimal, U256};
use polymarket_client_sdk::POLYGON;

/// Live Polymarket CLOB adapter: EIP-712-signed orders through the SDK.
/// Authentication happens per operation, the same way the CLOB examples
/// in this codebase's lineage do it; the signer is reused.
pub struct PolymarketClobAdapter {
    clob_api_url: String,
    signer: PrivateKeySigner,
    data_api_url: String,
    http: reqwest::Client,
}

impl PolymarketClobAdapter {
    /// Build the adapter. The EIP-712 domain is keyed on Polygon chain
    /// id 137; the wallet key never leaves the signer.
    pub async fn connect(clob_api_url: &str, private_key: &str) -> Result<Self> {
        let private_key = if private_key.starts_with("0x") {
            private_key.to_string()
        } else {
            format!("0x{private_key}")
        };
        let signer = PrivateKeySigner::from_str(&private_key)
            .context("Invalid wallet private key")?
            .with_chain_id(Some(POLYGON));

        let adapter = Self {
            clob_api_url: clob_api_url.to_string(),
            signer,
            data_api_url: "https://data-api.polymarket.com".to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
        };
        // Authenticate once up front so a bad key fails at startup, not on
        // the first order.
        adapter
            .post_limit_inner(None)
            .await
            .context("Failed to authenticate with Polymarket")?;
        Ok(adapter)
    }

    /// Authenticate and, when an order is given, build/sign/post it.
    /// `None` performs authentication only.
    async fn post_limit_inner(
        &self,
        order: Option<(&str, Decimal, u64, ClobOrderType)>,
    ) -> Result<(String, Fill)> {
        let client = ClobClient::new(&self.clob_api_url, ClobConfig::default())?
            .authentication_builder(&self.signer)
            .authenticate()
            .await
            .context("CLOB authentication failed")?;

        let Some((token_id, price, qty, order_type)) = order else {
            info!("Polymarket CLOB authenticated as {}", client.address());
            return Ok((String::new(), Fill::none()));
        };

        let token = U256::from_str(token_id).context("Invalid token id")?;
        let price_dec = SdkDecimal::from_str(&price.round_dp(2).to_string())
            .map_err(|e| anyhow!("bad price: {e}"))?;
        let size_dec = SdkDecimal::from_str(&qty.to_string())
            .map_err(|e| anyhow!("bad size: {e}"))?;

        let signable = client
            .limit_order()
            .token_id(token)
            .price(price_dec)
            .size(size_dec)
            .side(ClobSide::Buy)
            .order_type(order_type)
            .build()
            .await
            .with_context(|| format!("build order token={token_id} qty={qty} price={price}"))?;

        let signed = client
            .sign(&self.signer, signable)
            .await
            .context("sign order")?;

        let resp = client.post_order(signed).await.context("post order")?;
        if !resp.success {
            let reason = resp
                .error_msg
                .unwrap_or_else(|| "unknown error".to_string());
            debug!("Polymarket order rejected: {}", reason);
            return Ok((resp.order_id, Fill::none()));
        }

        // taking_amount = shares received, making_amount = USDC spent.
        let filled = parse_sdk_amount(&resp.taking_amount.to_string());
        let spent = parse_sdk_amount_decimal(&resp.making_amount.to_string());
        let avg_price = if filled > 0 && spent > Decimal::ZERO {
            spent / Decimal::from(filled)
        } else {
            price
        };
        Ok((
            resp.order_id,
            Fill {
                qty: filled,
                avg_price,
            },
        ))
    }

    async fn post_limit(
        &self,
        token_id: &str,
        price: Decimal,
        qty: u64,
        order_type: ClobOrderType,
    ) -> Result<(String, Fill)> {
        self.post_limit_inner(Some((token_id, price, qty, order_type)))
            .await
    }

    async fn cancel(&self, order_id: &str) {
        if order_id.is_empty() {
            return;
        }
        let client = match ClobClient::new(&self.clob_api_url, ClobConfig::default()) {
            Ok(client) => client,
            Err(e) => {
                warn!("CLOB client for cancel failed: {}", e);
                return;
            }
        };
        let client = match client.authentication_builder(&self.signer).authenticate().await {
            Ok(client) => client,
            Err(e) => {
                warn!("CLOB auth for cancel failed: {}", e);
                return;
            }
        };
        match client.cancel_order(order_id).await {
            Ok(_) => info!("Cancelled Polymarket order {}", order_id),
            Err(e) => warn!("Failed to cancel Polymarket order {}: {}", order_id, e),
        }
    }
}

#[async_trait]
impl PolymarketOrderAdapter for PolymarketClobAdapter {
    async fn place_fok(&self, token_id: &str, price: Decimal, qty: u64) -> Result<Fill> {
        let (_, fill) = self
            .post_limit(token_id, price, qty, ClobOrderType::FOK)
            .await?;
        info!(
            "Polymarket FOK {}@{} x{} filled {}",
            &token_id[..token_id.len().min(12)],
            price,
            qty,
            fill.qty
        );
        Ok(fill)
    }

    async fn place_passive(
        &self,
        token_id: &str,
        price: Decimal,
        qty: u64,
        wait: Duration,
    ) -> Result<Fill> {
        let (order_id, immediate) = self
            .post_limit(token_id, price, qty, ClobOrderType::GTC)
            .await?;
        if immediate.qty >= qty {
            return Ok(immediate);
        }

        tokio::time::sleep(wait).await;
        self.cancel(&order_id).await;

        // The fade path treats the resting remainder as unfilled; anything
        // matched while resting shows up in the position reconciliation.
        Ok(immediate)
    }

    async fn balance(&self) -> Result<Decimal> {
        #[derive(Deserialize)]
        struct ValueRow {
            value: f64,
        }
        let url = format!(
            "{}/value?user={}",
            self.data_api_url,
            self.signer.address()
        );
        let rows: Vec<ValueRow> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let value = rows.first().map(|r| r.value).unwrap_or(0.0);
        Decimal::try_from(value).context("bad balance value")
    }
}

/// Stand-in wired when live trading is disabled. The dry-run coordinator
/// never places orders, so any call reaching this is a bug.
pub struct DisabledVenue;

#[async_trait]
impl KalshiOrderAdapter for DisabledVenue {
    async fn place_limit_ioc(&self, _: &str, _: Side, _: u32, _: u64) -> Result<Fill> {
        Err(anyhow!("live trading is disabled"))
    }

    async fn place_passive(&self, _: &str, _: Side, _: u32, _: u64, _: Duration) -> Result<Fill> {
        Err(anyhow!("live trading is disabled"))
    }

    async fn balance(&self) -> Result<Decimal> {
        Err(anyhow!("live trading is disabled"))
    }
}

#[async_trait]
impl PolymarketOrderAdapter for DisabledVenue {
    async fn place_fok(&self, _: &str, _: Decimal, _: u64) -> Result<Fill> {
        Err(anyhow!("live trading is disabled"))
    }

    async fn place_passive(&self, _: &str, _: Decimal, _: u64, _: Duration) -> Result<Fill> {
        Err(anyhow!("live trading is disabled"))
    }

    async fn balance(&self) -> Result<Decimal> {
        Err(anyhow!("live trading is disabled"))
    }
}

fn parse_sdk_amount(raw: &str) -> u64 {
    raw.parse::<Decimal>()
        .ok()
        .and_then(|d| d.floor().to_u64())
        .unwrap_or(0)
}

fn parse_sdk_amount_decimal(raw: &str) -> Decimal {
    raw.parse::<Decimal>().unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_kalshi_fill_from_taker_fields() {
        let payload = KalshiOrderPayload {
            order_id: "ord-1".to_string(),
            status: "executed".to_string(),
            taker_fill_count: Some(7),
            taker_fill_cost: Some(322),
            fill_count: None,
        };
        let fill = payload.to_fill(48);
        assert_eq!(fill.qty, 7);
        assert_eq!(fill.avg_price, dec!(0.46));
    }

    #[test]
    fn test_kalshi_fill_defaults_to_limit_price() {
        let payload = KalshiOrderPayload {
            order_id: "ord-2".to_string(),
            status: "executed".to_string(),
            taker_fill_count: Some(5),
            taker_fill_cost: None,
            fill_count: None,
        };
        let fill = payload.to_fill(48);
        assert_eq!(fill.qty, 5);
        assert_eq!(fill.avg_price, dec!(0.48));
    }

    #[test]
    fn test_kalshi_zero_fill() {
        let payload = KalshiOrderPayload {
            order_id: "ord-3".to_string(),
            status: "canceled".to_string(),
            ..Default::default()
        };
        assert_eq!(payload.to_fill(48), Fill::none());
    }

    #[test]
    fn test_kalshi_order_request_side_prices() {
        let req = KalshiHttpAdapter::order_request("KXBTC", Side::No, 52, 10, true);
        assert_eq!(req.side, "no");
        assert_eq!(req.no_price, Some(52));
        assert_eq!(req.yes_price, None);
        assert_eq!(req.time_in_force, Some("immediate_or_cancel"));

        let passive = KalshiHttpAdapter::order_request("KXBTC", Side::Yes, 52, 10, false);
        assert_eq!(passive.yes_price, Some(52));
        assert_eq!(passive.time_in_force, None);
    }

    #[test]
    fn test_parse_sdk_amounts() {
        assert_eq!(parse_sdk_amount("10"), 10);
        assert_eq!(parse_sdk_amount("10.7"), 10);
        assert_eq!(parse_sdk_amount("garbage"), 0);
        assert_eq!(parse_sdk_amount_decimal("4.62"), dec!(4.62));
    }

    #[test]
    fn test_kalshi_order_response_decodes() {
        let json = r#"{"order":{"order_id":"abc","status":"executed","taker_fill_count":3,"taker_fill_cost":150}}"#;
        let resp: KalshiOrderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.order.order_id, "abc");
        assert_eq!(resp.order.to_fill(50).qty, 3);
    }
}
