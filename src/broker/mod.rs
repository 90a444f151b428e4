//! OANDA v3 REST broker client
//!
//! Thin collaborator boundary around the brokerage: account queries, price
//! quotes, market orders and trade closes. Every call can fail; callers treat
//! failures as recoverable (log, skip this cycle), never fatal.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::types::pip_size;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker rejected request: {0}")]
    Api(String),
    #[error("rate limited by broker")]
    RateLimited,
    #[error("order placed but no fill returned")]
    MissingFill,
    #[error("malformed broker response: {0}")]
    Malformed(String),
}

/// Account-level snapshot
#[derive(Debug, Clone)]
pub struct AccountSummary {
    pub balance: f64,
    pub currency: String,
    pub open_trade_count: u32,
    pub unrealized_pl: f64,
}

/// Two-sided quote for one instrument
#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub instrument: String,
    pub bid: f64,
    pub ask: f64,
}

impl PriceQuote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread_pips(&self) -> f64 {
        (self.ask - self.bid) / pip_size(&self.instrument)
    }
}

/// One side of a netted position
#[derive(Debug, Clone, Default)]
pub struct PositionSide {
    pub units: i64,
    pub trade_ids: Vec<String>,
}

/// Netted open position as the broker reports it
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub instrument: String,
    pub long: PositionSide,
    pub short: PositionSide,
}

/// A live trade as the broker reports it
#[derive(Debug, Clone)]
pub struct BrokerTrade {
    pub trade_id: String,
    pub instrument: String,
    pub units: i64,
    pub entry_price: f64,
}

/// Confirmed market-order fill
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub trade_id: String,
    pub price: f64,
}

/// Result of closing a trade
#[derive(Debug, Clone)]
pub struct CloseResult {
    pub realized_pnl: f64,
    pub price: f64,
}

/// Brokerage collaborator interface consumed by the trade lifecycle core.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn account_summary(&self) -> Result<AccountSummary, BrokerError>;
    async fn open_positions(&self) -> Result<Vec<OpenPosition>, BrokerError>;
    async fn open_trades(&self) -> Result<Vec<BrokerTrade>, BrokerError>;
    async fn price(&self, instrument: &str) -> Result<PriceQuote, BrokerError>;
    async fn place_order(
        &self,
        instrument: &str,
        units: i64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<OrderFill, BrokerError>;
    async fn close_trade(&self, trade_id: &str) -> Result<CloseResult, BrokerError>;
}

/// Minimum inter-call interval policy for one endpoint class.
///
/// Callers `pace()` before each request; the awaited sleep replaces the
/// scattered fixed delays a naive rate-limit workaround would use, and runs
/// on tokio time so tests can drive it with a paused clock.
pub struct CallPacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until at least `min_interval` has passed since the previous call.
    pub async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ── OANDA wire types (decimals arrive as strings) ────────────────

#[derive(Debug, Deserialize)]
struct AccountResponse {
    account: AccountBody,
}

#[derive(Debug, Deserialize)]
struct AccountBody {
    balance: String,
    currency: String,
    #[serde(rename = "openTradeCount", default)]
    open_trade_count: u32,
    #[serde(rename = "unrealizedPL", default)]
    unrealized_pl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PricingResponse {
    prices: Vec<PriceBody>,
}

#[derive(Debug, Deserialize)]
struct PriceBody {
    instrument: String,
    bids: Vec<PriceBucket>,
    asks: Vec<PriceBucket>,
}

#[derive(Debug, Deserialize)]
struct PriceBucket {
    price: String,
}

#[derive(Debug, Deserialize)]
struct OpenPositionsResponse {
    positions: Vec<PositionBody>,
}

#[derive(Debug, Deserialize)]
struct PositionBody {
    instrument: String,
    long: PositionSideBody,
    short: PositionSideBody,
}

#[derive(Debug, Deserialize, Default)]
struct PositionSideBody {
    #[serde(default)]
    units: Option<String>,
    #[serde(rename = "tradeIDs", default)]
    trade_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OpenTradesResponse {
    trades: Vec<TradeBody>,
}

#[derive(Debug, Deserialize)]
struct TradeBody {
    id: String,
    instrument: String,
    #[serde(rename = "currentUnits")]
    current_units: String,
    price: String,
}

#[derive(Debug, Serialize)]
struct OrderRequest {
    order: OrderBody,
}

#[derive(Debug, Serialize)]
struct OrderBody {
    instrument: String,
    units: String,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(rename = "positionFill")]
    position_fill: String,
    #[serde(rename = "stopLossOnFill", skip_serializing_if = "Option::is_none")]
    stop_loss_on_fill: Option<PriceField>,
    #[serde(rename = "takeProfitOnFill", skip_serializing_if = "Option::is_none")]
    take_profit_on_fill: Option<PriceField>,
}

#[derive(Debug, Serialize)]
struct PriceField {
    price: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderFillTransaction")]
    order_fill: Option<OrderFillBody>,
    #[serde(rename = "orderCancelTransaction")]
    order_cancel: Option<OrderCancelBody>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderFillBody {
    price: String,
    #[serde(rename = "tradeOpened")]
    trade_opened: Option<TradeOpenedBody>,
    #[serde(default)]
    pl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradeOpenedBody {
    #[serde(rename = "tradeID")]
    trade_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderCancelBody {
    reason: String,
}

fn parse_dec(value: &str, field: &str) -> Result<f64, BrokerError> {
    value
        .parse::<f64>()
        .map_err(|_| BrokerError::Malformed(format!("{}: {:?}", field, value)))
}

// ── client ───────────────────────────────────────────────────────

/// REST client for the OANDA v3 API.
pub struct OandaClient {
    client: reqwest::Client,
    base_url: String,
    account_id: String,
    /// Pricing polls may run hot; order placement is paced independently.
    pricing_pacer: CallPacer,
    trading_pacer: CallPacer,
}

impl OandaClient {
    pub fn new(
        base_url: &str,
        api_token: &str,
        account_id: &str,
        timeout_ms: u64,
        min_call_interval_ms: u64,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_token))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            pricing_pacer: CallPacer::new(Duration::from_millis(min_call_interval_ms)),
            trading_pacer: CallPacer::new(Duration::from_millis(min_call_interval_ms)),
        })
    }

    fn account_url(&self, suffix: &str) -> String {
        format!("{}/v3/accounts/{}{}", self.base_url, self.account_id, suffix)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BrokerError> {
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BrokerError::RateLimited);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api(format!("{}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl Broker for OandaClient {
    async fn account_summary(&self) -> Result<AccountSummary, BrokerError> {
        self.pricing_pacer.pace().await;
        let response = self.client.get(self.account_url("/summary")).send().await?;
        let body: AccountResponse = Self::check(response).await?.json().await?;
        Ok(AccountSummary {
            balance: parse_dec(&body.account.balance, "balance")?,
            currency: body.account.currency,
            open_trade_count: body.account.open_trade_count,
            unrealized_pl: body
                .account
                .unrealized_pl
                .as_deref()
                .map(|v| parse_dec(v, "unrealizedPL"))
                .transpose()?
                .unwrap_or(0.0),
        })
    }

    async fn open_positions(&self) -> Result<Vec<OpenPosition>, BrokerError> {
        self.pricing_pacer.pace().await;
        let response = self
            .client
            .get(self.account_url("/openPositions"))
            .send()
            .await?;
        let body: OpenPositionsResponse = Self::check(response).await?.json().await?;
        body.positions
            .into_iter()
            .map(|p| {
                let side = |s: PositionSideBody| -> Result<PositionSide, BrokerError> {
                    Ok(PositionSide {
                        units: s
                            .units
                            .as_deref()
                            .map(|v| parse_dec(v, "units"))
                            .transpose()?
                            .unwrap_or(0.0) as i64,
                        trade_ids: s.trade_ids,
                    })
                };
                Ok(OpenPosition {
                    instrument: p.instrument,
                    long: side(p.long)?,
                    short: side(p.short)?,
                })
            })
            .collect()
    }

    async fn open_trades(&self) -> Result<Vec<BrokerTrade>, BrokerError> {
        self.pricing_pacer.pace().await;
        let response = self
            .client
            .get(self.account_url("/openTrades"))
            .send()
            .await?;
        let body: OpenTradesResponse = Self::check(response).await?.json().await?;
        body.trades
            .into_iter()
            .map(|t| {
                Ok(BrokerTrade {
                    entry_price: parse_dec(&t.price, "price")?,
                    units: parse_dec(&t.current_units, "currentUnits")? as i64,
                    trade_id: t.id,
                    instrument: t.instrument,
                })
            })
            .collect()
    }

    async fn price(&self, instrument: &str) -> Result<PriceQuote, BrokerError> {
        self.pricing_pacer.pace().await;
        let url = format!("{}?instruments={}", self.account_url("/pricing"), instrument);
        let response = self.client.get(url).send().await?;
        let body: PricingResponse = Self::check(response).await?.json().await?;
        let price = body
            .prices
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::Malformed(format!("no price for {}", instrument)))?;
        let bid = price
            .bids
            .first()
            .ok_or_else(|| BrokerError::Malformed("empty bids".into()))?;
        let ask = price
            .asks
            .first()
            .ok_or_else(|| BrokerError::Malformed("empty asks".into()))?;
        Ok(PriceQuote {
            instrument: price.instrument,
            bid: parse_dec(&bid.price, "bid")?,
            ask: parse_dec(&ask.price, "ask")?,
        })
    }

    async fn place_order(
        &self,
        instrument: &str,
        units: i64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<OrderFill, BrokerError> {
        self.trading_pacer.pace().await;
        let request = OrderRequest {
            order: OrderBody {
                instrument: instrument.to_string(),
                units: units.to_string(),
                order_type: "MARKET".to_string(),
                position_fill: "DEFAULT".to_string(),
                stop_loss_on_fill: stop_loss.map(|p| PriceField {
                    price: format!("{:.5}", p),
                }),
                take_profit_on_fill: take_profit.map(|p| PriceField {
                    price: format!("{:.5}", p),
                }),
            },
        };

        debug!(instrument, units, "Placing market order");
        let response = self
            .client
            .post(self.account_url("/orders"))
            .json(&request)
            .send()
            .await?;
        let body: OrderResponse = Self::check(response).await?.json().await?;

        if let Some(message) = body.error_message {
            return Err(BrokerError::Api(message));
        }
        if let Some(cancel) = body.order_cancel {
            return Err(BrokerError::Api(format!("order cancelled: {}", cancel.reason)));
        }
        let fill = body.order_fill.ok_or(BrokerError::MissingFill)?;
        let opened = fill.trade_opened.ok_or(BrokerError::MissingFill)?;
        Ok(OrderFill {
            trade_id: opened.trade_id,
            price: parse_dec(&fill.price, "fill price")?,
        })
    }

    async fn close_trade(&self, trade_id: &str) -> Result<CloseResult, BrokerError> {
        self.trading_pacer.pace().await;
        let url = self.account_url(&format!("/trades/{}/close", trade_id));
        let response = self.client.put(url).send().await?;
        let body: OrderResponse = Self::check(response).await?.json().await?;

        if let Some(message) = body.error_message {
            return Err(BrokerError::Api(message));
        }
        let fill = body.order_fill.ok_or(BrokerError::MissingFill)?;
        Ok(CloseResult {
            realized_pnl: fill
                .pl
                .as_deref()
                .map(|v| parse_dec(v, "pl"))
                .transpose()?
                .unwrap_or(0.0),
            price: parse_dec(&fill.price, "close price")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_in_pips_respects_pip_size() {
        let quote = PriceQuote {
            instrument: "EUR_USD".into(),
            bid: 1.1000,
            ask: 1.1002,
        };
        assert!((quote.spread_pips() - 2.0).abs() < 1e-6);
        assert!((quote.mid() - 1.1001).abs() < 1e-9);

        let jpy = PriceQuote {
            instrument: "USD_JPY".into(),
            bid: 155.00,
            ask: 155.03,
        };
        assert!((jpy.spread_pips() - 3.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_enforces_minimum_interval() {
        let pacer = CallPacer::new(Duration::from_millis(500));
        let start = Instant::now();

        pacer.pace().await;
        pacer.pace().await;
        pacer.pace().await;

        // Two enforced gaps after the free first call
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_does_not_delay_spaced_calls() {
        let pacer = CallPacer::new(Duration::from_millis(500));

        pacer.pace().await;
        tokio::time::advance(Duration::from_millis(600)).await;

        let before = Instant::now();
        pacer.pace().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[test]
    fn order_fill_response_parses() {
        let raw = r#"{
            "orderFillTransaction": {
                "price": "1.10015",
                "tradeOpened": { "tradeID": "6789" }
            }
        }"#;
        let body: OrderResponse = serde_json::from_str(raw).unwrap();
        let fill = body.order_fill.unwrap();
        assert_eq!(fill.trade_opened.unwrap().trade_id, "6789");
        assert_eq!(fill.price, "1.10015");
    }

    #[test]
    fn cancelled_order_is_an_api_error_shape() {
        let raw = r#"{
            "orderCancelTransaction": { "reason": "INSUFFICIENT_MARGIN" }
        }"#;
        let body: OrderResponse = serde_json::from_str(raw).unwrap();
        assert!(body.order_fill.is_none());
        assert_eq!(body.order_cancel.unwrap().reason, "INSUFFICIENT_MARGIN");
    }
}
