// =============================================================================
// Broker HTTP Client — bearer-token authenticated REST client
// =============================================================================
//
// Grounded on the teacher's `binance/client.rs`: one `reqwest::Client` built
// once with the per-call timeout as its connector default, per-endpoint
// methods, `#[instrument(skip(self, ...))]` on every public method, and a
// hand-written `Debug` impl that redacts credentials. The teacher's
// HMAC-SHA256 query signing is fully replaced (not augmented) by a bearer
// token plus account-id header, per the broker's auth contract.
// =============================================================================

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{
    audit, AuditCounters, Balances, BrokerPosition, ChainLeg, DailyClose, GainLossEntry,
    GatewayError, OrderFillOutcome, OrderReport, Quote, SpreadOrderRequest,
};
use crate::store::Store;
use crate::types::{OptionType, OrderStatus};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const ORDER_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 2;

#[derive(Clone)]
pub struct BrokerClient {
    base_url: String,
    bearer_token: String,
    account_id: String,
    client: reqwest::Client,
    store: Store,
    counters: std::sync::Arc<AuditCounters>,
    mode: String,
}

impl BrokerClient {
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: impl Into<String>,
        account_id: impl Into<String>,
        store: Store,
        mode: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
            account_id: account_id.into(),
            client,
            store,
            counters: std::sync::Arc::new(AuditCounters::new()),
            mode: mode.into(),
        }
    }

    pub fn counters(&self) -> &AuditCounters {
        &self.counters
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.bearer_token)
            .header("Account-Id", &self.account_id)
    }

    /// Sends `build` up to `MAX_RETRIES + 1` times with linear backoff on
    /// timeout/5xx; 4xx is returned immediately, never retried.
    async fn send_with_retry(
        &self,
        operation: &str,
        symbol: Option<&str>,
        timeout: Duration,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, GatewayError> {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let result = build().timeout(timeout).send().await;
            let outcome = Self::interpret_response(result, timeout).await;
            let duration_ms = started.elapsed().as_millis() as i64;

            match outcome {
                Ok(body) => {
                    audit::record_call(
                        &self.store,
                        &self.counters,
                        operation,
                        symbol,
                        None,
                        Some(200),
                        true,
                        duration_ms,
                        &self.mode,
                        None,
                        None,
                    )
                    .await;
                    return Ok(body);
                }
                Err(err) => {
                    let status = match &err {
                        GatewayError::Http { status, .. } => Some(*status as i64),
                        _ => None,
                    };
                    audit::record_call(
                        &self.store,
                        &self.counters,
                        operation,
                        symbol,
                        None,
                        status,
                        false,
                        duration_ms,
                        &self.mode,
                        None,
                        Some(&err.to_string()),
                    )
                    .await;

                    if err.is_retryable() && attempt < MAX_RETRIES {
                        attempt += 1;
                        warn!(operation, attempt, error = %err, "retrying broker call");
                        tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn interpret_response(
        result: Result<reqwest::Response, reqwest::Error>,
        timeout: Duration,
    ) -> Result<serde_json::Value, GatewayError> {
        let resp = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(GatewayError::Timeout(timeout)),
            Err(e) => return Err(GatewayError::Transport(e)),
        };

        let status = resp.status();
        let body: serde_json::Value = match resp.json().await {
            Ok(b) => b,
            Err(e) => return Err(GatewayError::Parse(e.to_string())),
        };

        if status.is_success() {
            Ok(body)
        } else {
            Err(GatewayError::Http {
                status: status.as_u16(),
                body: body.to_string(),
            })
        }
    }

    // -------------------------------------------------------------------------
    // Quotes and chains
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "broker::get_underlying_quote")]
    pub async fn get_underlying_quote(&self, symbol: &str) -> Result<Quote, GatewayError> {
        let body = self
            .send_with_retry(
                "get_underlying_quote",
                Some(symbol),
                DEFAULT_TIMEOUT,
                || self.request(reqwest::Method::GET, &format!("/v1/quotes/{symbol}")),
            )
            .await?;

        let last = body["last"].as_f64();
        let bid = body["bid"].as_f64();
        let ask = body["ask"].as_f64();
        match (last, bid, ask) {
            (Some(last), Some(bid), Some(ask)) => Ok(Quote {
                symbol: symbol.to_string(),
                last,
                bid,
                ask,
            }),
            _ => Err(GatewayError::Parse(format!(
                "quote for {symbol} missing last/bid/ask"
            ))),
        }
    }

    #[instrument(skip(self), name = "broker::get_option_chain")]
    pub async fn get_option_chain(
        &self,
        symbol: &str,
        expiration: chrono::NaiveDate,
        tolerate_missing_greeks: bool,
    ) -> Result<Vec<ChainLeg>, GatewayError> {
        let body = self
            .send_with_retry(
                "get_option_chain",
                Some(symbol),
                DEFAULT_TIMEOUT,
                || {
                    self.request(
                        reqwest::Method::GET,
                        &format!("/v1/chains/{symbol}?expiration={expiration}"),
                    )
                },
            )
            .await?;

        #[derive(Deserialize)]
        struct RawLeg {
            symbol: String,
            strike: f64,
            option_type: String,
            bid: Option<f64>,
            ask: Option<f64>,
            delta: Option<f64>,
            iv: Option<f64>,
        }

        let raw: Vec<RawLeg> = serde_json::from_value(body["legs"].clone())
            .map_err(|e| GatewayError::Parse(e.to_string()))?;

        let mut legs = Vec::with_capacity(raw.len());
        for r in raw {
            let option_type = match r.option_type.as_str() {
                "CALL" => OptionType::Call,
                "PUT" => OptionType::Put,
                other => {
                    warn!(other, "skipping chain row with unrecognised option_type");
                    continue;
                }
            };
            let (bid, ask) = match (r.bid, r.ask) {
                (Some(b), Some(a)) => (b, a),
                _ if tolerate_missing_greeks => (r.bid.unwrap_or(0.0), r.ask.unwrap_or(0.0)),
                _ => continue,
            };
            if !tolerate_missing_greeks && (r.delta.is_none() || r.iv.is_none()) {
                continue;
            }
            legs.push(ChainLeg {
                symbol: r.symbol,
                strike: r.strike,
                option_type,
                bid,
                ask,
                delta: r.delta,
                iv: r.iv,
            });
        }

        debug!(symbol, count = legs.len(), "option chain normalized");
        Ok(legs)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    #[instrument(skip(self, req), name = "broker::place_spread_order")]
    pub async fn place_spread_order(
        &self,
        req: &SpreadOrderRequest,
    ) -> Result<OrderReport, GatewayError> {
        let class = "multileg";
        let order_type = if req.is_credit { "credit" } else { "debit" };

        let legs_json: Vec<serde_json::Value> = req
            .legs
            .iter()
            .enumerate()
            .map(|(i, leg)| {
                serde_json::json!({
                    "index": i,
                    "symbol": leg.symbol,
                    "side": match leg.side {
                        crate::types::LegSide::Short => "SELL_TO_OPEN",
                        crate::types::LegSide::Long => "BUY_TO_OPEN",
                    },
                    "quantity": leg.quantity,
                })
            })
            .collect();

        let payload = serde_json::json!({
            "class": class,
            "type": order_type,
            "price": format!("{:.2}", req.net_price),
            "legs": legs_json,
            "client_order_id": req.client_order_id,
        });

        let body = self
            .send_with_retry(
                "place_spread_order",
                Some(&req.legs[0].symbol),
                ORDER_TIMEOUT,
                || self.request(reqwest::Method::POST, "/v1/orders").json(&payload),
            )
            .await?;

        Self::parse_order_report(&body)
    }

    #[instrument(skip(self), name = "broker::place_single_leg_close_order")]
    pub async fn place_single_leg_close_order(
        &self,
        symbol: &str,
        side: crate::types::LegSide,
        quantity: u32,
        client_order_id: &str,
    ) -> Result<OrderReport, GatewayError> {
        let payload = serde_json::json!({
            "class": "single",
            "type": "market",
            "symbol": symbol,
            "side": match side {
                crate::types::LegSide::Short => "SELL_TO_CLOSE",
                crate::types::LegSide::Long => "BUY_TO_CLOSE",
            },
            "quantity": quantity,
            "client_order_id": client_order_id,
        });

        let body = self
            .send_with_retry(
                "place_single_leg_close_order",
                Some(symbol),
                ORDER_TIMEOUT,
                || self.request(reqwest::Method::POST, "/v1/orders").json(&payload),
            )
            .await?;

        Self::parse_order_report(&body)
    }

    #[instrument(skip(self), name = "broker::get_order")]
    pub async fn get_order(&self, order_id: &str) -> Result<OrderReport, GatewayError> {
        let body = self
            .send_with_retry("get_order", None, DEFAULT_TIMEOUT, || {
                self.request(reqwest::Method::GET, &format!("/v1/orders/{order_id}"))
            })
            .await?;
        Self::parse_order_report(&body)
    }

    #[instrument(skip(self), name = "broker::get_order_with_legs")]
    pub async fn get_order_with_legs(
        &self,
        order_id: &str,
    ) -> Result<OrderFillOutcome, GatewayError> {
        let report = self.get_order(order_id).await?;
        if report.filled_quantity > 0 && report.filled_quantity < report.requested_quantity {
            return Ok(OrderFillOutcome::PartialFillUnsupported {
                filled: report.filled_quantity,
                requested: report.requested_quantity,
            });
        }
        Ok(OrderFillOutcome::Report(report))
    }

    #[instrument(skip(self), name = "broker::get_all_orders")]
    pub async fn get_all_orders(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OrderReport>, GatewayError> {
        let body = self
            .send_with_retry("get_all_orders", None, DEFAULT_TIMEOUT, || {
                self.request(
                    reqwest::Method::GET,
                    &format!("/v1/orders?start={start}&end={end}"),
                )
            })
            .await?;

        let arr = body.as_array().cloned().unwrap_or_default();
        arr.iter().map(Self::parse_order_report).collect()
    }

    #[instrument(skip(self), name = "broker::get_open_orders")]
    pub async fn get_open_orders(&self) -> Result<Vec<OrderReport>, GatewayError> {
        let body = self
            .send_with_retry("get_open_orders", None, DEFAULT_TIMEOUT, || {
                self.request(reqwest::Method::GET, "/v1/orders?status=open")
            })
            .await?;

        let arr = body.as_array().cloned().unwrap_or_default();
        arr.iter().map(Self::parse_order_report).collect()
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        self.send_with_retry("cancel_order", None, DEFAULT_TIMEOUT, || {
            self.request(reqwest::Method::DELETE, &format!("/v1/orders/{order_id}"))
        })
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "broker::get_positions")]
    pub async fn get_positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        let body = self
            .send_with_retry("get_positions", None, DEFAULT_TIMEOUT, || {
                self.request(reqwest::Method::GET, "/v1/positions")
            })
            .await?;

        serde_json::from_value(body["positions"].clone())
            .map_err(|e| GatewayError::Parse(e.to_string()))
    }

    #[instrument(skip(self), name = "broker::get_balances")]
    pub async fn get_balances(&self) -> Result<Balances, GatewayError> {
        let body = self
            .send_with_retry("get_balances", None, DEFAULT_TIMEOUT, || {
                self.request(reqwest::Method::GET, "/v1/balances")
            })
            .await?;
        serde_json::from_value(body).map_err(|e| GatewayError::Parse(e.to_string()))
    }

    #[instrument(skip(self), name = "broker::get_gain_loss")]
    pub async fn get_gain_loss(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GainLossEntry>, GatewayError> {
        let body = self
            .send_with_retry("get_gain_loss", None, DEFAULT_TIMEOUT, || {
                self.request(
                    reqwest::Method::GET,
                    &format!("/v1/gainloss?start={start}&end={end}"),
                )
            })
            .await?;
        serde_json::from_value(body["entries"].clone())
            .map_err(|e| GatewayError::Parse(e.to_string()))
    }

    #[instrument(skip(self), name = "broker::get_historical_data")]
    pub async fn get_historical_data(
        &self,
        symbol: &str,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    ) -> Result<Vec<DailyClose>, GatewayError> {
        let body = self
            .send_with_retry(
                "get_historical_data",
                Some(symbol),
                DEFAULT_TIMEOUT,
                || {
                    self.request(
                        reqwest::Method::GET,
                        &format!("/v1/history/{symbol}?start={start}&end={end}"),
                    )
                },
            )
            .await?;
        serde_json::from_value(body["closes"].clone()).map_err(|e| GatewayError::Parse(e.to_string()))
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn parse_order_report(body: &serde_json::Value) -> Result<OrderReport, GatewayError> {
        let status_str = body["status"].as_str().unwrap_or("UNKNOWN");
        let status = match status_str {
            "PENDING" | "NEW" | "ACCEPTED" => OrderStatus::Placed,
            "PARTIALLY_FILLED" => OrderStatus::Partial,
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" | "CANCELED" => OrderStatus::Cancelled,
            "REJECTED" | "EXPIRED" => OrderStatus::Rejected,
            other => {
                warn!(other, "unmapped broker order status, treating as Rejected");
                OrderStatus::Rejected
            }
        };

        let avg_fill_price = body["avg_fill_price"]
            .as_f64()
            .map(super::normalize_price);

        Ok(OrderReport {
            broker_order_id: body["id"].as_str().unwrap_or_default().to_string(),
            status,
            filled_quantity: body["filled_quantity"].as_u64().unwrap_or(0) as u32,
            requested_quantity: body["requested_quantity"].as_u64().unwrap_or(0) as u32,
            avg_fill_price,
            rejection_text: body["rejection_text"].as_str().map(str::to_string),
        })
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url)
            .field("bearer_token", &"<redacted>")
            .field("account_id", &"<redacted>")
            .field("mode", &self.mode)
            .finish()
    }
}
