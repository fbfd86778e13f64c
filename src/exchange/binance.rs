//! Signed REST + WS connector for a Binance-style spot venue.
//!
//! Auth flow: every private call gets `timestamp`/`recvWindow` appended, the
//! query string is HMAC-SHA256 signed with the API secret, and the key rides
//! in the `X-MBX-APIKEY` header. Error payloads are `{code, msg}`; HTTP 429
//! and 418 are rate-limit class regardless of body.
//!
//! The connector only translates; admission control (AWG) and retry policy
//! live with the callers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use super::{
    AccountSnapshot, BookTop, Exchange, ExchangeError, NewOrderRequest, OpenOrder, OrderAck,
    WsSubscription,
};
use crate::config::ExchangeConfig;
use crate::types::{OrderStatus, Side, SymbolRules};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5_000;

pub struct BinanceConnector {
    cfg: ExchangeConfig,
    http: reqwest::Client,
}

impl BinanceConnector {
    pub fn new(cfg: ExchangeConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.rest_timeout_ms))
            .build()?;
        Ok(Self { cfg, http })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.cfg.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn build_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<Value, ExchangeError> {
        if signed {
            params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
            params.push(("timestamp", Self::now_ms().to_string()));
        }
        let mut query = Self::build_query(&params);
        if signed {
            let sig = self.sign(&query);
            query.push_str(&format!("&signature={sig}"));
        }

        let url = if query.is_empty() {
            format!("{}{}", self.cfg.rest_url, path)
        } else {
            format!("{}{}?{}", self.cfg.rest_url, path, query)
        };

        let mut req = self.http.request(method, &url);
        if !self.cfg.api_key.is_empty() {
            req = req.header("X-MBX-APIKEY", &self.cfg.api_key);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(ExchangeError::Timeout),
            Err(e) => return Err(ExchangeError::Transport(e.to_string())),
        };

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(ExchangeError::RateLimited {
                code: status.as_u16() as i64,
            });
        }

        let value: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        if !status.is_success() {
            let code = value.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
            let msg = value
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or(&body)
                .to_string();
            if matches!(code, -1003 | -1015) {
                return Err(ExchangeError::RateLimited { code });
            }
            return Err(ExchangeError::Api { code, msg });
        }

        Ok(value)
    }
}

// ── Payload decoding ──

fn dec_field(v: &Value, field: &str) -> Decimal {
    v.get(field)
        .and_then(|x| x.as_str())
        .and_then(|s| s.parse().ok())
        .or_else(|| {
            v.get(field)
                .and_then(|x| x.as_f64())
                .and_then(Decimal::from_f64_retain)
        })
        .unwrap_or_default()
}

fn decode_ack(v: &Value) -> OrderAck {
    OrderAck {
        order_id: v
            .get("orderId")
            .map(|x| x.to_string().trim_matches('"').to_string())
            .unwrap_or_default(),
        client_order_id: v
            .get("clientOrderId")
            .and_then(|x| x.as_str())
            .unwrap_or_default()
            .to_string(),
        status: v
            .get("status")
            .and_then(|x| x.as_str())
            .and_then(OrderStatus::from_exchange)
            .unwrap_or(OrderStatus::New),
        executed_qty: dec_field(v, "executedQty"),
        transact_time_ms: v
            .get("transactTime")
            .and_then(|x| x.as_u64())
            .unwrap_or(0),
    }
}

fn decode_open_order(v: &Value) -> Option<OpenOrder> {
    Some(OpenOrder {
        order_id: v.get("orderId")?.to_string().trim_matches('"').to_string(),
        client_order_id: v
            .get("clientOrderId")
            .and_then(|x| x.as_str())
            .unwrap_or_default()
            .to_string(),
        side: Side::from_str_loose(v.get("side")?.as_str()?)?,
        price: dec_field(v, "price"),
        orig_qty: dec_field(v, "origQty"),
        executed_qty: dec_field(v, "executedQty"),
        status: OrderStatus::from_exchange(v.get("status")?.as_str()?)?,
        update_time_ms: v.get("updateTime").and_then(|x| x.as_u64()).unwrap_or(0),
    })
}

#[async_trait]
impl Exchange for BinanceConnector {
    async fn get_orderbook(&self, symbol: &str, _depth: u32) -> Result<BookTop, ExchangeError> {
        let v = self
            .request(
                reqwest::Method::GET,
                "/api/v3/ticker/bookTicker",
                vec![("symbol", symbol.to_string())],
                false,
            )
            .await?;
        Ok(BookTop {
            bid: dec_field(&v, "bidPrice"),
            bid_qty: dec_field(&v, "bidQty"),
            ask: dec_field(&v, "askPrice"),
            ask_qty: dec_field(&v, "askQty"),
        })
    }

    async fn create_order(&self, req: &NewOrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", req.symbol.clone()),
            ("side", req.side.as_str().to_string()),
            ("type", req.order_type.clone()),
            ("quantity", req.qty.normalize().to_string()),
            ("price", format!("{:.5}", req.price)),
            ("newClientOrderId", req.client_order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if let Some(tif) = &req.time_in_force {
            params.push(("timeInForce", tif.clone()));
        }
        let v = self
            .request(reqwest::Method::POST, "/api/v3/order", params, true)
            .await?;
        Ok(decode_ack(&v))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, ExchangeError> {
        let v = self
            .request(
                reqwest::Method::DELETE,
                "/api/v3/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
                true,
            )
            .await?;
        Ok(decode_ack(&v))
    }

    async fn cancel_replace(
        &self,
        symbol: &str,
        cancel_order_id: &str,
        req: &NewOrderRequest,
    ) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("cancelOrderId", cancel_order_id.to_string()),
            ("cancelReplaceMode", "ALLOW_FAILURE".to_string()),
            ("side", req.side.as_str().to_string()),
            ("type", req.order_type.clone()),
            ("quantity", req.qty.normalize().to_string()),
            ("price", format!("{:.5}", req.price)),
            ("newClientOrderId", req.client_order_id.clone()),
        ];
        if let Some(tif) = &req.time_in_force {
            params.push(("timeInForce", tif.clone()));
        }
        let result = self
            .request(
                reqwest::Method::POST,
                "/api/v3/order/cancelReplace",
                params,
                true,
            )
            .await;
        match result {
            Ok(v) => {
                let new_order = v.get("newOrderResponse").unwrap_or(&v);
                Ok(decode_ack(new_order))
            }
            // -2022 with an inner -2011 means the old order was already gone
            // but the new one may have been placed; the payload carries it.
            Err(ExchangeError::Api { code: -2022, msg }) => {
                warn!("[connector] cancelReplace partial failure: {msg}");
                Err(ExchangeError::Api { code: -2022, msg })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let v = self
            .request(
                reqwest::Method::GET,
                "/api/v3/openOrders",
                vec![("symbol", symbol.to_string())],
                true,
            )
            .await?;
        Ok(v.as_array()
            .map(|arr| arr.iter().filter_map(decode_open_order).collect())
            .unwrap_or_default())
    }

    async fn get_account(&self) -> Result<AccountSnapshot, ExchangeError> {
        let v = self
            .request(reqwest::Method::GET, "/api/v3/account", vec![], true)
            .await?;
        let mut balances = HashMap::new();
        if let Some(arr) = v.get("balances").and_then(|b| b.as_array()) {
            for b in arr {
                let asset = b.get("asset").and_then(|a| a.as_str()).unwrap_or_default();
                if asset.is_empty() {
                    continue;
                }
                balances.insert(
                    asset.to_string(),
                    (dec_field(b, "free"), dec_field(b, "locked")),
                );
            }
        }
        Ok(AccountSnapshot { balances })
    }

    async fn get_exchange_info(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let v = self
            .request(
                reqwest::Method::GET,
                "/api/v3/exchangeInfo",
                vec![("symbol", symbol.to_string())],
                false,
            )
            .await?;
        let mut rules = SymbolRules {
            tick: Decimal::new(1, 5),
            step: Decimal::ONE,
            min_notional: Decimal::new(5, 0),
        };
        let filters = v
            .get("symbols")
            .and_then(|s| s.as_array())
            .and_then(|arr| arr.first())
            .and_then(|s| s.get("filters"))
            .and_then(|f| f.as_array());
        if let Some(filters) = filters {
            for f in filters {
                match f.get("filterType").and_then(|t| t.as_str()) {
                    Some("PRICE_FILTER") => rules.tick = dec_field(f, "tickSize").normalize(),
                    Some("LOT_SIZE") => rules.step = dec_field(f, "stepSize").normalize(),
                    Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                        rules.min_notional = dec_field(f, "minNotional").normalize()
                    }
                    _ => {}
                }
            }
        }
        debug!(
            "[connector] symbol rules tick={} step={} min_notional={}",
            rules.tick, rules.step, rules.min_notional
        );
        Ok(rules)
    }

    async fn create_listen_key(&self) -> Result<String, ExchangeError> {
        let v = self
            .request(
                reqwest::Method::POST,
                "/api/v3/userDataStream",
                vec![],
                false,
            )
            .await?;
        v.get("listenKey")
            .and_then(|k| k.as_str())
            .map(|k| k.to_string())
            .ok_or_else(|| ExchangeError::Transport("no listenKey in response".into()))
    }

    async fn keepalive_listen_key(&self, key: &str) -> Result<(), ExchangeError> {
        self.request(
            reqwest::Method::PUT,
            "/api/v3/userDataStream",
            vec![("listenKey", key.to_string())],
            false,
        )
        .await
        .map(|_| ())
    }

    async fn close_listen_key(&self, key: &str) -> Result<(), ExchangeError> {
        self.request(
            reqwest::Method::DELETE,
            "/api/v3/userDataStream",
            vec![("listenKey", key.to_string())],
            false,
        )
        .await
        .map(|_| ())
    }

    async fn open_ws(&self, url: &str) -> Result<WsSubscription, ExchangeError> {
        let parsed = Url::parse(url).map_err(|e| ExchangeError::Transport(e.to_string()))?;
        let connect = tokio::time::timeout(Duration::from_secs(10), connect_async(parsed.as_str()));
        let (ws, resp) = match connect.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(ExchangeError::Transport(format!("{e:?}"))),
            Err(_) => return Err(ExchangeError::Timeout),
        };
        debug!("[connector] WS connected status={:?}", resp.status());

        let (mut write, mut read) = ws.split();
        let (tx, rx) = mpsc::channel::<Value>(512);

        let handle = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            if tx.send(value).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        warn!("[connector] WS closed by server: {frame:?}");
                        break;
                    }
                    Err(e) => {
                        warn!("[connector] WS error: {e:?}");
                        break;
                    }
                    _ => {}
                }
            }
            // Dropping tx closes the channel; callers treat that as
            // disconnect and drive their own reconnect.
        });

        Ok(WsSubscription::new(rx, handle))
    }
}
