//! Mock exchange for offline runs and tests.
//!
//! Mirrors the live connector's contract closely enough that the whole
//! engine runs against it unchanged: post-only crossing, min-notional,
//! lot-size and balance checks reject with the venue's error codes, cancels
//! of unknown orders return -2011, and injected user-stream events reach
//! every open websocket subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{
    AccountSnapshot, BookTop, Exchange, ExchangeError, NewOrderRequest, OpenOrder, OrderAck,
    WsSubscription,
};
use crate::types::{OrderStatus, Side, SymbolRules};

#[derive(Debug, Clone)]
struct MockOrder {
    order_id: String,
    client_order_id: String,
    side: Side,
    price: Decimal,
    orig_qty: Decimal,
    executed_qty: Decimal,
    cum_quote: Decimal,
    status: OrderStatus,
    update_id: u64,
}

#[derive(Debug, Default)]
struct CallCounts {
    create_order: u64,
    cancel_order: u64,
    open_orders: u64,
    account: u64,
    keepalive: u64,
}

struct MockState {
    bid: Decimal,
    ask: Decimal,
    rules: SymbolRules,
    balances: HashMap<String, (Decimal, Decimal)>,
    orders: HashMap<String, MockOrder>,
    ws_subscribers: Vec<mpsc::Sender<Value>>,
    calls: CallCounts,
    /// Errors to return from the next create_order calls (front first).
    scripted_rejects: Vec<ExchangeError>,
}

pub struct MockExchange {
    symbol: String,
    base: String,
    quote: String,
    seq: AtomicU64,
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(symbol: &str, base: &str, quote: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            seq: AtomicU64::new(1),
            state: Mutex::new(MockState {
                bid: dec!(0.23999),
                ask: dec!(0.24001),
                rules: SymbolRules {
                    tick: dec!(0.00001),
                    step: dec!(1),
                    min_notional: dec!(5),
                },
                balances: HashMap::from([
                    ("USDT".to_string(), (dec!(300), Decimal::ZERO)),
                    ("DOGE".to_string(), (dec!(1200), Decimal::ZERO)),
                ]),
                orders: HashMap::new(),
                ws_subscribers: Vec::new(),
                calls: CallCounts::default(),
                scripted_rejects: Vec::new(),
            }),
        }
    }

    pub fn set_book(&self, bid: Decimal, ask: Decimal) {
        let mut s = self.state.lock().unwrap();
        s.bid = bid;
        s.ask = ask;
    }

    pub fn set_balance(&self, asset: &str, free: Decimal, locked: Decimal) {
        let mut s = self.state.lock().unwrap();
        s.balances.insert(asset.to_string(), (free, locked));
    }

    /// Queue an error for the next create_order call.
    pub fn script_reject(&self, err: ExchangeError) {
        self.state.lock().unwrap().scripted_rejects.push(err);
    }

    pub fn open_order_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .count()
    }

    pub fn open_orders_calls(&self) -> u64 {
        self.state.lock().unwrap().calls.open_orders
    }

    pub fn keepalive_calls(&self) -> u64 {
        self.state.lock().unwrap().calls.keepalive
    }

    /// Drop every live websocket sender, closing subscriber channels the way
    /// a server-side disconnect would.
    pub fn close_ws_connections(&self) {
        self.state.lock().unwrap().ws_subscribers.clear();
    }

    pub fn ws_subscriber_count(&self) -> usize {
        self.state.lock().unwrap().ws_subscribers.len()
    }

    /// Push a raw event to every live websocket subscription.
    pub fn inject_ws_event(&self, event: Value) {
        let mut s = self.state.lock().unwrap();
        s.ws_subscribers.retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Fill part of a resting order and emit the matching executionReport
    /// on the user stream.
    pub fn fill_order(&self, order_id: &str, qty: Decimal, ts_ms: u64) {
        let event = {
            let mut s = self.state.lock().unwrap();
            let order = match s.orders.get_mut(order_id) {
                Some(o) if o.status.is_active() => o,
                _ => return,
            };
            let fill_qty = qty.min(order.orig_qty - order.executed_qty);
            order.executed_qty += fill_qty;
            order.cum_quote += fill_qty * order.price;
            order.update_id += 1;
            order.status = if order.executed_qty >= order.orig_qty {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            execution_report_event(order, "TRADE", ts_ms, fill_qty)
        };
        self.inject_ws_event(event);
    }

    fn create_order_inner(
        &self,
        req: &NewOrderRequest,
    ) -> Result<(OrderAck, Value), ExchangeError> {
        let mut s = self.state.lock().unwrap();
        s.calls.create_order += 1;

        if !s.scripted_rejects.is_empty() {
            return Err(s.scripted_rejects.remove(0));
        }

        // Post-only: crossing the book is rejected, not taken.
        if req.order_type == "LIMIT_MAKER" {
            let crosses = match req.side {
                Side::Buy => req.price >= s.ask,
                Side::Sell => req.price <= s.bid,
            };
            if crosses {
                return Err(ExchangeError::Api {
                    code: -2010,
                    msg: "Order would immediately match and take.".into(),
                });
            }
        }

        if req.qty % s.rules.step != Decimal::ZERO {
            return Err(ExchangeError::Api {
                code: -1013,
                msg: "Filter failure: LOT_SIZE".into(),
            });
        }
        if req.qty * req.price < s.rules.min_notional {
            return Err(ExchangeError::Api {
                code: -1013,
                msg: "Filter failure: NOTIONAL".into(),
            });
        }

        let (funding_asset, required) = match req.side {
            Side::Buy => (self.quote.clone(), req.qty * req.price),
            Side::Sell => (self.base.clone(), req.qty),
        };
        let bal = s.balances.entry(funding_asset).or_default();
        if bal.0 < required {
            return Err(ExchangeError::Api {
                code: -2010,
                msg: "Account has insufficient balance for requested action.".into(),
            });
        }
        bal.0 -= required;
        bal.1 += required;

        let order_id = self.seq.fetch_add(1, Ordering::Relaxed).to_string();
        let order = MockOrder {
            order_id: order_id.clone(),
            client_order_id: req.client_order_id.clone(),
            side: req.side,
            price: req.price,
            orig_qty: req.qty,
            executed_qty: Decimal::ZERO,
            cum_quote: Decimal::ZERO,
            status: OrderStatus::New,
            update_id: 1,
        };
        let event = execution_report_event(&order, "NEW", 0, Decimal::ZERO);
        s.orders.insert(order_id.clone(), order);

        let ack = OrderAck {
            order_id,
            client_order_id: req.client_order_id.clone(),
            status: OrderStatus::New,
            executed_qty: Decimal::ZERO,
            transact_time_ms: 0,
        };
        Ok((ack, event))
    }
}

/// Binance-style single-letter executionReport payload.
fn execution_report_event(order: &MockOrder, exec_type: &str, ts_ms: u64, last_qty: Decimal) -> Value {
    json!({
        "e": "executionReport",
        "E": ts_ms,
        "s": "DOGEUSDT",
        "c": order.client_order_id,
        "S": order.side.as_str(),
        "o": "LIMIT_MAKER",
        "x": exec_type,
        "X": order.status.as_str(),
        "i": order.order_id.parse::<u64>().unwrap_or(0),
        "p": order.price.to_string(),
        "q": order.orig_qty.to_string(),
        "z": order.executed_qty.to_string(),
        "Z": order.cum_quote.to_string(),
        "l": last_qty.to_string(),
        "L": order.price.to_string(),
        "g": -1,
        "t": if last_qty > Decimal::ZERO { order.update_id as i64 } else { -1 },
        "I": order.update_id,
        "T": ts_ms,
    })
}

#[async_trait]
impl Exchange for MockExchange {
    async fn get_orderbook(&self, _symbol: &str, _depth: u32) -> Result<BookTop, ExchangeError> {
        let s = self.state.lock().unwrap();
        Ok(BookTop {
            bid: s.bid,
            bid_qty: dec!(1000),
            ask: s.ask,
            ask_qty: dec!(1000),
        })
    }

    async fn create_order(&self, req: &NewOrderRequest) -> Result<OrderAck, ExchangeError> {
        let (ack, event) = self.create_order_inner(req)?;
        // The venue acknowledges on the user stream too.
        self.inject_ws_event(event);
        Ok(ack)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<OrderAck, ExchangeError> {
        let mut s = self.state.lock().unwrap();
        s.calls.cancel_order += 1;

        let order = match s.orders.get_mut(order_id) {
            Some(o) if o.status.is_active() => o,
            _ => {
                return Err(ExchangeError::Api {
                    code: -2011,
                    msg: "Unknown order sent.".into(),
                })
            }
        };
        order.status = OrderStatus::Canceled;
        order.update_id += 1;
        let ack = OrderAck {
            order_id: order.order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            status: OrderStatus::Canceled,
            executed_qty: order.executed_qty,
            transact_time_ms: 0,
        };

        let (side, price, residual) = (
            order.side,
            order.price,
            order.orig_qty - order.executed_qty,
        );
        let funding = match side {
            Side::Buy => (self.quote.clone(), residual * price),
            Side::Sell => (self.base.clone(), residual),
        };
        let bal = s.balances.entry(funding.0).or_default();
        bal.1 = (bal.1 - funding.1).max(Decimal::ZERO);
        bal.0 += funding.1;

        Ok(ack)
    }

    async fn cancel_replace(
        &self,
        symbol: &str,
        cancel_order_id: &str,
        req: &NewOrderRequest,
    ) -> Result<OrderAck, ExchangeError> {
        // An already-gone old order is idempotent success; placement proceeds.
        match self.cancel_order(symbol, cancel_order_id).await {
            Ok(_) => {}
            Err(e) if e.is_idempotent_cancel() => {}
            Err(e) => return Err(e),
        }
        self.create_order(req).await
    }

    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let mut s = self.state.lock().unwrap();
        s.calls.open_orders += 1;
        Ok(s.orders
            .values()
            .filter(|o| o.status.is_active())
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                client_order_id: o.client_order_id.clone(),
                side: o.side,
                price: o.price,
                orig_qty: o.orig_qty,
                executed_qty: o.executed_qty,
                status: o.status,
                update_time_ms: 0,
            })
            .collect())
    }

    async fn get_account(&self) -> Result<AccountSnapshot, ExchangeError> {
        let mut s = self.state.lock().unwrap();
        s.calls.account += 1;
        Ok(AccountSnapshot {
            balances: s.balances.clone(),
        })
    }

    async fn get_exchange_info(&self, _symbol: &str) -> Result<SymbolRules, ExchangeError> {
        Ok(self.state.lock().unwrap().rules)
    }

    async fn create_listen_key(&self) -> Result<String, ExchangeError> {
        Ok(format!("mock-listen-{}", self.symbol.to_lowercase()))
    }

    async fn keepalive_listen_key(&self, _key: &str) -> Result<(), ExchangeError> {
        self.state.lock().unwrap().calls.keepalive += 1;
        Ok(())
    }

    async fn close_listen_key(&self, _key: &str) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn open_ws(&self, _url: &str) -> Result<WsSubscription, ExchangeError> {
        let (tx, rx) = mpsc::channel(512);
        self.state.lock().unwrap().ws_subscribers.push(tx);
        // The subscription stays open until dropped; events arrive only via
        // inject_ws_event.
        let handle = tokio::spawn(futures::future::pending::<()>());
        Ok(WsSubscription::new(rx, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(side: Side, price: Decimal, qty: Decimal) -> NewOrderRequest {
        NewOrderRequest {
            symbol: "DOGEUSDT".into(),
            side,
            order_type: "LIMIT_MAKER".into(),
            qty,
            price,
            client_order_id: "c1".into(),
            time_in_force: None,
        }
    }

    #[tokio::test]
    async fn test_post_only_cross_rejected() {
        let ex = MockExchange::new("DOGEUSDT", "DOGE", "USDT");
        let err = ex
            .create_order(&req(Side::Buy, dec!(0.24001), dec!(100)))
            .await
            .unwrap_err();
        assert_eq!(super::super::RejectKind::classify(&err), super::super::RejectKind::MakerViolation);
    }

    #[tokio::test]
    async fn test_min_notional_and_lot_size() {
        let ex = MockExchange::new("DOGEUSDT", "DOGE", "USDT");
        let err = ex
            .create_order(&req(Side::Buy, dec!(0.23990), dec!(10)))
            .await
            .unwrap_err();
        assert_eq!(super::super::RejectKind::classify(&err), super::super::RejectKind::MinNotional);

        let err = ex
            .create_order(&req(Side::Buy, dec!(0.23990), dec!(100.5)))
            .await
            .unwrap_err();
        assert_eq!(super::super::RejectKind::classify(&err), super::super::RejectKind::LotSize);
    }

    #[tokio::test]
    async fn test_balance_locked_and_released_on_cancel() {
        let ex = MockExchange::new("DOGEUSDT", "DOGE", "USDT");
        let ack = ex
            .create_order(&req(Side::Buy, dec!(0.23990), dec!(100)))
            .await
            .unwrap();
        let account = ex.get_account().await.unwrap();
        assert_eq!(account.balances["USDT"].1, dec!(23.99));

        ex.cancel_order("DOGEUSDT", &ack.order_id).await.unwrap();
        let account = ex.get_account().await.unwrap();
        assert_eq!(account.balances["USDT"].0, dec!(300));
        assert_eq!(account.balances["USDT"].1, Decimal::ZERO);

        // Second cancel is the venue's idempotent -2011.
        let err = ex.cancel_order("DOGEUSDT", &ack.order_id).await.unwrap_err();
        assert!(err.is_idempotent_cancel());
    }

    #[tokio::test]
    async fn test_fill_emits_execution_report() {
        let ex = MockExchange::new("DOGEUSDT", "DOGE", "USDT");
        let mut sub = ex.open_ws("mock://user").await.unwrap();
        let ack = ex
            .create_order(&req(Side::Buy, dec!(0.23990), dec!(100)))
            .await
            .unwrap();

        ex.fill_order(&ack.order_id, dec!(40), 1_000);
        let ev = sub.events.recv().await.unwrap();
        assert_eq!(ev["e"], "executionReport");
        assert_eq!(ev["X"], "PARTIALLY_FILLED");
        assert_eq!(ev["z"], "40");
    }
}
