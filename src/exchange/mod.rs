//! Exchange capability surface.
//!
//! Everything the core needs from the venue is behind the `Exchange` trait:
//! the live connector and the mock implement it identically, and every other
//! component programs against `Arc<dyn Exchange>`. Wire-level details
//! (signing, URL shape, rate-limit headers) stay inside the connector.

pub mod binance;
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::{OrderStatus, Side, SymbolRules};

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ExchangeError {
    /// Rate-limit class responses: -1003, 429, 418, -1015.
    RateLimited { code: i64 },
    /// Any other exchange error payload `{code, msg}`.
    Api { code: i64, msg: String },
    /// REST call exceeded the hard timeout.
    Timeout,
    /// Connection-level failure.
    Transport(String),
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::RateLimited { code } => write!(f, "rate limited ({code})"),
            ExchangeError::Api { code, msg } => write!(f, "exchange error {code}: {msg}"),
            ExchangeError::Timeout => write!(f, "request timeout"),
            ExchangeError::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl ExchangeError {
    pub fn code(&self) -> Option<i64> {
        match self {
            ExchangeError::RateLimited { code } => Some(*code),
            ExchangeError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ExchangeError::RateLimited { .. })
    }

    /// Cancel responses that mean "already gone" and count as success.
    pub fn is_idempotent_cancel(&self) -> bool {
        match self {
            ExchangeError::Api { code, msg } => {
                *code == -2011 || msg.contains("Unknown order")
            }
            _ => false,
        }
    }
}

/// Placement-rejection classification driving the DLE reject counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectKind {
    MakerViolation,
    MinNotional,
    LotSize,
    InsufficientBalance,
    Other,
}

impl RejectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectKind::MakerViolation => "maker",
            RejectKind::MinNotional => "min_notional",
            RejectKind::LotSize => "lot_size",
            RejectKind::InsufficientBalance => "balance",
            RejectKind::Other => "other",
        }
    }

    pub fn classify(err: &ExchangeError) -> RejectKind {
        let msg = match err {
            ExchangeError::Api { msg, .. } => msg.to_ascii_lowercase(),
            _ => return RejectKind::Other,
        };
        if msg.contains("would immediately match") || msg.contains("maker") {
            RejectKind::MakerViolation
        } else if msg.contains("notional") {
            RejectKind::MinNotional
        } else if msg.contains("lot_size") || msg.contains("lot size") {
            RejectKind::LotSize
        } else if msg.contains("insufficient") || msg.contains("balance") {
            RejectKind::InsufficientBalance
        } else {
            RejectKind::Other
        }
    }
}

// ─────────────────────────────────────────────────────────
// Request / response types
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewOrderRequest {
    pub symbol: String,
    pub side: Side,
    /// "LIMIT_MAKER" for quoting flow, "LIMIT" with an IOC tif for takers.
    pub order_type: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub client_order_id: String,
    pub time_in_force: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub transact_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub status: OrderStatus,
    pub update_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BookTop {
    pub bid: Decimal,
    pub bid_qty: Decimal,
    pub ask: Decimal,
    pub ask_qty: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct AccountSnapshot {
    /// asset → (free, locked)
    pub balances: HashMap<String, (Decimal, Decimal)>,
}

/// A live websocket subscription: raw JSON events arrive on `events`; the
/// channel closing means the connection died and the caller should reconnect.
pub struct WsSubscription {
    pub events: mpsc::Receiver<Value>,
    handle: tokio::task::JoinHandle<()>,
}

impl WsSubscription {
    pub fn new(events: mpsc::Receiver<Value>, handle: tokio::task::JoinHandle<()>) -> Self {
        Self { events, handle }
    }
}

impl Drop for WsSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ─────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_orderbook(&self, symbol: &str, depth: u32) -> Result<BookTop, ExchangeError>;

    async fn create_order(&self, req: &NewOrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, ExchangeError>;

    /// Atomic cancel+new. An inner cancel failing with -2011 is surfaced as
    /// success with the new order's ack, matching venue semantics.
    async fn cancel_replace(
        &self,
        symbol: &str,
        cancel_order_id: &str,
        req: &NewOrderRequest,
    ) -> Result<OrderAck, ExchangeError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn get_account(&self) -> Result<AccountSnapshot, ExchangeError>;

    async fn get_exchange_info(&self, symbol: &str) -> Result<SymbolRules, ExchangeError>;

    async fn create_listen_key(&self) -> Result<String, ExchangeError>;

    async fn keepalive_listen_key(&self, key: &str) -> Result<(), ExchangeError>;

    async fn close_listen_key(&self, key: &str) -> Result<(), ExchangeError>;

    /// Open a raw websocket subscription to `url`.
    async fn open_ws(&self, url: &str) -> Result<WsSubscription, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_cancel_codes() {
        let unknown = ExchangeError::Api {
            code: -2011,
            msg: "Unknown order sent.".into(),
        };
        assert!(unknown.is_idempotent_cancel());
        let by_msg = ExchangeError::Api {
            code: -2013,
            msg: "Unknown order".into(),
        };
        assert!(by_msg.is_idempotent_cancel());
        let other = ExchangeError::Api {
            code: -2010,
            msg: "rejected".into(),
        };
        assert!(!other.is_idempotent_cancel());
    }

    #[test]
    fn test_reject_classification() {
        let maker = ExchangeError::Api {
            code: -2010,
            msg: "Order would immediately match and take.".into(),
        };
        assert_eq!(RejectKind::classify(&maker), RejectKind::MakerViolation);
        let notional = ExchangeError::Api {
            code: -1013,
            msg: "Filter failure: NOTIONAL".into(),
        };
        assert_eq!(RejectKind::classify(&notional), RejectKind::MinNotional);
        let lot = ExchangeError::Api {
            code: -1013,
            msg: "Filter failure: LOT_SIZE".into(),
        };
        assert_eq!(RejectKind::classify(&lot), RejectKind::LotSize);
        let bal = ExchangeError::Api {
            code: -2010,
            msg: "Account has insufficient balance for requested action.".into(),
        };
        assert_eq!(RejectKind::classify(&bal), RejectKind::InsufficientBalance);
        assert_eq!(RejectKind::classify(&ExchangeError::Timeout), RejectKind::Other);
    }
}
