//! Core domain types shared across the engine.

use std::time::Instant;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Side> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Exchange order status. Terminal states never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    /// Parse exchange status strings. `PARTIAL_FILL` shows up on some event
    /// paths as an alias for `PARTIALLY_FILLED`.
    pub fn from_exchange(s: &str) -> Option<OrderStatus> {
        match s {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" | "PARTIAL_FILL" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Canceled),
            "EXPIRED" => Some(OrderStatus::Expired),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// Quote ladder tier. L0 sits closest to the touch and carries the highest
/// placement priority and the shortest TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Layer {
    L0,
    L1,
    L2,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::L0 => "L0",
            Layer::L1 => "L1",
            Layer::L2 => "L2",
        }
    }

    /// Placement priority, larger first.
    pub fn priority(&self) -> u8 {
        match self {
            Layer::L0 => 3,
            Layer::L1 => 2,
            Layer::L2 => 1,
        }
    }

    pub fn all() -> [Layer; 3] {
        [Layer::L0, Layer::L1, Layer::L2]
    }
}

/// Normalized execution report, decoded from the user-data-stream
/// `executionReport` payload (single-letter fields) or from a REST order
/// response. Cumulative quantities drive the delta-based balance updates.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub order_id: String,
    pub client_order_id: String,
    pub update_id: u64,
    pub side: Side,
    pub status: OrderStatus,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub cum_qty: Decimal,
    pub cum_quote: Decimal,
    pub last_qty: Decimal,
    pub last_price: Decimal,
    pub fee: Option<Decimal>,
    pub fee_asset: Option<String>,
    pub trade_id: i64,
    pub ts_ms: u64,
}

/// Spot fill published on the hedge bus. The perp-side hedger consumes these;
/// we only produce them.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub ts_ms: u64,
}

/// Top-of-book snapshot used by planning.
#[derive(Debug, Clone, Copy)]
pub struct MarketView {
    pub bid: Decimal,
    pub ask: Decimal,
    pub ts: Instant,
}

impl MarketView {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    pub fn is_ready(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO && self.ask >= self.bid
    }
}

/// Symbol trading rules fetched from exchange info.
#[derive(Debug, Clone, Copy)]
pub struct SymbolRules {
    pub tick: Decimal,
    pub step: Decimal,
    pub min_notional: Decimal,
}

/// Stable price-level key at the symbol's 5-dp price scale, so level counts
/// survive Decimal re-scaling.
pub fn price_key(px: Decimal) -> String {
    format!("{:.5}", px)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_status_alias_parse() {
        assert_eq!(
            OrderStatus::from_exchange("PARTIAL_FILL"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(OrderStatus::from_exchange("CANCELLED"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::from_exchange("???"), None);
    }

    #[test]
    fn test_mid_and_price_key() {
        let mv = MarketView {
            bid: dec!(0.23999),
            ask: dec!(0.24001),
            ts: Instant::now(),
        };
        assert_eq!(mv.mid(), dec!(0.24000));
        assert_eq!(price_key(dec!(0.24)), "0.24000");
        assert_eq!(price_key(dec!(0.239990)), "0.23999");
    }

    #[test]
    fn test_layer_priority_order() {
        assert!(Layer::L0.priority() > Layer::L1.priority());
        assert!(Layer::L1.priority() > Layer::L2.priority());
    }
}
