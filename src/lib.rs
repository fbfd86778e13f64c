//! doge-mm — execution core of a spot market-making system.
//!
//! Architecture (leaves first):
//!
//!   Clock/Config → EventLedger → ShadowBalance → AWG → Exchange trait
//!   → OrderMirror → UDS dual-WS ingester → DLE → TWAP rebalancer
//!   → Metrics/RiskBreaker → hedge DeltaBus → Engine (central owner)
//!
//! The `Engine` constructs everything at startup and hands each subsystem
//! `Arc` handles to exactly the collaborators it consumes — no globals, no
//! back-pointers. See `engine::Engine::start` for the task tree.

pub mod awg;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod dle;
pub mod engine;
pub mod exchange;
pub mod hedge;
pub mod ledger;
pub mod metrics;
pub mod mirror;
pub mod persist;
pub mod rebalancer;
pub mod shadow;
pub mod telemetry;
pub mod types;
pub mod uds;
