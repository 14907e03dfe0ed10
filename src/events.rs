//! Broadcast side-channel for market activity.
//!
//! The front-end fans these out to WebSocket subscribers; the engine just
//! publishes and never blocks on slow consumers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::lmsr::Side;
use crate::store::Outcome;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    MarketCreated {
        market_id: String,
        question: String,
        b: f64,
    },
    TradeExecuted {
        market_id: String,
        user: String,
        side: Side,
        shares: f64,
        amount: f64,
        implied_odds: f64,
    },
    MarketResolved {
        market_id: String,
        outcome: Outcome,
        implied_odds: f64,
        total_paid: f64,
        total_lost_shares: f64,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MarketEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish, dropping the event when nobody is listening.
    pub fn publish(&self, event: MarketEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
