//! Ledger store contract: the narrow repository interface the engine
//! reads and writes through, plus the row types it traffics in.
//!
//! The engine computes a trade's full effect up front and hands the store
//! a set of mutations plus the log rows to append; `apply` commits them
//! all-or-nothing. Two implementations exist: [`crate::mem_store::MemStore`]
//! for tests and simulation, [`crate::pg_store::PgStore`] for Postgres.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::lmsr::{self, Side};

/// Resolution outcome. HALF settles every share at $0.50 regardless of side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
    Half,
}

impl Outcome {
    pub fn parse(s: &str) -> Option<Outcome> {
        match s.to_ascii_uppercase().as_str() {
            "YES" => Some(Outcome::Yes),
            "NO" => Some(Outcome::No),
            "HALF" => Some(Outcome::Half),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
            Outcome::Half => "HALF",
        }
    }

    /// Settlement value of one share held on `side`, before fees.
    pub fn share_value(&self, side: Side) -> f64 {
        match self {
            Outcome::Half => 0.5,
            Outcome::Yes if side == Side::Yes => 1.0,
            Outcome::No if side == Side::No => 1.0,
            _ => 0.0,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full market row: immutable metadata joined with live pool state.
#[derive(Debug, Clone, Serialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub details: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub b: f64,
    pub yes_shares: f64,
    pub no_shares: f64,
    pub resolved: bool,
    pub resolution: Option<Outcome>,
    pub resolution_date: Option<DateTime<Utc>>,
    pub implied_odds: f64,
    pub volume_traded: f64,
    pub last_trade: Option<DateTime<Utc>>,
}

impl Market {
    pub fn pool_state(&self) -> lmsr::PoolState {
        lmsr::PoolState {
            q_yes: self.yes_shares,
            q_no: self.no_shares,
            b: self.b,
        }
    }
}

/// Creation shape for a new market; pool state starts at zero shares.
#[derive(Debug, Clone)]
pub struct NewMarket {
    pub id: String,
    pub question: String,
    pub details: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub b: f64,
}

/// Cash account row. Cash is exact i128 ledger units (micro-dollars).
#[derive(Debug, Clone, Serialize)]
pub struct Balance {
    pub account: String,
    pub cash: i128,
    pub volume_traded: f64,
    pub volume_resolved: f64,
}

/// A user's holding on one side of one market. `shares` never goes
/// negative; the row disappears when it reaches zero.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub user: String,
    pub market: String,
    pub side: Side,
    pub shares: f64,
    pub cost_basis: i128,
    pub last_trade: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Deposit,
    Withdrawal,
    Transfer,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Deposit => "deposit",
            TransferKind::Withdrawal => "withdrawal",
            TransferKind::Transfer => "transfer",
        }
    }
}

/// One buy or sell. `shares` and `amount` are signed: positive for buys,
/// negative for sells. `balance_after` is filled in by the store at
/// commit time from the trader's post-mutation balance.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub user: String,
    pub market: String,
    pub side: Side,
    pub shares: f64,
    pub amount: i128,
    pub price: f64,
    pub balance_after: i128,
    pub at: DateTime<Utc>,
}

/// One deposit, withdrawal, or user-to-user transfer. `balance_after`
/// is the acting account's balance, filled in by the store.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub kind: TransferKind,
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: i128,
    pub balance_after: i128,
    pub at: DateTime<Utc>,
}

/// One user's settlement at resolution: the shares surrendered on one
/// side and the cash redeemed for them (zero for the losing side).
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionRecord {
    pub user: String,
    pub market: String,
    pub side: Side,
    pub outcome: Outcome,
    pub shares: f64,
    pub redeemed: i128,
    pub at: DateTime<Utc>,
}

/// Append-only audit rows; exactly one economic event each.
#[derive(Debug, Clone, Serialize)]
pub enum LogRecord {
    Trade(TradeRecord),
    Transfer(TransferRecord),
    Resolution(ResolutionRecord),
}

/// Typed field updates the engine can commit through `apply`. Mutations
/// that name a market operate on the market `apply` was scoped to.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Overwrite the pool totals and derived odds, bump traded volume,
    /// stamp the last-trade time.
    MarketTotals {
        q_yes: f64,
        q_no: f64,
        implied_odds: f64,
        volume_delta: f64,
        at: DateTime<Utc>,
    },
    /// Terminal transition to RESOLVED.
    MarkResolved { outcome: Outcome, at: DateTime<Utc> },
    /// Adjust an account's cash. Unless `allow_negative` (pool account
    /// only), the store must refuse a delta that would take the balance
    /// below zero and fail the whole apply with `InsufficientCash`.
    AdjustCash {
        account: String,
        delta: i128,
        allow_negative: bool,
    },
    /// Add to (or subtract from) a position; creates the row on first
    /// buy, removes it when shares reach zero. A subtraction past the
    /// held amount fails the whole apply with `InsufficientShares`.
    AdjustPosition {
        user: String,
        side: Side,
        shares_delta: f64,
        cost_delta: i128,
        at: DateTime<Utc>,
    },
    /// Drop a position row outright (redemption).
    RemovePosition { user: String, side: Side },
    /// Bump an account's cumulative volume counters.
    BumpVolume {
        account: String,
        traded: f64,
        resolved: f64,
    },
    /// Delete the market and cascade to its positions.
    CascadeDelete,
}

/// The repository interface between engine and durable state.
///
/// `apply` is the only write path: every mutation and log row in one call
/// commits atomically or not at all. Reads may lag writes issued by other
/// processes but never tear a row.
pub trait LedgerStore: Send + Sync + 'static {
    fn get_market(&self, id: &str) -> impl Future<Output = EngineResult<Option<Market>>> + Send;

    fn list_markets(&self) -> impl Future<Output = EngineResult<Vec<Market>>> + Send;

    /// Fetch an account's balance, creating it with the default opening
    /// balance on first touch.
    fn get_balance(&self, account: &str) -> impl Future<Output = EngineResult<Balance>> + Send;

    fn get_position(
        &self,
        user: &str,
        market: &str,
        side: Side,
    ) -> impl Future<Output = EngineResult<Option<Position>>> + Send;

    /// All live positions in one market, both sides.
    fn market_positions(
        &self,
        market: &str,
    ) -> impl Future<Output = EngineResult<Vec<Position>>> + Send;

    /// All live positions held by one user.
    fn user_positions(
        &self,
        user: &str,
    ) -> impl Future<Output = EngineResult<Vec<Position>>> + Send;

    /// Insert market metadata and zeroed pool state atomically; fails
    /// with `MarketExists` on a duplicate id.
    fn insert_market(&self, market: NewMarket)
        -> impl Future<Output = EngineResult<()>> + Send;

    /// Commit mutations plus log appends as one atomic unit. `market`
    /// scopes the market-level mutations; pure cash movements pass None.
    fn apply(
        &self,
        market: Option<&str>,
        mutations: Vec<Mutation>,
        logs: Vec<LogRecord>,
    ) -> impl Future<Output = EngineResult<()>> + Send;
}

/// Positions smaller than this are dust from float subtraction and get
/// dropped rather than stored.
pub const SHARE_EPSILON: f64 = 1e-9;
