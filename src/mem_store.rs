//! In-memory ledger store.
//!
//! Backs the test suite and the stress simulator. One `RwLock` over the
//! row arena; every lock scope is short and never held across an await,
//! so `apply` is trivially atomic and reads never see a torn row.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::lmsr::Side;
use crate::store::{
    Balance, LedgerStore, LogRecord, Market, Mutation, NewMarket, Position, ResolutionRecord,
    TradeRecord, TransferKind, TransferRecord, SHARE_EPSILON,
};

#[derive(Default)]
struct Inner {
    markets: HashMap<String, Market>,
    balances: HashMap<String, Balance>,
    // keyed (user, market, side)
    positions: HashMap<(String, String, Side), Position>,
    trades: Vec<TradeRecord>,
    transfers: Vec<TransferRecord>,
    resolutions: Vec<ResolutionRecord>,
}

pub struct MemStore {
    default_balance: i128,
    inner: RwLock<Inner>,
}

impl MemStore {
    pub fn new(default_balance: i128) -> Self {
        Self {
            default_balance,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Audit-log snapshots for assertions.
    pub fn trade_log(&self) -> Vec<TradeRecord> {
        self.inner.read().unwrap().trades.clone()
    }

    pub fn transfer_log(&self) -> Vec<TransferRecord> {
        self.inner.read().unwrap().transfers.clone()
    }

    pub fn resolution_log(&self) -> Vec<ResolutionRecord> {
        self.inner.read().unwrap().resolutions.clone()
    }

    fn ensure_balance<'a>(
        inner: &'a mut Inner,
        account: &str,
        default_balance: i128,
    ) -> &'a mut Balance {
        inner
            .balances
            .entry(account.to_string())
            .or_insert_with(|| Balance {
                account: account.to_string(),
                cash: default_balance,
                volume_traded: 0.0,
                volume_resolved: 0.0,
            })
    }

    /// Reject any guarded mutation before touching a single row.
    fn precheck(inner: &Inner, market: Option<&str>, mutations: &[Mutation]) -> EngineResult<()> {
        if let Some(id) = market {
            if !inner.markets.contains_key(id) {
                return Err(EngineError::MarketNotFound(id.to_string()));
            }
        }

        let mut cash_deltas: HashMap<&str, (i128, bool)> = HashMap::new();
        let mut share_deltas: HashMap<(&str, Side), f64> = HashMap::new();
        for m in mutations {
            match m {
                Mutation::AdjustCash {
                    account,
                    delta,
                    allow_negative,
                } => {
                    let entry = cash_deltas.entry(account.as_str()).or_insert((0, true));
                    entry.0 += delta;
                    entry.1 &= allow_negative;
                }
                Mutation::AdjustPosition {
                    user,
                    side,
                    shares_delta,
                    ..
                } => {
                    *share_deltas.entry((user.as_str(), *side)).or_insert(0.0) += shares_delta;
                }
                _ => {}
            }
        }

        for (account, (delta, allow_negative)) in cash_deltas {
            if allow_negative {
                continue;
            }
            let held = inner
                .balances
                .get(account)
                .map(|b| b.cash)
                .unwrap_or_default();
            if held + delta < 0 {
                return Err(EngineError::InsufficientCash);
            }
        }
        if let Some(id) = market {
            for ((user, side), delta) in share_deltas {
                if delta >= 0.0 {
                    continue;
                }
                let held = inner
                    .positions
                    .get(&(user.to_string(), id.to_string(), side))
                    .map(|p| p.shares)
                    .unwrap_or_default();
                if held + delta < -SHARE_EPSILON {
                    return Err(EngineError::InsufficientShares);
                }
            }
        }
        Ok(())
    }

    fn apply_mutation(
        inner: &mut Inner,
        market: Option<&str>,
        mutation: Mutation,
        default_balance: i128,
    ) {
        match mutation {
            Mutation::MarketTotals {
                q_yes,
                q_no,
                implied_odds,
                volume_delta,
                at,
            } => {
                if let Some(row) = market.and_then(|id| inner.markets.get_mut(id)) {
                    row.yes_shares = q_yes;
                    row.no_shares = q_no;
                    row.implied_odds = implied_odds;
                    row.volume_traded += volume_delta;
                    row.last_trade = Some(at);
                }
            }
            Mutation::MarkResolved { outcome, at } => {
                if let Some(row) = market.and_then(|id| inner.markets.get_mut(id)) {
                    row.resolved = true;
                    row.resolution = Some(outcome);
                    row.resolution_date = Some(at);
                }
            }
            Mutation::AdjustCash { account, delta, .. } => {
                let bal = Self::ensure_balance(inner, &account, default_balance);
                bal.cash += delta;
            }
            Mutation::AdjustPosition {
                user,
                side,
                shares_delta,
                cost_delta,
                at,
            } => {
                let Some(id) = market else { return };
                let key = (user.clone(), id.to_string(), side);
                let pos = inner.positions.entry(key).or_insert_with(|| Position {
                    user,
                    market: id.to_string(),
                    side,
                    shares: 0.0,
                    cost_basis: 0,
                    last_trade: at,
                });
                pos.shares += shares_delta;
                pos.cost_basis = (pos.cost_basis + cost_delta).max(0);
                pos.last_trade = at;
                if pos.shares <= SHARE_EPSILON {
                    let key = (pos.user.clone(), pos.market.clone(), side);
                    inner.positions.remove(&key);
                }
            }
            Mutation::RemovePosition { user, side } => {
                if let Some(id) = market {
                    inner.positions.remove(&(user, id.to_string(), side));
                }
            }
            Mutation::BumpVolume {
                account,
                traded,
                resolved,
            } => {
                let bal = Self::ensure_balance(inner, &account, default_balance);
                bal.volume_traded += traded;
                bal.volume_resolved += resolved;
            }
            Mutation::CascadeDelete => {
                if let Some(id) = market {
                    inner.positions.retain(|(_, m, _), _| m != id);
                    inner.markets.remove(id);
                }
            }
        }
    }

    fn append_log(inner: &mut Inner, log: LogRecord, default_balance: i128) {
        match log {
            LogRecord::Trade(mut rec) => {
                rec.balance_after = Self::ensure_balance(inner, &rec.user, default_balance).cash;
                inner.trades.push(rec);
            }
            LogRecord::Transfer(mut rec) => {
                let acting = match rec.kind {
                    TransferKind::Deposit => rec.to.clone(),
                    TransferKind::Withdrawal | TransferKind::Transfer => rec.from.clone(),
                };
                if let Some(account) = acting {
                    rec.balance_after =
                        Self::ensure_balance(inner, &account, default_balance).cash;
                }
                inner.transfers.push(rec);
            }
            LogRecord::Resolution(rec) => inner.resolutions.push(rec),
        }
    }
}

impl LedgerStore for MemStore {
    fn get_market(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = EngineResult<Option<Market>>> + Send {
        async move { Ok(self.inner.read().unwrap().markets.get(id).cloned()) }
    }

    fn list_markets(&self) -> impl std::future::Future<Output = EngineResult<Vec<Market>>> + Send {
        async move {
            let inner = self.inner.read().unwrap();
            let mut markets: Vec<Market> = inner.markets.values().cloned().collect();
            markets.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(markets)
        }
    }

    fn get_balance(
        &self,
        account: &str,
    ) -> impl std::future::Future<Output = EngineResult<Balance>> + Send {
        async move {
            let mut inner = self.inner.write().unwrap();
            Ok(Self::ensure_balance(&mut inner, account, self.default_balance).clone())
        }
    }

    fn get_position(
        &self,
        user: &str,
        market: &str,
        side: Side,
    ) -> impl std::future::Future<Output = EngineResult<Option<Position>>> + Send {
        async move {
            let key = (user.to_string(), market.to_string(), side);
            Ok(self.inner.read().unwrap().positions.get(&key).cloned())
        }
    }

    fn market_positions(
        &self,
        market: &str,
    ) -> impl std::future::Future<Output = EngineResult<Vec<Position>>> + Send {
        async move {
            let inner = self.inner.read().unwrap();
            let mut positions: Vec<Position> = inner
                .positions
                .values()
                .filter(|p| p.market == market)
                .cloned()
                .collect();
            positions.sort_by(|a, b| a.user.cmp(&b.user));
            Ok(positions)
        }
    }

    fn user_positions(
        &self,
        user: &str,
    ) -> impl std::future::Future<Output = EngineResult<Vec<Position>>> + Send {
        async move {
            let inner = self.inner.read().unwrap();
            let mut positions: Vec<Position> = inner
                .positions
                .values()
                .filter(|p| p.user == user)
                .cloned()
                .collect();
            positions.sort_by(|a, b| (&a.market, a.side.as_str()).cmp(&(&b.market, b.side.as_str())));
            Ok(positions)
        }
    }

    fn insert_market(
        &self,
        market: NewMarket,
    ) -> impl std::future::Future<Output = EngineResult<()>> + Send {
        async move {
            let mut inner = self.inner.write().unwrap();
            if inner.markets.contains_key(&market.id) {
                return Err(EngineError::MarketExists(market.id));
            }
            let row = Market {
                id: market.id.clone(),
                question: market.question,
                details: market.details,
                subject: market.subject,
                creator: market.creator,
                b: market.b,
                yes_shares: 0.0,
                no_shares: 0.0,
                resolved: false,
                resolution: None,
                resolution_date: None,
                implied_odds: 0.5,
                volume_traded: 0.0,
                last_trade: None,
            };
            inner.markets.insert(market.id, row);
            Ok(())
        }
    }

    fn apply(
        &self,
        market: Option<&str>,
        mutations: Vec<Mutation>,
        logs: Vec<LogRecord>,
    ) -> impl std::future::Future<Output = EngineResult<()>> + Send {
        async move {
            let mut inner = self.inner.write().unwrap();
            Self::precheck(&inner, market, &mutations)?;
            for mutation in mutations {
                Self::apply_mutation(&mut inner, market, mutation, self.default_balance);
            }
            for log in logs {
                Self::append_log(&mut inner, log, self.default_balance);
            }
            Ok(())
        }
    }
}
