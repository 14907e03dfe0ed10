//! Market engine: validates, solves, and commits trades, resolutions,
//! redemptions, and cash movements as atomic units.
//!
//! Concurrency discipline: every mutation of one market's totals runs
//! under that market's keyed async lock, so same-market trades serialize
//! while different markets proceed in parallel. Pure cash movements rely
//! on the store's atomic apply and its non-negative balance guard.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::config::MarketConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, MarketEvent};
use crate::lmsr::{from_cash, to_cash, Side};
use crate::store::{
    Balance, LedgerStore, LogRecord, Market, Mutation, NewMarket, Outcome, Position,
    ResolutionRecord, TradeRecord, TransferKind, TransferRecord, SHARE_EPSILON,
};

/// Result of one committed buy or sell.
#[derive(Debug, Clone, Serialize)]
pub struct TradeReceipt {
    pub market_id: String,
    pub user: String,
    pub side: Side,
    /// Signed: positive for buys, negative for sells.
    pub shares_delta: f64,
    /// Ledger units moved: the debit for buys, the credit for sells.
    pub amount: i128,
    /// Average price per share for this fill.
    pub price: f64,
    /// Implied YES odds after the trade.
    pub new_price: f64,
    /// Trader's cash after the trade, in ledger units.
    pub balance: i128,
}

/// Result of one user's settlement against a resolved market.
#[derive(Debug, Clone, Serialize)]
pub struct RedeemReceipt {
    pub market_id: String,
    pub user: String,
    pub outcome: Outcome,
    pub shares_redeemed: f64,
    pub payout: i128,
}

/// Market-wide summary returned from `resolve`.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionSummary {
    pub market_id: String,
    pub question: String,
    pub outcome: Outcome,
    /// Implied YES odds at the moment of resolution.
    pub implied_odds: f64,
    pub total_paid: i128,
    pub total_lost_shares: f64,
}

struct Settlement {
    payout: i128,
    shares_redeemed: f64,
    lost_shares: f64,
}

pub struct Engine<S> {
    store: S,
    cfg: MarketConfig,
    events: EventBus,
    market_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<S: LedgerStore> Engine<S> {
    pub fn new(store: S, cfg: MarketConfig) -> Self {
        Self {
            store,
            cfg,
            events: EventBus::new(),
            market_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &MarketConfig {
        &self.cfg
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn market_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.market_locks.lock().unwrap();
        locks.entry(id.to_string()).or_default().clone()
    }

    // -----------------------
    // Admin operations
    // -----------------------

    pub async fn create_market(&self, mut new: NewMarket, is_admin: bool) -> EngineResult<Market> {
        if !is_admin {
            return Err(EngineError::Unauthorized);
        }
        if !new.b.is_finite() || new.b <= 0.0 {
            return Err(EngineError::InvalidAmount);
        }
        new.id = new.id.trim().to_string();
        if new.id.is_empty() {
            return Err(EngineError::InvalidAmount);
        }

        self.store.insert_market(new.clone()).await?;
        info!(market = %new.id, b = new.b, "market created");
        self.events.publish(MarketEvent::MarketCreated {
            market_id: new.id.clone(),
            question: new.question.clone(),
            b: new.b,
        });
        self.market(&new.id).await
    }

    pub async fn delete_market(&self, market_id: &str, is_admin: bool) -> EngineResult<()> {
        if !is_admin {
            return Err(EngineError::Unauthorized);
        }
        let lock = self.market_lock(market_id);
        let _guard = lock.lock().await;

        if self.store.get_market(market_id).await?.is_none() {
            return Err(EngineError::MarketNotFound(market_id.to_string()));
        }
        self.store
            .apply(Some(market_id), vec![Mutation::CascadeDelete], vec![])
            .await?;
        info!(market = %market_id, "market deleted");
        Ok(())
    }

    // -----------------------
    // Trading
    // -----------------------

    /// Spend `amount` dollars buying shares on `side`.
    pub async fn execute_buy(
        &self,
        market_id: &str,
        user: &str,
        side: Side,
        amount: f64,
    ) -> EngineResult<TradeReceipt> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(EngineError::InvalidAmount);
        }

        let lock = self.market_lock(market_id);
        let _guard = lock.lock().await;

        let market = self
            .store
            .get_market(market_id)
            .await?
            .ok_or_else(|| EngineError::MarketNotFound(market_id.to_string()))?;
        if market.resolved {
            return Err(EngineError::MarketAlreadyResolved(market_id.to_string()));
        }

        let spend_cash = to_cash(amount);
        let balance = self.store.get_balance(user).await?;
        if balance.cash < spend_cash {
            return Err(EngineError::InsufficientCash);
        }

        let mut pool = market.pool_state();
        let (shares, debit) = pool.apply_buy(side, spend_cash)?;
        let new_price = pool.price_yes();
        let avg_price = from_cash(debit) / shares;
        let now = Utc::now();

        let mutations = vec![
            Mutation::AdjustCash {
                account: user.to_string(),
                delta: -debit,
                allow_negative: false,
            },
            Mutation::AdjustCash {
                account: self.cfg.pool_account.clone(),
                delta: debit,
                allow_negative: true,
            },
            Mutation::MarketTotals {
                q_yes: pool.q_yes,
                q_no: pool.q_no,
                implied_odds: new_price,
                volume_delta: from_cash(debit),
                at: now,
            },
            Mutation::AdjustPosition {
                user: user.to_string(),
                side,
                shares_delta: shares,
                cost_delta: debit,
                at: now,
            },
            Mutation::BumpVolume {
                account: user.to_string(),
                traded: from_cash(debit),
                resolved: 0.0,
            },
        ];
        let log = LogRecord::Trade(TradeRecord {
            user: user.to_string(),
            market: market_id.to_string(),
            side,
            shares,
            amount: debit,
            price: avg_price,
            balance_after: 0,
            at: now,
        });
        self.store.apply(Some(market_id), mutations, vec![log]).await?;

        debug!(market = %market_id, user = %user, %side, shares, "buy committed");
        self.events.publish(MarketEvent::TradeExecuted {
            market_id: market_id.to_string(),
            user: user.to_string(),
            side,
            shares,
            amount: from_cash(debit),
            implied_odds: new_price,
        });

        Ok(TradeReceipt {
            market_id: market_id.to_string(),
            user: user.to_string(),
            side,
            shares_delta: shares,
            amount: debit,
            price: avg_price,
            new_price,
            balance: balance.cash - debit,
        })
    }

    /// Sell `percent` (in (0, 100]) of the shares held on `side`.
    pub async fn execute_sell(
        &self,
        market_id: &str,
        user: &str,
        side: Side,
        percent: f64,
    ) -> EngineResult<TradeReceipt> {
        if !percent.is_finite() || percent <= 0.0 || percent > 100.0 {
            return Err(EngineError::InvalidPercent);
        }

        let lock = self.market_lock(market_id);
        let _guard = lock.lock().await;

        let market = self
            .store
            .get_market(market_id)
            .await?
            .ok_or_else(|| EngineError::MarketNotFound(market_id.to_string()))?;
        if market.resolved {
            return Err(EngineError::MarketAlreadyResolved(market_id.to_string()));
        }

        let position = self
            .store
            .get_position(user, market_id, side)
            .await?
            .filter(|p| p.shares > SHARE_EPSILON)
            .ok_or(EngineError::InsufficientShares)?;

        let selling_all = percent >= 100.0;
        let shares_to_sell = if selling_all {
            position.shares
        } else {
            position.shares * percent / 100.0
        };
        let cost_removed = if selling_all {
            position.cost_basis
        } else {
            (position.cost_basis as f64 * percent / 100.0).round() as i128
        };

        let balance = self.store.get_balance(user).await?;

        let mut pool = market.pool_state();
        let gross = pool.apply_sell(side, shares_to_sell)?;
        let credit = if self.cfg.sell_fee > 0.0 {
            to_cash(from_cash(gross) * (1.0 - self.cfg.sell_fee))
        } else {
            gross
        };
        let new_price = pool.price_yes();
        let avg_price = from_cash(credit) / shares_to_sell;
        let now = Utc::now();

        let mutations = vec![
            Mutation::AdjustCash {
                account: user.to_string(),
                delta: credit,
                allow_negative: false,
            },
            Mutation::AdjustCash {
                account: self.cfg.pool_account.clone(),
                delta: -credit,
                allow_negative: true,
            },
            Mutation::MarketTotals {
                q_yes: pool.q_yes,
                q_no: pool.q_no,
                implied_odds: new_price,
                volume_delta: from_cash(credit),
                at: now,
            },
            Mutation::AdjustPosition {
                user: user.to_string(),
                side,
                shares_delta: -shares_to_sell,
                cost_delta: -cost_removed,
                at: now,
            },
            Mutation::BumpVolume {
                account: user.to_string(),
                traded: from_cash(credit),
                resolved: 0.0,
            },
        ];
        let log = LogRecord::Trade(TradeRecord {
            user: user.to_string(),
            market: market_id.to_string(),
            side,
            shares: -shares_to_sell,
            amount: -credit,
            price: avg_price,
            balance_after: 0,
            at: now,
        });
        self.store.apply(Some(market_id), mutations, vec![log]).await?;

        debug!(market = %market_id, user = %user, %side, shares = shares_to_sell, "sell committed");
        self.events.publish(MarketEvent::TradeExecuted {
            market_id: market_id.to_string(),
            user: user.to_string(),
            side,
            shares: -shares_to_sell,
            amount: -from_cash(credit),
            implied_odds: new_price,
        });

        Ok(TradeReceipt {
            market_id: market_id.to_string(),
            user: user.to_string(),
            side,
            shares_delta: -shares_to_sell,
            amount: credit,
            price: avg_price,
            new_price,
            balance: balance.cash + credit,
        })
    }

    // -----------------------
    // Resolution / redemption
    // -----------------------

    /// Fix the market's outcome and eagerly settle every holder. Each
    /// user's settlement commits atomically on its own, so a failure
    /// partway leaves the rest redeemable via `redeem`.
    pub async fn resolve(
        &self,
        market_id: &str,
        outcome: Outcome,
        is_admin: bool,
    ) -> EngineResult<ResolutionSummary> {
        if !is_admin {
            return Err(EngineError::Unauthorized);
        }

        let lock = self.market_lock(market_id);
        let _guard = lock.lock().await;

        let market = self
            .store
            .get_market(market_id)
            .await?
            .ok_or_else(|| EngineError::MarketNotFound(market_id.to_string()))?;
        if market.resolved {
            return Err(EngineError::MarketAlreadyResolved(market_id.to_string()));
        }

        let implied_odds = market.pool_state().price_yes();
        let now = Utc::now();
        self.store
            .apply(
                Some(market_id),
                vec![Mutation::MarkResolved { outcome, at: now }],
                vec![],
            )
            .await?;

        let mut by_user: BTreeMap<String, Vec<Position>> = BTreeMap::new();
        for position in self.store.market_positions(market_id).await? {
            by_user.entry(position.user.clone()).or_default().push(position);
        }

        let mut total_paid: i128 = 0;
        let mut total_lost_shares = 0.0;
        for (user, positions) in by_user {
            let settlement = self
                .settle_positions(market_id, &user, outcome, &positions)
                .await?;
            total_paid += settlement.payout;
            total_lost_shares += settlement.lost_shares;
        }

        info!(
            market = %market_id,
            %outcome,
            total_paid = from_cash(total_paid),
            "market resolved"
        );
        self.events.publish(MarketEvent::MarketResolved {
            market_id: market_id.to_string(),
            outcome,
            implied_odds,
            total_paid: from_cash(total_paid),
            total_lost_shares,
        });

        Ok(ResolutionSummary {
            market_id: market_id.to_string(),
            question: market.question,
            outcome,
            implied_odds,
            total_paid,
            total_lost_shares,
        })
    }

    /// Settle one user against a resolved market. Idempotent: once the
    /// positions are gone a repeat call pays nothing.
    pub async fn redeem(&self, market_id: &str, user: &str) -> EngineResult<RedeemReceipt> {
        let lock = self.market_lock(market_id);
        let _guard = lock.lock().await;

        let market = self
            .store
            .get_market(market_id)
            .await?
            .ok_or_else(|| EngineError::MarketNotFound(market_id.to_string()))?;
        if !market.resolved {
            return Err(EngineError::MarketStillOpen(market_id.to_string()));
        }
        let outcome = market.resolution.ok_or_else(|| {
            EngineError::StoreUnavailable("resolved market has no outcome".to_string())
        })?;

        let mut positions = Vec::new();
        for side in [Side::Yes, Side::No] {
            if let Some(p) = self.store.get_position(user, market_id, side).await? {
                if p.shares > SHARE_EPSILON {
                    positions.push(p);
                }
            }
        }
        if positions.is_empty() {
            // already redeemed (or never held): explicit no-op
            return Ok(RedeemReceipt {
                market_id: market_id.to_string(),
                user: user.to_string(),
                outcome,
                shares_redeemed: 0.0,
                payout: 0,
            });
        }

        let settlement = self
            .settle_positions(market_id, user, outcome, &positions)
            .await?;
        Ok(RedeemReceipt {
            market_id: market_id.to_string(),
            user: user.to_string(),
            outcome,
            shares_redeemed: settlement.shares_redeemed,
            payout: settlement.payout,
        })
    }

    /// Build and commit one user's settlement: cash credit, position
    /// removal, and resolution log rows, as one atomic apply.
    async fn settle_positions(
        &self,
        market_id: &str,
        user: &str,
        outcome: Outcome,
        positions: &[Position],
    ) -> EngineResult<Settlement> {
        let now = Utc::now();
        let mut payout: i128 = 0;
        let mut shares_redeemed = 0.0;
        let mut lost_shares = 0.0;
        let mut mutations = Vec::new();
        let mut logs = Vec::new();

        for position in positions {
            if position.shares <= SHARE_EPSILON {
                continue;
            }
            let rate = outcome.share_value(position.side);
            let redeemed = to_cash(position.shares * rate * (1.0 - self.cfg.redeem_fee));
            if rate > 0.0 {
                shares_redeemed += position.shares;
            } else {
                lost_shares += position.shares;
            }
            payout += redeemed;
            mutations.push(Mutation::RemovePosition {
                user: user.to_string(),
                side: position.side,
            });
            logs.push(LogRecord::Resolution(ResolutionRecord {
                user: user.to_string(),
                market: market_id.to_string(),
                side: position.side,
                outcome,
                shares: position.shares,
                redeemed,
                at: now,
            }));
        }

        if payout > 0 {
            mutations.push(Mutation::AdjustCash {
                account: user.to_string(),
                delta: payout,
                allow_negative: false,
            });
            mutations.push(Mutation::AdjustCash {
                account: self.cfg.pool_account.clone(),
                delta: -payout,
                allow_negative: true,
            });
            mutations.push(Mutation::BumpVolume {
                account: user.to_string(),
                traded: 0.0,
                resolved: from_cash(payout),
            });
        }

        self.store.apply(Some(market_id), mutations, logs).await?;
        debug!(market = %market_id, user = %user, payout = from_cash(payout), "position settled");

        Ok(Settlement {
            payout,
            shares_redeemed,
            lost_shares,
        })
    }

    // -----------------------
    // Cash movements
    // -----------------------

    pub async fn deposit(&self, user: &str, amount: f64) -> EngineResult<Balance> {
        let delta = Self::check_amount(amount)?;
        let now = Utc::now();
        self.store
            .apply(
                None,
                vec![Mutation::AdjustCash {
                    account: user.to_string(),
                    delta,
                    allow_negative: false,
                }],
                vec![LogRecord::Transfer(TransferRecord {
                    kind: TransferKind::Deposit,
                    from: None,
                    to: Some(user.to_string()),
                    amount: delta,
                    balance_after: 0,
                    at: now,
                })],
            )
            .await?;
        self.store.get_balance(user).await
    }

    pub async fn withdraw(&self, user: &str, amount: f64) -> EngineResult<Balance> {
        let delta = Self::check_amount(amount)?;
        let now = Utc::now();
        self.store
            .apply(
                None,
                vec![Mutation::AdjustCash {
                    account: user.to_string(),
                    delta: -delta,
                    allow_negative: false,
                }],
                vec![LogRecord::Transfer(TransferRecord {
                    kind: TransferKind::Withdrawal,
                    from: Some(user.to_string()),
                    to: None,
                    amount: delta,
                    balance_after: 0,
                    at: now,
                })],
            )
            .await?;
        self.store.get_balance(user).await
    }

    pub async fn transfer(&self, from: &str, to: &str, amount: f64) -> EngineResult<Balance> {
        let delta = Self::check_amount(amount)?;
        if from == to {
            return Err(EngineError::InvalidAmount);
        }
        let now = Utc::now();
        self.store
            .apply(
                None,
                vec![
                    Mutation::AdjustCash {
                        account: from.to_string(),
                        delta: -delta,
                        allow_negative: false,
                    },
                    Mutation::AdjustCash {
                        account: to.to_string(),
                        delta,
                        allow_negative: false,
                    },
                ],
                vec![LogRecord::Transfer(TransferRecord {
                    kind: TransferKind::Transfer,
                    from: Some(from.to_string()),
                    to: Some(to.to_string()),
                    amount: delta,
                    balance_after: 0,
                    at: now,
                })],
            )
            .await?;
        self.store.get_balance(from).await
    }

    fn check_amount(amount: f64) -> EngineResult<i128> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(EngineError::InvalidAmount);
        }
        Ok(to_cash(amount))
    }

    // -----------------------
    // Read surface
    // -----------------------

    pub async fn market(&self, market_id: &str) -> EngineResult<Market> {
        self.store
            .get_market(market_id)
            .await?
            .ok_or_else(|| EngineError::MarketNotFound(market_id.to_string()))
    }

    pub async fn markets(&self) -> EngineResult<Vec<Market>> {
        self.store.list_markets().await
    }

    pub async fn balance(&self, user: &str) -> EngineResult<Balance> {
        self.store.get_balance(user).await
    }

    pub async fn positions(&self, user: &str) -> EngineResult<Vec<Position>> {
        self.store.user_positions(user).await
    }
}
