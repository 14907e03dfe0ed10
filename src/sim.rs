//! Concurrent stress simulation against the in-memory ledger.
//!
//! Spawns a crowd of traders hammering a set of markets in parallel,
//! then checks the bookkeeping invariants the engine promises:
//! per-side pool totals equal the sum of user holdings, cached odds
//! match the totals they derive from, and cash is conserved to the
//! ledger unit across trades, resolutions, and fees.

use std::env;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Result};
use rand::prelude::*;
use tracing::info;

use crate::config::MarketConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::lmsr::{price_yes, to_cash, Side};
use crate::mem_store::MemStore;
use crate::store::{LedgerStore, NewMarket, Outcome};

// Simulation parameters (defaults; override via SIM_* env vars)
const NUM_USERS: usize = 50;
const NUM_MARKETS: usize = 10;
const TRADES_PER_USER: usize = 200;
const LIQUIDITY_B: f64 = 500.0;
const STARTING_BALANCE: f64 = 1_000.0;
const SELL_PROBABILITY: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub num_users: usize,
    pub num_markets: usize,
    pub trades_per_user: usize,
    pub liquidity_b: f64,
    pub starting_balance: f64,
    pub sell_probability: f64,
}

impl SimConfig {
    pub fn from_env() -> Self {
        Self {
            num_users: env_usize("SIM_NUM_USERS", NUM_USERS),
            num_markets: env_usize("SIM_NUM_MARKETS", NUM_MARKETS),
            trades_per_user: env_usize("SIM_TRADES_PER_USER", TRADES_PER_USER),
            liquidity_b: env_f64("SIM_LIQUIDITY_B", LIQUIDITY_B),
            starting_balance: env_f64("SIM_STARTING_BALANCE", STARTING_BALANCE),
            sell_probability: env_f64("SIM_SELL_PROBABILITY", SELL_PROBABILITY).clamp(0.0, 1.0),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or(default)
}

pub async fn run(cfg: SimConfig) -> Result<()> {
    info!(?cfg, "starting simulation");

    let market_cfg = MarketConfig {
        default_b: cfg.liquidity_b,
        ..MarketConfig::default()
    };
    let pool_account = market_cfg.pool_account.clone();
    let engine = Arc::new(Engine::new(MemStore::new(0), market_cfg));

    let market_ids: Vec<String> = (0..cfg.num_markets).map(|i| format!("SIM{i}")).collect();
    for id in &market_ids {
        engine
            .create_market(
                NewMarket {
                    id: id.clone(),
                    question: format!("simulated market {id}"),
                    details: None,
                    subject: None,
                    creator: None,
                    b: cfg.liquidity_b,
                },
                true,
            )
            .await?;
    }

    let users: Vec<String> = (0..cfg.num_users).map(|i| format!("user{i}")).collect();
    for user in &users {
        engine.deposit(user, cfg.starting_balance).await?;
    }
    let total_deposited = to_cash(cfg.starting_balance) * cfg.num_users as i128;

    // unleash the traders
    let start = Instant::now();
    let mut tasks = Vec::with_capacity(cfg.num_users);
    for (i, user) in users.iter().enumerate() {
        let engine = Arc::clone(&engine);
        let market_ids = market_ids.clone();
        let user = user.clone();
        let trades = cfg.trades_per_user;
        let sell_probability = cfg.sell_probability;
        tasks.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(0xC0FFEE + i as u64);
            let mut executed = 0usize;
            for _ in 0..trades {
                let market = &market_ids[rng.gen_range(0..market_ids.len())];
                let side = if rng.gen_bool(0.5) { Side::Yes } else { Side::No };
                let result = if rng.gen_bool(sell_probability) {
                    let percent = rng.gen_range(10.0..=100.0);
                    engine.execute_sell(market, &user, side, percent).await
                } else {
                    let amount = rng.gen_range(1.0..=20.0);
                    engine.execute_buy(market, &user, side, amount).await
                };
                match result {
                    Ok(_) => executed += 1,
                    // broke traders and empty positions are expected
                    Err(EngineError::InsufficientCash | EngineError::InsufficientShares) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(executed)
        }));
    }

    let mut executed = 0usize;
    for task in tasks {
        executed += task.await??;
    }
    let elapsed = start.elapsed();
    info!(
        executed,
        elapsed_ms = elapsed.as_millis() as u64,
        trades_per_sec = (executed as f64 / elapsed.as_secs_f64()) as u64,
        "trading phase complete"
    );

    verify_trading_invariants(&engine, &users, &pool_account, total_deposited).await?;

    // resolve everything and re-check conservation
    for (i, id) in market_ids.iter().enumerate() {
        let outcome = match i % 3 {
            0 => Outcome::Yes,
            1 => Outcome::No,
            _ => Outcome::Half,
        };
        engine.resolve(id, outcome, true).await?;
        let leftovers = engine.store().market_positions(id).await?;
        ensure!(
            leftovers.is_empty(),
            "market {id} kept {} positions after resolution",
            leftovers.len()
        );
    }
    verify_cash_conservation(&engine, &users, &pool_account, total_deposited).await?;

    info!("simulation passed all invariant checks");
    Ok(())
}

/// Sum of user holdings per side must equal the pool totals, and cached
/// odds must match a recompute from those totals.
async fn verify_trading_invariants(
    engine: &Engine<MemStore>,
    users: &[String],
    pool_account: &str,
    total_deposited: i128,
) -> Result<()> {
    for market in engine.markets().await? {
        let positions = engine.store().market_positions(&market.id).await?;
        let held_yes: f64 = positions
            .iter()
            .filter(|p| p.side == Side::Yes)
            .map(|p| p.shares)
            .sum();
        let held_no: f64 = positions
            .iter()
            .filter(|p| p.side == Side::No)
            .map(|p| p.shares)
            .sum();

        let tolerance = 1e-6 * (1.0 + market.yes_shares.abs() + market.no_shares.abs());
        ensure!(
            (held_yes - market.yes_shares).abs() <= tolerance,
            "market {}: YES holdings {} != pool total {}",
            market.id,
            held_yes,
            market.yes_shares
        );
        ensure!(
            (held_no - market.no_shares).abs() <= tolerance,
            "market {}: NO holdings {} != pool total {}",
            market.id,
            held_no,
            market.no_shares
        );

        let recomputed = price_yes(market.yes_shares, market.no_shares, market.b);
        ensure!(
            (market.implied_odds - recomputed).abs() < 1e-12,
            "market {}: cached odds {} drifted from recompute {}",
            market.id,
            market.implied_odds,
            recomputed
        );
    }
    verify_cash_conservation(engine, users, pool_account, total_deposited).await
}

/// Deposits are the only cash source, so user balances plus the pool
/// balance must reproduce them exactly in ledger units.
async fn verify_cash_conservation(
    engine: &Engine<MemStore>,
    users: &[String],
    pool_account: &str,
    total_deposited: i128,
) -> Result<()> {
    let mut total: i128 = engine.store().get_balance(pool_account).await?.cash;
    for user in users {
        total += engine.store().get_balance(user).await?.cash;
    }
    ensure!(
        total == total_deposited,
        "cash not conserved: {total} != {total_deposited}"
    );
    Ok(())
}
