//! Engine scenario tests against the in-memory ledger.

use std::sync::Arc;

use crate::config::MarketConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::lmsr::{self, from_cash, to_cash, Side};
use crate::mem_store::MemStore;
use crate::store::{LedgerStore, NewMarket, Outcome, TransferKind};

const REDEEM_FEE: f64 = 0.05;

fn test_engine() -> Engine<MemStore> {
    let cfg = MarketConfig {
        default_b: 100.0,
        default_balance: 0.0,
        redeem_fee: REDEEM_FEE,
        sell_fee: 0.0,
        pool_account: "AMM".to_string(),
    };
    Engine::new(MemStore::new(0), cfg)
}

async fn engine_with_market(id: &str, b: f64) -> Engine<MemStore> {
    let engine = test_engine();
    engine
        .create_market(
            NewMarket {
                id: id.to_string(),
                question: format!("test market {id}"),
                details: None,
                subject: None,
                creator: Some("admin".to_string()),
                b,
            },
            true,
        )
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn buy_resolve_redeem_scenario() {
    let engine = engine_with_market("EVENT", 25.0).await;

    let market = engine.market("EVENT").await.unwrap();
    assert!((market.implied_odds - 0.5).abs() < 1e-12);

    engine.deposit("alice", 1_000.0).await.unwrap();
    let receipt = engine
        .execute_buy("EVENT", "alice", Side::Yes, 100.0)
        .await
        .unwrap();
    let dq = receipt.shares_delta;
    assert!(dq > 0.0);
    assert!(receipt.new_price > 0.5);
    assert_eq!(receipt.amount, to_cash(100.0));

    let position = engine
        .store()
        .get_position("alice", "EVENT", Side::Yes)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.shares, dq);
    assert_eq!(position.cost_basis, to_cash(100.0));

    let balance = engine.balance("alice").await.unwrap();
    assert_eq!(balance.cash, to_cash(900.0));

    // resolution settles the winner at $1 per share minus the fee
    let summary = engine.resolve("EVENT", Outcome::Yes, true).await.unwrap();
    let expected_payout = to_cash(dq * 1.0 * (1.0 - REDEEM_FEE));
    assert_eq!(summary.total_paid, expected_payout);

    let balance = engine.balance("alice").await.unwrap();
    assert_eq!(balance.cash, to_cash(900.0) + expected_payout);

    // second redemption is a no-op, never a double credit
    let receipt = engine.redeem("EVENT", "alice").await.unwrap();
    assert_eq!(receipt.payout, 0);
    assert_eq!(receipt.shares_redeemed, 0.0);
    let balance = engine.balance("alice").await.unwrap();
    assert_eq!(balance.cash, to_cash(900.0) + expected_payout);
}

#[tokio::test]
async fn concurrent_buys_compose_sequentially() {
    let b = 100.0;
    let engine = Arc::new(engine_with_market("RACE", b).await);
    engine.deposit("alice", 500.0).await.unwrap();
    engine.deposit("bob", 500.0).await.unwrap();

    let e1 = Arc::clone(&engine);
    let e2 = Arc::clone(&engine);
    let t1 = tokio::spawn(async move { e1.execute_buy("RACE", "alice", Side::Yes, 50.0).await });
    let t2 = tokio::spawn(async move { e2.execute_buy("RACE", "bob", Side::Yes, 50.0).await });
    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();

    // no lost update: the result must equal solving buy 1 then buy 2 on
    // the updated totals, which by path independence is one $100 buy
    let expected = lmsr::shares_for_spend(Side::Yes, 0.0, 0.0, b, 100.0).unwrap();
    let market = engine.market("RACE").await.unwrap();
    assert!(
        (market.yes_shares - expected).abs() < 1e-9,
        "q_yes={} expected={}",
        market.yes_shares,
        expected
    );

    let positions = engine.store().market_positions("RACE").await.unwrap();
    let held: f64 = positions.iter().map(|p| p.shares).sum();
    assert!((held - market.yes_shares).abs() < 1e-12);
}

#[tokio::test]
async fn insufficient_cash_leaves_no_trace() {
    let engine = engine_with_market("POOR", 100.0).await;
    engine.deposit("alice", 10.0).await.unwrap();

    let result = engine.execute_buy("POOR", "alice", Side::Yes, 50.0).await;
    assert!(matches!(result, Err(EngineError::InsufficientCash)));

    let balance = engine.balance("alice").await.unwrap();
    assert_eq!(balance.cash, to_cash(10.0));
    assert_eq!(balance.volume_traded, 0.0);

    let market = engine.market("POOR").await.unwrap();
    assert_eq!(market.yes_shares, 0.0);
    assert_eq!(market.volume_traded, 0.0);
    assert!(engine.store().trade_log().is_empty());
}

#[tokio::test]
async fn resolved_market_refuses_trading() {
    let engine = engine_with_market("DONE", 100.0).await;
    engine.deposit("alice", 100.0).await.unwrap();
    engine
        .execute_buy("DONE", "alice", Side::No, 20.0)
        .await
        .unwrap();
    engine.resolve("DONE", Outcome::No, true).await.unwrap();

    assert!(matches!(
        engine.execute_buy("DONE", "alice", Side::Yes, 10.0).await,
        Err(EngineError::MarketAlreadyResolved(_))
    ));
    assert!(matches!(
        engine.execute_sell("DONE", "alice", Side::No, 50.0).await,
        Err(EngineError::MarketAlreadyResolved(_))
    ));
    // and a second resolution is refused too
    assert!(matches!(
        engine.resolve("DONE", Outcome::Yes, true).await,
        Err(EngineError::MarketAlreadyResolved(_))
    ));
}

#[tokio::test]
async fn redeem_requires_resolution() {
    let engine = engine_with_market("OPEN", 100.0).await;
    engine.deposit("alice", 100.0).await.unwrap();
    engine
        .execute_buy("OPEN", "alice", Side::Yes, 50.0)
        .await
        .unwrap();

    assert!(matches!(
        engine.redeem("OPEN", "alice").await,
        Err(EngineError::MarketStillOpen(_))
    ));
}

#[tokio::test]
async fn sell_validates_percent_and_holdings() {
    let engine = engine_with_market("SELL", 100.0).await;
    engine.deposit("alice", 200.0).await.unwrap();
    engine
        .execute_buy("SELL", "alice", Side::Yes, 100.0)
        .await
        .unwrap();

    for bad in [0.0, -10.0, 100.5, f64::NAN] {
        assert!(matches!(
            engine.execute_sell("SELL", "alice", Side::Yes, bad).await,
            Err(EngineError::InvalidPercent)
        ));
    }
    // holding YES does not entitle selling NO
    assert!(matches!(
        engine.execute_sell("SELL", "alice", Side::No, 50.0).await,
        Err(EngineError::InsufficientShares)
    ));
    assert!(matches!(
        engine.execute_sell("SELL", "bob", Side::Yes, 50.0).await,
        Err(EngineError::InsufficientShares)
    ));
}

#[tokio::test]
async fn sell_round_trip_returns_the_spend() {
    let engine = engine_with_market("TRIP", 100.0).await;
    engine.deposit("alice", 100.0).await.unwrap();
    let spend = to_cash(100.0);
    engine
        .execute_buy("TRIP", "alice", Side::Yes, 100.0)
        .await
        .unwrap();

    let half = engine
        .execute_sell("TRIP", "alice", Side::Yes, 50.0)
        .await
        .unwrap();
    let position = engine
        .store()
        .get_position("alice", "TRIP", Side::Yes)
        .await
        .unwrap()
        .unwrap();
    assert!((position.shares - (-half.shares_delta)).abs() < 1e-9);

    let rest = engine
        .execute_sell("TRIP", "alice", Side::Yes, 100.0)
        .await
        .unwrap();
    assert!(engine
        .store()
        .get_position("alice", "TRIP", Side::Yes)
        .await
        .unwrap()
        .is_none());

    // same convex path both ways: payouts reproduce the spend up to one
    // ledger unit of rounding, and never profit beyond it
    let total = half.amount + rest.amount;
    assert!((total - spend).abs() <= 1, "total={total} spend={spend}");

    let market = engine.market("TRIP").await.unwrap();
    assert!(market.yes_shares.abs() < 1e-9);
}

#[tokio::test]
async fn pool_totals_match_user_holdings() {
    let engine = engine_with_market("SUM", 50.0).await;
    for user in ["alice", "bob", "carol"] {
        engine.deposit(user, 300.0).await.unwrap();
    }
    engine
        .execute_buy("SUM", "alice", Side::Yes, 80.0)
        .await
        .unwrap();
    engine
        .execute_buy("SUM", "bob", Side::No, 120.0)
        .await
        .unwrap();
    engine
        .execute_buy("SUM", "carol", Side::Yes, 40.0)
        .await
        .unwrap();
    engine
        .execute_sell("SUM", "alice", Side::Yes, 25.0)
        .await
        .unwrap();

    let market = engine.market("SUM").await.unwrap();
    let positions = engine.store().market_positions("SUM").await.unwrap();
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
    assert!((held_yes - market.yes_shares).abs() < 1e-9);
    assert!((held_no - market.no_shares).abs() < 1e-9);

    // cached odds never drift from the totals they derive from
    let recomputed = lmsr::price_yes(market.yes_shares, market.no_shares, market.b);
    assert!((market.implied_odds - recomputed).abs() < 1e-12);
}

#[tokio::test]
async fn half_outcome_settles_both_sides_at_fifty_cents() {
    let engine = engine_with_market("HALF", 100.0).await;
    engine.deposit("alice", 100.0).await.unwrap();
    engine.deposit("bob", 100.0).await.unwrap();
    let yes = engine
        .execute_buy("HALF", "alice", Side::Yes, 60.0)
        .await
        .unwrap();
    let no = engine
        .execute_buy("HALF", "bob", Side::No, 40.0)
        .await
        .unwrap();

    engine.resolve("HALF", Outcome::Half, true).await.unwrap();

    let alice = engine.balance("alice").await.unwrap();
    let bob = engine.balance("bob").await.unwrap();
    assert_eq!(
        alice.cash,
        to_cash(40.0) + to_cash(yes.shares_delta * 0.5 * (1.0 - REDEEM_FEE))
    );
    assert_eq!(
        bob.cash,
        to_cash(60.0) + to_cash(no.shares_delta * 0.5 * (1.0 - REDEEM_FEE))
    );

    let log = engine.store().resolution_log();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|r| r.outcome == Outcome::Half));
}

#[tokio::test]
async fn transfers_move_cash_and_write_logs() {
    let engine = test_engine();

    engine.deposit("alice", 100.0).await.unwrap();
    assert!(matches!(
        engine.withdraw("alice", 150.0).await,
        Err(EngineError::InsufficientCash)
    ));
    assert!(matches!(
        engine.transfer("alice", "alice", 10.0).await,
        Err(EngineError::InvalidAmount)
    ));
    assert!(matches!(
        engine.deposit("alice", -5.0).await,
        Err(EngineError::InvalidAmount)
    ));

    engine.transfer("alice", "bob", 30.0).await.unwrap();
    let alice = engine.balance("alice").await.unwrap();
    let bob = engine.balance("bob").await.unwrap();
    assert_eq!(alice.cash, to_cash(70.0));
    assert_eq!(bob.cash, to_cash(30.0));

    engine.withdraw("bob", 30.0).await.unwrap();
    assert_eq!(engine.balance("bob").await.unwrap().cash, 0);

    let log = engine.store().transfer_log();
    let kinds: Vec<TransferKind> = log.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TransferKind::Deposit,
            TransferKind::Transfer,
            TransferKind::Withdrawal
        ]
    );
    // the failed withdrawal and self-transfer left no rows
    assert_eq!(log.len(), 3);
}

#[tokio::test]
async fn create_market_guards() {
    let engine = engine_with_market("DUP", 100.0).await;

    let dup = NewMarket {
        id: "DUP".to_string(),
        question: "again".to_string(),
        details: None,
        subject: None,
        creator: None,
        b: 100.0,
    };
    assert!(matches!(
        engine.create_market(dup.clone(), true).await,
        Err(EngineError::MarketExists(_))
    ));
    assert!(matches!(
        engine.create_market(dup.clone(), false).await,
        Err(EngineError::Unauthorized)
    ));

    let mut bad_b = dup.clone();
    bad_b.id = "BADB".to_string();
    bad_b.b = 0.0;
    assert!(matches!(
        engine.create_market(bad_b, true).await,
        Err(EngineError::InvalidAmount)
    ));

    assert!(matches!(
        engine.execute_buy("MISSING", "alice", Side::Yes, 10.0).await,
        Err(EngineError::MarketNotFound(_))
    ));
}

#[tokio::test]
async fn delete_market_cascades_positions() {
    let engine = engine_with_market("GONE", 100.0).await;
    engine.deposit("alice", 100.0).await.unwrap();
    engine
        .execute_buy("GONE", "alice", Side::Yes, 50.0)
        .await
        .unwrap();

    assert!(matches!(
        engine.delete_market("GONE", false).await,
        Err(EngineError::Unauthorized)
    ));
    engine.delete_market("GONE", true).await.unwrap();

    assert!(matches!(
        engine.market("GONE").await,
        Err(EngineError::MarketNotFound(_))
    ));
    assert!(engine
        .store()
        .get_position("alice", "GONE", Side::Yes)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn trade_log_records_post_trade_balance() {
    let engine = engine_with_market("LOG", 100.0).await;
    engine.deposit("alice", 500.0).await.unwrap();
    engine
        .execute_buy("LOG", "alice", Side::Yes, 100.0)
        .await
        .unwrap();

    let log = engine.store().trade_log();
    assert_eq!(log.len(), 1);
    let trade = &log[0];
    assert_eq!(trade.user, "alice");
    assert_eq!(trade.amount, to_cash(100.0));
    assert_eq!(trade.balance_after, to_cash(400.0));
    assert!(trade.shares > 0.0);
    assert!((trade.price - from_cash(trade.amount) / trade.shares).abs() < 1e-12);
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    use crate::events::MarketEvent;

    let engine = test_engine();
    let mut rx = engine.events().subscribe();

    engine
        .create_market(
            NewMarket {
                id: "EVT".to_string(),
                question: "events?".to_string(),
                details: None,
                subject: None,
                creator: None,
                b: 100.0,
            },
            true,
        )
        .await
        .unwrap();
    engine.deposit("alice", 100.0).await.unwrap();
    engine
        .execute_buy("EVT", "alice", Side::Yes, 50.0)
        .await
        .unwrap();
    engine.resolve("EVT", Outcome::Yes, true).await.unwrap();

    assert!(matches!(
        rx.recv().await.unwrap(),
        MarketEvent::MarketCreated { .. }
    ));
    assert!(matches!(
        rx.recv().await.unwrap(),
        MarketEvent::TradeExecuted { shares, .. } if shares > 0.0
    ));
    assert!(matches!(
        rx.recv().await.unwrap(),
        MarketEvent::MarketResolved { outcome: Outcome::Yes, .. }
    ));
}

#[tokio::test]
async fn unauthorized_resolution_is_refused() {
    let engine = engine_with_market("AUTH", 100.0).await;
    assert!(matches!(
        engine.resolve("AUTH", Outcome::Yes, false).await,
        Err(EngineError::Unauthorized)
    ));
    let market = engine.market("AUTH").await.unwrap();
    assert!(!market.resolved);
}
