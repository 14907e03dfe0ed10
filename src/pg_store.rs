//! PostgreSQL ledger store.
//!
//! Every `apply` runs in one SERIALIZABLE transaction; a serialization
//! failure surfaces as the retryable `StoreConflict` and nothing commits.
//! Cash lives in BIGINT ledger units; share quantities in NUMERIC columns
//! converted through `rust_decimal` at this boundary.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::lmsr::Side;
use crate::store::{
    Balance, LedgerStore, LogRecord, Market, Mutation, NewMarket, Outcome, Position,
    TransferKind, SHARE_EPSILON,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS market_info (
        market_id TEXT PRIMARY KEY,
        question TEXT NOT NULL,
        details TEXT,
        subject TEXT,
        creator_id TEXT,
        b DOUBLE PRECISION NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS market_data (
        market_id TEXT PRIMARY KEY REFERENCES market_info(market_id) ON DELETE CASCADE,
        yes_shares NUMERIC NOT NULL DEFAULT 0,
        no_shares NUMERIC NOT NULL DEFAULT 0,
        resolved BOOLEAN NOT NULL DEFAULT FALSE,
        resolution TEXT,
        resolution_date TIMESTAMPTZ,
        implied_odds NUMERIC NOT NULL DEFAULT 0.5,
        volume_traded NUMERIC NOT NULL DEFAULT 0,
        last_trade TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS balances (
        account TEXT PRIMARY KEY,
        cash_ledger BIGINT NOT NULL DEFAULT 0,
        volume_traded NUMERIC NOT NULL DEFAULT 0,
        volume_resolved NUMERIC NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS positions (
        user_id TEXT NOT NULL,
        market_id TEXT NOT NULL REFERENCES market_data(market_id) ON DELETE CASCADE,
        side TEXT NOT NULL,
        shares NUMERIC NOT NULL,
        cost_ledger BIGINT NOT NULL DEFAULT 0,
        last_trade TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (user_id, market_id, side)
    )",
    "CREATE TABLE IF NOT EXISTS trades (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        market_id TEXT NOT NULL,
        side TEXT NOT NULL,
        shares NUMERIC NOT NULL,
        amount_ledger BIGINT NOT NULL,
        price NUMERIC NOT NULL,
        balance_ledger BIGINT NOT NULL,
        at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transfers (
        id BIGSERIAL PRIMARY KEY,
        kind TEXT NOT NULL,
        from_user TEXT,
        to_user TEXT,
        amount_ledger BIGINT NOT NULL,
        balance_ledger BIGINT NOT NULL,
        at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS resolutions (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        market_id TEXT NOT NULL,
        side TEXT NOT NULL,
        outcome TEXT NOT NULL,
        shares NUMERIC NOT NULL,
        redeemed_ledger BIGINT NOT NULL,
        at TIMESTAMPTZ NOT NULL
    )",
];

const MARKET_COLUMNS: &str = "i.market_id, i.question, i.details, i.subject, i.creator_id, i.b, \
     d.yes_shares, d.no_shares, d.resolved, d.resolution, d.resolution_date, \
     d.implied_odds, d.volume_traded, d.last_trade";

pub struct PgStore {
    pool: PgPool,
    default_balance: i128,
}

impl PgStore {
    pub async fn connect(database_url: &str, default_balance: i128) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;
        info!("connected to postgres");
        Ok(Self {
            pool,
            default_balance,
        })
    }

    /// Create any missing tables.
    pub async fn migrate(&self) -> EngineResult<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn ensure_balance_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO balances (account, cash_ledger) VALUES ($1, $2)
             ON CONFLICT (account) DO NOTHING",
        )
        .bind(account)
        .bind(self.default_balance as i64)
        .execute(tx.as_mut())
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn apply_mutation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        market: Option<&str>,
        mutation: &Mutation,
    ) -> EngineResult<()> {
        match mutation {
            Mutation::MarketTotals {
                q_yes,
                q_no,
                implied_odds,
                volume_delta,
                at,
            } => {
                let id = market.ok_or_else(missing_scope)?;
                let rows = sqlx::query(
                    "UPDATE market_data SET
                        yes_shares = $1,
                        no_shares = $2,
                        implied_odds = $3,
                        volume_traded = volume_traded + $4,
                        last_trade = $5
                     WHERE market_id = $6",
                )
                .bind(f64_to_dec(*q_yes)?)
                .bind(f64_to_dec(*q_no)?)
                .bind(f64_to_dec(*implied_odds)?)
                .bind(f64_to_dec(*volume_delta)?)
                .bind(*at)
                .bind(id)
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?
                .rows_affected();
                if rows == 0 {
                    return Err(EngineError::MarketNotFound(id.to_string()));
                }
            }
            Mutation::MarkResolved { outcome, at } => {
                let id = market.ok_or_else(missing_scope)?;
                let rows = sqlx::query(
                    "UPDATE market_data SET resolved = TRUE, resolution = $1, resolution_date = $2
                     WHERE market_id = $3 AND resolved = FALSE",
                )
                .bind(outcome.as_str())
                .bind(*at)
                .bind(id)
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?
                .rows_affected();
                if rows == 0 {
                    return Err(EngineError::MarketAlreadyResolved(id.to_string()));
                }
            }
            Mutation::AdjustCash {
                account,
                delta,
                allow_negative,
            } => {
                self.ensure_balance_row(tx, account).await?;
                let query = if *allow_negative {
                    "UPDATE balances SET cash_ledger = cash_ledger + $1 WHERE account = $2"
                } else {
                    "UPDATE balances SET cash_ledger = cash_ledger + $1
                     WHERE account = $2 AND cash_ledger + $1 >= 0"
                };
                let rows = sqlx::query(query)
                    .bind(*delta as i64)
                    .bind(account)
                    .execute(tx.as_mut())
                    .await
                    .map_err(map_sqlx)?
                    .rows_affected();
                if rows == 0 {
                    return Err(EngineError::InsufficientCash);
                }
            }
            Mutation::AdjustPosition {
                user,
                side,
                shares_delta,
                cost_delta,
                at,
            } => {
                let id = market.ok_or_else(missing_scope)?;
                if *shares_delta >= 0.0 {
                    sqlx::query(
                        "INSERT INTO positions (user_id, market_id, side, shares, cost_ledger, last_trade)
                         VALUES ($1, $2, $3, $4, $5, $6)
                         ON CONFLICT (user_id, market_id, side) DO UPDATE SET
                            shares = positions.shares + $4,
                            cost_ledger = GREATEST(positions.cost_ledger + $5, 0),
                            last_trade = $6",
                    )
                    .bind(user)
                    .bind(id)
                    .bind(side.as_str())
                    .bind(f64_to_dec(*shares_delta)?)
                    .bind(*cost_delta as i64)
                    .bind(*at)
                    .execute(tx.as_mut())
                    .await
                    .map_err(map_sqlx)?;
                } else {
                    let rows = sqlx::query(
                        "UPDATE positions SET
                            shares = shares + $4,
                            cost_ledger = GREATEST(cost_ledger + $5, 0),
                            last_trade = $6
                         WHERE user_id = $1 AND market_id = $2 AND side = $3
                           AND shares + $4 >= $7",
                    )
                    .bind(user)
                    .bind(id)
                    .bind(side.as_str())
                    .bind(f64_to_dec(*shares_delta)?)
                    .bind(*cost_delta as i64)
                    .bind(*at)
                    .bind(f64_to_dec(-SHARE_EPSILON)?)
                    .execute(tx.as_mut())
                    .await
                    .map_err(map_sqlx)?
                    .rows_affected();
                    if rows == 0 {
                        return Err(EngineError::InsufficientShares);
                    }
                }
                // drop dust rows left by float subtraction
                sqlx::query(
                    "DELETE FROM positions
                     WHERE user_id = $1 AND market_id = $2 AND side = $3 AND shares <= $4",
                )
                .bind(user)
                .bind(id)
                .bind(side.as_str())
                .bind(f64_to_dec(SHARE_EPSILON)?)
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?;
            }
            Mutation::RemovePosition { user, side } => {
                let id = market.ok_or_else(missing_scope)?;
                sqlx::query(
                    "DELETE FROM positions WHERE user_id = $1 AND market_id = $2 AND side = $3",
                )
                .bind(user)
                .bind(id)
                .bind(side.as_str())
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?;
            }
            Mutation::BumpVolume {
                account,
                traded,
                resolved,
            } => {
                self.ensure_balance_row(tx, account).await?;
                sqlx::query(
                    "UPDATE balances SET
                        volume_traded = volume_traded + $1,
                        volume_resolved = volume_resolved + $2
                     WHERE account = $3",
                )
                .bind(f64_to_dec(*traded)?)
                .bind(f64_to_dec(*resolved)?)
                .bind(account)
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?;
            }
            Mutation::CascadeDelete => {
                let id = market.ok_or_else(missing_scope)?;
                sqlx::query("DELETE FROM market_info WHERE market_id = $1")
                    .bind(id)
                    .execute(tx.as_mut())
                    .await
                    .map_err(map_sqlx)?;
            }
        }
        Ok(())
    }

    async fn append_log(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        log: &LogRecord,
    ) -> EngineResult<()> {
        match log {
            LogRecord::Trade(rec) => {
                sqlx::query(
                    "INSERT INTO trades (user_id, market_id, side, shares, amount_ledger, price, balance_ledger, at)
                     VALUES ($1, $2, $3, $4, $5, $6,
                        COALESCE((SELECT cash_ledger FROM balances WHERE account = $1), 0), $7)",
                )
                .bind(&rec.user)
                .bind(&rec.market)
                .bind(rec.side.as_str())
                .bind(f64_to_dec(rec.shares)?)
                .bind(rec.amount as i64)
                .bind(f64_to_dec(rec.price)?)
                .bind(rec.at)
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?;
            }
            LogRecord::Transfer(rec) => {
                let acting = match rec.kind {
                    TransferKind::Deposit => rec.to.as_deref(),
                    TransferKind::Withdrawal | TransferKind::Transfer => rec.from.as_deref(),
                };
                sqlx::query(
                    "INSERT INTO transfers (kind, from_user, to_user, amount_ledger, balance_ledger, at)
                     VALUES ($1, $2, $3, $4,
                        COALESCE((SELECT cash_ledger FROM balances WHERE account = $5), 0), $6)",
                )
                .bind(rec.kind.as_str())
                .bind(rec.from.as_deref())
                .bind(rec.to.as_deref())
                .bind(rec.amount as i64)
                .bind(acting)
                .bind(rec.at)
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?;
            }
            LogRecord::Resolution(rec) => {
                sqlx::query(
                    "INSERT INTO resolutions (user_id, market_id, side, outcome, shares, redeemed_ledger, at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(&rec.user)
                .bind(&rec.market)
                .bind(rec.side.as_str())
                .bind(rec.outcome.as_str())
                .bind(f64_to_dec(rec.shares)?)
                .bind(rec.redeemed as i64)
                .bind(rec.at)
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?;
            }
        }
        Ok(())
    }
}

impl LedgerStore for PgStore {
    fn get_market(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = EngineResult<Option<Market>>> + Send {
        async move {
            let row = sqlx::query(&format!(
                "SELECT {MARKET_COLUMNS}
                 FROM market_info i JOIN market_data d USING (market_id)
                 WHERE market_id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
            row.as_ref().map(market_from_row).transpose()
        }
    }

    fn list_markets(&self) -> impl std::future::Future<Output = EngineResult<Vec<Market>>> + Send {
        async move {
            let rows = sqlx::query(&format!(
                "SELECT {MARKET_COLUMNS}
                 FROM market_info i JOIN market_data d USING (market_id)
                 ORDER BY market_id"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            rows.iter().map(market_from_row).collect()
        }
    }

    fn get_balance(
        &self,
        account: &str,
    ) -> impl std::future::Future<Output = EngineResult<Balance>> + Send {
        async move {
            sqlx::query(
                "INSERT INTO balances (account, cash_ledger) VALUES ($1, $2)
                 ON CONFLICT (account) DO NOTHING",
            )
            .bind(account)
            .bind(self.default_balance as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

            let row = sqlx::query(
                "SELECT account, cash_ledger, volume_traded, volume_resolved
                 FROM balances WHERE account = $1",
            )
            .bind(account)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
            balance_from_row(&row)
        }
    }

    fn get_position(
        &self,
        user: &str,
        market: &str,
        side: Side,
    ) -> impl std::future::Future<Output = EngineResult<Option<Position>>> + Send {
        async move {
            let row = sqlx::query(
                "SELECT user_id, market_id, side, shares, cost_ledger, last_trade
                 FROM positions
                 WHERE user_id = $1 AND market_id = $2 AND side = $3",
            )
            .bind(user)
            .bind(market)
            .bind(side.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
            row.as_ref().map(position_from_row).transpose()
        }
    }

    fn market_positions(
        &self,
        market: &str,
    ) -> impl std::future::Future<Output = EngineResult<Vec<Position>>> + Send {
        async move {
            let rows = sqlx::query(
                "SELECT user_id, market_id, side, shares, cost_ledger, last_trade
                 FROM positions WHERE market_id = $1 AND shares > 0
                 ORDER BY user_id, side",
            )
            .bind(market)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            rows.iter().map(position_from_row).collect()
        }
    }

    fn user_positions(
        &self,
        user: &str,
    ) -> impl std::future::Future<Output = EngineResult<Vec<Position>>> + Send {
        async move {
            let rows = sqlx::query(
                "SELECT user_id, market_id, side, shares, cost_ledger, last_trade
                 FROM positions WHERE user_id = $1 AND shares > 0
                 ORDER BY market_id, side",
            )
            .bind(user)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            rows.iter().map(position_from_row).collect()
        }
    }

    fn insert_market(
        &self,
        market: NewMarket,
    ) -> impl std::future::Future<Output = EngineResult<()>> + Send {
        async move {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
            let inserted = sqlx::query(
                "INSERT INTO market_info (market_id, question, details, subject, creator_id, b)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&market.id)
            .bind(&market.question)
            .bind(market.details.as_deref())
            .bind(market.subject.as_deref())
            .bind(market.creator.as_deref())
            .bind(market.b)
            .execute(tx.as_mut())
            .await;
            if let Err(e) = inserted {
                if is_unique_violation(&e) {
                    return Err(EngineError::MarketExists(market.id));
                }
                return Err(map_sqlx(e));
            }
            sqlx::query("INSERT INTO market_data (market_id) VALUES ($1)")
                .bind(&market.id)
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?;
            tx.commit().await.map_err(map_sqlx)?;
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
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(tx.as_mut())
                .await
                .map_err(map_sqlx)?;
            for mutation in &mutations {
                self.apply_mutation(&mut tx, market, mutation).await?;
            }
            for log in &logs {
                self.append_log(&mut tx, log).await?;
            }
            // dropping the transaction on any error above rolls it back
            tx.commit().await.map_err(map_sqlx)?;
            Ok(())
        }
    }
}

// -----------------------
// Row and numeric conversions
// -----------------------

fn dec_to_f64(value: Decimal) -> EngineResult<f64> {
    value
        .to_f64()
        .ok_or_else(|| EngineError::StoreUnavailable(format!("bad numeric value: {value}")))
}

fn f64_to_dec(value: f64) -> EngineResult<Decimal> {
    if !value.is_finite() {
        return Err(EngineError::StoreUnavailable(format!(
            "non-finite value for numeric column: {value}"
        )));
    }
    Decimal::from_f64_retain(value)
        .ok_or_else(|| EngineError::StoreUnavailable(format!("unrepresentable value: {value}")))
}

fn market_from_row(row: &PgRow) -> EngineResult<Market> {
    let resolution: Option<String> = row.get("resolution");
    Ok(Market {
        id: row.get("market_id"),
        question: row.get("question"),
        details: row.get("details"),
        subject: row.get("subject"),
        creator: row.get("creator_id"),
        b: row.get("b"),
        yes_shares: dec_to_f64(row.get("yes_shares"))?,
        no_shares: dec_to_f64(row.get("no_shares"))?,
        resolved: row.get("resolved"),
        resolution: resolution.as_deref().and_then(Outcome::parse),
        resolution_date: row.get("resolution_date"),
        implied_odds: dec_to_f64(row.get("implied_odds"))?,
        volume_traded: dec_to_f64(row.get("volume_traded"))?,
        last_trade: row.get("last_trade"),
    })
}

fn balance_from_row(row: &PgRow) -> EngineResult<Balance> {
    let cash: i64 = row.get("cash_ledger");
    Ok(Balance {
        account: row.get("account"),
        cash: cash as i128,
        volume_traded: dec_to_f64(row.get("volume_traded"))?,
        volume_resolved: dec_to_f64(row.get("volume_resolved"))?,
    })
}

fn position_from_row(row: &PgRow) -> EngineResult<Position> {
    let side_str: String = row.get("side");
    let side = Side::parse(&side_str)
        .ok_or_else(|| EngineError::StoreUnavailable(format!("bad side value: {side_str}")))?;
    let cost: i64 = row.get("cost_ledger");
    Ok(Position {
        user: row.get("user_id"),
        market: row.get("market_id"),
        side,
        shares: dec_to_f64(row.get("shares"))?,
        cost_basis: cost as i128,
        last_trade: row.get("last_trade"),
    })
}

fn missing_scope() -> EngineError {
    EngineError::StoreUnavailable("market-scoped mutation without a market id".to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx(e: sqlx::Error) -> EngineError {
    if let sqlx::Error::Database(db) = &e {
        // 40001 serialization_failure, 40P01 deadlock_detected
        if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
            return EngineError::StoreConflict;
        }
    }
    EngineError::StoreUnavailable(e.to_string())
}
