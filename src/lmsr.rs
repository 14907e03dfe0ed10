//! Numerically stable LMSR pricing and the closed-form trade solver.
//!
//! All market math runs in f64; cash settles in fixed-point ledger units
//! (i128 micro-dollars) so that chained trades never accumulate rounding
//! drift. Rounding happens only at this boundary.

use crate::error::{EngineError, EngineResult};

/// 1 dollar = 1_000_000 ledger units.
pub const CASH_SCALE: i128 = 1_000_000;

/// Largest exponent argument the solver will feed to `exp`.
const MAX_EXP_ARG: f64 = 700.0;

#[inline]
pub fn to_cash(x: f64) -> i128 {
    // round half-away-from-zero
    if x.is_nan() || !x.is_finite() {
        panic!("non-finite value passed to to_cash: {x}");
    }
    let scaled = x * (CASH_SCALE as f64);
    if scaled >= 0.0 {
        (scaled + 0.5).floor() as i128
    } else {
        (scaled - 0.5).ceil() as i128
    }
}

#[inline]
pub fn from_cash(x: i128) -> f64 {
    x as f64 / CASH_SCALE as f64
}

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_uppercase().as_str() {
            "YES" => Some(Side::Yes),
            "NO" => Some(Side::No),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------
// Pricing function
// -----------------------

#[inline]
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    // if m is -inf (when both a,b are -inf), this still returns -inf
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// LMSR cost function `C(q) = b * ln(exp(q_yes/b) + exp(q_no/b))`.
#[inline]
pub fn cost(q_yes: f64, q_no: f64, b: f64) -> f64 {
    b * log_sum_exp(q_yes / b, q_no / b)
}

/// Implied probability of the YES outcome, in (0, 1).
#[inline]
pub fn price_yes(q_yes: f64, q_no: f64, b: f64) -> f64 {
    let a = q_yes / b;
    let c = q_no / b;
    let m = a.max(c);
    let ey = (a - m).exp();
    let en = (c - m).exp();
    ey / (ey + en)
}

#[inline]
pub fn price(side: Side, q_yes: f64, q_no: f64, b: f64) -> f64 {
    match side {
        Side::Yes => price_yes(q_yes, q_no, b),
        Side::No => 1.0 - price_yes(q_yes, q_no, b),
    }
}

// -----------------------
// Trade solver
// -----------------------

/// Closed-form share delta for spending `spend` dollars on `side`.
///
/// Solves `C(q + dq) - C(q) = spend` by inverting the cost function:
///
/// for YES: `dq = b * ln((exp(S/b) * (A + N) - N) / A)`
/// for NO:  `dq = b * ln((exp(S/b) * (A + N) - A) / N)`
///
/// where `A = exp(q_yes/b)` and `N = exp(q_no/b)`. The exponentials are
/// shifted by `max(q_yes, q_no)/b`, which cancels in the ratio.
pub fn shares_for_spend(
    side: Side,
    q_yes: f64,
    q_no: f64,
    b: f64,
    spend: f64,
) -> EngineResult<f64> {
    if !spend.is_finite() || spend <= 0.0 {
        return Err(EngineError::InvalidAmount);
    }
    // exp would overflow past this
    if spend / b > MAX_EXP_ARG {
        return Err(EngineError::InvalidAmount);
    }

    let m = (q_yes / b).max(q_no / b);
    let a = (q_yes / b - m).exp();
    let n = (q_no / b - m).exp();
    let exp_sb = (spend / b).exp();

    let (numerator, denominator) = match side {
        Side::Yes => (exp_sb * (a + n) - n, a),
        Side::No => (exp_sb * (a + n) - a, n),
    };
    debug_assert!(numerator > 0.0 && denominator > 0.0);

    Ok(b * (numerator / denominator).ln())
}

/// Payout for retiring `shares` from `side`, always >= 0 by convexity.
pub fn payout_for_shares(side: Side, q_yes: f64, q_no: f64, b: f64, shares: f64) -> f64 {
    let before = cost(q_yes, q_no, b);
    let after = match side {
        Side::Yes => cost(q_yes - shares, q_no, b),
        Side::No => cost(q_yes, q_no - shares, b),
    };
    before - after
}

// -----------------------
// Pool state
// -----------------------

/// The pool's live share totals for one market.
#[derive(Clone, Copy)]
pub struct PoolState {
    pub q_yes: f64,
    pub q_no: f64,
    pub b: f64,
}

impl std::fmt::Debug for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolState")
            .field("q_yes", &self.q_yes)
            .field("q_no", &self.q_no)
            .field("b", &self.b)
            .field("p_yes", &self.price_yes())
            .finish()
    }
}

impl PoolState {
    pub fn new(b: f64) -> Self {
        Self { q_yes: 0.0, q_no: 0.0, b }
    }

    pub fn price_yes(&self) -> f64 {
        price_yes(self.q_yes, self.q_no, self.b)
    }

    pub fn cost(&self) -> f64 {
        cost(self.q_yes, self.q_no, self.b)
    }

    /// Maximum the pool can lose on this market, independent of volume.
    pub fn max_loss(&self) -> f64 {
        self.b * std::f64::consts::LN_2
    }

    /// Buy shares on `side` with a spend in ledger units. Returns
    /// (shares_bought, cash_debited) where the debit is the rounded
    /// actual cost delta.
    pub fn apply_buy(&mut self, side: Side, spend_cash: i128) -> EngineResult<(f64, i128)> {
        let spend = from_cash(spend_cash);
        let pre_cost = self.cost();
        let shares = shares_for_spend(side, self.q_yes, self.q_no, self.b, spend)?;

        match side {
            Side::Yes => self.q_yes += shares,
            Side::No => self.q_no += shares,
        }

        let cash_debit = to_cash(self.cost() - pre_cost);
        Ok((shares, cash_debit))
    }

    /// Retire `shares` from `side`. Returns the cash credited in ledger
    /// units, >= 0 for any positive share count.
    pub fn apply_sell(&mut self, side: Side, shares: f64) -> EngineResult<i128> {
        if !shares.is_finite() || shares <= 0.0 {
            return Err(EngineError::InvalidAmount);
        }
        let pre_cost = self.cost();
        match side {
            Side::Yes => self.q_yes -= shares,
            Side::No => self.q_no -= shares,
        }
        Ok(to_cash(pre_cost - self.cost()))
    }
}

// -----------------------
// Tests
// -----------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fresh_market_prices_at_even_odds() {
        let pool = PoolState::new(25.0);
        assert!((pool.price_yes() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn price_complement_sums_to_one() {
        for (qy, qn, b) in [
            (0.0, 0.0, 25.0),
            (40.0, 10.0, 25.0),
            (-30.0, 55.0, 100.0),
            (1234.0, 987.0, 500.0),
        ] {
            let py = price_yes(qy, qn, b);
            let pn = price(Side::No, qy, qn, b);
            assert!(py > 0.0 && py < 1.0, "p_yes={py}");
            assert!((py + pn - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn solver_matches_cost_delta_exactly() {
        let b = 100.0;
        let (mut qy, qn) = (37.0, 12.0);
        for spend in [1.0, 10.0, 50.0, 100.0, 500.0] {
            let dq = shares_for_spend(Side::Yes, qy, qn, b, spend).unwrap();
            let delta_c = cost(qy + dq, qn, b) - cost(qy, qn, b);
            assert!(
                (delta_c - spend).abs() < 1e-9,
                "spend={spend} delta_c={delta_c}"
            );
            qy += dq;
        }
    }

    #[test]
    fn buying_moves_price_toward_side() {
        let mut pool = PoolState::new(25.0);
        let mut prev = pool.price_yes();
        for _ in 0..20 {
            pool.apply_buy(Side::Yes, to_cash(10.0)).unwrap();
            let p = pool.price_yes();
            assert!(p > prev && p < 1.0);
            prev = p;
        }
        // and NO buys push it back down
        pool.apply_buy(Side::No, to_cash(50.0)).unwrap();
        assert!(pool.price_yes() < prev);
    }

    #[test]
    fn path_independence_of_total_cost() {
        let b = 100.0;
        let direct = shares_for_spend(Side::Yes, 0.0, 0.0, b, 100.0).unwrap();

        let step1 = shares_for_spend(Side::Yes, 0.0, 0.0, b, 50.0).unwrap();
        let step2 = shares_for_spend(Side::Yes, step1, 0.0, b, 50.0).unwrap();

        assert!(
            (direct - (step1 + step2)).abs() < 1e-9,
            "direct={direct} split={}",
            step1 + step2
        );
    }

    #[test]
    fn solver_rejects_bad_spends() {
        assert!(matches!(
            shares_for_spend(Side::Yes, 0.0, 0.0, 25.0, 0.0),
            Err(EngineError::InvalidAmount)
        ));
        assert!(matches!(
            shares_for_spend(Side::Yes, 0.0, 0.0, 25.0, -5.0),
            Err(EngineError::InvalidAmount)
        ));
        assert!(matches!(
            shares_for_spend(Side::Yes, 0.0, 0.0, 25.0, f64::NAN),
            Err(EngineError::InvalidAmount)
        ));
        // spend/b > 700 would overflow exp
        assert!(matches!(
            shares_for_spend(Side::Yes, 0.0, 0.0, 10.0, 10_000.0),
            Err(EngineError::InvalidAmount)
        ));
    }

    #[test]
    fn simple_round_trip_exact_zero_ledger() {
        let mut pool = PoolState::new(25.0);
        let (dq, debit) = pool.apply_buy(Side::Yes, to_cash(100.0)).unwrap();
        let credit = pool.apply_sell(Side::Yes, dq).unwrap();
        assert_eq!(debit, credit, "round trip should net to zero in ledger units");
    }

    #[test]
    fn sell_payout_is_the_cost_difference() {
        let (qy, qn, b) = (80.0, 30.0, 100.0);
        let payout = payout_for_shares(Side::Yes, qy, qn, b, 20.0);
        assert!(payout > 0.0);
        assert!((payout - (cost(qy, qn, b) - cost(qy - 20.0, qn, b))).abs() < 1e-12);

        let mut pool = PoolState { q_yes: qy, q_no: qn, b };
        let credit = pool.apply_sell(Side::Yes, 20.0).unwrap();
        assert_eq!(credit, to_cash(payout));
    }

    proptest! {
        // A random sequence of buys, fully unwound, leaves both the float
        // math and the fixed-point ledger at zero.
        #[test]
        fn round_trip_is_zero_cost(
            b in 50.0f64..5_000.0,
            stakes in prop::collection::vec(1_000_000i128..100_000_000i128, 1..40),
            sides in prop::collection::vec(0u8..=1u8, 1..40),
        ) {
            let mut pool = PoolState::new(b);
            let mut cash_ledger: i128 = 0;
            let mut yes_shares: f64 = 0.0;
            let mut no_shares: f64 = 0.0;

            let n = stakes.len().min(sides.len());
            for i in 0..n {
                let side = if sides[i] == 0 { Side::Yes } else { Side::No };
                let (dq, debit) = pool.apply_buy(side, stakes[i]).unwrap();
                match side {
                    Side::Yes => yes_shares += dq,
                    Side::No => no_shares += dq,
                }
                cash_ledger -= debit;
                prop_assert!(pool.q_yes.is_finite() && pool.q_no.is_finite());
            }

            if yes_shares > 0.0 {
                cash_ledger += pool.apply_sell(Side::Yes, yes_shares).unwrap();
            }
            if no_shares > 0.0 {
                cash_ledger += pool.apply_sell(Side::No, no_shares).unwrap();
            }

            prop_assert_eq!(cash_ledger, 0, "ledger imbalance");
            prop_assert!(pool.q_yes.abs() < 1e-9);
            prop_assert!(pool.q_no.abs() < 1e-9);
        }

        // Whatever gets traded, the pool's loss on either resolution stays
        // under b * ln(2): collected cash is C(q) - C(0), the payout is the
        // winning side's share total.
        #[test]
        fn pool_loss_is_bounded(
            b in 50.0f64..2_000.0,
            stakes in prop::collection::vec(1_000_000i128..500_000_000i128, 1..30),
            sides in prop::collection::vec(0u8..=1u8, 1..30),
        ) {
            let mut pool = PoolState::new(b);
            let initial_cost = pool.cost();
            let n = stakes.len().min(sides.len());
            for i in 0..n {
                let side = if sides[i] == 0 { Side::Yes } else { Side::No };
                pool.apply_buy(side, stakes[i]).unwrap();
            }
            let collected = pool.cost() - initial_cost;
            let loss_if_yes = pool.q_yes - collected;
            let loss_if_no = pool.q_no - collected;
            let bound = pool.max_loss() + 1e-6;
            prop_assert!(loss_if_yes <= bound, "yes loss {} > {}", loss_if_yes, bound);
            prop_assert!(loss_if_no <= bound, "no loss {} > {}", loss_if_no, bound);
        }

        // keep |qy - qn| / b small enough that the losing exponential
        // stays above f64 epsilon, else the price saturates at 1.0
        #[test]
        fn prices_stay_in_open_interval(
            b in 100.0f64..2_000.0,
            qy in -800.0f64..800.0,
            qn in -800.0f64..800.0,
        ) {
            let p = price_yes(qy, qn, b);
            prop_assert!(p > 0.0 && p < 1.0, "p={}", p);
            prop_assert!((p + price(Side::No, qy, qn, b) - 1.0).abs() < 1e-12);
        }
    }
}
