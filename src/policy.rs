//! Stock issuance policy engine.
//!
//! Pure, side-effect-free functions; callers apply the returned deltas.
//! All arithmetic is integer-exact with explicit floors so the same inputs
//! always produce the same payouts. Out-of-domain inputs clamp to zero
//! rather than erroring: the economic tick keeps running.

use crate::state::PolicyMode;

/// Capital units required to issue one share.
pub const CAPITAL_UNIT: i64 = 100;

/// Shares issued for a given capital amount: floor(capital / 100).
pub fn issued_shares(capital: i64) -> i64 {
    if capital <= 0 {
        return 0;
    }
    capital.div_euclid(CAPITAL_UNIT)
}

/// Market capitalization. Negative inputs clamp to zero.
pub fn market_cap(share_price: i64, issued: i64) -> i64 {
    share_price.max(0).saturating_mul(issued.max(0))
}

/// Hourly dividend pool: floor of 10% of market cap.
pub fn hourly_dividend_pool(cap: i64) -> i64 {
    cap.max(0) / 10
}

/// Dividend per share in milli-units: floor(pool * 1000 / shares).
/// Fixed point avoids fractional-share payouts.
pub fn dividend_per_share_milli(pool: i64, issued: i64) -> i64 {
    if issued <= 0 {
        return 0;
    }
    pool.max(0).saturating_mul(1000) / issued
}

/// Hourly dividend for a holder owning `ownership_pct` percent (25.0 = 25%):
/// floor(pct * 0.01 * cap). The one place a float enters the engine; the
/// product is floored straight back to integer units.
pub fn hourly_dividend(ownership_pct: f64, cap: i64) -> i64 {
    if !(ownership_pct > 0.0) || cap <= 0 {
        return 0;
    }
    (ownership_pct * 0.01 * cap as f64).floor() as i64
}

/// Ownership dilution from minting, in basis points:
/// ((1/before - 1/(before+minted)) * 10000), rounded, clamped >= 0.
pub fn ownership_drift_bps(issued_before: i64, minted: i64) -> i64 {
    if issued_before <= 0 || minted <= 0 {
        return 0;
    }
    let before = issued_before as f64;
    let after = (issued_before + minted) as f64;
    let drift = (1.0 / before - 1.0 / after) * 10_000.0;
    (drift.round() as i64).max(0)
}

/// Demand-triggered minting fires only under the event-conditional policy,
/// with the trigger enabled and net demand at or above the threshold
/// (boundary inclusive). Legacy-hourly mints on the tick schedule instead.
pub fn should_trigger_buy_pressure_mint(
    policy: PolicyMode,
    trigger_enabled: bool,
    net_demand: i64,
    threshold: i64,
) -> bool {
    policy == PolicyMode::EventConditional && trigger_enabled && net_demand >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_shares_floors() {
        assert_eq!(issued_shares(1050), 10);
        assert_eq!(issued_shares(99), 0);
        assert_eq!(issued_shares(100), 1);
        assert_eq!(issued_shares(0), 0);
        assert_eq!(issued_shares(-500), 0);
    }

    #[test]
    fn test_market_cap() {
        assert_eq!(market_cap(250, 40), 10_000);
        assert_eq!(market_cap(-5, 40), 0);
        assert_eq!(market_cap(250, -1), 0);
    }

    #[test]
    fn test_dividend_pool_is_ten_percent_floor() {
        assert_eq!(hourly_dividend_pool(100_000), 10_000);
        assert_eq!(hourly_dividend_pool(109), 10);
        assert_eq!(hourly_dividend_pool(-10), 0);
    }

    #[test]
    fn test_dividend_per_share_milli() {
        assert_eq!(dividend_per_share_milli(1000, 250), 4000);
        assert_eq!(dividend_per_share_milli(1000, 0), 0);
        assert_eq!(dividend_per_share_milli(1, 3), 333);
    }

    #[test]
    fn test_hourly_dividend() {
        // 25% of a 10,000 pool (cap 100,000 at price 100 x 1000 shares).
        let cap = market_cap(100, 1000);
        let pool = hourly_dividend_pool(cap);
        assert_eq!(pool, 10_000);
        assert_eq!(hourly_dividend(25.0, pool), 2500);
        assert_eq!(hourly_dividend(0.0, pool), 0);
        assert_eq!(hourly_dividend(25.0, 0), 0);
        assert_eq!(hourly_dividend(-3.0, pool), 0);
    }

    #[test]
    fn test_ownership_drift() {
        // 1/100 - 1/110 = 0.000909... -> 9 bps rounded
        assert_eq!(ownership_drift_bps(100, 10), 9);
        assert_eq!(ownership_drift_bps(0, 10), 0);
        assert_eq!(ownership_drift_bps(100, 0), 0);
        assert_eq!(ownership_drift_bps(-5, 10), 0);
        // 1/1 - 1/2 = 0.5 -> 5000 bps
        assert_eq!(ownership_drift_bps(1, 1), 5000);
    }

    #[test]
    fn test_buy_pressure_trigger() {
        assert!(!should_trigger_buy_pressure_mint(PolicyMode::LegacyHourly, true, 50, 25));
        assert!(should_trigger_buy_pressure_mint(PolicyMode::EventConditional, true, 25, 25));
        assert!(should_trigger_buy_pressure_mint(PolicyMode::EventConditional, true, 26, 25));
        assert!(!should_trigger_buy_pressure_mint(PolicyMode::EventConditional, true, 24, 25));
        assert!(!should_trigger_buy_pressure_mint(PolicyMode::EventConditional, false, 50, 25));
    }
}
