//! Tick handlers: the time-advancing batch operations behind the authorizer.
//!
//! There is no in-process scheduler; every tick arrives as an external
//! request. Overlap protection is a monotonic per-kind watermark: a tick
//! whose timestamp does not advance the watermark is refused with Conflict.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use crate::bill;
use crate::error::{SimError, SimResult};
use crate::feed;
use crate::logging::{json_log, obj, v_int, v_str};
use crate::policy;
use crate::roles;
use crate::state::{BillStatus, PolicyMode};
use crate::storage::Store;

fn advance_watermark(conn: &Connection, kind: &str, now: i64) -> SimResult<()> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_ts FROM tick_watermarks WHERE kind = ?1",
            params![kind],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(last) = last {
        if now <= last {
            return Err(SimError::Conflict(format!(
                "{} tick already ran at {}",
                kind, last
            )));
        }
    }
    conn.execute(
        "INSERT INTO tick_watermarks (kind, last_ts) VALUES (?1, ?2)
         ON CONFLICT(kind) DO UPDATE SET last_ts = ?2",
        params![kind, now],
    )?;
    Ok(())
}

// =============================================================================
// Hourly dividend tick
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DividendReport {
    pub companies: i64,
    pub holders_paid: i64,
    pub total_paid: i64,
}

/// Pay the hourly dividend for every legacy-hourly company: 10% of market
/// cap pooled, each holder credited floor(pct * 0.01 * pool). One
/// transaction for the whole tick, watermark included.
pub fn dividend_tick(store: &mut Store, now: i64) -> SimResult<DividendReport> {
    let tx = store.conn_mut().transaction()?;
    advance_watermark(&tx, "dividends", now)?;

    let companies: Vec<(i64, i64, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT id, share_price, issued_shares FROM companies WHERE policy = ?1",
        )?;
        let rows = stmt.query_map(params![PolicyMode::LegacyHourly.as_str()], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };

    let mut report = DividendReport { companies: 0, holders_paid: 0, total_paid: 0 };
    for (company_id, share_price, issued) in companies {
        let cap = policy::market_cap(share_price, issued);
        let pool = policy::hourly_dividend_pool(cap);
        if pool <= 0 || issued <= 0 {
            continue;
        }
        report.companies += 1;

        let holdings: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT principal_id, shares FROM holdings WHERE company_id = ?1 AND shares > 0",
            )?;
            let rows = stmt.query_map(params![company_id], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        for (principal_id, shares) in holdings {
            let pct = shares as f64 * 100.0 / issued as f64;
            let paid = policy::hourly_dividend(pct, pool);
            if paid <= 0 {
                continue;
            }
            tx.execute(
                "UPDATE principals SET balance = balance + ?2 WHERE id = ?1",
                params![principal_id, paid],
            )?;
            report.holders_paid += 1;
            report.total_paid += paid;
        }
    }
    feed::emit(
        &tx,
        "dividend_tick",
        &json!({
            "companies": report.companies,
            "holdersPaid": report.holders_paid,
            "totalPaid": report.total_paid,
        }),
        now,
    )?;
    tx.commit()?;
    json_log(
        "tick",
        obj(&[
            ("event", v_str("dividends")),
            ("companies", v_int(report.companies)),
            ("total_paid", v_int(report.total_paid)),
        ]),
    );
    Ok(report)
}

// =============================================================================
// Bill stage sweep
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub swept: i64,
    pub advanced: i64,
    pub settled: i64,
}

/// Resolve every Voting bill's current chamber. Watermark and batch commit
/// as one transaction: a failure mid-sweep rolls everything back, leaving the
/// tick fully retriable at the same timestamp.
pub fn stage_sweep(store: &mut Store, now: i64) -> SimResult<SweepReport> {
    let tx = store.conn_mut().transaction()?;
    advance_watermark(&tx, "stages", now)?;
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM bills WHERE status = 'voting' ORDER BY id")?;
        let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let mut report = SweepReport { swept: 0, advanced: 0, settled: 0 };
    for id in ids {
        let b = bill::advance_stage_on(&tx, id, now)?;
        report.swept += 1;
        if b.status == BillStatus::Voting {
            report.advanced += 1;
        } else {
            report.settled += 1;
        }
    }
    tx.commit()?;
    Ok(report)
}

// =============================================================================
// Election resolution sweep
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionSweepReport {
    pub resolved: i64,
    pub seats_filled: i64,
}

pub fn election_sweep(store: &mut Store, now: i64) -> SimResult<ElectionSweepReport> {
    let tx = store.conn_mut().transaction()?;
    advance_watermark(&tx, "elections", now)?;
    let ids = roles::open_elections(&tx)?;
    let mut report = ElectionSweepReport { resolved: 0, seats_filled: 0 };
    for id in ids {
        let outcome = roles::resolve_election_on(&tx, id, now)?;
        report.resolved += 1;
        report.seats_filled += outcome.winners.len() as i64;
    }
    tx.commit()?;
    Ok(report)
}

// =============================================================================
// Buy-pressure minting (event-conditional policy)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintReport {
    pub company_id: i64,
    pub minted: i64,
    pub issued_after: i64,
    pub drift_bps: i64,
}

/// Apply demand-triggered issuance for one company. Returns None when the
/// policy does not fire; the decision itself is the pure policy function.
pub fn buy_pressure_mint(
    store: &mut Store,
    company_id: i64,
    net_demand: i64,
    threshold: i64,
    now: i64,
) -> SimResult<Option<MintReport>> {
    let tx = store.conn_mut().transaction()?;
    let row = tx
        .query_row(
            "SELECT policy, mint_trigger_enabled, issued_shares FROM companies WHERE id = ?1",
            params![company_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)? != 0,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    let (mode, trigger_enabled, issued_before) =
        row.ok_or_else(|| SimError::NotFound(format!("company {}", company_id)))?;
    let mode = PolicyMode::parse(&mode)?;

    if !policy::should_trigger_buy_pressure_mint(mode, trigger_enabled, net_demand, threshold) {
        return Ok(None);
    }
    let minted = policy::issued_shares(net_demand);
    if minted <= 0 {
        return Ok(None);
    }
    let drift_bps = policy::ownership_drift_bps(issued_before, minted);
    let issued_after = issued_before + minted;
    tx.execute(
        "UPDATE companies SET issued_shares = ?2 WHERE id = ?1",
        params![company_id, issued_after],
    )?;
    feed::emit(
        &tx,
        "buy_pressure_mint",
        &json!({
            "companyId": company_id,
            "minted": minted,
            "issuedAfter": issued_after,
            "driftBps": drift_bps,
        }),
        now,
    )?;
    tx.commit()?;
    json_log(
        "stock",
        obj(&[
            ("event", v_str("minted")),
            ("company_id", v_int(company_id)),
            ("minted", v_int(minted)),
            ("drift_bps", v_int(drift_bps)),
        ]),
    );
    Ok(Some(MintReport {
        company_id,
        minted,
        issued_after,
        drift_bps,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Role;
    use crate::storage::{get_principal, insert_principal};

    fn store() -> Store {
        let mut s = Store::open_in_memory().unwrap();
        s.init().unwrap();
        s
    }

    fn seed_company(s: &Store, name: &str, price: i64, shares: i64, mode: PolicyMode, trigger: bool) -> i64 {
        s.conn()
            .execute(
                "INSERT INTO companies (name, share_price, issued_shares, policy, mint_trigger_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, price, shares, mode.as_str(), trigger as i64],
            )
            .unwrap();
        s.conn().last_insert_rowid()
    }

    fn seed_holding(s: &Store, company: i64, principal: i64, shares: i64) {
        s.conn()
            .execute(
                "INSERT INTO holdings (company_id, principal_id, shares) VALUES (?1, ?2, ?3)",
                params![company, principal, shares],
            )
            .unwrap();
    }

    #[test]
    fn test_watermark_refuses_stale_tick() {
        let mut s = store();
        dividend_tick(&mut s, 1000).unwrap();
        assert!(matches!(
            dividend_tick(&mut s, 1000).unwrap_err(),
            SimError::Conflict(_)
        ));
        assert!(matches!(
            dividend_tick(&mut s, 999).unwrap_err(),
            SimError::Conflict(_)
        ));
        dividend_tick(&mut s, 1001).unwrap();
    }

    #[test]
    fn test_watermarks_are_per_kind() {
        let mut s = store();
        dividend_tick(&mut s, 1000).unwrap();
        stage_sweep(&mut s, 1000).unwrap();
        election_sweep(&mut s, 1000).unwrap();
    }

    #[test]
    fn test_dividend_tick_pays_by_ownership() {
        let mut s = store();
        // price 100 x 1000 shares: cap 100_000, pool 10_000.
        let co = seed_company(&s, "Acme", 100, 1000, PolicyMode::LegacyHourly, false);
        let a = insert_principal(s.conn(), "a", Role::Citizen, None).unwrap();
        let b = insert_principal(s.conn(), "b", Role::Citizen, None).unwrap();
        seed_holding(&s, co, a, 250); // 25% -> 2500
        seed_holding(&s, co, b, 100); // 10% -> 1000

        let report = dividend_tick(&mut s, 1000).unwrap();
        assert_eq!(report.companies, 1);
        assert_eq!(report.holders_paid, 2);
        assert_eq!(report.total_paid, 3500);
        assert_eq!(get_principal(s.conn(), a).unwrap().balance, 2500);
        assert_eq!(get_principal(s.conn(), b).unwrap().balance, 1000);
    }

    #[test]
    fn test_event_conditional_companies_skip_hourly_payout() {
        let mut s = store();
        let co = seed_company(&s, "Acme", 100, 1000, PolicyMode::EventConditional, true);
        let a = insert_principal(s.conn(), "a", Role::Citizen, None).unwrap();
        seed_holding(&s, co, a, 500);
        let report = dividend_tick(&mut s, 1000).unwrap();
        assert_eq!(report.companies, 0);
        assert_eq!(get_principal(s.conn(), a).unwrap().balance, 0);
    }

    #[test]
    fn test_failed_sweep_rolls_back_watermark_and_bills() {
        use crate::bill;
        use crate::state::Chamber;

        let mut s = store();
        let creator = insert_principal(s.conn(), "ada", Role::Citizen, None).unwrap();
        let rep = insert_principal(s.conn(), "rep", Role::Representative, None).unwrap();
        let good = bill::create(&mut s, "Good Act", "will pass the house", Some(creator), None, 10).unwrap();
        let bad = bill::create(&mut s, "Bad Act", "has a corrupt stage", Some(creator), None, 10).unwrap();
        bill::submit_for_voting(&mut s, good.id, creator).unwrap();
        bill::submit_for_voting(&mut s, bad.id, creator).unwrap();
        bill::cast_vote(&mut s, good.id, rep, Chamber::House, true, 20).unwrap();
        s.conn()
            .execute("UPDATE bills SET stage = 'floor' WHERE id = ?1", params![bad.id])
            .unwrap();

        assert!(stage_sweep(&mut s, 100).is_err());
        // Nothing applied: the good bill is untouched and the watermark did
        // not advance, so the same timestamp works once the row is repaired.
        assert_eq!(bill::get(s.conn(), good.id).unwrap().stage, Chamber::House);
        s.conn()
            .execute("UPDATE bills SET stage = 'house' WHERE id = ?1", params![bad.id])
            .unwrap();
        let report = stage_sweep(&mut s, 100).unwrap();
        assert_eq!(report.swept, 2);
        assert_eq!(bill::get(s.conn(), good.id).unwrap().stage, Chamber::Senate);
    }

    #[test]
    fn test_mint_fires_only_for_event_conditional() {
        let mut s = store();
        let legacy = seed_company(&s, "Old", 100, 100, PolicyMode::LegacyHourly, true);
        let evented = seed_company(&s, "New", 100, 100, PolicyMode::EventConditional, true);

        assert!(buy_pressure_mint(&mut s, legacy, 5000, 25, 1000).unwrap().is_none());
        let report = buy_pressure_mint(&mut s, evented, 5000, 25, 1000).unwrap().unwrap();
        // floor(5000 / 100) = 50 new shares on top of 100.
        assert_eq!(report.minted, 50);
        assert_eq!(report.issued_after, 150);
        assert_eq!(report.drift_bps, policy::ownership_drift_bps(100, 50));
    }

    #[test]
    fn test_mint_threshold_is_inclusive() {
        let mut s = store();
        let co = seed_company(&s, "New", 100, 100, PolicyMode::EventConditional, true);
        assert!(buy_pressure_mint(&mut s, co, 99, 100, 1000).unwrap().is_none());
        let report = buy_pressure_mint(&mut s, co, 100, 100, 1001).unwrap().unwrap();
        assert_eq!(report.minted, 1);
    }

    #[test]
    fn test_mint_respects_trigger_flag() {
        let mut s = store();
        let co = seed_company(&s, "New", 100, 100, PolicyMode::EventConditional, false);
        assert!(buy_pressure_mint(&mut s, co, 5000, 25, 1000).unwrap().is_none());
    }
}
