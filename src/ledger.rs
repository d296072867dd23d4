//! Append-only vote ledger, one logical table parameterized by chamber.
//!
//! Guarantees:
//! - at most one vote per (bill, voter, chamber), enforced by the composite
//!   UNIQUE constraint — concurrent duplicate writers get one success and
//!   one Conflict, never a silent overwrite
//! - rows are immutable once written
//! - tallies are always a fresh COUNT over the rows, never a cached counter

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::{unique_conflict, SimResult};
use crate::state::Chamber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tally {
    #[serde(rename = "for")]
    pub for_votes: i64,
    pub against: i64,
}

/// Append one vote row. The caller has already checked role/stage rules.
pub fn record(
    conn: &Connection,
    bill_id: i64,
    voter_id: i64,
    chamber: Chamber,
    yes: bool,
    now: i64,
) -> SimResult<i64> {
    conn.execute(
        "INSERT INTO votes (bill_id, voter_id, chamber, yes, cast_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![bill_id, voter_id, chamber.as_str(), yes as i64, now],
    )
    .map_err(|e| unique_conflict(e, "already voted in this chamber"))?;
    Ok(conn.last_insert_rowid())
}

/// Fresh aggregate over the ledger.
pub fn tally(conn: &Connection, bill_id: i64, chamber: Chamber) -> SimResult<Tally> {
    let (for_votes, against) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN yes = 1 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN yes = 0 THEN 1 ELSE 0 END), 0)
         FROM votes WHERE bill_id = ?1 AND chamber = ?2",
        params![bill_id, chamber.as_str()],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
    )?;
    Ok(Tally { for_votes, against })
}

/// Remove a bill's rows across all chambers. Runs inside the caller's
/// transaction so it is atomic with whatever triggered the purge.
pub fn purge(conn: &Connection, bill_id: i64) -> SimResult<usize> {
    let n = conn.execute("DELETE FROM votes WHERE bill_id = ?1", params![bill_id])?;
    Ok(n)
}
