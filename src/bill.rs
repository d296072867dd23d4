//! Bill lifecycle state machine.
//!
//! A bill is created Queued, moved to Voting at the House stage, accumulates
//! votes per chamber, and is resolved stage by stage: House -> Senate ->
//! President. Presidential resolution is terminal (Passed/Vetoed); a House or
//! Senate rejection is terminal Failed with no further stage advance.
//!
//! Majority rule: a chamber advances the bill iff yes votes strictly exceed
//! no votes at resolution time. Ties and zero-vote chambers fail.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use crate::error::{SimError, SimResult};
use crate::feed;
use crate::ledger::{self, Tally};
use crate::logging::{json_log, obj, v_int, v_str};
use crate::state::{BillStatus, Chamber};
use crate::storage::{get_principal, touch_principal, Store};

const MIN_CONTENT_LEN: usize = 8;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bill {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub creator_id: Option<i64>,
    pub status: BillStatus,
    pub stage: Chamber,
    pub pool_id: Option<i64>,
    pub created_at: i64,
}

fn validate(title: &str, content: &str) -> SimResult<()> {
    if title.trim().is_empty() {
        return Err(SimError::Validation("title must be non-empty".to_string()));
    }
    if content.len() < MIN_CONTENT_LEN {
        return Err(SimError::Validation(format!(
            "content must be at least {} characters",
            MIN_CONTENT_LEN
        )));
    }
    Ok(())
}

pub fn get(conn: &Connection, id: i64) -> SimResult<Bill> {
    let row = conn
        .query_row(
            "SELECT id, title, content, creator_id, status, stage, pool_id, created_at
             FROM bills WHERE id = ?1",
            params![id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<i64>>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, Option<i64>>(6)?,
                    r.get::<_, i64>(7)?,
                ))
            },
        )
        .optional()?;
    let (id, title, content, creator_id, status, stage, pool_id, created_at) =
        row.ok_or_else(|| SimError::NotFound(format!("bill {}", id)))?;
    Ok(Bill {
        id,
        title,
        content,
        creator_id,
        status: BillStatus::parse(&status)?,
        stage: Chamber::parse(&stage)?,
        pool_id,
        created_at,
    })
}

pub fn create(
    store: &mut Store,
    title: &str,
    content: &str,
    creator_id: Option<i64>,
    pool_id: Option<i64>,
    now: i64,
) -> SimResult<Bill> {
    validate(title, content)?;
    let conn = store.conn();
    conn.execute(
        "INSERT INTO bills (title, content, creator_id, status, stage, pool_id, created_at)
         VALUES (?1, ?2, ?3, 'queued', 'house', ?4, ?5)",
        params![title, content, creator_id, pool_id, now],
    )?;
    let id = conn.last_insert_rowid();
    if let Some(creator) = creator_id {
        touch_principal(conn, creator, now)?;
    }
    json_log(
        "bill",
        obj(&[("event", v_str("created")), ("bill_id", v_int(id))]),
    );
    get(conn, id)
}

/// A bill is mutable only while Queued, and only by its creator.
pub fn update(
    store: &mut Store,
    id: i64,
    title: &str,
    content: &str,
    requester_id: i64,
) -> SimResult<Bill> {
    validate(title, content)?;
    let conn = store.conn();
    let bill = get(conn, id)?;
    if bill.creator_id != Some(requester_id) {
        return Err(SimError::Forbidden("only the creator may edit a bill".to_string()));
    }
    if bill.status != BillStatus::Queued {
        return Err(SimError::InvalidState(format!(
            "bill is {}, only queued bills are editable",
            bill.status.as_str()
        )));
    }
    conn.execute(
        "UPDATE bills SET title = ?2, content = ?3 WHERE id = ?1",
        params![id, title, content],
    )?;
    get(conn, id)
}

/// Creator moves a Queued bill onto the floor: Voting at the House stage.
pub fn submit_for_voting(store: &mut Store, id: i64, requester_id: i64) -> SimResult<Bill> {
    let conn = store.conn();
    let bill = get(conn, id)?;
    if bill.creator_id != Some(requester_id) {
        return Err(SimError::Forbidden("only the creator may submit a bill".to_string()));
    }
    if bill.status != BillStatus::Queued {
        return Err(SimError::InvalidState(format!(
            "bill is {}, only queued bills can be submitted",
            bill.status.as_str()
        )));
    }
    conn.execute(
        "UPDATE bills SET status = 'voting', stage = 'house' WHERE id = ?1",
        params![id],
    )?;
    json_log(
        "bill",
        obj(&[("event", v_str("submitted")), ("bill_id", v_int(id))]),
    );
    get(conn, id)
}

/// Record one vote in the named chamber. The voter's role must seat them in
/// exactly that chamber, and the bill must be Voting at that stage. Duplicate
/// (bill, voter, chamber) is Conflict.
pub fn cast_vote(
    store: &mut Store,
    bill_id: i64,
    voter_id: i64,
    chamber: Chamber,
    yes: bool,
    now: i64,
) -> SimResult<Tally> {
    let tx = store.conn_mut().transaction()?;
    let voter = get_principal(&tx, voter_id)?;
    let seat = voter
        .role
        .chamber()
        .ok_or_else(|| SimError::Forbidden("citizens hold no chamber seat".to_string()))?;
    if seat != chamber {
        return Err(SimError::Forbidden(format!(
            "voter sits in the {}, not the {}",
            seat.as_str(),
            chamber.as_str()
        )));
    }
    let bill = get(&tx, bill_id)?;
    if bill.status != BillStatus::Voting {
        return Err(SimError::InvalidState(format!(
            "bill is {}, not open for voting",
            bill.status.as_str()
        )));
    }
    if bill.stage != chamber {
        return Err(SimError::Forbidden(format!(
            "bill is at the {} stage, voter sits in the {}",
            bill.stage.as_str(),
            chamber.as_str()
        )));
    }
    ledger::record(&tx, bill_id, voter_id, chamber, yes, now)?;
    touch_principal(&tx, voter_id, now)?;
    let t = ledger::tally(&tx, bill_id, chamber)?;
    tx.commit()?;
    json_log(
        "vote",
        obj(&[
            ("bill_id", v_int(bill_id)),
            ("principal_id", v_int(voter_id)),
            ("chamber", v_str(chamber.as_str())),
            ("for", v_int(t.for_votes)),
            ("against", v_int(t.against)),
        ]),
    );
    Ok(t)
}

pub fn tally(store: &Store, bill_id: i64, chamber: Chamber) -> SimResult<Tally> {
    ledger::tally(store.conn(), bill_id, chamber)
}

fn chamber_passes(t: &Tally) -> bool {
    t.for_votes > t.against
}

/// Scheduler-only: resolve the current chamber's tally and either advance the
/// stage or settle the bill. Runs as one transaction; the feed event is
/// atomic with the status change.
pub fn advance_stage(store: &mut Store, bill_id: i64, now: i64) -> SimResult<Bill> {
    let tx = store.conn_mut().transaction()?;
    let bill = advance_stage_on(&tx, bill_id, now)?;
    tx.commit()?;
    Ok(bill)
}

/// Same resolution on an already-open transaction. The stage sweep uses this
/// to keep a whole batch atomic with its watermark.
pub(crate) fn advance_stage_on(tx: &Connection, bill_id: i64, now: i64) -> SimResult<Bill> {
    let bill = get(tx, bill_id)?;
    if bill.status != BillStatus::Voting {
        return Err(SimError::InvalidState(format!(
            "bill is {}, only voting bills advance",
            bill.status.as_str()
        )));
    }
    let t = ledger::tally(tx, bill_id, bill.stage)?;
    let passed = chamber_passes(&t);

    let (status, stage) = match (bill.stage, passed) {
        (Chamber::President, true) => (BillStatus::Passed, bill.stage),
        (Chamber::President, false) => (BillStatus::Vetoed, bill.stage),
        (_, false) => (BillStatus::Failed, bill.stage),
        (Chamber::House, true) => (BillStatus::Voting, Chamber::Senate),
        (Chamber::Senate, true) => (BillStatus::Voting, Chamber::President),
    };

    tx.execute(
        "UPDATE bills SET status = ?2, stage = ?3 WHERE id = ?1",
        params![bill_id, status.as_str(), stage.as_str()],
    )?;
    feed::emit(
        tx,
        "bill_stage",
        &json!({
            "billId": bill_id,
            "chamber": bill.stage.as_str(),
            "for": t.for_votes,
            "against": t.against,
            "status": status.as_str(),
            "stage": stage.as_str(),
        }),
        now,
    )?;
    json_log(
        "bill",
        obj(&[
            ("event", v_str("stage_resolved")),
            ("bill_id", v_int(bill_id)),
            ("chamber", v_str(bill.stage.as_str())),
            ("status", v_str(status.as_str())),
        ]),
    );
    get(tx, bill_id)
}
