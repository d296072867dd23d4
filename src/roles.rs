//! Role progression authority.
//!
//! Two distinct paths move a principal along the Citizen < Representative <
//! Senator < President ladder: a privileged one-rung promote/demote, and
//! election resolution, which grants the election's target role to winners
//! atomically with marking them won.
//!
//! Election tie-break at the seat boundary: vote count descending, then
//! principal id ascending. Deterministic, never incidental insertion order.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use crate::error::{SimError, SimResult};
use crate::feed;
use crate::logging::{json_log, obj, v_int, v_str};
use crate::state::Role;
use crate::storage::{get_principal, Principal, Store};

/// Advance exactly one rung. Valid only from Representative or Senator.
pub fn promote(store: &mut Store, user_id: i64) -> SimResult<Principal> {
    let conn = store.conn();
    let p = get_principal(conn, user_id)?;
    let next = match p.role {
        Role::Representative => Role::Senator,
        Role::Senator => Role::President,
        other => {
            return Err(SimError::InvalidState(format!(
                "cannot promote from {}",
                other.as_str()
            )))
        }
    };
    set_role(conn, user_id, next)?;
    json_log(
        "role",
        obj(&[
            ("event", v_str("promoted")),
            ("principal_id", v_int(user_id)),
            ("role", v_str(next.as_str())),
        ]),
    );
    get_principal(conn, user_id)
}

/// Inverse of promote. Valid only from Senator or President.
pub fn demote(store: &mut Store, user_id: i64) -> SimResult<Principal> {
    let conn = store.conn();
    let p = get_principal(conn, user_id)?;
    let next = match p.role {
        Role::Senator => Role::Representative,
        Role::President => Role::Senator,
        other => {
            return Err(SimError::InvalidState(format!(
                "cannot demote from {}",
                other.as_str()
            )))
        }
    };
    set_role(conn, user_id, next)?;
    json_log(
        "role",
        obj(&[
            ("event", v_str("demoted")),
            ("principal_id", v_int(user_id)),
            ("role", v_str(next.as_str())),
        ]),
    );
    get_principal(conn, user_id)
}

fn set_role(conn: &Connection, user_id: i64, role: Role) -> SimResult<()> {
    conn.execute(
        "UPDATE principals SET role = ?2 WHERE id = ?1",
        params![user_id, role.as_str()],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionOutcome {
    pub election_id: i64,
    pub role: Role,
    pub winners: Vec<i64>,
}

/// Resolve an open election: the top-`seats` candidates by vote count win,
/// ties at the boundary broken by lower principal id. Winners get `has_won`
/// set and the target role granted in the same transaction as the election's
/// status change.
pub fn resolve_election(store: &mut Store, election_id: i64, now: i64) -> SimResult<ElectionOutcome> {
    let tx = store.conn_mut().transaction()?;
    let outcome = resolve_election_on(&tx, election_id, now)?;
    tx.commit()?;
    Ok(outcome)
}

/// Same resolution on an already-open transaction; the election sweep uses
/// this to keep a whole batch atomic with its watermark.
pub(crate) fn resolve_election_on(tx: &Connection, election_id: i64, now: i64) -> SimResult<ElectionOutcome> {
    let row = tx
        .query_row(
            "SELECT seats, role, status FROM elections WHERE id = ?1",
            params![election_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    let (seats, role, status) =
        row.ok_or_else(|| SimError::NotFound(format!("election {}", election_id)))?;
    if status != "open" {
        return Err(SimError::InvalidState(format!(
            "election {} is {}, not open",
            election_id, status
        )));
    }
    let role = Role::parse(&role)?;

    let winners: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT principal_id FROM candidates
             WHERE election_id = ?1
             ORDER BY votes DESC, principal_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![election_id, seats], |r| r.get::<_, i64>(0))?;
        rows.collect::<Result<_, _>>()?
    };

    for principal_id in &winners {
        tx.execute(
            "UPDATE candidates SET has_won = 1
             WHERE election_id = ?1 AND principal_id = ?2",
            params![election_id, principal_id],
        )?;
        tx.execute(
            "UPDATE principals SET role = ?2 WHERE id = ?1",
            params![principal_id, role.as_str()],
        )?;
    }
    tx.execute(
        "UPDATE elections SET status = 'resolved' WHERE id = ?1",
        params![election_id],
    )?;
    feed::emit(
        tx,
        "election_resolved",
        &json!({
            "electionId": election_id,
            "role": role.as_str(),
            "winners": winners,
        }),
        now,
    )?;
    json_log(
        "role",
        obj(&[
            ("event", v_str("election_resolved")),
            ("election_id", v_int(election_id)),
            ("winners", v_int(winners.len() as i64)),
        ]),
    );
    Ok(ElectionOutcome {
        election_id,
        role,
        winners,
    })
}

/// Ids of elections still awaiting resolution.
pub fn open_elections(conn: &Connection) -> SimResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM elections WHERE status = 'open' ORDER BY id")?;
    let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}
