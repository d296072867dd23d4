//! Party merge coordinator.
//!
//! Per-request state machine: Pending on create, terminally Accepted or
//! Rejected by the receiver. Acceptance performs the fusion — new party,
//! stances, membership reassignment, source deletion, notification update,
//! feed event — as one indivisible transaction. No partial state (fused party
//! without members, members without a party) is ever observable.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{unique_conflict, SimError, SimResult};
use crate::feed;
use crate::logging::{json_log, obj, v_int, v_str};
use crate::storage::Store;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub bio: String,
    pub leader_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyProposal {
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub bio: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stance {
    pub topic: String,
    pub position: String,
}

pub fn get_party(conn: &Connection, id: i64) -> SimResult<Party> {
    let row = conn
        .query_row(
            "SELECT id, name, color, bio, leader_id FROM parties WHERE id = ?1",
            params![id],
            |r| {
                Ok(Party {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    color: r.get(2)?,
                    bio: r.get(3)?,
                    leader_id: r.get(4)?,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| SimError::NotFound(format!("party {}", id)))
}

/// Insert a party; used by seeding and tests. Name uniqueness is enforced by
/// the schema.
pub fn insert_party(
    conn: &Connection,
    name: &str,
    color: &str,
    bio: &str,
    leader_id: Option<i64>,
) -> SimResult<i64> {
    conn.execute(
        "INSERT INTO parties (name, color, bio, leader_id) VALUES (?1, ?2, ?3, ?4)",
        params![name, color, bio, leader_id],
    )
    .map_err(|e| unique_conflict(e, "party name already exists"))?;
    Ok(conn.last_insert_rowid())
}

pub fn party_members(conn: &Connection, party_id: i64) -> SimResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM principals WHERE party_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![party_id], |r| r.get::<_, i64>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Propose merging the sender party into the receiver. The request and its
/// notification (feed event) are persisted atomically; a second Pending
/// request for the same ordered pair is Conflict.
pub fn create(
    store: &mut Store,
    sender_party_id: i64,
    receiver_party_id: i64,
    proposal: &PartyProposal,
    stances: &[Stance],
    now: i64,
) -> SimResult<i64> {
    if proposal.name.trim().is_empty() {
        return Err(SimError::Validation("proposed party name must be non-empty".to_string()));
    }
    if sender_party_id == receiver_party_id {
        return Err(SimError::Validation("a party cannot merge with itself".to_string()));
    }
    let tx = store.conn_mut().transaction()?;
    get_party(&tx, sender_party_id)?;
    get_party(&tx, receiver_party_id)?;
    tx.execute(
        "INSERT INTO merge_requests
            (sender_party_id, receiver_party_id, status, name, color, bio, created_at)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)",
        params![
            sender_party_id,
            receiver_party_id,
            proposal.name,
            proposal.color,
            proposal.bio,
            now
        ],
    )
    .map_err(|e| unique_conflict(e, "a pending merge request already exists for this pair"))?;
    let request_id = tx.last_insert_rowid();
    for stance in stances {
        tx.execute(
            "INSERT INTO merge_request_stances (merge_request_id, topic, position)
             VALUES (?1, ?2, ?3)",
            params![request_id, stance.topic, stance.position],
        )?;
    }
    feed::emit(
        &tx,
        "merge_proposed",
        &json!({
            "mergeRequestId": request_id,
            "senderPartyId": sender_party_id,
            "receiverPartyId": receiver_party_id,
            "proposedName": proposal.name,
        }),
        now,
    )?;
    tx.commit()?;
    json_log(
        "merge",
        obj(&[
            ("event", v_str("proposed")),
            ("merge_request_id", v_int(request_id)),
        ]),
    );
    Ok(request_id)
}

struct PendingRequest {
    id: i64,
    sender_party_id: i64,
    receiver_party_id: i64,
    name: String,
    color: String,
    bio: String,
}

fn load_pending(conn: &Connection, request_id: i64) -> SimResult<PendingRequest> {
    let row = conn
        .query_row(
            "SELECT id, sender_party_id, receiver_party_id, name, color, bio
             FROM merge_requests WHERE id = ?1 AND status = 'pending'",
            params![request_id],
            |r| {
                Ok(PendingRequest {
                    id: r.get(0)?,
                    sender_party_id: r.get(1)?,
                    receiver_party_id: r.get(2)?,
                    name: r.get(3)?,
                    color: r.get(4)?,
                    bio: r.get(5)?,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| SimError::NotFound(format!("no pending merge request {}", request_id)))
}

/// Receiver accepts: fuse both parties into the proposed one. All-or-nothing.
/// Returns the fused party id.
pub fn accept(store: &mut Store, request_id: i64, acting_party_id: i64, now: i64) -> SimResult<i64> {
    let tx = store.conn_mut().transaction()?;
    let req = load_pending(&tx, request_id)?;
    if req.receiver_party_id != acting_party_id {
        // A sender cannot accept its own proposal; to anyone but the
        // receiver the request is simply not addressed to them.
        return Err(SimError::NotFound(format!(
            "no pending merge request {} for party {}",
            request_id, acting_party_id
        )));
    }
    // Double-accept race guard: the fused name must still be free. The UNIQUE
    // constraint on parties.name backs this check if two accepts race.
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM parties WHERE name = ?1",
            params![req.name],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(SimError::Conflict(format!(
            "a party named '{}' already exists",
            req.name
        )));
    }

    let sender = get_party(&tx, req.sender_party_id)?;
    tx.execute(
        "INSERT INTO parties (name, color, bio, leader_id) VALUES (?1, ?2, ?3, ?4)",
        params![req.name, req.color, req.bio, sender.leader_id],
    )
    .map_err(|e| unique_conflict(e, "party name already exists"))?;
    let fused_id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO party_stances (party_id, topic, position)
         SELECT ?1, topic, position FROM merge_request_stances WHERE merge_request_id = ?2",
        params![fused_id, req.id],
    )?;
    tx.execute(
        "UPDATE principals SET party_id = ?1 WHERE party_id IN (?2, ?3)",
        params![fused_id, req.sender_party_id, req.receiver_party_id],
    )?;
    tx.execute(
        "DELETE FROM party_stances WHERE party_id IN (?1, ?2)",
        params![req.sender_party_id, req.receiver_party_id],
    )?;
    tx.execute(
        "DELETE FROM parties WHERE id IN (?1, ?2)",
        params![req.sender_party_id, req.receiver_party_id],
    )?;
    tx.execute(
        "UPDATE merge_requests SET status = 'accepted' WHERE id = ?1",
        params![req.id],
    )?;
    feed::emit(
        &tx,
        "party_merged",
        &json!({
            "mergeRequestId": req.id,
            "newPartyId": fused_id,
            "name": req.name,
        }),
        now,
    )?;
    tx.commit()?;
    json_log(
        "merge",
        obj(&[
            ("event", v_str("accepted")),
            ("merge_request_id", v_int(request_id)),
            ("party_id", v_int(fused_id)),
        ]),
    );
    Ok(fused_id)
}

/// Receiver declines; terminal.
pub fn reject(store: &mut Store, request_id: i64, acting_party_id: i64, now: i64) -> SimResult<()> {
    let tx = store.conn_mut().transaction()?;
    let req = load_pending(&tx, request_id)?;
    if req.receiver_party_id != acting_party_id {
        return Err(SimError::NotFound(format!(
            "no pending merge request {} for party {}",
            request_id, acting_party_id
        )));
    }
    tx.execute(
        "UPDATE merge_requests SET status = 'rejected' WHERE id = ?1",
        params![req.id],
    )?;
    feed::emit(
        &tx,
        "merge_rejected",
        &json!({"mergeRequestId": req.id}),
        now,
    )?;
    tx.commit()?;
    json_log(
        "merge",
        obj(&[
            ("event", v_str("rejected")),
            ("merge_request_id", v_int(request_id)),
        ]),
    );
    Ok(())
}

/// Sender withdraws a still-Pending request; the request and its proposed
/// stances are removed.
pub fn cancel(store: &mut Store, request_id: i64, acting_party_id: i64, now: i64) -> SimResult<()> {
    let tx = store.conn_mut().transaction()?;
    let req = load_pending(&tx, request_id)?;
    if req.sender_party_id != acting_party_id {
        return Err(SimError::NotFound(format!(
            "no pending merge request {} sent by party {}",
            request_id, acting_party_id
        )));
    }
    tx.execute(
        "DELETE FROM merge_request_stances WHERE merge_request_id = ?1",
        params![req.id],
    )?;
    tx.execute("DELETE FROM merge_requests WHERE id = ?1", params![req.id])?;
    feed::emit(
        &tx,
        "merge_cancelled",
        &json!({"mergeRequestId": req.id}),
        now,
    )?;
    tx.commit()?;
    Ok(())
}

pub fn request_status(conn: &Connection, request_id: i64) -> SimResult<String> {
    let row = conn
        .query_row(
            "SELECT status FROM merge_requests WHERE id = ?1",
            params![request_id],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    row.ok_or_else(|| SimError::NotFound(format!("merge request {}", request_id)))
}
