use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{SimError, SimResult};
use crate::state::Role;

/// Shared relational store. All multi-step mutations go through
/// `conn_mut().transaction()`: begin, ordered writes, commit, full rollback
/// on any failure. Concurrency correctness is pushed to the UNIQUE
/// constraints below.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &str) -> SimResult<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn open_in_memory() -> SimResult<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> SimResult<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS principals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'citizen',
                party_id INTEGER,
                balance INTEGER NOT NULL DEFAULT 0,
                last_active_ts INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS bills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                creator_id INTEGER,
                status TEXT NOT NULL DEFAULT 'queued',
                stage TEXT NOT NULL DEFAULT 'house',
                pool_id INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS votes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bill_id INTEGER NOT NULL,
                voter_id INTEGER NOT NULL,
                chamber TEXT NOT NULL,
                yes INTEGER NOT NULL,
                cast_at INTEGER NOT NULL,
                UNIQUE(bill_id, voter_id, chamber)
            );
            CREATE TABLE IF NOT EXISTS parties (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                color TEXT NOT NULL DEFAULT '',
                bio TEXT NOT NULL DEFAULT '',
                leader_id INTEGER
            );
            CREATE TABLE IF NOT EXISTS party_stances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                party_id INTEGER NOT NULL,
                topic TEXT NOT NULL,
                position TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS merge_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_party_id INTEGER NOT NULL,
                receiver_party_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                name TEXT NOT NULL,
                color TEXT NOT NULL DEFAULT '',
                bio TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_merge_pending
                ON merge_requests(sender_party_id, receiver_party_id)
                WHERE status = 'pending';
            CREATE TABLE IF NOT EXISTS merge_request_stances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                merge_request_id INTEGER NOT NULL,
                topic TEXT NOT NULL,
                position TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                share_price INTEGER NOT NULL DEFAULT 0,
                issued_shares INTEGER NOT NULL DEFAULT 0,
                policy TEXT NOT NULL DEFAULT 'legacy-hourly',
                mint_trigger_enabled INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS holdings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL,
                principal_id INTEGER NOT NULL,
                shares INTEGER NOT NULL DEFAULT 0,
                UNIQUE(company_id, principal_id)
            );
            CREATE TABLE IF NOT EXISTS elections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                seats INTEGER NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open'
            );
            CREATE TABLE IF NOT EXISTS candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                election_id INTEGER NOT NULL,
                principal_id INTEGER NOT NULL,
                votes INTEGER NOT NULL DEFAULT 0,
                has_won INTEGER NOT NULL DEFAULT 0,
                UNIQUE(election_id, principal_id)
            );
            CREATE TABLE IF NOT EXISTS feed_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tick_watermarks (
                kind TEXT PRIMARY KEY,
                last_ts INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

// =============================================================================
// Principal rows
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: i64,
    pub name: String,
    pub role: Role,
    pub party_id: Option<i64>,
    pub balance: i64,
    pub last_active_ts: i64,
}

pub fn get_principal(conn: &Connection, id: i64) -> SimResult<Principal> {
    let row = conn
        .query_row(
            "SELECT id, name, role, party_id, balance, last_active_ts
             FROM principals WHERE id = ?1",
            params![id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<i64>>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;
    let (id, name, role, party_id, balance, last_active_ts) =
        row.ok_or_else(|| SimError::NotFound(format!("principal {}", id)))?;
    Ok(Principal {
        id,
        name,
        role: Role::parse(&role)?,
        party_id,
        balance,
        last_active_ts,
    })
}

/// Insert a principal; used by seeding and tests.
pub fn insert_principal(
    conn: &Connection,
    name: &str,
    role: Role,
    party_id: Option<i64>,
) -> SimResult<i64> {
    conn.execute(
        "INSERT INTO principals (name, role, party_id, last_active_ts) VALUES (?1, ?2, ?3, 0)",
        params![name, role.as_str(), party_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn touch_principal(conn: &Connection, id: i64, now: i64) -> SimResult<()> {
    conn.execute(
        "UPDATE principals SET last_active_ts = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        store.init().unwrap();
    }

    #[test]
    fn test_principal_round_trip() {
        let mut store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        let id = insert_principal(store.conn(), "ada", Role::Senator, None).unwrap();
        let p = get_principal(store.conn(), id).unwrap();
        assert_eq!(p.name, "ada");
        assert_eq!(p.role, Role::Senator);
        assert_eq!(p.party_id, None);
    }

    #[test]
    fn test_missing_principal_is_not_found() {
        let mut store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        let err = get_principal(store.conn(), 999).unwrap_err();
        assert!(matches!(err, SimError::NotFound(_)));
    }
}
