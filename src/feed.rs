//! Feed/notification sink. Mutating components emit one feed event per
//! user-visible outcome; writing the row on the caller's connection keeps the
//! event atomic with the mutation it announces.

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::error::SimResult;
use crate::logging::{json_log, obj, v_int, v_str};

pub fn emit(conn: &Connection, kind: &str, body: &Value, now: i64) -> SimResult<i64> {
    conn.execute(
        "INSERT INTO feed_events (kind, body, created_at) VALUES (?1, ?2, ?3)",
        params![kind, body.to_string(), now],
    )?;
    let id = conn.last_insert_rowid();
    json_log(
        "feed",
        obj(&[("kind", v_str(kind)), ("event_id", v_int(id))]),
    );
    Ok(id)
}

pub fn recent(conn: &Connection, limit: i64) -> SimResult<Vec<(i64, String, Value)>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, body FROM feed_events ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, kind, body) = row?;
        let body = serde_json::from_str(&body).unwrap_or(Value::Null);
        out.push((id, kind, body));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use serde_json::json;

    #[test]
    fn test_emit_and_read_back() {
        let mut s = Store::open_in_memory().unwrap();
        s.init().unwrap();
        emit(s.conn(), "party_merge", &json!({"newPartyId": 3}), 100).unwrap();
        emit(s.conn(), "dividend_tick", &json!({"paid": 2500}), 101).unwrap();
        let events = recent(s.conn(), 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1, "dividend_tick");
        assert_eq!(events[1].2["newPartyId"], 3);
    }
}
