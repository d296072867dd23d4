//! JSON-over-HTTP surface. Hand-rolled HTTP/1.1 on a tokio listener: parse
//! the request line, headers and a Content-Length body, route, respond.
//! Every entity id on the wire is a monotonically increasing integer; the
//! only wire format is JSON bodies.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::bill;
use crate::capability::CapabilitySet;
use crate::error::{SimError, SimResult};
use crate::feed;
use crate::logging::{json_log, log, obj, v_str, Domain, Level};
use crate::merge::{self, PartyProposal, Stance};
use crate::roles;
use crate::scheduler;
use crate::state::{Chamber, Config};
use crate::storage::Store;
use crate::tick::{self, CredentialVerifier};

pub struct App {
    pub cfg: Config,
    pub store: Mutex<Store>,
    pub capabilities: CapabilitySet,
    pub verifier: Box<dyn CredentialVerifier>,
}

pub struct Request {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn bearer(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then_some(v)
        })
    }
}

async fn read_request(stream: &mut TcpStream) -> anyhow::Result<Request> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed mid-request");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            anyhow::bail!("request headers too large");
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default();
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            let k = k.trim().to_string();
            let v = v.trim().to_string();
            if k.eq_ignore_ascii_case("content-length") {
                content_length = v.parse().unwrap_or(0);
            }
            headers.push((k, v));
        }
    }
    if content_length > 1024 * 1024 {
        anyhow::bail!("request body too large");
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request { method, path, query, headers, body })
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "BAD REQUEST",
        401 => "UNAUTHORIZED",
        403 => "FORBIDDEN",
        404 => "NOT FOUND",
        409 => "CONFLICT",
        _ => "INTERNAL SERVER ERROR",
    }
}

fn render(code: u16, body: &Value) -> String {
    let body = body.to_string();
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        code,
        status_text(code),
        body.len(),
        body
    )
}

fn err_body(err: &SimError) -> (u16, Value) {
    (
        err.http_status(),
        json!({"error": {"kind": err.kind(), "message": err.to_string()}}),
    )
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> SimResult<T> {
    serde_json::from_slice(body).map_err(|e| SimError::Validation(format!("bad request body: {}", e)))
}

fn parse_id(segment: &str) -> SimResult<i64> {
    segment
        .parse()
        .map_err(|_| SimError::Validation(format!("bad id: {}", segment)))
}

// =============================================================================
// Request bodies
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBillBody {
    title: String,
    content: String,
    creator_id: Option<i64>,
    pool_id: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBillBody {
    title: String,
    content: String,
    requester_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBillBody {
    requester_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteBody {
    principal_id: i64,
    bill_id: i64,
    chamber: Chamber,
    yes: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeCreateBody {
    sender_party_id: i64,
    receiver_party_id: i64,
    proposed_party_data: PartyProposal,
    #[serde(default)]
    stances: Vec<Stance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActingPartyBody {
    acting_party_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleChangeBody {
    user_id: i64,
    acting_identity: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityBody {
    acting_identity: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintBody {
    company_id: i64,
    net_demand: i64,
}

// =============================================================================
// Routing
// =============================================================================

pub async fn serve(app: Arc<App>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&app.cfg.http_addr).await?;
    json_log(
        "server",
        obj(&[("status", v_str("listening")), ("addr", v_str(&app.cfg.http_addr))]),
    );
    loop {
        let (stream, peer) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(stream, peer.ip(), app).await {
                log(
                    Level::Debug,
                    Domain::System,
                    "conn_error",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
        });
    }
}

async fn handle_conn(mut stream: TcpStream, peer: IpAddr, app: Arc<App>) -> anyhow::Result<()> {
    let req = read_request(&mut stream).await?;
    let (code, body) = match dispatch(&app, peer, &req).await {
        Ok(value) => (200, value),
        Err(err) => err_body(&err),
    };
    stream.write_all(render(code, &body).as_bytes()).await?;
    Ok(())
}

async fn dispatch(app: &App, peer: IpAddr, req: &Request) -> SimResult<Value> {
    let segments: Vec<&str> = req.path.trim_matches('/').split('/').collect();
    match (req.method.as_str(), segments.as_slice()) {
        ("GET", ["api", "health"]) => Ok(json!({"status": "ok"})),

        ("POST", ["api", "bills"]) => {
            let b: CreateBillBody = parse_body(&req.body)?;
            let mut store = lock_store(app)?;
            let bill = bill::create(
                &mut store,
                &b.title,
                &b.content,
                b.creator_id,
                b.pool_id,
                crate::state::now_ts(),
            )?;
            Ok(serde_json::to_value(bill).unwrap_or(Value::Null))
        }
        ("POST", ["api", "bills", id, "update"]) => {
            let bill_id = parse_id(id)?;
            let b: UpdateBillBody = parse_body(&req.body)?;
            let mut store = lock_store(app)?;
            let bill = bill::update(&mut store, bill_id, &b.title, &b.content, b.requester_id)?;
            Ok(serde_json::to_value(bill).unwrap_or(Value::Null))
        }
        ("POST", ["api", "bills", id, "submit"]) => {
            let bill_id = parse_id(id)?;
            let b: SubmitBillBody = parse_body(&req.body)?;
            let mut store = lock_store(app)?;
            let bill = bill::submit_for_voting(&mut store, bill_id, b.requester_id)?;
            Ok(serde_json::to_value(bill).unwrap_or(Value::Null))
        }
        ("GET", ["api", "bills", id, "tally"]) => {
            let bill_id = parse_id(id)?;
            let chamber = req
                .query_param("chamber")
                .ok_or_else(|| SimError::Validation("missing chamber".to_string()))?;
            let chamber = Chamber::parse(chamber)?;
            let store = lock_store(app)?;
            let t = bill::tally(&store, bill_id, chamber)?;
            Ok(serde_json::to_value(t).unwrap_or(Value::Null))
        }
        ("POST", ["api", "votes"]) => {
            let b: VoteBody = parse_body(&req.body)?;
            let mut store = lock_store(app)?;
            let t = bill::cast_vote(&mut store, b.bill_id, b.principal_id, b.chamber, b.yes, crate::state::now_ts())?;
            Ok(serde_json::to_value(t).unwrap_or(Value::Null))
        }

        ("POST", ["api", "merges"]) => {
            let b: MergeCreateBody = parse_body(&req.body)?;
            let mut store = lock_store(app)?;
            let id = merge::create(
                &mut store,
                b.sender_party_id,
                b.receiver_party_id,
                &b.proposed_party_data,
                &b.stances,
                crate::state::now_ts(),
            )?;
            Ok(json!({"mergeRequestId": id}))
        }
        ("POST", ["api", "merges", id, "accept"]) => {
            let request_id = parse_id(id)?;
            let b: ActingPartyBody = parse_body(&req.body)?;
            let mut store = lock_store(app)?;
            let new_party = merge::accept(&mut store, request_id, b.acting_party_id, crate::state::now_ts())?;
            Ok(json!({"success": true, "newPartyId": new_party}))
        }
        ("POST", ["api", "merges", id, "reject"]) => {
            let request_id = parse_id(id)?;
            let b: ActingPartyBody = parse_body(&req.body)?;
            let mut store = lock_store(app)?;
            merge::reject(&mut store, request_id, b.acting_party_id, crate::state::now_ts())?;
            Ok(json!({"success": true}))
        }
        ("POST", ["api", "merges", id, "cancel"]) => {
            let request_id = parse_id(id)?;
            let b: ActingPartyBody = parse_body(&req.body)?;
            let mut store = lock_store(app)?;
            merge::cancel(&mut store, request_id, b.acting_party_id, crate::state::now_ts())?;
            Ok(json!({"success": true}))
        }

        ("POST", ["api", "roles", action @ ("promote" | "demote")]) => {
            let b: RoleChangeBody = parse_body(&req.body)?;
            require_admin(app, &b.acting_identity)?;
            let mut store = lock_store(app)?;
            let p = match *action {
                "promote" => roles::promote(&mut store, b.user_id)?,
                _ => roles::demote(&mut store, b.user_id)?,
            };
            Ok(serde_json::to_value(p).unwrap_or(Value::Null))
        }

        ("POST", ["api", "capabilities", "reload"]) => {
            let b: IdentityBody = parse_body(&req.body)?;
            require_admin(app, &b.acting_identity)?;
            app.capabilities.reload()?;
            Ok(json!({"success": true}))
        }

        ("POST", ["api", "stocks", "mint"]) => {
            let b: MintBody = parse_body(&req.body)?;
            let threshold = app.cfg.mint_demand_threshold;
            let mut store = lock_store(app)?;
            let report = scheduler::buy_pressure_mint(
                &mut store,
                b.company_id,
                b.net_demand,
                threshold,
                crate::state::now_ts(),
            )?;
            match report {
                Some(r) => Ok(serde_json::to_value(r).unwrap_or(Value::Null)),
                None => Ok(json!({"minted": 0})),
            }
        }

        ("POST", ["api", "tick", kind @ ("dividends" | "stages" | "elections")]) => {
            let actor = tick::authorize(
                &app.cfg,
                peer,
                req.header("x-scheduler-token"),
                req.bearer(),
                app.verifier.as_ref(),
            )
            .await?;
            log(
                Level::Info,
                Domain::Tick,
                "tick_authorized",
                obj(&[
                    ("kind", v_str(kind)),
                    ("actor", v_str(&format!("{:?}", actor))),
                ]),
            );
            let now = crate::state::now_ts();
            let mut store = lock_store(app)?;
            match *kind {
                "dividends" => {
                    let r = scheduler::dividend_tick(&mut store, now)?;
                    Ok(serde_json::to_value(r).unwrap_or(Value::Null))
                }
                "stages" => {
                    let r = scheduler::stage_sweep(&mut store, now)?;
                    Ok(serde_json::to_value(r).unwrap_or(Value::Null))
                }
                _ => {
                    let r = scheduler::election_sweep(&mut store, now)?;
                    Ok(serde_json::to_value(r).unwrap_or(Value::Null))
                }
            }
        }

        ("GET", ["api", "feed"]) => {
            let limit = req
                .query_param("limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(50);
            let store = lock_store(app)?;
            let events: Vec<Value> = feed::recent(store.conn(), limit)?
                .into_iter()
                .map(|(id, kind, body)| json!({"id": id, "kind": kind, "body": body}))
                .collect();
            Ok(json!({"events": events}))
        }

        _ => Err(SimError::NotFound(format!("{} {}", req.method, req.path))),
    }
}

fn lock_store(app: &App) -> SimResult<std::sync::MutexGuard<'_, Store>> {
    app.store
        .lock()
        .map_err(|_| SimError::Misconfiguration("store lock poisoned".to_string()))
}

fn require_admin(app: &App, identity: &str) -> SimResult<()> {
    if app.capabilities.is_admin(identity) {
        return Ok(());
    }
    log(
        Level::Warn,
        Domain::Audit,
        "admin_denied",
        obj(&[("identity", v_str(identity))]),
    );
    Err(SimError::Forbidden("identity lacks admin capability".to_string()))
}
