//! Scheduled tick authorizer.
//!
//! Time-advancing handlers (dividend tick, stage sweep, election resolution)
//! are externally triggered and gated by a two-tier trust check:
//!
//! - loopback caller in a non-production environment: shared local token
//!   only, no credential round trip (local development cannot mint real
//!   scheduler credentials)
//! - everything else, and always in production: the production scheduler
//!   token AND a bearer credential verified against the site's own origin as
//!   audience AND a verified identity matching the scheduler naming pattern
//!
//! A missing required server-side secret is Misconfiguration, never a silent
//! pass-through.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{SimError, SimResult};
use crate::logging::{log, obj, token_digest, v_str, Domain, Level};
use crate::state::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickActor {
    /// Loopback development caller, shared-token tier.
    Local,
    /// Verified scheduler service identity.
    Scheduler(String),
}

#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub identity: String,
    pub audience: String,
}

/// Seam for the one network round trip. Production wires `HttpVerifier`;
/// tests inject a stub.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &str, audience: &str) -> SimResult<VerifiedIdentity>;
}

pub struct HttpVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpVerifier {
    pub fn new(cfg: &Config) -> SimResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.verify_timeout_ms))
            .build()
            .map_err(|e| SimError::Misconfiguration(format!("verifier client: {}", e)))?;
        Ok(Self {
            client,
            url: cfg.cred_verify_url.clone(),
        })
    }
}

#[derive(Deserialize)]
struct VerifyResponse {
    identity: String,
    audience: String,
}

#[async_trait]
impl CredentialVerifier for HttpVerifier {
    async fn verify(&self, credential: &str, audience: &str) -> SimResult<VerifiedIdentity> {
        // Timeouts, transport errors and verifier rejections all collapse to
        // Unauthorized; verification internals never reach the caller.
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({"credential": credential, "audience": audience}))
            .send()
            .await
            .map_err(|_| SimError::Unauthorized("credential verification failed".to_string()))?;
        if !resp.status().is_success() {
            return Err(SimError::Unauthorized("credential rejected".to_string()));
        }
        let body: VerifyResponse = resp
            .json()
            .await
            .map_err(|_| SimError::Unauthorized("credential verification failed".to_string()))?;
        if body.audience != audience {
            return Err(SimError::Unauthorized("credential audience mismatch".to_string()));
        }
        Ok(VerifiedIdentity {
            identity: body.identity,
            audience: body.audience,
        })
    }
}

fn audit(event: &str, fields: &[(&str, serde_json::Value)]) {
    log(Level::Warn, Domain::Audit, event, obj(fields));
}

/// Decide whether a tick request may proceed, and as whom.
pub async fn authorize(
    cfg: &Config,
    remote_ip: IpAddr,
    header_token: Option<&str>,
    bearer: Option<&str>,
    verifier: &dyn CredentialVerifier,
) -> SimResult<TickActor> {
    // Server-side secrets are checked before the presented token: an
    // unconfigured deployment surfaces Misconfiguration to the operator
    // instead of masquerading as a client auth failure.
    if remote_ip.is_loopback() && !cfg.is_production() {
        let expected = cfg.local_tick_token.as_deref().ok_or_else(|| {
            SimError::Misconfiguration("LOCAL_TICK_TOKEN is not configured".to_string())
        })?;
        let presented = header_token
            .ok_or_else(|| SimError::Unauthorized("missing x-scheduler-token".to_string()))?;
        if presented != expected {
            audit(
                "local_token_mismatch",
                &[("token_digest", v_str(&token_digest(presented)))],
            );
            return Err(SimError::Unauthorized("invalid scheduler token".to_string()));
        }
        return Ok(TickActor::Local);
    }

    // Strict path: non-loopback callers, and every caller in production.
    let expected = cfg.prod_tick_token.as_deref().ok_or_else(|| {
        SimError::Misconfiguration("PROD_TICK_TOKEN is not configured".to_string())
    })?;
    let presented = header_token
        .ok_or_else(|| SimError::Unauthorized("missing x-scheduler-token".to_string()))?;
    if presented != expected {
        audit(
            "prod_token_mismatch",
            &[("token_digest", v_str(&token_digest(presented)))],
        );
        return Err(SimError::Unauthorized("invalid scheduler token".to_string()));
    }
    let bearer = bearer
        .ok_or_else(|| SimError::Unauthorized("missing bearer credential".to_string()))?;
    let verified = verifier.verify(bearer, &cfg.site_origin).await?;
    if !verified.identity.ends_with(&cfg.scheduler_identity_suffix) {
        // The shared token matched but the credential belongs to someone
        // other than the scheduler service.
        audit(
            "scheduler_identity_mismatch",
            &[("identity", v_str(&verified.identity))],
        );
        return Err(SimError::Forbidden(format!(
            "{} is not a scheduler identity",
            verified.identity
        )));
    }
    Ok(TickActor::Scheduler(verified.identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct StubVerifier {
        identity: Option<String>,
    }

    #[async_trait]
    impl CredentialVerifier for StubVerifier {
        async fn verify(&self, _credential: &str, audience: &str) -> SimResult<VerifiedIdentity> {
            match &self.identity {
                Some(identity) => Ok(VerifiedIdentity {
                    identity: identity.clone(),
                    audience: audience.to_string(),
                }),
                None => Err(SimError::Unauthorized("credential rejected".to_string())),
            }
        }
    }

    fn cfg(environment: &str) -> Config {
        let mut cfg = Config::from_env();
        cfg.environment = environment.to_string();
        cfg.local_tick_token = Some("local-secret".to_string());
        cfg.prod_tick_token = Some("prod-secret".to_string());
        cfg.scheduler_identity_suffix = "@scheduler.example.org".to_string();
        cfg
    }

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn remote() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
    }

    fn no_verify() -> StubVerifier {
        StubVerifier { identity: None }
    }

    #[tokio::test]
    async fn test_verify_timeout_is_bounded_unauthorized() {
        use tokio::io::AsyncReadExt;

        // A server that accepts and reads but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        let mut cfg = cfg("production");
        cfg.verify_timeout_ms = 200;
        cfg.cred_verify_url = format!("http://{}/verify", addr);
        let verifier = HttpVerifier::new(&cfg).unwrap();

        let started = std::time::Instant::now();
        let err = verifier.verify("jwt", &cfg.site_origin).await.unwrap_err();
        assert!(matches!(err, SimError::Unauthorized(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_verify_rejection_status_is_unauthorized() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 403 FORBIDDEN\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        let mut cfg = cfg("production");
        cfg.verify_timeout_ms = 2000;
        cfg.cred_verify_url = format!("http://{}/verify", addr);
        let verifier = HttpVerifier::new(&cfg).unwrap();
        let err = verifier.verify("jwt", &cfg.site_origin).await.unwrap_err();
        assert!(matches!(err, SimError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_local_token_suffices_off_production() {
        let cfg = cfg("dev");
        // Verifier rejects everything: the local path must not consult it.
        let actor = authorize(&cfg, loopback(), Some("local-secret"), None, &no_verify())
            .await
            .unwrap();
        assert_eq!(actor, TickActor::Local);
    }

    #[tokio::test]
    async fn test_identical_local_request_fails_in_production() {
        let cfg = cfg("production");
        let err = authorize(&cfg, loopback(), Some("local-secret"), None, &no_verify())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_wrong_local_token_is_unauthorized() {
        let cfg = cfg("dev");
        let err = authorize(&cfg, loopback(), Some("nope"), None, &no_verify())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_missing_local_token_config_is_fatal() {
        let mut cfg = cfg("dev");
        cfg.local_tick_token = None;
        let err = authorize(&cfg, loopback(), Some("anything"), None, &no_verify())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Misconfiguration(_)));
    }

    #[tokio::test]
    async fn test_missing_prod_token_config_is_fatal() {
        let mut cfg = cfg("production");
        cfg.prod_tick_token = None;
        let err = authorize(&cfg, remote(), Some("prod-secret"), None, &no_verify())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Misconfiguration(_)));
    }

    #[tokio::test]
    async fn test_prod_requires_bearer_even_with_token() {
        let cfg = cfg("production");
        let err = authorize(&cfg, remote(), Some("prod-secret"), None, &no_verify())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_verified_scheduler_identity_passes() {
        let cfg = cfg("production");
        let verifier = StubVerifier {
            identity: Some("ticker@scheduler.example.org".to_string()),
        };
        let actor = authorize(&cfg, remote(), Some("prod-secret"), Some("jwt"), &verifier)
            .await
            .unwrap();
        assert_eq!(
            actor,
            TickActor::Scheduler("ticker@scheduler.example.org".to_string())
        );
    }

    #[tokio::test]
    async fn test_wrong_identity_is_forbidden_despite_token() {
        let cfg = cfg("production");
        let verifier = StubVerifier {
            identity: Some("someone@users.example.org".to_string()),
        };
        let err = authorize(&cfg, remote(), Some("prod-secret"), Some("jwt"), &verifier)
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_non_loopback_uses_strict_path_even_in_dev() {
        let cfg = cfg("dev");
        let err = authorize(&cfg, remote(), Some("local-secret"), None, &no_verify())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_secret_outranks_missing_token() {
        // No token presented and no secret configured: the operator-facing
        // Misconfiguration wins over the client-facing Unauthorized.
        let mut cfg = cfg("dev");
        cfg.local_tick_token = None;
        let err = authorize(&cfg, loopback(), None, None, &no_verify())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Misconfiguration(_)));

        let mut cfg = self::cfg("production");
        cfg.prod_tick_token = None;
        let err = authorize(&cfg, remote(), None, None, &no_verify())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Misconfiguration(_)));
    }

    #[tokio::test]
    async fn test_missing_header_token() {
        let cfg = cfg("dev");
        let err = authorize(&cfg, loopback(), None, None, &no_verify())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Unauthorized(_)));
    }
}
