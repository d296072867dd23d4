use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

#[derive(Clone)]
pub struct Config {
    pub sqlite_path: String,
    pub http_addr: String,
    /// "production" enables the strict tick-authorization path; anything else
    /// (dev, staging, test) allows the loopback shortcut.
    pub environment: String,
    pub local_tick_token: Option<String>,
    pub prod_tick_token: Option<String>,
    pub cred_verify_url: String,
    pub site_origin: String,
    /// Verified scheduler identities must end with this suffix.
    pub scheduler_identity_suffix: String,
    pub verify_timeout_ms: u64,
    pub admin_capabilities: Option<String>,
    pub admin_capability_file: Option<String>,
    /// Net-demand threshold for event-conditional share minting.
    pub mint_demand_threshold: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./civiclab.sqlite".to_string()),
            http_addr: std::env::var("HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:8090".to_string()),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()),
            local_tick_token: std::env::var("LOCAL_TICK_TOKEN").ok(),
            prod_tick_token: std::env::var("PROD_TICK_TOKEN").ok(),
            cred_verify_url: std::env::var("CRED_VERIFY_URL").unwrap_or_else(|_| "https://oauth2.googleapis.com/tokeninfo".to_string()),
            site_origin: std::env::var("SITE_ORIGIN").unwrap_or_else(|_| "http://localhost:8090".to_string()),
            scheduler_identity_suffix: std::env::var("SCHEDULER_IDENTITY_SUFFIX").unwrap_or_else(|_| ".gserviceaccount.com".to_string()),
            verify_timeout_ms: std::env::var("VERIFY_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5000),
            admin_capabilities: std::env::var("ADMIN_CAPABILITIES").ok(),
            admin_capability_file: std::env::var("ADMIN_CAPABILITY_FILE").ok(),
            mint_demand_threshold: std::env::var("MINT_DEMAND_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(25),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Shared domain value types
// =============================================================================

/// The ordered role ladder. Ordering is load-bearing: promotion moves exactly
/// one rung up, demotion one rung down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Citizen,
    Representative,
    Senator,
    President,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Citizen => "citizen",
            Role::Representative => "representative",
            Role::Senator => "senator",
            Role::President => "president",
        }
    }

    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "citizen" => Ok(Role::Citizen),
            "representative" => Ok(Role::Representative),
            "senator" => Ok(Role::Senator),
            "president" => Ok(Role::President),
            other => Err(SimError::Validation(format!("unknown role: {}", other))),
        }
    }

    /// The voting chamber this role sits in. Citizens hold no seat.
    pub fn chamber(&self) -> Option<Chamber> {
        match self {
            Role::Citizen => None,
            Role::Representative => Some(Chamber::House),
            Role::Senator => Some(Chamber::Senate),
            Role::President => Some(Chamber::President),
        }
    }

    pub fn next_up(&self) -> Option<Role> {
        match self {
            Role::Citizen => Some(Role::Representative),
            Role::Representative => Some(Role::Senator),
            Role::Senator => Some(Role::President),
            Role::President => None,
        }
    }

    pub fn next_down(&self) -> Option<Role> {
        match self {
            Role::Citizen => None,
            Role::Representative => Some(Role::Citizen),
            Role::Senator => Some(Role::Representative),
            Role::President => Some(Role::Senator),
        }
    }
}

/// Ordered voting bodies a bill passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chamber {
    House,
    Senate,
    President,
}

impl Chamber {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chamber::House => "house",
            Chamber::Senate => "senate",
            Chamber::President => "president",
        }
    }

    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "house" => Ok(Chamber::House),
            "senate" => Ok(Chamber::Senate),
            "president" => Ok(Chamber::President),
            other => Err(SimError::Validation(format!("unknown chamber: {}", other))),
        }
    }

    /// Next stage in House -> Senate -> President, None at the last.
    pub fn next(&self) -> Option<Chamber> {
        match self {
            Chamber::House => Some(Chamber::Senate),
            Chamber::Senate => Some(Chamber::President),
            Chamber::President => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillStatus {
    Queued,
    Voting,
    Passed,
    Failed,
    Vetoed,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Queued => "queued",
            BillStatus::Voting => "voting",
            BillStatus::Passed => "passed",
            BillStatus::Failed => "failed",
            BillStatus::Vetoed => "vetoed",
        }
    }

    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "queued" => Ok(BillStatus::Queued),
            "voting" => Ok(BillStatus::Voting),
            "passed" => Ok(BillStatus::Passed),
            "failed" => Ok(BillStatus::Failed),
            "vetoed" => Ok(BillStatus::Vetoed),
            other => Err(SimError::Validation(format!("unknown bill status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BillStatus::Passed | BillStatus::Failed | BillStatus::Vetoed)
    }
}

/// Share issuance policy mode for a company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyMode {
    #[serde(rename = "legacy-hourly")]
    LegacyHourly,
    #[serde(rename = "event-conditional")]
    EventConditional,
}

impl PolicyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyMode::LegacyHourly => "legacy-hourly",
            PolicyMode::EventConditional => "event-conditional",
        }
    }

    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "legacy-hourly" => Ok(PolicyMode::LegacyHourly),
            "event-conditional" => Ok(PolicyMode::EventConditional),
            other => Err(SimError::Validation(format!("unknown policy mode: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Citizen < Role::Representative);
        assert!(Role::Representative < Role::Senator);
        assert!(Role::Senator < Role::President);
    }

    #[test]
    fn test_role_chamber_mapping() {
        assert_eq!(Role::Citizen.chamber(), None);
        assert_eq!(Role::Representative.chamber(), Some(Chamber::House));
        assert_eq!(Role::Senator.chamber(), Some(Chamber::Senate));
        assert_eq!(Role::President.chamber(), Some(Chamber::President));
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Chamber::House.next(), Some(Chamber::Senate));
        assert_eq!(Chamber::Senate.next(), Some(Chamber::President));
        assert_eq!(Chamber::President.next(), None);
    }

    #[test]
    fn test_round_trip_parse() {
        for r in [Role::Citizen, Role::Representative, Role::Senator, Role::President] {
            assert_eq!(Role::parse(r.as_str()).unwrap(), r);
        }
        for s in [BillStatus::Queued, BillStatus::Voting, BillStatus::Passed, BillStatus::Failed, BillStatus::Vetoed] {
            assert_eq!(BillStatus::parse(s.as_str()).unwrap(), s);
        }
        assert_eq!(PolicyMode::parse("legacy-hourly").unwrap(), PolicyMode::LegacyHourly);
        assert_eq!(PolicyMode::parse("event-conditional").unwrap(), PolicyMode::EventConditional);
    }
}
