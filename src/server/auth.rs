//! API authentication, quotas, and one-shot capability tickets.
//!
//! `GET /ticket?method=` authenticates the caller (API key or bearer token,
//! or unauthenticated loopback when `ALLOW_LOCALHOST` is set), checks the
//! per-method policy and the per-minute quota, and mints a single-use
//! ticket. `POST /envelope` redeems the ticket for exactly one invocation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use crate::config::ApiAuthConfig;

const TICKET_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("missing or unknown credentials")]
    Unauthorized,
    #[error("method '{0}' not allowed for this caller")]
    MethodForbidden(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("ticket invalid, expired, or already used")]
    BadTicket,
}

/// Who the caller authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    ApiKey(String),
    Bearer(String),
    Localhost,
}

impl Caller {
    fn rate_key(&self) -> String {
        match self {
            Caller::ApiKey(key) => format!("key:{key}"),
            Caller::Bearer(token) => format!("bearer:{token}"),
            Caller::Localhost => "localhost".to_string(),
        }
    }
}

struct Ticket {
    method: String,
    issued_at: Instant,
}

/// Ticket issuing and redemption state, process-wide.
pub struct TicketRegistry {
    config: ApiAuthConfig,
    tickets: Mutex<HashMap<String, Ticket>>,
    /// caller rate-key → recent grant instants (one-minute window).
    rate: Mutex<HashMap<String, Vec<Instant>>>,
}

impl TicketRegistry {
    pub fn new(config: ApiAuthConfig) -> Self {
        Self {
            config,
            tickets: Mutex::new(HashMap::new()),
            rate: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve credentials into a caller identity.
    pub fn authenticate(
        &self,
        api_key: Option<&str>,
        bearer: Option<&str>,
        is_loopback: bool,
    ) -> Result<Caller, AuthError> {
        if let Some(key) = api_key {
            if self.config.api_keys.iter().any(|k| k == key) {
                return Ok(Caller::ApiKey(key.to_string()));
            }
        }
        if let Some(token) = bearer {
            if self.config.bearer_tokens.iter().any(|t| t == token) {
                return Ok(Caller::Bearer(token.to_string()));
            }
        }
        if is_loopback && self.config.allow_localhost {
            return Ok(Caller::Localhost);
        }
        Err(AuthError::Unauthorized)
    }

    fn check_policy(&self, caller: &Caller, method: &str) -> Result<(), AuthError> {
        let Some(allowed) = self.config.method_policy.get(method) else {
            // No policy entry: every authenticated caller may use it.
            return Ok(());
        };
        let granted = match caller {
            Caller::ApiKey(key) => allowed.iter().any(|prefix| key.starts_with(prefix.as_str())),
            Caller::Bearer(token) => {
                allowed.iter().any(|prefix| token.starts_with(prefix.as_str()))
            }
            Caller::Localhost => true,
        };
        if granted {
            Ok(())
        } else {
            Err(AuthError::MethodForbidden(method.to_string()))
        }
    }

    fn check_rate(&self, caller: &Caller) -> Result<(), AuthError> {
        let mut rate = self.rate.lock().unwrap();
        let window = rate.entry(caller.rate_key()).or_default();
        let now = Instant::now();
        window.retain(|t| now.duration_since(*t) < Duration::from_secs(60));
        if window.len() >= self.config.rate_limit_per_minute as usize {
            return Err(AuthError::RateLimited);
        }
        window.push(now);
        Ok(())
    }

    /// Mint a one-shot ticket for `method`.
    pub fn issue(&self, caller: &Caller, method: &str) -> Result<String, AuthError> {
        self.check_policy(caller, method)?;
        self.check_rate(caller)?;

        let ticket_id = Uuid::new_v4().to_string();
        let mut tickets = self.tickets.lock().unwrap();
        tickets.retain(|_, t| t.issued_at.elapsed() < TICKET_TTL);
        tickets.insert(
            ticket_id.clone(),
            Ticket {
                method: method.to_string(),
                issued_at: Instant::now(),
            },
        );
        Ok(ticket_id)
    }

    /// Redeem a ticket for `method`. Consumes it: a second redemption fails.
    pub fn redeem(&self, ticket_id: &str, method: &str) -> Result<(), AuthError> {
        let mut tickets = self.tickets.lock().unwrap();
        match tickets.remove(ticket_id) {
            Some(ticket) if ticket.issued_at.elapsed() < TICKET_TTL && ticket.method == method => {
                Ok(())
            }
            Some(_) | None => Err(AuthError::BadTicket),
        }
    }
}
