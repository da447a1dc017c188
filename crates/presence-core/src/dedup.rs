//! At-most-once-per-window attendance logging.
//!
//! Two tiers answer "was this identity logged within the window?": a session
//! map that lives as long as the process, and the durable ledger that
//! survives restarts. The session map is consulted first so a face seen on
//! every frame costs one ledger query per window, not one per frame.

use crate::types::{Decision, Identity, RecordId, SuppressReason};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Default minimum spacing between two logged events for one identity.
pub const DEFAULT_WINDOW_SECS: i64 = 3600;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("identity {0} is not enrolled")]
    UnknownIdentity(Identity),
    #[error("ledger storage: {0}")]
    Storage(String),
}

/// Durable attendance records, queried by identity and time range.
pub trait Ledger {
    /// Timestamps of `identity`'s records within `[from, to]`, inclusive.
    fn query_range(
        &self,
        identity: &Identity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, LedgerError>;

    fn insert(&self, identity: &Identity, at: DateTime<Utc>) -> Result<RecordId, LedgerError>;
}

impl<L: Ledger + ?Sized> Ledger for &L {
    fn query_range(
        &self,
        identity: &Identity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, LedgerError> {
        (**self).query_range(identity, from, to)
    }

    fn insert(&self, identity: &Identity, at: DateTime<Utc>) -> Result<RecordId, LedgerError> {
        (**self).insert(identity, at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    pub window: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::seconds(DEFAULT_WINDOW_SECS),
        }
    }
}

/// Result of [`DedupCoordinator::log_presence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Logged(RecordId),
    Suppressed(SuppressReason),
}

pub struct DedupCoordinator<L> {
    ledger: L,
    config: DedupConfig,
    /// Identity -> last logged time, as far as this process knows.
    session: HashMap<Identity, DateTime<Utc>>,
}

impl<L: Ledger> DedupCoordinator<L> {
    pub fn new(ledger: L, config: DedupConfig) -> Self {
        Self {
            ledger,
            config,
            session: HashMap::new(),
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Decide whether a sighting of `identity` at `now` should be logged.
    ///
    /// A session hit never touches the ledger. A ledger hit refreshes the
    /// session entry to the newest record found so later frames stay on the
    /// fast path. Several records inside one window are tolerated.
    pub fn should_log(&mut self, identity: &Identity, now: DateTime<Utc>) -> Result<Decision, LedgerError> {
        let window = self.config.window;

        if let Some(last) = self.session.get(identity) {
            if now.signed_duration_since(*last) < window {
                tracing::debug!(%identity, last = %last, "suppressed by session");
                return Ok(Decision::Suppress(SuppressReason::Session));
            }
        }

        // A window reaching past the representable range covers all history.
        let from = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let hits = self.ledger.query_range(identity, from, now)?;
        if let Some(latest) = hits.iter().max().copied() {
            if hits.len() > 1 {
                tracing::warn!(%identity, records = hits.len(), "multiple attendance records within one window");
            }
            tracing::debug!(%identity, latest = %latest, "suppressed by ledger");
            self.session.insert(identity.clone(), latest.min(now));
            return Ok(Decision::Suppress(SuppressReason::Ledger));
        }

        Ok(Decision::Proceed)
    }

    /// Note that a durable record for `identity` was written at `at`.
    pub fn record_logged(&mut self, identity: &Identity, at: DateTime<Utc>) {
        self.session.insert(identity.clone(), at);
    }

    /// Check, write and remember one sighting as a single step.
    ///
    /// The session entry is reserved before the ledger write and restored
    /// if the write fails, so a failed attempt never suppresses a retry.
    pub fn log_presence(&mut self, identity: &Identity, now: DateTime<Utc>) -> Result<LogOutcome, LedgerError> {
        if let Decision::Suppress(reason) = self.should_log(identity, now)? {
            return Ok(LogOutcome::Suppressed(reason));
        }

        let previous = self.session.insert(identity.clone(), now);
        match self.ledger.insert(identity, now) {
            Ok(record) => {
                tracing::debug!(%identity, record, at = %now, "ledger record written");
                Ok(LogOutcome::Logged(record))
            }
            Err(e) => {
                match previous {
                    Some(at) => {
                        self.session.insert(identity.clone(), at);
                    }
                    None => {
                        self.session.remove(identity);
                    }
                }
                tracing::warn!(%identity, error = %e, "attendance write failed; session entry rolled back");
                Err(e)
            }
        }
    }

    /// Forget everything learned this session, as a process restart would.
    pub fn clear_session(&mut self) {
        self.session.clear();
    }

    /// Last logged time this session knows for `identity`.
    pub fn session_entry(&self, identity: &Identity) -> Option<DateTime<Utc>> {
        self.session.get(identity).copied()
    }
}
