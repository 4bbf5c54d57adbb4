//! Resume lineage: which resume tokens this broker issued, and when.
//!
//! A lineage starts at a fresh handshake and is carried across resumes. Each
//! issued token owns one entry; resuming consumes it, since resume tokens are
//! single-use. Entries for disconnected sessions are idle and age out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use adbx_core::crypto::{ct_eq, ResumeToken};
use adbx_core::identity::CallerIdentity;
use adbx_core::wire::RESUME_TOKEN_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lineage {
    /// When the first, secret-authenticated session of this lineage began.
    pub created_at: Instant,
    pub last_active: Instant,
    pub identity: Option<CallerIdentity>,
    /// True while a connection holds the token.
    pub live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageLookup {
    Resumed(Lineage),
    Expired,
    Unknown,
}

#[derive(Clone)]
pub struct LineageRegistry {
    entries: Arc<DashMap<[u8; RESUME_TOKEN_LEN], Lineage>>,
    idle_ttl: Duration,
    absolute_ttl: Duration,
    max_idle: usize,
}

impl LineageRegistry {
    pub fn new(idle_ttl: Duration, absolute_ttl: Duration, max_idle: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            idle_ttl,
            absolute_ttl,
            max_idle,
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    pub fn absolute_ttl(&self) -> Duration {
        self.absolute_ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a newly issued token as live.
    pub fn issue(&self, token: &ResumeToken, created_at: Instant, identity: Option<CallerIdentity>, now: Instant) {
        self.entries.insert(
            *token.as_bytes(),
            Lineage { created_at, last_active: now, identity, live: true },
        );
    }

    /// Consume the entry for `presented`. Every entry is compared in constant
    /// time; the map's hashed lookup is not used for the match.
    pub fn take(&self, presented: &[u8; RESUME_TOKEN_LEN], now: Instant) -> LineageLookup {
        let key = self
            .entries
            .iter()
            .map(|e| *e.key())
            .fold(None, |found, key| if ct_eq(&key, presented) { Some(key) } else { found });
        let Some(key) = key else {
            return LineageLookup::Unknown;
        };
        match self.entries.remove(&key) {
            Some((_, lineage)) if self.is_fresh(&lineage, now) => LineageLookup::Resumed(lineage),
            Some(_) => LineageLookup::Expired,
            // Another handshake consumed it first.
            None => LineageLookup::Unknown,
        }
    }

    /// Note activity on a live token.
    pub fn touch(&self, token: &ResumeToken, now: Instant) {
        if let Some(mut entry) = self.entries.get_mut(token.as_bytes()) {
            entry.last_active = now;
        }
    }

    /// The session holding `token` disconnected.
    pub fn release(&self, token: &ResumeToken, now: Instant) {
        if let Some(mut entry) = self.entries.get_mut(token.as_bytes()) {
            entry.last_active = now;
            entry.live = false;
        }
    }

    /// Time left before the lineage started at `created_at` hits the absolute TTL.
    pub fn remaining(&self, created_at: Instant, now: Instant) -> Duration {
        self.absolute_ttl.saturating_sub(now.saturating_duration_since(created_at))
    }

    fn is_fresh(&self, lineage: &Lineage, now: Instant) -> bool {
        now.saturating_duration_since(lineage.last_active) <= self.idle_ttl
            && now.saturating_duration_since(lineage.created_at) <= self.absolute_ttl
    }

    /// Drop expired idle entries, then the oldest idle ones above the cap.
    /// Returns how many were dropped.
    pub fn reap(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, l| l.live || self.is_fresh(l, now));

        let mut idle: Vec<([u8; RESUME_TOKEN_LEN], Instant)> = self
            .entries
            .iter()
            .filter(|e| !e.value().live)
            .map(|e| (*e.key(), e.value().last_active))
            .collect();
        if idle.len() > self.max_idle {
            idle.sort_by_key(|(_, last_active)| *last_active);
            let excess = idle.len() - self.max_idle;
            for (key, _) in idle.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }

        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            tracing::debug!(dropped, remaining = self.entries.len(), "reaped resume lineages");
        }
        dropped
    }
}
