//! Credential pool with per-token core and search quotas.
//!
//! Selection is round-robin from just after the last dispatched token; a
//! token qualifies while its remaining quota of the requested class is at
//! least the class margin, and the call is charged to it under the same lock.
//! When none qualifies, callers sleep until the earliest reset across the pool
//! and retry. A pool whose every limit sits below the margin never recovers
//! and is reported as [`ApiError::NoHeadroom`].

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::io::config::CredentialConfig;
use crate::io::github::MetadataClient;

/// Environment variable holding comma-separated tokens.
pub const TOKENS_ENV: &str = "GITHUB_TOKENS";

const DEFAULT_CORE_LIMIT: u32 = 5000;
const DEFAULT_SEARCH_LIMIT: u32 = 30;

/// Independent upstream budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaClass {
    Core,
    Search,
}

impl QuotaClass {
    fn window(self) -> TimeDelta {
        match self {
            Self::Core => TimeDelta::hours(1),
            Self::Search => TimeDelta::minutes(1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Search => "search",
        }
    }
}

/// One rolling quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl Quota {
    pub fn full(limit: u32) -> Self {
        Self {
            remaining: limit,
            limit,
            reset_at: Utc::now(),
        }
    }

    /// Remaining calls as of `now`; a passed reset restores the full limit.
    pub fn available(&self, now: DateTime<Utc>) -> u32 {
        if now >= self.reset_at {
            self.limit
        } else {
            self.remaining
        }
    }

    fn consume(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        if now >= self.reset_at {
            self.remaining = self.limit;
            self.reset_at = now + window;
        }
        self.remaining = self.remaining.saturating_sub(1);
    }
}

/// Quotas reported by rate-limit introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub core: Quota,
    pub search: Quota,
}

/// A single API credential.
pub struct Token {
    label: String,
    secret: String,
    quotas: Mutex<RateLimitSnapshot>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token").field("label", &self.label).finish_non_exhaustive()
    }
}

impl Token {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
            quotas: Mutex::new(RateLimitSnapshot {
                core: Quota::full(DEFAULT_CORE_LIMIT),
                search: Quota::full(DEFAULT_SEARCH_LIMIT),
            }),
        }
    }

    /// Log-safe name.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn quota(&self, class: QuotaClass) -> Quota {
        let quotas = self.lock();
        match class {
            QuotaClass::Core => quotas.core,
            QuotaClass::Search => quotas.search,
        }
    }

    pub fn available(&self, class: QuotaClass, now: DateTime<Utc>) -> u32 {
        self.quota(class).available(now)
    }

    pub fn set_quota(&self, class: QuotaClass, quota: Quota) {
        let mut quotas = self.lock();
        *slot(&mut quotas, class) = quota;
    }

    pub fn update(&self, snapshot: RateLimitSnapshot) {
        *self.lock() = snapshot;
    }

    /// Charge one call against `class` if at least `margin` calls remain.
    pub fn reserve(&self, class: QuotaClass, margin: u32, now: DateTime<Utc>) -> bool {
        let mut quotas = self.lock();
        let quota = slot(&mut quotas, class);
        if quota.available(now) < margin {
            return false;
        }
        quota.consume(now, class.window());
        true
    }

    /// Record that the service refused a call until `reset_at`.
    pub fn exhaust(&self, class: QuotaClass, reset_at: DateTime<Utc>) {
        let mut quotas = self.lock();
        let quota = slot(&mut quotas, class);
        quota.remaining = 0;
        quota.reset_at = reset_at;
    }

    fn lock(&self) -> MutexGuard<'_, RateLimitSnapshot> {
        match self.quotas.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }
}

fn slot(quotas: &mut RateLimitSnapshot, class: QuotaClass) -> &mut Quota {
    match class {
        QuotaClass::Core => &mut quotas.core,
        QuotaClass::Search => &mut quotas.search,
    }
}

/// Round-robin state of one quota class.
#[derive(Debug)]
struct Limiter {
    margin: u32,
    last: Mutex<Option<usize>>,
}

impl Limiter {
    fn new(margin: u32) -> Self {
        Self {
            margin,
            last: Mutex::new(None),
        }
    }
}

#[derive(Debug)]
pub struct CredentialPool {
    tokens: Vec<Token>,
    core: Limiter,
    search: Limiter,
    retry_attempts: u32,
    retry_margin: Duration,
}

impl CredentialPool {
    /// An empty credential set is a configuration failure.
    pub fn new(secrets: Vec<String>, config: &CredentialConfig) -> Result<Self> {
        if secrets.is_empty() {
            return Err(anyhow!("no API credentials available"));
        }
        let tokens = secrets
            .into_iter()
            .enumerate()
            .map(|(index, secret)| Token::new(format!("token-{index}"), secret))
            .collect();
        Ok(Self {
            tokens,
            core: Limiter::new(config.core_margin),
            search: Limiter::new(config.search_margin),
            retry_attempts: config.retry_attempts.max(1),
            retry_margin: Duration::from_secs(1),
        })
    }

    /// Extra sleep after a reported reset time.
    pub fn with_retry_margin(mut self, margin: Duration) -> Self {
        self.retry_margin = margin;
        self
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    fn limiter(&self, class: QuotaClass) -> &Limiter {
        match class {
            QuotaClass::Core => &self.core,
            QuotaClass::Search => &self.search,
        }
    }

    /// Next qualifying token in round-robin order, without blocking. The
    /// returned token has already been charged one call.
    pub fn try_acquire(&self, class: QuotaClass) -> Option<&Token> {
        let limiter = self.limiter(class);
        let mut last = match limiter.last.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        let now = Utc::now();
        let start = last.map_or(0, |index| index + 1);
        let count = self.tokens.len();
        let chosen = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&index| self.tokens[index].reserve(class, limiter.margin, now))?;
        *last = Some(chosen);
        Some(&self.tokens[chosen])
    }

    /// Block until a token has headroom for `class`.
    pub fn acquire(&self, class: QuotaClass) -> Result<&Token, ApiError> {
        loop {
            if let Some(token) = self.try_acquire(class) {
                return Ok(token);
            }
            self.ensure_headroom(class)?;
            let wait = self.until_earliest_reset(class);
            warn!(
                class = class.as_str(),
                wait_secs = wait.as_secs(),
                "all credentials below margin, waiting for reset"
            );
            thread::sleep(wait);
        }
    }

    /// Fails when no token's full limit reaches the margin of `class`.
    pub fn ensure_headroom(&self, class: QuotaClass) -> Result<(), ApiError> {
        let margin = self.limiter(class).margin;
        if self
            .tokens
            .iter()
            .all(|token| token.quota(class).limit < margin)
        {
            return Err(ApiError::NoHeadroom {
                class: class.as_str(),
                margin,
            });
        }
        Ok(())
    }

    fn until_earliest_reset(&self, class: QuotaClass) -> Duration {
        let now = Utc::now();
        let earliest = self
            .tokens
            .iter()
            .map(|token| token.quota(class).reset_at)
            .min()
            .unwrap_or(now);
        until(earliest, now) + self.retry_margin
    }

    /// Route one API call through a token, retrying quota exhaustion.
    pub fn call<T>(
        &self,
        class: QuotaClass,
        mut request: impl FnMut(&Token) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut attempt = 1;
        loop {
            let token = self.acquire(class)?;
            match request(token) {
                Err(ApiError::RateLimited { reset_at }) => {
                    token.exhaust(class, reset_at);
                    if attempt >= self.retry_attempts {
                        warn!(token = token.label(), attempt, "rate limit retries exhausted");
                        return Err(ApiError::RateLimited { reset_at });
                    }
                    let wait = until(reset_at, Utc::now()) + self.retry_margin;
                    info!(
                        token = token.label(),
                        class = class.as_str(),
                        attempt,
                        wait_secs = wait.as_secs(),
                        "rate limited, sleeping until reset"
                    );
                    thread::sleep(wait);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Re-read every token's quotas from the service.
    pub fn refresh(&self, client: &dyn MetadataClient) {
        for token in &self.tokens {
            match client.rate_limit(token) {
                Ok(snapshot) => {
                    token.update(snapshot);
                    debug!(
                        token = token.label(),
                        core = snapshot.core.remaining,
                        search = snapshot.search.remaining,
                        "quota refreshed"
                    );
                }
                Err(err) => warn!(token = token.label(), error = %err, "quota refresh failed"),
            }
        }
    }
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Background quota refresher; stops when dropped.
pub struct RefreshHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("quota refresh thread panicked");
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Refresh quotas every `interval` until the handle is dropped.
pub fn spawn_refresh(
    pool: Arc<CredentialPool>,
    client: Arc<dyn MetadataClient>,
    interval: Duration,
) -> RefreshHandle {
    let (stop, stopped): (Sender<()>, Receiver<()>) = bounded(0);
    let thread = thread::spawn(move || {
        loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => pool.refresh(client.as_ref()),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("quota refresh stopped");
    });
    RefreshHandle {
        stop: Some(stop),
        thread: Some(thread),
    }
}

/// Read credentials from `--tokens-file` when given, else [`TOKENS_ENV`].
pub fn load_tokens(tokens_file: Option<&Path>) -> Result<Vec<String>> {
    match tokens_file {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read tokens file {}", path.display()))?;
            Ok(parse_tokens(&raw))
        }
        None => Ok(std::env::var(TOKENS_ENV)
            .map(|raw| parse_tokens(&raw))
            .unwrap_or_default()),
    }
}

/// Split on commas and newlines; blank entries and `#` comments are ignored.
pub fn parse_tokens(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|token| !token.is_empty() && !token.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(secrets: &[&str]) -> CredentialPool {
        CredentialPool::new(
            secrets.iter().map(|s| (*s).to_string()).collect(),
            &CredentialConfig::default(),
        )
        .expect("pool")
        .with_retry_margin(Duration::ZERO)
    }

    fn starved(limit: u32) -> Quota {
        Quota {
            remaining: 10,
            limit,
            reset_at: Utc::now() + TimeDelta::hours(1),
        }
    }

    #[test]
    fn empty_secret_set_is_rejected() {
        let err = CredentialPool::new(Vec::new(), &CredentialConfig::default()).expect_err("empty");
        assert!(err.to_string().contains("no API credentials"));
    }

    #[test]
    fn round_robin_across_qualifying_tokens() {
        let pool = pool(&["a", "b", "c"]);
        let labels: Vec<&str> = (0..4)
            .map(|_| pool.acquire(QuotaClass::Core).expect("headroom").label())
            .collect();
        assert_eq!(labels, vec!["token-0", "token-1", "token-2", "token-0"]);
    }

    #[test]
    fn classes_have_independent_cursors() {
        let pool = pool(&["a", "b"]);
        let next = |class| pool.acquire(class).expect("headroom").label();
        assert_eq!(next(QuotaClass::Core), "token-0");
        assert_eq!(next(QuotaClass::Search), "token-0");
        assert_eq!(next(QuotaClass::Core), "token-1");
    }

    #[test]
    fn reserve_counts_down_and_rolls_over() {
        let token = Token::new("t", "s");
        let now = Utc::now();
        token.set_quota(
            QuotaClass::Core,
            Quota {
                remaining: 3,
                limit: 5,
                reset_at: now + TimeDelta::hours(1),
            },
        );
        assert!(token.reserve(QuotaClass::Core, 0, Utc::now()));
        assert_eq!(token.quota(QuotaClass::Core).remaining, 2);
        assert!(!token.reserve(QuotaClass::Core, 3, Utc::now()));
        assert_eq!(token.quota(QuotaClass::Core).remaining, 2);

        token.set_quota(
            QuotaClass::Core,
            Quota {
                remaining: 0,
                limit: 5,
                reset_at: now - TimeDelta::seconds(1),
            },
        );
        assert_eq!(token.available(QuotaClass::Core, Utc::now()), 5);
        assert!(token.reserve(QuotaClass::Core, 0, Utc::now()));
        assert_eq!(token.quota(QuotaClass::Core).remaining, 4);
    }

    #[test]
    fn rate_limited_call_retries_then_succeeds() {
        let pool = pool(&["a"]);
        let mut calls = 0;
        let result = pool.call(QuotaClass::Core, |_| {
            calls += 1;
            if calls == 1 {
                Err(ApiError::RateLimited {
                    reset_at: Utc::now() - TimeDelta::seconds(1),
                })
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.expect("call"), 2);
    }

    #[test]
    fn rate_limit_propagates_after_bounded_attempts() {
        let pool = pool(&["a"]);
        let mut calls = 0;
        let result: Result<(), ApiError> = pool.call(QuotaClass::Search, |_| {
            calls += 1;
            Err(ApiError::RateLimited {
                reset_at: Utc::now() - TimeDelta::seconds(1),
            })
        });
        assert!(matches!(result, Err(ApiError::RateLimited { .. })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let pool = pool(&["a"]);
        let mut calls = 0;
        let result: Result<(), ApiError> = pool.call(QuotaClass::Core, |_| {
            calls += 1;
            Err(ApiError::NotFound("x".to_string()))
        });
        assert!(matches!(result, Err(ApiError::NotFound(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn starved_token_is_skipped() {
        let pool = pool(&["a", "b"]);
        pool.tokens()[0].set_quota(QuotaClass::Core, starved(5000));
        assert!(pool.try_acquire(QuotaClass::Core).is_some_and(|t| t.label() == "token-1"));
    }

    #[test]
    fn concurrent_acquires_never_overdraw_the_margin() {
        let pool = pool(&["a"]);
        pool.tokens()[0].set_quota(
            QuotaClass::Core,
            Quota {
                remaining: 204,
                limit: 5000,
                reset_at: Utc::now() + TimeDelta::hours(1),
            },
        );
        let granted = thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| pool.try_acquire(QuotaClass::Core).is_some()))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .filter(|granted| *granted)
                .count()
        });
        assert_eq!(granted, 5);
        assert_eq!(pool.tokens()[0].quota(QuotaClass::Core).remaining, 199);
    }

    #[test]
    fn limits_below_margin_fail_instead_of_waiting() {
        let pool = pool(&["a", "b"]);
        for token in pool.tokens() {
            token.set_quota(
                QuotaClass::Core,
                Quota {
                    remaining: 60,
                    limit: 60,
                    reset_at: Utc::now() - TimeDelta::seconds(5),
                },
            );
        }
        assert!(pool.try_acquire(QuotaClass::Core).is_none());
        let err = pool.acquire(QuotaClass::Core).expect_err("no headroom");
        assert!(matches!(err, ApiError::NoHeadroom { class: "core", margin: 200 }));
        assert!(pool.ensure_headroom(QuotaClass::Search).is_ok());

        let mut calls = 0;
        let result: Result<(), ApiError> = pool.call(QuotaClass::Core, |_| {
            calls += 1;
            Ok(())
        });
        assert!(matches!(result, Err(ApiError::NoHeadroom { .. })));
        assert_eq!(calls, 0);
    }

    #[test]
    fn one_token_with_headroom_keeps_the_pool_usable() {
        let pool = pool(&["a", "b"]);
        pool.tokens()[0].set_quota(
            QuotaClass::Core,
            Quota {
                remaining: 60,
                limit: 60,
                reset_at: Utc::now() - TimeDelta::seconds(5),
            },
        );
        assert!(pool.ensure_headroom(QuotaClass::Core).is_ok());
        assert_eq!(pool.acquire(QuotaClass::Core).expect("headroom").label(), "token-1");
    }

    #[test]
    fn parses_token_lists() {
        assert_eq!(
            parse_tokens("a, b\n# comment\n\nc,"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
