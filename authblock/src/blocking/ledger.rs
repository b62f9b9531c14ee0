//! Failure ledger and the block/evict decision
//!
//! The ledger keeps, per tenant and per dimension (user or IP), the sequence
//! of failure timestamps of every key. All access goes through one mutex so
//! that appending and checking the same key can never interleave.
//!
//! Expiry is evaluated lazily: a check that finds the most recent failure
//! outside the block window clears the sequence in place. Nothing else ever
//! removes failures, apart from an explicit [`AttemptLedger::unblock`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::tenant::TenantId;

/// Which principal a failure is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Counted per username
    User,
    /// Counted per effective client IP
    Ip,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Ip => write!(f, "ip"),
        }
    }
}

/// One failed login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    principal: String,
    timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Username or IP the failure was counted against
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// When the failure happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Failures of one key, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptSequence {
    records: Vec<FailureRecord>,
}

impl AttemptSequence {
    fn push(&mut self, principal: &str, timestamp: DateTime<Utc>) {
        self.records.push(FailureRecord {
            principal: principal.to_string(),
            timestamp,
        });
    }

    /// Number of failures held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the sequence holds no failure
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The most recent failure
    pub fn last(&self) -> Option<&FailureRecord> {
        self.records.last()
    }

    /// Timestamp of the most recent failure
    ///
    /// Computed as a maximum rather than taken from the tail so that it stays
    /// correct even if a clock stepped backwards between appends.
    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.records.iter().map(|r| r.timestamp).max()
    }

    /// Failures, oldest first
    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    fn clear(&mut self) {
        self.records.clear();
    }
}

/// Outcome of evaluating a sequence against the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Blocking is disabled for this dimension
    Disabled,
    /// No failures on record
    Clean,
    /// The most recent failure aged out; the sequence was cleared
    Evicted {
        /// How many failures were dropped
        cleared: usize,
    },
    /// Fewer failures than the threshold
    BelowThreshold {
        /// Failures on record
        attempts: usize,
    },
    /// Threshold reached within the block window
    Blocked {
        /// Failures on record
        attempts: usize,
    },
}

impl Verdict {
    /// Whether the key is currently blocked
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Evaluate a sequence, clearing it when its last failure is stale
///
/// A stale sequence is one whose most recent failure lies strictly before
/// `now - block_window`; only that failure is looked at, however old the
/// earlier ones are. A zero `max_attempts` disables the check entirely.
pub fn evaluate(
    sequence: Option<&mut AttemptSequence>,
    max_attempts: u32,
    block_window: Duration,
    now: DateTime<Utc>,
) -> Verdict {
    if max_attempts == 0 {
        return Verdict::Disabled;
    }
    let Some(sequence) = sequence else {
        return Verdict::Clean;
    };
    let Some(last) = sequence.last() else {
        return Verdict::Clean;
    };

    if last.timestamp < evict_boundary(now, block_window) {
        let cleared = sequence.len();
        sequence.clear();
        return Verdict::Evicted { cleared };
    }

    let attempts = sequence.len();
    if attempts >= max_attempts as usize {
        Verdict::Blocked { attempts }
    } else {
        Verdict::BelowThreshold { attempts }
    }
}

/// [`evaluate`] reduced to the blocked/not-blocked answer
pub fn check_and_evict(
    sequence: Option<&mut AttemptSequence>,
    max_attempts: u32,
    block_window: Duration,
    now: DateTime<Utc>,
) -> bool {
    evaluate(sequence, max_attempts, block_window, now).is_blocked()
}

fn evict_boundary(now: DateTime<Utc>, block_window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(block_window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A failure to append to the ledger
#[derive(Debug, Clone, Copy)]
pub struct FailedAttempt<'a> {
    /// Tenant owning the user's failures
    pub user_tenant: &'a TenantId,
    /// Username that failed to authenticate
    pub username: &'a str,
    /// Tenant the request arrived at
    pub ip_tenant: &'a TenantId,
    /// Effective client IP; `None` when the IP must not be tracked
    pub ip: Option<&'a str>,
}

/// Sequence lengths after an append (`None` when nothing was appended)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordedCounts {
    /// Failures of the user after the append
    pub user: Option<usize>,
    /// Failures of the IP after the append
    pub ip: Option<usize>,
}

type Partition = HashMap<String, AttemptSequence>;

#[derive(Debug, Default)]
struct LedgerState {
    users: HashMap<TenantId, Partition>,
    ips: HashMap<TenantId, Partition>,
}

impl LedgerState {
    fn partitions(&mut self, dimension: Dimension) -> &mut HashMap<TenantId, Partition> {
        match dimension {
            Dimension::User => &mut self.users,
            Dimension::Ip => &mut self.ips,
        }
    }

    fn sequence(
        &mut self,
        dimension: Dimension,
        tenant: &TenantId,
        key: &str,
    ) -> Option<&mut AttemptSequence> {
        self.partitions(dimension).get_mut(tenant)?.get_mut(key)
    }

    fn append(
        &mut self,
        dimension: Dimension,
        tenant: &TenantId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<usize> {
        if key.is_empty() {
            return None;
        }
        let sequence = self
            .partitions(dimension)
            .entry(tenant.clone())
            .or_default()
            .entry(key.to_string())
            .or_default();
        sequence.push(key, now);
        Some(sequence.len())
    }
}

/// Process-local, tenant-partitioned failure ledger
///
/// Partitions are created on the first failure of a tenant and live as long
/// as the ledger. Keys whose failures expired keep an empty sequence until
/// they are unblocked, so memory grows with the number of distinct keys ever
/// seen.
#[derive(Debug, Default)]
pub struct AttemptLedger {
    state: Mutex<LedgerState>,
}

impl AttemptLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // the state stays structurally valid even if a holder panicked
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a failure for the user and, if given, the IP
    ///
    /// Both appends happen under one lock acquisition. Empty usernames or IPs
    /// are ignored and create no entry.
    pub fn record_failure(&self, attempt: FailedAttempt<'_>, now: DateTime<Utc>) -> RecordedCounts {
        let mut state = self.lock();
        let user = state.append(Dimension::User, attempt.user_tenant, attempt.username, now);
        let ip = attempt
            .ip
            .and_then(|ip| state.append(Dimension::Ip, attempt.ip_tenant, ip, now));
        RecordedCounts { user, ip }
    }

    /// Evaluate `key` and evict it if stale
    ///
    /// This is a mutating query: a stale sequence is cleared as a side effect.
    pub fn evaluate(
        &self,
        dimension: Dimension,
        tenant: &TenantId,
        key: &str,
        max_attempts: u32,
        block_window: Duration,
        now: DateTime<Utc>,
    ) -> Verdict {
        let mut state = self.lock();
        evaluate(
            state.sequence(dimension, tenant, key),
            max_attempts,
            block_window,
            now,
        )
    }

    /// Whether `key` is blocked, evicting it if stale
    pub fn is_blocked(
        &self,
        dimension: Dimension,
        tenant: &TenantId,
        key: &str,
        max_attempts: u32,
        block_window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        self.evaluate(dimension, tenant, key, max_attempts, block_window, now)
            .is_blocked()
    }

    /// Keys of `tenant` holding at least `max_attempts` failures
    ///
    /// Returns `(key, last_attempt)` pairs, most recent offender first, ties
    /// ordered by key. The block window is not consulted: a key stays listed
    /// until a check evicts it or it is unblocked. A disabled dimension
    /// (`max_attempts == 0`) lists nothing.
    pub fn list_blocked(
        &self,
        dimension: Dimension,
        tenant: &TenantId,
        max_attempts: u32,
    ) -> Vec<(String, DateTime<Utc>)> {
        if max_attempts == 0 {
            return Vec::new();
        }
        let mut state = self.lock();
        let Some(partition) = state.partitions(dimension).get(tenant) else {
            return Vec::new();
        };

        let mut blocked: Vec<(String, DateTime<Utc>)> = partition
            .iter()
            .filter(|(_, sequence)| sequence.len() >= max_attempts as usize)
            .filter_map(|(key, sequence)| Some((key.clone(), sequence.last_attempt()?)))
            .collect();
        drop(state);

        blocked.sort_by(|(key_a, last_a), (key_b, last_b)| {
            last_b.cmp(last_a).then_with(|| key_a.cmp(key_b))
        });
        blocked
    }

    /// Drop every failure of `key`, returning whether it was tracked
    pub fn unblock(&self, dimension: Dimension, tenant: &TenantId, key: &str) -> bool {
        self.lock()
            .partitions(dimension)
            .get_mut(tenant)
            .is_some_and(|partition| partition.remove(key).is_some())
    }

    /// Failures currently on record for `key`, without evaluating expiry
    pub fn attempt_count(&self, dimension: Dimension, tenant: &TenantId, key: &str) -> usize {
        self.lock()
            .sequence(dimension, tenant, key)
            .map_or(0, |sequence| sequence.len())
    }

    /// Copy of the sequence of `key`, if tracked
    pub fn snapshot(
        &self,
        dimension: Dimension,
        tenant: &TenantId,
        key: &str,
    ) -> Option<AttemptSequence> {
        self.lock().sequence(dimension, tenant, key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_millis(100);

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + TimeDelta::milliseconds(ms)
    }

    fn tenant() -> TenantId {
        TenantId::new("main")
    }

    fn fail(ledger: &AttemptLedger, user: &str, ip: Option<&str>, now: DateTime<Utc>) -> RecordedCounts {
        let tenant = tenant();
        ledger.record_failure(
            FailedAttempt {
                user_tenant: &tenant,
                username: user,
                ip_tenant: &tenant,
                ip,
            },
            now,
        )
    }

    fn sequence_at(times: &[i64]) -> AttemptSequence {
        let mut sequence = AttemptSequence::default();
        for ms in times {
            sequence.push("k", at(*ms));
        }
        sequence
    }

    #[test]
    fn disabled_threshold_never_blocks() {
        let mut sequence = sequence_at(&[0, 1, 2, 3]);
        assert_eq!(evaluate(Some(&mut sequence), 0, WINDOW, at(5)), Verdict::Disabled);
        // nothing is evicted either
        assert_eq!(sequence.len(), 4);
    }

    #[test]
    fn absent_or_empty_sequence_is_clean() {
        assert_eq!(evaluate(None, 2, WINDOW, at(0)), Verdict::Clean);
        let mut empty = AttemptSequence::default();
        assert_eq!(evaluate(Some(&mut empty), 2, WINDOW, at(0)), Verdict::Clean);
    }

    #[test]
    fn stale_sequence_is_cleared_in_place() {
        let mut sequence = sequence_at(&[0, 10]);
        assert_eq!(
            evaluate(Some(&mut sequence), 2, WINDOW, at(111)),
            Verdict::Evicted { cleared: 2 }
        );
        assert!(sequence.is_empty());
    }

    #[test]
    fn boundary_is_exclusive() {
        // last failure exactly window-old is still inside the window
        let mut sequence = sequence_at(&[0, 0]);
        assert!(check_and_evict(Some(&mut sequence), 2, WINDOW, at(100)));
        assert!(!check_and_evict(Some(&mut sequence), 2, WINDOW, at(101)));
    }

    #[test]
    fn zero_window_always_evicts_after_time_moves() {
        let mut sequence = sequence_at(&[0, 0, 0]);
        assert!(check_and_evict(Some(&mut sequence), 1, Duration::ZERO, at(0)));
        assert!(!check_and_evict(Some(&mut sequence), 1, Duration::ZERO, at(1)));
        assert!(sequence.is_empty());
    }

    #[test]
    fn huge_window_never_evicts() {
        let mut sequence = sequence_at(&[0, 0]);
        assert!(check_and_evict(Some(&mut sequence), 2, Duration::MAX, at(1_000_000)));
    }

    #[test]
    fn only_the_most_recent_failure_keeps_history_alive() {
        let mut sequence = sequence_at(&[-10_000, -5_000, 50]);
        assert_eq!(
            evaluate(Some(&mut sequence), 3, WINDOW, at(100)),
            Verdict::Blocked { attempts: 3 }
        );
    }

    #[test]
    fn threshold_counts_all_retained_failures() {
        let ledger = AttemptLedger::new();
        fail(&ledger, "alice", None, at(0));
        assert!(!ledger.is_blocked(Dimension::User, &tenant(), "alice", 2, WINDOW, at(1)));
        fail(&ledger, "alice", None, at(2));
        assert!(ledger.is_blocked(Dimension::User, &tenant(), "alice", 2, WINDOW, at(3)));
        assert!(!ledger.is_blocked(Dimension::User, &tenant(), "bob", 2, WINDOW, at(3)));
    }

    #[test]
    fn recency_only_eviction_timeline() {
        let ledger = AttemptLedger::new();
        let blocked = |now| ledger.is_blocked(Dimension::User, &tenant(), "u", 2, WINDOW, now);

        fail(&ledger, "u", None, at(0));
        assert!(!blocked(at(60)));

        fail(&ledger, "u", None, at(101));
        assert!(blocked(at(146)));
        assert!(blocked(at(191)));
        assert!(!blocked(at(236)));
        // idempotent once evicted
        assert!(!blocked(at(237)));
        assert!(!blocked(at(500)));
        assert_eq!(ledger.attempt_count(Dimension::User, &tenant(), "u"), 0);
    }

    #[test]
    fn failure_after_expiry_starts_over_without_check() {
        let ledger = AttemptLedger::new();
        fail(&ledger, "u", None, at(0));
        fail(&ledger, "u", None, at(1));
        assert!(ledger.is_blocked(Dimension::User, &tenant(), "u", 2, WINDOW, at(2)));

        // no check in between: the stale entries are still counted and the
        // fresh failure keeps them alive
        fail(&ledger, "u", None, at(200));
        assert!(ledger.is_blocked(Dimension::User, &tenant(), "u", 2, WINDOW, at(201)));
    }

    #[test]
    fn empty_keys_create_no_entries() {
        let ledger = AttemptLedger::new();
        let counts = fail(&ledger, "", Some(""), at(0));
        assert_eq!(counts, RecordedCounts::default());
        assert!(ledger.list_blocked(Dimension::User, &tenant(), 1).is_empty());
        assert!(ledger.list_blocked(Dimension::Ip, &tenant(), 1).is_empty());
        assert!(!ledger.unblock(Dimension::User, &tenant(), ""));
    }

    #[test]
    fn record_reports_counts_per_dimension() {
        let ledger = AttemptLedger::new();
        assert_eq!(
            fail(&ledger, "u", Some("1.1.1.1"), at(0)),
            RecordedCounts {
                user: Some(1),
                ip: Some(1)
            }
        );
        assert_eq!(
            fail(&ledger, "v", Some("1.1.1.1"), at(1)),
            RecordedCounts {
                user: Some(1),
                ip: Some(2)
            }
        );
        assert_eq!(
            fail(&ledger, "u", None, at(2)),
            RecordedCounts {
                user: Some(2),
                ip: None
            }
        );
    }

    #[test]
    fn partitions_are_isolated_per_tenant() {
        let ledger = AttemptLedger::new();
        let a = TenantId::new("a");
        let b = TenantId::new("b");
        for _ in 0..3 {
            ledger.record_failure(
                FailedAttempt {
                    user_tenant: &a,
                    username: "u",
                    ip_tenant: &a,
                    ip: Some("1.1.1.1"),
                },
                at(0),
            );
        }
        assert!(ledger.is_blocked(Dimension::User, &a, "u", 3, WINDOW, at(1)));
        assert!(!ledger.is_blocked(Dimension::User, &b, "u", 3, WINDOW, at(1)));
        assert!(ledger.is_blocked(Dimension::Ip, &a, "1.1.1.1", 3, WINDOW, at(1)));
        assert!(!ledger.is_blocked(Dimension::Ip, &b, "1.1.1.1", 3, WINDOW, at(1)));
    }

    #[test]
    fn list_blocked_orders_most_recent_first() {
        let ledger = AttemptLedger::new();
        fail(&ledger, "old", None, at(0));
        fail(&ledger, "old", None, at(1));
        fail(&ledger, "new", None, at(5));
        fail(&ledger, "new", None, at(9));
        fail(&ledger, "single", None, at(20));
        fail(&ledger, "tie-b", None, at(7));
        fail(&ledger, "tie-b", None, at(7));
        fail(&ledger, "tie-a", None, at(7));
        fail(&ledger, "tie-a", None, at(7));

        let listed = ledger.list_blocked(Dimension::User, &tenant(), 2);
        let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["new", "tie-a", "tie-b", "old"]);
        assert_eq!(listed[0].1, at(9));
        assert_eq!(listed[3].1, at(1));
    }

    #[test]
    fn list_blocked_skips_evicted_and_disabled() {
        let ledger = AttemptLedger::new();
        fail(&ledger, "u", None, at(0));
        fail(&ledger, "u", None, at(0));
        assert_eq!(ledger.list_blocked(Dimension::User, &tenant(), 2).len(), 1);
        assert!(ledger.list_blocked(Dimension::User, &tenant(), 0).is_empty());

        assert!(!ledger.is_blocked(Dimension::User, &tenant(), "u", 2, WINDOW, at(500)));
        assert!(ledger.list_blocked(Dimension::User, &tenant(), 2).is_empty());
        assert!(ledger.list_blocked(Dimension::User, &TenantId::new("none"), 2).is_empty());
    }

    #[test]
    fn unblock_removes_whole_sequence_once() {
        let ledger = AttemptLedger::new();
        fail(&ledger, "u", Some("1.1.1.1"), at(0));
        fail(&ledger, "u", Some("1.1.1.1"), at(1));
        assert!(ledger.unblock(Dimension::User, &tenant(), "u"));
        assert!(!ledger.unblock(Dimension::User, &tenant(), "u"));
        assert!(ledger.snapshot(Dimension::User, &tenant(), "u").is_none());
        // the IP dimension is untouched
        assert_eq!(ledger.attempt_count(Dimension::Ip, &tenant(), "1.1.1.1"), 2);
    }

    #[test]
    fn evicted_key_stays_tracked_until_unblocked() {
        let ledger = AttemptLedger::new();
        fail(&ledger, "u", None, at(0));
        ledger.is_blocked(Dimension::User, &tenant(), "u", 1, WINDOW, at(500));
        let sequence = ledger.snapshot(Dimension::User, &tenant(), "u").unwrap();
        assert!(sequence.is_empty());
        assert!(ledger.unblock(Dimension::User, &tenant(), "u"));
    }

    #[test]
    fn snapshot_exposes_records_in_order() {
        let ledger = AttemptLedger::new();
        fail(&ledger, "u", None, at(3));
        fail(&ledger, "u", None, at(4));
        let sequence = ledger.snapshot(Dimension::User, &tenant(), "u").unwrap();
        let stamps: Vec<_> = sequence.records().iter().map(FailureRecord::timestamp).collect();
        assert_eq!(stamps, vec![at(3), at(4)]);
        assert_eq!(sequence.last().map(FailureRecord::principal), Some("u"));
        assert_eq!(sequence.last_attempt(), Some(at(4)));
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let ledger = Arc::new(AttemptLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        fail(&ledger, "u", Some("9.9.9.9"), at(0));
                        ledger.is_blocked(Dimension::User, &tenant(), "u", 5, WINDOW, at(1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.attempt_count(Dimension::User, &tenant(), "u"), 2000);
        assert_eq!(ledger.attempt_count(Dimension::Ip, &tenant(), "9.9.9.9"), 2000);
    }
}
