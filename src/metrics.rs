use std::{
    fmt,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

/// Session families with their own usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Orchestrated,
    Auxiliary,
}

impl SessionKind {
    fn label(&self) -> &'static str {
        match self {
            SessionKind::Orchestrated => "orchestrated",
            SessionKind::Auxiliary => "auxiliary",
        }
    }
}

#[derive(Debug, Default)]
struct SessionCounters {
    started: AtomicU64,
    running: AtomicI64,
    successful: AtomicU64,
    aborted: AtomicU64,
}

/// Usage counters of the broker. Every update is mirrored to the `metrics`
/// recorder; reading them back never touches the recorder.
#[derive(Debug, Default)]
pub struct UsageCounters {
    orchestrated: SessionCounters,
    auxiliary: SessionCounters,
    ping_started: AtomicU64,
    ping_succeeded: AtomicU64,
    ping_failed: AtomicU64,
    mailbox_rejected: AtomicU64,
}

/// Point-in-time copy of [`UsageCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub orchestrated_started: u64,
    pub orchestrated_running: i64,
    pub orchestrated_successful: u64,
    pub orchestrated_aborted: u64,
    pub auxiliary_started: u64,
    pub auxiliary_running: i64,
    pub auxiliary_successful: u64,
    pub auxiliary_aborted: u64,
    pub ping_started: u64,
    pub ping_succeeded: u64,
    pub ping_failed: u64,
    pub mailbox_rejected: u64,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn of(&self, kind: SessionKind) -> &SessionCounters {
        match kind {
            SessionKind::Orchestrated => &self.orchestrated,
            SessionKind::Auxiliary => &self.auxiliary,
        }
    }

    /// A session started; it also counts as running.
    pub fn started(&self, kind: SessionKind) {
        self.of(kind).started.fetch_add(1, Ordering::Relaxed);
        broker::session_started(kind.label());
        self.running(kind, 1);
    }

    pub fn running(&self, kind: SessionKind, delta: i64) {
        let now = self.of(kind).running.fetch_add(delta, Ordering::Relaxed) + delta;
        broker::set_running_sessions(kind.label(), now);
    }

    pub fn successful(&self, kind: SessionKind) {
        self.of(kind).successful.fetch_add(1, Ordering::Relaxed);
        broker::session_finished(kind.label(), "successful");
    }

    pub fn aborted(&self, kind: SessionKind) {
        self.of(kind).aborted.fetch_add(1, Ordering::Relaxed);
        broker::session_finished(kind.label(), "aborted");
    }

    pub fn ping_started(&self) {
        self.ping_started.fetch_add(1, Ordering::Relaxed);
        broker::ping("started");
    }

    pub fn ping_succeeded(&self) {
        self.ping_succeeded.fetch_add(1, Ordering::Relaxed);
        broker::ping("succeeded");
    }

    pub fn ping_failed(&self) {
        self.ping_failed.fetch_add(1, Ordering::Relaxed);
        broker::ping("failed");
    }

    pub fn mailbox_rejected(&self, events: usize) {
        self.mailbox_rejected
            .fetch_add(events as u64, Ordering::Relaxed);
        broker::mailbox_rejected(events);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        UsageSnapshot {
            orchestrated_started: load(&self.orchestrated.started),
            orchestrated_running: self.orchestrated.running.load(Ordering::Relaxed),
            orchestrated_successful: load(&self.orchestrated.successful),
            orchestrated_aborted: load(&self.orchestrated.aborted),
            auxiliary_started: load(&self.auxiliary.started),
            auxiliary_running: self.auxiliary.running.load(Ordering::Relaxed),
            auxiliary_successful: load(&self.auxiliary.successful),
            auxiliary_aborted: load(&self.auxiliary.aborted),
            ping_started: load(&self.ping_started),
            ping_succeeded: load(&self.ping_succeeded),
            ping_failed: load(&self.ping_failed),
            mailbox_rejected: load(&self.mailbox_rejected),
        }
    }
}

impl fmt::Display for UsageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "orchestrated {}/{}/{}/{} auxiliary {}/{}/{}/{} (started/running/ok/aborted) ping {}/{}/{} rejected {}",
            self.orchestrated_started,
            self.orchestrated_running,
            self.orchestrated_successful,
            self.orchestrated_aborted,
            self.auxiliary_started,
            self.auxiliary_running,
            self.auxiliary_successful,
            self.auxiliary_aborted,
            self.ping_started,
            self.ping_succeeded,
            self.ping_failed,
            self.mailbox_rejected
        )
    }
}

pub mod broker {
    /// Increment when a session is created
    pub fn session_started(kind: &str) {
        metrics::counter!(
            "sipbroker_sessions_started_total",
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Increment when a session ends, `outcome` is `successful` or `aborted`
    pub fn session_finished(kind: &str, outcome: &str) {
        metrics::counter!(
            "sipbroker_sessions_finished_total",
            "kind" => kind.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
    }

    /// Set the current number of running sessions
    pub fn set_running_sessions(kind: &str, count: i64) {
        metrics::gauge!(
            "sipbroker_sessions_running",
            "kind" => kind.to_string()
        )
        .set(count as f64);
    }

    pub fn ping(stage: &str) {
        metrics::counter!(
            "sipbroker_ping_total",
            "stage" => stage.to_string()
        )
        .increment(1);
    }

    /// Events refused because the worker pool was saturated
    pub fn mailbox_rejected(events: usize) {
        metrics::counter!("sipbroker_mailbox_rejected_total").increment(events as u64);
    }
}
