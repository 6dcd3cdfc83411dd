//! Request counters for both ends of a channel.
//!
//! Local atomics track inflight/total/error counts; the same events are
//! mirrored to the `metrics` facade so a host that installs a recorder gets
//! them for free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, gauge, histogram};
use once_cell::sync::Lazy;

static SERVER_INFLIGHT: AtomicU64 = AtomicU64::new(0);
static PROXY_INFLIGHT: AtomicU64 = AtomicU64::new(0);
static SERVER_TOTAL: AtomicU64 = AtomicU64::new(0);
static PROXY_TOTAL: AtomicU64 = AtomicU64::new(0);
static SERVER_ERRORS: AtomicU64 = AtomicU64::new(0);
static PROXY_ERRORS: AtomicU64 = AtomicU64::new(0);

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!("peerlink_requests_total", "Requests handled or issued");
    describe_counter!("peerlink_errors_total", "Requests that ended in an error");
    describe_histogram!("peerlink_request_seconds", "Request latency in seconds");
});

/// Tracks one side's request traffic.
#[derive(Debug, Clone, Copy)]
pub struct MetricsHandle {
    role: &'static str,
}

impl MetricsHandle {
    pub fn server() -> Self {
        Lazy::force(&DESCRIBED);
        Self { role: "server" }
    }

    pub fn proxy() -> Self {
        Lazy::force(&DESCRIBED);
        Self { role: "proxy" }
    }

    fn counters(&self) -> (&'static AtomicU64, &'static AtomicU64, &'static AtomicU64) {
        match self.role {
            "server" => (&SERVER_INFLIGHT, &SERVER_TOTAL, &SERVER_ERRORS),
            _ => (&PROXY_INFLIGHT, &PROXY_TOTAL, &PROXY_ERRORS),
        }
    }

    /// Mark a request as started; pair with [`MetricsHandle::finish`].
    pub fn start(&self) -> Instant {
        let (inflight, total, _) = self.counters();
        let now_inflight = inflight.fetch_add(1, Ordering::SeqCst) + 1;
        total.fetch_add(1, Ordering::SeqCst);
        counter!("peerlink_requests_total", "role" => self.role).increment(1);
        gauge!("peerlink_inflight", "role" => self.role).set(now_inflight as f64);
        Instant::now()
    }

    pub fn finish(&self, started: Instant, ok: bool) {
        let (inflight, _, errors) = self.counters();
        let now_inflight = inflight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("peerlink_inflight", "role" => self.role).set(now_inflight as f64);
        if !ok {
            errors.fetch_add(1, Ordering::SeqCst);
            counter!("peerlink_errors_total", "role" => self.role).increment(1);
        }
        histogram!("peerlink_request_seconds", "role" => self.role)
            .record(started.elapsed().as_secs_f64());
    }

    pub fn total(&self) -> u64 {
        self.counters().1.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.counters().2.load(Ordering::SeqCst)
    }

    pub fn inflight(&self) -> u64 {
        self.counters().0.load(Ordering::SeqCst)
    }
}
