//! Registry address list with round-robin failover and isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

/// Consecutive failures before an address is isolated.
pub const ISOLATION_THRESHOLD: u32 = 3;

#[derive(Debug, Default)]
struct AddressHealth {
    consecutive_failures: u32,
    isolated_until: Option<Instant>,
}

/// Hands out registry addresses in round-robin order.
///
/// A failing call moves the cursor past the dead address so the next call
/// targets a different one. Isolated addresses are skipped until their
/// isolation expires, unless every address is isolated.
#[derive(Debug)]
pub struct AddressManager {
    addresses: Vec<String>,
    cursor: AtomicUsize,
    health: Mutex<Vec<AddressHealth>>,
    isolation: Duration,
}

impl AddressManager {
    pub fn new(addresses: Vec<String>, isolation: Duration) -> Self {
        let addresses: Vec<String> = addresses
            .into_iter()
            .map(|a| a.trim_end_matches('/').to_string())
            .collect();
        let health = addresses.iter().map(|_| AddressHealth::default()).collect();
        Self {
            addresses,
            cursor: AtomicUsize::new(0),
            health: Mutex::new(health),
            isolation,
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// The address the next call should use.
    pub fn current(&self) -> Option<&str> {
        if self.addresses.is_empty() {
            return None;
        }
        let start = self.cursor.load(Ordering::Acquire);
        let now = Instant::now();
        let health = self.health.lock();
        for offset in 0..self.addresses.len() {
            let idx = (start + offset) % self.addresses.len();
            let isolated = health[idx].isolated_until.is_some_and(|until| until > now);
            if !isolated {
                return Some(&self.addresses[idx]);
            }
        }
        // everything is isolated; keep trying in order
        Some(&self.addresses[start % self.addresses.len()])
    }

    fn index_of(&self, address: &str) -> Option<usize> {
        self.addresses.iter().position(|a| a == address)
    }

    pub fn record_success(&self, address: &str) {
        let Some(idx) = self.index_of(address) else {
            return;
        };
        let mut health = self.health.lock();
        let entry = &mut health[idx];
        if entry.isolated_until.take().is_some() {
            info!(address = %address, "registry address recovered");
        }
        entry.consecutive_failures = 0;
    }

    /// Mark `address` as failed and advance past it.
    pub fn record_failure(&self, address: &str) {
        let Some(idx) = self.index_of(address) else {
            return;
        };
        {
            let mut health = self.health.lock();
            let entry = &mut health[idx];
            entry.consecutive_failures += 1;
            let now = Instant::now();
            // an expired isolation counts as probation: the next failure isolates again
            let isolated = entry.isolated_until.is_some_and(|until| until > now);
            if entry.consecutive_failures >= ISOLATION_THRESHOLD && !isolated {
                warn!(
                    address = %address,
                    failures = entry.consecutive_failures,
                    isolation_ms = self.isolation.as_millis() as u64,
                    "isolating registry address"
                );
                entry.isolated_until = Some(now + self.isolation);
            }
        }
        let next = (idx + 1) % self.addresses.len();
        // only advance if nobody else already moved the cursor off this address
        let _ = self.cursor.compare_exchange(
            idx,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.addresses.len() > 1 {
            info!(from = %address, to = %self.addresses[next], "registry address failover");
        }
    }

    pub fn is_isolated(&self, address: &str) -> bool {
        let Some(idx) = self.index_of(address) else {
            return false;
        };
        self.health.lock()[idx]
            .isolated_until
            .is_some_and(|until| until > Instant::now())
    }
}
