use crate::error::UsageUnderflow;
use crate::macros::*;
use crate::sync::*;

/// Broker-wide state shared by every destination: how many bytes are held across all of them,
/// and whether the broker is still running.
///
/// A [`SystemUsage`] is created when a broker starts and [stopped] when it shuts down. It is
/// injected into each [`DestinationUsageTracker`] rather than living in a global.
///
/// [stopped]: Self::stop
#[derive(Debug)]
pub struct SystemUsage {
    bytes: sync::atomic::AtomicU64,
    stopped: sync::atomic::AtomicBool,
}

/// Counts the bytes currently enqueued on a single destination.
///
/// The tracker itself is not synchronized: it lives behind the per-destination lock of its
/// [`FlowControlGate`] so that usage is never observed halfway through an update.
///
/// [`FlowControlGate`]: crate::FlowControlGate
#[derive(Debug)]
pub struct DestinationUsageTracker {
    destination: String,
    bytes: u64,
    system: sync::Arc<SystemUsage>,
}

impl SystemUsage {
    pub fn new() -> Self {
        Self { bytes: sync::atomic::AtomicU64::new(0), stopped: sync::atomic::AtomicBool::new(false) }
    }

    /// Total bytes held across every destination.
    pub fn usage(&self) -> u64 {
        self.bytes.load(sync::atomic::Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(sync::atomic::Ordering::Acquire)
    }

    /// Returns `true` if this call is the one which stopped the broker.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, sync::atomic::Ordering::AcqRel)
    }

    // Saturates like the per-destination trackers, so the total never wraps around.
    fn charge(&self, bytes: u64) {
        let _ = self.bytes.fetch_update(sync::atomic::Ordering::AcqRel, sync::atomic::Ordering::Acquire, |total| {
            Some(total.saturating_add(bytes))
        });
    }

    // Once saturated, the total can hold less than the destinations released to it.
    fn release(&self, bytes: u64) {
        let _ = self.bytes.fetch_update(sync::atomic::Ordering::AcqRel, sync::atomic::Ordering::Acquire, |total| {
            Some(total.saturating_sub(bytes))
        });
    }
}

impl Default for SystemUsage {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationUsageTracker {
    pub fn new(destination: impl Into<String>, system: sync::Arc<SystemUsage>) -> Self {
        Self { destination: destination.into(), bytes: 0, system }
    }

    pub fn usage(&self) -> u64 {
        self.bytes
    }

    /// Adds `bytes` to the destination and returns the new total.
    pub fn add_usage(&mut self, bytes: u64) -> u64 {
        let bytes = bytes.min(u64::MAX - self.bytes);
        self.bytes += bytes;
        self.system.charge(bytes);

        trace!(destination = %self.destination, bytes, usage = self.bytes, "Added usage");
        self.bytes
    }

    /// Removes `bytes` from the destination and returns the new total. Usage is floored at 0: an
    /// attempt to remove more than is held is reported as a [`UsageUnderflow`] in the logs.
    pub fn remove_usage(&mut self, bytes: u64) -> u64 {
        match self.bytes.checked_sub(bytes) {
            Some(remaining) => {
                self.system.release(bytes);
                self.bytes = remaining;
            }
            None => {
                let underflow =
                    UsageUnderflow { destination: self.destination.clone(), usage: self.bytes, requested: bytes };
                error!(%underflow, "Clamping destination usage to 0");

                self.system.release(self.bytes);
                self.bytes = 0;
            }
        }

        trace!(destination = %self.destination, bytes, usage = self.bytes, "Removed usage");
        self.bytes
    }
}
