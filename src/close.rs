use crate::error::CloseError;
use crate::gate::FlowControlGate;
use crate::macros::*;
use crate::producer::ProducerId;
use crate::sync::*;

/// Lifecycle of a producer. Transitions are linear: `Open → Closing → Closed`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerState {
    Open = 0,
    /// Close has been requested: no new send can be admitted or start waiting, but sends which
    /// were already admitted are still being handed off.
    Closing = 1,
    /// Every in-flight send has resolved.
    Closed = 2,
}

/// Coordinates closing a producer with the sends it has in flight.
///
/// # The close protocol
///
/// A send suspended on a [`FlowControlGate`] can only be woken up by the gate. Closing therefore
/// has to reach into the gate and cancel the producer's waiters, and a send must not be able to
/// start waiting once that sweep is done. Both sides rely on the gate lock for this:
///
/// ```text
///        close                                      send
///          │                                         │
///   state = Closing                         in_flight += 1
///          │                                         │
///   ┌──────▼───────────────┐              ┌──────────▼───────────┐
///   │ gate lock            │              │ gate lock            │
///   │  cancel own waiters  │              │  state == Open ?     │
///   └──────┬───────────────┘              │  admit or register   │
///          │                              └──────────┬───────────┘
///   wait in_flight == 0                         (suspend)
///          │                                         │
///   state = Closed                          in_flight -= 1
/// ```
///
/// Whichever of the two takes the gate lock first, the other one sees its effect: either the
/// send finds the producer closing and fails straight away, or it is already registered and the
/// sweep cancels it. No interleaving leaves a send waiting on a gate while close waits on it.
#[derive(Debug)]
pub struct CloseCoordinator {
    id: ProducerId,
    state: sync::atomic::AtomicU8,
    in_flight: sync::atomic::AtomicUsize,
    drained: Signal,
}

/// Marks a send as in flight for as long as it is alive.
#[must_use]
pub(crate) struct InFlight<'a>(&'a CloseCoordinator);

impl ProducerState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl CloseCoordinator {
    pub(crate) fn new(id: ProducerId) -> Self {
        Self {
            id,
            state: sync::atomic::AtomicU8::new(ProducerState::Open as u8),
            in_flight: sync::atomic::AtomicUsize::new(0),
            drained: Signal::new(),
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn state(&self) -> ProducerState {
        ProducerState::from_u8(self.state.load(sync::atomic::Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ProducerState::Open
    }

    /// Number of sends which have started but not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(sync::atomic::Ordering::Acquire)
    }

    pub(crate) fn enter(&self) -> InFlight<'_> {
        let in_flight = self.in_flight.fetch_add(1, sync::atomic::Ordering::AcqRel);
        trace!(producer = %self.id, in_flight = in_flight + 1, "Send in flight");
        InFlight(self)
    }

    /// Moves the producer to [`ProducerState::Closing`] if it was still open and returns the
    /// state it was in before.
    pub(crate) fn begin_close(&self) -> ProducerState {
        let res = self.state.compare_exchange(
            ProducerState::Open as u8,
            ProducerState::Closing as u8,
            sync::atomic::Ordering::AcqRel,
            sync::atomic::Ordering::Acquire,
        );

        match res {
            Ok(prev) | Err(prev) => ProducerState::from_u8(prev),
        }
    }

    fn finish_close(&self) {
        // Fails if a concurrent close got there first, which is fine
        let _ = self.state.compare_exchange(
            ProducerState::Closing as u8,
            ProducerState::Closed as u8,
            sync::atomic::Ordering::AcqRel,
            sync::atomic::Ordering::Acquire,
        );
    }

    async fn drained(&self) {
        loop {
            let listener = self.drained.listen();
            if self.in_flight() == 0 {
                break;
            }
            listener.wait().await;
        }
    }

    /// Runs the close protocol against the gate this producer sends to.
    ///
    /// Every send of this producer which is waiting on `gate` fails with [`ProducerClosed`], then
    /// this waits for the sends which were already admitted to finish, bounded by `timeout` if
    /// one is given. On timeout the producer is left [`Closing`] and close can be retried.
    /// Closing an already closed producer succeeds immediately.
    ///
    /// [`ProducerClosed`]: crate::SendError::ProducerClosed
    /// [`Closing`]: ProducerState::Closing
    #[cfg_attr(test, tracing::instrument(skip(self, gate), fields(producer = %self.id)))]
    pub async fn close(
        &self,
        gate: &FlowControlGate,
        timeout: Option<std::time::Duration>,
    ) -> Result<(), CloseError> {
        match self.begin_close() {
            ProducerState::Closed => {
                debug!("Producer already closed");
                return Ok(());
            }
            ProducerState::Open => {
                warn!(producer = %self.id, destination = %gate.destination(), "Closing producer");
            }
            ProducerState::Closing => {
                debug!("Producer already closing");
            }
        }

        // Also run on retries, there is no harm in sweeping twice
        gate.cancel_producer(self.id);

        match timeout {
            None => self.drained().await,
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.drained()).await.is_err() {
                    let in_flight = self.in_flight();
                    warn!(producer = %self.id, ?timeout, in_flight, "Timed out waiting for in-flight sends");
                    return Err(CloseError::Timeout { producer: self.id, timeout, in_flight });
                }
            }
        }

        self.finish_close();
        debug!("Producer closed");
        Ok(())
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let in_flight = self.0.in_flight.fetch_sub(1, sync::atomic::Ordering::AcqRel);
        debug_assert_ne!(in_flight, 0);

        if in_flight == 1 {
            trace!(producer = %self.0.id, "No sends left in flight");
            self.0.drained.notify_waiters();
        }
    }
}
