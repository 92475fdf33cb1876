use crate::close::{CloseCoordinator, ProducerState};
use crate::destination::Destination;
use crate::error::{CloseError, DispatchError, SendError};
use crate::gate::FlowControlGate;
use crate::macros::*;
use crate::sync::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(u64);

/// Identifies a message by the producer which sent it and its position in that producer's
/// sequence of sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub producer: ProducerId,
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    payload: Vec<u8>,
}

/// Returned once a message has been admitted and handed off to the [`Dispatch`] layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub message_id: MessageId,
    /// Bytes counted against the destination for this message.
    pub size: u64,
}

/// The layer admitted messages are handed to for persistence and delivery.
///
/// Bytes are counted against the destination _before_ `dispatch` is called. Whoever later
/// dequeues, acknowledges or expires the message is responsible for [removing] them again.
///
/// [removing]: FlowControlGate::remove_usage
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        destination: &Destination,
        id: MessageId,
        message: Message,
    ) -> impl std::future::Future<Output = Result<(), DispatchError>> + Send;
}

#[derive(Clone, Debug, Default)]
pub struct ProducerConfig {
    /// Upper bound on how long [`ProducerHandle::close`] waits for in-flight sends. `None`
    /// waits for as long as it takes.
    pub close_timeout: Option<std::time::Duration>,
}

/// A single producer sending to a single destination.
///
/// Handles are cheap to [`Clone`] and every clone refers to the same producer: closing one
/// closes them all. This is what allows a producer to be closed from another task while one of
/// its sends is stuck waiting on [flow control].
///
/// [flow control]: FlowControlGate
pub struct ProducerHandle<D: Dispatch> {
    coordinator: sync::Arc<CloseCoordinator>,
    gate: sync::Arc<FlowControlGate>,
    dispatch: sync::Arc<D>,
    sequence: sync::Arc<sync::atomic::AtomicU64>,
    config: ProducerConfig,
}

impl ProducerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProducerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "producer-{}", self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.producer, self.sequence)
    }
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self { payload: payload.into() }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Bytes this message counts for against its destination.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

impl<D: Dispatch> Clone for ProducerHandle<D> {
    fn clone(&self) -> Self {
        Self {
            coordinator: sync::Arc::clone(&self.coordinator),
            gate: sync::Arc::clone(&self.gate),
            dispatch: sync::Arc::clone(&self.dispatch),
            sequence: sync::Arc::clone(&self.sequence),
            config: self.config.clone(),
        }
    }
}

impl<D: Dispatch> std::fmt::Debug for ProducerHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("id", &self.coordinator.id())
            .field("destination", self.gate.destination())
            .field("state", &self.coordinator.state())
            .field("in_flight", &self.coordinator.in_flight())
            .finish()
    }
}

impl<D: Dispatch> ProducerHandle<D> {
    pub fn new(
        id: ProducerId,
        gate: sync::Arc<FlowControlGate>,
        dispatch: sync::Arc<D>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            coordinator: sync::Arc::new(CloseCoordinator::new(id)),
            gate,
            dispatch,
            sequence: sync::Arc::new(sync::atomic::AtomicU64::new(0)),
            config,
        }
    }

    pub fn id(&self) -> ProducerId {
        self.coordinator.id()
    }

    pub fn state(&self) -> ProducerState {
        self.coordinator.state()
    }

    pub fn destination(&self) -> &Destination {
        self.gate.destination()
    }

    pub(crate) fn coordinator(&self) -> &sync::Arc<CloseCoordinator> {
        &self.coordinator
    }

    pub(crate) fn gate(&self) -> &sync::Arc<FlowControlGate> {
        &self.gate
    }

    /// Sends a message to this producer's destination, waiting for as long as the destination
    /// is flow controlled.
    ///
    /// Fails with [`SendError::ProducerClosed`] if the producer is closed, or starts closing while
    /// this send is waiting. Fails with [`SendError::BrokerStopped`] if the broker stops first.
    /// Neither failure leaves anything behind on the destination.
    #[cfg_attr(test, tracing::instrument(skip(self, message), fields(producer = %self.id(), size = message.size())))]
    pub async fn send(&self, message: Message) -> Result<Ack, SendError> {
        if !self.coordinator.is_open() {
            debug!("Send on closed producer");
            return Err(SendError::ProducerClosed(self.id()));
        }

        let _in_flight = self.coordinator.enter();
        let size = message.size();

        self.gate.acquire(&self.coordinator, size).await?;

        let sequence = self.sequence.fetch_add(1, sync::atomic::Ordering::AcqRel);
        let message_id = MessageId { producer: self.id(), sequence };
        debug!(%message_id, "Dispatching message");

        match self.dispatch.dispatch(self.gate.destination(), message_id, message).await {
            Ok(()) => Ok(Ack { message_id, size }),
            Err(e) => {
                // Nothing was enqueued, give the bytes back
                warn!(%message_id, error = %e, "Failed to dispatch admitted message");
                self.gate.remove_usage(size);
                Err(SendError::Dispatch(e))
            }
        }
    }

    /// Closes the producer, bounded by [`ProducerConfig::close_timeout`]. See
    /// [`close_within`](Self::close_within).
    pub async fn close(&self) -> Result<(), CloseError> {
        self.coordinator.close(&self.gate, self.config.close_timeout).await
    }

    /// Closes the producer: sends waiting on flow control fail with [`SendError::ProducerClosed`]
    /// and sends already admitted are given up to `timeout` to finish. On
    /// [`CloseError::Timeout`], the producer stays closing and close may be called again.
    pub async fn close_within(&self, timeout: std::time::Duration) -> Result<(), CloseError> {
        self.coordinator.close(&self.gate, Some(timeout)).await
    }
}
