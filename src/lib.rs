//! `mq-flow` is the produce-path admission control of a message broker: it throttles producers
//! once a destination holds more bytes than it is configured for, and guarantees that closing a
//! producer which is stuck on that throttle always completes instead of deadlocking.
//!
//! # Overview
//!
//! Every destination has a [`FlowControlGate`]. Before a message is handed to the broker's
//! [`Dispatch`] layer, its size is admitted by the gate:
//!
//! 1. If the destination is below its high water mark, the bytes are counted and the send goes
//!    through straight away.
//!
//! 2. Otherwise the send is queued up and suspended until enough bytes have been [removed] from
//!    the destination (by consumers acknowledging messages, for example). Suspended sends are
//!    released in FIFO order once usage drops below the destination's low water mark.
//!
//! 3. A suspended send can also be woken up by its producer being [closed], in which case it fails
//!    with [`SendError::ProducerClosed`], or by the broker [stopping], in which case it fails with
//!    [`SendError::BrokerStopped`]. Neither leaves anything behind on the destination.
//!
//! The following sends 1000 byte messages to a queue limited to 1024 bytes which nobody consumes
//! from. The third send blocks, until the producer is closed from another task:
//!
//! ```rust
//! # use mq_flow::*;
//! struct Blackhole;
//!
//! impl Dispatch for Blackhole {
//!     async fn dispatch(&self, _: &Destination, _: MessageId, _: Message) -> Result<(), DispatchError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = BrokerConfig::default().with_policy(DestinationPolicy::new(
//!         DestinationKind::Queue,
//!         "TINY_QUEUE",
//!         Some(Limits::high_water(1024)),
//!     ));
//!     let broker = Broker::start(config, Blackhole);
//!     let producer = broker.create_producer("queue://TINY_QUEUE").unwrap();
//!
//!     let sender = producer.clone();
//!     let handle = tokio::spawn(async move {
//!         loop {
//!             if let Err(e) = sender.send(Message::new(vec![0; 1000])).await {
//!                 break e;
//!             }
//!         }
//!     });
//!
//!     let gate = broker.destination("queue://TINY_QUEUE").unwrap();
//!     while gate.waiters() == 0 {
//!         tokio::task::yield_now().await;
//!     }
//!
//!     producer.close().await.unwrap();
//!     assert_eq!(handle.await.unwrap(), SendError::ProducerClosed(producer.id()));
//! }
//! ```
//!
//! # Closing a blocked producer
//!
//! The hard part is not blocking producers but letting go of them. A send suspended on a gate
//! can only be woken up by that gate, so [`CloseCoordinator`] reaches into it to cancel the
//! producer's waiters, and the gate re-checks the producer's state under its own lock before
//! letting a send wait. Both happen under the same per-destination lock, so no send can start
//! waiting after close swept the gate, and none can be missed by the sweep.
//!
//! Close then waits for sends which were already admitted to finish handing off their message,
//! optionally [bounded] by a timeout.
//!
//! # Testing
//!
//! Known edge cases are tested manually in each module. On top of this, [`loom`] is used to
//! explore the possible interleavings of a send blocking on a gate and a concurrent close (see the
//! `loom` feature), and [`proptest`] checks the gate's accounting and hysteresis against a
//! reference model over random sequences of operations (see the `proptest` feature):
//!
//! ```bash
//! cargo test --release --features loom
//! cargo test --release --features proptest
//! ```
//!
//! [removed]: FlowControlGate::remove_usage
//! [closed]: ProducerHandle::close
//! [stopping]: Broker::stop
//! [bounded]: ProducerHandle::close_within
//! [`loom`]: https://docs.rs/loom
//! [`proptest`]: https://docs.rs/proptest

mod broker;
mod close;
mod destination;
mod error;
mod gate;
mod macros;
mod producer;
mod sync;
mod usage;

pub use broker::*;
pub use close::*;
pub use destination::*;
pub use error::*;
pub use gate::*;
pub use producer::*;
pub use usage::*;
