use crate::destination::{Destination, DestinationKind, Limits};
use crate::error::{BrokerError, CloseError};
use crate::gate::{AdmissionResult, FlowControlGate};
use crate::macros::*;
use crate::producer::{Dispatch, ProducerConfig, ProducerHandle, ProducerId};
use crate::sync::*;
use crate::usage::SystemUsage;

/// Flow control settings for the destinations whose name matches `pattern`.
///
/// Patterns are made of `.`-separated segments: `*` matches exactly one segment and `>` matches
/// every remaining segment, so `orders.>` covers `orders.eu` as well as `orders.eu.retail`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationPolicy {
    pub kind: DestinationKind,
    pub pattern: String,
    pub limits: Option<Limits>,
}

#[derive(Clone, Debug, Default)]
pub struct BrokerConfig {
    /// Limits for destinations no policy matches. `None` leaves them unlimited.
    pub default_limits: Option<Limits>,
    /// Checked in order, the first match wins.
    pub policies: Vec<DestinationPolicy>,
    pub producer: ProducerConfig,
}

/// Owns the destinations of a broker, their flow control gates and the producers sending to
/// them.
///
/// Destinations are created on first use, with their [`Limits`] resolved from the
/// [`BrokerConfig`]. Stopping the broker fails every send still waiting on flow control with
/// [`SendError::BrokerStopped`](crate::SendError::BrokerStopped).
pub struct Broker<D: Dispatch> {
    config: BrokerConfig,
    system: sync::Arc<SystemUsage>,
    dispatch: sync::Arc<D>,
    gates: sync::Mutex<std::collections::HashMap<String, sync::Arc<FlowControlGate>>>,
    producers: sync::Mutex<Vec<ProducerHandle<D>>>,
    next_producer: sync::atomic::AtomicU64,
}

impl DestinationPolicy {
    pub fn new(kind: DestinationKind, pattern: impl Into<String>, limits: Option<Limits>) -> Self {
        Self { kind, pattern: pattern.into(), limits }
    }

    pub fn matches(&self, destination: &Destination) -> bool {
        self.kind == destination.kind() && pattern_matches(&self.pattern, destination.name())
    }
}

impl BrokerConfig {
    pub fn with_default_limits(mut self, limits: Limits) -> Self {
        self.default_limits = Some(limits);
        self
    }

    pub fn with_policy(mut self, policy: DestinationPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_close_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.producer.close_timeout = Some(timeout);
        self
    }

    pub fn limits_for(&self, destination: &Destination) -> Option<Limits> {
        self.policies
            .iter()
            .find(|policy| policy.matches(destination))
            .map_or(self.default_limits, |policy| policy.limits)
    }
}

impl<D: Dispatch> Broker<D> {
    /// Starts a broker handing admitted messages to `dispatch`.
    pub fn start(config: BrokerConfig, dispatch: D) -> Self {
        info!(policies = config.policies.len(), "Starting broker");
        Self {
            config,
            system: sync::Arc::new(SystemUsage::new()),
            dispatch: sync::Arc::new(dispatch),
            gates: sync::Mutex::new(Default::default()),
            producers: sync::Mutex::new(Vec::default()),
            next_producer: sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.system.is_stopped()
    }

    /// Total bytes held across every destination.
    pub fn usage(&self) -> u64 {
        self.system.usage()
    }

    /// Returns the gate for `address`, creating the destination if this is the first time it is
    /// used.
    pub fn destination(&self, address: &str) -> Result<sync::Arc<FlowControlGate>, BrokerError> {
        let destination = Destination::parse(address)?;
        let key = destination.address();

        let mut gates = lock(&self.gates);
        if let Some(gate) = gates.get(&key) {
            return Ok(sync::Arc::clone(gate));
        }

        if self.system.is_stopped() {
            return Err(BrokerError::Stopped);
        }

        let limits = self.config.limits_for(&destination);
        debug!(%destination, ?limits, "Creating destination");

        let gate = sync::Arc::new(FlowControlGate::new(
            destination.with_limits_opt(limits),
            sync::Arc::clone(&self.system),
        ));
        gates.insert(key, sync::Arc::clone(&gate));
        Ok(gate)
    }

    fn existing(&self, address: &str) -> Result<sync::Arc<FlowControlGate>, BrokerError> {
        let key = Destination::parse(address)?.address();
        lock(&self.gates).get(&key).cloned().ok_or(BrokerError::UnknownDestination(key))
    }

    /// Creates a new producer sending to `address`.
    pub fn create_producer(&self, address: &str) -> Result<ProducerHandle<D>, BrokerError> {
        let gate = self.destination(address)?;
        let id = ProducerId::new(self.next_producer.fetch_add(1, sync::atomic::Ordering::AcqRel));
        let producer =
            ProducerHandle::new(id, gate, sync::Arc::clone(&self.dispatch), self.config.producer.clone());

        let mut producers = lock(&self.producers);
        if self.system.is_stopped() {
            return Err(BrokerError::Stopped);
        }

        // Closed producers have nothing left to coordinate with, and neither do producers whose
        // every handle outside the registry has been dropped: no send can still be running.
        producers.retain(|producer| {
            producer.state() != crate::ProducerState::Closed && sync::Arc::strong_count(producer.coordinator()) > 1
        });
        producers.push(producer.clone());

        debug!(%id, destination = address, "Created producer");
        Ok(producer)
    }

    /// Non-suspending admission of `size` bytes on an existing destination.
    pub fn admit(&self, address: &str, size: u64) -> Result<AdmissionResult, BrokerError> {
        // Admission only ever fails once the broker has stopped
        self.existing(address)?.admit(size).map_err(|_| BrokerError::Stopped)
    }

    pub fn add_usage(&self, address: &str, bytes: u64) -> Result<u64, BrokerError> {
        Ok(self.existing(address)?.add_usage(bytes))
    }

    pub fn remove_usage(&self, address: &str, bytes: u64) -> Result<u64, BrokerError> {
        Ok(self.existing(address)?.remove_usage(bytes))
    }

    /// Stops the broker. Every send waiting on flow control fails with
    /// [`SendError::BrokerStopped`](crate::SendError::BrokerStopped), as does every admission from then on.
    pub fn stop(&self) {
        if !self.system.stop() {
            return;
        }

        let gates: Vec<_> = lock(&self.gates).values().cloned().collect();
        let cancelled: usize = gates.iter().map(|gate| gate.shutdown()).sum();

        warn!(destinations = gates.len(), cancelled, "Broker stopped");
    }

    /// Stops the broker then closes every producer still in use, concurrently. Returns the errors
    /// of the producers which could not be closed in time.
    pub async fn shutdown(&self) -> Vec<CloseError> {
        self.stop();

        let producers = std::mem::take(&mut *lock(&self.producers));
        let closes = producers.iter().map(|producer| producer.close());

        futures::future::join_all(closes).await.into_iter().filter_map(Result::err).collect()
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    let mut names = name.split('.');
    for segment in pattern.split('.') {
        match segment {
            ">" => return names.next().is_some(),
            "*" => {
                if names.next().is_none() {
                    return false;
                }
            }
            literal => {
                if names.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    names.next().is_none()
}

#[cfg(all(test, not(feature = "loom")))]
mod test {
    use super::*;
    use crate::common::*;
    use crate::error::SendError;
    use crate::producer::Message;

    #[rstest::fixture]
    fn config() -> BrokerConfig {
        BrokerConfig::default()
            .with_policy(DestinationPolicy::new(DestinationKind::Queue, "TINY_QUEUE", Some(Limits::high_water(1024))))
            .with_policy(DestinationPolicy::new(DestinationKind::Queue, "orders.>", Some(Limits::high_water(1 << 20))))
            .with_policy(DestinationPolicy::new(DestinationKind::Queue, "orders.audit", None))
            .with_default_limits(Limits::high_water(1 << 16))
    }

    #[rstest::fixture]
    fn broker(config: BrokerConfig) -> Broker<NullDispatch> {
        Broker::start(config, NullDispatch)
    }

    #[rstest::rstest]
    #[case("orders", "orders", true)]
    #[case("orders", "orders.eu", false)]
    #[case("orders.*", "orders.eu", true)]
    #[case("orders.*", "orders.eu.retail", false)]
    #[case("orders.>", "orders.eu.retail", true)]
    #[case("orders.>", "orders", false)]
    #[case("*.eu", "orders.eu", true)]
    #[case(">", "anything.at.all", true)]
    fn wildcard_patterns(#[case] pattern: &str, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(pattern_matches(pattern, name), expected, "{pattern} ~ {name}");
    }

    #[rstest::rstest]
    #[case("queue://TINY_QUEUE", Some(Limits::high_water(1024)))]
    #[case("TINY_QUEUE", Some(Limits::high_water(1024)))]
    #[case("queue://orders.eu", Some(Limits::high_water(1 << 20)))]
    // First match wins
    #[case("queue://orders.audit", Some(Limits::high_water(1 << 20)))]
    #[case("topic://TINY_QUEUE", Some(Limits::high_water(1 << 16)))]
    fn limits_resolve_from_policies(config: BrokerConfig, #[case] address: &str, #[case] expected: Option<Limits>) {
        let destination = Destination::parse(address).expect("Invalid address");
        assert_eq!(config.limits_for(&destination), expected);
    }

    #[rstest::rstest]
    fn destinations_are_shared(broker: Broker<NullDispatch>) {
        let a = broker.destination("queue://TINY_QUEUE").expect("Failed to create destination");
        let b = broker.destination("TINY_QUEUE").expect("Failed to fetch destination");
        assert!(sync::Arc::ptr_eq(&a, &b));
        assert_eq!(a.destination().limits(), Some(Limits::high_water(1024)));

        assert_matches::assert_matches!(broker.destination("tcp://TINY_QUEUE"), Err(BrokerError::InvalidDestination(_)));
    }

    #[rstest::rstest]
    fn usage_routes_by_address(#[allow(unused)] log_stdout: (), broker: Broker<NullDispatch>) {
        assert_eq!(broker.add_usage("queue://TINY_QUEUE", 10), Err(BrokerError::UnknownDestination("queue://TINY_QUEUE".to_string())));

        broker.destination("queue://TINY_QUEUE").expect("Failed to create destination");
        broker.destination("topic://prices").expect("Failed to create destination");

        assert_eq!(broker.admit("queue://TINY_QUEUE", 1000), Ok(AdmissionResult::Admitted));
        assert_eq!(broker.admit("queue://TINY_QUEUE", 1000), Ok(AdmissionResult::Admitted));
        assert_eq!(broker.admit("queue://TINY_QUEUE", 1000), Ok(AdmissionResult::ShouldBlock));
        assert_eq!(broker.add_usage("topic://prices", 500), Ok(500));
        assert_eq!(broker.usage(), 2500);

        assert_eq!(broker.remove_usage("queue://TINY_QUEUE", 2000), Ok(0));
        assert_eq!(broker.admit("queue://TINY_QUEUE", 1000), Ok(AdmissionResult::Admitted));
        assert_eq!(broker.usage(), 1500);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn dropped_producers_are_released(#[allow(unused)] log_stdout: (), broker: Broker<NullDispatch>) {
        let gate = broker.destination("queue://TINY_QUEUE").expect("Failed to create destination");

        for _ in 0..3 {
            let producer = broker.create_producer("queue://TINY_QUEUE").expect("Failed to create producer");
            producer.send(Message::new(vec![0; 10])).await.expect("Failed to send");
        }
        let kept = broker.create_producer("queue://TINY_QUEUE").expect("Failed to create producer");

        // Held by the destination map, this test, and the two handles of the live producer
        assert_eq!(lock(&broker.producers).len(), 1);
        assert_eq!(sync::Arc::strong_count(&gate), 4);

        let closed = broker.create_producer("queue://TINY_QUEUE").expect("Failed to create producer");
        assert_eq!(closed.close().await, Ok(()));
        broker.create_producer("queue://TINY_QUEUE").expect("Failed to create producer");

        let producers = lock(&broker.producers);
        assert_eq!(producers.len(), 2);
        assert!(producers.iter().any(|producer| producer.id() == kept.id()));
        assert!(producers.iter().all(|producer| producer.id() != closed.id()));
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn stop_fails_blocked_sends(#[allow(unused)] log_stdout: (), broker: Broker<NullDispatch>) {
        let producer = broker.create_producer("queue://TINY_QUEUE").expect("Failed to create producer");
        broker.add_usage("queue://TINY_QUEUE", 2000).expect("Unknown destination");

        let sender = producer.clone();
        let send = tokio::spawn(async move { sender.send(Message::new(vec![0; 100])).await });
        while producer.gate().waiters() == 0 {
            tokio::task::yield_now().await;
        }

        broker.stop();
        assert!(broker.is_stopped());
        assert_eq!(send.await.expect("Send task panicked"), Err(SendError::BrokerStopped));
        assert_eq!(producer.send(Message::new(vec![0; 1])).await, Err(SendError::BrokerStopped));
        assert_eq!(broker.admit("queue://TINY_QUEUE", 1), Err(BrokerError::Stopped));
        assert_matches::assert_matches!(broker.create_producer("queue://TINY_QUEUE"), Err(BrokerError::Stopped));
        assert_matches::assert_matches!(broker.destination("queue://NEW"), Err(BrokerError::Stopped));

        // Producers can still be closed cleanly afterwards
        assert_eq!(producer.close().await, Ok(()));
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn shutdown_closes_producers(#[allow(unused)] log_stdout: (), broker: Broker<NullDispatch>) {
        let producers: Vec<_> = (0..3)
            .map(|_| broker.create_producer("queue://orders.eu").expect("Failed to create producer"))
            .collect();
        let ids: std::collections::HashSet<_> = producers.iter().map(|p| p.id()).collect();
        assert_eq!(ids.len(), 3);

        for producer in &producers {
            producer.send(Message::new(vec![0; 10])).await.expect("Failed to send");
        }

        assert!(broker.shutdown().await.is_empty());
        for producer in &producers {
            assert_eq!(producer.state(), crate::ProducerState::Closed);
        }
        assert_eq!(broker.usage(), 30);
    }
}
