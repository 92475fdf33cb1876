use crate::error::BrokerError;

const QUEUE_PREFIX: &str = "queue://";
const TOPIC_PREFIX: &str = "topic://";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// Byte thresholds controlling when a [`FlowControlGate`] blocks and reopens.
///
/// Producers start blocking once usage reaches `high_water` and only resume once usage has
/// dropped _below_ `low_water`. Keeping the two apart avoids the gate toggling on every single
/// acknowledgement.
///
/// [`FlowControlGate`]: crate::FlowControlGate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    high_water: u64,
    low_water: u64,
}

/// A named, addressable target for messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    kind: DestinationKind,
    name: String,
    limits: Option<Limits>,
}

impl DestinationKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Queue => QUEUE_PREFIX,
            Self::Topic => TOPIC_PREFIX,
        }
    }
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Topic => write!(f, "topic"),
        }
    }
}

impl Limits {
    /// Both water marks must be non-zero: a gate only reopens once usage drops _below_
    /// `low_water`, which usage never does for a low water mark of 0.
    pub fn new(high_water: u64, low_water: u64) -> Result<Self, BrokerError> {
        if low_water == 0 || low_water > high_water {
            return Err(BrokerError::InvalidLimits { high: high_water, low: low_water });
        }
        Ok(Self { high_water, low_water })
    }

    /// A limit which reopens as soon as usage drops below `bytes` again.
    ///
    /// Meant for limits known at compile time, ie: `const TINY: Limits = Limits::high_water(1024)`.
    /// Use [`Limits::new`] for limits coming from configuration.
    ///
    /// # Panics
    ///
    /// If `bytes` is 0, which fails the build when evaluated in a const context.
    pub const fn high_water(bytes: u64) -> Self {
        assert!(bytes > 0, "Tried to create a flow control limit of 0 bytes");
        Self { high_water: bytes, low_water: bytes }
    }

    pub const fn high(&self) -> u64 {
        self.high_water
    }

    pub const fn low(&self) -> u64 {
        self.low_water
    }
}

impl Destination {
    pub fn new(kind: DestinationKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into(), limits: None }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, name)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, name)
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub(crate) fn with_limits_opt(mut self, limits: Option<Limits>) -> Self {
        self.limits = limits;
        self
    }

    /// Parses a destination address such as `queue://ORDERS` or `topic://prices.eu`. Addresses
    /// without a scheme are treated as queues.
    pub fn parse(address: &str) -> Result<Self, BrokerError> {
        let (kind, name) = if let Some(name) = address.strip_prefix(QUEUE_PREFIX) {
            (DestinationKind::Queue, name)
        } else if let Some(name) = address.strip_prefix(TOPIC_PREFIX) {
            (DestinationKind::Topic, name)
        } else if address.contains("://") {
            return Err(BrokerError::InvalidDestination(address.to_string()));
        } else {
            (DestinationKind::Queue, address)
        };

        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(BrokerError::InvalidDestination(address.to_string()));
        }

        Ok(Self::new(kind, name))
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` if the destination is not flow controlled.
    pub fn limits(&self) -> Option<Limits> {
        self.limits
    }

    /// The canonical address of this destination, ie: `queue://NAME`.
    pub fn address(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.name)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.name)
    }
}

impl std::str::FromStr for Destination {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
