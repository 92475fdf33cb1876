use crate::producer::ProducerId;

/// Why a [send] did not go through.
///
/// A send which loses the race against [`close`] fails with [`SendError::ProducerClosed`], which
/// is kept distinct from [`SendError::Dispatch`] so callers can tell a flow-controlled producer
/// which has gone away apart from a failure further down the pipeline.
///
/// [send]: crate::ProducerHandle::send
/// [`close`]: crate::ProducerHandle::close
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum SendError {
    #[error("Producer {0} is closed")]
    ProducerClosed(ProducerId),
    #[error("Broker has been stopped")]
    BrokerStopped,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Failure reported by a [`Dispatch`] collaborator when handing off an admitted message.
///
/// [`Dispatch`]: crate::Dispatch
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("Failed to dispatch message: {0}")]
pub struct DispatchError(pub String);

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum CloseError {
    /// The producer stays in [`Closing`], calling close again resumes the wait.
    ///
    /// [`Closing`]: crate::ProducerState::Closing
    #[error("Timed out after {timeout:?} closing producer {producer}, {in_flight} sends still in flight")]
    Timeout { producer: ProducerId, timeout: std::time::Duration, in_flight: usize },
}

/// Bookkeeping inconsistency: more bytes were removed from a destination than it holds. This is
/// only ever logged, usage is clamped to 0.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("Usage underflow on {destination}: tried to remove {requested} bytes with only {usage} in use")]
pub struct UsageUnderflow {
    pub destination: String,
    pub usage: u64,
    pub requested: u64,
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Invalid destination address {0:?}")]
    InvalidDestination(String),
    #[error("Invalid limits: low water mark {low} must be non-zero and at most high water mark {high}")]
    InvalidLimits { high: u64, low: u64 },
    #[error("Unknown destination {0}")]
    UnknownDestination(String),
    #[error("Broker has been stopped")]
    Stopped,
}
