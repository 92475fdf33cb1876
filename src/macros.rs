// Hot-path diagnostics are only compiled into test builds.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(test)]
        tracing::debug!($($arg)+)
    };
}
pub(crate) use crate::debug;

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(test)]
        tracing::trace!($($arg)+)
    };
}
pub(crate) use crate::trace;

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => {
        tracing::info!($($arg)+)
    };
}
pub(crate) use crate::info;

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {
        tracing::warn!($($arg)+)
    };
}
pub(crate) use crate::warn;

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => {
        tracing::error!($($arg)+)
    };
}
pub(crate) use crate::error;
