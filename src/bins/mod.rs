//! Bin primitives: the atomic rate and quota units.
//!
//! Each bin is a miniature monitor: a mutex guarding its counters next
//! to a [`tokio::sync::Notify`] hosting its waiters. The mutex is never
//! held across an await; waiters re-check their grant condition under
//! the lock on every wakeup. Three kinds enforce the three quotas:
//!
//! - [`ConnectionBin`]: concurrent open connections (counter only,
//!   never waits)
//! - [`FetchBin`]: minimum interval between fetch starts
//! - [`ThrottleBin`]: minimum time per byte read from open streams

mod connection;
mod fetch;
mod throttle;

pub(crate) use connection::ConnectionBin;
pub(crate) use fetch::FetchBin;
pub(crate) use throttle::ThrottleBin;
