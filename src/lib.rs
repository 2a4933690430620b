//! throttlepool - multi-dimensional throttling for crawl workers.
//!
//! Creates a virtual pool of permissions for resources whose access must
//! be throttled in number, rate of use, and byte rate, all at once:
//!
//! - how many connections may be open against a resource
//! - how often a fetch may start on a connection
//! - how fast bytes may be read from an open stream
//!
//! Limits are expressed per user-named **bin** (hostnames, service
//! identifiers); a single operation can name several bins and is then
//! constrained by their intersection. Bins live inside named **throttle
//! groups**, each a self-consistent throttling environment with a
//! replaceable [`ThrottleSpec`], and groups are organized per group type
//! under a [`Throttler`].
//!
//! Callers walk the handle chain: a [`ConnectionThrottler`] grants
//! connection slots, yielding a [`FetchThrottler`] per connection, which
//! paces fetch starts and yields a [`StreamThrottler`] per document,
//! which paces block reads. Releases go in reverse order. All blocking
//! happens on per-bin waiters, and destroying a group releases its
//! waiters promptly: acquisition then reports shutting-down through
//! `None` handles, `false` permissions, or the `u32::MAX` quota
//! sentinel, never through an error.

mod bins;
mod error;
mod group;
mod handles;
mod registry;
mod spec;
mod throttler;

pub use error::{RegistryError, ThrottleError, ThrottleResult};
pub use handles::{ConnectionThrottler, FetchThrottler, StreamThrottler};
pub use registry::{InProcessRegistry, ServiceRegistry, SERVICE_TYPE_PREFIX};
pub use spec::{StaticThrottleSpec, ThrottleSpec};
pub use throttler::Throttler;
