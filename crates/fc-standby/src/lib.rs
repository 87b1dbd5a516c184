//! Warm-standby coordination for the message router.
//!
//! A pair of instances contends for a TTL lease in a coordination store;
//! the holder is PRIMARY and consumes, the peer idles as STANDBY. Role
//! transitions drive the traffic coordinator (load-balancer registration),
//! and a primary that loses its lease terminates on purpose.

mod error;
mod lease;
mod service;
mod traffic;

pub use error::{Result, StandbyError};
pub use lease::{LeaseStore, MemoryLeaseStore, RedisLeaseStore};
pub use service::{Role, StandbyConfig, StandbyService, StandbyStatus};
pub use traffic::{ElbStrategy, NoopStrategy, TrafficCoordinator, TrafficStrategy};
