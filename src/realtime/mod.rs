//! Push-event intake: transport collaborator, event merge, and the router
//! that ties channel subscriptions to the cache store.
//!
//! The transport delivers events at-least-once with no ordering guarantee.
//! Everything here is written to tolerate both: merges are idempotent,
//! inserts land at the order-correct position regardless of arrival order,
//! and an event racing a pending optimistic operation on the same entity is
//! buffered until that operation resolves.

mod merge;
mod router;
mod transport;

pub(crate) use merge::merge_event;
pub use router::{EventRouter, Subscription};
pub use transport::{EventKind, RealtimeEvent, RealtimeTransport, TransportHandle};
