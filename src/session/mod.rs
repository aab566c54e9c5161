//! Browser session registry.
//!
//! The relay is single-tenant: [`SessionHub`] accepts at most one session at
//! a time. A session is represented everywhere else by a cheap, cloneable
//! [`SessionHandle`] that producers use to queue outbound status envelopes.

mod error;
mod handle;
mod hub;

pub use error::SessionError;
pub use handle::{OUTBOUND_QUEUE_CAPACITY, SessionHandle};
pub use hub::{SessionHub, SessionInfo};
