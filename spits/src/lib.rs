//! Core building blocks for the SPITS runtime.
//!
//! SPITS runs a user-supplied job module (a shared object with a fixed C
//! ABI) across a fleet of worker hosts. A single job manager generates and
//! commits tasks; any number of task managers execute them. This crate
//! provides the pieces both sides share: the wire protocol and its framed
//! stream endpoint, the connection listener, the bounded task pool, the
//! dynamic-library bridge into the job module, the node-list loader, and
//! the optional performance sampler.

pub mod binary;
pub mod endpoint;
pub mod errors;
pub mod fleet;
pub mod listener;
pub mod messaging;
pub mod perf;
pub mod pool;

pub use crate::binary::JobBinary;
pub use crate::endpoint::Endpoint;
pub use crate::errors::{BridgeError, NetError};
pub use crate::fleet::Fleet;
pub use crate::listener::Listener;
pub use crate::pool::TaskPool;
