//! A recursion-assisting DNS relay.
//!
//! relayed answers queries from a local hosts table and a bounded
//! in-memory cache, and forwards everything else to a single upstream
//! resolver, correlating the asynchronous replies back to the clients
//! that asked.  Names in the hosts table mapped to `0.0.0.0` are
//! pollution-shielded: they always answer `NXDOMAIN`.

pub mod cache;
pub mod hosts;
pub mod net_util;
pub mod protocol;
pub mod relay;
pub mod settings;
