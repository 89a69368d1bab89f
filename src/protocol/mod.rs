//! RFC 1035 message types and the wire codec.

pub mod deserialise;
pub mod serialise;
pub mod wire_types;
