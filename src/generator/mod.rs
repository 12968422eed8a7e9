//! Driving generator programs through the line protocol.
pub mod interpreter;
pub mod session;
pub mod suite;
pub mod transport;
