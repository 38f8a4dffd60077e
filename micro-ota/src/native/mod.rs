//! Implementations for hosts with an OS network stack

pub mod log;
pub mod tcp;
