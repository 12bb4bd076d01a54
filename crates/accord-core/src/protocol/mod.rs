//! The bilateral agreement protocol.
//!
//! One protocol instance exists per agreement. The engine builds,
//! validates, signs, and verifies messages; transport (the directory
//! mailbox, sealed per recipient) is injected by the caller.

pub mod canonical;
pub mod engine;
pub mod message;
pub mod signing;

/// Name of the protocol this crate speaks.
pub const PROTOCOL_NAME: &str = "accord-basic";

/// Highest protocol version this crate speaks.
///
/// Version 1 (which carried the consumer's anchor address in the initial
/// proposal) is decommissioned; version 2 negotiates the anchor after the
/// reply instead.
pub const PROTOCOL_CURRENT_VERSION: u32 = 2;
