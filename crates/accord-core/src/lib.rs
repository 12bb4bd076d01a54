//! # accord-core
//!
//! Core library for accord - the agreement negotiation engine of a
//! decentralized edge-computing platform.
//!
//! This crate provides the domain model shared by the consumer agent
//! ("agbot") and the producer agent ("node"): policy documents and the
//! compatibility matcher, the bilateral agreement protocol with its
//! canonical terms serialization and signatures, the persisted agreement
//! lifecycle, and the embedded store.
//!
//! ## Features
//!
//! - **Policies**: declarative documents describing what a party will
//!   accept, with property constraints, version ranges, and protocol lists
//! - **Matching**: compatibility evaluation between producer and consumer
//!   policies
//! - **Protocol**: the proposal/reply/confirm/data/metering handshake with
//!   deterministic signed terms
//! - **Persistence**: typed accessors over an embedded SQLite store
//! - **Anchoring**: demarshaling of external agreement-witness events

#![warn(clippy::all)]

pub mod agreement;
pub mod anchor;
pub mod attributes;
pub mod config;
pub mod events;
pub mod persistence;
pub mod policy;
pub mod protocol;
pub mod reason;
pub mod service;
pub mod version;

pub use agreement::{Agreement, AgreementRole, AgreementState};
pub use policy::manager::PolicyManager;
pub use policy::Policy;
pub use protocol::engine::ProtocolEngine;
