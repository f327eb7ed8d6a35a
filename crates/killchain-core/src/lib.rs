//! `killchain-core` runs adversary-emulation kill chains one after another
//! against a Caldera-style control plane.
//!
//! # Architecture
//!
//! ```text
//! Config ──► resolver::resolve ──► Vec<AdversaryJob>
//!                                       │
//!                                       ▼
//!                                   Sequencer
//!                          ┌────────────┼─────────────┐
//!                          ▼            ▼             ▼
//!                 probe::wait_…   gate::AgentGate   lifecycle::OperationManager
//!                          └────────────┼─────────────┘
//!                                       ▼
//!                           client::ControlPlane (RestClient)
//! ```
//!
//! Every wait goes through a [`cancel::Clock`] and a [`cancel::CancelToken`],
//! so tests drive time by hand and a termination signal interrupts any loop.

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod probe;
pub mod resolver;
pub mod sequencer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::{CancelToken, Clock, SystemClock};
pub use client::{ControlPlane, Liveness, RestClient};
pub use config::Config;
pub use error::{KillchainError, Result};
pub use sequencer::Sequencer;
pub use types::{AdversaryJob, OperationState, SequenceOutcome, SequenceReport};
