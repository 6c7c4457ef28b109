//! Shared domain types for Stepwise.
//!
//! Defines the canonical representation of workflow definitions, execution
//! instances, and approval requests. These JSON shapes are the wire contract
//! for stored workflows and must round-trip losslessly through persistence.

pub mod approval;
pub mod condition;
pub mod error;
pub mod instance;
pub mod workflow;
