//! Orchestration core for Stepwise.
//!
//! This crate holds the execution engine (expression resolver, condition
//! evaluator, step executors, orchestrator state machine) and the "ports"
//! (store and collaborator traits) that the infrastructure layer implements.
//! It depends only on `stepwise-types` -- never on `stepwise-infra` or any
//! database/HTTP crate; side effects go through traits.

pub mod approval;
pub mod condition;
pub mod context;
pub mod definitions;
pub mod expression;
pub mod functions;
pub mod orchestrator;
pub mod repository;
pub mod step;
pub mod validation;
