//! `Armada` CLI Library
//!
//! Subcommands behind the `armada` binary:
//! - `plan`: wave plan for a batch of work items
//! - `run`: simulated execution through the worker pool and context cache

pub mod batch;
pub mod plan_cmd;
pub mod render;
pub mod run_cmd;
