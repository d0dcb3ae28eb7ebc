//! Route handlers

pub mod executions;
pub mod health;
