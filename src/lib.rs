//! Gantry - launches per-user container instances on demand and routes to them
//!
//! This library provides a control plane that:
//! - Resolves application templates into per-launch specs for a user
//! - Runs them on local Docker, Docker Swarm or Kubernetes
//! - Tracks every instance through a small state machine
//! - Routes `/endpoint/<instance>/...` traffic to the running instance
//! - Cleans up after itself on every failure path

pub mod api;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod mapping;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod spec;
