//! Closed-form simulation of servers degrading under synthetic load: a
//! queueing model per backend, a load balancer, a pooled database and a
//! tick-driven engine with a fixed pool of load-generating threads.

pub mod algorithms;
pub mod backend;
pub mod balancer;
pub mod chaos;
pub mod cluster;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod events;
pub mod extensions;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod output;
pub mod profile;
pub mod target;
pub mod workers;
