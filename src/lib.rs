//! Prefork - a supervisor for a pool of single-threaded HTTP worker processes
//!
//! This library provides a pre-forking server that:
//! - Binds one listening socket and shares it with every worker process
//! - Serves many connections per worker on a cooperative event loop
//! - Bounds concurrent connections per worker so excess load waits in the backlog
//! - Restarts crashed workers under a rolling-window restart budget
//! - Replaces workers one at a time on reload without dropping capacity
//! - Drains in-flight requests on graceful shutdown within a grace period

pub mod admin;
pub mod config;
pub mod control;
pub mod error;
pub mod handler;
pub mod listener;
pub mod policy;
pub mod pool;
pub mod process;
pub mod supervisor;
pub mod worker;
