//! Feedwatch - A feed polling and change notification engine
//!
//! This crate polls many remote RSS/Atom feeds on a schedule with conditional
//! requests, keeps the last parsed state of each feed in a persistent cache,
//! and publishes an event on a topic bus for every entry that newly appears.

pub mod bus;
pub mod cache;
pub mod config;
pub mod diff;
pub mod dispatcher;
pub mod fetcher;
pub mod parser;
pub mod pipeline;
pub mod poller;
pub mod routes;
