//! Botworld Client Library
//!
//! Client-side connection layer for watching a bot simulation world: a
//! WebTransport backend for remote worlds, an in-process sandbox backend, a
//! reconnecting controller and the world state it keeps up to date.

pub mod backend;
pub mod config;
pub mod controller;
pub mod ctrl;
pub mod metrics;
pub mod net;
pub mod store;
pub mod world;
