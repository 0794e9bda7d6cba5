//! Offline-first cache and sync core for a personal finance tracker.
//!
//! A [`session::Session`] wires the components together: the persistence
//! grant, the cache policy router, the network monitor, push subscriptions,
//! the sync coordinator and the bundle update coordinator. The `ledgersync`
//! binary is a thin CLI over this API.

pub mod cache;
pub mod config;
pub mod event;
pub mod fetch;
pub mod logging;
pub mod network;
pub mod persistence;
pub mod realtime;
pub mod remote;
pub mod session;
pub mod sync;
pub mod update;
