//! Multi-tenant WhatsApp messaging core: device sessions, quota
//! enforcement, per-device send throttling and the dispatch queue.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod qr;
pub mod queue;
pub mod quota;
pub mod rate_limit;
pub mod routes;
pub mod session;
pub mod state;
pub mod storage;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;
