//! Types shared between the dispatch server and the device bridge.

pub mod messages;
pub mod model;

pub use messages::*;
pub use model::*;
