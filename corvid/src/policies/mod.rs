//! Pluggable decision points of the driver: where to send a request, when
//! to retry it, how long to wait before reconnecting, and who to tell about
//! node state changes.

pub mod host_listener;
pub mod load_balancing;
pub mod reconnection;
pub mod retry;
