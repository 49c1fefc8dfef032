//! Connected-node registry, tool routing, and the WebSocket endpoint nodes
//! use to register capabilities and serve tool requests.

pub mod registry;
pub mod router;
pub mod ws;
