//! MirAIe wire conventions
//!
//! Device topics, the JSON payload codec and the control message envelope
//! shared by the session layer and the CLI.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
