//! HTTP layer: the git smart-HTTP transport plus read-only JSON views.
//!
//! Every git request is handed to the shared protocol state machine in
//! [`crate::protocol`]; this module only owns routing, request bodies and
//! the mapping of outcomes onto status codes.

pub mod archive;
pub mod handler;
pub mod index;
pub mod refs;
pub mod transport;
