//! Shared wire and domain types for the skiff turn controller.
//!
//! These types cross the boundary between the controller and its
//! collaborators (model client, tool scheduler, checkpoint store) and are
//! serializable because checkpoint blobs embed them.

mod events;
mod models;
mod tools;

pub use events::FinishReason;
pub use events::StreamEvent;
pub use models::ClientMessage;
pub use models::Part;
pub use models::QueryPayload;
pub use models::Role;
pub use tools::ToolCallRequest;
pub use tools::ToolCallStatus;
