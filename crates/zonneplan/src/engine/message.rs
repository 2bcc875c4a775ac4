//! Messages between the engine and integrations.
//!
//! - `FromIntegrationMessage`: discovery and state changes, integration to engine
//! - `ToIntegrationMessage`: commands, engine to integration

use tokio::sync::oneshot;

use crate::entity::Command;
use crate::entity::EntityState;

/// Outcome of a command, rendered for the caller.
pub type CommandReply = oneshot::Sender<Result<(), String>>;

#[derive(Debug)]
pub enum FromIntegrationMessage {
    /// An entity was set up. Its state follows in a `StateChanged`.
    EntityDiscovered {
        entity_id: String,
        integration_name: String,
    },

    StateChanged { state: EntityState },
}

#[derive(Debug)]
pub enum ToIntegrationMessage {
    Command {
        entity_id: String,
        command: Command,
        reply: CommandReply,
    },
}
