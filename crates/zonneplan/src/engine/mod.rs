mod engine;
mod integration;
mod message;
pub mod state;

pub use engine::CommandError;
pub use engine::Engine;
pub use integration::FromIntegrationSender;
pub use integration::Integration;
pub use integration::IntegrationError;
pub use message::CommandReply;
pub use message::FromIntegrationMessage;
pub use message::ToIntegrationMessage;
pub use state::State;
