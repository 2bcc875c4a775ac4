pub mod api;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod credentials;
pub mod engine;
pub mod entity;
pub mod integration;

pub use config::Config;
pub use config::LogLevel;
pub use credentials::FileTokenStore;
pub use engine::CommandError;
pub use engine::Engine;
pub use engine::State;
pub use entity::Command;
pub use entity::EntityState;
pub use integration::ZonneplanIntegration;
