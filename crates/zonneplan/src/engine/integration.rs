use std::error::Error;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;

/// Integration to engine, bounded for backpressure.
pub type FromIntegrationSender = mpsc::Sender<FromIntegrationMessage>;
pub type FromIntegrationReceiver = mpsc::Receiver<FromIntegrationMessage>;

/// Engine to integration. Unbounded, the engine must not block.
pub type ToIntegrationSender = mpsc::UnboundedSender<ToIntegrationMessage>;

pub type IntegrationError = Box<dyn Error + Send + Sync>;

#[async_trait]
pub trait Integration: Send + Sync {
    fn name(&self) -> &str;

    /// Discover entities and start reporting their state on `tx`.
    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), IntegrationError>;

    /// Run a command from the engine.
    async fn handle_message(&mut self, msg: ToIntegrationMessage) -> Result<(), IntegrationError>;

    async fn shutdown(&mut self) -> Result<(), IntegrationError>;
}
