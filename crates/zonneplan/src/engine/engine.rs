use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Integration;
use super::integration::ToIntegrationSender;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use super::state::State;
use crate::entity::Command;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown entity {0}")]
    UnknownEntity(String),

    #[error("integration {0} is not running")]
    IntegrationGone(String),

    #[error("{0}")]
    Failed(String),
}

/// Keeps the entity state snapshot and routes commands to the integration
/// owning each entity.
pub struct Engine {
    /// Readers load the Arc, the event loop stores a new one.
    state: ArcSwap<State>,

    /// entity_id -> integration name
    entity_integration_map: std::sync::Mutex<HashMap<String, String>>,

    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    message_rx: Mutex<FromIntegrationReceiver>,

    message_tx: FromIntegrationSender,

    integration_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity of the integration to engine channel.
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

impl Engine {
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        Self {
            state: ArcSwap::new(Arc::default()),
            entity_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            integration_handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `integration`: setup, then commands until the engine shuts
    /// down, then its own shutdown.
    pub async fn register_integration(&self, mut integration: Box<dyn Integration>) {
        let name = integration.name().to_string();
        let (to_integration_tx, mut to_integration_rx) = mpsc::unbounded_channel();
        let from_integration_tx = self.message_tx.clone();

        if let Ok(mut channels) = self.integration_channels.lock() {
            channels.insert(name.clone(), to_integration_tx);
        }

        let handle = tokio::spawn(async move {
            if let Err(e) = integration.setup(from_integration_tx).await {
                warn!("Integration '{}' setup failed: {}", name, e);
                return;
            }

            while let Some(msg) = to_integration_rx.recv().await {
                if let Err(e) = integration.handle_message(msg).await {
                    warn!("Integration '{}' failed to handle message: {}", name, e);
                }
            }

            if let Err(e) = integration.shutdown().await {
                warn!("Integration '{}' shutdown failed: {}", name, e);
            }
            info!("Integration '{}' stopped", name);
        });

        self.integration_handles.lock().await.push(handle);
    }

    /// Run `command` on `entity_id` and wait for the outcome.
    pub async fn execute(&self, entity_id: &str, command: Command) -> Result<(), CommandError> {
        let integration_name = self
            .entity_integration_map
            .lock()
            .ok()
            .and_then(|map| map.get(entity_id).cloned())
            .ok_or_else(|| CommandError::UnknownEntity(entity_id.to_string()))?;

        let (reply, outcome) = oneshot::channel();
        let msg = ToIntegrationMessage::Command {
            entity_id: entity_id.to_string(),
            command,
            reply,
        };

        let sent = self
            .integration_channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(&integration_name).cloned())
            .is_some_and(|tx| tx.send(msg).is_ok());
        if !sent {
            return Err(CommandError::IntegrationGone(integration_name));
        }

        match outcome.await {
            Ok(result) => result.map_err(CommandError::Failed),
            Err(_) => Err(CommandError::IntegrationGone(integration_name)),
        }
    }

    /// Process integration events until every sender is gone.
    pub async fn run(&self) {
        info!("Engine starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_event(msg);
        }

        info!("Engine stopped");
    }

    /// Clones the `Arc`; cheap.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Close every integration channel and wait for the integrations to
    /// finish their shutdown.
    pub async fn shutdown(&self) {
        if let Ok(mut channels) = self.integration_channels.lock() {
            channels.clear();
        }

        let handles: Vec<_> = self.integration_handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Integration task ended abnormally: {}", e);
            }
        }
    }

    fn handle_event(&self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::EntityDiscovered {
                entity_id,
                integration_name,
            } => {
                info!(
                    "Entity discovered: {} (from {})",
                    entity_id, integration_name
                );
                if let Ok(mut map) = self.entity_integration_map.lock() {
                    map.insert(entity_id, integration_name);
                }
            }
            FromIntegrationMessage::StateChanged { state: entity } => {
                debug!(
                    "State changed: {} -> {} (available: {})",
                    entity.entity_id, entity.value, entity.available
                );

                let mut state = State::clone(&self.state.load());
                state.entities.insert(entity.entity_id.clone(), entity);
                self.state.store(Arc::new(state));
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Map;
    use serde_json::Value;

    use super::*;
    use crate::engine::IntegrationError;
    use crate::entity::EntityState;
    use crate::entity::Platform;

    struct FakeIntegration {
        stopped: Arc<AtomicBool>,
    }

    fn entity_state(entity_id: &str, value: Value) -> EntityState {
        EntityState {
            entity_id: entity_id.to_string(),
            unique_id: entity_id.to_string(),
            name: "Fake",
            platform: Platform::Button,
            available: true,
            value,
            unit: None,
            device_class: None,
            attributes: Map::new(),
            options: None,
            min: None,
            max: None,
            last_reset: None,
            last_updated: None,
        }
    }

    #[async_trait]
    impl Integration for FakeIntegration {
        fn name(&self) -> &str {
            "fake"
        }

        async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), IntegrationError> {
            tx.send(FromIntegrationMessage::EntityDiscovered {
                entity_id: "button.fake".to_string(),
                integration_name: "fake".to_string(),
            })
            .await?;
            tx.send(FromIntegrationMessage::StateChanged {
                state: entity_state("button.fake", Value::Null),
            })
            .await?;
            Ok(())
        }

        async fn handle_message(
            &mut self,
            msg: ToIntegrationMessage,
        ) -> Result<(), IntegrationError> {
            let ToIntegrationMessage::Command { command, reply, .. } = msg;
            let outcome = match command {
                Command::Press => Ok(()),
                other => Err(format!("cannot {:?}", other)),
            };
            let _ = reply.send(outcome);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), IntegrationError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_for_entity(engine: &Engine, entity_id: &str) {
        for _ in 0..100 {
            if engine.state_snapshot().entities.contains_key(entity_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never showed up", entity_id);
    }

    #[tokio::test]
    async fn test_commands_are_routed_to_owner() {
        let engine = Arc::new(Engine::new());
        let stopped = Arc::new(AtomicBool::new(false));
        engine
            .register_integration(Box::new(FakeIntegration {
                stopped: stopped.clone(),
            }))
            .await;
        let runner = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });

        wait_for_entity(&engine, "button.fake").await;

        engine.execute("button.fake", Command::Press).await.unwrap();

        let err = engine
            .execute("button.fake", Command::SetValue(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Failed(_)));

        let err = engine
            .execute("button.other", Command::Press)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownEntity(_)));

        engine.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));

        let err = engine.execute("button.fake", Command::Press).await.unwrap_err();
        assert!(matches!(err, CommandError::IntegrationGone(_)));

        runner.abort();
    }
}
