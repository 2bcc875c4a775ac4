//! The Zonneplan integration: builds the coordinator tree from the account
//! and bridges entities to the engine.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use zonneplan_api::ApiClient;

use crate::config::PollingConfig;
use crate::connection::ConnectionCoordinators;
use crate::connection::CoordinatorContext;
use crate::coordinator::AuthSignal;
use crate::coordinator::Coordinator;
use crate::coordinator::RefreshOutcome;
use crate::coordinator::account::AccountFetch;
use crate::coordinator::account::contract_index;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::IntegrationError;
use crate::engine::ToIntegrationMessage;
use crate::entity::Entity;
use crate::entity::SensorMemory;

pub const INTEGRATION_NAME: &str = "zonneplan";

const ACCOUNT_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct ZonneplanIntegration {
    ctx: CoordinatorContext,
    account: Option<Coordinator>,
    connections: Vec<ConnectionCoordinators>,
    entities: HashMap<String, Arc<Entity>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ZonneplanIntegration {
    pub fn new(api: Arc<ApiClient>, polling: &PollingConfig) -> Self {
        Self {
            ctx: CoordinatorContext {
                api,
                auth: AuthSignal::new(),
                debounce_cooldown: polling.debounce_cooldown(),
                retry: polling.retry_options(),
            },
            account: None,
            connections: Vec::new(),
            entities: HashMap::new(),
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Integration for ZonneplanIntegration {
    fn name(&self) -> &str {
        INTEGRATION_NAME
    }

    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), IntegrationError> {
        let account = self.ctx.coordinator(
            "account".to_string(),
            ACCOUNT_INTERVAL,
            AccountFetch::new(self.ctx.api.clone()),
        );

        let outcome = account.refresh().await.map_err(|e| -> IntegrationError {
            if e.is_auth_failure() {
                format!("{}; run `zonneplan login` to sign in again", e).into()
            } else {
                e.into()
            }
        })?;
        if outcome == RefreshOutcome::Empty {
            return Err("account request returned no data".into());
        }
        let index = contract_index(&account).ok_or("account payload is not a contract index")?;
        info!("Account has {} connection(s) with contracts", index.len());

        let mut known = HashSet::new();
        for (uuid, contracts) in index {
            let connection = ConnectionCoordinators::new(&self.ctx, &uuid, contracts);
            known.extend(connection.contract_uuids().into_iter().map(str::to_string));

            for entity in connection.entities() {
                let entity = Arc::new(entity);
                tx.send(FromIntegrationMessage::EntityDiscovered {
                    entity_id: entity.entity_id.clone(),
                    integration_name: INTEGRATION_NAME.to_string(),
                })
                .await?;
                self.tasks
                    .push(tokio::spawn(publish_states(entity.clone(), tx.clone())));
                self.entities.insert(entity.entity_id.clone(), entity);
            }
            self.connections.push(connection);
        }
        info!("Set up {} entities", self.entities.len());

        self.tasks.push(tokio::spawn(reauthenticate_on_signal(
            self.ctx.auth.subscribe(),
            self.ctx.api.clone(),
        )));
        self.tasks
            .push(tokio::spawn(watch_account(account.clone(), known)));
        self.account = Some(account);
        Ok(())
    }

    async fn handle_message(&mut self, msg: ToIntegrationMessage) -> Result<(), IntegrationError> {
        let ToIntegrationMessage::Command {
            entity_id,
            command,
            reply,
        } = msg;

        let Some(entity) = self.entities.get(&entity_id).cloned() else {
            let _ = reply.send(Err(format!("unknown entity {}", entity_id)));
            return Ok(());
        };

        // Compound actions take several requests; keep the command loop free.
        tokio::spawn(async move {
            let outcome = entity.execute(&command).await;
            match &outcome {
                Ok(()) => info!("{} {:?} done", entity_id, command),
                Err(e) => warn!("{} {:?} failed: {}", entity_id, command, e),
            }
            let _ = reply.send(outcome.map_err(|e| e.to_string()));
        });
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), IntegrationError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for connection in &self.connections {
            connection.shutdown();
        }
        if let Some(account) = &self.account {
            account.shutdown();
        }
        info!("Zonneplan integration shut down");
        Ok(())
    }
}

/// Publish the entity's state every time its coordinator notifies.
async fn publish_states(entity: Arc<Entity>, tx: FromIntegrationSender) {
    let mut rx = entity.coordinator.subscribe();
    let mut memory = SensorMemory::default();
    loop {
        let state = rx.borrow_and_update().clone();
        if let Some(snapshot) = entity.evaluate(&state, &mut memory, Utc::now()) {
            if tx
                .send(FromIntegrationMessage::StateChanged { state: snapshot })
                .await
                .is_err()
            {
                return;
            }
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Refresh the token whenever a coordinator reports rejected credentials.
async fn reauthenticate_on_signal(mut signal: watch::Receiver<u64>, api: Arc<ApiClient>) {
    while signal.changed().await.is_ok() {
        match api.session().force_refresh().await {
            Ok(()) => info!("Access token refreshed after a rejected request"),
            Err(e) => error!(
                "Re-authentication failed: {}; run `zonneplan login` to sign in again",
                e
            ),
        }
    }
}

/// Contracts added after startup are only reported, not set up.
async fn watch_account(account: Coordinator, mut known: HashSet<String>) {
    let mut rx = account.subscribe();
    while rx.changed().await.is_ok() {
        let Some(index) = contract_index(&account) else {
            continue;
        };
        for (connection_uuid, contracts) in &index {
            for contract in contracts.contracts.values().flatten() {
                if known.insert(contract.uuid.clone()) {
                    warn!(
                        "New {} contract {} on connection {}; restart to add its entities",
                        contract.contract_type, contract.uuid, connection_uuid
                    );
                }
            }
        }
        debug!("Account refreshed");
    }
}
