use std::collections::BTreeMap;

use serde::Serialize;

use crate::entity::EntityState;

/// Snapshot of every entity the engine knows, keyed by entity id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub entities: BTreeMap<String, EntityState>,
}
