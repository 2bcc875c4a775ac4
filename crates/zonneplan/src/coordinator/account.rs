use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use zonneplan_api::ApiClient;
use zonneplan_api::ApiError;
use zonneplan_api::Revalidate;
use zonneplan_api::types::ContractIndex;

use super::Coordinator;
use super::Fetch;

/// Polls `user-accounts/me` and reduces it to the contract index.
pub struct AccountFetch {
    api: Arc<ApiClient>,
}

impl AccountFetch {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Fetch for AccountFetch {
    async fn fetch(&mut self, previous: Option<Value>) -> Result<Option<Value>, ApiError> {
        let revalidate = Revalidate::holding(previous.is_some());
        let Some(account) = self.api.user_accounts(revalidate).await? else {
            return Ok(None);
        };

        let index = account.contract_index();
        debug!("Account has {} connection(s) with contracts", index.len());
        Ok(Some(serde_json::to_value(index)?))
    }
}

/// The contract index cached by an account coordinator.
pub fn contract_index(coordinator: &Coordinator) -> Option<ContractIndex> {
    coordinator
        .data()
        .and_then(|data| serde_json::from_value(data).ok())
}
