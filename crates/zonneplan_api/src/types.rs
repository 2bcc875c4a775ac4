use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// Product type of a contract.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContractType {
    Electricity,
    Gas,
    PvInstallation,
    P1Installation,
    ChargePointInstallation,
    HomeBatteryInstallation,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub uuid: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub contract_type: ContractType,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub uuid: String,
    #[serde(default)]
    pub ean: Option<String>,
    #[serde(default)]
    pub market_segment: Option<String>,
    #[serde(default)]
    pub contracts: Vec<Contract>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressGroup {
    pub uuid: String,
    #[serde(default)]
    pub address: Value,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub uuid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Payload of `user-accounts/me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub user_account: Option<UserAccount>,
    #[serde(default)]
    pub address_groups: Vec<AddressGroup>,
}

/// Contracts of one connection, grouped by type in account order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionContracts {
    pub address_uuid: String,
    pub contracts: BTreeMap<ContractType, Vec<Contract>>,
}

impl ConnectionContracts {
    pub fn of_type(&self, contract_type: ContractType) -> &[Contract] {
        self.contracts
            .get(&contract_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Connection uuid to its grouped contracts.
pub type ContractIndex = BTreeMap<String, ConnectionContracts>;

impl Account {
    /// Group contracts per connection. Connections without contracts are left out.
    pub fn contract_index(&self) -> ContractIndex {
        let mut index = ContractIndex::new();
        for group in &self.address_groups {
            for connection in &group.connections {
                if connection.contracts.is_empty() {
                    continue;
                }

                let entry = index
                    .entry(connection.uuid.clone())
                    .or_insert_with(|| ConnectionContracts {
                        address_uuid: group.uuid.clone(),
                        contracts: BTreeMap::new(),
                    });
                for contract in &connection.contracts {
                    entry
                        .contracts
                        .entry(contract.contract_type)
                        .or_default()
                        .push(contract.clone());
                }
            }
        }
        index
    }
}

/// Granularity of a home battery chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChartKind {
    Months,
    Days,
}
