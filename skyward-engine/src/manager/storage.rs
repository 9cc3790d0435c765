use serde_json::{Value, json};

use super::arm::name_check_action;
use super::{ArmClient, ArmResource, DesiredAttributes, GroupRef};
use crate::error::ClassifiedError;
use crate::model::ResourceKind;
use crate::naming::NameRule;
use crate::remote::{NameCheck, ResourcePath};

const PROVIDER: &str = "Microsoft.Storage";
const ACCOUNTS: &str = "Microsoft.Storage/storageAccounts";
const API_VERSION: &str = "2019-06-01";

/// General-purpose storage accounts.
pub struct StorageAccountManager {
    client: ArmClient,
}

impl StorageAccountManager {
    pub fn new(client: ArmClient) -> Self {
        Self { client }
    }
}

impl ArmResource for StorageAccountManager {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::StorageAccount
    }

    fn client(&self) -> &ArmClient {
        &self.client
    }

    fn path(&self, group: &GroupRef, name: &str) -> Result<ResourcePath, ClassifiedError> {
        Ok(ResourcePath::top_level(
            &group.subscription,
            &group.resource_group,
            ACCOUNTS,
            name,
            API_VERSION,
        ))
    }

    fn name_rule(&self) -> NameRule {
        NameRule::StorageAccount
    }

    fn name_check(&self, group: &GroupRef, name: &str) -> Option<NameCheck> {
        Some(name_check_action(
            &group.subscription,
            PROVIDER,
            ACCOUNTS,
            name,
            API_VERSION,
        ))
    }

    fn body(&self, _name: &str, desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
        let https_only = desired
            .get("supportsHttpsTrafficOnly")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let mut body = json!({
            "location": desired.required_str("location")?,
            "sku": { "name": desired.str_or("sku", "Standard_LRS") },
            "kind": desired.str_or("kind", "StorageV2"),
            "properties": {
                "accessTier": desired.str_or("accessTier", "Hot"),
                "supportsHttpsTrafficOnly": https_only,
            },
        });
        if let Some(tags) = desired.get("tags") {
            body["tags"] = tags.clone();
        }
        Ok(body)
    }
}
