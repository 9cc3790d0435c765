use serde_json::{Value, json};

use super::{ArmClient, ArmResource, DesiredAttributes, GroupRef};
use crate::error::ClassifiedError;
use crate::model::ResourceKind;
use crate::naming::NameRule;
use crate::remote::{NameCheck, ResourcePath};

const ACCOUNTS: &str = "Microsoft.DocumentDB/databaseAccounts";
const API_VERSION: &str = "2015-04-08";

/// Cosmos DB database accounts.
///
/// Accounts are created in a single region: the location list holds one
/// entry named `<account>-<location>` with failover priority 0.
pub struct CosmosDbAccountManager {
    client: ArmClient,
}

impl CosmosDbAccountManager {
    pub fn new(client: ArmClient) -> Self {
        Self { client }
    }
}

impl ArmResource for CosmosDbAccountManager {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::CosmosDbAccount
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
        NameRule::CosmosAccount
    }

    /// Account names are global; the provider answers a HEAD on the name.
    fn name_check(&self, _group: &GroupRef, name: &str) -> Option<NameCheck> {
        Some(NameCheck::ExistsProbe {
            path: ResourcePath::new(
                format!("/providers/Microsoft.DocumentDB/databaseAccountNames/{name}"),
                API_VERSION,
            ),
            resource_type: ACCOUNTS.to_string(),
            name: name.to_string(),
        })
    }

    fn body(&self, name: &str, desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
        let location = desired.required_str("location")?;
        let mut body = json!({
            "location": location,
            "kind": desired.str_or("kind", "GlobalDocumentDB"),
            "properties": {
                "databaseAccountOfferType": desired.str_or("offerType", "Standard"),
                "locations": [{
                    "id": format!("{name}-{location}"),
                    "locationName": location,
                    "failoverPriority": 0,
                }],
                "enableMultipleWriteLocations": false,
                "isVirtualNetworkFilterEnabled": false,
            },
        });
        if let Some(tags) = desired.get("tags") {
            body["tags"] = tags.clone();
        }
        Ok(body)
    }
}
