use serde_json::{Map, Value, json};

use super::arm::name_check_action;
use super::{ArmClient, ArmResource, DesiredAttributes, GroupRef};
use crate::error::ClassifiedError;
use crate::model::ResourceKind;
use crate::naming::NameRule;
use crate::remote::{NameCheck, ResourcePath};

pub(super) const PROVIDER: &str = "Microsoft.Sql";
pub(super) const SERVERS: &str = "Microsoft.Sql/servers";
pub(super) const API_VERSION: &str = "2015-05-01-preview";

pub(super) fn server_path(group: &GroupRef, server: &str) -> ResourcePath {
    ResourcePath::top_level(
        &group.subscription,
        &group.resource_group,
        SERVERS,
        server,
        API_VERSION,
    )
}

/// Azure SQL logical servers.
pub struct SqlServerManager {
    client: ArmClient,
}

impl SqlServerManager {
    pub fn new(client: ArmClient) -> Self {
        Self { client }
    }
}

impl ArmResource for SqlServerManager {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::SqlServer
    }

    fn client(&self) -> &ArmClient {
        &self.client
    }

    fn path(&self, group: &GroupRef, name: &str) -> Result<ResourcePath, ClassifiedError> {
        Ok(server_path(group, name))
    }

    fn name_rule(&self) -> NameRule {
        NameRule::Server
    }

    fn name_check(&self, group: &GroupRef, name: &str) -> Option<NameCheck> {
        Some(name_check_action(
            &group.subscription,
            PROVIDER,
            SERVERS,
            name,
            API_VERSION,
        ))
    }

    fn body(&self, _name: &str, desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
        let location = desired.required_str("location")?;
        let mut properties = Map::new();
        properties.insert(
            "administratorLogin".into(),
            desired.required_str("administratorLogin")?.into(),
        );
        properties.insert(
            "administratorLoginPassword".into(),
            desired.required_str("administratorLoginPassword")?.into(),
        );
        properties.insert("version".into(), desired.str_or("version", "12.0").into());

        let mut body = json!({ "location": location, "properties": properties });
        if let Some(tags) = desired.get("tags") {
            body["tags"] = tags.clone();
        }
        Ok(body)
    }
}
