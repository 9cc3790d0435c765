use serde_json::{Map, Value, json};

use super::arm::name_check_action;
use super::{ArmClient, ArmResource, DesiredAttributes, GroupRef};
use crate::error::ClassifiedError;
use crate::model::{ResourceKind, SOURCE_REFERENCE};
use crate::naming::NameRule;
use crate::remote::{NameCheck, ResourcePath};

pub(super) const PROVIDER: &str = "Microsoft.DBforMySQL";
pub(super) const SERVERS: &str = "Microsoft.DBforMySQL/servers";
pub(super) const API_VERSION: &str = "2017-12-01";

/// Fixed child name of a server's Active Directory administrator.
const ADMINISTRATOR_NAME: &str = "activeDirectory";

pub(super) fn server_path(group: &GroupRef, server: &str) -> ResourcePath {
    ResourcePath::top_level(
        &group.subscription,
        &group.resource_group,
        SERVERS,
        server,
        API_VERSION,
    )
}

fn server_name_check(group: &GroupRef, name: &str) -> NameCheck {
    name_check_action(&group.subscription, PROVIDER, SERVERS, name, API_VERSION)
}

fn sku(desired: &DesiredAttributes) -> Value {
    match desired.get("sku") {
        Some(Value::String(name)) => json!({ "name": name }),
        Some(sku @ Value::Object(_)) => sku.clone(),
        _ => json!({ "name": "GP_Gen5_2" }),
    }
}

fn with_tags(mut body: Value, desired: &DesiredAttributes) -> Value {
    if let Some(tags) = desired.get("tags") {
        body["tags"] = tags.clone();
    }
    body
}

/// Azure Database for MySQL servers.
pub struct MySqlServerManager {
    client: ArmClient,
}

impl MySqlServerManager {
    pub fn new(client: ArmClient) -> Self {
        Self { client }
    }
}

impl ArmResource for MySqlServerManager {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::MySqlServer
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
        Some(server_name_check(group, name))
    }

    fn body(&self, _name: &str, desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
        let location = desired.required_str("location")?;
        let mut properties = Map::new();
        properties.insert("createMode".into(), "Default".into());
        properties.insert(
            "administratorLogin".into(),
            desired.required_str("administratorLogin")?.into(),
        );
        properties.insert(
            "administratorLoginPassword".into(),
            desired.required_str("administratorLoginPassword")?.into(),
        );
        properties.insert("version".into(), desired.str_or("version", "5.7").into());
        properties.insert(
            "sslEnforcement".into(),
            desired.str_or("sslEnforcement", "Enabled").into(),
        );
        desired.copy_optional(&mut properties, &["storageProfile"]);

        let body = json!({
            "location": location,
            "sku": sku(desired),
            "properties": properties,
        });
        Ok(with_tags(body, desired))
    }
}

/// Read replicas of a MySQL server. The primary is the `source` reference;
/// its remote id becomes `sourceServerId`.
pub struct MySqlReplicaManager {
    client: ArmClient,
}

impl MySqlReplicaManager {
    pub fn new(client: ArmClient) -> Self {
        Self { client }
    }
}

impl ArmResource for MySqlReplicaManager {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::MySqlReplica
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
        Some(server_name_check(group, name))
    }

    fn body(&self, _name: &str, desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
        let location = desired.required_str("location")?;
        let source = match desired.resolved(SOURCE_REFERENCE) {
            Some(id) => id,
            None => desired.required_str("sourceServerId")?,
        };

        let body = json!({
            "location": location,
            "properties": {
                "createMode": "Replica",
                "sourceServerId": source,
            },
        });
        Ok(with_tags(body, desired))
    }
}

/// Active Directory administrator of a MySQL server. A server has at most
/// one, so the remote child name is fixed whatever the instance is called.
pub struct MySqlAdministratorManager {
    client: ArmClient,
}

impl MySqlAdministratorManager {
    pub fn new(client: ArmClient) -> Self {
        Self { client }
    }
}

impl ArmResource for MySqlAdministratorManager {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::MySqlAdministrator
    }

    fn client(&self) -> &ArmClient {
        &self.client
    }

    fn path(&self, group: &GroupRef, _name: &str) -> Result<ResourcePath, ClassifiedError> {
        Ok(server_path(group, group.parent()?).child("administrators", ADMINISTRATOR_NAME))
    }

    fn name_rule(&self) -> NameRule {
        NameRule::Child
    }

    fn body(&self, _name: &str, desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
        Ok(json!({
            "properties": {
                "administratorType": "ActiveDirectory",
                "login": desired.required_str("login")?,
                "sid": desired.required_str("sid")?,
                "tenantId": desired.required_str("tenantId")?,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Attributes;
    use crate::operation::PollPolicy;
    use crate::remote::sim::SimulatedControlPlane;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn client() -> ArmClient {
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        };
        ArmClient::new(Arc::new(SimulatedControlPlane::new()), policy)
    }

    fn attrs(pairs: &[(&str, Value)]) -> DesiredAttributes {
        DesiredAttributes::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Attributes>(),
        )
    }

    #[test]
    fn server_body_defaults() {
        let desired = attrs(&[
            ("location", json!("eastus2")),
            ("administratorLogin", json!("adm")),
            ("administratorLoginPassword", json!("pw")),
            ("sku", json!("B_Gen5_1")),
        ]);
        let body = MySqlServerManager::new(client()).body("s1", &desired).unwrap();
        assert_eq!(body["sku"]["name"], "B_Gen5_1");
        assert_eq!(body["properties"]["version"], "5.7");
        assert_eq!(body["properties"]["sslEnforcement"], "Enabled");
        assert_eq!(body["properties"]["createMode"], "Default");
    }

    #[test]
    fn replica_prefers_resolved_source() {
        let manager = MySqlReplicaManager::new(client());
        let desired = attrs(&[("location", json!("eastus2"))]).with_resolved(BTreeMap::from([(
            SOURCE_REFERENCE.to_string(),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.DBforMySQL/servers/primary"
                .to_string(),
        )]));
        let body = manager.body("r1", &desired).unwrap();
        assert_eq!(body["properties"]["createMode"], "Replica");
        assert!(
            body["properties"]["sourceServerId"]
                .as_str()
                .unwrap()
                .ends_with("/servers/primary")
        );

        let err = manager
            .body("r1", &attrs(&[("location", json!("eastus2"))]))
            .unwrap_err();
        assert!(err.message.contains("sourceServerId"));
    }

    #[test]
    fn administrator_has_fixed_child_name() {
        let manager = MySqlAdministratorManager::new(client());
        let path = manager
            .path(&GroupRef::new("sub", "rg").with_parent("s1"), "my-admin")
            .unwrap();
        assert!(path.path.ends_with("/servers/s1/administrators/activeDirectory"));
        assert!(manager.path(&GroupRef::new("sub", "rg"), "my-admin").is_err());

        let body = manager
            .body(
                "my-admin",
                &attrs(&[
                    ("login", json!("dba@example.com")),
                    ("sid", json!("00000000-0000-0000-0000-00000000000a")),
                    ("tenantId", json!("00000000-0000-0000-0000-00000000000b")),
                ]),
            )
            .unwrap();
        assert_eq!(body["properties"]["administratorType"], "ActiveDirectory");
        assert_eq!(body["properties"]["login"], "dba@example.com");
    }
}
