use std::net::Ipv4Addr;

use serde_json::{Map, Value, json};

use super::{ArmClient, ArmResource, DesiredAttributes, GroupRef, mysql, sql};
use crate::error::ClassifiedError;
use crate::model::ResourceKind;
use crate::naming::NameRule;
use crate::remote::ResourcePath;

type BodyFn = fn(&DesiredAttributes) -> Result<Value, ClassifiedError>;

/// Resources nested under a SQL or MySQL server: databases and firewall
/// rules. Names are scoped to the parent server, so only the local syntax
/// check applies.
pub struct ChildManager {
    kind: ResourceKind,
    client: ArmClient,
    server_path: fn(&GroupRef, &str) -> ResourcePath,
    segment: &'static str,
    body: BodyFn,
}

impl ChildManager {
    pub fn sql_database(client: ArmClient) -> Self {
        Self {
            kind: ResourceKind::SqlDatabase,
            client,
            server_path: sql::server_path,
            segment: "databases",
            body: sql_database_body,
        }
    }

    pub fn sql_firewall_rule(client: ArmClient) -> Self {
        Self {
            kind: ResourceKind::SqlFirewallRule,
            client,
            server_path: sql::server_path,
            segment: "firewallRules",
            body: firewall_rule_body,
        }
    }

    pub fn mysql_database(client: ArmClient) -> Self {
        Self {
            kind: ResourceKind::MySqlDatabase,
            client,
            server_path: mysql::server_path,
            segment: "databases",
            body: mysql_database_body,
        }
    }

    pub fn mysql_firewall_rule(client: ArmClient) -> Self {
        Self {
            kind: ResourceKind::MySqlFirewallRule,
            client,
            server_path: mysql::server_path,
            segment: "firewallRules",
            body: firewall_rule_body,
        }
    }
}

impl ArmResource for ChildManager {
    fn resource_kind(&self) -> ResourceKind {
        self.kind
    }

    fn client(&self) -> &ArmClient {
        &self.client
    }

    fn path(&self, group: &GroupRef, name: &str) -> Result<ResourcePath, ClassifiedError> {
        let server = group.parent()?;
        Ok((self.server_path)(group, server).child(self.segment, name))
    }

    fn name_rule(&self) -> NameRule {
        NameRule::Child
    }

    fn body(&self, _name: &str, desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
        (self.body)(desired)
    }
}

fn sql_database_body(desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
    let location = desired.required_str("location")?;
    let mut properties = Map::new();
    desired.copy_optional(
        &mut properties,
        &["collation", "edition", "maxSizeBytes", "requestedServiceObjectiveName"],
    );
    Ok(json!({ "location": location, "properties": properties }))
}

fn mysql_database_body(desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
    Ok(json!({
        "properties": {
            "charset": desired.str_or("charset", "utf8"),
            "collation": desired.str_or("collation", "utf8_general_ci"),
        }
    }))
}

fn ipv4(desired: &DesiredAttributes, key: &str) -> Result<Ipv4Addr, ClassifiedError> {
    let raw = desired.required_str(key)?;
    raw.parse()
        .map_err(|_| ClassifiedError::fatal(format!("`{key}` is not an IPv4 address: {raw}")))
}

fn firewall_rule_body(desired: &DesiredAttributes) -> Result<Value, ClassifiedError> {
    let start = ipv4(desired, "startIpAddress")?;
    let end = ipv4(desired, "endIpAddress")?;
    if start > end {
        return Err(ClassifiedError::fatal(format!(
            "firewall range is empty: {start} > {end}"
        )));
    }
    Ok(json!({
        "properties": {
            "startIpAddress": start.to_string(),
            "endIpAddress": end.to_string(),
        }
    }))
}
