//! End-to-end convergence through the engine's worker pool.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::*;
use skyward_engine::controller::Outcome;
use skyward_engine::model::{DesiredSpec, InstanceKey, ProvisioningState, ResourceKind};
use skyward_engine::{Engine, ReconcileEvent, SimulatedControlPlane};
use tokio::sync::broadcast;

const MYSQL_SERVERS: &str = "Microsoft.DBforMySQL/servers";

fn mysql_path(name: &str) -> String {
    format!("/subscriptions/{SUBSCRIPTION}/resourceGroups/{GROUP}/providers/{MYSQL_SERVERS}/{name}")
}

/// Helper to wait until every key in `keys` has produced `expected`.
async fn wait_for(
    events: &mut broadcast::Receiver<ReconcileEvent>,
    keys: &[InstanceKey],
    expected: Outcome,
) {
    let mut outstanding: HashSet<InstanceKey> = keys.iter().cloned().collect();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    while !outstanding.is_empty() {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {outstanding:?}"))
            .expect("event stream open");
        if event.outcome == expected {
            outstanding.remove(&event.key);
        } else if let Outcome::Failed { message, .. } = &event.outcome {
            panic!("{} failed: {message}", event.key);
        }
    }
}

struct Topology {
    server: InstanceKey,
    replica: InstanceKey,
    database: InstanceKey,
    administrator: InstanceKey,
    rule: InstanceKey,
}

impl Topology {
    fn new() -> Self {
        Self {
            server: key(ResourceKind::MySqlServer, "mysql-primary"),
            replica: key(ResourceKind::MySqlReplica, "mysql-replica"),
            database: key(ResourceKind::MySqlDatabase, "appdb"),
            administrator: key(ResourceKind::MySqlAdministrator, "activeDirectory"),
            rule: key(ResourceKind::MySqlFirewallRule, "office"),
        }
    }

    fn all(&self) -> Vec<InstanceKey> {
        vec![
            self.server.clone(),
            self.replica.clone(),
            self.database.clone(),
            self.administrator.clone(),
            self.rule.clone(),
        ]
    }

    /// Children first, so the server has to wait for its dependents to exist.
    fn submit(&self, engine: &Engine) {
        engine.submit(
            self.rule.clone(),
            mysql_child_spec("mysql-primary")
                .attribute("startIpAddress", "10.0.0.1")
                .attribute("endIpAddress", "10.0.0.255"),
        );
        engine.submit(
            self.administrator.clone(),
            mysql_child_spec("mysql-primary")
                .attribute("login", "dba@example.com")
                .attribute("sid", "11111111-2222-3333-4444-555555555555")
                .attribute("tenantId", "66666666-7777-8888-9999-000000000000"),
        );
        engine.submit(self.database.clone(), mysql_child_spec("mysql-primary"));
        engine.submit(self.replica.clone(), mysql_replica_spec("mysql-primary"));
        engine.submit(self.server.clone(), mysql_server_spec());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mysql_topology_converges_and_tears_down() {
    let h = Harness::with_sim(SimulatedControlPlane::new().with_latency(2), test_config());
    let engine = Engine::start(h.controller.clone(), h.store.clone(), 4);
    let mut events = engine.subscribe();
    let topology = Topology::new();

    topology.submit(&engine);
    wait_for(&mut events, &topology.all(), Outcome::Ready).await;

    for key in topology.all() {
        let status = engine.store().status(&key).unwrap();
        assert_eq!(status.state, ProvisioningState::Ready, "{key}");
        assert!(status.remote_id.is_some(), "{key}");
    }

    let replica = h.sim.resource(&mysql_path("mysql-replica")).await.unwrap();
    assert_eq!(replica.properties["createMode"], "Replica");
    assert_eq!(
        replica.properties["sourceServerId"].as_str(),
        Some(mysql_path("mysql-primary").as_str())
    );
    assert!(
        h.sim
            .contains(&format!("{}/databases/appdb", mysql_path("mysql-primary")))
            .await
    );
    assert!(
        h.sim
            .contains(&format!(
                "{}/administrators/activeDirectory",
                mysql_path("mysql-primary")
            ))
            .await
    );

    for key in topology.all() {
        assert!(engine.delete(&key));
    }
    wait_for(&mut events, &topology.all(), Outcome::Deleted).await;

    assert!(engine.store().is_empty());
    assert_eq!(h.sim.resource_count().await, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn resubmitting_an_unchanged_spec_keeps_the_generation() {
    let h = Harness::new();
    let engine = Engine::start(h.controller.clone(), h.store.clone(), 1);
    let mut events = engine.subscribe();
    let server = key(ResourceKind::MySqlServer, "mysql-primary");

    assert_eq!(engine.submit(server.clone(), mysql_server_spec()), 1);
    wait_for(&mut events, std::slice::from_ref(&server), Outcome::Ready).await;

    assert_eq!(engine.submit(server.clone(), mysql_server_spec()), 1);
    assert_eq!(
        engine.submit(server.clone(), mysql_server_spec().attribute("version", "8.0")),
        2
    );
    wait_for(&mut events, std::slice::from_ref(&server), Outcome::Ready).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn deleting_an_untracked_key_is_refused() {
    let h = Harness::new();
    let engine = Engine::start(h.controller.clone(), h.store.clone(), 1);
    assert!(!engine.delete(&key(ResourceKind::StorageAccount, "nothere")));
    engine.shutdown().await;
}

#[tokio::test]
async fn failed_instances_are_not_requeued() {
    let h = Harness::new();
    let engine = Engine::start(h.controller.clone(), h.store.clone(), 2);
    let mut events = engine.subscribe();
    let server = key(ResourceKind::MySqlServer, "mysql-primary");

    engine.submit(server.clone(), DesiredSpec::new().attribute("location", "eastus2"));
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event.outcome, Outcome::Failed { .. }));

    // No timer was armed for it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(h.sink.commits_for(&server), 1);
    engine.shutdown().await;
}
