//! Fleet bring-up, publish-over-reconnect and shutdown scenarios

#[cfg(test)]
mod tests {
    use crate::fixtures::{node_tree, test_config};
    use rmfleet_core::{Fleet, MockSessionFactory, MonitoringLevel, SessionState};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_fleet_bring_up_under_rate_and_concurrency_budgets() {
        let dir = tempfile::tempdir().unwrap();
        let certs = node_tree(dir.path(), &["n1", "n2", "n3", "n4", "n5"]);
        let mut config = test_config(certs, dir.path().join("state"));
        config.pool.max_concurrent_connections = 3;
        config.pool.connection_rate_limit = 2;

        let factory = Arc::new(MockSessionFactory::new());
        let fleet = Fleet::bootstrap(config, factory, None).await.unwrap();

        assert_eq!(
            fleet.pool().connected_nodes(),
            vec!["n1", "n2", "n3", "n4", "n5"]
        );

        // Priority seeding: the first two survivors watch at High, the
        // rest at Normal
        assert_eq!(fleet.monitor().node_count(), 5);
        assert_eq!(
            fleet.monitor().profile("n1").unwrap().level,
            MonitoringLevel::High
        );
        assert_eq!(
            fleet.monitor().profile("n2").unwrap().level,
            MonitoringLevel::High
        );
        for node_id in ["n3", "n4", "n5"] {
            assert_eq!(
                fleet.monitor().profile(node_id).unwrap().level,
                MonitoringLevel::Normal
            );
        }

        // Session book reflects every survivor
        let nodes = fleet.session_book().active_nodes();
        assert_eq!(nodes.len(), 5);
        assert!(nodes.values().all(|n| n.status == "connected"));

        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_fails_when_no_node_connects() {
        let dir = tempfile::tempdir().unwrap();
        let certs = node_tree(dir.path(), &["n1", "n2"]);
        let config = test_config(certs, dir.path().join("state"));

        let factory = Arc::new(MockSessionFactory::new());
        factory.mark_always_fail("n1");
        factory.mark_always_fail("n2");

        assert!(Fleet::bootstrap(config, factory, None).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_retries_over_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let certs = node_tree(dir.path(), &["n1"]);
        let config = test_config(certs, dir.path().join("state"));
        let factory = Arc::new(MockSessionFactory::new());
        let fleet = Fleet::bootstrap(config, factory.clone(), None).await.unwrap();

        // Silently drop the transport; the facade must notice, reconnect
        // and still deliver
        let session = factory.session("n1").unwrap();
        session.drop_transport();

        let report = fleet
            .operator()
            .send_params(None, &serde_json::json!({"Light": {"output": true}}))
            .await;
        assert_eq!(report.successes(), 1);
        assert!(session
            .published()
            .iter()
            .any(|(topic, _, _)| topic == "node/n1/params/local"));

        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_operator_disconnect_stamps_session_book() {
        let dir = tempfile::tempdir().unwrap();
        let certs = node_tree(dir.path(), &["n1", "n2"]);
        let config = test_config(certs, dir.path().join("state"));
        let factory = Arc::new(MockSessionFactory::new());
        let fleet = Fleet::bootstrap(config, factory, None).await.unwrap();

        let targets = vec!["n1".to_string()];
        let results = fleet.disconnect_nodes(Some(&targets)).await;
        assert_eq!(results["n1"], true);

        assert_eq!(fleet.pool().node_state("n1"), SessionState::Disconnected);
        assert_eq!(fleet.pool().connected_nodes(), vec!["n2"]);

        let nodes = fleet.session_book().active_nodes();
        assert_eq!(nodes["n1"].status, "disconnected");
        assert!(nodes["n1"].disconnected_at.is_some());
        assert_eq!(nodes["n2"].status, "connected");

        let history = fleet.session_book().node_history("n1");
        assert_eq!(history.last().unwrap().action, "disconnected");

        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_fast_and_complete_under_load() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<String> = (0..100).map(|i| format!("node-{i:03}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let certs = node_tree(dir.path(), &id_refs);
        let config = test_config(certs, dir.path().join("state"));

        let factory = Arc::new(MockSessionFactory::new());
        let fleet = Fleet::bootstrap(config, factory, None).await.unwrap();
        assert_eq!(fleet.pool().connected_nodes().len(), 100);

        let started = Instant::now();
        fleet.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(fleet.pool().connected_nodes().is_empty());
        assert!(fleet.session_book().active_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let certs = node_tree(dir.path(), &["n1", "n2"]);
        let config = test_config(certs, dir.path().join("state"));
        let factory = Arc::new(MockSessionFactory::new());
        let fleet = Fleet::bootstrap(config, factory, None).await.unwrap();

        let status = fleet.status();
        assert_eq!(status.connected_nodes, 2);
        assert_eq!(status.known_nodes, 2);
        assert_eq!(status.nodes["n1"].state, SessionState::Connected);
        assert_eq!(status.monitoring.total_nodes, 2);
        // Bootstrap subscribed the three inbound topics per node
        assert_eq!(status.subscriptions.total_subscriptions, 6);
        assert_eq!(status.active_ota_jobs, 0);

        fleet.shutdown().await;
    }
}
