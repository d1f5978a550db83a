//! OTA job lifecycle driven over the wire path: URL responses arrive on
//! the subscription, status updates flow out through the facade.

#[cfg(test)]
mod tests {
    use crate::fixtures::{node_tree, test_config};
    use rmfleet_core::{Fleet, MockSessionFactory, OtaStatus};
    use rumqttc::QoS;
    use std::sync::Arc;

    async fn fleet_with_node() -> (Fleet, Arc<MockSessionFactory>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let certs = node_tree(dir.path(), &["n1"]);
        let config = test_config(certs, dir.path().join("state"));
        let factory = Arc::new(MockSessionFactory::new());
        let fleet = Fleet::bootstrap(config, factory.clone(), None).await.unwrap();
        (fleet, factory, dir)
    }

    #[tokio::test]
    async fn test_url_response_populates_active_jobs() {
        let (fleet, factory, _dir) = fleet_with_node().await;

        factory.session("n1").unwrap().inject(
            "node/n1/otaurl",
            br#"{"ota_job_id": "J1", "url": "https://x", "fw_version": "1.2.3"}"#,
        );

        let active = fleet.ota().active_jobs(Some("n1"));
        let record = &active["n1"]["J1"];
        assert_eq!(record["url"], "https://x");
        assert_eq!(record["fw_version"], "1.2.3");

        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_status_moves_job_to_history() {
        let (fleet, factory, _dir) = fleet_with_node().await;
        let session = factory.session("n1").unwrap();

        session.inject(
            "node/n1/otaurl",
            br#"{"ota_job_id": "J1", "url": "https://x", "fw_version": "1.2.3"}"#,
        );

        let report = fleet
            .operator()
            .send_ota_status(None, "J1", OtaStatus::Success)
            .await;
        assert_eq!(report.successes(), 1);

        // The status went out at QoS 0 regardless of verb defaults
        let status_publish = session
            .published()
            .into_iter()
            .find(|(topic, _, _)| topic == "node/n1/otastatus")
            .unwrap();
        assert_eq!(status_publish.2, QoS::AtMostOnce);

        assert!(fleet.ota().active_jobs(Some("n1")).is_empty());
        assert_eq!(
            fleet.ota().history(Some("n1"))["n1"]["J1"]["ota_status"],
            "success"
        );

        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_in_progress_status_leaves_job_active() {
        let (fleet, factory, _dir) = fleet_with_node().await;

        factory.session("n1").unwrap().inject(
            "node/n1/otaurl",
            br#"{"ota_job_id": "J1", "url": "https://x"}"#,
        );

        fleet
            .operator()
            .send_ota_status(None, "J1", OtaStatus::InProgress)
            .await;

        assert!(fleet.ota().active_jobs(Some("n1"))["n1"].contains_key("J1"));
        assert!(fleet.ota().history(None).is_empty());

        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_jobs_survive_restart_of_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let certs = node_tree(dir.path(), &["n1"]);
        let state_dir = dir.path().join("state");

        {
            let config = test_config(certs.clone(), state_dir.clone());
            let factory = Arc::new(MockSessionFactory::new());
            let fleet = Fleet::bootstrap(config, factory.clone(), None).await.unwrap();
            factory.session("n1").unwrap().inject(
                "node/n1/otaurl",
                br#"{"ota_job_id": "J1", "url": "https://x"}"#,
            );
            fleet.shutdown().await;
        }

        let config = test_config(certs, state_dir);
        let factory = Arc::new(MockSessionFactory::new());
        let fleet = Fleet::bootstrap(config, factory, None).await.unwrap();
        assert!(fleet.ota().active_jobs(Some("n1"))["n1"].contains_key("J1"));
        fleet.shutdown().await;
    }
}
