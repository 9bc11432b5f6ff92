#![cfg(feature = "sqlite")]

use std::time::Duration;

use dbqueue::prelude::*;
use dbqueue::queue::heartbeat::check_connection;

#[test]
fn submitted_queries_run_on_spawned_workers() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("orders.db").display());
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = QueueManager::new(2)?;
        manager.register_migration_set(MigrationSet::new("orders").with_script(
            "orders_1.rhai",
            r#"fn run_migration(engine, design, schema) {
                #{
                    forward: "CREATE TABLE orders (id INTEGER, customer TEXT);\n-- QUERY DELIMITER\nINSERT INTO orders VALUES (1, 'ann'), (2, 'bob');",
                    reverse: "DROP TABLE orders;",
                }
            }"#,
        )?);
        let lead = manager.start_database(
            DatabaseConfig::builder("orders", url.as_str())
                .migrations("PAYLOAD:orders")
                .build()?,
        )?;
        lead.wait_until_steady(Duration::from_secs(10)).await?;

        assert!(manager.submit_query(
            "orders",
            "q1",
            "SELECT customer FROM orders WHERE id = :orderId",
            r#"{"INTEGER":{"orderId":2}}"#,
            "fast",
        ));
        let result = manager.wait_for_result("q1").await?;
        assert!(result.success);
        assert_eq!(result.data_json, r#"[{"customer":"bob"}]"#);
        assert_eq!(manager.query_status("q1"), Some(QueryStatus::Complete));
        assert!(lead.children().iter().any(|c| c.queue_type() == Some(QueueType::Fast)));

        assert!(manager.submit_query("orders", "q2", "SELECT nope FROM orders", "", "slow"));
        let failed = manager.wait_for_result("q2").await?;
        assert!(!failed.success);
        assert!(failed.error_message.is_some());

        let stats: serde_json::Value = serde_json::from_str(&manager.stats_json()?)?;
        assert_eq!(stats["submitted"], 2);
        assert_eq!(stats["completed"], 1);
        assert_eq!(stats["failed"], 1);

        manager.shutdown().await;
        assert!(manager.is_empty());
        assert_eq!(lead.phase(), Some(LeadPhase::Destroyed));
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

#[test]
fn manager_rejects_bad_registrations() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = QueueManager::new(1)?;
        let err = DatabaseConfig::builder("  ", "sqlite::memory:")
            .build()
            .expect_err("blank name");
        assert!(matches!(err, DbQueueError::ConfigError(_)));

        manager.start_database(DatabaseConfig::builder("one", "sqlite::memory:").build()?)?;
        assert!(
            manager
                .start_database(DatabaseConfig::builder("two", "sqlite::memory:").build()?)
                .is_err()
        );
        assert_eq!(manager.database_names(), vec!["one"]);
        assert!(!manager.submit_query("two", "q", "SELECT 1", "", "fast"));
        manager.shutdown().await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

#[test]
fn heartbeat_reports_unusable_connection_strings() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        for conn_str in ["", "postgresql://", "mysql://user@host/"] {
            let worker = DatabaseQueue::create_worker("hb", conn_str, "fast", None);
            assert!(!check_connection(&worker).await, "{conn_str:?} should not connect");
            assert!(!worker.is_connected());
            assert!(worker.last_connection_attempt().is_none());
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

#[test]
fn cache_entries_resolve_by_query_ref() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = QueueManager::new(1)?;
        let bootstrap = "SELECT 5 AS query_ref, 0 AS query_type, \
                         'SELECT * FROM users WHERE id = :id' AS sql_template, \
                         'user by id' AS description, 'cache' AS queue_type, 120 AS timeout";
        let lead = manager.start_database(
            DatabaseConfig::builder("users", "sqlite::memory:")
                .bootstrap_query(bootstrap)
                .build()?,
        )?;
        lead.wait_until_steady(Duration::from_secs(10)).await?;

        let entry = manager.lookup_cache_entry("users", 5).ok_or("cached entry")?;
        assert_eq!(entry.queue_type, QueueType::Cache);
        assert_eq!(entry.ttl_seconds, 120);
        assert_eq!(entry.description, "user by id");
        assert!(manager.lookup_cache_entry("users", 6).is_none());
        assert!(manager.lookup_cache_entry("nobody", 5).is_none());
        assert!(!lead.is_empty_database());

        manager.shutdown().await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
