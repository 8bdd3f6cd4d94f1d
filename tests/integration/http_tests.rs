//! Full runs through the reqwest executor and a SQLite progress file

use crate::support::{create_identity_pool, create_test_settings};
use std::sync::Arc;
use std::time::Duration;
use sumi_sluice::config::TransportConfig;
use sumi_sluice::pool::ProxyPool;
use sumi_sluice::progress::{load_statistics, open_progress, RunStatus, SqliteProgressBackend};
use sumi_sluice::scheduler::Scheduler;
use sumi_sluice::transport::{CredentialSessions, HttpExecutor};
use sumi_sluice::work::{parse_units, UnitOutcome};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_post(server: &MockServer, id: &str, status: u16, body: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/api/post-detail/{}", id)))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_http_run_persists_progress() {
    let server = MockServer::start().await;
    mount_post(&server, "101", 200, r#"{"data": [{"c": 1}, {"c": 2}]}"#).await;
    mount_post(&server, "102", 200, r#"{"data": []}"#).await;
    mount_post(&server, "103", 200, r#"{"id": 103}"#).await;
    mount_post(&server, "gone", 404, "").await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("progress.db");
    let store = Arc::new(open_progress(&db_path, 2, Duration::from_secs(30)).unwrap());
    store.begin_run("test-hash").await.unwrap();

    let transport = TransportConfig {
        url_template: format!("{}/api/{{kind}}/{{id}}", server.uri()),
        user_agent: "sumi-sluice-test/1.0".to_string(),
    };
    let executor = HttpExecutor::new(&transport, Duration::from_secs(5)).unwrap();

    let identities = create_identity_pool(2);
    assert_eq!(identities.establish_sessions(&CredentialSessions).await, 2);

    let scheduler = Scheduler::new(
        create_test_settings(),
        identities,
        Arc::new(ProxyPool::disabled()),
        Arc::new(executor),
        Arc::clone(&store),
    )
    .with_session_provider(Arc::new(CredentialSessions));

    let units = parse_units(
        "# posts to fetch\n\
         post 101\n\
         post 102\n\
         \n\
         post-detail 103\n\
         post gone\n",
    )
    .unwrap();
    let report = scheduler.run(units, 2).await.unwrap();
    store.finish_run(RunStatus::Completed).await.unwrap();

    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.get("gone").unwrap().outcome,
        UnitOutcome::Failed { .. }
    ));
    drop(scheduler);
    drop(store);

    let backend = SqliteProgressBackend::new(&db_path).unwrap();
    let statistics = load_statistics(&backend).unwrap();
    assert_eq!(statistics.counts.success, 3);
    assert_eq!(statistics.counts.failed, 1);
    assert_eq!(statistics.stats.items_produced, 3);
    assert_eq!(statistics.stats.processed, 4);

    let run = statistics.latest_run.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.config_hash, "test-hash");
}

#[tokio::test]
async fn test_http_run_resumes_from_sqlite() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/post-detail/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/post-detail/2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("progress.db");
    let transport = TransportConfig {
        url_template: format!("{}/api/{{kind}}/{{id}}", server.uri()),
        user_agent: "sumi-sluice-test/1.0".to_string(),
    };

    for (units, fresh) in [("post 1\npost 2\n", false), ("post 1\npost 2\n", false), ("post 2\n", true)] {
        let store = Arc::new(open_progress(&db_path, 10, Duration::from_secs(30)).unwrap());
        if fresh {
            store.reset().await.unwrap();
        }
        let scheduler = Scheduler::new(
            create_test_settings(),
            create_identity_pool(1),
            Arc::new(ProxyPool::disabled()),
            Arc::new(HttpExecutor::new(&transport, Duration::from_secs(5)).unwrap()),
            store,
        );
        let report = scheduler.run(parse_units(units).unwrap(), 1).await.unwrap();
        assert_eq!(report.succeeded() + report.skipped(), report.len());
    }
    // Mock expectations are verified when the server drops
}
