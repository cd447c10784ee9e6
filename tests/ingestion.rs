//! End-to-end ingestion against feeds served by a local mock server.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use feedforge::collectors::{FeedFetcher, HttpFetcher};
use feedforge::config::{AppConfig, FeedFormat, SourceConfig};
use feedforge::error::{FetchError, PipelineError};
use feedforge::export::{EdlWriter, FORTINET_EDL, PALO_ALTO_EDL, URL_LIST};
use feedforge::models::{IndicatorType, JobOutcome};
use feedforge::pipeline::Pipeline;
use feedforge::storage::{IndicatorStore, RetryPolicy, SqliteStore};
use feedforge::whitelist::{safelist::Safelist, WhitelistEngine};
use wiremock::matchers::{basic_auth, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestEnv {
    store: Arc<dyn IndicatorStore>,
    pipeline: Pipeline,
    out: tempfile::TempDir,
}

async fn env(sources: Vec<SourceConfig>, safelist: &[&str]) -> TestEnv {
    let store: Arc<dyn IndicatorStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let safelist = Arc::new(Safelist::from_items(safelist.iter().map(|s| s.to_string()).collect()));
    let whitelist = Arc::new(WhitelistEngine::new(safelist, store.clone()));
    let fetcher = HttpFetcher::new(Duration::from_secs(5), None).unwrap();
    let out = tempfile::tempdir().unwrap();
    let config = AppConfig {
        sources,
        ..Default::default()
    };
    let pipeline = Pipeline::new(
        store.clone(),
        Arc::new(fetcher),
        whitelist,
        Arc::new(RwLock::new(config)),
        EdlWriter::new(out.path()),
    )
    .with_retry_policy(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
    });
    TestEnv { store, pipeline, out }
}

async fn serve(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn whitelisting_after_ingestion_removes_only_the_listed_indicator() {
    let server = MockServer::start().await;
    serve(&server, "/feed-a.txt", "1.1.1.1\nbad.com\n").await;
    let source = SourceConfig::new("Feed A", format!("{}/feed-a.txt", server.uri())).with_confidence(90);
    let env = env(vec![source.clone()], &[]).await;

    let result = env.pipeline.process_source(&source).await.unwrap();
    assert_eq!(result.count, 2);

    let ip = env.store.get_indicator("1.1.1.1").await.unwrap().unwrap();
    assert_eq!(ip.risk_score, 90);
    assert_eq!(ip.source_count, 1);

    env.store
        .add_whitelist("1.1.1.1", IndicatorType::Ip, None)
        .await
        .unwrap();
    env.pipeline.cleanup_whitelisted().await.unwrap();

    assert!(env.store.get_indicator("1.1.1.1").await.unwrap().is_none());
    assert!(env.store.get_indicator("bad.com").await.unwrap().is_some());
}

#[tokio::test]
async fn full_run_merges_sources_and_writes_block_lists() {
    let server = MockServer::start().await;
    serve(&server, "/a.txt", "192.168.1.0/25\n10.0.0.1\nBad.com\n8.8.8.8\n").await;
    serve(
        &server,
        "/b.json",
        r#"[{"attrs": {"ip": "10.0.0.1"}}, {"attrs": {"ip": "192.168.1.128/25"}}, {"attrs": {"ip": null}}, {}]"#,
    )
    .await;
    serve(&server, "/c.csv", "host,score\nhttp://evil.org/x,9\nshort\n").await;

    let sources = vec![
        SourceConfig::new("A", format!("{}/a.txt", server.uri())).with_confidence(90),
        SourceConfig::new("B", format!("{}/b.json", server.uri()))
            .with_format(FeedFormat::Json, Some("attrs.ip"))
            .with_confidence(10),
        SourceConfig::new("C", format!("{}/c.csv", server.uri())).with_format(FeedFormat::Csv, Some("0")),
    ];
    let env = env(sources, &["8.8.8.8"]).await;

    let report = env.pipeline.run_all().await.unwrap();
    assert_eq!(report.failed(), 0);

    let shared = env.store.get_indicator("10.0.0.1").await.unwrap().unwrap();
    assert_eq!(shared.source_count, 2);
    assert_eq!(shared.risk_score, 95);
    assert!(env.store.get_indicator("8.8.8.8").await.unwrap().is_none());
    assert!(env.store.get_indicator("bad.com").await.unwrap().is_some());

    let palo = std::fs::read_to_string(env.out.path().join(PALO_ALTO_EDL)).unwrap();
    assert_eq!(palo, "10.0.0.1/32\n192.168.1.0/24\n");
    let forti = std::fs::read_to_string(env.out.path().join(FORTINET_EDL)).unwrap();
    assert_eq!(forti, palo);
    let urls = std::fs::read_to_string(env.out.path().join(URL_LIST)).unwrap();
    assert!(urls.contains("bad.com\n"));
    assert!(urls.contains("http://evil.org/x\n"));

    let history = env.store.job_history(10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|h| h.status == JobOutcome::Success));
}

#[tokio::test]
async fn failing_feed_does_not_block_its_siblings() {
    let server = MockServer::start().await;
    serve(&server, "/ok.txt", "203.0.113.5\n").await;
    Mock::given(method("GET"))
        .and(path("/down.txt"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let sources = vec![
        SourceConfig::new("Ok", format!("{}/ok.txt", server.uri())),
        SourceConfig::new("Down", format!("{}/down.txt", server.uri())),
    ];
    let env = env(sources, &[]).await;

    let report = env.pipeline.run_all().await.unwrap();
    assert_eq!(report.failed(), 1);
    let down = report.outcomes.iter().find(|o| o.source == "Down").unwrap();
    assert!(down.message.as_deref().unwrap().contains("503"));
    assert!(env.store.get_indicator("203.0.113.5").await.unwrap().is_some());

    let history = env.store.job_history(10).await.unwrap();
    let failed = history.iter().find(|h| h.source_name == "Down").unwrap();
    assert_eq!(failed.status, JobOutcome::Failure);
}

#[tokio::test]
async fn fetcher_sends_basic_auth_and_treats_blank_bodies_as_no_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/private.txt"))
        .and(basic_auth("analyst", "s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("   \n"))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(5), None).unwrap();
    let mut source = SourceConfig::new("Private", format!("{}/private.txt", server.uri()));
    source.username = Some("analyst".to_string());
    source.password = Some("s3cret".to_string());
    assert_eq!(fetcher.fetch(&source).await.unwrap(), None);

    source.password = None;
    assert!(matches!(
        fetcher.fetch(&source).await,
        Err(FetchError::Status { status: 404, .. })
    ));
}

#[tokio::test]
async fn dry_run_rejects_non_http_urls() {
    let env = env(Vec::new(), &[]).await;
    let source = SourceConfig::new("Local", "file:///etc/hosts");
    assert!(matches!(
        env.pipeline.test_feed(&source).await,
        Err(PipelineError::Fetch(FetchError::InvalidUrl { .. }))
    ));
}
