use jobsync_adapters::{AdapterContext, AdapterError, JobSource, RemoteOkSource};
use jobsync_storage::{FetchError, HttpClientConfig, HttpFetcher};
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture_body() -> String {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/remoteok/sample/listings.json");
    std::fs::read_to_string(path).expect("fixture")
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        user_agent: Some("Mozilla/5.0".into()),
        ..Default::default()
    })
    .expect("fetcher")
}

fn ctx() -> AdapterContext {
    AdapterContext {
        run_id: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn fetch_listing_returns_jobs_without_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(header("user-agent", "Mozilla/5.0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture_body()))
        .expect(1)
        .mount(&server)
        .await;

    let source = RemoteOkSource::new(format!("{}/api", server.uri()), "https://remoteok.com");
    let jobs = source.fetch_listing(&fetcher(), &ctx()).await.expect("fetch");
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.position.is_some()));
}

#[tokio::test]
async fn non_success_status_is_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let source = RemoteOkSource::new(format!("{}/api", server.uri()), "https://remoteok.com");
    let err = source.fetch_listing(&fetcher(), &ctx()).await.unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Fetch(FetchError::HttpStatus { status: 403, .. })
    ));
}

#[tokio::test]
async fn malformed_body_is_a_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
        .mount(&server)
        .await;

    let source = RemoteOkSource::new(format!("{}/api", server.uri()), "https://remoteok.com");
    let err = source.fetch_listing(&fetcher(), &ctx()).await.unwrap_err();
    assert!(matches!(err, AdapterError::Parse(_)));
}
