//! Paginated API extraction against a mock server

use serde_json::json;
use std::time::Duration;
use tidemark_common::Bookmark;
use tidemark_ingest::extract::{ApiExtractor, ExtractError, Extractor, PagedApiClient};
use tidemark_ingest::{ColumnType, Value};
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn page(page: u32, total_pages: u32, ids: &[i64]) -> serde_json::Value {
    let results: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "title": format!("Movie {}", id),
                "release_date": "2024-03-01",
                "genre_ids": [18, 53],
                "vote_average": 7.5
            })
        })
        .collect();
    json!({ "page": page, "results": results, "total_pages": total_pages })
}

fn client(server: &MockServer) -> PagedApiClient {
    PagedApiClient::new(server.uri(), "secret-token")
        .unwrap()
        .with_page_delay(Duration::ZERO)
}

async fn mount_page(server: &MockServer, number: u32, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/discover/movie"))
        .and(query_param("page", number.to_string()))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_fetches_until_last_page() {
    let server = MockServer::start().await;
    mount_page(&server, 1, page(1, 2, &[1, 2])).await;
    mount_page(&server, 2, page(2, 2, &[3])).await;

    let extractor = ApiExtractor::new(client(&server), "discover/movie");
    let batch = extractor.extract(None, None).await.unwrap().unwrap();

    assert_eq!(batch.num_rows(), 3);
    assert_eq!(
        batch.column_names(),
        vec!["id", "title", "release_date", "genre_ids", "vote_average"]
    );
    assert_eq!(batch.column("id").unwrap().column_type(), ColumnType::Integer);
    assert_eq!(batch.column("release_date").unwrap().column_type(), ColumnType::Date);
    assert_eq!(
        batch.column("genre_ids").unwrap().values()[0],
        Value::Text("18,53".into())
    );
}

#[tokio::test]
async fn test_max_pages_caps_fetching() {
    let server = MockServer::start().await;
    mount_page(&server, 1, page(1, 5, &[1])).await;
    mount_page(&server, 2, page(2, 5, &[2])).await;

    let extractor = ApiExtractor::new(client(&server), "discover/movie");
    let batch = extractor.extract(None, Some(2)).await.unwrap().unwrap();

    assert_eq!(batch.num_rows(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_empty_page_stops_and_yields_nothing() {
    let server = MockServer::start().await;
    mount_page(&server, 1, json!({ "page": 1, "results": [], "total_pages": 0 })).await;

    let extractor = ApiExtractor::new(client(&server), "discover/movie");
    assert!(extractor.extract(None, None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_bookmark_is_sent_as_lower_bound() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/discover/movie"))
        .and(query_param("release_date.gte", "2024-02-10"))
        .and(query_param("sort_by", "primary_release_date"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(1, 1, &[9])))
        .mount(&server)
        .await;

    let bookmark: Bookmark = serde_json::from_value(json!("2024-02-10T17:45:00Z")).unwrap();
    let extractor = ApiExtractor::new(client(&server), "discover/movie")
        .with_param("sort_by", "primary_release_date")
        .with_bookmark_param("release_date.gte");

    let batch = extractor.extract(Some(&bookmark), None).await.unwrap().unwrap();
    assert_eq!(batch.num_rows(), 1);
}

#[tokio::test]
async fn test_rate_limit_waits_and_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/discover/movie"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_page(&server, 1, page(1, 1, &[1])).await;

    let batch = ApiExtractor::new(client(&server), "discover/movie")
        .extract(None, None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(batch.num_rows(), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rate_limit_retries_are_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .mount(&server)
        .await;

    let client = client(&server).with_max_rate_limit_retries(2);
    let err = client
        .fetch_all("discover/movie", &Default::default(), 1, None)
        .await
        .unwrap_err();

    assert!(matches!(err, ExtractError::RateLimited { retries: 2, .. }), "got {err}");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_error_status_fails_and_dumps_partial_results() {
    let server = MockServer::start().await;
    mount_page(&server, 1, page(1, 3, &[1, 2])).await;
    Mock::given(method("GET"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let dump_dir = tempfile::tempdir().unwrap();
    let client = client(&server).with_dump_dir(dump_dir.path());
    let err = client
        .fetch_all("discover/movie", &Default::default(), 1, None)
        .await
        .unwrap_err();

    assert!(
        matches!(err, ExtractError::Status { status: 500, ref body, .. } if body == "boom"),
        "got {err}"
    );

    let dumped: Vec<serde_json::Value> = serde_json::from_str(
        &std::fs::read_to_string(dump_dir.path().join("discover_movie_temp_data.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(dumped.len(), 2);
}
