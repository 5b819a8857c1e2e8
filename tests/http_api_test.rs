use std::sync::Arc;

use quiver::engine::{Engine, EngineConfig};
use quiver::server;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::sync::oneshot;

struct TestServer {
    base: String,
    client: Client,
    engine: Arc<Engine>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<quiver::error::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let engine = Arc::new(Engine::start(EngineConfig::in_memory()).unwrap());
        let listener = server::bind("127.0.0.1", 0).await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let (shutdown, signal) = oneshot::channel::<()>();
        let handle = tokio::spawn(server::serve(engine.clone(), listener, async move {
            let _ = signal.await;
        }));

        TestServer {
            base,
            client: Client::new(),
            engine,
            shutdown: Some(shutdown),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn delete(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.delete(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.handle.await.unwrap().unwrap();
        self.engine.stop().unwrap();
    }
}

#[tokio::test]
async fn test_docs_example_over_http() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            "/collections",
            json!({"name": "docs", "dimension": 3, "metric": "cosine"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "docs");
    assert_eq!(body["dimension"], 3);

    for (id, embedding) in [("a", [1.0, 0.0, 0.0]), ("b", [0.0, 1.0, 0.0])] {
        let (status, body) = server
            .post(
                "/collections/docs/vectors",
                json!({"id": id, "embedding": embedding, "metadata": {"lang": "en"}}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"], 1);
    }

    let (status, body) = server
        .post(
            "/collections/docs/query",
            json!({"embedding": [1.0, 0.0, 0.0], "k": 1}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], "a");
    assert!(results[0]["distance"].as_f64().unwrap().abs() < 1e-6);
    assert_eq!(results[0]["metadata"]["lang"], "en");
    assert_eq!(body["degraded"], false);

    server.stop().await;
}

#[tokio::test]
async fn test_error_statuses() {
    let server = TestServer::start().await;
    let create = json!({"name": "docs", "dimension": 2, "metric": "l2"});
    assert_eq!(server.post("/collections", create.clone()).await.0, StatusCode::CREATED);

    let (status, body) = server.post("/collections", create.clone()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_exists");

    let mut again = create.clone();
    again["get_or_create"] = json!(true);
    assert_eq!(server.post("/collections", again).await.0, StatusCode::OK);

    let (status, body) = server
        .post(
            "/collections/docs/vectors",
            json!({"id": "a", "embedding": [1.0, 2.0, 3.0]}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "dimension_mismatch");

    let (status, _) = server
        .post("/collections/docs/vectors", json!({"embedding": [1.0]}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = server.get("/collections/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "collection_not_found");

    let (status, _) = server.get("/collections/docs/vectors/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn test_record_lifecycle_over_http() {
    let server = TestServer::start().await;
    server
        .post(
            "/collections",
            json!({"name": "docs", "dimension": 2, "metric": "l2"}),
        )
        .await;

    let (status, body) = server
        .post(
            "/collections/docs/vectors/batch",
            json!({"vectors": [
                {"id": "a", "embedding": [0.0, 0.0], "metadata": {"year": 2020}},
                {"id": "b", "embedding": [1.0, 0.0], "metadata": {"year": 2024}, "document": "bee"}
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"], 2);

    let (status, body) = server.post("/collections/docs/seal", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let segment_id = body["segment_id"].as_u64().unwrap();
    let (_, body) = server.post("/collections/docs/seal", json!({})).await;
    assert_eq!(body["segment_id"].as_u64(), Some(segment_id));

    let (status, _) = server
        .post(
            "/collections/docs/vectors/upsert",
            json!({"id": "a", "embedding": [5.0, 5.0], "metadata": {"year": 2025}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = server.get("/collections/docs/vectors/a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["embedding"], json!([5.0, 5.0]));
    assert_eq!(body["metadata"]["year"], 2025.0);

    let (status, body) = server
        .post(
            "/collections/docs/query",
            json!({
                "embedding": [0.0, 0.0],
                "k": 10,
                "where": {"year": {"$lt": 2025}},
                "include": {"document": true}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["id"], "b");
    assert_eq!(body["results"][0]["document"], "bee");
    assert_eq!(body["results"].as_array().unwrap().len(), 1);

    let (status, body) = server.delete("/collections/docs/vectors/b").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);
    let (_, body) = server.delete("/collections/docs/vectors/b").await;
    assert_eq!(body["deleted"], false);

    let (_, body) = server.get("/collections/docs/count").await;
    assert_eq!(body["count"], 1);

    let (status, body) = server.post("/collections/docs/compact", json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["started"].is_boolean());

    let (status, body) = server.get("/collections").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["collections"], 1);

    let (status, body) = server.delete("/collections/docs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dropped"], "docs");
    assert_eq!(
        server.get("/collections/docs").await.0,
        StatusCode::NOT_FOUND
    );

    server.stop().await;
}
