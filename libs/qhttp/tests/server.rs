use std::time::Duration;

use hyper::{Method, StatusCode};
use qhttp::{Response, Server, ServerConfig};

fn test_server() -> Server {
    Server::new(ServerConfig {
        request_timeout: Duration::from_secs(5),
        ..ServerConfig::default()
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn routing_and_captures() {
    let server = test_server();
    server
        .add_handler(Method::GET, "/meta/version", |_req| async {
            Ok(Response::json(
                StatusCode::OK,
                &serde_json::json!({"version": 1}),
            ))
        })
        .unwrap();
    server
        .add_handler(Method::GET, "/ingest/table/:database/:table", |req| async move {
            Ok(Response::json(
                StatusCode::OK,
                &serde_json::json!({
                    "database": req.params["database"],
                    "table": req.params["table"],
                    "force": req.query.get("force").cloned().unwrap_or_default(),
                }),
            ))
        })
        .unwrap();
    server.start().await.unwrap();
    let base = format!("http://127.0.0.1:{}", server.port());

    let body: serde_json::Value = reqwest::get(format!("{base}/meta/version"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["version"], 1);

    let body: serde_json::Value =
        reqwest::get(format!("{base}/ingest/table/user_demo/t1?force=1"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(body["database"], "user_demo");
    assert_eq!(body["table"], "t1");
    assert_eq!(body["force"], "1");

    let missing = reqwest::get(format!("{base}/no/such/route")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn dot_dot_paths_escaping_the_root_are_forbidden() {
    let tmp = camino_tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("index.html"), "<html>hi</html>").unwrap();

    let server = test_server();
    server
        .add_static_content("/www/*", tmp.path().as_std_path())
        .unwrap();
    server.start().await.unwrap();
    let base = format!("http://127.0.0.1:{}", server.port());

    let client = reqwest::Client::new();
    let ok = client
        .get(format!("{base}/www/index.html"))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(ok.headers()["content-type"], "text/html");

    // The traversal is rejected before any filesystem access.
    let forbidden = client
        .get(format!("{base}/www/%2e%2e/%2e%2e/etc/passwd"))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_errors_map_to_http_statuses() {
    let server = test_server();
    server
        .add_handler(Method::GET, "/forbidden", |_req| async {
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "nope",
            ))
        })
        .unwrap();
    server
        .add_handler(Method::GET, "/missing", |_req| async {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
        })
        .unwrap();
    server
        .add_handler(Method::GET, "/broken", |_req| async {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        })
        .unwrap();
    server.start().await.unwrap();
    let base = format!("http://127.0.0.1:{}", server.port());

    for (path, status) in [
        ("/forbidden", StatusCode::FORBIDDEN),
        ("/missing", StatusCode::NOT_FOUND),
        ("/broken", StatusCode::INTERNAL_SERVER_ERROR),
    ] {
        let response = reqwest::get(format!("{base}{path}")).await.unwrap();
        assert_eq!(response.status(), status, "{path}");
        let body = response.text().await.unwrap();
        assert!(body.contains(&format!("Code: {}", status.as_u16())), "{path}");
    }

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn ajax_endpoint_flushes_all_pending_requests() {
    let server = test_server();
    let endpoint = server.add_ajax_endpoint("/events/ingest").unwrap();
    server.start().await.unwrap();
    let base = format!("http://127.0.0.1:{}", server.port());

    let client = reqwest::Client::new();
    let pending1 = tokio::spawn(client.get(format!("{base}/events/ingest")).send());
    let pending2 = tokio::spawn(client.get(format!("{base}/events/ingest")).send());

    // Let both requests reach the endpoint, then release them.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(endpoint.num_pending(), 2);
    endpoint.update("{\"chunks\":5}");

    for pending in [pending1, pending2] {
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "{\"chunks\":5}");
    }

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn server_is_restartable() {
    let server = test_server();
    server
        .add_handler(Method::GET, "/ping", |_req| async { Ok(Response::ok()) })
        .unwrap();

    server.start().await.unwrap();
    assert!(server.start().await.is_err());
    let first_base = format!("http://127.0.0.1:{}", server.port());
    assert!(reqwest::get(format!("{first_base}/ping")).await.is_ok());
    server.stop();

    server.start().await.unwrap();
    let second_base = format!("http://127.0.0.1:{}", server.port());
    let response = reqwest::get(format!("{second_base}/ping")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    server.stop();
}
