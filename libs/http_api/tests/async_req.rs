use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;
use qhttp::{Response, Server, ServerConfig};

use http_api::async_req::{AsyncReq, HostPortProvider, State};
use http_api::{Error, Method};

async fn echo_server() -> Server {
    let server = Server::new(ServerConfig {
        request_timeout: Duration::from_secs(10),
        ..ServerConfig::default()
    });
    server
        .add_handler(hyper::Method::GET, "/simple", |_req| async {
            Ok(Response::ok())
        })
        .unwrap();
    server
        .add_handler(hyper::Method::GET, "/large", |_req| async {
            Ok(Response::text(
                StatusCode::OK,
                vec![b'x'; 1024],
                "application/octet-stream",
            ))
        })
        .unwrap();
    server
        .add_handler(hyper::Method::GET, "/slow-2500", |_req| async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            Ok(Response::ok())
        })
        .unwrap();
    server
        .add_handler(hyper::Method::GET, "/slow-2000", |_req| async {
            tokio::time::sleep(Duration::from_millis(2000)).await;
            Ok(Response::ok())
        })
        .unwrap();
    server.start().await.unwrap();
    server
}

#[tokio::test(flavor = "multi_thread")]
async fn simple_get() {
    let server = echo_server().await;
    let headers = HashMap::from([
        ("Header-1".to_owned(), "A".to_owned()),
        ("Header-2".to_owned(), "B".to_owned()),
    ]);
    let req = AsyncReq::new(
        Method::Get,
        &format!("http://127.0.0.1:{}/simple", server.port()),
        "abcdefg",
        headers,
    )
    .unwrap();
    req.start().unwrap();
    req.wait().await;

    assert_eq!(req.state(), State::Finished);
    assert_eq!(req.response_code().unwrap(), 200);
    assert_eq!(
        req.response_header("Content-Length").unwrap().as_deref(),
        Some("0")
    );
    assert_eq!(
        req.response_header("Content-Type").unwrap().as_deref(),
        Some("text/html")
    );
    assert_eq!(req.response_body_size().unwrap(), 0);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn body_limit_error_preserves_the_header() {
    let server = echo_server().await;
    let req = AsyncReq::new(
        Method::Get,
        &format!("http://127.0.0.1:{}/large", server.port()),
        "",
        HashMap::new(),
    )
    .unwrap();
    req.set_max_response_body_size(1023);
    req.start().unwrap();
    req.wait().await;

    assert_eq!(req.state(), State::BodyLimitError);
    assert_eq!(req.response_code().unwrap(), 200);
    assert_eq!(
        req.response_header("Content-Length").unwrap().as_deref(),
        Some("1024")
    );
    assert!(matches!(req.response_body(), Err(Error::Logic(_))));
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn expiration_wins_over_a_slow_handler() {
    let server = echo_server().await;
    let req = AsyncReq::new(
        Method::Get,
        &format!("http://127.0.0.1:{}/slow-2500", server.port()),
        "",
        HashMap::new(),
    )
    .unwrap();
    req.set_expiration(Duration::from_secs(2));
    req.start().unwrap();
    req.wait().await;

    assert_eq!(req.state(), State::Expired);
    assert!(matches!(req.response_code(), Err(Error::Logic(_))));
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_in_flight() {
    let server = echo_server().await;
    let req = AsyncReq::new(
        Method::Get,
        &format!("http://127.0.0.1:{}/slow-2000", server.port()),
        "",
        HashMap::new(),
    )
    .unwrap();
    req.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(req.cancel());
    assert_eq!(req.state(), State::Cancelled);
    // Cancelling a request in a terminal state reports 'false'.
    assert!(!req.cancel());
    // A cancelled request cannot be restarted.
    assert!(matches!(req.start(), Err(Error::Logic(_))));
    req.wait().await;
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn dynamic_endpoint_recovery() {
    let server = echo_server().await;
    let port = server.port();

    let calls = Arc::new(AtomicUsize::new(0));
    let provider: HostPortProvider = {
        let calls = calls.clone();
        Arc::new(move || {
            // The first call fails (the previous endpoint is reused), the
            // second reports a dead endpoint, the third recovers.
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::InvalidArgument("registry unavailable".to_owned())),
                1 => Ok(("127.0.0.1".to_owned(), 1)),
                _ => Ok(("127.0.0.1".to_owned(), port)),
            }
        })
    };

    // The base URL points to a dead endpoint as well, so only the third
    // provider call lets the request through.
    let req = AsyncReq::new(Method::Get, "http://127.0.0.1:1/simple", "", HashMap::new()).unwrap();
    req.set_host_port_provider(provider);
    req.set_expiration(Duration::from_secs(20));
    req.start().unwrap();
    req.wait().await;

    assert_eq!(req.state(), State::Finished);
    assert_eq!(req.response_code().unwrap(), 200);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_callback_fires_exactly_once() {
    let server = echo_server().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let req = AsyncReq::new(
        Method::Get,
        &format!("http://127.0.0.1:{}/simple", server.port()),
        "",
        HashMap::new(),
    )
    .unwrap();
    req.set_on_finish(Box::new(move |req| {
        let _ = tx.send(req.state());
    }));
    req.start().unwrap();

    assert_eq!(rx.recv().await, Some(State::Finished));
    assert!(rx.try_recv().is_err());
    server.stop();
}
