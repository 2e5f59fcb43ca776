use std::net::SocketAddr;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tunnelboard::config::Config;
use tunnelboard::service::Service;

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.server.addr = "127.0.0.1:0".to_string();
    cfg.streaming.dashboard_interval = Duration::from_millis(50);
    cfg.streaming.tunnel_interval = Duration::from_millis(50);
    cfg.streaming.monitor_interval = Duration::from_millis(50);
    cfg
}

async fn start_service() -> (Service, SocketAddr) {
    let mut service = Service::new(test_config()).expect("service");
    let addr = service.start().await.expect("start");
    (service, addr)
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

async fn json_body(resp: Response) -> Value {
    resp.json::<Value>().await.expect("json body")
}

async fn post_update(client: &Client, addr: SocketAddr, endpoint: &str, body: Value) -> Response {
    client
        .post(url(addr, &format!("/api/ingest/endpoints/{endpoint}/tunnels")))
        .json(&body)
        .send()
        .await
        .expect("post update")
}

/// Reads SSE chunks until `count` data frames arrive.
async fn read_sse_frames(resp: &mut Response, count: usize) -> Vec<Value> {
    let mut buf = String::new();
    let mut frames = Vec::new();

    while frames.len() < count {
        let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
            .await
            .expect("sse chunk in time")
            .expect("sse read")
            .expect("sse stream open");
        buf.push_str(std::str::from_utf8(&chunk).expect("utf8 chunk"));

        while let Some(end) = buf.find("\n\n") {
            let event: String = buf.drain(..end + 2).collect();
            for line in event.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    frames.push(serde_json::from_str(data.trim()).expect("frame json"));
                }
            }
        }
    }

    frames
}

#[tokio::test]
async fn ingest_then_poll_routes() {
    let (mut service, addr) = start_service().await;
    let client = Client::new();

    let resp = client
        .post(url(addr, "/api/ingest/endpoints"))
        .json(&json!({
            "endpointId": "E1",
            "host": { "name": "edge-1", "url": "https://edge-1.example" }
        }))
        .send()
        .await
        .expect("register");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["created"], json!(true));

    let resp = post_update(
        &client,
        addr,
        "E1",
        json!({ "instanceId": "T1", "status": "running", "tcpRxBytes": 100, "tcpTxBytes": 50 }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["outcome"], json!("created"));

    let resp = post_update(
        &client,
        addr,
        "E1",
        json!({ "instanceId": "T2", "status": "stopped", "udpRxBytes": 7 }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(
        client
            .get(url(addr, "/api/dashboard"))
            .send()
            .await
            .expect("dashboard"),
    )
    .await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["source"], json!("memory"));
    assert_eq!(body["data"]["rollup"]["endpoints"]["total"], json!(1));
    assert_eq!(body["data"]["rollup"]["tunnels"]["total"], json!(2));
    assert_eq!(body["data"]["rollup"]["tunnels"]["running"], json!(1));
    assert_eq!(body["data"]["rollup"]["totalBytes"], json!(157));
    assert_eq!(body["data"]["rollup"]["totalRx"], json!(107));

    let body = json_body(
        client
            .get(url(addr, "/api/endpoints"))
            .send()
            .await
            .expect("endpoints"),
    )
    .await;
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["data"][0]["host"]["name"], json!("edge-1"));

    let body = json_body(
        client
            .get(url(addr, "/api/endpoints/E1"))
            .send()
            .await
            .expect("endpoint"),
    )
    .await;
    let tunnels = body["data"]["tunnels"].as_array().expect("tunnels");
    assert_eq!(tunnels.len(), 2);
    assert_eq!(tunnels[0]["instanceId"], json!("T1"));
    assert_eq!(body["data"]["stats"]["totalRx"], json!(107));
    assert_eq!(body["data"]["stats"]["totalTx"], json!(50));

    let body = json_body(
        client
            .get(url(addr, "/api/endpoints/E1/tunnels/T1"))
            .send()
            .await
            .expect("tunnel"),
    )
    .await;
    assert_eq!(body["data"]["endpointId"], json!("E1"));
    assert_eq!(body["data"]["endpointName"], json!("edge-1"));
    assert_eq!(body["data"]["tcpRxBytes"], json!(100));

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn malformed_and_unknown_requests() {
    let (mut service, addr) = start_service().await;
    let client = Client::new();

    let resp = post_update(&client, addr, "bad%20id", json!({ "instanceId": "T1" })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["success"], json!(false));

    let resp = post_update(&client, addr, "E1", json!({ "status": "running" })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .get(url(addr, "/api/endpoints/E9"))
        .send()
        .await
        .expect("unknown endpoint");
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"], Value::Null);

    let resp = client
        .get(url(addr, "/api/endpoints/E9/tunnels/T1"))
        .send()
        .await
        .expect("unknown tunnel");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["success"], json!(false));

    let resp = client
        .get(url(addr, "/api/endpoints/E1/trend?hours=abc"))
        .send()
        .await
        .expect("bad hours");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn stale_update_is_rejected() {
    let (mut service, addr) = start_service().await;
    let client = Client::new();

    let resp = post_update(
        &client,
        addr,
        "E1",
        json!({ "instanceId": "T1", "tcpRxBytes": 10, "eventTime": "2026-03-01T12:00:00Z" }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = post_update(
        &client,
        addr,
        "E1",
        json!({ "instanceId": "T1", "tcpRxBytes": 20, "eventTime": "2026-03-01T11:59:00Z" }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let tunnel = service.registry().tunnel("E1", "T1").expect("tunnel");
    assert_eq!(tunnel.tunnel.counters.tcp_rx_bytes, 10);

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn trend_hours_are_clamped() {
    let (mut service, addr) = start_service().await;
    let client = Client::new();

    post_update(&client, addr, "E1", json!({ "instanceId": "T1", "tcpRxBytes": 1 })).await;

    for (query, expected) in [("", 24), ("?hours=0", 1), ("?hours=500", 168), ("?hours=6", 6)] {
        let body = json_body(
            client
                .get(url(addr, &format!("/api/endpoints/E1/trend{query}")))
                .send()
                .await
                .expect("trend"),
        )
        .await;
        assert_eq!(body["hours"], json!(expected), "query {query:?}");
    }

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn full_report_and_removal() {
    let (mut service, addr) = start_service().await;
    let client = Client::new();

    post_update(&client, addr, "E1", json!({ "instanceId": "T0", "status": "running" })).await;

    let resp = client
        .put(url(addr, "/api/ingest/endpoints/E1/tunnels"))
        .json(&json!({
            "tunnels": [
                { "instanceId": "T1", "status": "running" },
                { "instanceId": "T2", "status": "error" }
            ]
        }))
        .send()
        .await
        .expect("full report");
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["data"]["created"], json!(2));
    assert_eq!(body["data"]["markedStopped"], json!(["T0"]));

    let resp = client
        .delete(url(addr, "/api/ingest/endpoints/E1/tunnels/T2"))
        .send()
        .await
        .expect("remove tunnel");
    assert_eq!(json_body(resp).await["removed"], json!(true));
    assert!(service.registry().find_tunnel("T2").is_none());

    let resp = client
        .delete(url(addr, "/api/ingest/endpoints/E1"))
        .send()
        .await
        .expect("remove endpoint");
    assert_eq!(json_body(resp).await["removed"], json!(true));
    assert!(service.registry().get("E1").is_none());
    assert!(service.registry().find_tunnel("T1").is_none());

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn dashboard_sse_acks_then_streams() {
    let (mut service, addr) = start_service().await;
    let client = Client::new();

    post_update(&client, addr, "E1", json!({ "instanceId": "T1", "tcpRxBytes": 5 })).await;

    let mut resp = client
        .get(url(addr, "/api/sse/dashboard"))
        .send()
        .await
        .expect("sse");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );

    let frames = read_sse_frames(&mut resp, 2).await;
    assert_eq!(frames[0]["type"], json!("connected"));
    assert_eq!(frames[0]["kind"], json!("dashboard_stream"));
    assert_eq!(frames[1]["type"], json!("dashboard"));
    assert_eq!(frames[1]["rollup"]["endpoints"]["total"], json!(1));

    drop(resp);
    service.stop().await.expect("stop");
}

#[tokio::test]
async fn tunnel_sse_reports_owning_endpoint() {
    let (mut service, addr) = start_service().await;
    let client = Client::new();

    post_update(&client, addr, "E2", json!({ "instanceId": "T7", "status": "running" })).await;

    let mut resp = client
        .get(url(addr, "/api/sse/tunnel/T7"))
        .send()
        .await
        .expect("sse");
    let frames = read_sse_frames(&mut resp, 2).await;
    assert_eq!(frames[0]["type"], json!("connected"));
    assert_eq!(frames[0]["target"], json!("T7"));
    assert_eq!(frames[0]["tunnel"]["endpointId"], json!("E2"));
    assert_eq!(frames[1]["type"], json!("tunnel"));
    assert_eq!(frames[1]["tunnel"]["instanceId"], json!("T7"));
    drop(resp);

    let mut resp = client
        .get(url(addr, "/api/sse/tunnel/T404"))
        .send()
        .await
        .expect("sse");
    let frames = read_sse_frames(&mut resp, 2).await;
    assert!(frames[0].get("tunnel").is_none());
    assert_eq!(frames[1]["type"], json!("tunnel_not_found"));
    assert_eq!(frames[1]["instanceId"], json!("T404"));
    drop(resp);

    service.stop().await.expect("stop");
}

#[tokio::test]
async fn metrics_and_health() {
    let (mut service, addr) = start_service().await;
    let client = Client::new();

    post_update(&client, addr, "E1", json!({ "instanceId": "T1", "status": "running" })).await;

    let resp = client
        .get(url(addr, "/healthz"))
        .send()
        .await
        .expect("healthz");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.expect("text"), "ok");

    let text = client
        .get(url(addr, "/metrics"))
        .send()
        .await
        .expect("metrics")
        .text()
        .await
        .expect("text");
    assert!(text.contains("tunnelboard_endpoints_tracked 1"));
    assert!(text.contains("tunnelboard_tunnels_tracked{status=\"running\"} 1"));
    assert!(text.contains("tunnelboard_ingest_updates_total{outcome=\"created\"} 1"));

    let body = json_body(
        client
            .get(url(addr, "/api/stats"))
            .send()
            .await
            .expect("stats"),
    )
    .await;
    assert_eq!(body["data"]["endpoints"], json!(1));

    service.stop().await.expect("stop");
}
