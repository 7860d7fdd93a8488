// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 端到端测试：在随机端口上启动服务器，直接通过 TCP 发送原始 HTTP 报文。

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};
use trowel::{
    AppState, Config, Exception, Http, Request, ResponseWriter, Server, ServerHandle,
};

async fn start(server: Server) -> (SocketAddr, ServerHandle, JoinHandle<Result<(), Exception>>) {
    let listening = server.listen().await.unwrap();
    let addr = listening.local_addr().unwrap();
    let handle = listening.shutdown_handle();
    (addr, handle, tokio::spawn(listening.serve()))
}

async fn send(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buffer = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buffer))
        .await
        .expect("响应超时")
        .unwrap();
    String::from_utf8_lossy(&buffer).to_string()
}

fn status_of(response: &str) -> u16 {
    response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn header_of<'r>(response: &'r str, name: &str) -> Option<&'r str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines()
        .skip(1)
        .filter_map(|line| line.split_once(": "))
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

fn local_config() -> Config {
    Config::new().set_local(true).set_http_port(0)
}

fn demo_server() -> Server {
    let mut server = Server::new(local_config()).unwrap();
    server.service("/add", |http: &mut Http| {
        let sum = http.get_i("a")? + http.get_i("b")?;
        http.write_str(&sum.to_string());
        Ok(())
    });
    server.service("/count", |http: &mut Http| {
        let session = http.session();
        let n = session.get("n").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
        session.set("n", &n)?;
        http.write_str(&n.to_string());
        Ok(())
    });
    server.service("/user/", |http: &mut Http| {
        let (mut id, mut action) = (String::new(), String::new());
        http.url_param("user", &mut [&mut id, &mut action])?;
        http.json(&serde_json::json!({ "id": id, "action": action }));
        Ok(())
    });
    server.handle(
        "/raw",
        |_: &Arc<AppState>, _: &Request, w: &mut dyn ResponseWriter| {
            w.write_header(202);
            w.write_str("raw");
        },
    );
    server.jump_mapping("/old", "/add");
    server
}

#[tokio::test]
async fn test_service_reads_query_and_form() {
    let (addr, handle, _) = start(demo_server()).await;

    let resp = send(addr, "GET /add?a=2&b=40 HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&resp), 200);
    assert_eq!(header_of(&resp, "Cache-Control"), Some("no-store"));
    assert_eq!(body_of(&resp), "42");

    let resp = send(
        addr,
        "POST /add HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n\r\na=1&b=2",
    )
    .await;
    assert_eq!(body_of(&resp), "3");

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_bad_parameter_reaches_error_handler() {
    let (addr, handle, _) = start(demo_server()).await;

    let resp = send(addr, "GET /add?a=x&b=1 HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&resp), 400);
    assert!(body_of(&resp).starts_with("<p>Service Error</p>"));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_session_cookie_round_trip() {
    let (addr, handle, _) = start(demo_server()).await;

    let first = send(addr, "GET /count HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(body_of(&first), "1");
    let set_cookie = header_of(&first, "Set-Cookie").expect("缺少 Set-Cookie");
    assert!(set_cookie.contains("HttpOnly"));
    let cookie = set_cookie.split(';').next().unwrap();

    let raw = format!("GET /count HTTP/1.1\r\nHost: x\r\nCookie: {}\r\n\r\n", cookie);
    let second = send(addr, &raw).await;
    assert_eq!(body_of(&second), "2");
    assert!(header_of(&second, "Set-Cookie").is_none());

    // 被篡改的 Cookie 会得到新的会话
    let raw = format!("GET /count HTTP/1.1\r\nHost: x\r\nCookie: {}x\r\n\r\n", cookie);
    assert_eq!(body_of(&send(addr, &raw).await), "1");

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_url_param_json() {
    let (addr, handle, _) = start(demo_server()).await;

    let resp = send(addr, "GET /user/7/edit HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&resp), 200);
    assert_eq!(
        header_of(&resp, "Content-Type"),
        Some("application/json; charset=utf-8")
    );
    let value: serde_json::Value = serde_json::from_str(body_of(&resp).trim()).unwrap();
    assert_eq!(value["id"], "7");
    assert_eq!(value["action"], "edit");

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_routing_edges() {
    let (addr, handle, _) = start(demo_server()).await;

    let resp = send(addr, "GET /raw HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&resp), 202);
    assert_eq!(body_of(&resp), "raw");

    let resp = send(addr, "GET /old HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&resp), 301);
    assert_eq!(header_of(&resp, "Location"), Some("/add"));

    let resp = send(addr, "HEAD /old HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&resp), 405);

    let resp = send(addr, "GET /user HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&resp), 301);
    assert_eq!(header_of(&resp, "Location"), Some("/user/"));

    let resp = send(addr, "GET /nothing HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&resp), 404);
    assert_eq!(header_of(&resp, "Connection"), Some("close"));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_malformed_and_oversized_requests() {
    let config = Config::from_toml_str("http_port = 0\nlocal = true\nmax_request_size = 256\n")
        .unwrap();
    let mut server = Server::new(config).unwrap();
    server.service("/", |http: &mut Http| {
        http.write_str("ok");
        Ok(())
    });
    let (addr, handle, _) = start(server).await;

    let resp = send(addr, "NONSENSE\r\n\r\n").await;
    assert!((400..500).contains(&status_of(&resp)));

    let resp = send(
        addr,
        "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10000\r\n\r\n",
    )
    .await;
    assert_eq!(status_of(&resp), 413);

    let resp = send(addr, "HEAD / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&resp), 200);
    assert_eq!(header_of(&resp, "Content-Length"), Some("2"));
    assert_eq!(body_of(&resp), "");

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}
