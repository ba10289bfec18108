//! In-process fake providers for adapter and service tests.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode, Uri},
    Router,
};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct FakeReply {
    status: u16,
    body: String,
    delay: Duration,
}

impl FakeReply {
    pub fn ok(body: Value) -> Self {
        Self::status(200, &body.to_string())
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Value,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<CapturedRequest>>>);

impl Captured {
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.0.lock().expect("lock captured").clone()
    }
}

/**
 * \brief 启动一个对任意路径返回固定响应的本地服务，返回基地址与请求记录。
 */
pub async fn fake_provider(reply: FakeReply) -> (String, Captured) {
    let captured = Captured::default();
    let sink = captured.clone();
    let app = Router::new().fallback(move |uri: Uri, headers: HeaderMap, body: Bytes| {
        let sink = sink.clone();
        let reply = reply.clone();
        async move {
            sink.0.lock().expect("lock captured").push(CapturedRequest {
                path: uri.path().to_string(),
                query: uri.query().map(|q| q.to_string()),
                headers,
                body: serde_json::from_slice(&body).unwrap_or(Value::Null),
            });
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            let status = StatusCode::from_u16(reply.status).expect("valid status");
            (status, reply.body)
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake provider");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve fake provider");
    });
    (format!("http://{}", addr), captured)
}
