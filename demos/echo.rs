//! Echo server: HTTP on `/echo` and `/hello/<name>`, WebSocket on `/ws`.
//!
//! ```text
//! cargo run --example echo -- 127.0.0.1:8080 [config.json]
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use wirecore::http::{HttpError, Method, Response, StatusCode};
use wirecore::realtime::{CloseCode, Message, WebSocket, WebSocketHandler};
use wirecore::router::Dispatcher;
use wirecore::server::Server;
use wirecore::ServerConfig;

struct Echo;

impl WebSocketHandler for Echo {
    fn on_open(&mut self, ws: &WebSocket) {
        tracing::info!(peer = ?ws.peer_addr(), "websocket opened");
        if let Err(e) = ws.set_auto_ping(Duration::from_secs(30), Duration::from_secs(10)) {
            tracing::warn!(error = %e, "failed to start keepalive");
        }
    }

    fn on_message(&mut self, ws: &WebSocket, message: Message) {
        let sent = match message {
            Message::Text(text) if text == "bye" => ws.close(CloseCode::Normal, "bye"),
            Message::Text(text) => ws.text(&text),
            Message::Binary(data) => ws.binary(&data),
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "echo failed");
        }
    }

    fn on_close(&mut self, ws: &WebSocket, code: CloseCode, reason: &str) {
        tracing::info!(peer = ?ws.peer_addr(), %code, reason, "websocket closed");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wirecore=debug,echo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:8080".to_owned());
    let config = match args.next() {
        Some(path) => ServerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.handle("/echo", &[Method::Get, Method::Post], |req, _caps| {
        let body = json!({
            "method": req.method().as_str(),
            "path": req.path(),
            "query": req.query_string(),
            "body": String::from_utf8_lossy(req.body()),
        });
        let response = Response::new(StatusCode::Ok)
            .json(&body)
            .map_err(HttpError::internal)?;
        Ok(Some(response))
    })?;
    dispatcher.get(r"/hello/(\w+)", |_req, caps| {
        let name = caps.get(0).unwrap_or("world");
        Ok(Some(Response::new(StatusCode::Ok).body(format!("Hello, {name}!\n"))))
    })?;
    dispatcher.websocket("/ws", |_req, _caps| Some(Box::new(Echo)))?;

    let mut server = Server::with_config(dispatcher, config)?;
    server.bind(&addr).await?;
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
