//! Endpoint server exposing Prometheus metrics and a health check

use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve `/metrics` and `/health` until shutdown
pub async fn endpoint_server(port: u16, metrics: Arc<Metrics>, shutdown: Shutdown) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "metrics endpoint listening");
    serve(listener, metrics, shutdown).await;
    Ok(())
}

pub async fn serve(listener: TcpListener, metrics: Arc<Metrics>, mut shutdown: Shutdown) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.triggered() => {
                tracing::debug!("metrics endpoint stopping");
                return;
            }
        };
        match accepted {
            Ok((mut socket, _peer)) => {
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    let mut buf = [0; 1024];
                    match socket.read(&mut buf).await {
                        Ok(n) => {
                            let response = respond(&buf[..n], &metrics);
                            let _ = socket.write_all(response.as_bytes()).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to read from socket");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to accept connection");
            }
        }
    }
}

fn respond(request: &[u8], metrics: &Metrics) -> String {
    let request = String::from_utf8_lossy(request);
    let path = request.split_whitespace().nth(1).unwrap_or("/");
    let (status, body) = match path {
        "/metrics" => ("200 OK", metrics.render()),
        "/health" => ("200 OK", "ok".to_string()),
        _ => ("404 Not Found", "not found".to_string()),
    };
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_respond_routes() {
        let metrics = Metrics::new().unwrap();
        metrics.inc_lifecycle(&metrics.registrations, "allo1x", 1, Role::Reputer);

        let ok = respond(b"GET /metrics HTTP/1.1\r\n\r\n", &metrics);
        assert!(ok.starts_with("HTTP/1.1 200 OK"));
        assert!(ok.contains("offchain_registrations_total"));

        let health = respond(b"GET /health HTTP/1.1\r\n\r\n", &metrics);
        assert!(health.ends_with("ok"));

        let missing = respond(b"GET /nope HTTP/1.1\r\n\r\n", &metrics);
        assert!(missing.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, shutdown) = crate::shutdown::channel();
        let server = tokio::spawn(serve(listener, metrics, shutdown));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /health HTTP/1.1\r\n\r\n").await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.contains("200 OK"));

        trigger.trigger();
        server.await.unwrap();
    }
}
