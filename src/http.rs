//! HTTP CONNECT upgrade: serve RPC on a path of an HTTP listener and dial
//! it from the client, plus a human-readable debug index.
//!
//! The exchange is a fixed plaintext preamble. The client writes
//! `CONNECT /_geerpc_ HTTP/1.0` and a blank line; the server answers with
//! the sentinel status and hijacks the stream for RPC. Nothing else of
//! HTTP is needed, so no HTTP stack is involved.

use std::fmt::Write as _;
use std::sync::Arc;

use log::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::client::{dial_timeout, RpcClient};
use crate::config::RpcOption;
use crate::error::RpcError;
use crate::net::{UnifyListener, UnifyReadHalf, UnifyStream, UnifyWriteHalf};
use crate::server::RpcServer;

/// Path hijacked for RPC traffic.
pub const DEFAULT_RPC_PATH: &str = "/_geerpc_";
/// Path serving the service index.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/geerpc";
/// Status sent once the stream is hijacked.
pub const CONNECTED: &str = "200 Connected to GeeRPC";

impl RpcServer {
    /// Accept connections and speak HTTP on each: CONNECT on
    /// [DEFAULT_RPC_PATH] upgrades to RPC, GET on [DEFAULT_DEBUG_PATH]
    /// serves the service index.
    pub async fn accept_http(self: Arc<Self>, mut listener: UnifyListener) {
        loop {
            match listener.accept().await {
                Err(e) => {
                    warn!("rpc server: accept error: {}", e);
                    return;
                }
                Ok(stream) => {
                    debug!("rpc server: http connection {}", stream);
                    let server = self.clone();
                    tokio::spawn(server.serve_http(stream));
                }
            }
        }
    }

    /// Handle a single HTTP connection.
    pub async fn serve_http(self: Arc<Self>, stream: UnifyStream) {
        let (rh, wh) = stream.into_split();
        let mut reader = BufReader::new(rh);
        let mut writer = wh;

        let mut request_line = String::new();
        match reader.read_line(&mut request_line).await {
            Err(e) => {
                debug!("rpc server: http read err: {}", e);
                return;
            }
            Ok(0) => return,
            Ok(_) => {}
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();
        if drain_header_lines(&mut reader).await.is_err() {
            return;
        }

        match (method.as_str(), path.as_str()) {
            ("CONNECT", p) if p == DEFAULT_RPC_PATH => {
                let status = format!("HTTP/1.0 {}\r\n\r\n", CONNECTED);
                if writer.write_all(status.as_bytes()).await.is_err() {
                    return;
                }
                self.serve_parts(reader, writer).await;
            }
            (_, p) if p == DEFAULT_RPC_PATH => {
                let _ = respond(
                    &mut writer,
                    "405 Method Not Allowed",
                    "text/plain; charset=utf-8",
                    "405 must CONNECT\n",
                )
                .await;
            }
            ("GET", p) if p == DEFAULT_DEBUG_PATH => {
                let body = self.debug_html();
                let _ = respond(&mut writer, "200 OK", "text/html; charset=utf-8", &body).await;
            }
            _ => {
                let _ = respond(
                    &mut writer,
                    "404 Not Found",
                    "text/plain; charset=utf-8",
                    "404 page not found\n",
                )
                .await;
            }
        }
    }

    /// Render the registered services, their methods and call counts.
    pub fn debug_html(&self) -> String {
        let mut body = String::new();
        body.push_str("<html><body><title>GeeRPC Services</title>\n");
        for svc in self.service_list() {
            let _ = write!(
                body,
                "<hr>Service {}<hr><table><th align=center>Method</th><th align=center>Calls</th>\n",
                svc.name()
            );
            let mut methods: Vec<_> = svc.methods().map(|(name, m)| (name.to_string(), m.num_calls())).collect();
            methods.sort();
            for (name, calls) in methods {
                let _ = write!(
                    body,
                    "<tr><td align=left font=fixed>{}.{}</td><td align=center>{}</td></tr>\n",
                    svc.name(),
                    name,
                    calls
                );
            }
            body.push_str("</table>\n");
        }
        body.push_str("</body></html>");
        body
    }
}

async fn drain_header_lines(reader: &mut BufReader<UnifyReadHalf>) -> std::io::Result<()> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            return Ok(());
        }
    }
}

async fn respond(
    writer: &mut UnifyWriteHalf, status: &str, content_type: &str, body: &str,
) -> std::io::Result<()> {
    let resp = format!(
        "HTTP/1.0 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    writer.write_all(resp.as_bytes()).await?;
    writer.shutdown().await
}

/// Accept HTTP upgrade connections on the default server.
pub async fn accept_http(listener: UnifyListener) {
    crate::server::default_server().accept_http(listener).await
}

/// Dial an HTTP listener and upgrade to RPC with a CONNECT exchange.
pub async fn dial_http(
    network: &str, address: &str, opt: Option<RpcOption>,
) -> Result<RpcClient, RpcError> {
    dial_timeout(new_http_client, network, address, opt).await
}

/// The client half of the upgrade. Bounded by the caller's ConnectTimeout
/// through [dial_timeout]; on a non-success status the socket is shut down
/// before the error returns.
async fn new_http_client(stream: UnifyStream, opt: RpcOption) -> Result<RpcClient, RpcError> {
    let (rh, wh) = stream.into_split();
    let mut reader = BufReader::new(rh);
    let mut writer = wh;

    let connect = format!("CONNECT {} HTTP/1.0\r\n\r\n", DEFAULT_RPC_PATH);
    writer.write_all(connect.as_bytes()).await?;

    let mut status = String::new();
    reader.read_line(&mut status).await?;
    let status = status.trim_end();
    if status != format!("HTTP/1.0 {}", CONNECTED) {
        warn!("rpc client: unexpected HTTP response: {}", status);
        let _ = writer.shutdown().await;
        return Err(RpcError::HttpConnect(status.to_string()));
    }
    drain_header_lines(&mut reader).await?;

    RpcClient::from_parts(reader, writer, opt).await
}
