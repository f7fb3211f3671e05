//! Parameter synchronization endpoint.
//!
//! One peer at a time sends newline-delimited JSON requests
//!
//! ```text
//! {"version": 4, "parameter_name": "exposure_time", "value": 25.0}
//! ```
//!
//! and gets exactly one response line per request
//!
//! ```text
//! {"status": "ok", "version": 4}
//! {"status": "rejected", "reason": "stale version 3: current version is 4", "version": 4}
//! {"status": "busy", "reason": "...", "version": 4}
//! ```
//!
//! `version` in a response is always the Controller's current version, so a
//! peer can resynchronize after a rejection.

use crate::app_config::SocketConfig;
use crate::core::controller::ControllerHandle;
use crate::core::parameters::{ParameterName, ParameterUpdate, ParameterValue};
use crate::errors::{ProtocolError, UpdateRejection};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub version: u64,
    pub parameter_name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Rejected,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub version: u64,
}

impl UpdateResponse {
    pub fn ok(version: u64) -> Self {
        UpdateResponse {
            status: ResponseStatus::Ok,
            reason: None,
            version,
        }
    }

    pub fn rejected(reason: impl Into<String>, version: u64) -> Self {
        UpdateResponse {
            status: ResponseStatus::Rejected,
            reason: Some(reason.into()),
            version,
        }
    }

    pub fn busy(version: u64) -> Self {
        UpdateResponse {
            status: ResponseStatus::Busy,
            reason: Some("another peer is already connected".to_string()),
            version,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    TooLong,
    Eof,
}

pub struct ConnectionWorker {
    listener: TcpListener,
    controller: ControllerHandle,
    max_line_bytes: usize,
    session: Arc<Semaphore>,
}

impl ConnectionWorker {
    pub async fn bind(config: &SocketConfig, controller: ControllerHandle) -> io::Result<Self> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("🔌 Parameter sync listening on {}", listener.local_addr()?);
        Ok(ConnectionWorker {
            listener,
            controller,
            max_line_bytes: config.max_line_bytes,
            session: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Accepts peers until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => self.admit(socket, addr, shutdown.clone()),
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
        info!("Parameter sync endpoint stopped");
    }

    fn admit(&self, socket: TcpStream, addr: SocketAddr, shutdown: watch::Receiver<bool>) {
        let controller = self.controller.clone();
        match Arc::clone(&self.session).try_acquire_owned() {
            Ok(permit) => {
                let max_line_bytes = self.max_line_bytes;
                tokio::spawn(async move {
                    if let Err(e) = handle_peer(socket, addr, controller, max_line_bytes, shutdown, permit).await {
                        warn!("Peer {} error: {}", addr, e);
                    }
                });
            }
            Err(_) => {
                tokio::spawn(async move {
                    info!("Refusing {}: a peer is already connected", addr);
                    let version = controller.current_version().await.unwrap_or(0);
                    let (_, mut writer) = socket.into_split();
                    if let Err(e) = write_response(&mut writer, &UpdateResponse::busy(version)).await {
                        debug!("Could not tell {} it is refused: {}", addr, e);
                    }
                    let _ = writer.shutdown().await;
                });
            }
        }
    }
}

async fn handle_peer(
    socket: TcpStream,
    addr: SocketAddr,
    controller: ControllerHandle,
    max_line_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
    _permit: OwnedSemaphorePermit,
) -> io::Result<()> {
    info!("Peer connected: {}", addr);
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        let read = tokio::select! {
            read = read_bounded_line(&mut reader, &mut line, max_line_bytes) => read?,
            _ = shutdown.changed() => break,
        };
        let response = match read {
            LineRead::Eof => break,
            LineRead::TooLong => {
                let reason = ProtocolError::LineTooLong { limit: max_line_bytes }.to_string();
                warn!("Peer {}: {}", addr, reason);
                rejection(&controller, reason).await
            }
            LineRead::Line => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches('\r');
                if text.trim().is_empty() {
                    continue;
                }
                process_request(text, &controller).await
            }
        };
        write_response(&mut writer, &response).await?;
    }

    info!("Peer {} disconnected", addr);
    Ok(())
}

async fn process_request(text: &str, controller: &ControllerHandle) -> UpdateResponse {
    let request: UpdateRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => return rejection(controller, ProtocolError::Malformed(e.to_string()).to_string()).await,
    };
    let name: ParameterName = match request.parameter_name.parse() {
        Ok(name) => name,
        Err(e) => return rejection(controller, UpdateRejection::Configuration(e).to_string()).await,
    };
    let value: ParameterValue = match serde_json::from_value(request.value) {
        Ok(value) => value,
        Err(e) => {
            let reason = ProtocolError::Malformed(format!("value of '{}': {}", name, e));
            return rejection(controller, reason.to_string()).await;
        }
    };

    match controller
        .apply_parameter_update(ParameterUpdate::new(request.version, name, value))
        .await
    {
        Ok(ack) => UpdateResponse::ok(ack.version),
        Err(rejected) => {
            debug!("Update to version {} rejected: {}", request.version, rejected);
            rejection(controller, rejected.to_string()).await
        }
    }
}

async fn rejection(controller: &ControllerHandle, reason: String) -> UpdateResponse {
    match controller.current_version().await {
        Ok(version) => UpdateResponse::rejected(reason, version),
        Err(e) => UpdateResponse::rejected(format!("{} ({})", reason, e), 0),
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &UpdateResponse) -> io::Result<()> {
    let mut bytes = serde_json::to_vec(response).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Reads up to the next `\n` into `line` (without it). A line longer than
/// `limit` is consumed entirely and reported as `TooLong`.
async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead> {
    line.clear();
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if overflow {
                LineRead::TooLong
            } else if line.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line
            });
        }
        let newline = available.iter().position(|b| *b == b'\n');
        let chunk = match newline {
            Some(i) => &available[..i],
            None => available,
        };
        if !overflow {
            if line.len() + chunk.len() > limit {
                overflow = true;
                line.clear();
            } else {
                line.extend_from_slice(chunk);
            }
        }
        let consumed = newline.map_or(available.len(), |i| i + 1);
        reader.consume(consumed);
        if newline.is_some() {
            return Ok(if overflow { LineRead::TooLong } else { LineRead::Line });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn lines(input: &[u8], limit: usize) -> Vec<(LineRead, String)> {
        let mut reader = BufReader::with_capacity(4, input);
        let mut line = Vec::new();
        let mut out = Vec::new();
        loop {
            let read = read_bounded_line(&mut reader, &mut line, limit).await.unwrap();
            if read == LineRead::Eof {
                return out;
            }
            out.push((read, String::from_utf8(line.clone()).unwrap()));
        }
    }

    #[tokio::test]
    async fn splits_lines_across_small_buffers() {
        let got = lines(b"first\r\nsecond\n\nlast", 64).await;
        assert_eq!(
            got,
            vec![
                (LineRead::Line, "first\r".to_string()),
                (LineRead::Line, "second".to_string()),
                (LineRead::Line, String::new()),
                (LineRead::Line, "last".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn overlong_lines_are_skipped_whole() {
        let got = lines(b"0123456789abcdef\nok\n", 8).await;
        assert_eq!(got[0].0, LineRead::TooLong);
        assert_eq!(got[1], (LineRead::Line, "ok".to_string()));
    }

    #[test]
    fn response_wire_format() {
        let ok = serde_json::to_string(&UpdateResponse::ok(3)).unwrap();
        assert_eq!(ok, r#"{"status":"ok","version":3}"#);
        let busy: UpdateResponse = serde_json::from_str(r#"{"status":"busy","reason":"x","version":1}"#).unwrap();
        assert_eq!(busy.status, ResponseStatus::Busy);
    }
}
