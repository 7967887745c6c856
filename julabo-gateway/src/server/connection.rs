//! Per-client connection worker.
//!
//! Lines are decoded with [`LinesCodec`] driven by hand rather than through
//! `FramedRead`, which ends the stream after the first decode error. An
//! oversized or non-UTF-8 line gets an error reply and the connection keeps
//! going.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::protocol::{Response, MAX_MESSAGE_SIZE};
use super::Gateway;
use crate::error::Error;
use crate::tracing::{prelude::*, TRAFFIC_TARGET};

/// Serve requests on `stream` until the client disconnects, goes idle, or
/// `running` is cancelled. Cancellation is only observed between requests.
pub async fn handle_connection<S>(
    gateway: &Gateway,
    mut stream: S,
    client_ip: &str,
    running: CancellationToken,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE);
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        loop {
            let response = match codec.decode(&mut buf) {
                Ok(Some(line)) => match respond(gateway, &line, client_ip).await {
                    Some(response) => response,
                    None => continue,
                },
                Ok(None) => break,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(client = %client_ip, limit = MAX_MESSAGE_SIZE, "Oversized message");
                    oversized()
                }
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    gateway.respond(
                        Err(Error::Validation("Request is not valid UTF-8".into())),
                        client_ip,
                    )
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            };
            write_response(&mut stream, &response).await?;
        }

        let idle_timeout = gateway.settings().idle_timeout;
        let read = tokio::select! {
            _ = running.cancelled() => return Ok(()),
            read = read_some(&mut stream, &mut buf, idle_timeout) => read?,
        };

        match read {
            Some(0) => {
                // Client closed; answer a final unterminated line if any.
                if let Ok(Some(line)) = codec.decode_eof(&mut buf) {
                    if let Some(response) = respond(gateway, &line, client_ip).await {
                        write_response(&mut stream, &response).await?;
                    }
                }
                return Ok(());
            }
            Some(_) => {}
            None => {
                info!(client = %client_ip, "Idle timeout");
                return Ok(());
            }
        }
    }
}

/// `None` when the idle timeout expired first.
async fn read_some<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    idle_timeout: Option<time::Duration>,
) -> io::Result<Option<usize>>
where
    S: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => match time::timeout(limit, stream.read_buf(buf)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => stream.read_buf(buf).await.map(Some),
    }
}

/// Reply for one line, or `None` for a blank line.
async fn respond(gateway: &Gateway, line: &str, client_ip: &str) -> Option<Response> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let log_traffic = gateway.settings().log_traffic;
    if log_traffic {
        trace!(target: TRAFFIC_TARGET, client = %client_ip, "REQ {line}");
    }

    let response = match gateway.check_rate(client_ip) {
        Ok(()) => gateway.handle_line(line, client_ip).await,
        Err(e) => gateway.respond(Err(e), client_ip),
    };

    if log_traffic {
        trace!(target: TRAFFIC_TARGET, client = %client_ip, "RES {}", response.to_line());
    }
    Some(response)
}

fn oversized() -> Response {
    Response::Error {
        error: "Message too large".to_string(),
        protocol_version: super::protocol::PROTOCOL_VERSION,
    }
}

async fn write_response<S>(stream: &mut S, response: &Response) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut line = response.to_line();
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await
}
