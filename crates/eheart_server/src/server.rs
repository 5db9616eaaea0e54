//! Line-delimited JSON over TCP: one request per received line, one response
//! per sent line.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use eheart_core::registry::ModelRegistry;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::protocol::Response;
use crate::session::Session;

/// Longest request line accepted, newline excluded.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Accept connections until `shutdown` resolves. Every connection gets its
/// own task and its own [`Session`]; sessions share only the registry.
pub async fn serve<F>(listener: TcpListener, registry: Arc<ModelRegistry>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    info!(address = %listener.local_addr()?, "listening");
    tokio::pin!(shutdown);
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        let registry = Arc::clone(&registry);
                        let span = info_span!("connection", id = next_id, %peer);
                        tokio::spawn(
                            async move {
                                info!("connection opened");
                                match handle_connection(stream, registry).await {
                                    Ok(()) => info!("connection closed"),
                                    Err(err) => warn!(error = %err, "connection closed with error"),
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
            _ = &mut shutdown => {
                info!("shutdown requested, no longer accepting connections");
                break;
            }
        }
    }
    Ok(())
}

/// Run one session over `stream` until the peer closes it.
///
/// Requests are processed strictly one after another. Each one runs on the
/// blocking pool, so a long solve does not stall the runtime; the session is
/// moved there and back.
pub async fn handle_connection<S>(stream: S, registry: Arc<ModelRegistry>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    run_session(stream, registry, MAX_REQUEST_BYTES).await
}

async fn run_session<S>(stream: S, registry: Arc<ModelRegistry>, max_line: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut session = Session::new(registry);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(max_line as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            break;
        }
        let terminated = buf.last() == Some(&b'\n');
        if terminated {
            buf.pop();
        }

        let response = if !terminated && buf.len() > max_line {
            discard_line(&mut reader).await?;
            warn!(limit = max_line, "request line too long");
            Some(Response::failure(format!(
                "Request line exceeds {max_line} bytes"
            )))
        } else {
            match String::from_utf8(std::mem::take(&mut buf)) {
                Err(_) => Some(Response::failure("Request line is not valid UTF-8")),
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => {
                    let span = Span::current();
                    let (returned, response) = tokio::task::spawn_blocking(move || {
                        let _entered = span.enter();
                        let response = session.process_line(&line);
                        (session, response)
                    })
                    .await?;
                    session = returned;
                    Some(response)
                }
            }
        };

        if let Some(response) = response {
            let mut payload = serde_json::to_string(&response)?;
            payload.push('\n');
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await?;
            debug!(bytes = payload.len(), "response sent");
        }
    }
    Ok(())
}

/// Skip input up to and including the next newline, in bounded chunks.
async fn discard_line<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}
