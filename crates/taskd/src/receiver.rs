use std::net::SocketAddr;

use anyhow::Result;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskd_core::protocol::{Ack, BaseMessage};
use taskd_manager::queue::InboundQueue;

/// Accept report connections until cancelled.
pub async fn serve(
    addr: SocketAddr,
    max_frame_bytes: usize,
    queue: InboundQueue,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Receiver listening on {}", listener.local_addr()?);
    serve_on(listener, max_frame_bytes, queue, cancel).await;
    Ok(())
}

pub async fn serve_on(
    listener: TcpListener,
    max_frame_bytes: usize,
    queue: InboundQueue,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Receiver stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Connection from {}", peer);
                    let queue = queue.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer.to_string(), max_frame_bytes, queue, cancel)
                            .await;
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }
}

/// Read newline-delimited frames and enqueue them.
///
/// A frame that cannot be parsed or enqueued is answered on the same
/// connection with a failed `Ack` line. A line longer than
/// `max_frame_bytes` is answered the same way and closes the connection.
pub async fn handle_connection<S>(
    stream: S,
    peer: String,
    max_frame_bytes: usize,
    queue: InboundQueue,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(max_frame_bytes));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            None => break,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("Frame from {} exceeds {} bytes, closing", peer, max_frame_bytes);
                let ack = Ack::failed("", format!("frame exceeds {} bytes", max_frame_bytes));
                if let Err(e) = write_ack(&mut write, &ack).await {
                    warn!("Failed to answer {}: {}", peer, e);
                }
                break;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                warn!("Read from {} failed: {}", peer, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let ack = match serde_json::from_str::<BaseMessage>(&line) {
            Ok(msg) => {
                let uuid = msg.uuid.clone();
                match queue.enqueue(msg) {
                    Ok(()) => continue,
                    Err(e) => {
                        warn!("Rejected message {} from {}: {}", uuid, peer, e);
                        Ack::failed(&uuid, e.to_string())
                    }
                }
            }
            Err(e) => {
                warn!("Unparsable frame from {}: {}", peer, e);
                Ack::failed("", format!("invalid frame: {}", e))
            }
        };

        if let Err(e) = write_ack(&mut write, &ack).await {
            warn!("Failed to answer {}: {}", peer, e);
            break;
        }
    }
    debug!("Connection from {} closed", peer);
}

async fn write_ack<W: AsyncWrite + Unpin>(write: &mut W, ack: &Ack) -> Result<()> {
    let mut line = serde_json::to_vec(ack)?;
    line.push(b'\n');
    write.write_all(&line).await?;
    write.flush().await?;
    Ok(())
}
