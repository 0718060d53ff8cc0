//! Socket setup and the framed reader / single-writer plumbing.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ViewerError, ViewerResult};
use crate::protocol_constants::{
    CONNECT_TIMEOUT_MS, MAX_HEADER_LINE_BYTES, READ_TIMEOUT_MS, SOCKET_BUFFER_BYTES,
};
use crate::wire::{encode, Message};

/// Opens the TCP connection with the protocol's socket options applied.
pub(crate) async fn open_socket(host: &str, port: u16) -> ViewerResult<TcpStream> {
    let stream = tokio::time::timeout(
        Duration::from_millis(CONNECT_TIMEOUT_MS),
        TcpStream::connect((host, port)),
    )
    .await
    .map_err(|_| {
        ViewerError::TransientIo(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        ))
    })??;

    stream.set_nodelay(true)?;
    // Buffer sizing is best-effort; refusal is not an error.
    let sock = socket2::SockRef::from(&stream);
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_BYTES) {
        log::debug!("[Io] recv buffer hint rejected: {}", e);
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_BYTES) {
        log::debug!("[Io] send buffer hint rejected: {}", e);
    }
    Ok(stream)
}

/// Buffered reader producing header lines and exact-length payloads.
pub(crate) struct FrameReader {
    inner: BufReader<OwnedReadHalf>,
    line: Vec<u8>,
}

impl FrameReader {
    pub(crate) fn new(read_half: OwnedReadHalf) -> Self {
        Self {
            inner: BufReader::with_capacity(64 * 1024, read_half),
            line: Vec::with_capacity(256),
        }
    }

    /// Reads one header line. `Ok(None)` on clean EOF.
    pub(crate) async fn read_header(&mut self) -> ViewerResult<Option<String>> {
        self.line.clear();
        let n = tokio::time::timeout(
            Duration::from_millis(READ_TIMEOUT_MS),
            self.inner.read_until(b'\n', &mut self.line),
        )
        .await
        .map_err(|_| {
            ViewerError::TransientIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "read timed out",
            ))
        })??;
        if n == 0 {
            return Ok(None);
        }
        if self.line.len() > MAX_HEADER_LINE_BYTES {
            return Err(ViewerError::ProtocolMalformed(format!(
                "header line of {} bytes",
                self.line.len()
            )));
        }
        let line = std::str::from_utf8(&self.line)
            .map_err(|_| ViewerError::ProtocolMalformed("header is not UTF-8".into()))?;
        Ok(Some(line.to_string()))
    }

    /// Reads exactly `buf.len()` payload bytes. A short read is fatal for the
    /// connection: framing is lost.
    pub(crate) async fn read_exact_payload(&mut self, buf: &mut [u8]) -> ViewerResult<()> {
        tokio::time::timeout(
            Duration::from_millis(READ_TIMEOUT_MS),
            self.inner.read_exact(buf),
        )
        .await
        .map_err(|_| {
            ViewerError::TransientIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "payload read timed out",
            ))
        })??;
        Ok(())
    }
}

/// One unit of outbound work for the writer task.
pub(crate) enum Outbound {
    Line(Message),
    /// Header plus binary payload, written back-to-back.
    Binary { header: Message, payload: Bytes },
}

/// Spawns the single-writer task. All socket writes funnel through its queue,
/// which preserves message order and keeps header+payload pairs atomic.
pub(crate) fn spawn_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let result = match outbound {
                Outbound::Line(msg) => write_half.write_all(encode(&msg).as_bytes()).await,
                Outbound::Binary { header, payload } => {
                    match write_half.write_all(encode(&header).as_bytes()).await {
                        Ok(()) => write_half.write_all(&payload).await,
                        Err(e) => Err(e),
                    }
                }
            };
            if let Err(e) = result {
                log::warn!("[Io] Socket write failed: {}", e);
                break;
            }
        }
        log::debug!("[Io] Writer task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn reads_header_then_exact_payload() {
        let (client, mut server) = pair().await;
        let (read_half, _write_half) = client.into_split();
        let mut reader = FrameReader::new(read_half);

        server
            .write_all(b"FRAME|epoch=1|seq=0|size=4|key=true\nabcdPING|tsMs=1\n")
            .await
            .unwrap();

        let header = reader.read_header().await.unwrap().unwrap();
        assert_eq!(header, "FRAME|epoch=1|seq=0|size=4|key=true\n");

        let mut payload = [0u8; 4];
        reader.read_exact_payload(&mut payload).await.unwrap();
        assert_eq!(&payload, b"abcd");

        let header = reader.read_header().await.unwrap().unwrap();
        assert_eq!(header, "PING|tsMs=1\n");
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let (client, server) = pair().await;
        drop(server);
        let (read_half, _write_half) = client.into_split();
        let mut reader = FrameReader::new(read_half);
        assert!(reader.read_header().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_payload_is_an_error() {
        let (client, mut server) = pair().await;
        let (read_half, _write_half) = client.into_split();
        let mut reader = FrameReader::new(read_half);

        server.write_all(b"ab").await.unwrap();
        drop(server);

        let mut payload = [0u8; 4];
        let err = reader.read_exact_payload(&mut payload).await.unwrap_err();
        assert!(matches!(err, ViewerError::TransientIo(_)));
    }

    #[tokio::test]
    async fn writer_preserves_order_and_framing() {
        let (client, server) = pair().await;
        let (_read_half, write_half) = client.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let writer = spawn_writer(write_half, rx, cancel.clone());

        tx.send(Outbound::Line(Message::ReqKeyframe)).unwrap();
        tx.send(Outbound::Binary {
            header: Message::AudioFrame(crate::wire::AudioFrameHeader {
                dir: crate::wire::AudioDir::Up,
                size: 4,
                rate: 48_000,
                channels: 1,
                format: crate::wire::AudioCodec::Pcm,
                ts_us: 0,
            }),
            payload: Bytes::from_static(b"wxyz"),
        })
        .unwrap();
        drop(tx);
        writer.await.unwrap();

        let (read_half, _w) = server.into_split();
        let mut reader = FrameReader::new(read_half);
        assert_eq!(
            reader.read_header().await.unwrap().unwrap(),
            "REQ_KEYFRAME\n"
        );
        assert_eq!(
            reader.read_header().await.unwrap().unwrap(),
            "AUDIO_FRAME|dir=up|size=4|rate=48000|ch=1|format=pcm|tsUs=0\n"
        );
        let mut payload = [0u8; 4];
        reader.read_exact_payload(&mut payload).await.unwrap();
        assert_eq!(&payload, b"wxyz");
    }

    #[tokio::test]
    async fn open_socket_refused_maps_to_transient_io() {
        // Bind-then-drop gives a port with (almost certainly) no listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = open_socket("127.0.0.1", addr.port()).await.unwrap_err();
        assert!(matches!(err, ViewerError::TransientIo(_)));
    }
}
