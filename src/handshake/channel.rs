//! Framed handshake channel over any async byte stream pair.
//!
//! The supervisor uses the worker's stdout (read) and stdin (write); the
//! worker uses the mirror image. Both pipes exist before the worker runs,
//! so no frame can be written before the channel is there to receive it.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::message::HandshakeMessage;
use crate::error::ChannelError;

/// Largest frame accepted by default (64 KiB).
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// Receiving half of the handshake channel.
pub struct HandshakeReader<R> {
    inner: BufReader<R>,
    max_frame: usize,
    /// Set after a timed-out receive; a partially read frame may have been
    /// discarded, so the stream can no longer be trusted for data.
    expired: bool,
}

impl<R: AsyncRead + Unpin> HandshakeReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame(reader, DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(reader: R, max_frame: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame,
            expired: false,
        }
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// On timeout the reader is marked expired: later calls fail with
    /// `ChannelError::Expired` and the reader is only good for dropping.
    pub async fn receive(&mut self, timeout: Duration) -> Result<HandshakeMessage, ChannelError> {
        if self.expired {
            return Err(ChannelError::Expired);
        }
        match tokio::time::timeout(timeout, self.read_frame()).await {
            Ok(result) => result,
            Err(_) => {
                self.expired = true;
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Wait without a deadline for the next message.
    pub async fn next(&mut self) -> Result<HandshakeMessage, ChannelError> {
        if self.expired {
            return Err(ChannelError::Expired);
        }
        self.read_frame().await
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    async fn read_frame(&mut self) -> Result<HandshakeMessage, ChannelError> {
        loop {
            let mut buf = Vec::new();
            let limit = self.max_frame as u64 + 1;
            let n = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut buf)
                .await?;

            if n == 0 {
                return Err(ChannelError::Closed);
            }
            if buf.last() != Some(&b'\n') {
                if buf.len() > self.max_frame {
                    return Err(ChannelError::FrameTooLarge {
                        limit: self.max_frame,
                    });
                }
                // EOF in the middle of a frame: the peer went away.
                return Err(ChannelError::Closed);
            }
            if buf.trim_ascii().is_empty() {
                continue;
            }
            return HandshakeMessage::decode(&buf);
        }
    }
}

/// Sending half of the handshake channel.
pub struct HandshakeWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> HandshakeWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    /// Write one frame and flush it. A vanished peer is reported as
    /// `ChannelError::Closed`.
    pub async fn send(&mut self, message: &HandshakeMessage) -> Result<(), ChannelError> {
        let frame = message.encode()?;
        let result = async {
            self.inner.write_all(&frame).await?;
            self.inner.flush().await
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(ChannelError::Closed),
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    /// Close the write side so the peer observes EOF.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        match self.inner.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            Err(e) => Err(ChannelError::Io(e)),
        }
    }
}

/// Both halves of a handshake channel.
pub struct HandshakeChannel<R, W> {
    pub reader: HandshakeReader<R>,
    pub writer: HandshakeWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> HandshakeChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: HandshakeReader::new(reader),
            writer: HandshakeWriter::new(writer),
        }
    }

    pub async fn send(&mut self, message: &HandshakeMessage) -> Result<(), ChannelError> {
        self.writer.send(message).await
    }

    pub async fn receive(&mut self, timeout: Duration) -> Result<HandshakeMessage, ChannelError> {
        self.reader.receive(timeout).await
    }

    pub fn split(self) -> (HandshakeReader<R>, HandshakeWriter<W>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    use super::*;

    type Half = HandshakeChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (Half, Half) {
        let (a, b) = duplex(4096);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (HandshakeChannel::new(ar, aw), HandshakeChannel::new(br, bw))
    }

    #[tokio::test]
    async fn delivers_in_send_order() {
        let (mut supervisor, mut worker) = pair();

        worker
            .send(&HandshakeMessage::Ready {
                pid: 1,
                listen_address: "127.0.0.1:1".to_string(),
            })
            .await
            .unwrap();
        supervisor
            .send(&HandshakeMessage::shutdown("first"))
            .await
            .unwrap();
        supervisor
            .send(&HandshakeMessage::shutdown("second"))
            .await
            .unwrap();

        let got = supervisor.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.type_name(), "ready");
        assert_eq!(
            worker.receive(Duration::from_secs(1)).await.unwrap(),
            HandshakeMessage::shutdown("first")
        );
        assert_eq!(
            worker.receive(Duration::from_secs(1)).await.unwrap(),
            HandshakeMessage::shutdown("second")
        );
    }

    #[tokio::test]
    async fn timeout_expires_reader() {
        let (mut supervisor, _worker) = pair();

        let err = supervisor
            .receive(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
        assert!(supervisor.reader.is_expired());

        let err = supervisor
            .receive(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Expired));
    }

    #[tokio::test]
    async fn peer_drop_reports_closed() {
        let (mut supervisor, worker) = pair();
        drop(worker);

        let err = supervisor
            .receive(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn partial_frame_then_eof_is_closed() {
        let (mut reader_side, writer_side) = duplex(256);
        tokio::spawn(async move {
            let mut writer_side = writer_side;
            writer_side.write_all(br#"{"type":"rea"#).await.unwrap();
        });
        let mut reader = HandshakeReader::new(&mut reader_side);
        let err = reader.receive(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut reader_side, mut writer_side) = duplex(1024);
        writer_side.write_all(&[b'x'; 200]).await.unwrap();
        let mut reader = HandshakeReader::with_max_frame(&mut reader_side, 64);
        let err = reader.receive(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::FrameTooLarge { limit: 64 }));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (mut reader_side, mut writer_side) = duplex(1024);
        writer_side
            .write_all(b"\n\n{\"type\":\"shutdown\",\"reason\":\"bye\"}\n")
            .await
            .unwrap();
        let mut reader = HandshakeReader::new(&mut reader_side);
        assert_eq!(
            reader.receive(Duration::from_secs(1)).await.unwrap(),
            HandshakeMessage::shutdown("bye")
        );
    }
}
