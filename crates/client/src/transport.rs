//! Framed transport to the network-service process.
//!
//! The session layer only needs two primitives from a transport: "send one
//! JSON frame" and "a stream of inbound JSON frames". Those are the
//! [`Transport`] and [`TransportReceiver`] traits plus the frame channel
//! bundled in [`TransportParts`].
//!
//! [`PipeTransport`] is the reference implementation: a 4-byte little-endian
//! length prefix followed by the JSON bytes, over any `AsyncWrite`/`AsyncRead`
//! pair (a socketpair to the spawned service in production, duplex pipes in
//! tests).

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Upper bound on a single frame body. The length prefix comes from the
/// remote process, so it must not be trusted to size an allocation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Sender half of a transport: writes one outbound frame per call.
pub trait Transport: Send {
    /// Sends a single JSON frame to the service.
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Reader half of a transport: decodes frames until EOF or shutdown.
pub trait TransportReceiver: Send {
    /// Runs the read loop, forwarding decoded frames to the frame channel.
    ///
    /// Returns `Ok(())` on clean shutdown (frame channel dropped), an error
    /// on framing or I/O failure.
    fn run(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Everything the session needs from a transport, type-erased.
pub struct TransportParts {
    /// Outbound frame writer.
    pub sender: Box<dyn Transport>,
    /// Inbound read loop, to be driven by the session.
    pub receiver: Box<dyn TransportReceiver>,
    /// Channel delivering decoded inbound frames, in arrival order.
    pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// Length-prefixed JSON transport over a pipe-like byte stream.
pub struct PipeTransport<W, R> {
    sender: PipeTransportSender<W>,
    receiver: PipeTransportReceiver<R>,
}

impl<W, R> PipeTransport<W, R>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Creates a transport over the given halves.
    ///
    /// Returns the transport and the receiver for decoded inbound frames.
    pub fn new(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let transport = Self {
            sender: PipeTransportSender { writer },
            receiver: PipeTransportReceiver { reader, frame_tx },
        };
        (transport, frame_rx)
    }

    /// Splits into the sender and receiver halves.
    pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
        (self.sender, self.receiver)
    }

    /// Boxes the halves into [`TransportParts`] for the session.
    pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Value>) -> TransportParts {
        let (sender, receiver) = self.into_parts();
        TransportParts {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
            message_rx,
        }
    }

    /// Sends one frame; convenience for tests that never split.
    pub async fn send(&mut self, message: Value) -> Result<()> {
        self.sender.send_frame(message).await
    }

    /// Runs the read loop; convenience for tests that never split.
    pub async fn run(&mut self) -> Result<()> {
        self.receiver.run_loop().await
    }
}

/// Writer half of a [`PipeTransport`].
pub struct PipeTransportSender<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> PipeTransportSender<W> {
    /// Sends one length-prefixed JSON frame.
    pub async fn send_frame(&mut self, message: Value) -> Result<()> {
        let payload = serde_json::to_vec(&message)?;
        let length = u32::try_from(payload.len())
            .map_err(|_| Error::TransportError("Frame exceeds u32 length".to_string()))?;

        self.writer
            .write_all(&length.to_le_bytes())
            .await
            .map_err(|e| Error::TransportError(format!("Failed to write length prefix: {e}")))?;
        self.writer
            .write_all(&payload)
            .await
            .map_err(|e| Error::TransportError(format!("Failed to write frame: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::TransportError(format!("Failed to flush frame: {e}")))?;
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin + Send> Transport for PipeTransportSender<W> {
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.send_frame(message))
    }
}

/// Reader half of a [`PipeTransport`].
pub struct PipeTransportReceiver<R> {
    reader: R,
    frame_tx: mpsc::UnboundedSender<Value>,
}

impl<R: AsyncRead + Unpin + Send> PipeTransportReceiver<R> {
    /// Reads frames until EOF, a framing error, or the frame channel closes.
    pub async fn run_loop(&mut self) -> Result<()> {
        loop {
            let mut length_buf = [0u8; 4];
            if let Err(e) = self.reader.read_exact(&mut length_buf).await {
                // EOF at a frame boundary with no consumer left is a clean
                // shutdown; everything else is a transport failure.
                if self.frame_tx.is_closed() {
                    return Ok(());
                }
                return Err(Error::TransportError(format!(
                    "Failed to read length prefix: {e}"
                )));
            }
            let length = u32::from_le_bytes(length_buf) as usize;
            if length > MAX_FRAME_SIZE {
                return Err(Error::TransportError(format!(
                    "Frame length {length} exceeds maximum {MAX_FRAME_SIZE}"
                )));
            }

            let mut payload = vec![0u8; length];
            self.reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| Error::TransportError(format!("Failed to read frame body: {e}")))?;

            let message: Value = serde_json::from_slice(&payload)
                .map_err(|e| Error::TransportError(format!("Failed to parse frame: {e}")))?;

            if self.frame_tx.send(message).is_err() {
                // Consumer is gone; stop reading.
                return Ok(());
            }
        }
    }
}

impl<R: AsyncRead + Unpin + Send> TransportReceiver for PipeTransportReceiver<R> {
    fn run(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.run_loop())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn length_prefix_is_little_endian() {
        let length: u32 = 1234;
        let bytes = length.to_le_bytes();

        assert_eq!(bytes[0], (length & 0xFF) as u8);
        assert_eq!(bytes[1], ((length >> 8) & 0xFF) as u8);
        assert_eq!(u32::from_le_bytes(bytes), length);
    }

    #[tokio::test]
    async fn send_writes_framed_message() {
        let (client_read, client_write) = tokio::io::duplex(1024);
        let (service_read, _service_write) = tokio::io::duplex(1024);

        let (mut transport, _rx) = PipeTransport::new(client_write, service_read);

        let message = serde_json::json!({
            "id": 1,
            "method": "start_request",
            "params": {"url": "http://example.com/"}
        });
        transport.send(message.clone()).await.unwrap();

        let (mut read_half, _write_half) = tokio::io::split(client_read);
        let mut length_buf = [0u8; 4];
        read_half.read_exact(&mut length_buf).await.unwrap();
        let length = u32::from_le_bytes(length_buf) as usize;

        let mut payload = vec![0u8; length];
        read_half.read_exact(&mut payload).await.unwrap();

        let received: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn receives_multiple_messages_in_order() {
        let (_client_read, client_write) = tokio::io::duplex(4096);
        let (service_read, mut service_write) = tokio::io::duplex(4096);

        let (mut transport, mut rx) = PipeTransport::new(client_write, service_read);
        let read_task = tokio::spawn(async move { transport.run().await });

        let messages = vec![
            serde_json::json!({"method": "request_started", "params": {"id": 0, "fd": 7}}),
            serde_json::json!({"method": "request_progress", "params": {"id": 0, "total_size": null, "downloaded_size": 10}}),
            serde_json::json!({"method": "request_finished", "params": {"id": 0, "success": true, "total_size": 10}}),
        ];

        for msg in &messages {
            let payload = serde_json::to_vec(msg).unwrap();
            let length = payload.len() as u32;
            service_write.write_all(&length.to_le_bytes()).await.unwrap();
            service_write.write_all(&payload).await.unwrap();
        }
        service_write.flush().await.unwrap();

        for expected in &messages {
            let received = rx.recv().await.unwrap();
            assert_eq!(&received, expected);
        }

        drop(service_write);
        drop(rx);
        let _ = read_task.await;
    }

    #[tokio::test]
    async fn large_frame_round_trips() {
        let (_client_read, client_write) = tokio::io::duplex(1024 * 1024);
        let (service_read, mut service_write) = tokio::io::duplex(1024 * 1024);

        let (mut transport, mut rx) = PipeTransport::new(client_write, service_read);
        let read_task = tokio::spawn(async move { transport.run().await });

        let message = serde_json::json!({"method": "websocket_received", "data": "x".repeat(100_000)});
        let payload = serde_json::to_vec(&message).unwrap();
        assert!(payload.len() > 32_768);

        service_write
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await
            .unwrap();
        service_write.write_all(&payload).await.unwrap();
        service_write.flush().await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), message);

        drop(service_write);
        drop(rx);
        let _ = read_task.await;
    }

    #[tokio::test]
    async fn truncated_length_prefix_is_an_error() {
        let (_client_read, client_write) = tokio::io::duplex(1024);
        let (service_read, mut service_write) = tokio::io::duplex(1024);

        let (mut transport, _rx) = PipeTransport::new(client_write, service_read);

        service_write.write_all(&[0x01, 0x02]).await.unwrap();
        service_write.flush().await.unwrap();
        drop(service_write);

        let result = transport.run().await;
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read length prefix")
        );
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_an_error() {
        let (_client_read, client_write) = tokio::io::duplex(1024);
        let (service_read, mut service_write) = tokio::io::duplex(1024);

        let (mut transport, _rx) = PipeTransport::new(client_write, service_read);

        // A hostile prefix must fail cleanly instead of sizing an allocation.
        service_write.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        service_write.flush().await.unwrap();

        let result = transport.run().await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn broken_pipe_is_an_error() {
        let (_client_read, client_write) = tokio::io::duplex(1024);
        let (service_read, service_write) = tokio::io::duplex(1024);

        let (mut transport, _rx) = PipeTransport::new(client_write, service_read);
        drop(service_write);

        let result = tokio::spawn(async move { transport.run().await })
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dropped_consumer_is_clean_shutdown() {
        let (_client_read, client_write) = tokio::io::duplex(1024);
        let (service_read, mut service_write) = tokio::io::duplex(1024);

        let (mut transport, mut rx) = PipeTransport::new(client_write, service_read);
        let read_task = tokio::spawn(async move { transport.run().await });

        let message = serde_json::json!({"method": "certificate_requested", "params": {"id": 1}});
        let payload = serde_json::to_vec(&message).unwrap();
        service_write
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await
            .unwrap();
        service_write.write_all(&payload).await.unwrap();
        service_write.flush().await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), message);

        drop(rx);
        drop(service_write);

        let result = read_task.await.unwrap();
        assert!(result.is_ok());
    }
}
