//! Per-client connection loop.
//!
//! TCP delivers an unframed byte stream, so each connection keeps an input
//! buffer: reads append to it, and the decoder peels off complete commands
//! as they become available. Pipelined commands are executed back to back
//! and their replies coalesce into a single write.

use crate::commands::CommandHandler;
use crate::protocol::{decode, ProtoError};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// A connection buffering more than this without completing a command is
/// dropped.
const MAX_BUFFER_SIZE: usize = 64 * 1024;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Server-wide connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub commands_processed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("client disconnected")]
    Disconnected,

    #[error("connection closed mid-command")]
    TruncatedCommand,

    #[error("input buffer limit exceeded")]
    BufferFull,
}

/// State of one client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    input: BytesMut,
    output: BytesMut,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        commands: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();
        Self {
            stream: BufWriter::new(stream),
            addr,
            input: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            output: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            commands,
            stats,
        }
    }

    /// Serve the connection until the client goes away or errors out.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "client connected");
        let result = self.serve().await;

        match &result {
            Ok(()) | Err(ConnectionError::Disconnected) => {
                debug!(client = %self.addr, "client disconnected");
            }
            Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(client = %self.addr, "connection reset by client");
            }
            Err(e) => warn!(client = %self.addr, error = %e, "connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Drain every complete command already buffered, batching the
            // replies.
            let mut executed = 0;
            while let Some(command) = decode(&mut self.input)? {
                let reply = self.commands.execute(command);
                reply.write_to(&mut self.output);
                self.stats.commands_processed.fetch_add(1, Ordering::Relaxed);
                executed += 1;
            }
            if executed > 0 {
                trace!(client = %self.addr, executed, "flushing replies");
                self.flush_output().await?;
            }

            self.fill_input().await?;
        }
    }

    async fn fill_input(&mut self) -> Result<(), ConnectionError> {
        if self.input.len() >= MAX_BUFFER_SIZE {
            warn!(client = %self.addr, size = self.input.len(), "input buffer limit exceeded");
            return Err(ConnectionError::BufferFull);
        }
        if self.input.capacity() - self.input.len() < 1024 {
            self.input.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.input).await?;
        if n == 0 {
            return if self.input.is_empty() {
                Err(ConnectionError::Disconnected)
            } else {
                Err(ConnectionError::TruncatedCommand)
            };
        }
        self.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn flush_output(&mut self) -> Result<(), ConnectionError> {
        let n = self.output.len();
        self.stream.write_all(&self.output).await?;
        self.stream.flush().await?;
        self.output.clear();
        self.stats.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Spawnable wrapper: build a handler, run it, swallow routine disconnects.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, commands, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::Disconnected => {}
            ConnectionError::Io(ref io) if io.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => debug!(client = %addr, error = %e, "connection ended with error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::StorageEngine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_server() -> (SocketAddr, Arc<StorageEngine>, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let engine = Arc::new(StorageEngine::new());
        let stats = Arc::new(ConnectionStats::new());

        let engine_for_accept = Arc::clone(&engine);
        let stats_for_accept = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let commands = CommandHandler::new(Arc::clone(&engine_for_accept));
                let stats = Arc::clone(&stats_for_accept);
                tokio::spawn(handle_connection(stream, client_addr, commands, stats));
            }
        });

        (addr, engine, stats)
    }

    async fn read_some(client: &mut TcpStream) -> Vec<u8> {
        let mut buf = [0u8; 512];
        let n = client.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_hash_commands_over_the_wire() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*4\r\n$4\r\nHSET\r\n$1\r\nk\r\n$1\r\nf\r\n$1\r\nv\r\n")
            .await
            .unwrap();
        assert_eq!(read_some(&mut client).await, b":1\r\n");

        client
            .write_all(b"*3\r\n$4\r\nHGET\r\n$1\r\nk\r\n$1\r\nf\r\n")
            .await
            .unwrap();
        assert_eq!(read_some(&mut client).await, b"$1\r\nv\r\n");

        client
            .write_all(b"*6\r\n$7\r\nHEXPIRE\r\n$1\r\nk\r\n$2\r\n60\r\n$6\r\nFIELDS\r\n$1\r\n1\r\n$1\r\nf\r\n")
            .await
            .unwrap();
        assert_eq!(read_some(&mut client).await, b"*1\r\n:1\r\n");
    }

    #[tokio::test]
    async fn test_pipelined_commands_single_write() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(
                b"*4\r\n$4\r\nHSET\r\n$1\r\nk\r\n$1\r\na\r\n$1\r\n1\r\n\
                  *4\r\n$4\r\nHSET\r\n$1\r\nk\r\n$1\r\nb\r\n$1\r\n2\r\n\
                  *2\r\n$4\r\nHLEN\r\n$1\r\nk\r\n",
            )
            .await
            .unwrap();

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(2);
        while collected.len() < 12 && tokio::time::Instant::now() < deadline {
            let chunk = tokio::time::timeout(
                tokio::time::Duration::from_millis(200),
                read_some(&mut client),
            )
            .await;
            match chunk {
                Ok(bytes) => collected.extend(bytes),
                Err(_) => break,
            }
        }
        assert_eq!(collected, b":1\r\n:1\r\n:2\r\n");
    }

    #[tokio::test]
    async fn test_inline_command() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"PING\r\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_stats_track_lifecycle() {
        let (addr, _, stats) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let _ = read_some(&mut client).await;
        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
