//! Line-oriented transport abstraction.
//!
//! A [`SerialTransport`] knows how to open the physical link and hands back a
//! read half and a write half. The protocol engine gives the read half to its
//! background reader task and the write half to its writer task, so each half
//! has exactly one owner for the lifetime of a connection. Reopening after a
//! loss simply calls [`SerialTransport::open`] again.
//!
//! [`StreamLink`] adapts any tokio `AsyncRead`/`AsyncWrite` pair, which covers
//! both `tokio_serial::SerialStream` and the in-memory duplex used by the
//! simulator.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::{RigError, RigResult};

/// Maximum accepted line length; longer input is treated as noise.
pub const MAX_LINE_BYTES: usize = 1024;

/// Read half of a link.
#[async_trait]
pub trait LineReader: Send {
    /// Read the next line without its terminator.
    ///
    /// Returns `Ok(None)` at end of stream.
    async fn read_line(&mut self) -> RigResult<Option<String>>;
}

/// Write half of a link.
#[async_trait]
pub trait LineWriter: Send {
    /// Write one command line; the terminator is appended here.
    async fn write_line(&mut self, line: &str) -> RigResult<()>;

    /// Write a single real-time byte that bypasses line framing.
    async fn write_realtime(&mut self, byte: u8) -> RigResult<()>;
}

/// Boxed halves returned by [`SerialTransport::open`].
pub type LinkHalves = (Box<dyn LineReader>, Box<dyn LineWriter>);

/// Something that can open the controller link, possibly many times.
#[async_trait]
pub trait SerialTransport: Send + Sync {
    /// Open a fresh connection.
    async fn open(&self) -> RigResult<LinkHalves>;

    /// Human-readable description for logs (port path, "simulator", ...).
    fn describe(&self) -> String;
}

/// Adapter from tokio byte streams to the line traits.
pub struct StreamLink;

impl StreamLink {
    /// Wrap a read half and a write half.
    pub fn halves<R, W>(reader: R, writer: W) -> LinkHalves
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        (
            Box::new(StreamLineReader {
                inner: BufReader::new(reader),
                buf: Vec::with_capacity(128),
            }),
            Box::new(StreamLineWriter { inner: writer }),
        )
    }

    /// Split a bidirectional stream and wrap both halves.
    pub fn split<S>(stream: S) -> LinkHalves
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::halves(reader, writer)
    }
}

struct StreamLineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

#[async_trait]
impl<R> LineReader for StreamLineReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_line(&mut self) -> RigResult<Option<String>> {
        loop {
            self.buf.clear();
            let n = self
                .inner
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|e| RigError::ConnectionLost(format!("read failed: {}", e)))?;

            if n == 0 {
                return Ok(None);
            }

            // A partial line at end of stream carries no terminator; drop it.
            if self.buf.last() != Some(&b'\n') {
                trace!(bytes = n, "discarding unterminated trailing input");
                return Ok(None);
            }

            if self.buf.len() > MAX_LINE_BYTES {
                trace!(bytes = n, "discarding oversized line");
                continue;
            }

            let line = String::from_utf8_lossy(&self.buf);
            return Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()));
        }
    }
}

struct StreamLineWriter<W> {
    inner: W,
}

#[async_trait]
impl<W> LineWriter for StreamLineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_line(&mut self, line: &str) -> RigResult<()> {
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');
        self.inner
            .write_all(&framed)
            .await
            .map_err(|e| RigError::ConnectionLost(format!("write failed: {}", e)))?;
        self.inner
            .flush()
            .await
            .map_err(|e| RigError::ConnectionLost(format!("flush failed: {}", e)))
    }

    async fn write_realtime(&mut self, byte: u8) -> RigResult<()> {
        self.inner
            .write_all(&[byte])
            .await
            .map_err(|e| RigError::ConnectionLost(format!("write failed: {}", e)))?;
        self.inner
            .flush()
            .await
            .map_err(|e| RigError::ConnectionLost(format!("flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_lines_are_split_and_trimmed() {
        let (near, mut far) = tokio::io::duplex(256);
        let (mut reader, _writer) = StreamLink::split(near);

        far.write_all(b"ok\r\n<Idle|MPos:0,0,0,0>\n").await.unwrap();
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("ok"));
        assert_eq!(
            reader.read_line().await.unwrap().as_deref(),
            Some("<Idle|MPos:0,0,0,0>")
        );
    }

    #[tokio::test]
    async fn test_end_of_stream_returns_none() {
        let (near, mut far) = tokio::io::duplex(256);
        let (mut reader, _writer) = StreamLink::split(near);

        far.write_all(b"ok\npartial").await.unwrap();
        drop(far);
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("ok"));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writer_frames_lines_and_realtime_bytes() {
        let (near, mut far) = tokio::io::duplex(256);
        let (_reader, mut writer) = StreamLink::split(near);

        writer.write_line("G90 G1 X1").await.unwrap();
        writer.write_realtime(b'?').await.unwrap();

        let mut buf = [0u8; 11];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"G90 G1 X1\n?");
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        let long = vec![b'x'; MAX_LINE_BYTES + 10];
        let mock = tokio_test::io::Builder::new()
            .read(&long)
            .read(b"\nok\n")
            .build();
        let (mut reader, _writer) = StreamLink::halves(mock, tokio::io::sink());

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_read_error_is_connection_lost() {
        let mock = tokio_test::io::Builder::new()
            .read(b"ok\n")
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
            .build();
        let (mut reader, _writer) = StreamLink::halves(mock, tokio::io::sink());

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("ok"));
        let err = reader.read_line().await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_write_error_is_connection_lost() {
        let mock = tokio_test::io::Builder::new()
            .write(b"$X\n")
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
            .build();
        let (_reader, mut writer) = StreamLink::halves(tokio::io::empty(), mock);

        writer.write_line("$X").await.unwrap();
        let err = writer.write_realtime(b'!').await.unwrap_err();
        assert!(err.is_connection_lost());
    }
}
