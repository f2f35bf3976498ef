//! Frame transport for connection agents.
//!
//! Frames are newline-delimited JSON documents over any tokio byte stream.
//! The agent only sees the [`FrameReader`] / [`FrameWriter`] seams, so tests
//! can drive it over an in-memory duplex pipe.

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

use crate::error::{ConnectionError, ConnectionResult};

/// Source of inbound frames.
#[async_trait]
pub trait FrameReader: Send {
    /// Next frame, or `None` once the peer closed the stream.
    async fn read_frame(&mut self) -> ConnectionResult<Option<Vec<u8>>>;
}

/// Sink for outbound frames.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one complete frame and flush it.
    async fn write_frame(&mut self, frame: &[u8]) -> ConnectionResult<()>;
    /// Shut the write side down.
    async fn close(&mut self) -> ConnectionResult<()>;
}

/// Reads `\n`-terminated frames, rejecting any longer than `max_size` bytes.
pub struct LineReader<R> {
    reader: BufReader<R>,
    max_size: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(reader: R, max_size: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_size,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for LineReader<R> {
    async fn read_frame(&mut self) -> ConnectionResult<Option<Vec<u8>>> {
        loop {
            self.buf.clear();
            // One byte of headroom for the terminator.
            let limit = self.max_size as u64 + 1;
            let read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if read == 0 {
                return Ok(None);
            }

            let terminated = self.buf.last() == Some(&b'\n');
            if !terminated && read as u64 == limit {
                return Err(ConnectionError::MessageTooLarge {
                    size: read,
                    limit: self.max_size,
                });
            }

            let mut end = self.buf.len();
            while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
                end -= 1;
            }
            let frame = &self.buf[..end];
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(frame.to_vec()));
        }
    }
}

/// Writes each frame followed by `\n`.
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for LineWriter<W> {
    async fn write_frame(&mut self, frame: &[u8]) -> ConnectionResult<()> {
        self.writer.write_all(frame).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> ConnectionResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Split a byte stream into a line-framed reader and writer.
pub fn split_lines<S>(stream: S, max_size: usize) -> (LineReader<ReadHalf<S>>, LineWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read, write) = tokio::io::split(stream);
    (LineReader::new(read, max_size), LineWriter::new(write))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_frames_and_skips_blank_lines() {
        let input: &[u8] = b"{\"kind\":\"pong\"}\r\n\n  \n{\"kind\":\"leave-session\"}\n";
        let mut reader = LineReader::new(input, 64);

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{\"kind\":\"pong\"}");
        assert_eq!(
            reader.read_frame().await.unwrap().unwrap(),
            b"{\"kind\":\"leave-session\"}"
        );
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unterminated_final_frame() {
        let input: &[u8] = b"abc";
        let mut reader = LineReader::new(input, 64);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"abc");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_at_limit_accepted() {
        let input: &[u8] = b"12345678\n";
        let mut reader = LineReader::new(input, 8);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"12345678");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let input: &[u8] = b"123456789\n";
        let mut reader = LineReader::new(input, 8);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, ConnectionError::MessageTooLarge { limit: 8, .. }));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"{\"kind\"")
            .read(b":\"pong\"}\n{\"ki")
            .read(b"nd\":\"pong\"}\n")
            .build();
        let mut reader = LineReader::new(mock, 64);

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{\"kind\":\"pong\"}");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{\"kind\":\"pong\"}");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_error_surfaces_as_io() {
        let mock = tokio_test::io::Builder::new()
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut reader = LineReader::new(mock, 64);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Io(_)));
    }

    #[tokio::test]
    async fn test_writer_emits_frame_then_terminator() {
        let mock = tokio_test::io::Builder::new()
            .write(b"{\"kind\":\"ping\"}")
            .write(b"\n")
            .build();
        let mut writer = LineWriter::new(mock);

        writer.write_frame(b"{\"kind\":\"ping\"}").await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_appends_newline() {
        let (client, server) = tokio::io::duplex(64);
        let (_, mut writer) = split_lines(server, 64);
        let (mut reader, _) = split_lines(client, 64);

        writer.write_frame(b"{\"kind\":\"ping\"}").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{\"kind\":\"ping\"}");

        writer.close().await.unwrap();
        assert!(reader.read_frame().await.unwrap().is_none());
    }
}
