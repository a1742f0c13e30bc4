use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

const LINE_TERMINATOR: u8 = b'\n';

/// Reading half of a newline-delimited text channel.
///
/// Yields one line per call with the terminator stripped. End of stream and
/// read failures both end the sequence; once `next_line` returns `None` it
/// keeps returning `None`. Lines that are not valid UTF-8 are skipped. Lines
/// are not length limited at this layer.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    closed: bool,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(1024),
            closed: false,
        }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if self.closed {
                return None;
            }

            self.buf.clear();
            match self.reader.read_until(LINE_TERMINATOR, &mut self.buf).await {
                Ok(0) => {
                    tracing::info!("line channel reached end of stream");
                    self.closed = true;
                }
                Ok(_) => {
                    if self.buf.last() == Some(&LINE_TERMINATOR) {
                        self.buf.pop();
                        if self.buf.last() == Some(&b'\r') {
                            self.buf.pop();
                        }
                    }
                    match String::from_utf8(std::mem::take(&mut self.buf)) {
                        Ok(line) => return Some(line),
                        Err(err) => {
                            tracing::debug!(error = %err, "dropping line that is not valid UTF-8");
                            self.buf = err.into_bytes();
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "line channel read failed");
                    self.closed = true;
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Writing half of a newline-delimited text channel.
///
/// Each call writes exactly one terminated line and flushes it. Callers that
/// share a writer must serialize access themselves.
pub struct LineWriter<W> {
    writer: W,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        if line.as_bytes().contains(&LINE_TERMINATOR) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "outbound message contains a line terminator",
            ));
        }
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(LINE_TERMINATOR);
        self.writer.write_all(&frame).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn splits_lines_and_strips_terminators() {
        let (mut remote, local) = duplex(1024);
        remote
            .write_all(b"{\"id\":1}\n{\"id\":2}\r\n\npartial")
            .await
            .unwrap();
        drop(remote);

        let mut reader = LineReader::new(local);
        assert_eq!(reader.next_line().await.as_deref(), Some("{\"id\":1}"));
        assert_eq!(reader.next_line().await.as_deref(), Some("{\"id\":2}"));
        assert_eq!(reader.next_line().await.as_deref(), Some(""));
        assert_eq!(reader.next_line().await.as_deref(), Some("partial"));
        assert_eq!(reader.next_line().await, None);
        assert!(reader.is_closed());
        assert_eq!(reader.next_line().await, None);
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped_without_closing_the_channel() {
        let (mut remote, local) = duplex(1024);
        remote.write_all(b"{\"id\":6,\"result\":\"Sc\xffene\"}\n").await.unwrap();
        remote.write_all(b"ok\n").await.unwrap();
        drop(remote);

        let mut reader = LineReader::new(local);
        assert_eq!(reader.next_line().await.as_deref(), Some("ok"));
        assert!(!reader.is_closed());
        assert_eq!(reader.next_line().await, None);
    }

    #[tokio::test]
    async fn writer_terminates_each_message() {
        let (remote, local) = duplex(1024);
        let mut writer = LineWriter::new(local);
        writer.write_line("{\"id\":7}").await.unwrap();
        writer.write_line("{\"id\":8}").await.unwrap();
        drop(writer);

        let mut reader = LineReader::new(remote);
        assert_eq!(reader.next_line().await.as_deref(), Some("{\"id\":7}"));
        assert_eq!(reader.next_line().await.as_deref(), Some("{\"id\":8}"));
    }

    #[tokio::test]
    async fn writer_rejects_embedded_newline() {
        let (_remote, local) = duplex(64);
        let mut writer = LineWriter::new(local);
        let err = writer.write_line("a\nb").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
