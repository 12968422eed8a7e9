use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Line-oriented pipe pair to a running process.
///
/// Reading yields lines without their trailing `\r`/`\n`; invalid UTF-8 is
/// replaced rather than rejected. Writing appends a single `\n`.
#[derive(Debug)]
pub struct LineTransport<R, W> {
    reader: R,
    writer: Option<W>,
    buf: Vec<u8>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: Some(writer),
            buf: Vec::new(),
        }
    }

    /// Next line, or `None` at end of stream.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let end = self
            .buf
            .iter()
            .rposition(|b| !matches!(b, b'\n' | b'\r'))
            .map_or(0, |i| i + 1);
        Ok(Some(String::from_utf8_lossy(&self.buf[..end]).into_owned()))
    }

    /// Sends `line` followed by a newline. Anything after an embedded line
    /// break is dropped, one call is always one protocol line.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "input already closed"))?;
        let line = line.split(['\r', '\n']).next().unwrap_or_default();
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    pub async fn close_input(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }
}
