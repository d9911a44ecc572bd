//! `Content-Length` framing.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use agentlink_core::{Error, Result};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Upper bound on a single header line, terminator included.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Reads `Content-Length`-framed bodies from a byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    header: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            header: String::new(),
        }
    }

    /// Read the next frame body.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    ///
    /// # Errors
    /// Fails on I/O errors, a stream that ends mid-frame, a header line
    /// longer than [`MAX_HEADER_LINE`], or a missing or oversized
    /// `Content-Length`.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            self.header.clear();
            let n = (&mut self.reader)
                .take(MAX_HEADER_LINE as u64)
                .read_line(&mut self.header)
                .await?;
            if n == 0 {
                if saw_header {
                    return Err(Error::Protocol("stream ended inside frame header".into()));
                }
                return Ok(None);
            }
            if n >= MAX_HEADER_LINE && !self.header.ends_with('\n') {
                return Err(Error::Protocol(format!(
                    "header line exceeds {MAX_HEADER_LINE} bytes"
                )));
            }

            let line = self.header.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !saw_header {
                    // Stray blank line between frames.
                    continue;
                }
                break;
            }
            saw_header = true;

            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::Protocol(format!("malformed header line: {line:?}")));
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len = value.trim().parse::<usize>().map_err(|_| {
                    Error::Protocol(format!("invalid Content-Length: {:?}", value.trim()))
                })?;
                content_length = Some(len);
            }
        }

        let len = content_length.ok_or_else(|| Error::Protocol("missing Content-Length".into()))?;
        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!("frame of {len} bytes exceeds limit")));
        }

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Protocol("stream ended inside frame body".into())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Some(body))
    }
}

/// Write one framed body and flush.
///
/// # Errors
/// Returns error if the write fails.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    body: &[u8],
) -> std::io::Result<()> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}
