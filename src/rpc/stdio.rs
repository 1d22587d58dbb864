//! Content-Length framed transport over byte streams
//!
//! Each message is written as `Content-Length: <n>\r\n\r\n<body>`, the same
//! framing LSP uses, so bodies may contain newlines.

use log::{debug, error, warn};
use std::io;
use std::sync::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::FrameConfig;
use super::error::TransportError;
use super::lock;
use super::transport::Transport;

const CONTENT_LENGTH: &str = "Content-Length:";

/// Longest header line accepted before a newline
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

/// Frame one body
pub fn encode_frame(body: &str) -> String {
    format!("{} {}\r\n\r\n{}", CONTENT_LENGTH, body.len(), body)
}

/// Read the next frame. Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R>(reader: &mut R, config: &FrameConfig) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();

    let content_length = loop {
        line.clear();
        if read_header_line(reader, &mut line).await? == 0 {
            return Ok(None);
        }

        let header = line.trim();
        if header.is_empty() {
            continue;
        }

        let Some(length) = header.strip_prefix(CONTENT_LENGTH) else {
            warn!("Invalid header: {}", header);
            continue;
        };
        match length.trim().parse::<usize>() {
            Ok(length) => break length,
            Err(_) => {
                warn!("Invalid Content-Length: {}", header);
                continue;
            }
        }
    };

    if content_length > config.max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame of {} bytes exceeds limit of {} bytes",
                content_length, config.max_frame_bytes
            ),
        ));
    }

    // Skip any remaining headers up to the blank separator line
    loop {
        line.clear();
        if read_header_line(reader, &mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF inside frame header",
            ));
        }
        if line.trim().is_empty() {
            break;
        }
    }

    let mut buffer = vec![0u8; content_length];
    reader.read_exact(&mut buffer).await?;

    String::from_utf8(buffer)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Invalid UTF-8"))
}

/// Read one header line, failing if no newline shows up within
/// [`MAX_HEADER_LINE_BYTES`].
async fn read_header_line<R>(reader: &mut R, line: &mut String) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader)
        .take(MAX_HEADER_LINE_BYTES as u64)
        .read_line(line)
        .await?;
    if read >= MAX_HEADER_LINE_BYTES && !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("header line exceeds {} bytes", MAX_HEADER_LINE_BYTES),
        ));
    }
    Ok(read)
}

/// [`Transport`] over an `AsyncRead`/`AsyncWrite` pair
pub struct FramedTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    read_handle: JoinHandle<()>,
}

impl FramedTransport {
    /// Spawn the read and write loops. Must be called within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, config: FrameConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let read_handle = tokio::spawn(async move {
            if let Err(e) = Self::read_loop(BufReader::new(reader), inbound_tx, config).await {
                error!("Framed read loop error: {}", e);
            }
        });

        tokio::spawn(async move {
            if let Err(e) = Self::write_loop(writer, outbound_rx).await {
                error!("Framed write loop error: {}", e);
            }
        });

        Self {
            outbound: outbound_tx,
            inbound: Mutex::new(Some(inbound_rx)),
            read_handle,
        }
    }

    /// Transport over this process's stdin/stdout
    pub fn stdio(config: FrameConfig) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), config)
    }

    async fn read_loop<R>(
        mut reader: R,
        inbound: mpsc::UnboundedSender<String>,
        config: FrameConfig,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        debug!("Framed read loop started");

        while let Some(body) = read_frame(&mut reader, &config).await? {
            if inbound.send(body).is_err() {
                debug!("Inbound listener dropped, terminating read loop");
                return Ok(());
            }
        }

        debug!("EOF reached, terminating read loop");
        Ok(())
    }

    async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<String>) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(body) = outbound.recv().await {
            writer.write_all(encode_frame(&body).as_bytes()).await?;
            writer.flush().await?;
        }

        debug!("Outbound channel closed, terminating write loop");
        Ok(())
    }
}

impl Transport for FramedTransport {
    fn send(&self, body: String) -> Result<(), TransportError> {
        self.outbound
            .send(body)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        lock(&self.inbound).take()
    }
}

impl Drop for FramedTransport {
    fn drop(&mut self) {
        // The write loop drains and exits once `outbound` is dropped
        self.read_handle.abort();
    }
}
