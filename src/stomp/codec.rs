use std::io::{BufRead, Read, Write};

use anyhow::{Context, bail};
use bytes::Bytes;

use crate::stomp::frame::{Command, Frame, unescape_header};

/// Upper bound on a single header line. A peer shipping more than this is
/// broken or hostile.
const MAX_HEADER_LINE: usize = 64 * 1024;

/// Upper bound on a frame body read without a content-length header.
const MAX_BODY: usize = 16 * 1024 * 1024;

/// Incremental STOMP frame reader over any buffered byte stream.
///
/// Heart-beat EOLs between frames are consumed silently. `read_frame`
/// returns `Ok(None)` on clean EOF at a frame boundary.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        // Skip heart-beats (bare EOLs) until a command line shows up.
        let command = loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            if !line.is_empty() {
                break Command::parse(&line)
                    .with_context(|| format!("unknown STOMP command: {line:?}"))?;
            }
        };

        let mut frame = Frame::new(command);
        loop {
            let line = self
                .read_line()?
                .context("connection closed mid-frame (headers)")?;
            if line.is_empty() {
                break;
            }
            let (name, value) = split_header(&line, command)?;
            frame.headers.push((name, value));
        }

        frame.body = self.read_body(frame.content_length())?;
        Ok(Some(frame))
    }

    /// One `\n`-terminated line with the EOL (and optional `\r`) stripped.
    /// `None` on EOF before any byte.
    fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        let mut raw = Vec::new();
        let n = (&mut self.inner)
            .take(MAX_HEADER_LINE as u64)
            .read_until(b'\n', &mut raw)
            .context("read line")?;
        if n == 0 {
            return Ok(None);
        }
        if raw.last() == Some(&b'\n') {
            raw.pop();
        } else if raw.len() >= MAX_HEADER_LINE {
            bail!("header line exceeds {MAX_HEADER_LINE} bytes");
        } else {
            bail!("connection closed mid-line");
        }
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        String::from_utf8(raw)
            .context("header line is not utf-8")
            .map(Some)
    }

    fn read_body(&mut self, content_length: Option<usize>) -> anyhow::Result<Bytes> {
        match content_length {
            Some(len) => {
                let mut body = vec![0u8; len];
                self.inner.read_exact(&mut body).context("read body")?;
                let mut nul = [0u8; 1];
                self.inner
                    .read_exact(&mut nul)
                    .context("read frame terminator")?;
                if nul[0] != 0 {
                    bail!("frame body not NUL-terminated after content-length");
                }
                Ok(Bytes::from(body))
            }
            None => {
                let mut body = Vec::new();
                let n = (&mut self.inner)
                    .take(MAX_BODY as u64 + 1)
                    .read_until(0, &mut body)
                    .context("read body")?;
                if n == 0 || body.last() != Some(&0) {
                    bail!("connection closed before frame terminator");
                }
                body.pop();
                Ok(Bytes::from(body))
            }
        }
    }
}

fn split_header(line: &str, command: Command) -> anyhow::Result<(String, String)> {
    let (name, value) = line
        .split_once(':')
        .with_context(|| format!("malformed header line: {line:?}"))?;
    if command.escapes_headers() {
        Ok((unescape_header(name)?, unescape_header(value)?))
    } else {
        Ok((name.to_string(), value.to_string()))
    }
}

/// Write one frame and flush. Counterpart of [`FrameReader`] for the TCP
/// transport.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    writer.write_all(&frame.to_bytes())?;
    writer.flush()
}

/// Write a single heart-beat EOL.
pub fn write_heartbeat<W: Write>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Parse exactly one frame from a standalone buffer: the WebSocket
/// carriage, where each binary message holds one STOMP frame.
pub fn parse_frame(buf: &[u8]) -> anyhow::Result<Frame> {
    let mut reader = FrameReader::new(buf);
    let frame = reader.read_frame()?.context("empty websocket message")?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stomp::frame::headers;

    fn round_trip(frame: &Frame) -> Frame {
        let wire = frame.to_bytes();
        parse_frame(&wire).unwrap()
    }

    #[test]
    fn connect_round_trip() {
        let frame = Frame::with_headers(
            Command::Connect,
            &[
                (headers::ACCEPT_VERSION, "1.2"),
                (headers::LOGIN, "guest"),
                (headers::PASSCODE, "guest"),
                (headers::HEART_BEAT, "5000,5000"),
            ],
        );
        let parsed = round_trip(&frame);
        assert_eq!(parsed.command, Command::Connect);
        assert_eq!(parsed.header(headers::LOGIN), Some("guest"));
        assert_eq!(parsed.header(headers::HEART_BEAT), Some("5000,5000"));
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn message_with_body_round_trip() {
        let mut frame = Frame::new(Command::Message);
        frame
            .set_header(headers::DESTINATION, "/topic/foo")
            .set_header(headers::SUBSCRIPTION, "sub-1")
            .set_header(headers::MESSAGE_ID, "m-9")
            .set_body(Bytes::from_static(b"happy baby melody!"));
        let parsed = round_trip(&frame);
        assert_eq!(parsed.command, Command::Message);
        assert_eq!(parsed.header(headers::SUBSCRIPTION), Some("sub-1"));
        assert_eq!(&parsed.body[..], b"happy baby melody!");
    }

    #[test]
    fn binary_body_with_nul_survives_via_content_length() {
        let mut frame = Frame::new(Command::Send);
        frame
            .set_header(headers::DESTINATION, "/queue/bin")
            .set_body(Bytes::from_static(&[1, 0, 2, 0, 3]));
        let parsed = round_trip(&frame);
        assert_eq!(&parsed.body[..], &[1, 0, 2, 0, 3]);
    }

    #[test]
    fn reader_skips_heartbeats_between_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"\n\n");
        wire.extend_from_slice(&Frame::new(Command::Connected).to_bytes());
        wire.extend_from_slice(b"\n");
        wire.extend_from_slice(&Frame::new(Command::Receipt).to_bytes());

        let mut reader = FrameReader::new(&wire[..]);
        assert_eq!(reader.read_frame().unwrap().unwrap().command, Command::Connected);
        assert_eq!(reader.read_frame().unwrap().unwrap().command, Command::Receipt);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn reader_reports_clean_eof() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn unknown_command_is_an_error() {
        let mut reader = FrameReader::new(&b"NONSENSE\n\n\x00"[..]);
        assert!(reader.read_frame().is_err());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut reader = FrameReader::new(&b"MESSAGE\ndestination:/a\n\nbody-without-nul"[..]);
        assert!(reader.read_frame().is_err());
    }

    #[test]
    fn crlf_lines_are_accepted() {
        let wire = b"CONNECTED\r\nversion:1.2\r\n\r\n\x00";
        let frame = parse_frame(wire).unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.header(headers::VERSION), Some("1.2"));
    }
}
