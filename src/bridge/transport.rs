use std::io::{BufReader, ErrorKind};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message as WsMessage, WebSocket};
use url::Url;

use crate::stomp::{Frame, FrameReader, parse_frame, write_frame, write_heartbeat};

/// Poll interval while a WebSocket read has no data. Reads hold the socket
/// lock, so they must time out quickly to let writers in.
const WS_READ_TIMEOUT: Duration = Duration::from_millis(50);

type WsSocket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Read half of a broker connection: owned by the handshake first, then
/// moved into the reader thread.
pub(crate) enum TransportReader {
    Tcp(FrameReader<BufReader<TcpStream>>),
    Ws(Arc<Mutex<WsSocket>>),
}

/// Write half of a broker connection: shared by producers, the heartbeat
/// thread, and disconnect.
#[derive(Clone)]
pub(crate) enum TransportWriter {
    Tcp(Arc<Mutex<TcpStream>>),
    Ws(Arc<Mutex<WsSocket>>),
}

/// Dial the broker over raw TCP. Returns split read/write halves over the
/// same socket.
pub(crate) fn dial_tcp(addr: &str) -> anyhow::Result<(TransportReader, TransportWriter)> {
    let stream = TcpStream::connect(addr).with_context(|| format!("tcp connect to {addr}"))?;
    stream.set_nodelay(true).ok();
    let write_half = stream.try_clone().context("clone tcp stream")?;
    Ok((
        TransportReader::Tcp(FrameReader::new(BufReader::new(stream))),
        TransportWriter::Tcp(Arc::new(Mutex::new(write_half))),
    ))
}

/// Dial the broker over WebSocket. One STOMP frame per binary message; both
/// halves share the socket behind a lock.
pub(crate) fn dial_ws(url: &str) -> anyhow::Result<(TransportReader, TransportWriter)> {
    Url::parse(url).with_context(|| format!("invalid websocket url {url}"))?;
    let (socket, _response) =
        tungstenite::connect(url).with_context(|| format!("websocket connect to {url}"))?;
    if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
        stream.set_read_timeout(Some(WS_READ_TIMEOUT)).ok();
        stream.set_nodelay(true).ok();
    }
    let socket = Arc::new(Mutex::new(socket));
    Ok((
        TransportReader::Ws(socket.clone()),
        TransportWriter::Ws(socket),
    ))
}

impl TransportReader {
    /// Blocking read of the next frame. `Ok(None)` means the peer closed
    /// cleanly.
    pub(crate) fn read_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        match self {
            TransportReader::Tcp(reader) => reader.read_frame(),
            TransportReader::Ws(socket) => loop {
                let message = {
                    let mut socket = socket.lock();
                    match socket.read() {
                        Ok(message) => message,
                        Err(tungstenite::Error::Io(ref e))
                            if e.kind() == ErrorKind::WouldBlock
                                || e.kind() == ErrorKind::TimedOut =>
                        {
                            drop(socket);
                            std::thread::sleep(Duration::from_millis(2));
                            continue;
                        }
                        Err(
                            tungstenite::Error::ConnectionClosed
                            | tungstenite::Error::AlreadyClosed,
                        ) => return Ok(None),
                        Err(e) => return Err(e).context("websocket read"),
                    }
                };
                match message {
                    WsMessage::Binary(bytes) => return parse_frame(&bytes).map(Some),
                    WsMessage::Text(text) => return parse_frame(text.as_bytes()).map(Some),
                    WsMessage::Close(_) => return Ok(None),
                    // Ping/pong are transport plumbing; tungstenite answers
                    // pings on its own.
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                }
            },
        }
    }
}

impl TransportWriter {
    pub(crate) fn write_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        match self {
            TransportWriter::Tcp(stream) => {
                write_frame(&mut *stream.lock(), frame).context("tcp write frame")
            }
            TransportWriter::Ws(socket) => {
                let payload = frame.to_bytes().to_vec();
                let mut socket = socket.lock();
                send_ws(&mut socket, WsMessage::Binary(payload)).context("websocket write frame")
            }
        }
    }

    pub(crate) fn write_heartbeat(&self) -> anyhow::Result<()> {
        match self {
            TransportWriter::Tcp(stream) => {
                write_heartbeat(&mut *stream.lock()).context("tcp heartbeat")
            }
            TransportWriter::Ws(socket) => {
                let mut socket = socket.lock();
                send_ws(&mut socket, WsMessage::Binary(b"\n".to_vec()))
                    .context("websocket heartbeat")
            }
        }
    }

    /// Tear the transport down, unblocking the reader.
    pub(crate) fn shutdown(&self) {
        match self {
            TransportWriter::Tcp(stream) => {
                let _ = stream.lock().shutdown(Shutdown::Both);
            }
            TransportWriter::Ws(socket) => {
                let mut socket = socket.lock();
                let _ = socket.close(None);
                if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
        }
    }
}

/// Write retrying over the read-timeout WouldBlock the shared socket
/// inherits from its stream settings.
fn send_ws(socket: &mut WsSocket, message: WsMessage) -> tungstenite::Result<()> {
    match socket.send(message) {
        Err(tungstenite::Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => socket.flush(),
        other => other,
    }
}
