use std::time::Instant;

use crate::stomp::frame::Frame;

/// One accepted client connection, as seen by an embedded STOMP server.
///
/// The server itself lives outside this crate; this is the seam it feeds
/// frames through.
pub trait RawConnection: Send {
    /// Read a single frame. Blocks until a frame arrives, the read deadline
    /// passes, or the connection dies.
    fn read_frame(&mut self) -> anyhow::Result<Frame>;
    /// Write a single frame.
    fn write_frame(&mut self, frame: &Frame) -> anyhow::Result<()>;
    /// Deadline for subsequent `read_frame` calls.
    fn set_read_deadline(&mut self, deadline: Instant);
    /// Close the connection.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Accept loop seam for an embedded STOMP server.
pub trait RawConnectionListener: Send {
    /// Block until a new connection is established.
    fn accept(&mut self) -> anyhow::Result<Box<dyn RawConnection>>;
    /// Stop listening.
    fn close(&mut self) -> anyhow::Result<()>;
}
