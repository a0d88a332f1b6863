//! The non-blocking byte channel a [crate::conduit::Conduit] runs on. Establishing the
//!  connection is the caller's business - a channel is handed to the conduit already connected.

mod memory;
mod tcp;
mod udp;

use std::io;
#[cfg(test)] use mockall::automock;

pub use memory::MemoryChannel;
pub use tcp::TcpChannel;
pub use udp::UdpChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRead {
    Data(usize),
    /// no data available right now, try again later
    Nothing,
    EndOfStream,
}

/// This is an abstraction for non-blocking I/O on a connected channel, introduced to decouple
///  the conduit from TCP vs UDP and to facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
pub trait ByteChannel: Send + 'static {
    /// read whatever is available without blocking
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<ChannelRead>;

    /// Write a single serialized fragment. Datagram based channels send it as a single datagram,
    ///  stream based channels write all of it, retrying while the channel would block.
    fn write_fragment(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    /// human readable description of the channel's endpoints for logging
    fn description(&self) -> String;
}
