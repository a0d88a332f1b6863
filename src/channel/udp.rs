use std::io;
use std::io::ErrorKind;
use std::net::UdpSocket;
use tracing::debug;
use crate::channel::{ByteChannel, ChannelRead};

/// A connected UDP socket. Each fragment travels in its own datagram, so the configured fragment
///  size must leave room for the fragment header inside the path's datagram size.
pub struct UdpChannel {
    socket: UdpSocket,
    description: String,
    closed: bool,
}

impl UdpChannel {
    /// switches the (connected) socket to non-blocking mode
    pub fn new(socket: UdpSocket) -> io::Result<UdpChannel> {
        socket.set_nonblocking(true)?;

        let description = format!("udp {:?} -> {:?}", socket.local_addr()?, socket.peer_addr()?);
        debug!("initialized {}", description);

        Ok(UdpChannel {
            socket,
            description,
            closed: false,
        })
    }
}

impl ByteChannel for UdpChannel {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<ChannelRead> {
        if self.closed {
            return Ok(ChannelRead::EndOfStream);
        }

        match self.socket.recv(buf) {
            Ok(n) => Ok(ChannelRead::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Ok(ChannelRead::Nothing),
            // an ICMP 'port unreachable' for an earlier datagram, the peer is not listening (yet)
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(ChannelRead::Nothing),
            Err(e) => Err(e),
        }
    }

    fn write_fragment(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(ErrorKind::NotConnected, "udp channel is closed"));
        }

        loop {
            match self.socket.send(buf) {
                Ok(sent) if sent == buf.len() => return Ok(()),
                Ok(sent) => return Err(io::Error::new(ErrorKind::WriteZero, format!("sent {} of {} bytes in a datagram", sent, buf.len()))),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}
