use std::io;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use crate::channel::{ByteChannel, ChannelRead};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpChannel {
    stream: TcpStream,
    description: String,
    /// upper bound for waiting on a full send buffer while writing a single fragment
    write_timeout: Duration,
}

impl TcpChannel {
    /// switches the (connected) stream to non-blocking mode
    pub fn new(stream: TcpStream) -> io::Result<TcpChannel> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let description = format!("tcp {:?} -> {:?}", stream.local_addr()?, stream.peer_addr()?);
        debug!("initialized {}", description);

        Ok(TcpChannel {
            stream,
            description,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> TcpChannel {
        self.write_timeout = write_timeout;
        self
    }
}

impl ByteChannel for TcpChannel {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<ChannelRead> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Ok(ChannelRead::EndOfStream),
            Ok(n) => Ok(ChannelRead::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ChannelRead::Nothing),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(ChannelRead::Nothing),
            Err(e) => Err(e),
        }
    }

    /// Writes the whole fragment, waiting for the peer to drain the send buffer if necessary. If
    ///  the peer does not read for `write_timeout`, this fails with [ErrorKind::TimedOut].
    fn write_fragment(&mut self, mut buf: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + self.write_timeout;
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "tcp stream accepted no data")),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    if Instant::now() >= deadline {
                        warn!("{}: send buffer stayed full for {:?}", self.description, self.write_timeout);
                        return Err(io::Error::new(ErrorKind::TimedOut, "peer does not read from tcp stream"));
                    }
                    trace!("tcp send buffer full - retrying");
                    std::thread::sleep(Duration::from_micros(100));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}
