use std::collections::VecDeque;
use std::io;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use crate::channel::{ByteChannel, ChannelRead};

#[derive(Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-process duplex byte channel, created with [MemoryChannel::pair]. It behaves
///  like a non-blocking stream: reads return whatever the peer wrote so far, and closing either
///  end makes the other end see end of stream once it drained the buffered bytes.
pub struct MemoryChannel {
    name: String,
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
}

impl MemoryChannel {
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let a_to_b = Arc::new(Mutex::new(Pipe::default()));
        let b_to_a = Arc::new(Mutex::new(Pipe::default()));

        let a = MemoryChannel {
            name: "memory a -> b".to_string(),
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
        };
        let b = MemoryChannel {
            name: "memory b -> a".to_string(),
            inbound: a_to_b,
            outbound: b_to_a,
        };
        (a, b)
    }

    /// number of bytes written by the peer that were not read yet
    pub fn pending_inbound(&self) -> usize {
        self.inbound.lock().unwrap().data.len()
    }
}

impl ByteChannel for MemoryChannel {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<ChannelRead> {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.data.is_empty() {
            return Ok(if inbound.closed { ChannelRead::EndOfStream } else { ChannelRead::Nothing });
        }

        let n = buf.len().min(inbound.data.len());
        for (dst, src) in buf.iter_mut().zip(inbound.data.drain(..n)) {
            *dst = src;
        }
        Ok(ChannelRead::Data(n))
    }

    fn write_fragment(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut outbound = self.outbound.lock().unwrap();
        if outbound.closed {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "memory channel is closed"));
        }
        outbound.data.extend(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.outbound.lock().unwrap().closed = true;
        self.inbound.lock().unwrap().closed = true;
        Ok(())
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}
