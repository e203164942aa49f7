//! Byte pipes to controllers that speak a command protocol

use crate::error::{FloppyError, HardwareFault, Result};
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ordered byte pipe with read deadlines
pub trait Transport: Send {
    /// Device path or label
    fn name(&self) -> &str;

    /// Send bytes
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive exactly `len` bytes before the deadline
    fn recv(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Receive bytes up to and including `terminator`
    fn recv_until(&mut self, terminator: u8, timeout: Duration, limit: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let byte = self.recv(1, left)?[0];
            out.push(byte);
            if byte == terminator {
                return Ok(out);
            }
            if out.len() >= limit {
                return Err(FloppyError::corrupt(format!("{}: stream exceeded {} bytes", self.name(), limit)));
            }
        }
    }
}

/// Re-tag transport failures with the backend that hit them
pub fn fault(backend: &'static str, err: FloppyError) -> FloppyError {
    match err {
        FloppyError::Timeout(msg) => FloppyError::hardware(backend, HardwareFault::Timeout, 0, msg),
        FloppyError::Io(e) => FloppyError::hardware(backend, HardwareFault::Io, 0, e.to_string()),
        other => other,
    }
}

#[derive(Default)]
struct Inbox {
    data: Mutex<VecDeque<u8>>,
    ready: Condvar,
    closed: AtomicBool,
}

/// CDC-ACM serial device node, already configured for raw mode.
///
/// A reader thread drains the port into an inbox so reads can honour a
/// deadline; it exits when the port reports end of file or an error.
pub struct SerialTransport {
    name: String,
    port: File,
    inbox: Arc<Inbox>,
}

impl SerialTransport {
    /// Open a device node
    pub fn open(path: &Path) -> Result<Self> {
        let port = OpenOptions::new().read(true).write(true).open(path)?;
        let mut reader = port.try_clone()?;
        let inbox = Arc::new(Inbox::default());
        let feed = inbox.clone();
        std::thread::Builder::new()
            .name(format!("serial-{}", path.display()))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            feed.data.lock().extend(&buf[..n]);
                            feed.ready.notify_all();
                        }
                    }
                }
                feed.closed.store(true, Ordering::SeqCst);
                feed.ready.notify_all();
            })?;
        Ok(Self {
            name: path.display().to_string(),
            port,
            inbox,
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!("{} <- {:02X?}", self.name, &data[..data.len().min(16)]);
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn recv(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut data = self.inbox.data.lock();
        while data.len() < len {
            if self.inbox.closed.load(Ordering::SeqCst) {
                return Err(FloppyError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} closed", self.name),
                )));
            }
            if self.inbox.ready.wait_until(&mut data, deadline).timed_out() && data.len() < len {
                return Err(FloppyError::Timeout(format!(
                    "{}: wanted {} bytes, have {}",
                    self.name,
                    len,
                    data.len()
                )));
            }
        }
        let out: Vec<u8> = data.drain(..len).collect();
        trace!("{} -> {:02X?}", self.name, &out[..out.len().min(16)]);
        Ok(out)
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// In-process device model: every send is answered by a responder closure
pub struct Loopback {
    responder: Responder,
    inbox: VecDeque<u8>,
    /// Everything sent, one entry per `send`
    pub sent: Vec<Vec<u8>>,
}

impl Loopback {
    /// Wrap a responder
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            inbox: VecDeque::new(),
            sent: Vec::new(),
        }
    }
}

impl Transport for Loopback {
    fn name(&self) -> &str {
        "loopback"
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.sent.push(data.to_vec());
        let reply = (self.responder)(data);
        self.inbox.extend(reply);
        Ok(())
    }

    fn recv(&mut self, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        if self.inbox.len() < len {
            return Err(FloppyError::Timeout(format!(
                "loopback: wanted {} bytes, have {}",
                len,
                self.inbox.len()
            )));
        }
        Ok(self.inbox.drain(..len).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_loopback_echo() {
        let mut t = Loopback::new(|d| d.iter().rev().copied().collect());
        t.send(&[1, 2, 3]).unwrap();
        assert_eq!(t.recv(2, Duration::ZERO).unwrap(), vec![3, 2]);
        assert_eq!(t.recv(1, Duration::ZERO).unwrap(), vec![1]);
        let err = t.recv(1, Duration::ZERO).unwrap_err();
        assert_eq!(fault("greaseweazle", err).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_recv_until() {
        let mut t = Loopback::new(|_| vec![5, 6, 0, 7]);
        t.send(&[0]).unwrap();
        assert_eq!(t.recv_until(0, Duration::ZERO, 64).unwrap(), vec![5, 6, 0]);
        assert_eq!(t.recv(1, Duration::ZERO).unwrap(), vec![7]);
    }

    #[test]
    fn test_serial_missing_node() {
        let err = SerialTransport::open(Path::new("/nonexistent/ttyACM9")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
