//! Remote command channel: fixed 4-byte big-endian `i32` datagrams.
//!
//! Any 4-byte payload is a command. There is no type tag, checksum or
//! sequence number, so the listener cannot tell a stray datagram from a
//! real command. Delivery is fire-and-forget and the newest value wins.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use crate::shutdown::ShutdownSignal;
use std::time::Duration;

pub const COMMAND_LEN: usize = core::mem::size_of::<i32>();

/// Largest UDP payload over IPv4. Heap allocated so an oversized packet is
/// consumed in one read and reported with its real size.
const RECV_BUFFER_LEN: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket {
    pub raw_bytes: [u8; COMMAND_LEN],
    pub source_size: usize,
}

impl CommandPacket {
    pub fn from_datagram(payload: &[u8]) -> Result<Self, FrameError> {
        let raw_bytes: [u8; COMMAND_LEN] = payload
            .try_into()
            .map_err(|_| FrameError::InvalidSize(payload.len()))?;
        Ok(Self {
            raw_bytes,
            source_size: payload.len(),
        })
    }

    /// Network to host byte order.
    pub fn value(&self) -> i32 {
        i32::from_be_bytes(self.raw_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    InvalidSize(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize(size) => write!(f, "invalid packet size {size}"),
        }
    }
}

impl std::error::Error for FrameError {}

pub fn decode_command(payload: &[u8]) -> Result<i32, FrameError> {
    CommandPacket::from_datagram(payload).map(|packet| packet.value())
}

pub fn encode_command(value: i32) -> [u8; COMMAND_LEN] {
    value.to_be_bytes()
}

/// Non-blocking source of whole datagrams.
pub trait DatagramSource {
    /// Read one waiting datagram into `buf`, consuming all of it.
    /// `Ok(None)` means nothing is waiting.
    fn poll_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

impl DatagramSource for UdpSocket {
    fn poll_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.recv_from(buf) {
            Ok((len, _)) => Ok(Some(len)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub type CommandCallback = Box<dyn FnMut(i32) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Dispatched(i32),
    Rejected(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub accepted: u32,
    pub rejected: u32,
}

/// Owns the command socket for its whole lifetime. The socket is bound in
/// the constructor and there is no way to rebind it afterwards.
pub struct CommandListener<S: DatagramSource = UdpSocket> {
    source: S,
    callback: Option<CommandCallback>,
    buffer: Box<[u8]>,
    stats: ListenerStats,
}

impl CommandListener<UdpSocket> {
    pub fn bind(port: u16, callback: Option<CommandCallback>) -> io::Result<Self> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        log::info!("UDP: listening on port {}", socket.local_addr()?.port());
        Ok(Self::with_source(socket, callback))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.source.local_addr()
    }
}

impl<S: DatagramSource> CommandListener<S> {
    pub fn with_source(source: S, callback: Option<CommandCallback>) -> Self {
        Self {
            source,
            callback,
            buffer: vec![0u8; RECV_BUFFER_LEN].into_boxed_slice(),
            stats: ListenerStats::default(),
        }
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats
    }

    /// Handle at most one waiting datagram. The callback runs inline.
    pub fn poll_once(&mut self) -> PollOutcome {
        let len = match self.source.poll_datagram(&mut self.buffer) {
            Ok(Some(len)) => len,
            Ok(None) => return PollOutcome::Idle,
            Err(e) => {
                log::warn!("UDP: receive error: {}", e);
                return PollOutcome::Idle;
            }
        };

        if len == 0 {
            return PollOutcome::Idle;
        }

        match decode_command(&self.buffer[..len]) {
            Ok(value) => {
                log::info!("UDP received: {}", value);
                self.stats.accepted = self.stats.accepted.wrapping_add(1);
                if let Some(callback) = self.callback.as_mut() {
                    callback(value);
                }
                PollOutcome::Dispatched(value)
            }
            Err(FrameError::InvalidSize(size)) => {
                log::warn!("UDP: invalid packet size {}", size);
                self.stats.rejected = self.stats.rejected.wrapping_add(1);
                PollOutcome::Rejected(size)
            }
        }
    }

    /// Poll every `period` until `shutdown` is raised.
    pub fn run(&mut self, period: Duration, shutdown: &ShutdownSignal) {
        loop {
            self.poll_once();
            if !shutdown.sleep(period) {
                break;
            }
        }
        log::info!(
            "UDP listener stopped ({} accepted, {} rejected)",
            self.stats.accepted,
            self.stats.rejected
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct QueuedSource {
        datagrams: VecDeque<Vec<u8>>,
    }

    impl QueuedSource {
        fn new(datagrams: &[&[u8]]) -> Self {
            Self {
                datagrams: datagrams.iter().map(|d| d.to_vec()).collect(),
            }
        }
    }

    impl DatagramSource for QueuedSource {
        fn poll_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            Ok(self.datagrams.pop_front().map(|d| {
                let len = d.len().min(buf.len());
                buf[..len].copy_from_slice(&d[..len]);
                len
            }))
        }
    }

    fn recording_callback() -> (Arc<Mutex<Vec<i32>>>, CommandCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Box::new(move |v| sink.lock().unwrap().push(v)))
    }

    #[test]
    fn test_decode_forty_two() {
        assert_eq!(decode_command(&[0x00, 0x00, 0x00, 0x2A]), Ok(42));
    }

    #[test]
    fn test_decode_negative_value() {
        assert_eq!(decode_command(&[0xFF, 0xFF, 0xFF, 0xFE]), Ok(-2));
        assert_eq!(decode_command(&[0x80, 0, 0, 0]), Ok(i32::MIN));
    }

    #[test]
    fn test_decode_rejects_wrong_sizes() {
        assert_eq!(decode_command(&[]), Err(FrameError::InvalidSize(0)));
        assert_eq!(decode_command(&[1, 2, 3]), Err(FrameError::InvalidSize(3)));
        assert_eq!(decode_command(&[0; 7]), Err(FrameError::InvalidSize(7)));
    }

    #[test]
    fn test_packet_keeps_source_size() {
        let packet = CommandPacket::from_datagram(&[0, 0, 1, 0]).unwrap();
        assert_eq!(packet.source_size, 4);
        assert_eq!(packet.value(), 256);
    }

    #[test]
    fn test_dispatches_valid_command_once() {
        let (seen, callback) = recording_callback();
        let source = QueuedSource::new(&[&[0x00, 0x00, 0x00, 0x2A]]);
        let mut listener = CommandListener::with_source(source, Some(callback));

        assert_eq!(listener.poll_once(), PollOutcome::Dispatched(42));
        assert_eq!(listener.poll_once(), PollOutcome::Idle);
        assert_eq!(*seen.lock().unwrap(), vec![42]);
        assert_eq!(listener.stats(), ListenerStats { accepted: 1, rejected: 0 });
    }

    #[test]
    fn test_invalid_size_then_valid_command() {
        let (seen, callback) = recording_callback();
        let source = QueuedSource::new(&[&[1, 2, 3, 4, 5, 6, 7], &[0, 0, 0, 7]]);
        let mut listener = CommandListener::with_source(source, Some(callback));

        assert_eq!(listener.poll_once(), PollOutcome::Rejected(7));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(listener.poll_once(), PollOutcome::Dispatched(7));
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert_eq!(listener.stats(), ListenerStats { accepted: 1, rejected: 1 });
    }

    #[test]
    fn test_without_callback_still_decodes() {
        let source = QueuedSource::new(&[&[0, 0, 0, 1]]);
        let mut listener = CommandListener::with_source(source, None);
        assert_eq!(listener.poll_once(), PollOutcome::Dispatched(1));
    }

    #[test]
    fn test_empty_datagram_is_ignored() {
        let (seen, callback) = recording_callback();
        let source = QueuedSource::new(&[&[]]);
        let mut listener = CommandListener::with_source(source, Some(callback));
        assert_eq!(listener.poll_once(), PollOutcome::Idle);
        assert!(seen.lock().unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_decode_matches_big_endian(value in any::<i32>()) {
            prop_assert_eq!(decode_command(&encode_command(value)), Ok(value));
        }

        #[test]
        fn prop_other_sizes_never_dispatch(payload in proptest::collection::vec(any::<u8>(), 1..64)) {
            prop_assume!(payload.len() != COMMAND_LEN);
            let (seen, callback) = recording_callback();
            let source = QueuedSource::new(&[payload.as_slice()]);
            let mut listener = CommandListener::with_source(source, Some(callback));

            prop_assert_eq!(listener.poll_once(), PollOutcome::Rejected(payload.len()));
            prop_assert!(seen.lock().unwrap().is_empty());
        }
    }
}
