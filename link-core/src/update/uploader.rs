// Host side of the update session, used by the push tool and the tests

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::protocol::{self, AuthReply, Invitation};
use super::ImageKind;

const INVITATION_ATTEMPTS: u32 = 3;
const ACCEPT_POLL: Duration = Duration::from_millis(10);
const CHUNK_SIZE: usize = 1460;

#[derive(Debug)]
pub enum PushError {
    Io(io::Error),
    NoResponse,
    AuthRequired,
    AuthRejected,
    UnexpectedReply(String),
    DeviceNeverConnected,
    Incomplete,
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::NoResponse => write!(f, "device did not answer the invitation"),
            Self::AuthRequired => write!(f, "device requires a password"),
            Self::AuthRejected => write!(f, "device rejected the password"),
            Self::UnexpectedReply(reply) => write!(f, "unexpected reply {reply:?}"),
            Self::DeviceNeverConnected => write!(f, "device never connected back"),
            Self::Incomplete => write!(f, "device did not confirm the image"),
        }
    }
}

impl std::error::Error for PushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PushError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub struct Uploader {
    device: SocketAddr,
    bind_ip: IpAddr,
    secret: Option<String>,
    timeout: Duration,
}

impl Uploader {
    pub fn new(device: SocketAddr) -> Self {
        Self {
            device,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            secret: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.secret = (!secret.is_empty()).then_some(secret);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Local address the device connects back to.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Offer `image`, answer the challenge and stream it. `progress`
    /// receives `(sent, total)` after every chunk.
    pub fn push(
        &self,
        kind: ImageKind,
        image: &[u8],
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), PushError> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind_ip, 0))?;
        let invitation = Invitation::for_image(kind, listener.local_addr()?.port(), image);

        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0))?;
        socket.set_read_timeout(Some(self.timeout))?;

        let reply = self.invite(&socket, &invitation)?;
        if let Some(nonce) = protocol::parse_challenge(&reply) {
            let secret = self.secret.as_deref().ok_or(PushError::AuthRequired)?;
            let cnonce = client_nonce();
            let answer = AuthReply::new(secret, nonce, &cnonce);
            socket.send_to(answer.encode().as_bytes(), self.device)?;
            match recv_line(&socket, self.device)? {
                Some(line) if line == protocol::REPLY_OK => {}
                Some(line) if line == protocol::REPLY_AUTH_FAILED => {
                    return Err(PushError::AuthRejected)
                }
                Some(line) => return Err(PushError::UnexpectedReply(line)),
                None => return Err(PushError::NoResponse),
            }
        } else if reply != protocol::REPLY_OK {
            return Err(PushError::UnexpectedReply(reply));
        }

        let mut stream = self.accept(&listener)?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_read_timeout(Some(self.timeout))?;

        let mut sent = 0;
        for chunk in image.chunks(CHUNK_SIZE) {
            stream.write_all(chunk)?;
            sent += chunk.len();
            progress(sent, image.len());
        }
        stream.flush()?;

        let mut acks = Vec::new();
        match stream.read_to_end(&mut acks) {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset) => {}
            Err(e) => return Err(e.into()),
        }
        if acks.ends_with(protocol::REPLY_OK.as_bytes()) {
            Ok(())
        } else {
            Err(PushError::Incomplete)
        }
    }

    fn invite(&self, socket: &UdpSocket, invitation: &Invitation) -> Result<String, PushError> {
        let message = invitation.encode();
        for _ in 0..INVITATION_ATTEMPTS {
            socket.send_to(message.as_bytes(), self.device)?;
            if let Some(line) = recv_line(socket, self.device)? {
                return Ok(line);
            }
        }
        Err(PushError::NoResponse)
    }

    fn accept(&self, listener: &TcpListener) -> Result<TcpStream, PushError> {
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + self.timeout;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(PushError::DeviceNeverConnected);
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// One datagram from `device` as trimmed text, `None` on timeout.
fn recv_line(socket: &UdpSocket, device: SocketAddr) -> Result<Option<String>, PushError> {
    let mut buf = [0u8; 256];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) if from == device => {
                return Ok(Some(String::from_utf8_lossy(&buf[..len]).trim().to_string()))
            }
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn client_nonce() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    protocol::sha256_hex(now.to_string().as_bytes())[..32].to_string()
}
