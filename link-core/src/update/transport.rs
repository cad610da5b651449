// Device side of the update session, polled from the connectivity loop

use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::protocol::{self, AuthReply, Invitation};
use super::{ImageSink, UpdateCallbacks, UpdateError, UpdateTransport};

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const CHUNK_SIZE: usize = 1460;
const INVITATION_BUFFER: usize = 256;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NetworkUpdateTransport<K: ImageSink> {
    port: u16,
    secret: String,
    socket: Option<UdpSocket>,
    sink: K,
    callbacks: UpdateCallbacks,
    session_timeout: Duration,
    sessions: u64,
}

impl<K: ImageSink> NetworkUpdateTransport<K> {
    pub fn new(port: u16, sink: K) -> Self {
        Self {
            port,
            secret: String::new(),
            socket: None,
            sink,
            callbacks: UpdateCallbacks::new(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            sessions: 0,
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    fn next_nonce(&mut self) -> String {
        self.sessions = self.sessions.wrapping_add(1);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seed = format!("{}:{}:{}", self.port, self.sessions, now);
        protocol::sha256_hex(seed.as_bytes())[..32].to_string()
    }

    fn run_session(
        &mut self,
        socket: &UdpSocket,
        invitation: &Invitation,
        host: SocketAddr,
    ) -> Result<(), UpdateError> {
        if !self.secret.is_empty() {
            let nonce = self.next_nonce();
            self.authenticate(socket, host, &nonce)?;
        }
        send_reply(socket, host, protocol::REPLY_OK);

        self.callbacks.start(invitation.kind);
        self.sink.begin(invitation.kind, invitation.size).map_err(|e| {
            log::error!("OTA: cannot begin {} image: {}", invitation.kind.label(), e);
            UpdateError::Begin
        })?;

        let mut stream = self.connect_back(SocketAddr::new(host.ip(), invitation.host_port))?;
        self.receive_image(&mut stream, invitation)?;

        if let Err(e) = stream.write_all(protocol::REPLY_OK.as_bytes()) {
            log::warn!("OTA: could not acknowledge completion: {}", e);
        }
        let _ = stream.flush();
        Ok(())
    }

    fn authenticate(
        &mut self,
        socket: &UdpSocket,
        host: SocketAddr,
        nonce: &str,
    ) -> Result<(), UpdateError> {
        send_reply(socket, host, &protocol::challenge(nonce));

        let deadline = Instant::now() + self.session_timeout;
        let mut buf = [0u8; INVITATION_BUFFER];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!("OTA: no answer to auth challenge from {}", host);
                return Err(UpdateError::Auth);
            }
            socket
                .set_read_timeout(Some(remaining))
                .map_err(|_| UpdateError::Auth)?;

            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    log::warn!("OTA: auth receive error: {}", e);
                    return Err(UpdateError::Auth);
                }
            };
            if from != host {
                continue;
            }

            let line = String::from_utf8_lossy(&buf[..len]);
            // A resent invitation or other noise is not an answer
            let Ok(reply) = AuthReply::parse(&line) else {
                log::debug!("OTA: ignoring non-auth datagram from {}", host);
                continue;
            };
            if reply.verify(&self.secret, nonce) {
                return Ok(());
            }
            send_reply(socket, host, protocol::REPLY_AUTH_FAILED);
            return Err(UpdateError::Auth);
        }
    }

    fn connect_back(&self, addr: SocketAddr) -> Result<TcpStream, UpdateError> {
        for attempt in 1..=CONNECT_ATTEMPTS {
            match TcpStream::connect_timeout(&addr, self.session_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    log::debug!(
                        "OTA: connect attempt {}/{} to {} failed: {}",
                        attempt,
                        CONNECT_ATTEMPTS,
                        addr,
                        e
                    );
                    if attempt < CONNECT_ATTEMPTS {
                        thread::sleep(CONNECT_RETRY_DELAY);
                    }
                }
            }
        }
        Err(UpdateError::Connect)
    }

    fn receive_image(
        &mut self,
        stream: &mut TcpStream,
        invitation: &Invitation,
    ) -> Result<(), UpdateError> {
        stream
            .set_read_timeout(Some(self.session_timeout))
            .map_err(|_| UpdateError::Receive)?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; CHUNK_SIZE];
        let mut received = 0usize;

        while received < invitation.size {
            let n = match stream.read(&mut buf) {
                Ok(0) => {
                    log::warn!("OTA: host closed after {}/{} bytes", received, invitation.size);
                    return Err(UpdateError::Receive);
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("OTA: receive error after {} bytes: {}", received, e);
                    return Err(UpdateError::Receive);
                }
            };

            let take = n.min(invitation.size - received);
            let chunk = &buf[..take];
            hasher.update(chunk);
            self.sink.write(chunk).map_err(|e| {
                log::error!("OTA: write failed: {}", e);
                UpdateError::Receive
            })?;
            received += take;

            stream
                .write_all(take.to_string().as_bytes())
                .map_err(|_| UpdateError::Receive)?;
            self.callbacks.progress(received, invitation.size);
        }

        let digest = protocol::to_hex(&hasher.finalize());
        if digest != invitation.digest {
            log::error!("OTA: digest mismatch, expected {} got {}", invitation.digest, digest);
            return Err(UpdateError::End);
        }
        self.sink.finish().map_err(|e| {
            log::error!("OTA: finalize failed: {}", e);
            UpdateError::End
        })
    }
}

impl<K: ImageSink> UpdateTransport for NetworkUpdateTransport<K> {
    fn set_auth_secret(&mut self, secret: &str) {
        self.secret = secret.to_string();
    }

    fn set_callbacks(&mut self, callbacks: UpdateCallbacks) {
        self.callbacks = callbacks;
    }

    fn begin(&mut self) -> io::Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port));
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        log::info!(
            "OTA Ready on port {}{}",
            socket.local_addr()?.port(),
            if self.secret.is_empty() { " (no auth)" } else { "" }
        );
        self.socket = Some(socket);
        Ok(())
    }

    fn poll_once(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };

        let mut buf = [0u8; INVITATION_BUFFER];
        let pending = match socket.recv_from(&mut buf) {
            Ok((len, from)) => Some((String::from_utf8_lossy(&buf[..len]).into_owned(), from)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                log::warn!("OTA: invitation receive error: {}", e);
                None
            }
        };

        if let Some((line, from)) = pending {
            match Invitation::parse(&line) {
                Ok(invitation) => {
                    log::info!(
                        "OTA: {} image of {} bytes offered by {}",
                        invitation.kind.label(),
                        invitation.size,
                        from
                    );
                    if let Err(e) = socket.set_nonblocking(false) {
                        log::warn!("OTA: cannot switch socket mode: {}", e);
                    }
                    match self.run_session(&socket, &invitation, from) {
                        Ok(()) => {
                            self.callbacks.end();
                            self.sink.apply();
                        }
                        Err(error) => {
                            self.sink.abort();
                            self.callbacks.error(error);
                        }
                    }
                    let _ = socket.set_read_timeout(None);
                    if let Err(e) = socket.set_nonblocking(true) {
                        log::warn!("OTA: cannot restore socket mode: {}", e);
                    }
                }
                Err(e) => log::warn!("OTA: ignoring datagram from {}: {}", from, e),
            }
        }

        self.socket = Some(socket);
    }

    fn is_listening(&self) -> bool {
        self.socket.is_some()
    }
}

fn send_reply(socket: &UdpSocket, host: SocketAddr, message: &str) {
    if let Err(e) = socket.send_to(message.as_bytes(), host) {
        log::warn!("OTA: reply to {} failed: {}", host, e);
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
