// Wire messages of the update session
use sha2::{Digest, Sha256};
use std::fmt;

use super::ImageKind;

pub const CMD_FIRMWARE: u16 = 0;
pub const CMD_FILESYSTEM: u16 = 100;

pub const REPLY_OK: &str = "OK";
pub const REPLY_AUTH_FAILED: &str = "Authentication Failed";
pub const AUTH_PREFIX: &str = "AUTH";
pub const AUTH_REPLY_CODE: &str = "200";

const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Malformed(String),
    UnknownCommand(u16),
    EmptyImage,
    BadDigest,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(line) => write!(f, "malformed message: {line:?}"),
            Self::UnknownCommand(cmd) => write!(f, "unknown image command {cmd}"),
            Self::EmptyImage => write!(f, "image size must be non-zero"),
            Self::BadDigest => write!(f, "digest must be {DIGEST_HEX_LEN} hex characters"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ImageKind {
    pub fn command(self) -> u16 {
        match self {
            Self::Firmware => CMD_FIRMWARE,
            Self::Filesystem => CMD_FILESYSTEM,
        }
    }

    pub fn from_command(cmd: u16) -> Result<Self, ProtocolError> {
        match cmd {
            CMD_FIRMWARE => Ok(Self::Firmware),
            CMD_FILESYSTEM => Ok(Self::Filesystem),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// `"<cmd> <port> <size> <sha256>\n"`, sent by the host to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub kind: ImageKind,
    pub host_port: u16,
    pub size: usize,
    pub digest: String,
}

impl Invitation {
    pub fn for_image(kind: ImageKind, host_port: u16, image: &[u8]) -> Self {
        Self {
            kind,
            host_port,
            size: image.len(),
            digest: sha256_hex(image),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::Malformed(line.trim().to_string());
        let mut fields = line.split_whitespace();

        let cmd: u16 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(malformed)?;
        let host_port: u16 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(malformed)?;
        let size: usize = fields.next().and_then(|f| f.parse().ok()).ok_or_else(malformed)?;
        let digest = fields.next().ok_or_else(malformed)?;
        if fields.next().is_some() {
            return Err(malformed());
        }

        let kind = ImageKind::from_command(cmd)?;
        if size == 0 {
            return Err(ProtocolError::EmptyImage);
        }
        if digest.len() != DIGEST_HEX_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::BadDigest);
        }

        Ok(Self {
            kind,
            host_port,
            size,
            digest: digest.to_ascii_lowercase(),
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {}\n",
            self.kind.command(),
            self.host_port,
            self.size,
            self.digest
        )
    }
}

/// `"200 <cnonce> <response>\n"`, the host's answer to an `AUTH` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReply {
    pub cnonce: String,
    pub response: String,
}

impl AuthReply {
    pub fn new(secret: &str, nonce: &str, cnonce: &str) -> Self {
        Self {
            cnonce: cnonce.to_string(),
            response: auth_response(secret, nonce, cnonce),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::Malformed(line.trim().to_string());
        let mut fields = line.split_whitespace();
        if fields.next() != Some(AUTH_REPLY_CODE) {
            return Err(malformed());
        }
        let cnonce = fields.next().ok_or_else(malformed)?;
        let response = fields.next().ok_or_else(malformed)?;
        if fields.next().is_some() {
            return Err(malformed());
        }
        Ok(Self {
            cnonce: cnonce.to_string(),
            response: response.to_ascii_lowercase(),
        })
    }

    pub fn encode(&self) -> String {
        format!("{} {} {}\n", AUTH_REPLY_CODE, self.cnonce, self.response)
    }

    pub fn verify(&self, secret: &str, nonce: &str) -> bool {
        let expected = auth_response(secret, nonce, &self.cnonce);
        constant_time_eq(expected.as_bytes(), self.response.as_bytes())
    }
}

pub fn challenge(nonce: &str) -> String {
    format!("{AUTH_PREFIX} {nonce}")
}

/// Extract the nonce from an `AUTH <nonce>` datagram.
pub fn parse_challenge(line: &str) -> Option<&str> {
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next(), fields.next()) {
        (Some(AUTH_PREFIX), Some(nonce), None) => Some(nonce),
        _ => None,
    }
}

/// `hex(sha256(hex(sha256(secret)) ":" nonce ":" cnonce))`
pub fn auth_response(secret: &str, nonce: &str, cnonce: &str) -> String {
    let secret_hash = sha256_hex(secret.as_bytes());
    sha256_hex(format!("{secret_hash}:{nonce}:{cnonce}").as_bytes())
}

pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
