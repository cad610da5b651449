// Over-the-air update service
//
// Session flow (device side):
// 1. Invitation datagram names image kind, host port, size and digest
// 2. Optional challenge/response against the shared secret
// 3. Device pulls the image from the host over TCP into an ImageSink
// 4. Digest check, finalize, acknowledge, apply

pub mod protocol;
pub mod transport;
pub mod uploader;

use std::fmt;
use std::io;

pub use protocol::{Invitation, ProtocolError};
pub use transport::NetworkUpdateTransport;
pub use uploader::{PushError, Uploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Firmware,
    Filesystem,
}

impl ImageKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Firmware => "firmware",
            Self::Filesystem => "filesystem",
        }
    }
}

/// The five ways a session can fail. None of them is retried; the running
/// image stays in place and the device carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    Auth,
    Begin,
    Connect,
    Receive,
    End,
}

impl UpdateError {
    pub fn code(self) -> u8 {
        match self {
            Self::Auth => 0,
            Self::Begin => 1,
            Self::Connect => 2,
            Self::Receive => 3,
            Self::End => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Auth => "Auth Failed",
            Self::Begin => "Begin Failed",
            Self::Connect => "Connect Failed",
            Self::Receive => "Receive Failed",
            Self::End => "End Failed",
        }
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::error::Error for UpdateError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    Unsupported(ImageKind),
    TooLarge { size: usize, capacity: usize },
    Storage(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(kind) => write!(f, "{} images are not supported", kind.label()),
            Self::TooLarge { size, capacity } => {
                write!(f, "image of {size} bytes exceeds partition of {capacity} bytes")
            }
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Destination of an incoming image (flash partition on target, memory in tests).
pub trait ImageSink {
    fn begin(&mut self, kind: ImageKind, size: usize) -> Result<(), SinkError>;
    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError>;
    fn finish(&mut self) -> Result<(), SinkError>;
    /// Drop any partially written image. Must leave the running image untouched.
    fn abort(&mut self);
    /// Called once the host has been told the session succeeded.
    fn apply(&mut self) {}
}

type StartHook = Box<dyn FnMut(ImageKind) + Send>;
type ProgressHook = Box<dyn FnMut(usize, usize) + Send>;
type EndHook = Box<dyn FnMut() + Send>;
type ErrorHook = Box<dyn FnMut(UpdateError) + Send>;

/// Lifecycle hooks fired by a transport while a session runs.
#[derive(Default)]
pub struct UpdateCallbacks {
    on_start: Option<StartHook>,
    on_progress: Option<ProgressHook>,
    on_end: Option<EndHook>,
    on_error: Option<ErrorHook>,
}

impl UpdateCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, hook: impl FnMut(ImageKind) + Send + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn on_progress(mut self, hook: impl FnMut(usize, usize) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(hook));
        self
    }

    pub fn on_end(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_end = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl FnMut(UpdateError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Hooks that report every event to the log.
    pub fn logging() -> Self {
        let mut last_percent = None;
        Self::new()
            .on_start(|kind| log::info!("OTA Start: {}", kind.label()))
            .on_progress(move |current, total| {
                let percent = if total == 0 { 100 } else { current * 100 / total };
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    log::info!("OTA Progress: {}%", percent);
                }
            })
            .on_end(|| log::info!("OTA End"))
            .on_error(|error| log::error!("OTA Error[{}]: {}", error.code(), error.label()))
    }

    pub(crate) fn start(&mut self, kind: ImageKind) {
        if let Some(hook) = self.on_start.as_mut() {
            hook(kind);
        }
    }

    pub(crate) fn progress(&mut self, current: usize, total: usize) {
        if let Some(hook) = self.on_progress.as_mut() {
            hook(current, total);
        }
    }

    pub(crate) fn end(&mut self) {
        if let Some(hook) = self.on_end.as_mut() {
            hook();
        }
    }

    pub(crate) fn error(&mut self, error: UpdateError) {
        if let Some(hook) = self.on_error.as_mut() {
            hook(error);
        }
    }
}

/// Remote image delivery as driven by the connectivity manager.
pub trait UpdateTransport {
    fn set_auth_secret(&mut self, secret: &str);
    fn set_callbacks(&mut self, callbacks: UpdateCallbacks);
    /// Start accepting sessions. Only valid once the station is associated.
    fn begin(&mut self) -> io::Result<()>;
    /// Service at most one pending session.
    fn poll_once(&mut self);
    fn is_listening(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_error_codes_and_labels() {
        let all = [
            UpdateError::Auth,
            UpdateError::Begin,
            UpdateError::Connect,
            UpdateError::Receive,
            UpdateError::End,
        ];
        let codes: Vec<u8> = all.iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
        assert_eq!(UpdateError::Receive.to_string(), "Receive Failed");
        assert_eq!(UpdateError::Auth.label(), "Auth Failed");
    }

    #[test]
    fn test_callbacks_fire_registered_hooks() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (e1, e2, e3, e4) = (
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
        );
        let mut callbacks = UpdateCallbacks::new()
            .on_start(move |kind| e1.lock().unwrap().push(format!("start {}", kind.label())))
            .on_progress(move |c, t| e2.lock().unwrap().push(format!("{c}/{t}")))
            .on_end(move || e3.lock().unwrap().push("end".to_string()))
            .on_error(move |e| e4.lock().unwrap().push(e.label().to_string()));

        callbacks.start(ImageKind::Filesystem);
        callbacks.progress(10, 20);
        callbacks.end();
        callbacks.error(UpdateError::End);

        assert_eq!(
            *events.lock().unwrap(),
            vec!["start filesystem", "10/20", "end", "End Failed"]
        );
    }

    #[test]
    fn test_empty_callbacks_are_noops() {
        let mut callbacks = UpdateCallbacks::new();
        callbacks.start(ImageKind::Firmware);
        callbacks.progress(0, 0);
        callbacks.end();
        callbacks.error(UpdateError::Begin);
    }
}
