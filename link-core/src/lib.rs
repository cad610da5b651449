//! Link Core - Hardware-independent networking logic for the robot controller
//!
//! This crate contains the connectivity state machine, the OTA session
//! protocol and the UDP command channel. Everything here runs on the host
//! platform as well as on the device, so it can be tested without hardware.

pub mod battery;
pub mod command;
pub mod config;
pub mod connectivity;
pub mod shutdown;
pub mod update;

pub use command::{CommandCallback, CommandListener, PollOutcome};
pub use config::{LinkTimings, NetworkConfig, StaticAddressing, TxPower};
pub use connectivity::{ConnectionState, ConnectivityManager, RunExit, StationLink, StatusIndicator};
pub use shutdown::ShutdownSignal;
pub use update::{ImageKind, ImageSink, UpdateCallbacks, UpdateError, UpdateTransport};
