//! Keywire - remote keystroke relay between a phone browser and a
//! desktop.
//!
//! A sender (typically a phone browser) types into a relay; a receiver
//! on the desktop executes each keystroke locally and reports back
//! through a two-phase acknowledgment, so the person typing sees
//! whether each key was delivered and whether it actually ran.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   push (/ws)    ┌─────────┐   push (/ws)    ┌──────────┐
//! │  sender  │ ──────────────▶ │  relay  │ ──────────────▶ │ receiver │
//! │ (phone)  │ ◀── acks ────── │ (rooms) │ ◀── acks ────── │ (desktop)│
//! └──────────┘                 └────┬────┘                 └──────────┘
//!                                   │  pull (GET ?since=N)
//!                                   └──────────────────────▶ receiver
//! ```
//!
//! Every event passes the sender's policy gate (sanitization and a
//! shortcut denylist) before it is assigned a `clientEventId` and put
//! on the wire. The receiver assigns its own `eventId` per delivered
//! event and answers with a delivery-ack on receipt and an
//! execution-ack with the outcome.
//!
//! # Example
//!
//! ```no_run
//! use keywire::{executor::Executor, keymap::LoggingSimulator, transport::PullChannel};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut channel = PullChannel::new("http://localhost:3000", "ROOM42")?;
//! let executor = Executor::new(LoggingSimulator);
//! executor.run(&mut channel).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod correlator;
pub mod executor;
pub mod keymap;
pub mod policy;
pub mod protocol;
pub mod sender;
pub mod sequence;
pub mod server;
pub mod transport;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use correlator::{AckCorrelator, SenderStatus, DEFAULT_ACK_TIMEOUT};
pub use executor::{ExecutionOutcome, Executor};
pub use keymap::{KeyMapper, KeySimulator, LoggingSimulator, SimulatorError};
pub use policy::{Admission, Denylist, Modifiers, PolicyGate, ShortcutToken};
pub use protocol::{Ack, ControlMessage, EventKind, KeyEvent, Role, WireMessage};
pub use sender::{SendResult, SenderError, SenderSession};
pub use sequence::{EventIdAllocator, PersistedCounter};
pub use server::{run as run_server, ServerConfig};
pub use transport::{EventChannel, PullChannel, PushChannel, TransportError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
