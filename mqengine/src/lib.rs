#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use std::time::Duration;
//!
//! use mqengine::conf::Settings;
//! use mqengine::context::EngineContext;
//! use mqengine::expiring_get::get_message_with_timeout;
//! use mqengine::session::Message;
//! use mqengine::Result;
//!
//! fn main() -> Result<()> {
//!     let scx = EngineContext::new(Settings::default())?;
//!
//!     let client = scx.create_client("client-1");
//!     let session = client.create_session()?;
//!     let orders = scx.destination("orders", false);
//!
//!     get_message_with_timeout(
//!         &scx,
//!         &session,
//!         &orders,
//!         Duration::from_secs(1),
//!         Box::new(|msg| println!("got {:?}", msg.payload)),
//!         Box::new(|rc| println!("finished, {:?}", rc)),
//!     )?;
//!     orders.put(Message::new("order #1"));
//!
//!     scx.shutdown();
//!     Ok(())
//! }
//! ```

/// Engine Core
pub mod context; // Engine-wide shared context
pub mod error; // Result codes
pub mod ffdc; // First-failure data capture
pub mod logger; // slog setup and `log` bridge
pub mod stats; // Runtime statistics

/// Threads and Scheduling
pub mod jobqueue; // Rotating-separator job ring
pub mod threadjobs; // Per-thread job queues
pub mod timer; // One-shot timer threads

/// Messaging
pub mod expiring_get; // Timed receive
pub mod session; // Clients, sessions, consumers, destinations

/// Store
pub mod fake_async; // Out-of-line commit completions
pub mod store; // Commit contract

/// Re-exports
pub use error::{CallStatus, EngineError, Result};
pub use mqengine_conf as conf; // Configuration
pub use mqengine_utils as utils; // Counters and helpers
