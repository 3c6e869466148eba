//! Continuous presence engine for a single chat channel.
//!
//! Each tick runs one pass of the pipeline:
//! observe ([`observe`]) → select ([`select`], backed by [`opportunity`] and
//! [`escalation`]) → generate ([`content`]) → deliver ([`delivery`]).
//! [`runner`] owns the session and decides when a tick is due.

pub mod content;
pub mod delivery;
pub mod escalation;
pub mod image_tasks;
pub mod observe;
pub mod opportunity;
pub mod runner;
pub mod select;
pub mod session;
pub mod triggers;

pub use runner::{ControlCommand, PresenceEngine, PresenceEvent, PresenceStatus};
pub use session::{Classification, Mood, SessionState};
