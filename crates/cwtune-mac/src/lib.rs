//! Cwtune MAC - Contention Window Optimisation
//!
//! MAC-layer model for a fleet of IEEE 802.15.4 radios that is tuned under
//! CSMA and then migrated to TDMA.
//!
//! # Contention Window
//!
//! With `n` nodes contending for the channel, the window that balances idle
//! backoff slots against collision cost is:
//!
//! ```text
//! CW(n) = clamp(round(n × sqrt(2 × t_collision / t_slot)), 7, 255)
//! ```
//!
//! For the fixed 106-byte payload `t_collision = 5088 µs`, so every extra
//! transmitter adds roughly 5.64 slots.
//!
//! # Radio Programs
//!
//! Nodes run either [`RadioProgram::Csma`] or [`RadioProgram::Tdma`]. TDMA
//! follows a [`Slotframe`] pushed to the fleet before the experiment starts.

mod contention;
mod error;
mod program;
mod slotframe;

pub use contention::{
    collision_time, contention_window, eifs, packet_time, CW_MAX, CW_MIN, PAYLOAD_BYTES, T_SLOT,
};
pub use error::{Error, Result};
pub use program::RadioProgram;
pub use slotframe::{Slot, SlotKind, Slotframe};
