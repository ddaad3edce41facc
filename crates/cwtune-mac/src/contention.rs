//! Optimal contention window for an IEEE 802.15.4 CSMA link.
//!
//! The window scales linearly with the number of active transmitters:
//! - n transmitters → round(n × sqrt(2 × t_collision / t_slot))
//! - result clamped to [CW_MIN, CW_MAX]
//!
//! All timings are in microseconds at 62.5 ksymbol/s (16 µs per symbol).

/// Smallest contention window a node accepts.
pub const CW_MIN: u16 = 7;

/// Largest contention window a node accepts.
pub const CW_MAX: u16 = 255;

/// Duration of one symbol.
pub const T_SYMBOL: u32 = 16;

/// Symbols per unit backoff period.
pub const UNIT_BACKOFF_SYMBOLS: u32 = 20;

/// Backoff slot duration.
pub const T_SLOT: u32 = UNIT_BACKOFF_SYMBOLS * T_SYMBOL;

/// One byte on air (two symbols).
pub const T_BYTE: u32 = 2 * T_SYMBOL;

/// PHY preamble (4 bytes).
pub const T_PHY_PREAMBLE: u32 = 4 * T_BYTE;

/// Start-of-frame delimiter.
pub const T_PHY_SFD: u32 = T_BYTE;

/// MAC header length in bytes.
pub const MAC_HEADER_BYTES: u32 = 11;

/// MAC acknowledgement length in bytes.
pub const MAC_ACK_BYTES: u32 = 6;

pub const T_MAC_HEADER: u32 = MAC_HEADER_BYTES * T_BYTE;

pub const T_MAC_ACK: u32 = T_PHY_PREAMBLE + T_PHY_SFD + MAC_ACK_BYTES * T_BYTE;

/// Short inter-frame spacing.
pub const T_SIFS: u32 = 12 * T_SYMBOL;

/// Long inter-frame spacing.
pub const T_LIFS: u32 = 40 * T_SYMBOL;

/// RX/TX turnaround.
pub const T_TURNAROUND: u32 = 12 * T_SYMBOL;

/// Frames longer than this are followed by a LIFS instead of a SIFS.
pub const MAX_SIFS_FRAME_BYTES: u32 = 18;

/// Application payload carried by every data frame.
pub const PAYLOAD_BYTES: u32 = 106;

/// Extended inter-frame spacing after a collided frame.
pub const fn eifs(payload_bytes: u32) -> u32 {
    let ifs = if payload_bytes > MAX_SIFS_FRAME_BYTES {
        T_LIFS
    } else {
        T_SIFS
    };
    T_TURNAROUND + T_MAC_ACK + ifs
}

/// Air time of one data frame.
pub const fn packet_time(payload_bytes: u32) -> u32 {
    T_PHY_PREAMBLE + T_PHY_SFD + T_MAC_HEADER + payload_bytes * T_BYTE
}

/// Channel time lost to one collision.
pub const fn collision_time(payload_bytes: u32) -> u32 {
    packet_time(payload_bytes) + eifs(payload_bytes)
}

/// Calculate the optimal contention window for `active_transmitters` senders.
///
/// Rounds half away from zero.
///
/// # Examples
///
/// ```
/// use cwtune_mac::contention_window;
///
/// assert_eq!(contention_window(0), 7);   // clamped up to CW_MIN
/// assert_eq!(contention_window(2), 11);
/// assert_eq!(contention_window(50), 255); // clamped down to CW_MAX
/// ```
pub fn contention_window(active_transmitters: usize) -> u16 {
    let per_node = (2.0 * f64::from(collision_time(PAYLOAD_BYTES)) / f64::from(T_SLOT)).sqrt();
    let raw = (active_transmitters as f64 * per_node).round();
    raw.clamp(f64::from(CW_MIN), f64::from(CW_MAX)) as u16
}
