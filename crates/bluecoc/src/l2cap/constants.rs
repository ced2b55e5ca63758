//! L2CAP connection-oriented channel constants

use std::time::Duration;

/// Size of one buffer pool block in bytes
pub const L2CAP_COC_BLOCK_SIZE: usize = 250;

/// Number of full MTUs each channel's pool can hold at once
///
/// One for the posted receive buffer, one for an in-flight transmit and one
/// of headroom for the host still holding a released buffer.
pub const L2CAP_COC_MTUS_PER_CHANNEL: usize = 3;

/// Fewest MTUs a pool may hold: one receive and one transmit SDU
pub const L2CAP_COC_MIN_MTUS_PER_CHANNEL: usize = 2;

/// Upper bound on a single wait for the transmit path to unstall
pub const L2CAP_COC_STALL_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Minimum MTU for an LE credit-based channel
pub const L2CAP_LE_COC_MIN_MTU: u16 = 23;

/// LE SPSM ranges (Core Spec Vol 3, Part A, 4.22)
pub const L2CAP_LE_PSM_FIXED_MIN: u16 = 0x0001;
pub const L2CAP_LE_PSM_FIXED_MAX: u16 = 0x007F;
pub const L2CAP_LE_PSM_DYNAMIC_MIN: u16 = 0x0080;
pub const L2CAP_LE_PSM_DYNAMIC_MAX: u16 = 0x00FF;
