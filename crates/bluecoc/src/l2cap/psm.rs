//! LE Protocol/Service Multiplexer (SPSM) handling
//!
//! LE credit-based channels are addressed by an SPSM in the range
//! 0x0001-0x00FF. Values up to 0x007F are assigned by the Bluetooth SIG,
//! the rest are free for applications.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

use super::constants::*;

/// LE Protocol/Service Multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Psm(u16);

impl Psm {
    /// Internet Protocol Support Profile
    pub const IPSP: Psm = Psm(0x0023);
    /// Object Transfer Service
    pub const OTS: Psm = Psm(0x0025);
    /// Enhanced ATT
    pub const EATT: Psm = Psm(0x0027);

    pub const fn new(value: u16) -> Self {
        Psm(value)
    }

    /// Get the PSM value as u16
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Check if the PSM lies in the LE SPSM range
    pub fn is_valid(&self) -> bool {
        (L2CAP_LE_PSM_FIXED_MIN..=L2CAP_LE_PSM_DYNAMIC_MAX).contains(&self.0)
    }

    /// SIG-assigned SPSM
    pub fn is_fixed(&self) -> bool {
        (L2CAP_LE_PSM_FIXED_MIN..=L2CAP_LE_PSM_FIXED_MAX).contains(&self.0)
    }

    /// Application-defined SPSM
    pub fn is_dynamic(&self) -> bool {
        (L2CAP_LE_PSM_DYNAMIC_MIN..=L2CAP_LE_PSM_DYNAMIC_MAX).contains(&self.0)
    }
}

impl From<u16> for Psm {
    fn from(value: u16) -> Self {
        Psm(value)
    }
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Psm::IPSP => write!(f, "IPSP (0x{:04X})", self.0),
            Psm::OTS => write!(f, "OTS (0x{:04X})", self.0),
            Psm::EATT => write!(f, "EATT (0x{:04X})", self.0),
            _ => write!(f, "0x{:04X}", self.0),
        }
    }
}

static NEXT_DYNAMIC_PSM: AtomicU16 = AtomicU16::new(L2CAP_LE_PSM_DYNAMIC_MIN);

/// Obtain a dynamic SPSM value
///
/// Values cycle through 0x0080-0x00FF; callers registering many services
/// must check for collisions themselves.
pub fn obtain_dynamic_psm() -> Psm {
    let span = L2CAP_LE_PSM_DYNAMIC_MAX - L2CAP_LE_PSM_DYNAMIC_MIN + 1;
    let next = NEXT_DYNAMIC_PSM.fetch_add(1, Ordering::SeqCst);
    Psm(L2CAP_LE_PSM_DYNAMIC_MIN + next.wrapping_sub(L2CAP_LE_PSM_DYNAMIC_MIN) % span)
}
