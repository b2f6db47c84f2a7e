mod stream;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use stream::{DeviceStream, DeviceStreamCollection, StreamEvent, StreamJob};

/// Placement of a stream or of a fetched output.
///
/// Streams are emulated on host threads; `Emulated` only tags the memory a
/// value is considered to live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Emulated(u32),
}

impl Device {
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Emulated(ordinal) => write!(f, "emulated:{}", ordinal),
        }
    }
}
