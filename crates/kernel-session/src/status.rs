//! Kernel lifecycle status and its transition rules.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a kernel connection.
///
/// `Dead` means the kernel process is gone; `Disconnected` means only the
/// channel is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    #[default]
    Unknown,
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
    Connected,
    Disconnected,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KernelStatus::Unknown => "unknown",
            KernelStatus::Starting => "starting",
            KernelStatus::Idle => "idle",
            KernelStatus::Busy => "busy",
            KernelStatus::Restarting => "restarting",
            KernelStatus::Dead => "dead",
            KernelStatus::Connected => "connected",
            KernelStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

impl KernelStatus {
    /// Whether the kernel is believed to be running.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            KernelStatus::Starting
                | KernelStatus::Idle
                | KernelStatus::Busy
                | KernelStatus::Connected
                | KernelStatus::Disconnected
        )
    }

    /// Whether moving from `self` to `next` is a valid lifecycle step.
    ///
    /// Staying in the same status is not a transition.
    pub fn can_transition_to(self, next: KernelStatus) -> bool {
        use KernelStatus::*;

        if self == next {
            return false;
        }
        match (self, next) {
            // only an explicit restart leaves dead
            (Dead, Restarting) => true,
            (Dead, _) => false,
            (_, Dead) => true,
            (Unknown, _) => true,
            (_, Restarting) => self.is_live(),
            (Restarting, Starting | Idle | Busy | Disconnected) => true,
            (Restarting, _) => false,
            (Starting | Idle | Busy | Connected, Disconnected) => true,
            (Disconnected, Connected) => true,
            (Disconnected, _) => false,
            (Connected, Starting | Idle | Busy) => true,
            (Starting, Idle | Busy) => true,
            (Idle, Busy) | (Busy, Idle) => true,
            _ => false,
        }
    }
}
