use std::fmt;

use serde::{Deserialize, Serialize};

use super::{CHANNELS_MAX, VolumeError};

/// Speaker position a single channel is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelPosition {
    /// Single channel, no spatial placement
    Mono,
    /// Front left
    FrontLeft,
    /// Front right
    FrontRight,
    /// Front center
    FrontCenter,
    /// Rear center
    RearCenter,
    /// Rear left
    RearLeft,
    /// Rear right
    RearRight,
    /// Low frequency effects
    Lfe,
    /// Side left
    SideLeft,
    /// Side right
    SideRight,
    /// Top center
    TopCenter,
    /// Auxiliary channel with no known placement
    Aux(u8),
}

impl ChannelPosition {
    fn on_left(self) -> bool {
        matches!(self, Self::FrontLeft | Self::RearLeft | Self::SideLeft)
    }

    fn on_right(self) -> bool {
        matches!(self, Self::FrontRight | Self::RearRight | Self::SideRight)
    }

    fn on_center(self) -> bool {
        matches!(
            self,
            Self::Mono | Self::FrontCenter | Self::RearCenter | Self::TopCenter
        )
    }

    fn on_lfe(self) -> bool {
        matches!(self, Self::Lfe)
    }

    /// Whether two positions land on the same side of the listener.
    pub(crate) fn same_side(self, other: Self) -> bool {
        (self.on_left() && other.on_left())
            || (self.on_right() && other.on_right())
            || (self.on_center() && other.on_center())
            || (self.on_lfe() && other.on_lfe())
    }
}

/// Ordered channel-to-position assignment for a sample stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMap {
    positions: Vec<ChannelPosition>,
}

impl ChannelMap {
    /// Build a map from explicit positions
    ///
    /// # Errors
    /// Returns error if the map is empty or longer than [`CHANNELS_MAX`].
    pub fn new(positions: Vec<ChannelPosition>) -> Result<Self, VolumeError> {
        if positions.is_empty() || positions.len() > CHANNELS_MAX {
            return Err(VolumeError::InvalidChannelCount {
                channels: positions.len(),
            });
        }
        Ok(Self { positions })
    }

    /// Single mono channel
    pub fn mono() -> Self {
        Self {
            positions: vec![ChannelPosition::Mono],
        }
    }

    /// Front left + front right
    pub fn stereo() -> Self {
        Self {
            positions: vec![ChannelPosition::FrontLeft, ChannelPosition::FrontRight],
        }
    }

    /// Default layout for a channel count, used when a creator leaves the map unset.
    ///
    /// Counts beyond the common surround layouts fall back to auxiliary channels.
    ///
    /// # Errors
    /// Returns error if `channels` is zero or above [`CHANNELS_MAX`].
    pub fn default_for(channels: usize) -> Result<Self, VolumeError> {
        use ChannelPosition::*;

        let positions = match channels {
            1 => vec![Mono],
            2 => vec![FrontLeft, FrontRight],
            3 => vec![FrontLeft, FrontRight, Lfe],
            4 => vec![FrontLeft, FrontRight, RearLeft, RearRight],
            5 => vec![FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter],
            6 => vec![FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter, Lfe],
            8 => vec![
                FrontLeft,
                FrontRight,
                RearLeft,
                RearRight,
                FrontCenter,
                Lfe,
                SideLeft,
                SideRight,
            ],
            n if n > 0 && n <= CHANNELS_MAX => (0..n).map(|i| Aux(i as u8)).collect(),
            n => return Err(VolumeError::InvalidChannelCount { channels: n }),
        };

        Ok(Self { positions })
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.positions.len()
    }

    /// Position of each channel, in order
    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions
    }

    /// Whether this map describes `channels` channels
    pub fn is_compatible(&self, channels: usize) -> bool {
        self.positions.len() == channels
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.positions.iter().map(|p| format!("{p:?}")).collect();
        write!(f, "{}", names.join(","))
    }
}
