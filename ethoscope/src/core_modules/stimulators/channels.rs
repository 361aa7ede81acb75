//! ROI index to hardware channel maps of the supported modules.
//!
//! Each constructor returns a fresh map; strategies own theirs.

use std::collections::BTreeMap;

pub type ChannelMap = BTreeMap<u32, u32>;

const ROIS: [u32; 10] = [1, 3, 5, 7, 9, 12, 14, 16, 18, 20];

fn zip(channels: [u32; 10]) -> ChannelMap {
    ROIS.into_iter().zip(channels).collect()
}

/// Servo sleep depriver, channels 1 to 10.
pub fn servo() -> ChannelMap {
    zip([1, 2, 3, 4, 5, 6, 7, 8, 9, 10])
}

/// Motor outputs of the optomotor board.
pub fn optomotor_moto() -> ChannelMap {
    zip([0, 2, 4, 6, 8, 22, 20, 18, 16, 14])
}

/// LED outputs of the optomotor board.
pub fn optomotor_opto() -> ChannelMap {
    zip([1, 3, 5, 7, 9, 23, 21, 19, 17, 15])
}

/// Single-row PCB used by the robust sleep depriver and optogenetic modules.
pub fn robust() -> ChannelMap {
    zip([1, 3, 5, 7, 9, 11, 13, 15, 17, 19])
}
