// Percussion lanes: the grid's column axis.
//
// Six fixed roles in a fixed order. The order is shared by the dataset, the
// model's flattened input layout and the generator's output records, so it
// lives in exactly one place: `Lane::ALL`. Pitches map to lanes through a
// static General MIDI table; anything else is discarded.

use serde::{Deserialize, Serialize};

/// Number of lanes (grid columns).
pub const LANE_COUNT: usize = 6;

/// General MIDI drum-map pitch for each lane.
const PITCH_TABLE: [(u8, Lane); LANE_COUNT] = [
    (36, Lane::Kick),
    (38, Lane::Snare),
    (42, Lane::ClosedHiHat),
    (46, Lane::OpenHiHat),
    (39, Lane::Clap),
    (48, Lane::Percussion),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Kick = 0,
    Snare = 1,
    #[serde(rename = "hihat_closed")]
    ClosedHiHat = 2,
    #[serde(rename = "hihat_open")]
    OpenHiHat = 3,
    Clap = 4,
    #[serde(rename = "perc")]
    Percussion = 5,
}

impl Lane {
    pub const ALL: [Lane; LANE_COUNT] = [
        Lane::Kick,
        Lane::Snare,
        Lane::ClosedHiHat,
        Lane::OpenHiHat,
        Lane::Clap,
        Lane::Percussion,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// External name used in pattern JSON and reports.
    pub fn name(self) -> &'static str {
        match self {
            Lane::Kick => "kick",
            Lane::Snare => "snare",
            Lane::ClosedHiHat => "hihat_closed",
            Lane::OpenHiHat => "hihat_open",
            Lane::Clap => "clap",
            Lane::Percussion => "perc",
        }
    }

    /// The lane a MIDI pitch belongs to, if any.
    pub fn from_pitch(pitch: u8) -> Option<Lane> {
        PITCH_TABLE
            .iter()
            .find(|(p, _)| *p == pitch)
            .map(|&(_, lane)| lane)
    }

    /// Canonical pitch written for this lane.
    pub fn pitch(self) -> u8 {
        PITCH_TABLE[self.index()].0
    }
}

/// True if `pitch` is one of the six mapped drum pitches.
pub fn is_allowed_pitch(pitch: u8) -> bool {
    Lane::from_pitch(pitch).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_in_index_order() {
        for (i, lane) in Lane::ALL.iter().enumerate() {
            assert_eq!(lane.index(), i);
        }
    }

    #[test]
    fn pitch_table_round_trips() {
        for lane in Lane::ALL {
            assert_eq!(Lane::from_pitch(lane.pitch()), Some(lane));
        }
    }

    #[test]
    fn unmapped_pitches_are_discarded() {
        assert_eq!(Lane::from_pitch(60), None);
        assert_eq!(Lane::from_pitch(37), None);
        assert!(!is_allowed_pitch(0));
        assert!(is_allowed_pitch(39));
    }

    #[test]
    fn serde_uses_external_names() {
        for lane in Lane::ALL {
            let json = serde_json::to_string(&lane).unwrap();
            assert_eq!(json, format!("\"{}\"", lane.name()));
        }
    }
}
