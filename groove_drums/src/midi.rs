// Standard MIDI File input and output for drum recordings.
//
// Reading turns an SMF into a `Recording`: note events with start/end times in
// seconds, grouped per (track, channel) into instruments. Tick times are
// converted through the file's tempo map (120 BPM until the first tempo meta
// event), or directly for SMPTE timecode files. Channel 10 (zero-based 9) is
// the General MIDI percussion channel; only instruments on it count as drum
// tracks.
//
// Writing is the inverse used by normalization and by test fixtures: SMF
// format 1 at a fixed 120 BPM and 960 ticks per quarter, a tempo track, one
// track per instrument, and each end-of-track placed at the recording's
// duration so the bar length survives a write/read cycle.
//
// Uses the `midly` crate for parsing and serialization.

use crate::error::{DrumError, Result};
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use std::collections::BTreeMap;
use std::path::Path;

/// Zero-based General MIDI percussion channel.
pub const DRUM_CHANNEL: u8 = 9;

/// Microseconds per quarter note at 120 BPM (the SMF default tempo).
const DEFAULT_TEMPO_US: u32 = 500_000;

/// Ticks per quarter note used when writing.
const WRITE_TICKS_PER_QUARTER: u16 = 960;

/// Ticks per second when writing (960 ticks per quarter at 2 quarters/s).
const WRITE_TICKS_PER_SECOND: f64 = WRITE_TICKS_PER_QUARTER as f64 * 2.0;

/// One played note. Times are seconds from the start of the file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    pub pitch: u8,
    pub start: f64,
    pub end: f64,
    pub velocity: u8,
}

/// Notes that share a track and channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub channel: u8,
    pub notes: Vec<NoteEvent>,
}

impl Instrument {
    pub fn drums(notes: Vec<NoteEvent>) -> Self {
        Instrument {
            channel: DRUM_CHANNEL,
            notes,
        }
    }

    pub fn is_drum(&self) -> bool {
        self.channel == DRUM_CHANNEL
    }
}

/// A parsed recording.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    /// Length in seconds: the later of the last note end and the last
    /// end-of-track marker.
    pub duration: f64,
    pub instruments: Vec<Instrument>,
}

impl Recording {
    pub fn new(duration: f64) -> Self {
        Recording {
            duration,
            instruments: Vec::new(),
        }
    }

    /// All notes on percussion tracks.
    pub fn percussion_events(&self) -> impl Iterator<Item = &NoteEvent> {
        self.instruments
            .iter()
            .filter(|i| i.is_drum())
            .flat_map(|i| i.notes.iter())
    }

    pub fn note_count(&self) -> usize {
        self.instruments.iter().map(|i| i.notes.len()).sum()
    }
}

/// Read and parse a MIDI file.
pub fn read_recording(path: &Path) -> Result<Recording> {
    let bytes = std::fs::read(path)?;
    parse_recording(&bytes).map_err(|e| DrumError::midi(path, e))
}

/// Parse SMF bytes.
pub fn parse_recording(bytes: &[u8]) -> std::result::Result<Recording, midly::Error> {
    let smf = Smf::parse(bytes)?;
    let clock = TickClock::from_smf(&smf);

    let mut grouped: BTreeMap<(usize, u8), Vec<NoteEvent>> = BTreeMap::new();
    let mut duration: f64 = 0.0;

    for (track_index, track) in smf.tracks.iter().enumerate() {
        // Open notes per (channel, key), closed first-in first-out.
        let mut open: BTreeMap<(u8, u8), Vec<(u64, u8)>> = BTreeMap::new();
        let mut tick: u64 = 0;

        for event in track {
            tick += event.delta.as_int() as u64;
            let TrackEventKind::Midi { channel, message } = event.kind else {
                continue;
            };
            let channel = channel.as_int();
            match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    open.entry((channel, key.as_int()))
                        .or_default()
                        .push((tick, vel.as_int()));
                }
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                    let Some(stack) = open.get_mut(&(channel, key.as_int())) else {
                        continue;
                    };
                    if stack.is_empty() {
                        continue;
                    }
                    let (start_tick, velocity) = stack.remove(0);
                    let note = NoteEvent {
                        pitch: key.as_int(),
                        start: clock.seconds(start_tick),
                        end: clock.seconds(tick),
                        velocity,
                    };
                    duration = duration.max(note.end);
                    grouped.entry((track_index, channel)).or_default().push(note);
                }
                _ => {}
            }
        }

        let end_seconds = clock.seconds(tick);
        duration = duration.max(end_seconds);

        // Notes still held at end of track end there.
        for ((channel, key), stack) in open {
            for (start_tick, velocity) in stack {
                grouped.entry((track_index, channel)).or_default().push(NoteEvent {
                    pitch: key,
                    start: clock.seconds(start_tick),
                    end: end_seconds,
                    velocity,
                });
            }
        }
    }

    let instruments = grouped
        .into_iter()
        .map(|((_, channel), mut notes)| {
            notes.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.pitch.cmp(&b.pitch)));
            Instrument { channel, notes }
        })
        .collect();

    Ok(Recording {
        duration,
        instruments,
    })
}

/// Converts absolute ticks to seconds.
enum TickClock {
    /// Metrical timing: ticks per quarter plus sorted (tick, µs per quarter)
    /// tempo changes.
    Metrical { ticks_per_quarter: f64, tempo_map: Vec<(u64, u32)> },
    /// SMPTE timing: a fixed number of ticks per second.
    Timecode { ticks_per_second: f64 },
}

impl TickClock {
    fn from_smf(smf: &Smf<'_>) -> Self {
        match smf.header.timing {
            Timing::Metrical(tpq) => {
                let mut tempo_map = Vec::new();
                for track in &smf.tracks {
                    let mut tick: u64 = 0;
                    for event in track {
                        tick += event.delta.as_int() as u64;
                        if let TrackEventKind::Meta(MetaMessage::Tempo(us)) = event.kind {
                            tempo_map.push((tick, us.as_int()));
                        }
                    }
                }
                tempo_map.sort_by_key(|&(t, _)| t);
                TickClock::Metrical {
                    ticks_per_quarter: tpq.as_int().max(1) as f64,
                    tempo_map,
                }
            }
            Timing::Timecode(fps, subframes) => TickClock::Timecode {
                ticks_per_second: (fps.as_f32() as f64 * subframes.max(1) as f64).max(1.0),
            },
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        match self {
            TickClock::Timecode { ticks_per_second } => tick as f64 / ticks_per_second,
            TickClock::Metrical {
                ticks_per_quarter,
                tempo_map,
            } => {
                let mut seconds = 0.0;
                let mut last_tick = 0u64;
                let mut tempo = DEFAULT_TEMPO_US;
                for &(change_tick, change_tempo) in tempo_map {
                    if change_tick >= tick {
                        break;
                    }
                    seconds += (change_tick - last_tick) as f64 * tempo as f64
                        / 1_000_000.0
                        / ticks_per_quarter;
                    last_tick = change_tick;
                    tempo = change_tempo;
                }
                seconds + (tick - last_tick) as f64 * tempo as f64 / 1_000_000.0 / ticks_per_quarter
            }
        }
    }
}

/// Write a recording as SMF format 1.
pub fn write_recording(recording: &Recording, path: &Path) -> Result<()> {
    let smf = recording_to_smf(recording);
    let mut buf = Vec::new();
    smf.write(&mut buf).map_err(|e| DrumError::midi(path, e))?;
    std::fs::write(path, &buf)?;
    Ok(())
}

fn to_ticks(seconds: f64) -> u32 {
    (seconds.max(0.0) * WRITE_TICKS_PER_SECOND).round() as u32
}

fn recording_to_smf(recording: &Recording) -> Smf<'static> {
    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(WRITE_TICKS_PER_QUARTER)),
    ));
    let end_tick = to_ticks(recording.duration);

    let tempo_track: Track<'static> = vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(DEFAULT_TEMPO_US))),
        },
        TrackEvent {
            delta: u28::new(end_tick),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        },
    ];
    smf.tracks.push(tempo_track);

    for instrument in &recording.instruments {
        let channel = u4::new(instrument.channel & 0x0f);

        // (tick, is_on, key, velocity); offs sort before ons at the same tick
        // so back-to-back hits on one key stay distinct.
        let mut timeline: Vec<(u32, bool, u8, u8)> = Vec::with_capacity(instrument.notes.len() * 2);
        for note in &instrument.notes {
            let on = to_ticks(note.start);
            let off = to_ticks(note.end).max(on + 1);
            timeline.push((on, true, note.pitch & 0x7f, note.velocity.clamp(1, 127)));
            timeline.push((off, false, note.pitch & 0x7f, 0));
        }
        timeline.sort_by_key(|&(tick, is_on, key, _)| (tick, is_on, key));

        let mut track: Track<'static> = Vec::with_capacity(timeline.len() + 1);
        let mut last_tick = 0u32;
        for (tick, is_on, key, vel) in timeline {
            let message = if is_on {
                MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(vel),
                }
            } else {
                MidiMessage::NoteOff {
                    key: u7::new(key),
                    vel: u7::new(0),
                }
            };
            track.push(TrackEvent {
                delta: u28::new(tick - last_tick),
                kind: TrackEventKind::Midi { channel, message },
            });
            last_tick = tick;
        }
        track.push(TrackEvent {
            delta: u28::new(end_tick.saturating_sub(last_tick)),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        smf.tracks.push(track);
    }

    smf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(pitch: u8, start: f64, end: f64) -> NoteEvent {
        NoteEvent {
            pitch,
            start,
            end,
            velocity: 100,
        }
    }

    #[test]
    fn write_then_read_preserves_notes_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beat.mid");

        let mut recording = Recording::new(2.0);
        recording
            .instruments
            .push(Instrument::drums(vec![note(36, 0.0, 0.25), note(38, 1.0, 1.25)]));
        recording.instruments.push(Instrument {
            channel: 0,
            notes: vec![note(60, 0.5, 1.0)],
        });
        write_recording(&recording, &path).unwrap();

        let parsed = read_recording(&path).unwrap();
        assert!((parsed.duration - 2.0).abs() < 1e-9);
        assert_eq!(parsed.instruments.len(), 2);
        let drums: Vec<_> = parsed.percussion_events().collect();
        assert_eq!(drums.len(), 2);
        assert_eq!(drums[0].pitch, 36);
        assert!((drums[1].start - 1.0).abs() < 1e-3);
        assert!((drums[1].end - 1.25).abs() < 1e-3);
        assert_eq!(drums[1].velocity, 100);
    }

    #[test]
    fn note_on_with_zero_velocity_closes_note() {
        let mut smf = Smf::new(Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480))));
        let channel = u4::new(DRUM_CHANNEL);
        smf.tracks.push(vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel,
                    message: MidiMessage::NoteOn { key: u7::new(36), vel: u7::new(90) },
                },
            },
            TrackEvent {
                delta: u28::new(480),
                kind: TrackEventKind::Midi {
                    channel,
                    message: MidiMessage::NoteOn { key: u7::new(36), vel: u7::new(0) },
                },
            },
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
            },
        ]);
        let mut buf = Vec::new();
        smf.write(&mut buf).unwrap();

        let recording = parse_recording(&buf).unwrap();
        let notes: Vec<_> = recording.percussion_events().collect();
        assert_eq!(notes.len(), 1);
        // One quarter at the default 120 BPM.
        assert!((notes[0].end - 0.5).abs() < 1e-9);
        assert!((recording.duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn tempo_changes_are_honoured() {
        let clock = TickClock::Metrical {
            ticks_per_quarter: 480.0,
            tempo_map: vec![(480, 1_000_000)],
        };
        // First quarter at 120 BPM, second at 60 BPM.
        assert!((clock.seconds(480) - 0.5).abs() < 1e-12);
        assert!((clock.seconds(960) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn garbage_bytes_fail_to_parse() {
        assert!(parse_recording(b"definitely not midi").is_err());
    }
}
