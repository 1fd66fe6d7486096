use serde::{Deserialize, Serialize};

/// Absolute position on the session timeline, in audio frames.
pub type FramePos = i64;
/// Signed distance between two timeline positions, in frames.
pub type FrameCount = i64;
/// Frames handled by one process call.
pub type PFrames = u32;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_BPM: f64 = 120.0;

#[must_use]
pub fn beats_to_seconds(beats: f64, bpm: f64) -> f64 {
    if bpm <= 0.0 {
        return 0.0;
    }

    beats * (60.0 / bpm)
}

#[must_use]
pub fn seconds_to_beats(seconds: f64, bpm: f64) -> f64 {
    if bpm <= 0.0 {
        return 0.0;
    }

    seconds * (bpm / 60.0)
}

#[must_use]
pub fn frames_to_seconds(frames: FrameCount, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }

    frames as f64 / f64::from(sample_rate)
}

#[must_use]
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> FrameCount {
    (seconds * f64::from(sample_rate)).round() as FrameCount
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TempoSection {
    pub frame: FramePos,
    pub bpm: f64,
}

/// Piecewise-constant tempo map. The first section always starts at frame 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TempoMap {
    sample_rate: u32,
    sections: Vec<TempoSection>,
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::constant(DEFAULT_BPM, DEFAULT_SAMPLE_RATE)
    }
}

impl TempoMap {
    #[must_use]
    pub fn constant(bpm: f64, sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            sections: vec![TempoSection {
                frame: 0,
                bpm: sanitize_bpm(bpm),
            }],
        }
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn sections(&self) -> &[TempoSection] {
        &self.sections
    }

    /// Adds a tempo change. A change at an existing frame replaces it.
    pub fn add_tempo(&mut self, frame: FramePos, bpm: f64) {
        let section = TempoSection {
            frame: frame.max(0),
            bpm: sanitize_bpm(bpm),
        };
        match self
            .sections
            .binary_search_by(|existing| existing.frame.cmp(&section.frame))
        {
            Ok(index) => self.sections[index] = section,
            Err(index) => self.sections.insert(index, section),
        }
    }

    #[must_use]
    pub fn bpm_at(&self, frame: FramePos) -> f64 {
        self.sections
            .iter()
            .take_while(|section| section.frame <= frame)
            .last()
            .map_or(DEFAULT_BPM, |section| section.bpm)
    }

    /// Musical position (in beats from session start) of an absolute frame.
    #[must_use]
    pub fn frame_to_beats(&self, frame: FramePos) -> f64 {
        let mut beats = 0.0;
        for (index, section) in self.sections.iter().enumerate() {
            let section_end = self
                .sections
                .get(index + 1)
                .map_or(FramePos::MAX, |next| next.frame);
            if frame <= section.frame {
                break;
            }
            let span = frame.min(section_end) - section.frame;
            beats += seconds_to_beats(frames_to_seconds(span, self.sample_rate), section.bpm);
            if frame <= section_end {
                break;
            }
        }
        if frame < 0 {
            let first_bpm = self.sections.first().map_or(DEFAULT_BPM, |section| section.bpm);
            return seconds_to_beats(frames_to_seconds(frame, self.sample_rate), first_bpm);
        }
        beats
    }

    /// Absolute frame of a musical position (in beats from session start).
    #[must_use]
    pub fn beats_to_frame(&self, beats: f64) -> FramePos {
        if beats <= 0.0 {
            let first_bpm = self.sections.first().map_or(DEFAULT_BPM, |section| section.bpm);
            return seconds_to_frames(beats_to_seconds(beats, first_bpm), self.sample_rate);
        }

        let mut remaining = beats;
        for (index, section) in self.sections.iter().enumerate() {
            let next = self.sections.get(index + 1);
            let section_beats = next.map_or(f64::INFINITY, |next| {
                seconds_to_beats(
                    frames_to_seconds(next.frame - section.frame, self.sample_rate),
                    section.bpm,
                )
            });
            if remaining <= section_beats {
                return section.frame
                    + seconds_to_frames(beats_to_seconds(remaining, section.bpm), self.sample_rate);
            }
            remaining -= section_beats;
        }
        0
    }
}

/// Converts between frame distances and beat distances relative to a fixed
/// timeline origin, honouring tempo changes after the origin.
#[derive(Debug, Clone, Copy)]
pub struct BeatsFramesConverter<'a> {
    map: &'a TempoMap,
    origin: FramePos,
}

impl<'a> BeatsFramesConverter<'a> {
    #[must_use]
    pub fn new(map: &'a TempoMap, origin: FramePos) -> Self {
        Self { map, origin }
    }

    #[must_use]
    pub fn origin(&self) -> FramePos {
        self.origin
    }

    /// Beat distance to frame distance.
    #[must_use]
    pub fn to(&self, beats: f64) -> FrameCount {
        let origin_beats = self.map.frame_to_beats(self.origin);
        self.map.beats_to_frame(origin_beats + beats) - self.origin
    }

    /// Frame distance to beat distance.
    #[must_use]
    pub fn from(&self, frames: FrameCount) -> f64 {
        self.map.frame_to_beats(self.origin + frames) - self.map.frame_to_beats(self.origin)
    }
}

fn sanitize_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() { bpm.max(1.0) } else { DEFAULT_BPM }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_tempo_round_trip_is_stable() {
        let map = TempoMap::constant(120.0, 48_000);
        assert_eq!(map.beats_to_frame(1.0), 24_000);
        assert!((map.frame_to_beats(48_000) - 2.0).abs() < 1e-9);
        assert_eq!(map.beats_to_frame(map.frame_to_beats(123_457)), 123_457);
    }

    #[test]
    fn tempo_change_splits_conversion() {
        let mut map = TempoMap::constant(120.0, 48_000);
        map.add_tempo(48_000, 60.0);
        // two beats in the first second, then one beat per second
        assert!((map.frame_to_beats(96_000) - 3.0).abs() < 1e-9);
        assert_eq!(map.beats_to_frame(3.0), 96_000);
        assert!((map.bpm_at(50_000) - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn converter_is_relative_to_origin() {
        let mut map = TempoMap::constant(120.0, 48_000);
        map.add_tempo(48_000, 60.0);
        let converter = BeatsFramesConverter::new(&map, 24_000);
        // half a second at 120 bpm then half a second at 60 bpm
        assert!((converter.from(48_000) - 1.5).abs() < 1e-9);
        assert_eq!(converter.to(1.5), 48_000);
    }
}
