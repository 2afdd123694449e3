//! Builtin sequence catalogue
//!
//! Ids follow the MarcDuino protocol reference so external tooling keeps
//! working:
//!
//! | id | name           | id | name           |
//! |----|----------------|----|----------------|
//! | 00 | closeall       | 51 | panelscream    |
//! | 01 | scream         | 52 | panelwave      |
//! | 02 | wave           | 53 | panelsmirk     |
//! | 03 | smirk          | 54 | panelwave2     |
//! | 04 | wave2          | 55 | marchingants   |
//! | 05 | beepcantina    | 56 | panelfaint     |
//! | 06 | faint          | 57 | paneldance     |
//! | 07 | cantina        | 58 | byebye         |
//! | 08 | leia           | 59 | halfopen       |
//! | 09 | disco          |    |                |
//! | 10 | quiet          |    |                |
//! | 11 | fullawake      |    |                |
//! | 12 | toprc          |    |                |
//! | 13 | midawake       |    |                |
//! | 14 | awakeplus      |    |                |
//! | 15 | screamnopanels |    |                |
//! | 16 | wiggle         |    |                |
//!
//! 00-16 carry sound and light cues (except 12, top panels to RC); 51-59 move
//! panels only.

use super::{Cue, Position, Sequence, SequenceStep};
use crate::hal::pattern;
use crate::hal::PatternParam;
use crate::protocol::{NamedSound, PANEL_COUNT};

/// The ten dome panels
const DOME_PANELS: [u8; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

/// Pie panels on top of the dome
const TOP_PANELS: [u8; 3] = [11, 12, 13];

const ODD_PANELS: [u8; 5] = [1, 3, 5, 7, 9];
const EVEN_PANELS: [u8; 5] = [2, 4, 6, 8, 10];

/// Fluent constructor for sequences
#[derive(Debug, Clone)]
pub struct SequenceBuilder {
    sequence: Sequence,
}

impl SequenceBuilder {
    /// Start an empty sequence
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        Self {
            sequence: Sequence {
                id,
                name: name.into(),
                includes_sound_and_light: false,
                steps: Vec::new(),
            },
        }
    }

    /// Mark the sequence as carrying sound and light cues
    #[must_use]
    pub fn with_sound_and_light(mut self) -> Self {
        self.sequence.includes_sound_and_light = true;
        self
    }

    /// Append a step
    #[must_use]
    pub fn step(
        mut self,
        offset_ms: u64,
        description: impl Into<String>,
        positions: impl IntoIterator<Item = (u8, Position)>,
    ) -> Self {
        self.sequence.steps.push(SequenceStep {
            offset_ms,
            actuator_positions: positions.into_iter().collect(),
            description: description.into(),
            cues: Vec::new(),
            ramp: false,
        });
        self
    }

    /// Make the last step ramp from the previous positions
    #[must_use]
    pub fn ramp(mut self) -> Self {
        if let Some(step) = self.sequence.steps.last_mut() {
            step.ramp = true;
        }
        self
    }

    /// Attach a cue to the first step at `offset_ms`, adding a step if none exists
    #[must_use]
    pub fn cue_at(mut self, offset_ms: u64, cue: Cue) -> Self {
        let steps = &mut self.sequence.steps;
        if let Some(step) = steps.iter_mut().find(|s| s.offset_ms == offset_ms) {
            step.cues.push(cue);
        } else {
            let at = steps.partition_point(|s| s.offset_ms <= offset_ms);
            steps.insert(
                at,
                SequenceStep {
                    offset_ms,
                    description: "cue".to_string(),
                    cues: vec![cue],
                    ..SequenceStep::default()
                },
            );
        }
        self
    }

    /// Finish the sequence
    #[must_use]
    pub fn build(self) -> Sequence {
        self.sequence
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn all(position: Position) -> Vec<(u8, Position)> {
    (1..=PANEL_COUNT).map(|ch| (ch, position)).collect()
}

fn panels(channels: &[u8], position: Position) -> Vec<(u8, Position)> {
    channels.iter().map(|&ch| (ch, position)).collect()
}

fn named(sound: NamedSound) -> Cue {
    let (bank, index) = sound.bank_and_index();
    Cue::Sound {
        bank,
        index: Some(index),
    }
}

fn light(pattern: &str, params: &[u32]) -> Cue {
    Cue::Light {
        pattern: pattern.to_string(),
        params: params.iter().copied().map(PatternParam::Int).collect(),
    }
}

fn display_normal() -> Cue {
    light(pattern::DISPLAY_MODE, &[0, 0])
}

// ============================================================================
// Panel choreography
// ============================================================================

fn close_all(b: SequenceBuilder) -> SequenceBuilder {
    b.step(0, "close all", all(Position::Closed))
        .step(2000, "release all", all(Position::NoPulse))
}

fn scream(b: SequenceBuilder) -> SequenceBuilder {
    b.step(0, "open all", all(Position::Open))
        .step(3000, "close all", all(Position::Closed))
        .step(4000, "release all", all(Position::NoPulse))
}

fn wave(b: SequenceBuilder) -> SequenceBuilder {
    let mut b = b.step(0, "close all", all(Position::Closed));
    for (i, &panel) in DOME_PANELS.iter().enumerate() {
        let mut positions = panels(&[panel], Position::Open);
        if panel > 1 {
            positions.push((panel - 1, Position::Closed));
        }
        b = b.step(300 * (i as u64 + 1), format!("open {panel}"), positions);
    }
    b.step(3300, "close 10", panels(&[10], Position::Closed))
        .step(4000, "release all", all(Position::NoPulse))
}

fn smirk(b: SequenceBuilder) -> SequenceBuilder {
    let mut b = b.step(0, "close all", all(Position::Closed));
    let forward = DOME_PANELS.iter().copied();
    let back = DOME_PANELS.iter().rev().skip(1).copied();
    let mut previous: Option<u8> = None;
    let mut offset = 0;
    for panel in forward.chain(back) {
        offset += 150;
        let mut positions = panels(&[panel], Position::Open);
        if let Some(prev) = previous {
            positions.push((prev, Position::Closed));
        }
        b = b.step(offset, format!("open {panel}"), positions);
        previous = Some(panel);
    }
    b.step(offset + 150, "close all", all(Position::Closed))
        .step(offset + 850, "release all", all(Position::NoPulse))
}

fn wave2(b: SequenceBuilder) -> SequenceBuilder {
    let mut b = b.step(0, "close all", all(Position::Closed));
    for (i, &panel) in DOME_PANELS.iter().enumerate() {
        b = b.step(300 * (i as u64 + 1), format!("open {panel}"), panels(&[panel], Position::Open));
    }
    for (i, &panel) in DOME_PANELS.iter().enumerate() {
        b = b.step(
            3300 + 300 * i as u64,
            format!("close {panel}"),
            panels(&[panel], Position::Closed),
        );
    }
    b.step(7000, "release all", all(Position::NoPulse))
}

fn marching_ants(b: SequenceBuilder, cycles: u64) -> SequenceBuilder {
    let mut b = b.step(0, "close all", all(Position::Closed));
    for c in 0..cycles {
        let (open, closed) = if c % 2 == 0 {
            (&ODD_PANELS, &EVEN_PANELS)
        } else {
            (&EVEN_PANELS, &ODD_PANELS)
        };
        let mut positions = panels(open, Position::Open);
        positions.extend(panels(closed, Position::Closed));
        b = b.step(500 * (c + 1), "march", positions);
    }
    let end = 500 * (cycles + 1);
    b.step(end, "close all", all(Position::Closed))
        .step(end + 700, "release all", all(Position::NoPulse))
}

fn faint(b: SequenceBuilder) -> SequenceBuilder {
    b.step(0, "open all", all(Position::Open))
        .step(500, "sag to half", all(Position::Mid))
        .step(3000, "slowly close", all(Position::Closed))
        .ramp()
        .step(4000, "release all", all(Position::NoPulse))
}

fn dance(b: SequenceBuilder, beats: u64) -> SequenceBuilder {
    let mut b = b.step(0, "close all", all(Position::Closed));
    for beat in 0..beats {
        let offset = 375 * (beat + 1);
        let positions = match beat % 4 {
            0 => panels(&[1, 3, 5], Position::Open),
            1 => {
                let mut p = panels(&[1, 3, 5], Position::Closed);
                p.extend(panels(&[2, 4, 6], Position::Open));
                p
            }
            2 => panels(&DOME_PANELS, Position::Mid),
            _ => panels(&DOME_PANELS, Position::Closed),
        };
        b = b.step(offset, format!("beat {}", beat + 1), positions);
    }
    let end = 375 * (beats + 1);
    b.step(end, "close all", all(Position::Closed))
        .step(end + 700, "release all", all(Position::NoPulse))
}

fn byebye(b: SequenceBuilder) -> SequenceBuilder {
    let mut b = b
        .step(0, "close all", all(Position::Closed))
        .step(500, "open all", all(Position::Open));
    for i in 0..6u64 {
        let position = if i % 2 == 0 { Position::Mid } else { Position::Open };
        b = b.step(1000 + 500 * i, "wave", panels(&[4, 5, 6, 7], position));
    }
    b.step(4500, "close all", all(Position::Closed))
        .step(5500, "release all", all(Position::NoPulse))
}

fn half_open(b: SequenceBuilder) -> SequenceBuilder {
    b.step(0, "half open all", all(Position::Mid))
}

fn wiggle(b: SequenceBuilder) -> SequenceBuilder {
    let mut b = b.step(0, "close all", all(Position::Closed));
    for i in 0..6u64 {
        let position = if i % 2 == 0 { Position::Mid } else { Position::Closed };
        b = b.step(200 * (i + 1), "wiggle", panels(&DOME_PANELS, position));
    }
    b.step(1600, "close all", all(Position::Closed))
        .step(2300, "release all", all(Position::NoPulse))
}

fn top_to_rc(b: SequenceBuilder) -> SequenceBuilder {
    b.step(0, "top panels to RC", panels(&TOP_PANELS, Position::NoPulse))
}

// ============================================================================
// Catalogue
// ============================================================================

/// Every builtin sequence, ordered by id
#[must_use]
pub fn builtins() -> Vec<Sequence> {
    let full = |id: u8, name: &str| SequenceBuilder::new(id, name).with_sound_and_light();
    let panel = |id: u8, name: &str| SequenceBuilder::new(id, name);

    vec![
        close_all(full(0, "closeall"))
            .cue_at(0, Cue::SoundStop)
            .cue_at(0, light(pattern::HOLO_STOP, &[0]))
            .cue_at(0, display_normal())
            .build(),
        scream(full(1, "scream"))
            .cue_at(0, named(NamedSound::Scream))
            .cue_at(0, light(pattern::DISPLAY_MODE, &[0, 1]))
            .cue_at(0, light(pattern::HOLO_FLASH, &[0, 4]))
            .cue_at(4000, display_normal())
            .build(),
        wave(full(2, "wave"))
            .cue_at(0, named(NamedSound::Wave))
            .cue_at(0, light(pattern::HOLO_FLASH, &[0, 4]))
            .build(),
        smirk(full(3, "smirk"))
            .cue_at(0, Cue::Sound { bank: 3, index: None })
            .build(),
        wave2(full(4, "wave2"))
            .cue_at(0, Cue::Sound { bank: 3, index: None })
            .cue_at(0, light(pattern::HOLO_FLICKER, &[0, 6]))
            .build(),
        marching_ants(full(5, "beepcantina"), 12)
            .cue_at(0, named(NamedSound::BeepCantina))
            .cue_at(0, light(pattern::DISPLAY_MODE, &[0, 2]))
            .cue_at(6500, display_normal())
            .build(),
        faint(full(6, "faint"))
            .cue_at(0, named(NamedSound::Faint))
            .cue_at(0, light(pattern::DISPLAY_MODE, &[0, 3]))
            .cue_at(0, light(pattern::HOLO_FLICKER, &[0, 3]))
            .cue_at(4000, display_normal())
            .build(),
        dance(full(7, "cantina"), 16)
            .cue_at(0, named(NamedSound::Cantina))
            .cue_at(0, light(pattern::DISPLAY_MODE, &[0, 5]))
            .cue_at(0, light(pattern::HOLO_FLASH, &[0, 6]))
            .cue_at(6375, display_normal())
            .build(),
        close_all(full(8, "leia"))
            .cue_at(0, named(NamedSound::Leia))
            .cue_at(0, light(pattern::HOLO_ON, &[1]))
            .cue_at(0, light(pattern::DISPLAY_MODE, &[0, 6]))
            .cue_at(34_000, light(pattern::HOLO_OFF, &[1]))
            .cue_at(34_000, display_normal())
            .build(),
        marching_ants(full(9, "disco"), 20)
            .cue_at(0, named(NamedSound::Disco))
            .cue_at(0, light(pattern::DISPLAY_MODE, &[0, 4]))
            .cue_at(0, light(pattern::HOLO_RANDOM, &[0]))
            .cue_at(10_500, light(pattern::HOLO_STOP, &[0]))
            .cue_at(10_500, display_normal())
            .build(),
        close_all(full(10, "quiet"))
            .cue_at(0, Cue::SoundStop)
            .cue_at(0, Cue::SoundRandom { enabled: false })
            .cue_at(0, light(pattern::HOLO_STOP, &[0]))
            .cue_at(0, display_normal())
            .build(),
        close_all(full(11, "fullawake"))
            .cue_at(0, Cue::SoundRandom { enabled: true })
            .cue_at(0, light(pattern::HOLO_RANDOM, &[0]))
            .cue_at(0, light(pattern::HOLO_OFF, &[0]))
            .cue_at(0, display_normal())
            .build(),
        top_to_rc(panel(12, "toprc")).build(),
        close_all(full(13, "midawake"))
            .cue_at(0, Cue::SoundRandom { enabled: true })
            .cue_at(0, light(pattern::HOLO_STOP, &[0]))
            .cue_at(0, display_normal())
            .build(),
        close_all(full(14, "awakeplus"))
            .cue_at(0, Cue::SoundRandom { enabled: true })
            .cue_at(0, light(pattern::HOLO_RANDOM, &[0]))
            .cue_at(0, light(pattern::HOLO_ON, &[0]))
            .cue_at(0, display_normal())
            .build(),
        full(15, "screamnopanels")
            .cue_at(0, named(NamedSound::Scream))
            .cue_at(0, light(pattern::DISPLAY_MODE, &[0, 1]))
            .cue_at(0, light(pattern::HOLO_FLASH, &[0, 4]))
            .cue_at(4000, display_normal())
            .build(),
        wiggle(full(16, "wiggle"))
            .cue_at(0, Cue::Sound { bank: 1, index: None })
            .build(),
        scream(panel(51, "panelscream")).build(),
        wave(panel(52, "panelwave")).build(),
        smirk(panel(53, "panelsmirk")).build(),
        wave2(panel(54, "panelwave2")).build(),
        marching_ants(panel(55, "marchingants"), 12).build(),
        faint(panel(56, "panelfaint")).build(),
        dance(panel(57, "paneldance"), 16).build(),
        byebye(panel(58, "byebye")).build(),
        half_open(panel(59, "halfopen")).build(),
    ]
}
