//! Sequence Library
//!
//! One ordered mapping from id to [`Sequence`], with a case-insensitive name
//! index. It is pre-populated with the builtin catalogue and accepts further
//! registrations at runtime or from TOML definition files.
//!
//! # Definition Files
//!
//! ```toml
//! [[sequence]]
//! id = 70
//! name = "peekaboo"
//! includes_sound_and_light = true
//!
//! [[sequence.steps]]
//! offset_ms = 0
//! positions = { 1 = "open", 2 = "open" }
//! cues = [{ cue = "sound", bank = 3, index = 2 }]
//!
//! [[sequence.steps]]
//! offset_ms = 1500
//! positions = { 1 = "closed", 2 = 1500 }
//! ramp = true
//! ```
//!
//! MarcDuino panel tables can be pasted as rows instead of steps. Each row is
//! `[duration_cs, servo1..servo12, speed?, start_servo?, end_servo?]`; the
//! step fires once its duration has elapsed after the previous one.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Cue, EngineError, Position, Sequence, SequenceRef, SequenceStep};
use crate::protocol::PANEL_COUNT;

/// Servo columns in a MarcDuino row
const MARCDUINO_SERVO_COLUMNS: usize = 12;

/// Ordered id → sequence mapping with a name index
#[derive(Debug, Clone, Default)]
pub struct SequenceLibrary {
    by_id: BTreeMap<u8, Arc<Sequence>>,
    by_name: HashMap<String, u8>,
}

impl SequenceLibrary {
    /// Create an empty library
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a library holding the builtin catalogue
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut library = Self::empty();
        for sequence in super::catalogue::builtins() {
            let id = sequence.id;
            let name = sequence.name.to_ascii_lowercase();
            library.by_name.insert(name, id);
            library.by_id.insert(id, Arc::new(sequence));
        }
        library
    }

    /// Validate and add a sequence
    ///
    /// # Errors
    ///
    /// - `InvalidSequence` if validation fails
    /// - `DuplicateSequence` if the id or name is taken
    pub fn register(&mut self, sequence: Sequence) -> Result<Arc<Sequence>, EngineError> {
        sequence.validate(PANEL_COUNT)?;

        let key = sequence.name.to_ascii_lowercase();
        if self.by_id.contains_key(&sequence.id) {
            return Err(EngineError::DuplicateSequence(format!(
                "id {:02}",
                sequence.id
            )));
        }
        if self.by_name.contains_key(&key) {
            return Err(EngineError::DuplicateSequence(format!(
                "name {}",
                sequence.name
            )));
        }

        tracing::debug!(id = sequence.id, name = %sequence.name, steps = sequence.steps.len(), "Registered sequence");
        let sequence = Arc::new(sequence);
        self.by_name.insert(key, sequence.id);
        self.by_id.insert(sequence.id, Arc::clone(&sequence));
        Ok(sequence)
    }

    /// Look up by id or name
    #[must_use]
    pub fn get(&self, reference: &SequenceRef) -> Option<Arc<Sequence>> {
        match reference {
            SequenceRef::Id(id) => self.by_id.get(id).cloned(),
            SequenceRef::Name(name) => self
                .by_name
                .get(&name.to_ascii_lowercase())
                .and_then(|id| self.by_id.get(id))
                .cloned(),
        }
    }

    /// All sequences ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Sequence>> {
        self.by_id.values()
    }

    /// Number of sequences
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the library is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Register every sequence in a TOML definition file
    ///
    /// # Errors
    ///
    /// `Load` if the file cannot be read or parsed; otherwise the first
    /// registration error. Sequences before the failing one stay registered.
    pub fn load_file(&mut self, path: &Path) -> Result<usize, EngineError> {
        let load_err = |reason: String| EngineError::Load {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let file: DefinitionFile = toml::from_str(&text).map_err(|e| load_err(e.to_string()))?;

        let mut count = 0;
        for definition in file.sequence {
            let sequence = definition.into_sequence()?;
            self.register(sequence)?;
            count += 1;
        }
        Ok(count)
    }

    /// Register every `*.toml` file in `dir`, in file name order
    ///
    /// A file that fails is logged and skipped so one bad definition does not
    /// hide the rest.
    ///
    /// # Errors
    ///
    /// `Load` if the directory cannot be read.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, EngineError> {
        let entries = std::fs::read_dir(dir).map_err(|e| EngineError::Load {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut total = 0;
        for path in paths {
            match self.load_file(&path) {
                Ok(n) => {
                    tracing::info!(path = %path.display(), sequences = n, "Loaded sequence file");
                    total += n;
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping sequence file"),
            }
        }
        Ok(total)
    }
}

// ============================================================================
// Definitions
// ============================================================================

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    sequence: Vec<SequenceDefinition>,
}

/// Serialized sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    /// Numeric id
    pub id: u8,
    /// Name
    pub name: String,
    /// Whether steps carry sound or light cues
    #[serde(default)]
    pub includes_sound_and_light: bool,
    /// Steps with absolute offsets
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// MarcDuino panel table rows (used when `steps` is empty)
    #[serde(default)]
    pub rows: Vec<Vec<i32>>,
}

/// Serialized step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Offset from the start of the run
    pub offset_ms: u64,
    /// Channel number (as a string key) to position
    #[serde(default)]
    pub positions: BTreeMap<String, Position>,
    /// Human label
    #[serde(default)]
    pub description: String,
    /// Sound, light and dome cues
    #[serde(default)]
    pub cues: Vec<Cue>,
    /// Interpolate towards this step
    #[serde(default)]
    pub ramp: bool,
}

impl SequenceDefinition {
    /// Convert to a sequence (validation happens on registration)
    ///
    /// # Errors
    ///
    /// `InvalidSequence` for unparseable channel keys or malformed rows.
    pub fn into_sequence(self) -> Result<Sequence, EngineError> {
        let steps = if self.steps.is_empty() {
            marcduino_steps(&self.name, &self.rows)?
        } else {
            self.steps
                .into_iter()
                .map(|step| step.into_step(&self.name))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Sequence {
            id: self.id,
            name: self.name,
            includes_sound_and_light: self.includes_sound_and_light,
            steps,
        })
    }
}

impl StepDefinition {
    fn into_step(self, sequence: &str) -> Result<SequenceStep, EngineError> {
        let actuator_positions = self
            .positions
            .into_iter()
            .map(|(key, position)| {
                key.trim()
                    .parse::<u8>()
                    .map(|channel| (channel, position))
                    .map_err(|_| EngineError::InvalidSequence {
                        name: sequence.to_string(),
                        reason: format!("channel key {key:?} is not a number"),
                    })
            })
            .collect::<Result<_, _>>()?;

        Ok(SequenceStep {
            offset_ms: self.offset_ms,
            actuator_positions,
            description: self.description,
            cues: self.cues,
            ramp: self.ramp,
        })
    }
}

/// Convert MarcDuino panel table rows into steps with absolute offsets
///
/// # Errors
///
/// `InvalidSequence` for short rows, negative durations or unknown position
/// values.
pub fn marcduino_steps(name: &str, rows: &[Vec<i32>]) -> Result<Vec<SequenceStep>, EngineError> {
    let invalid = |reason: String| EngineError::InvalidSequence {
        name: name.to_string(),
        reason,
    };

    let mut offset_ms: u64 = 0;
    let mut steps = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        if row.len() < 1 + MARCDUINO_SERVO_COLUMNS {
            return Err(invalid(format!(
                "row {i} has {} columns, need at least {}",
                row.len(),
                1 + MARCDUINO_SERVO_COLUMNS
            )));
        }
        let duration_cs =
            u64::try_from(row[0]).map_err(|_| invalid(format!("row {i} has negative duration")))?;
        offset_ms += duration_cs * 10;

        let speed = row.get(13).copied().unwrap_or(0);
        let first = row.get(14).copied().unwrap_or(1);
        let last = row
            .get(15)
            .copied()
            .unwrap_or(MARCDUINO_SERVO_COLUMNS as i32);

        let mut actuator_positions = BTreeMap::new();
        for (column, &value) in row[1..=MARCDUINO_SERVO_COLUMNS].iter().enumerate() {
            let channel = column as i32 + 1;
            if channel < first || channel > last {
                continue;
            }
            let position = Position::from_marcduino(value)
                .ok_or_else(|| invalid(format!("row {i} servo {channel} value {value}")))?;
            actuator_positions.insert(channel as u8, position);
        }

        steps.push(SequenceStep {
            offset_ms,
            actuator_positions,
            description: format!("Step {}", i + 1),
            cues: Vec::new(),
            ramp: speed > 0,
        });
    }
    Ok(steps)
}
