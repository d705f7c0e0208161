use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use thiserror::Error;

use crate::protocol::{ParameterChange, Suggestion};

pub const INTENSITY_MIN: u8 = 0;
pub const INTENSITY_MAX: u8 = 100;

/// Host parameter indices, in the order the host lists them.
pub const PARAM_MODE: usize = 0;
pub const PARAM_INTENSITY: usize = 1;
pub const PARAM_SYNC: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Off,
    Analyze,
    AutoMix,
    Creative,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Off, Mode::Analyze, Mode::AutoMix, Mode::Creative];

    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Off => "Off",
            Mode::Analyze => "Analyze",
            Mode::AutoMix => "Auto-Mix",
            Mode::Creative => "Creative",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mode '{0}'")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "off" => Ok(Mode::Off),
            "analyze" => Ok(Mode::Analyze),
            "automix" => Ok(Mode::AutoMix),
            "creative" => Ok(Mode::Creative),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterState {
    pub mode: Mode,
    pub intensity: u8,
    pub sync_enabled: bool,
}

impl Default for ParameterState {
    fn default() -> Self {
        Self {
            mode: Mode::Analyze,
            intensity: 50,
            sync_enabled: true,
        }
    }
}

/// Process-wide parameter state shared between the real-time and idle
/// contexts. Every field is a single atomic word, so reads never block.
///
/// Writes only happen through the setters below. Out-of-range intensity is
/// clamped, never rejected.
#[derive(Debug)]
pub struct ParameterStore {
    mode: AtomicU8,
    intensity: AtomicU8,
    sync_enabled: AtomicBool,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(ParameterState::default())
    }
}

impl ParameterStore {
    pub fn new(initial: ParameterState) -> Self {
        Self {
            mode: AtomicU8::new(initial.mode.index()),
            intensity: AtomicU8::new(initial.intensity.min(INTENSITY_MAX)),
            sync_enabled: AtomicBool::new(initial.sync_enabled),
        }
    }

    pub fn mode(&self) -> Mode {
        // Only set_mode writes this field, always with a valid index.
        Mode::from_index(self.mode.load(Ordering::Relaxed) as i64).unwrap_or(Mode::Off)
    }

    pub fn intensity(&self) -> u8 {
        self.intensity.load(Ordering::Relaxed)
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ParameterState {
        ParameterState {
            mode: self.mode(),
            intensity: self.intensity(),
            sync_enabled: self.sync_enabled(),
        }
    }

    /// True when beat triggers may be emitted.
    pub fn triggers_enabled(&self) -> bool {
        self.sync_enabled() && self.mode() != Mode::Off
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode.store(mode.index(), Ordering::Relaxed);
    }

    /// Stores `value` clamped into `[0, 100]` and returns what was stored.
    pub fn set_intensity(&self, value: i64) -> u8 {
        let clamped = clamp_intensity(value);
        self.intensity.store(clamped, Ordering::Relaxed);
        clamped
    }

    /// Shifts intensity by `delta`, clamping the result. Atomic with respect
    /// to concurrent setters.
    pub fn adjust_intensity(&self, delta: i64) -> u8 {
        let shifted = |current: u8| clamp_intensity((current as i64).saturating_add(delta));
        let previous = self
            .intensity
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(shifted(current))
            })
            .unwrap_or_else(|current| current);
        shifted(previous)
    }

    pub fn set_sync(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Host parameter-change callback. Returns false when the index is unknown
    /// or the value is not a valid choice for that parameter.
    pub fn parameter_changed(&self, index: usize, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match index {
            PARAM_MODE => match Mode::from_index(value.round() as i64) {
                Some(mode) => {
                    self.set_mode(mode);
                    true
                }
                None => false,
            },
            PARAM_INTENSITY => {
                self.set_intensity(value.round() as i64);
                true
            }
            PARAM_SYNC => {
                self.set_sync(value >= 0.5);
                true
            }
            _ => false,
        }
    }

    /// Applies every change carried by a suggestion, in order, through the
    /// same validating setters the host uses.
    pub fn apply_suggestion(&self, suggestion: &Suggestion) {
        for change in &suggestion.changes {
            match *change {
                ParameterChange::Mode(mode) => self.set_mode(mode),
                ParameterChange::Intensity(value) => {
                    self.set_intensity(value);
                }
                ParameterChange::IntensityDelta(delta) => {
                    self.adjust_intensity(delta);
                }
                ParameterChange::Sync(enabled) => self.set_sync(enabled),
            }
        }
    }
}

fn clamp_intensity(value: i64) -> u8 {
    value.clamp(INTENSITY_MIN as i64, INTENSITY_MAX as i64) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Menu(&'static [&'static str]),
    Linear,
    Checkbox,
}

/// Describes one host-visible parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterInfo {
    pub name: &'static str,
    pub kind: ParameterKind,
    pub min: f64,
    pub max: f64,
    pub steps: u32,
    pub default: f64,
    pub unit: &'static str,
}

pub const PARAMETERS: [ParameterInfo; 3] = [
    ParameterInfo {
        name: "AI Mode",
        kind: ParameterKind::Menu(&["Off", "Analyze", "Auto-Mix", "Creative"]),
        min: 0.0,
        max: 3.0,
        steps: 3,
        default: 1.0,
        unit: "",
    },
    ParameterInfo {
        name: "Intensity",
        kind: ParameterKind::Linear,
        min: INTENSITY_MIN as f64,
        max: INTENSITY_MAX as f64,
        steps: 100,
        default: 50.0,
        unit: "%",
    },
    ParameterInfo {
        name: "Sync to AI",
        kind: ParameterKind::Checkbox,
        min: 0.0,
        max: 1.0,
        steps: 1,
        default: 1.0,
        unit: "",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
}

pub const BRIDGE_INFO: BridgeInfo = BridgeInfo {
    name: "beatbridge",
    version: env!("CARGO_PKG_VERSION"),
    description: "Beat-synchronized MIDI bridge to an external analysis process",
};
