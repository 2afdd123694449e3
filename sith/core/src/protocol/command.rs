//! Decoded protocol commands
//!
//! A [`Command`] is the structured form of one Shadow/MarcDuino frame. It keeps
//! the original frame text in `raw` for logging and replay, and can be turned
//! back into wire form with [`Command::encode`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest addressable panel servo (`:OP16`)
pub const PANEL_COUNT: u8 = 16;

/// Highest addressable holoprojector (front = 1, rear = 2, top = 3)
pub const HOLO_COUNT: u8 = 3;

/// Highest addressable logic display (top front, bottom front, rear)
pub const DISPLAY_COUNT: u8 = 3;

/// Highest 7-bit I2C device address
pub const MAX_I2C_ADDRESS: u8 = 127;

/// Command family, selected by the frame's start character
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    /// `:` dome panel servos and sequences
    Panel,
    /// `*` holoprojector lights and movement
    HoloProjector,
    /// `@` logic displays
    Display,
    /// `$` sound module
    Sound,
    /// `#` persisted setup
    Setup,
    /// `&` raw I2C write
    I2C,
    /// `!` sound commands forwarded to the alternate sound module
    AltSound,
    /// `%` holoprojector commands forwarded to the slave board
    AltHP,
}

impl Family {
    /// Map a start character to its family
    #[must_use]
    pub fn from_start_char(c: char) -> Option<Self> {
        match c {
            ':' => Some(Self::Panel),
            '*' => Some(Self::HoloProjector),
            '@' => Some(Self::Display),
            '$' => Some(Self::Sound),
            '#' => Some(Self::Setup),
            '&' => Some(Self::I2C),
            '!' => Some(Self::AltSound),
            '%' => Some(Self::AltHP),
            _ => None,
        }
    }

    /// The start character that introduces this family on the wire
    #[must_use]
    pub fn start_char(self) -> char {
        match self {
            Self::Panel => ':',
            Self::HoloProjector => '*',
            Self::Display => '@',
            Self::Sound => '$',
            Self::Setup => '#',
            Self::I2C => '&',
            Self::AltSound => '!',
            Self::AltHP => '%',
        }
    }

    /// Whether this family uses sound decoding (`$` and `!`)
    #[must_use]
    pub fn is_sound(self) -> bool {
        matches!(self, Self::Sound | Self::AltSound)
    }

    /// Whether this family uses holoprojector decoding (`*` and `%`)
    #[must_use]
    pub fn is_holo(self) -> bool {
        matches!(self, Self::HoloProjector | Self::AltHP)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Panel => "Panel",
            Self::HoloProjector => "HoloProjector",
            Self::Display => "Display",
            Self::Sound => "Sound",
            Self::Setup => "Setup",
            Self::I2C => "I2C",
            Self::AltSound => "AltSound",
            Self::AltHP => "AltHP",
        };
        f.write_str(name)
    }
}

/// Addressed unit of a command
///
/// `All` is decoded from the wire value `00` and is never confused with a
/// literal unit zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// Every addressable actuator of the family
    All,
    /// A single numbered unit (panel 1-16, holoprojector 1-3, display 1-3)
    Unit(u8),
    /// An I2C device address
    Address(u8),
    /// Commands that address no unit (sound, setup, sequences)
    Unaddressed,
}

impl Target {
    /// Render as the fixed two-digit wire form (`All` is `00`)
    fn two_digits(self) -> String {
        match self {
            Self::All => "00".to_string(),
            Self::Unit(n) | Self::Address(n) => format!("{n:02}"),
            Self::Unaddressed => String::new(),
        }
    }

    /// Render as the one-digit wire form used by displays and holo flashes
    fn one_digit(self) -> String {
        match self {
            Self::All => "0".to_string(),
            Self::Unit(n) | Self::Address(n) => n.to_string(),
            Self::Unaddressed => String::new(),
        }
    }
}

/// Typed command argument
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Argument {
    /// Decimal integer
    Int(u32),
    /// Hex byte (`x1F` on the I2C wire)
    Byte(u8),
    /// Single quoted ASCII character
    Char(char),
    /// Free text (display message, sequence name, quoted I2C string)
    Text(String),
}

impl Argument {
    /// Integer value, if this is an `Int`
    #[must_use]
    pub fn as_int(&self) -> Option<u32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value, if this is a `Text`
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes this argument contributes to an I2C write
    #[must_use]
    pub fn to_i2c_bytes(&self) -> Vec<u8> {
        match self {
            // Decoder bounds I2C decimals to a byte
            Self::Int(v) => vec![u8::try_from(*v).unwrap_or(u8::MAX)],
            Self::Byte(b) => vec![*b],
            Self::Char(c) => vec![u8::try_from(u32::from(*c)).unwrap_or(b'?')],
            Self::Text(s) => s.as_bytes().to_vec(),
        }
    }

    /// I2C wire form (hex normalised to two uppercase digits)
    fn encode_i2c(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Byte(b) => format!("x{b:02X}"),
            Self::Char(c) => format!("'{c}'"),
            Self::Text(s) => format!("\"{s}\""),
        }
    }
}

/// Volume adjustments understood by the sound module
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeStep {
    /// `+`
    Up,
    /// `-`
    Down,
    /// `m`
    Mid,
    /// `f`
    Max,
    /// `p`
    Min,
}

/// Named sounds triggered by a single letter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamedSound {
    /// `S`
    Scream,
    /// `W`
    Wave,
    /// `D`
    Disco,
    /// `F`
    Faint,
    /// `L`
    Leia,
    /// `C`
    Cantina,
    /// `c`
    BeepCantina,
}

impl NamedSound {
    /// Sound bank and track played for this named sound
    #[must_use]
    pub fn bank_and_index(self) -> (u8, u8) {
        match self {
            Self::Scream => (6, 1),
            Self::Wave => (3, 1),
            Self::Disco => (9, 6),
            Self::Faint => (6, 3),
            Self::Leia => (7, 1),
            Self::Cantina => (9, 5),
            Self::BeepCantina => (8, 1),
        }
    }

    fn letter(self) -> char {
        match self {
            Self::Scream => 'S',
            Self::Wave => 'W',
            Self::Disco => 'D',
            Self::Faint => 'F',
            Self::Leia => 'L',
            Self::Cantina => 'C',
            Self::BeepCantina => 'c',
        }
    }

    pub(crate) fn from_letter(c: char) -> Option<Self> {
        match c {
            'S' => Some(Self::Scream),
            'W' => Some(Self::Wave),
            'D' => Some(Self::Disco),
            'F' => Some(Self::Faint),
            'L' => Some(Self::Leia),
            'C' => Some(Self::Cantina),
            'c' => Some(Self::BeepCantina),
            _ => None,
        }
    }
}

/// Decoded operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // ============================================
    // Panel (`:`)
    // ============================================
    /// `:SE` start a sequence by id or name
    SequenceStart,
    /// `:SESTOP`
    SequenceStop,
    /// `:SEPAUSE`
    SequencePause,
    /// `:SERESUME`
    SequenceResume,
    /// `:SESTEP`
    SequenceStep,
    /// `:OP` open panel
    Open,
    /// `:CL` close panel
    Close,
    /// `:RC` hand panel over to RC control
    RcRelease,
    /// `:ST` stop panel servo (no pulse)
    Stop,
    /// `:HD` hold panel in place
    Hold,

    // ============================================
    // HoloProjector (`*`, `%`)
    // ============================================
    /// `ON` lights on
    HoloOn,
    /// `OF` lights off
    HoloOff,
    /// `RD` random movement
    HoloRandom,
    /// `HD` hold position
    HoloHold,
    /// `ST` stop and reset
    HoloStop,
    /// `RC` RC control
    HoloRc,
    /// `TE` test pattern
    HoloTest,
    /// `Hnss` flash for ss seconds
    HoloFlash,
    /// `Fnss` flicker for ss seconds
    HoloFlicker,

    // ============================================
    // Display (`@`)
    // ============================================
    /// `@nTmm` display mode
    DisplayMode,
    /// `@nWss` wait
    DisplayWait,
    /// `@nMtext` scroll a message
    DisplayMessage,

    // ============================================
    // Sound (`$`, `!`)
    // ============================================
    /// `$b` / `$bnn` play from a bank
    SoundPlay,
    /// Single-letter named sound
    SoundNamed(NamedSound),
    /// `$s`
    SoundStop,
    /// Volume keys
    SoundVolume(VolumeStep),
    /// `$R`
    SoundRandomOn,
    /// `$O`
    SoundRandomOff,

    // ============================================
    // Setup (`#`)
    // ============================================
    /// `#SDxx` all servo directions
    ServoDirections,
    /// `#SRxxy` one servo direction
    ServoReverse,
    /// `#SSxx` startup sound
    StartupSound,
    /// `#SQxx` quiet mode
    QuietMode,
    /// `#STxx` slave delay
    SlaveDelay,
    /// `#SMxx` sound module selection
    SoundModule,

    // ============================================
    // I2C (`&`)
    // ============================================
    /// `&addr,args...`
    I2cWrite,
}

impl Opcode {
    /// Short mnemonic used in logs and error messages
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::SequenceStart
            | Self::SequenceStop
            | Self::SequencePause
            | Self::SequenceResume
            | Self::SequenceStep => "SE",
            Self::Open => "OP",
            Self::Close => "CL",
            Self::RcRelease | Self::HoloRc => "RC",
            Self::Stop | Self::HoloStop => "ST",
            Self::Hold | Self::HoloHold => "HD",
            Self::HoloOn => "ON",
            Self::HoloOff => "OF",
            Self::HoloRandom => "RD",
            Self::HoloTest => "TE",
            Self::HoloFlash => "H",
            Self::HoloFlicker => "F",
            Self::DisplayMode => "T",
            Self::DisplayWait => "W",
            Self::DisplayMessage => "M",
            Self::SoundPlay => "PLAY",
            Self::SoundNamed(sound) => match sound {
                NamedSound::Scream => "S",
                NamedSound::Wave => "W",
                NamedSound::Disco => "D",
                NamedSound::Faint => "F",
                NamedSound::Leia => "L",
                NamedSound::Cantina => "C",
                NamedSound::BeepCantina => "c",
            },
            Self::SoundStop => "s",
            Self::SoundVolume(step) => match step {
                VolumeStep::Up => "+",
                VolumeStep::Down => "-",
                VolumeStep::Mid => "m",
                VolumeStep::Max => "f",
                VolumeStep::Min => "p",
            },
            Self::SoundRandomOn => "R",
            Self::SoundRandomOff => "O",
            Self::ServoDirections => "SD",
            Self::ServoReverse => "SR",
            Self::StartupSound => "SS",
            Self::QuietMode => "SQ",
            Self::SlaveDelay => "ST",
            Self::SoundModule => "SM",
            Self::I2cWrite => "WR",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A syntactically valid protocol instruction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Family selected by the start character
    pub family: Family,
    /// Operation within the family
    pub opcode: Opcode,
    /// Addressed unit
    pub target: Target,
    /// Ordered typed arguments
    pub arguments: Vec<Argument>,
    /// Original frame text (without terminator)
    pub raw: String,
}

impl Command {
    /// Integer argument at `index`
    #[must_use]
    pub fn int_arg(&self, index: usize) -> Option<u32> {
        self.arguments.get(index).and_then(Argument::as_int)
    }

    /// Text argument at `index`
    #[must_use]
    pub fn text_arg(&self, index: usize) -> Option<&str> {
        self.arguments.get(index).and_then(Argument::as_text)
    }

    /// Concatenated payload of an I2C write
    #[must_use]
    pub fn i2c_payload(&self) -> Vec<u8> {
        self.arguments
            .iter()
            .flat_map(Argument::to_i2c_bytes)
            .collect()
    }

    /// Render the command back into its wire form (without the CR terminator)
    ///
    /// For canonical input this reproduces `raw` byte-for-byte. I2C hex bytes
    /// are normalised to two uppercase digits and the slave delay to at least
    /// two digits.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.raw.len().max(8));
        out.push(self.family.start_char());

        match self.opcode {
            Opcode::SequenceStart => {
                out.push_str("SE");
                match self.arguments.first() {
                    Some(Argument::Int(id)) => out.push_str(&format!("{id:02}")),
                    Some(Argument::Text(name)) => out.push_str(name),
                    _ => {}
                }
            }
            Opcode::SequenceStop => out.push_str("SESTOP"),
            Opcode::SequencePause => out.push_str("SEPAUSE"),
            Opcode::SequenceResume => out.push_str("SERESUME"),
            Opcode::SequenceStep => out.push_str("SESTEP"),
            Opcode::Open
            | Opcode::Close
            | Opcode::RcRelease
            | Opcode::Stop
            | Opcode::Hold
            | Opcode::HoloOn
            | Opcode::HoloOff
            | Opcode::HoloRandom
            | Opcode::HoloHold
            | Opcode::HoloStop
            | Opcode::HoloRc
            | Opcode::HoloTest => {
                out.push_str(self.opcode.mnemonic());
                out.push_str(&self.target.two_digits());
            }
            Opcode::HoloFlash | Opcode::HoloFlicker => {
                out.push_str(self.opcode.mnemonic());
                out.push_str(&self.target.one_digit());
                out.push_str(&format!("{:02}", self.int_arg(0).unwrap_or(0)));
            }
            Opcode::DisplayMode | Opcode::DisplayWait => {
                out.push_str(&self.target.one_digit());
                out.push_str(self.opcode.mnemonic());
                out.push_str(&self.int_arg(0).unwrap_or(0).to_string());
            }
            Opcode::DisplayMessage => {
                out.push_str(&self.target.one_digit());
                out.push('M');
                out.push_str(self.text_arg(0).unwrap_or_default());
            }
            Opcode::SoundPlay => {
                if let Some(bank) = self.int_arg(0) {
                    out.push_str(&bank.to_string());
                }
                if let Some(index) = self.int_arg(1) {
                    out.push_str(&format!("{index:02}"));
                }
            }
            Opcode::SoundNamed(sound) => out.push(sound.letter()),
            Opcode::SoundStop
            | Opcode::SoundVolume(_)
            | Opcode::SoundRandomOn
            | Opcode::SoundRandomOff => out.push_str(self.opcode.mnemonic()),
            Opcode::ServoDirections
            | Opcode::StartupSound
            | Opcode::QuietMode
            | Opcode::SlaveDelay
            | Opcode::SoundModule => {
                out.push_str(self.opcode.mnemonic());
                out.push_str(&format!("{:02}", self.int_arg(0).unwrap_or(0)));
            }
            Opcode::ServoReverse => {
                out.push_str("SR");
                out.push_str(&format!(
                    "{:02}{}",
                    self.int_arg(0).unwrap_or(0),
                    self.int_arg(1).unwrap_or(0)
                ));
            }
            Opcode::I2cWrite => {
                if let Target::Address(addr) = self.target {
                    out.push_str(&addr.to_string());
                }
                for arg in &self.arguments {
                    out.push(',');
                    out.push_str(&arg.encode_i2c());
                }
            }
        }

        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_start_chars_are_inverse() {
        for c in [':', '*', '@', '$', '#', '&', '!', '%'] {
            let family = Family::from_start_char(c).unwrap();
            assert_eq!(family.start_char(), c);
        }
        assert!(Family::from_start_char('?').is_none());
    }

    #[test]
    fn test_alias_families_share_decoding() {
        assert!(Family::AltSound.is_sound());
        assert!(Family::AltHP.is_holo());
        assert!(!Family::Panel.is_sound());
    }

    #[test]
    fn test_i2c_payload_flattens_arguments() {
        let cmd = Command {
            family: Family::I2C,
            opcode: Opcode::I2cWrite,
            target: Target::Address(42),
            arguments: vec![
                Argument::Int(1),
                Argument::Byte(0xFF),
                Argument::Char('A'),
                Argument::Text("hi".to_string()),
            ],
            raw: String::new(),
        };
        assert_eq!(cmd.i2c_payload(), vec![1, 0xFF, b'A', b'h', b'i']);
        assert_eq!(cmd.encode(), "&42,1,xFF,'A',\"hi\"");
    }
}
