//! Command Classifier & Decoder
//!
//! Turns one frame (terminator already stripped) into a [`Command`].
//!
//! Classification happens on the start character, then each family has its
//! own body grammar:
//!
//! ```text
//! :  OP|CL|RC|ST|HD nn         nn = 00..16, 00 = all
//!    SE nn | SE name | SE STOP|PAUSE|RESUME|STEP
//! *  ON|OF|RD|HD|ST|RC|TE nn   nn = 00..03
//!    H n ss | F n ss           n = 0..3, ss = seconds
//! @  n T m | n W s | n M text  n = 0..3
//! $  b | b nn | S W D F L C c s + - m f p R O
//! #  SD nn | SR cc d | SS nn | SQ nn | ST n{1,5} | SM nn
//! &  addr,arg[,arg...]         arg = 12 | x1F | 'c' | "str"
//! !  as `$`   %  as `*`
//! ```

use super::command::{
    Argument, Command, Family, NamedSound, Opcode, Target, VolumeStep, DISPLAY_COUNT, HOLO_COUNT,
    MAX_I2C_ADDRESS, PANEL_COUNT,
};
use super::ProtocolError;

/// Upper bound for `#ST` slave delay in milliseconds
pub const MAX_SLAVE_DELAY_MS: u32 = 10_000;

/// Words after `:SE` that control the running sequence instead of naming one
pub const SEQUENCE_CONTROL_WORDS: [&str; 4] = ["STOP", "PAUSE", "RESUME", "STEP"];

type Decoded = (Opcode, Target, Vec<Argument>);

/// Decode one frame into a command
///
/// # Errors
///
/// - `MalformedCommand` for empty frames, unknown start characters or
///   non-ASCII content
/// - `UnknownOpcode` when the family is recognised but the opcode is not
/// - `ArgumentError` for wrong count, type or range of arguments
pub fn decode(frame: &[u8]) -> Result<Command, ProtocolError> {
    let Some(&first) = frame.first() else {
        return Err(malformed("empty frame"));
    };
    if !frame.is_ascii() {
        return Err(malformed("frame contains non-ASCII bytes"));
    }
    // ASCII checked above, so every byte is a char boundary
    let text = String::from_utf8_lossy(frame).into_owned();

    let start = char::from(first);
    let family = Family::from_start_char(start)
        .ok_or_else(|| malformed(format!("unknown start character {start:?}")))?;
    let body = &text[1..];

    let (opcode, target, arguments) = match family {
        Family::Panel => decode_panel(body)?,
        Family::HoloProjector | Family::AltHP => decode_holo(family, body)?,
        Family::Display => decode_display(body)?,
        Family::Sound | Family::AltSound => decode_sound(family, body)?,
        Family::Setup => decode_setup(body)?,
        Family::I2C => decode_i2c(body)?,
    };

    Ok(Command {
        family,
        opcode,
        target,
        arguments,
        raw: text,
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn malformed(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedCommand {
        reason: reason.into(),
    }
}

fn unknown(family: Family, opcode: &str) -> ProtocolError {
    ProtocolError::UnknownOpcode {
        family,
        opcode: opcode.to_string(),
    }
}

fn bad_arg(opcode: Opcode, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::ArgumentError {
        opcode: opcode.mnemonic(),
        reason: reason.into(),
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parse a run of decimal digits whose length is within `min..=max`
fn parse_digits(opcode: Opcode, s: &str, min: usize, max: usize) -> Result<u32, ProtocolError> {
    if !all_digits(s) || s.len() < min || s.len() > max {
        let width = if min == max {
            format!("{min}")
        } else {
            format!("{min}-{max}")
        };
        return Err(bad_arg(
            opcode,
            format!("expected {width} decimal digits, got {s:?}"),
        ));
    }
    s.parse::<u32>()
        .map_err(|e| bad_arg(opcode, format!("invalid number {s:?}: {e}")))
}

/// Two-digit target where `00` is `All` and `01..=max` is a unit
fn parse_two_digit_target(opcode: Opcode, s: &str, max: u8) -> Result<Target, ProtocolError> {
    let n = parse_digits(opcode, s, 2, 2)?;
    unit_target(opcode, n, max, 2)
}

fn unit_target(opcode: Opcode, n: u32, max: u8, width: usize) -> Result<Target, ProtocolError> {
    match u8::try_from(n) {
        Ok(0) => Ok(Target::All),
        Ok(unit) if unit <= max => Ok(Target::Unit(unit)),
        _ => Err(bad_arg(
            opcode,
            format!("target {n} out of range {:0width$}-{max:0width$}", 0),
        )),
    }
}

fn ensure_in(
    opcode: Opcode,
    value: u32,
    range: std::ops::RangeInclusive<u32>,
) -> Result<u32, ProtocolError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(bad_arg(
            opcode,
            format!(
                "value {value} out of range {}-{}",
                range.start(),
                range.end()
            ),
        ))
    }
}

// ============================================================================
// Panel (`:`)
// ============================================================================

fn decode_panel(body: &str) -> Result<Decoded, ProtocolError> {
    let Some(mnemonic) = body.get(..2) else {
        return Err(unknown(Family::Panel, body));
    };
    let rest = &body[2..];

    let opcode = match mnemonic {
        "SE" => return decode_sequence(rest),
        "OP" => Opcode::Open,
        "CL" => Opcode::Close,
        "RC" => Opcode::RcRelease,
        "ST" => Opcode::Stop,
        "HD" => Opcode::Hold,
        _ => return Err(unknown(Family::Panel, mnemonic)),
    };

    let target = parse_two_digit_target(opcode, rest, PANEL_COUNT)?;
    Ok((opcode, target, Vec::new()))
}

fn decode_sequence(rest: &str) -> Result<Decoded, ProtocolError> {
    let opcode = Opcode::SequenceStart;
    let control = match rest {
        "STOP" => Some(Opcode::SequenceStop),
        "PAUSE" => Some(Opcode::SequencePause),
        "RESUME" => Some(Opcode::SequenceResume),
        "STEP" => Some(Opcode::SequenceStep),
        _ => None,
    };
    if let Some(control) = control {
        return Ok((control, Target::Unaddressed, Vec::new()));
    }

    if rest.is_empty() {
        return Err(bad_arg(opcode, "missing sequence id or name"));
    }
    if all_digits(rest) {
        let id = parse_digits(opcode, rest, 2, 2)?;
        return Ok((opcode, Target::Unaddressed, vec![Argument::Int(id)]));
    }
    if rest.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Ok((
            opcode,
            Target::Unaddressed,
            vec![Argument::Text(rest.to_string())],
        ));
    }
    Err(bad_arg(
        opcode,
        format!("sequence name must be alphanumeric, got {rest:?}"),
    ))
}

// ============================================================================
// HoloProjector (`*`, `%`)
// ============================================================================

fn decode_holo(family: Family, body: &str) -> Result<Decoded, ProtocolError> {
    let two_letter = match body.get(..2) {
        Some("ON") => Some(Opcode::HoloOn),
        Some("OF") => Some(Opcode::HoloOff),
        Some("RD") => Some(Opcode::HoloRandom),
        Some("HD") => Some(Opcode::HoloHold),
        Some("ST") => Some(Opcode::HoloStop),
        Some("RC") => Some(Opcode::HoloRc),
        Some("TE") => Some(Opcode::HoloTest),
        _ => None,
    };
    if let Some(opcode) = two_letter {
        let target = parse_two_digit_target(opcode, &body[2..], HOLO_COUNT)?;
        return Ok((opcode, target, Vec::new()));
    }

    let opcode = match body.as_bytes().first() {
        Some(b'H') => Opcode::HoloFlash,
        Some(b'F') => Opcode::HoloFlicker,
        _ => return Err(unknown(family, body.get(..2).unwrap_or(body))),
    };
    let rest = &body[1..];
    if rest.len() != 3 || !all_digits(rest) {
        return Err(bad_arg(
            opcode,
            format!("expected one-digit target and two-digit seconds, got {rest:?}"),
        ));
    }
    let unit = parse_digits(opcode, &rest[..1], 1, 1)?;
    let target = unit_target(opcode, unit, HOLO_COUNT, 1)?;
    let seconds = parse_digits(opcode, &rest[1..], 2, 2)?;
    Ok((opcode, target, vec![Argument::Int(seconds)]))
}

// ============================================================================
// Display (`@`)
// ============================================================================

fn decode_display(body: &str) -> Result<Decoded, ProtocolError> {
    let mut bytes = body.bytes();
    let opcode_byte = bytes.nth(1);
    let opcode = match opcode_byte {
        Some(b'T') => Opcode::DisplayMode,
        Some(b'W') => Opcode::DisplayWait,
        Some(b'M') => Opcode::DisplayMessage,
        _ => return Err(unknown(Family::Display, body.get(1..2).unwrap_or(""))),
    };

    let unit = parse_digits(opcode, &body[..1], 1, 1)?;
    let target = unit_target(opcode, unit, DISPLAY_COUNT, 1)?;
    let payload = &body[2..];

    let argument = match opcode {
        Opcode::DisplayMessage => {
            if payload.bytes().any(|b| b.is_ascii_control()) {
                return Err(bad_arg(opcode, "message contains control characters"));
            }
            Argument::Text(payload.to_string())
        }
        _ => Argument::Int(parse_digits(opcode, payload, 1, 2)?),
    };
    Ok((opcode, target, vec![argument]))
}

// ============================================================================
// Sound (`$`, `!`)
// ============================================================================

fn decode_sound(family: Family, body: &str) -> Result<Decoded, ProtocolError> {
    let Some(first) = body.chars().next() else {
        return Err(unknown(family, ""));
    };

    if first.is_ascii_digit() {
        let opcode = Opcode::SoundPlay;
        let bank = parse_digits(opcode, &body[..1], 1, 1)?;
        let bank = ensure_in(opcode, bank, 1..=9)?;
        let mut args = vec![Argument::Int(bank)];
        let index = &body[1..];
        if !index.is_empty() {
            let index = parse_digits(opcode, index, 2, 2)?;
            args.push(Argument::Int(ensure_in(opcode, index, 1..=99)?));
        }
        return Ok((opcode, Target::Unaddressed, args));
    }

    let opcode = if let Some(sound) = NamedSound::from_letter(first) {
        Opcode::SoundNamed(sound)
    } else {
        match first {
            's' => Opcode::SoundStop,
            '+' => Opcode::SoundVolume(VolumeStep::Up),
            '-' => Opcode::SoundVolume(VolumeStep::Down),
            'm' => Opcode::SoundVolume(VolumeStep::Mid),
            'f' => Opcode::SoundVolume(VolumeStep::Max),
            'p' => Opcode::SoundVolume(VolumeStep::Min),
            'R' => Opcode::SoundRandomOn,
            'O' => Opcode::SoundRandomOff,
            _ => return Err(unknown(family, &body[..1])),
        }
    };
    if body.len() > 1 {
        return Err(bad_arg(opcode, format!("takes no arguments, got {:?}", &body[1..])));
    }
    Ok((opcode, Target::Unaddressed, Vec::new()))
}

// ============================================================================
// Setup (`#`)
// ============================================================================

fn decode_setup(body: &str) -> Result<Decoded, ProtocolError> {
    let Some(mnemonic) = body.get(..2) else {
        return Err(unknown(Family::Setup, body));
    };
    let rest = &body[2..];

    let (opcode, args) = match mnemonic {
        "SD" => {
            let op = Opcode::ServoDirections;
            (op, vec![ensure_in(op, parse_digits(op, rest, 2, 2)?, 0..=1)?])
        }
        "SR" => {
            let op = Opcode::ServoReverse;
            if rest.len() != 3 {
                return Err(bad_arg(
                    op,
                    format!("expected two-digit channel and direction digit, got {rest:?}"),
                ));
            }
            let channel = parse_digits(op, &rest[..2], 2, 2)?;
            let channel = ensure_in(op, channel, 1..=u32::from(PANEL_COUNT))?;
            let direction = ensure_in(op, parse_digits(op, &rest[2..], 1, 1)?, 0..=1)?;
            (op, vec![channel, direction])
        }
        "SS" => {
            let op = Opcode::StartupSound;
            (op, vec![ensure_in(op, parse_digits(op, rest, 2, 2)?, 0..=3)?])
        }
        "SQ" => {
            let op = Opcode::QuietMode;
            (op, vec![ensure_in(op, parse_digits(op, rest, 2, 2)?, 0..=1)?])
        }
        "ST" => {
            let op = Opcode::SlaveDelay;
            let delay = parse_digits(op, rest, 1, 5)?;
            (op, vec![ensure_in(op, delay, 0..=MAX_SLAVE_DELAY_MS)?])
        }
        "SM" => {
            let op = Opcode::SoundModule;
            (op, vec![ensure_in(op, parse_digits(op, rest, 2, 2)?, 0..=2)?])
        }
        _ => return Err(unknown(Family::Setup, mnemonic)),
    };

    Ok((
        opcode,
        Target::Unaddressed,
        args.into_iter().map(Argument::Int).collect(),
    ))
}

// ============================================================================
// I2C (`&`)
// ============================================================================

fn decode_i2c(body: &str) -> Result<Decoded, ProtocolError> {
    let opcode = Opcode::I2cWrite;
    let fields = split_i2c_fields(body)?;
    let (address, args) = fields
        .split_first()
        .ok_or_else(|| bad_arg(opcode, "missing device address"))?;

    let address = parse_digits(opcode, address, 1, 3)?;
    let address = ensure_in(opcode, address, 0..=u32::from(MAX_I2C_ADDRESS))?;
    let address = u8::try_from(address).map_err(|e| bad_arg(opcode, e.to_string()))?;

    if args.is_empty() {
        return Err(bad_arg(opcode, "at least one data argument is required"));
    }
    let arguments = args
        .iter()
        .map(|field| decode_i2c_argument(field))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((opcode, Target::Address(address), arguments))
}

/// Split on commas that are not inside single or double quotes
fn split_i2c_fields(body: &str) -> Result<Vec<&str>, ProtocolError> {
    let mut fields = Vec::new();
    let mut quote: Option<u8> = None;
    let mut start = 0;

    for (i, b) in body.bytes().enumerate() {
        match (quote, b) {
            (None, b'\'' | b'"') => quote = Some(b),
            (Some(q), _) if q == b => quote = None,
            (None, b',') => {
                fields.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err(bad_arg(Opcode::I2cWrite, "unterminated quoted argument"));
    }
    fields.push(&body[start..]);
    Ok(fields)
}

fn decode_i2c_argument(field: &str) -> Result<Argument, ProtocolError> {
    let opcode = Opcode::I2cWrite;
    let bytes = field.as_bytes();

    match bytes.first() {
        None => Err(bad_arg(opcode, "empty argument")),
        Some(b'x') => {
            let hex = &field[1..];
            if hex.is_empty() || hex.len() > 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(bad_arg(opcode, format!("invalid hex byte {field:?}")));
            }
            u8::from_str_radix(hex, 16)
                .map(Argument::Byte)
                .map_err(|e| bad_arg(opcode, format!("invalid hex byte {field:?}: {e}")))
        }
        Some(b'\'') => {
            if bytes.len() == 3 && bytes[2] == b'\'' {
                Ok(Argument::Char(char::from(bytes[1])))
            } else {
                Err(bad_arg(opcode, format!("invalid character argument {field:?}")))
            }
        }
        Some(b'"') => {
            if bytes.len() >= 3 && bytes[bytes.len() - 1] == b'"' {
                Ok(Argument::Text(field[1..field.len() - 1].to_string()))
            } else {
                Err(bad_arg(opcode, format!("invalid string argument {field:?}")))
            }
        }
        Some(_) => {
            let value = parse_digits(opcode, field, 1, 3)?;
            Ok(Argument::Int(ensure_in(opcode, value, 0..=255)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ok(frame: &str) -> Command {
        decode(frame.as_bytes()).unwrap_or_else(|e| panic!("{frame}: {e}"))
    }

    fn err(frame: &str) -> ProtocolError {
        decode(frame.as_bytes()).expect_err(frame)
    }

    #[test]
    fn test_panel_open_each_target() {
        for t in 1..=16u8 {
            let cmd = ok(&format!(":OP{t:02}"));
            assert_eq!(cmd.family, Family::Panel);
            assert_eq!(cmd.opcode, Opcode::Open);
            assert_eq!(cmd.target, Target::Unit(t));
        }
        assert_eq!(ok(":OP00").target, Target::All);
    }

    #[test]
    fn test_panel_target_out_of_range() {
        for t in [17u32, 20, 50, 99] {
            let e = err(&format!(":OP{t:02}"));
            assert!(matches!(e, ProtocolError::ArgumentError { .. }), "{t}: {e}");
        }
        assert!(matches!(err(":OP1"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err(":OP001"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err(":OPab"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err(":CL"), ProtocolError::ArgumentError { .. }));
    }

    #[test]
    fn test_panel_opcodes() {
        assert_eq!(ok(":CL05").opcode, Opcode::Close);
        assert_eq!(ok(":RC03").opcode, Opcode::RcRelease);
        assert_eq!(ok(":ST00").opcode, Opcode::Stop);
        assert_eq!(ok(":HD16").opcode, Opcode::Hold);
        assert!(matches!(
            err(":XX01"),
            ProtocolError::UnknownOpcode { family: Family::Panel, .. }
        ));
        assert!(matches!(err(":O"), ProtocolError::UnknownOpcode { .. }));
    }

    #[test]
    fn test_sequence_by_id_name_and_control() {
        let by_id = ok(":SE02");
        assert_eq!(by_id.opcode, Opcode::SequenceStart);
        assert_eq!(by_id.arguments, vec![Argument::Int(2)]);
        assert_eq!(by_id.target, Target::Unaddressed);

        let by_name = ok(":SEwave");
        assert_eq!(by_name.arguments, vec![Argument::Text("wave".into())]);

        assert_eq!(ok(":SESTOP").opcode, Opcode::SequenceStop);
        assert_eq!(ok(":SEPAUSE").opcode, Opcode::SequencePause);
        assert_eq!(ok(":SERESUME").opcode, Opcode::SequenceResume);
        assert_eq!(ok(":SESTEP").opcode, Opcode::SequenceStep);

        assert!(matches!(err(":SE"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err(":SE2"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err(":SEwa-ve"), ProtocolError::ArgumentError { .. }));
    }

    #[test]
    fn test_unknown_start_character() {
        assert!(matches!(err("?OP01"), ProtocolError::MalformedCommand { .. }));
        assert!(matches!(err(""), ProtocolError::MalformedCommand { .. }));
        assert!(matches!(
            decode(":OP0\u{e9}".as_bytes()),
            Err(ProtocolError::MalformedCommand { .. })
        ));
    }

    #[test]
    fn test_holo_commands() {
        let on = ok("*ON01");
        assert_eq!(on.family, Family::HoloProjector);
        assert_eq!(on.opcode, Opcode::HoloOn);
        assert_eq!(on.target, Target::Unit(1));

        assert_eq!(ok("*RD00").target, Target::All);
        assert_eq!(ok("*HD02").opcode, Opcode::HoloHold);
        assert!(matches!(err("*ON04"), ProtocolError::ArgumentError { .. }));

        let flash = ok("*H105");
        assert_eq!(flash.opcode, Opcode::HoloFlash);
        assert_eq!(flash.target, Target::Unit(1));
        assert_eq!(flash.arguments, vec![Argument::Int(5)]);
        assert_eq!(ok("*F010").target, Target::All);
        assert!(matches!(err("*H10"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("*ZZ01"), ProtocolError::UnknownOpcode { .. }));
    }

    #[test]
    fn test_alias_families() {
        let alt_hp = ok("%ON02");
        assert_eq!(alt_hp.family, Family::AltHP);
        assert_eq!(alt_hp.opcode, Opcode::HoloOn);

        let alt_sound = ok("!S");
        assert_eq!(alt_sound.family, Family::AltSound);
        assert_eq!(alt_sound.opcode, Opcode::SoundNamed(NamedSound::Scream));
    }

    #[test]
    fn test_display_message_payload() {
        let cmd = ok("@1MHello World");
        assert_eq!(cmd.family, Family::Display);
        assert_eq!(cmd.opcode, Opcode::DisplayMessage);
        assert_eq!(cmd.target, Target::Unit(1));
        assert_eq!(cmd.arguments, vec![Argument::Text("Hello World".into())]);

        // Payload keeps separators that other families would split on
        let cmd = ok("@0Ma,b 'c'");
        assert_eq!(cmd.target, Target::All);
        assert_eq!(cmd.text_arg(0), Some("a,b 'c'"));
    }

    #[test]
    fn test_display_mode_and_wait() {
        let mode = ok("@0T5");
        assert_eq!(mode.opcode, Opcode::DisplayMode);
        assert_eq!(mode.arguments, vec![Argument::Int(5)]);
        assert_eq!(ok("@3T12").int_arg(0), Some(12));
        assert_eq!(ok("@2W10").opcode, Opcode::DisplayWait);

        assert!(matches!(err("@4T1"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("@1T123"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("@1X1"), ProtocolError::UnknownOpcode { .. }));
        assert!(matches!(err("@"), ProtocolError::UnknownOpcode { .. }));
    }

    #[test]
    fn test_sound_commands() {
        let bank = ok("$3");
        assert_eq!(bank.opcode, Opcode::SoundPlay);
        assert_eq!(bank.arguments, vec![Argument::Int(3)]);

        let track = ok("$512");
        assert_eq!(track.arguments, vec![Argument::Int(5), Argument::Int(12)]);

        assert_eq!(ok("$s").opcode, Opcode::SoundStop);
        assert_eq!(ok("$+").opcode, Opcode::SoundVolume(VolumeStep::Up));
        assert_eq!(ok("$p").opcode, Opcode::SoundVolume(VolumeStep::Min));
        assert_eq!(ok("$R").opcode, Opcode::SoundRandomOn);
        assert_eq!(ok("$c").opcode, Opcode::SoundNamed(NamedSound::BeepCantina));

        assert!(matches!(err("$0"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("$51"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("$Sx"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("$Q"), ProtocolError::UnknownOpcode { .. }));
        assert!(matches!(err("$"), ProtocolError::UnknownOpcode { .. }));
    }

    #[test]
    fn test_setup_commands() {
        assert_eq!(ok("#SD01").int_arg(0), Some(1));
        let reverse = ok("#SR051");
        assert_eq!(reverse.opcode, Opcode::ServoReverse);
        assert_eq!(reverse.arguments, vec![Argument::Int(5), Argument::Int(1)]);
        assert_eq!(ok("#SS02").int_arg(0), Some(2));
        assert_eq!(ok("#SQ01").opcode, Opcode::QuietMode);
        assert_eq!(ok("#ST250").int_arg(0), Some(250));
        assert_eq!(ok("#SM02").opcode, Opcode::SoundModule);

        assert!(matches!(err("#SD02"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("#SR171"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("#SR05"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("#ST10001"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("#ST123456"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("#SS04"), ProtocolError::ArgumentError { .. }));
        assert!(matches!(err("#ZZ00"), ProtocolError::UnknownOpcode { .. }));
    }

    #[test]
    fn test_i2c_decimal_and_hex() {
        let dec = ok("&42,1,255");
        assert_eq!(dec.family, Family::I2C);
        assert_eq!(dec.target, Target::Address(42));
        assert_eq!(dec.arguments, vec![Argument::Int(1), Argument::Int(255)]);

        let hex = ok("&42,x1,xFF");
        assert_eq!(hex.arguments, vec![Argument::Byte(1), Argument::Byte(0xFF)]);

        // Case of hex digits does not matter
        assert_eq!(ok("&42,x0A").arguments, ok("&42,x0a").arguments);
    }

    #[test]
    fn test_i2c_char_and_string() {
        let cmd = ok("&10,'A',\"a,b\",7");
        assert_eq!(
            cmd.arguments,
            vec![
                Argument::Char('A'),
                Argument::Text("a,b".into()),
                Argument::Int(7)
            ]
        );
        assert_eq!(cmd.i2c_payload(), vec![b'A', b'a', b',', b'b', 7]);
    }

    #[test]
    fn test_i2c_malformed_arguments_fail_whole_command() {
        for frame in [
            "&42",
            "&42,",
            "&42,1,,2",
            "&42,256",
            "&42,xZZ",
            "&42,x123",
            "&42,'AB'",
            "&42,\"open",
            "&42,\"\"",
            "&,1",
            "&abc,1",
        ] {
            assert!(
                matches!(err(frame), ProtocolError::ArgumentError { .. }),
                "{frame}"
            );
        }
    }

    #[test]
    fn test_i2c_address_out_of_range() {
        assert!(matches!(err("&128,1"), ProtocolError::ArgumentError { .. }));
        assert_eq!(ok("&127,1").target, Target::Address(127));
        assert_eq!(ok("&0,1").target, Target::Address(0));
    }

    #[test]
    fn test_encode_round_trip_canonical_frames() {
        for frame in [
            ":OP01", ":OP00", ":CL05", ":RC16", ":ST00", ":HD07", ":SE02", ":SEwave",
            ":SESTOP", ":SEPAUSE", ":SERESUME", ":SESTEP", "*ON01", "*OF00", "*RD03",
            "*TE00", "*H105", "*F310", "%ST02", "@1MHello World", "@0T5", "@3T12",
            "@2W10", "$3", "$512", "$S", "$c", "$s", "$+", "$-", "$m", "$f", "$p", "$R",
            "$O", "!W", "#SD01", "#SR051", "#SS02", "#SQ00", "#ST250", "#SM01",
            "&42,1,255", "&42,xFF,x0A", "&10,'A',\"a,b\"",
        ] {
            assert_eq!(ok(frame).encode(), frame);
        }
    }

    #[test]
    fn test_encode_normalizes_i2c_and_delay() {
        assert_eq!(ok("&42,x1,xff").encode(), "&42,x01,xFF");
        assert_eq!(ok("&042,007").encode(), "&42,7");
        assert_eq!(ok("#ST5").encode(), "#ST05");
    }
}
