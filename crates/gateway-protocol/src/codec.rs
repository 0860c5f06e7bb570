//! Wire codec: the comma-delimited ASCII frame form shared by serial and bus
//! transports, plus the two read primitives it is built from.

use crate::ids::DEVICE_ID_LEN;

const FIELD_DELIMITER: u8 = b',';

/// Serial lines carry a fixed two-character prefix ahead of the frame body.
pub const SERIAL_INIT_LEN: usize = 2;

/// Consumes an optional leading comma, then decimal digits, until a comma or
/// end of input. Returns the parsed integer and the number of bytes consumed.
/// `None` if no digit was seen or a non-digit/non-comma byte was hit first.
pub fn read_integer(buf: &[u8]) -> Option<(i64, usize)> {
    if buf.is_empty() {
        return None;
    }
    let mut i = 0;
    if buf[0] == FIELD_DELIMITER {
        i = 1;
    }
    let mut value: i64 = 0;
    let mut saw_digit = false;
    while i < buf.len() {
        let ch = buf[i];
        if ch.is_ascii_digit() {
            value = value * 10 + (ch - b'0') as i64;
            saw_digit = true;
            i += 1;
        } else if ch == FIELD_DELIMITER {
            i += 1;
            break;
        } else {
            return None;
        }
    }
    if saw_digit {
        Some((value, i))
    } else {
        None
    }
}

/// Consumes an optional leading delimiter byte, then up to `limit` bytes
/// until the next delimiter or a newline. Returns the consumed substring
/// (without the delimiter) and the number of input bytes advanced past.
/// Carriage returns are skipped rather than copied. `None` if zero bytes
/// were copied into the result.
pub fn read_string(buf: &[u8], limit: usize, delim: u8) -> Option<(String, usize)> {
    if buf.is_empty() {
        return None;
    }
    let mut i = 0;
    if buf[0] == delim {
        i = 1;
    }
    let mut out = Vec::with_capacity(limit.min(buf.len()));
    while i < buf.len() {
        let ch = buf[i];
        if ch == b'\n' {
            i += 1;
            break;
        }
        if ch == b'\r' {
            i += 1;
            continue;
        }
        if ch == delim {
            i += 1;
            break;
        }
        if out.len() == limit {
            break;
        }
        out.push(ch);
        i += 1;
    }
    if out.is_empty() {
        return None;
    }
    Some((String::from_utf8_lossy(&out).into_owned(), i))
}

/// The closed enumeration of frame codes the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolCode {
    Error = 0,
    Ack = 1,
    Nack = 2,
    StAlive = 3,
    StTimeout = 4,
    StModulesUp = 5,
    Module = 6,
    GetModule = 7,
    GetModules = 8,
    MdTopic = 9,
    MdGetTopic = 10,
    MdSetTopic = 11,
    MdRaw = 12,
    MdToRaw = 13,
    MdEnable = 14,
    MdGetEnable = 15,
    MdSetEnable = 16,
    MdSetId = 17,
    Device = 18,
    GetDevices = 19,
    SaveDevice = 20,
    RemoveDevice = 21,
}

impl ProtocolCode {
    pub fn from_code(code: i64) -> Option<Self> {
        use ProtocolCode::*;
        Some(match code {
            0 => Error,
            1 => Ack,
            2 => Nack,
            3 => StAlive,
            4 => StTimeout,
            5 => StModulesUp,
            6 => Module,
            7 => GetModule,
            8 => GetModules,
            9 => MdTopic,
            10 => MdGetTopic,
            11 => MdSetTopic,
            12 => MdRaw,
            13 => MdToRaw,
            14 => MdEnable,
            15 => MdGetEnable,
            16 => MdSetEnable,
            17 => MdSetId,
            18 => Device,
            19 => GetDevices,
            20 => SaveDevice,
            21 => RemoveDevice,
            _ => return None,
        })
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

/// A decoded frame: a recognised leading code plus the unparsed remainder.
/// The dispatcher pulls further fields out of `rest` with `read_integer`/
/// `read_string`, since each code's trailing fields have a different shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: ProtocolCode,
    pub rest: String,
}

impl Frame {
    pub fn parse(input: &str) -> Option<Self> {
        let bytes = input.as_bytes();
        let (code_num, consumed) = read_integer(bytes)?;
        let code = ProtocolCode::from_code(code_num)?;
        let rest = String::from_utf8_lossy(&bytes[consumed..]).into_owned();
        Some(Frame { code, rest })
    }
}

/// The two serial line prefixes: machine-readable frames and debug text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialFrameKind {
    Machine,
    Debug,
}

impl SerialFrameKind {
    /// Splits a serial line into its kind and the bytes following the
    /// prefix. Lines shorter than `SERIAL_INIT_LEN` or with an unrecognised
    /// prefix are dropped (`None`).
    pub fn parse_prefix(line: &str) -> Option<(Self, &str)> {
        if line.len() < SERIAL_INIT_LEN {
            return None;
        }
        let (prefix, rest) = line.split_at(SERIAL_INIT_LEN);
        match prefix {
            "M:" => Some((Self::Machine, rest)),
            "D:" => Some((Self::Debug, rest)),
            _ => None,
        }
    }
}

/// A machine-readable serial payload: `<dev-id>,<code>[,<fields>...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialMessage {
    pub device_id: String,
    pub frame: Frame,
}

impl SerialMessage {
    pub fn parse(payload: &str) -> Option<Self> {
        if payload.len() < DEVICE_ID_LEN + 1 {
            return None;
        }
        let (id_str, rest) = payload.split_at(DEVICE_ID_LEN);
        let rest = rest.strip_prefix(',')?;
        let frame = Frame::parse(rest)?;
        Some(SerialMessage {
            device_id: id_str.to_string(),
            frame,
        })
    }
}

/// Builds a `M:`-prefixed serial line for `code` addressed at `device_id`,
/// newline-terminated.
pub fn format_machine_frame(device_id: &str, code: ProtocolCode, fields: &[&str]) -> String {
    let mut line = format!("M:{},{}", device_id, code.code());
    for field in fields {
        line.push(',');
        line.push_str(field);
    }
    line.push('\n');
    line
}

/// Builds an unprefixed status-topic announcement: `<code>[,<field>...]`.
/// The bridge's own status topic already names the sender in the topic
/// string, so unlike [`format_peer_frame`] no id field is included.
pub fn format_status_frame(code: ProtocolCode, fields: &[&str]) -> String {
    let mut line = code.code().to_string();
    for field in fields {
        line.push(',');
        line.push_str(field);
    }
    line
}

/// Builds a bus reply addressed at a peer's own topic:
/// `<bridge-id>,<code>[,<field>...]`. The peer's topic carries no sender
/// identity of its own, so the bridge's id is the leading field.
pub fn format_peer_frame(bridge_id: &str, code: ProtocolCode, fields: &[&str]) -> String {
    let mut line = format!("{bridge_id},{}", code.code());
    for field in fields {
        line.push(',');
        line.push_str(field);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_integer_plain() {
        assert_eq!(read_integer(b"42,rest"), Some((42, 3)));
    }

    #[test]
    fn read_integer_leading_comma() {
        assert_eq!(read_integer(b",42,rest"), Some((42, 4)));
    }

    #[test]
    fn read_integer_end_of_input() {
        assert_eq!(read_integer(b"7"), Some((7, 1)));
    }

    #[test]
    fn read_integer_rejects_non_digit() {
        assert_eq!(read_integer(b"a,b"), None);
        assert_eq!(read_integer(b""), None);
    }

    #[test]
    fn read_string_stops_at_delimiter() {
        assert_eq!(
            read_string(b"hello,world", 30, b','),
            Some(("hello".to_string(), 6))
        );
    }

    #[test]
    fn read_string_stops_at_newline() {
        assert_eq!(
            read_string(b"sensors/temp\n", 30, b','),
            Some(("sensors/temp".to_string(), 13))
        );
    }

    #[test]
    fn read_string_skips_carriage_return() {
        assert_eq!(
            read_string(b"abc\r\n", 30, b','),
            Some(("abc".to_string(), 5))
        );
    }

    #[test]
    fn read_string_truncates_to_limit() {
        assert_eq!(
            read_string(b"abcdef,", 3, b','),
            Some(("abc".to_string(), 3))
        );
    }

    #[test]
    fn read_string_rejects_empty() {
        assert_eq!(read_string(b",", 10, b','), None);
    }

    #[test]
    fn frame_parses_known_code() {
        let frame = Frame::parse("3,4").unwrap();
        assert_eq!(frame.code, ProtocolCode::StAlive);
        assert_eq!(frame.rest, "4");
    }

    #[test]
    fn frame_rejects_unknown_code() {
        assert!(Frame::parse("999,4").is_none());
    }

    #[test]
    fn serial_prefix_recognised() {
        let (kind, rest) = SerialFrameKind::parse_prefix("M:000000001,3,4\n").unwrap();
        assert_eq!(kind, SerialFrameKind::Machine);
        assert_eq!(rest, "000000001,3,4\n");
    }

    #[test]
    fn serial_prefix_too_short_is_dropped() {
        assert!(SerialFrameKind::parse_prefix("M").is_none());
    }

    #[test]
    fn serial_message_discovery_scenario() {
        let (_, rest) = SerialFrameKind::parse_prefix("M:000000001,3,4\n").unwrap();
        let msg = SerialMessage::parse(rest.trim_end_matches('\n')).unwrap();
        assert_eq!(msg.device_id, "000000001");
        assert_eq!(msg.frame.code, ProtocolCode::StAlive);
        assert_eq!(msg.frame.rest, "4");
    }

    #[test]
    fn formats_machine_frame() {
        let line = format_machine_frame("000000001", ProtocolCode::GetModules, &[]);
        assert_eq!(line, "M:000000001,8\n");
    }

    #[test]
    fn formats_status_frame_without_sender_id() {
        let line = format_status_frame(ProtocolCode::StAlive, &["4"]);
        assert_eq!(line, "3,4");
    }

    #[test]
    fn formats_peer_frame_with_sender_id() {
        let line = format_peer_frame("100000000", ProtocolCode::Module, &["012FFA1", "000000001", "1"]);
        assert_eq!(line, "100000000,6,012FFA1,000000001,1");
    }
}
