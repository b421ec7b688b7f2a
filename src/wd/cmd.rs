use crate::wd::log::event;
use crate::wd::MAX_APP_NAME_LENGTH;

/// One decoded datagram. Start/Stop/Restart are reserved wire vocabulary:
/// the parser accepts them but the supervisor loop does not act on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetCommand {
    Heartbeat { pid: i32 },
    Start(String),
    Stop(String),
    Restart(String),
    Unknown,
}

/// Actions the loop applies, regardless of which source produced them
/// (UDP datagram, rendezvous file, OS signal, reboot scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Heartbeat { pid: i32 },
    StartApp(usize),
    StopApp(usize),
    RestartApp(usize),
    ExitNormal,
    Restart,
    Reboot,
}

/// strtol-style scan: leading non-numeric bytes are skipped, a sign directly
/// before the digits is honored (and makes the PID invalid downstream).
fn parse_number(data: &[u8]) -> Option<i64> {
    let mut i = 0;
    while i < data.len() && !data[i].is_ascii_digit() && data[i] != b'-' {
        i += 1;
    }
    let neg = i < data.len() && data[i] == b'-';
    if neg {
        i += 1;
    }
    let start = i;
    let mut val: i64 = 0;
    while i < data.len() && data[i].is_ascii_digit() {
        val = val.checked_mul(10)?.checked_add((data[i] - b'0') as i64)?;
        i += 1;
    }
    if i == start {
        return None;
    }
    Some(if neg { -val } else { val })
}

fn name_arg(data: &[u8]) -> String {
    let raw = &data[1..data.len().min(MAX_APP_NAME_LENGTH)];
    String::from_utf8_lossy(raw).trim_end_matches('\0').to_string()
}

/// Hex + printable rendering of a rejected datagram, bounded so a hostile
/// sender cannot blow up the log.
fn dump(data: &[u8]) -> String {
    let bounded = &data[..data.len().min(MAX_APP_NAME_LENGTH)];
    let printable: String = bounded
        .iter()
        .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
        .collect();
    let hex: Vec<String> = bounded.iter().map(|b| format!("{b:02X}")).collect();
    format!("{printable} | {}", hex.join(" "))
}

pub fn parse(data: &[u8]) -> NetCommand {
    if data.is_empty() {
        return NetCommand::Unknown;
    }
    match data[0] {
        b'p' => match parse_number(data) {
            Some(n) if n > 0 && n < i32::MAX as i64 => NetCommand::Heartbeat { pid: n as i32 },
            _ => {
                event("cmd", None, format!("invalid pid in heartbeat: {}", dump(data)));
                NetCommand::Unknown
            }
        },
        b'a' => NetCommand::Start(name_arg(data)),
        b'o' => NetCommand::Stop(name_arg(data)),
        b'r' => NetCommand::Restart(name_arg(data)),
        _ => {
            event("cmd", None, format!("unknown command received: {}", dump(data)));
            NetCommand::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_parses_a_plain_pid() {
        assert_eq!(parse(b"p1234"), NetCommand::Heartbeat { pid: 1234 });
    }

    #[test]
    fn pid_zero_is_invalid() {
        assert_eq!(parse(b"p0"), NetCommand::Unknown);
    }

    #[test]
    fn negative_pid_is_invalid() {
        assert_eq!(parse(b"p-1"), NetCommand::Unknown);
    }

    #[test]
    fn pid_must_fit_int32() {
        assert_eq!(parse(b"p2147483647"), NetCommand::Unknown);
        assert_eq!(parse(b"p2147483646"), NetCommand::Heartbeat { pid: 2147483646 });
        assert_eq!(parse(b"p99999999999999999999"), NetCommand::Unknown);
    }

    #[test]
    fn heartbeat_with_no_digits_is_invalid() {
        assert_eq!(parse(b"p"), NetCommand::Unknown);
        assert_eq!(parse(b"pabc"), NetCommand::Unknown);
    }

    #[test]
    fn reserved_verbs_decode_names() {
        assert_eq!(parse(b"aBot"), NetCommand::Start("Bot".into()));
        assert_eq!(parse(b"oBot"), NetCommand::Stop("Bot".into()));
        assert_eq!(parse(b"rBot"), NetCommand::Restart("Bot".into()));
    }

    #[test]
    fn reserved_verb_names_are_bounded() {
        let mut data = vec![b'a'];
        data.extend(std::iter::repeat(b'x').take(100));
        let NetCommand::Start(name) = parse(&data) else {
            panic!("expected start");
        };
        assert!(name.len() < MAX_APP_NAME_LENGTH);
    }

    #[test]
    fn unknown_first_byte_is_discarded() {
        assert_eq!(parse(b"zzz"), NetCommand::Unknown);
        assert_eq!(parse(b""), NetCommand::Unknown);
    }
}
