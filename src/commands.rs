//! Console commands.
//!
//! A line that does not start with `:` is sent as text. `::` escapes a
//! leading colon.

use scomm_serial::serial::config::parse_millis;
use scomm_serial::serial::{BaudRate, ControlLine, RenderMode};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fresh send of the given text.
    Send(String),
    /// Repeat the cached payload.
    SendCached,
    Hex(bool),
    View(RenderMode),
    Cr(bool),
    Lf(bool),
    /// `None` turns the send cycle off.
    Cycle(Option<u64>),
    Split(u64),
    Line(ControlLine, bool),
    Preset(String),
    Export(Option<PathBuf>),
    Port(String),
    Baud(BaudRate),
    Open,
    Close,
    Ports,
    Stats,
    Clear,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command `:{0}` (try :help)")]
    Unknown(String),
    #[error(":{0} needs an argument")]
    MissingArgument(&'static str),
    #[error("invalid argument for :{command}: {value}")]
    InvalidArgument { command: &'static str, value: String },
}

pub const HELP: &str = "\
text            send text (fresh build)
:send           resend the cached payload
:hex on|off     hex input mode
:view hex|text  receive rendering
:cr on|off      append CR
:lf on|off      append LF
:cycle <n>ms|off periodic send
:split <n>ms    receive gap window
:rts on|off     RTS line
:dtr on|off     DTR line
:preset <name>  send a stored preset
:export [path]  write the transcript to a file
:port <name>    select the port (closed only)
:baud <rate>    select the baud rate (closed only)
:open / :close  open or close the device
:ports          list serial ports
:stats          session counters
:clear          clear the transcript
:quit           exit";

fn on_off(command: &'static str, arg: Option<&str>) -> Result<bool, CommandError> {
    match arg.ok_or(CommandError::MissingArgument(command))? {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        other => Err(CommandError::InvalidArgument {
            command,
            value: other.to_string(),
        }),
    }
}

fn millis(command: &'static str, arg: Option<&str>) -> Result<u64, CommandError> {
    let arg = arg.ok_or(CommandError::MissingArgument(command))?;
    parse_millis(arg).ok_or_else(|| CommandError::InvalidArgument {
        command,
        value: arg.to_string(),
    })
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    if let Some(rest) = line.strip_prefix("::") {
        return Ok(Some(Command::Send(format!(":{}", rest))));
    }
    let Some(rest) = line.strip_prefix(':') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let rest = rest.trim();
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (rest, None),
    };

    let cmd = match name {
        "send" => Command::SendCached,
        "hex" => Command::Hex(on_off("hex", arg)?),
        "view" => match arg.ok_or(CommandError::MissingArgument("view"))? {
            "hex" => Command::View(RenderMode::Hex),
            "text" => Command::View(RenderMode::Text),
            other => {
                return Err(CommandError::InvalidArgument {
                    command: "view",
                    value: other.to_string(),
                })
            }
        },
        "cr" => Command::Cr(on_off("cr", arg)?),
        "lf" => Command::Lf(on_off("lf", arg)?),
        "cycle" => match arg {
            Some("off") => Command::Cycle(None),
            _ => Command::Cycle(Some(millis("cycle", arg)?)),
        },
        "split" => Command::Split(millis("split", arg)?),
        "rts" => Command::Line(ControlLine::Rts, on_off("rts", arg)?),
        "dtr" => Command::Line(ControlLine::Dtr, on_off("dtr", arg)?),
        "preset" => Command::Preset(arg.ok_or(CommandError::MissingArgument("preset"))?.to_string()),
        "export" => Command::Export(arg.map(PathBuf::from)),
        "port" => Command::Port(arg.ok_or(CommandError::MissingArgument("port"))?.to_string()),
        "baud" => {
            let arg = arg.ok_or(CommandError::MissingArgument("baud"))?;
            match arg.parse::<u32>() {
                Ok(baud) if baud > 0 => Command::Baud(BaudRate(baud)),
                _ => {
                    return Err(CommandError::InvalidArgument {
                        command: "baud",
                        value: arg.to_string(),
                    })
                }
            }
        }
        "open" => Command::Open,
        "close" => Command::Close,
        "ports" => Command::Ports,
        "stats" => Command::Stats,
        "clear" => Command::Clear,
        "help" | "?" => Command::Help,
        "quit" | "q" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_send() {
        assert_eq!(parse("AT+GMR").unwrap(), Some(Command::Send("AT+GMR".into())));
        assert_eq!(parse("  spaced  ").unwrap(), Some(Command::Send("  spaced  ".into())));
        assert_eq!(parse("::colon").unwrap(), Some(Command::Send(":colon".into())));
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_toggles() {
        assert_eq!(parse(":hex on").unwrap(), Some(Command::Hex(true)));
        assert_eq!(parse(":lf off").unwrap(), Some(Command::Lf(false)));
        assert_eq!(parse(":view hex").unwrap(), Some(Command::View(RenderMode::Hex)));
        assert_eq!(
            parse(":dtr 1").unwrap(),
            Some(Command::Line(ControlLine::Dtr, true))
        );
        assert_eq!(
            parse(":cr maybe"),
            Err(CommandError::InvalidArgument {
                command: "cr",
                value: "maybe".into()
            })
        );
    }

    #[test]
    fn test_durations() {
        assert_eq!(parse(":cycle 100ms").unwrap(), Some(Command::Cycle(Some(100))));
        assert_eq!(parse(":cycle off").unwrap(), Some(Command::Cycle(None)));
        assert_eq!(parse(":split 35").unwrap(), Some(Command::Split(35)));
        assert_eq!(parse(":split"), Err(CommandError::MissingArgument("split")));
    }

    #[test]
    fn test_arguments_and_unknowns() {
        assert_eq!(
            parse(":preset btn-data01").unwrap(),
            Some(Command::Preset("btn-data01".into()))
        );
        assert_eq!(parse(":export").unwrap(), Some(Command::Export(None)));
        assert_eq!(
            parse(":export /tmp/log.txt").unwrap(),
            Some(Command::Export(Some(PathBuf::from("/tmp/log.txt"))))
        );
        assert_eq!(parse(":baud 9600").unwrap(), Some(Command::Baud(BaudRate(9600))));
        assert!(parse(":baud 0").is_err());
        assert_eq!(parse(":frobnicate"), Err(CommandError::Unknown("frobnicate".into())));
        assert_eq!(parse(":q").unwrap(), Some(Command::Quit));
    }
}
