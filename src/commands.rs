//! # Terminal Commands
//!
//! One command per line on stdin:
//!
//! | Input          | Action                                        |
//! |----------------|-----------------------------------------------|
//! | `m`            | Toggle microphone mute                        |
//! | `s`            | Stop the voice session                        |
//! | `r`            | Restart (start a fresh session)               |
//! | `d`            | Dismiss the last error                        |
//! | `v <name>`     | Switch voice (applies on next start)          |
//! | `say <text>`   | Read text aloud (replaces current read-aloud) |
//! | `x`            | Stop read-aloud                               |
//! | `i`            | Print the current status                      |
//! | `h`            | Help                                          |
//! | `q`            | Quit                                          |

use crate::websocket::Voice;
use anyhow::{anyhow, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ToggleMute,
    Stop,
    Restart,
    DismissError,
    SwitchVoice(Voice),
    Say(String),
    StopReading,
    Status,
    Help,
    Quit,
}

impl std::str::FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let line = s.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_lowercase().as_str() {
            "m" | "mute" => Ok(Command::ToggleMute),
            "s" | "stop" => Ok(Command::Stop),
            "r" | "restart" | "start" => Ok(Command::Restart),
            "d" | "dismiss" => Ok(Command::DismissError),
            "v" | "voice" => {
                if rest.is_empty() {
                    return Err(anyhow!("Usage: v <{}>", voice_list()));
                }
                Ok(Command::SwitchVoice(rest.parse()?))
            }
            "say" => {
                if rest.is_empty() {
                    return Err(anyhow!("Usage: say <text>"));
                }
                Ok(Command::Say(rest.to_string()))
            }
            "x" | "hush" => Ok(Command::StopReading),
            "i" | "status" => Ok(Command::Status),
            "h" | "help" | "?" => Ok(Command::Help),
            "q" | "quit" | "exit" => Ok(Command::Quit),
            "" => Err(anyhow!("Empty command")),
            other => Err(anyhow!("Unknown command: {} (h for help)", other)),
        }
    }
}

/// The voice roster as `Kore|Puck|...`.
pub fn voice_list() -> String {
    Voice::ALL
        .iter()
        .map(|voice| voice.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

pub fn help_text() -> String {
    format!(
        "Commands: m (mute) | s (stop) | r (restart) | d (dismiss error) | v <{}> | say <text> | x (stop reading) | i (status) | q (quit)",
        voice_list()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!("m".parse::<Command>().unwrap(), Command::ToggleMute);
        assert_eq!(" s ".parse::<Command>().unwrap(), Command::Stop);
        assert_eq!("R".parse::<Command>().unwrap(), Command::Restart);
        assert_eq!("d".parse::<Command>().unwrap(), Command::DismissError);
        assert_eq!("q".parse::<Command>().unwrap(), Command::Quit);
        assert_eq!("x".parse::<Command>().unwrap(), Command::StopReading);
    }

    #[test]
    fn test_parse_voice_switch() {
        assert_eq!("v puck".parse::<Command>().unwrap(), Command::SwitchVoice(Voice::Puck));
        assert!("v".parse::<Command>().is_err());
        assert!("v nobody".parse::<Command>().is_err());
    }

    #[test]
    fn test_parse_say_keeps_text() {
        assert_eq!(
            "say Ship the MVP by Friday.".parse::<Command>().unwrap(),
            Command::Say("Ship the MVP by Friday.".to_string())
        );
        assert!("say".parse::<Command>().is_err());
    }

    #[test]
    fn test_unknown_and_empty() {
        assert!("".parse::<Command>().is_err());
        assert!("launch".parse::<Command>().is_err());
    }

    #[test]
    fn test_help_lists_voices() {
        assert!(help_text().contains("Kore|Puck|Charon|Fenrir|Zephyr"));
    }
}
