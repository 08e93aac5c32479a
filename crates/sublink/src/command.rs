//! Commands accepted from the UI collaborator
//!
//! The operator binary reads these as text lines:
//! `record start`, `record stop`, `detect on <n>`, `detect off <n>`, `refresh`.
//! Camera numbers are the 1-based feed numbers.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    StartRecording,
    StopRecording,
    EnableDetection(usize),
    DisableDetection(usize),
    /// Re-broadcast the discovery query
    RefreshDevices,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("invalid camera number: {0}")]
    InvalidCamera(String),
}

impl FromStr for OperatorCommand {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        match words.as_slice() {
            [] => Err(ParseCommandError::Empty),
            ["record", "start"] => Ok(OperatorCommand::StartRecording),
            ["record", "stop"] => Ok(OperatorCommand::StopRecording),
            ["detect", toggle @ ("on" | "off"), camera] => {
                let camera = camera
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ParseCommandError::InvalidCamera(camera.to_string()))?;
                Ok(if *toggle == "on" {
                    OperatorCommand::EnableDetection(camera)
                } else {
                    OperatorCommand::DisableDetection(camera)
                })
            }
            ["refresh"] => Ok(OperatorCommand::RefreshDevices),
            _ => Err(ParseCommandError::Unknown(s.trim().to_string())),
        }
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorCommand::StartRecording => write!(f, "record start"),
            OperatorCommand::StopRecording => write!(f, "record stop"),
            OperatorCommand::EnableDetection(n) => write!(f, "detect on {}", n),
            OperatorCommand::DisableDetection(n) => write!(f, "detect off {}", n),
            OperatorCommand::RefreshDevices => write!(f, "refresh"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("record start".parse(), Ok(OperatorCommand::StartRecording));
        assert_eq!("  record   stop \n".parse(), Ok(OperatorCommand::StopRecording));
        assert_eq!("detect on 2".parse(), Ok(OperatorCommand::EnableDetection(2)));
        assert_eq!("detect off 1".parse(), Ok(OperatorCommand::DisableDetection(1)));
        assert_eq!("refresh".parse(), Ok(OperatorCommand::RefreshDevices));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<OperatorCommand>(), Err(ParseCommandError::Empty));
        assert_eq!(
            "detect on 0".parse::<OperatorCommand>(),
            Err(ParseCommandError::InvalidCamera("0".into()))
        );
        assert_eq!(
            "detect on two".parse::<OperatorCommand>(),
            Err(ParseCommandError::InvalidCamera("two".into()))
        );
        assert!(matches!(
            "record pause".parse::<OperatorCommand>(),
            Err(ParseCommandError::Unknown(_))
        ));
    }

    #[test]
    fn test_display_matches_parse() {
        for cmd in [
            OperatorCommand::StartRecording,
            OperatorCommand::EnableDetection(3),
            OperatorCommand::RefreshDevices,
        ] {
            assert_eq!(cmd.to_string().parse(), Ok(cmd));
        }
    }
}
