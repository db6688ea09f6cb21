//! Terminal command frames.
//!
//! Every message on a session's input channel is one [`Command`], encoded as a
//! single frame:
//!
//! | Frame                      | Command                 |
//! |----------------------------|-------------------------|
//! | empty                      | [`Command::Stop`]       |
//! | `b'1'` + raw bytes         | [`Command::Data`]       |
//! | `b'2'` + `"<rows>,<cols>"` | [`Command::Resize`]     |
//!
//! Browsers produce these frames directly (the dashboard prefixes keystrokes
//! with `1`), so the router forwards them without re-encoding.

use thiserror::Error;

/// Discriminator byte for [`Command::Data`].
pub const TAG_DATA: u8 = b'1';
/// Discriminator byte for [`Command::Resize`].
pub const TAG_RESIZE: u8 = b'2';

/// One command delivered to a PTY session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Raw bytes for the PTY's stdin.
    Data(Vec<u8>),
    /// New window size.
    Resize { rows: u16, cols: u16 },
    /// Terminate the session.
    Stop,
}

/// A frame that does not decode to a [`Command`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("malformed resize payload {0:?}")]
    BadResize(String),
}

impl Command {
    /// Decode one frame.
    pub fn decode(frame: &[u8]) -> Result<Self, CommandError> {
        let Some((&tag, payload)) = frame.split_first() else {
            return Ok(Command::Stop);
        };
        match tag {
            TAG_DATA => Ok(Command::Data(payload.to_vec())),
            TAG_RESIZE => parse_resize(payload),
            other => Err(CommandError::UnknownTag(other)),
        }
    }

    /// Encode into a single frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Stop => Vec::new(),
            Command::Data(data) => {
                let mut frame = Vec::with_capacity(data.len() + 1);
                frame.push(TAG_DATA);
                frame.extend_from_slice(data);
                frame
            }
            Command::Resize { rows, cols } => {
                let mut frame = vec![TAG_RESIZE];
                frame.extend_from_slice(format!("{rows},{cols}").as_bytes());
                frame
            }
        }
    }

    /// Whether `frame` is the stop sentinel.
    pub fn is_stop_frame(frame: &[u8]) -> bool {
        frame.is_empty()
    }
}

fn parse_resize(payload: &[u8]) -> Result<Command, CommandError> {
    let text = String::from_utf8_lossy(payload);
    let bad = || CommandError::BadResize(text.to_string());
    let (rows, cols) = text.trim().split_once(',').ok_or_else(bad)?;
    let rows = rows.trim().parse::<u16>().map_err(|_| bad())?;
    let cols = cols.trim().parse::<u16>().map_err(|_| bad())?;
    Ok(Command::Resize { rows, cols })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_is_stop() {
        assert_eq!(Command::decode(b""), Ok(Command::Stop));
        assert!(Command::Stop.encode().is_empty());
        assert!(Command::is_stop_frame(&Command::Stop.encode()));
    }

    #[test]
    fn data_frame_keeps_payload_verbatim() {
        let cmd = Command::decode(b"1ls -la\r").unwrap();
        assert_eq!(cmd, Command::Data(b"ls -la\r".to_vec()));

        // A bare tag is an empty write, not a stop.
        assert_eq!(Command::decode(b"1"), Ok(Command::Data(Vec::new())));
    }

    #[test]
    fn resize_frame_parses_rows_then_cols() {
        assert_eq!(
            Command::decode(b"240,120"),
            Ok(Command::Resize { rows: 40, cols: 120 })
        );
        assert_eq!(Command::Resize { rows: 40, cols: 120 }.encode(), b"240,120");
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert_eq!(Command::decode(b"9abc"), Err(CommandError::UnknownTag(b'9')));
        assert!(matches!(
            Command::decode(b"240x120"),
            Err(CommandError::BadResize(_))
        ));
        assert!(matches!(
            Command::decode(b"2-1,80"),
            Err(CommandError::BadResize(_))
        ));
    }
}
