//! Line protocol spoken between a session and the coordinator
//!
//! Every message is one `\n`-terminated line:
//!
//! 1. session: bootstrap line that starts the coordinator in the remote shell
//!    (see [`crate::bootstrap`])
//! 2. coordinator: [`READY_LINE`]
//! 3. session: one JSON command per line (argv array or shell string), then [`DONE`]
//! 4. coordinator: one JSON result per command in completion order, then [`DONE`]
//!
//! Captured output is base64 inside the result JSON, so arbitrary bytes
//! survive and no payload can contain a newline.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::batch::{Command, Mode};
use crate::error::ExecError;
use crate::result::CommandOutput;

/// Handshake line emitted by the coordinator before it reads input
pub const READY_LINE: &str = "ready muxrun-coordinator/1";

/// Sentinel closing both the command list and the result list
pub const DONE: &str = "done";

#[derive(Serialize)]
struct ResultLineRef<'a> {
    index: usize,
    status: i32,
    #[serde(serialize_with = "encode_bytes")]
    stdout: &'a [u8],
    #[serde(serialize_with = "encode_bytes")]
    stderr: &'a [u8],
}

#[derive(Deserialize)]
struct ResultLine {
    index: usize,
    status: i32,
    #[serde(deserialize_with = "decode_bytes")]
    stdout: Vec<u8>,
    #[serde(deserialize_with = "decode_bytes")]
    stderr: Vec<u8>,
}

fn encode_bytes<S: Serializer>(bytes: &&[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn decode_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    STANDARD.decode(text).map_err(serde::de::Error::custom)
}

/// A decoded coordinator line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Result of the command at `index`
    Result {
        index: usize,
        output: CommandOutput,
    },
    /// All results have been sent
    Done,
}

/// Encode a command as a single protocol line
///
/// # Errors
/// Returns `ExecError::InvalidBatch` if serialization fails
pub fn encode_command(command: &Command) -> Result<String, ExecError> {
    let encoded = match command {
        Command::Argv(args) => serde_json::to_string(args),
        Command::Shell(script) => serde_json::to_string(script),
    };
    encoded.map_err(|e| ExecError::InvalidBatch(e.to_string()))
}

/// Decode a command line read by the coordinator
///
/// # Errors
/// Returns a description of the problem, which becomes the command's stderr
pub fn decode_command(line: &str, mode: Mode) -> Result<Command, String> {
    let decoded = match mode {
        Mode::Argv => serde_json::from_str::<Vec<String>>(line).map(Command::Argv),
        Mode::Shell => serde_json::from_str::<String>(line).map(Command::Shell),
    };
    decoded.map_err(|e| format!("malformed {mode} command: {e}"))
}

/// Encode one result line, without the trailing newline
#[must_use]
pub fn encode_result(index: usize, output: &CommandOutput) -> String {
    let line = ResultLineRef {
        index,
        status: output.status,
        stdout: &output.stdout,
        stderr: &output.stderr,
    };
    // Only integers and strings: serialization cannot fail
    serde_json::to_string(&line).unwrap_or_default()
}

/// Decode a line sent by the coordinator after the handshake
///
/// # Errors
/// Returns `ExecError::Protocol` for anything other than a result or the sentinel
pub fn decode_reply(line: &str) -> Result<Reply, ExecError> {
    let line = line.trim_end_matches('\r');
    if line == DONE {
        return Ok(Reply::Done);
    }

    let parsed: ResultLine = serde_json::from_str(line)
        .map_err(|e| ExecError::Protocol(format!("malformed result line {line:?}: {e}")))?;

    Ok(Reply::Result {
        index: parsed.index,
        output: CommandOutput {
            status: parsed.status,
            stdout: parsed.stdout,
            stderr: parsed.stderr,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_round_trip_is_binary_safe() {
        let output = CommandOutput::new(3, vec![0u8, b'\n', 0xff, b'x'], b"err\n".to_vec());
        let line = encode_result(7, &output);

        assert!(!line.contains('\n'));
        assert_eq!(decode_reply(&line).unwrap(), Reply::Result { index: 7, output });
    }

    #[test]
    fn test_done_sentinel() {
        assert_eq!(decode_reply("done").unwrap(), Reply::Done);
        assert_eq!(decode_reply("done\r").unwrap(), Reply::Done);
    }

    #[test]
    fn test_garbage_is_a_protocol_violation() {
        let err = decode_reply("Welcome to the server!").unwrap_err();
        assert!(matches!(err, ExecError::Protocol(_)));

        let err = decode_reply(r#"{"index":0,"status":0,"stdout":"!!","stderr":""}"#).unwrap_err();
        assert!(matches!(err, ExecError::Protocol(_)));
    }

    #[test]
    fn test_decode_command_by_mode() {
        assert_eq!(
            decode_command(r#"["ls","-l"]"#, Mode::Argv).unwrap(),
            Command::argv(["ls", "-l"])
        );
        assert_eq!(
            decode_command(r#""ls | wc -l""#, Mode::Shell).unwrap(),
            Command::shell("ls | wc -l")
        );
        assert!(decode_command(r#""ls""#, Mode::Argv).is_err());
    }
}
