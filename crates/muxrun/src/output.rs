//! Human-readable rendering of results

use std::io::{self, Write};

use muxrun_core::Liveness;
use muxrun_exec::CommandResult;

/// Write one host's result: a header line, then captured output verbatim
///
/// # Errors
/// Returns an I/O error if `out` cannot be written
pub fn write_result<W: Write>(out: &mut W, host: &str, result: &CommandResult) -> io::Result<()> {
    match result {
        CommandResult::Completed(output) => {
            writeln!(out, "[{host}] exit {}", output.status)?;
            write_block(out, &output.stdout)?;
            if !output.stderr.is_empty() {
                writeln!(out, "[{host}] stderr")?;
                write_block(out, &output.stderr)?;
            }
        }
        CommandResult::Timeout(message) => writeln!(out, "[{host}] timed out: {message}")?,
        CommandResult::Error(message) => writeln!(out, "[{host}] error: {message}")?,
    }
    Ok(())
}

/// Write a probe outcome
///
/// # Errors
/// Returns an I/O error if `out` cannot be written
pub fn write_liveness<W: Write>(out: &mut W, host: &str, liveness: Liveness) -> io::Result<()> {
    writeln!(out, "{host}: {liveness}")
}

fn write_block<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    out.write_all(bytes)?;
    if bytes.last().is_some_and(|b| *b != b'\n') {
        out.write_all(b"\n")?;
    }
    Ok(())
}
