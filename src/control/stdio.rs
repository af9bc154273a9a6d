//! Control lines on stdout.
//!
//! stdout carries nothing but newline-terminated JSON objects; logs go to
//! stderr. Lines are written under the stdout lock and flushed at once, so a
//! harness reading the pipe never sees half a line.

use std::io::Write;

use serde::Serialize;

use crate::error::Result;

/// Serialize `value` as one JSON line on stdout.
pub fn write_stdout_json<T: Serialize>(value: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, value)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
