//! Telemetry payload codec.
//!
//! A payload is the value as a UTF-8 decimal string ("87"). There is no length
//! prefix and no delimiter: a receiver treats each chunk it reads as one value.

use anyhow::{Context, Result};
use crate::protocol::MAX_PAYLOAD_LEN;
use crate::types::TelemetryValue;

pub fn encode(value: TelemetryValue) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Decode one received chunk. Anything that is not a decimal integer in
/// 0..=100 is rejected; callers drop rejected chunks.
pub fn decode(chunk: &[u8]) -> Result<TelemetryValue> {
    anyhow::ensure!(chunk.len() <= MAX_PAYLOAD_LEN, "payload of {} bytes is too long", chunk.len());

    let text = std::str::from_utf8(chunk).context("payload is not UTF-8")?;
    let number: i64 = text
        .parse()
        .with_context(|| format!("payload {:?} is not an integer", text))?;
    let percent = u8::try_from(number)
        .with_context(|| format!("payload {} is out of range", number))?;

    TelemetryValue::new(percent)
}
