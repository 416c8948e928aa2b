//! Hex dump formatting for wire traffic

use log::{log_enabled, trace, Level};

const BYTES_PER_ROW: usize = 16;

/// Formats `bytes` as rows of `offset  hex bytes  ascii`, numbering rows from `base`.
pub fn hexdump(bytes: &[u8], base: u32) -> Vec<String> {
    bytes
        .chunks(BYTES_PER_ROW)
        .enumerate()
        .map(|(row, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
                .collect();

            format!(
                "{:08x}  {:<width$}  {}",
                base as usize + row * BYTES_PER_ROW,
                hex.join(" "),
                ascii,
                width = BYTES_PER_ROW * 3 - 1
            )
        })
        .collect()
}

/// Logs a hex dump of `bytes` at trace level, numbered from `base` and tagged with `label`
pub fn trace_dump(label: &str, bytes: &[u8], base: u32) {
    if !log_enabled!(Level::Trace) {
        return;
    }

    for row in hexdump(bytes, base) {
        trace!("{} {}", label, row);
    }
}
