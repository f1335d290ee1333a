//! Hex formatting for frame traces

use std::fmt::Write;

/// Space-separated uppercase hex, the form used in TX/RX log lines
/// Example: [0xEE, 0x01, 0x09] -> "EE 01 09"
pub fn format_hex_pretty(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}
