//! Load device frame codec
//!
//! Wire layout:
//!
//! ```text
//! SOI | escaped( addr cid len info.. chkHi chkLo ) | EOI
//! ```
//!
//! `len` counts `addr`, `cid` and `len` itself plus the info bytes. The
//! checksum is the 16-bit wrapping sum of `addr cid len info..`. Any escaped
//! byte equal to SOI, EOI or ROI is preceded by a literal ROI.

use crate::error::{LinkError, Result};

/// Start of frame
pub const SOI: u8 = 0xEE;
/// End of frame
pub const EOI: u8 = 0xEF;
/// Escape marker
pub const ROI: u8 = 0xED;

/// Broadcast address; commands sent here may not be answered
pub const BROADCAST_ADDR: u8 = 0x00;

/// Smallest well-formed frame: SOI addr cid len chkHi chkLo EOI
pub const MIN_FRAME_LEN: usize = 7;

/// Largest info block that still fits the one-byte length field
pub const MAX_INFO_LEN: usize = u8::MAX as usize - 3;

/// Device return codes that signal a hardware fault
pub const FAULT_CODES: std::ops::RangeInclusive<u8> = 0xF1..=0xF4;

/// Command codes
pub mod cid {
    pub const READ_ALL_CONFIGS: u8 = 0x06;
    pub const READ_VERSION: u8 = 0x09;
    pub const SET_OUTPUT_VOLTAGE: u8 = 0x0E;
    pub const READ_STATUS: u8 = 0x0F;
    pub const SET_CHANNEL: u8 = 0x11;
    pub const SET_CHANNEL_PERSIST: u8 = 0x12;
    pub const SET_ALL_CHANNELS: u8 = 0x40;
    pub const SET_ALL_CHANNELS_PERSIST: u8 = 0x41;
}

/// 16-bit wrapping sum
pub fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

fn is_reserved(byte: u8) -> bool {
    matches!(byte, SOI | EOI | ROI)
}

/// Build a complete frame for `info`
pub fn encode(addr: u8, cid: u8, info: &[u8]) -> Result<Vec<u8>> {
    if info.len() > MAX_INFO_LEN {
        return Err(LinkError::validation(format!(
            "info block of {} bytes exceeds {}",
            info.len(),
            MAX_INFO_LEN
        )));
    }

    let mut payload = Vec::with_capacity(info.len() + 5);
    payload.push(addr);
    payload.push(cid);
    payload.push((info.len() + 3) as u8);
    payload.extend_from_slice(info);
    let sum = checksum(&payload);
    payload.extend_from_slice(&sum.to_be_bytes());

    let mut frame = Vec::with_capacity(payload.len() * 2 + 2);
    frame.push(SOI);
    for &byte in &payload {
        if is_reserved(byte) {
            frame.push(ROI);
        }
        frame.push(byte);
    }
    frame.push(EOI);
    Ok(frame)
}

/// Remove escape markers; the byte after a marker is kept verbatim
fn unescape(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ROI {
            match bytes.next() {
                Some(&escaped) => out.push(escaped),
                None => return Err(LinkError::frame("dangling escape marker")),
            }
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}

/// Validate a response frame and return its info block
///
/// Checks run in order: length and delimiters, checksum, device return code,
/// length field.
pub fn decode(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(LinkError::frame(format!(
            "frame too short: {} bytes",
            raw.len()
        )));
    }
    if raw[0] != SOI {
        return Err(LinkError::frame(format!("bad start byte 0x{:02X}", raw[0])));
    }
    if raw[raw.len() - 1] != EOI {
        return Err(LinkError::frame(format!(
            "bad end byte 0x{:02X}",
            raw[raw.len() - 1]
        )));
    }

    let body = unescape(&raw[1..raw.len() - 1])?;
    if body.len() < 5 {
        return Err(LinkError::frame(format!(
            "unescaped body too short: {} bytes",
            body.len()
        )));
    }

    let (payload, trailer) = body.split_at(body.len() - 2);
    let actual = u16::from_be_bytes([trailer[0], trailer[1]]);
    let expected = checksum(payload);
    if expected != actual {
        return Err(LinkError::ChecksumMismatch { expected, actual });
    }

    let code = payload[1];
    if FAULT_CODES.contains(&code) {
        return Err(LinkError::DeviceFault { code });
    }

    let info_len = usize::from(payload[2]).saturating_sub(3);
    let available = payload.len() - 3;
    if info_len > available {
        return Err(LinkError::frame(format!(
            "length field announces {} info bytes, frame carries {}",
            info_len, available
        )));
    }
    Ok(payload[3..3 + info_len].to_vec())
}

/// Commands the device executes silently when sent to the broadcast address
pub fn expects_reply(addr: u8, cid: u8) -> bool {
    !(addr == BROADCAST_ADDR
        && matches!(
            cid,
            cid::SET_OUTPUT_VOLTAGE | cid::SET_CHANNEL | cid::SET_ALL_CHANNELS
        ))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    // ========================================================================
    // Encoding
    // ========================================================================

    #[test]
    fn test_encode_read_version() {
        let frame = encode(0x01, cid::READ_VERSION, &[]).unwrap();
        // sum = 01 + 09 + 03 = 0x000D
        assert_eq!(frame, vec![SOI, 0x01, 0x09, 0x03, 0x00, 0x0D, EOI]);
    }

    #[test]
    fn test_encode_escapes_reserved_bytes() {
        let frame = encode(0x01, 0x11, &[SOI, 0x05, EOI, ROI]).unwrap();
        assert_eq!(
            frame,
            vec![SOI, 0x01, 0x11, 0x07, ROI, SOI, 0x05, ROI, EOI, ROI, ROI, 0x02, 0xE8, EOI]
        );
        // only the last byte is an unescaped EOI
        assert_eq!(frame.iter().filter(|&&b| b == EOI).count(), 2);
    }

    #[test]
    fn test_encode_escapes_checksum_bytes() {
        // info chosen so the low checksum byte is 0xEE
        let info = [0xDA];
        let sum = checksum(&[0x01, 0x0F, 0x04, 0xDA]);
        assert_eq!(sum, 0x00EE);
        let frame = encode(0x01, 0x0F, &info).unwrap();
        assert_eq!(&frame[frame.len() - 4..], &[0x00, ROI, 0xEE, EOI]);
    }

    #[test]
    fn test_encode_rejects_oversized_info() {
        let info = vec![0u8; MAX_INFO_LEN + 1];
        assert!(matches!(
            encode(0x01, 0x11, &info),
            Err(LinkError::Validation(_))
        ));
    }

    // ========================================================================
    // Round trip
    // ========================================================================

    #[test]
    fn test_round_trip_all_lengths() {
        for len in 0..=250usize {
            let info: Vec<u8> = (0..len).map(|i| (i * 37 + len) as u8).collect();
            let frame = encode(0x01, 0x0F, &info).unwrap();
            assert_eq!(decode(&frame).unwrap(), info, "len {len}");
        }
    }

    #[test]
    fn test_round_trip_reserved_payloads() {
        let info = vec![SOI, EOI, ROI, ROI, EOI, SOI, 0x00, ROI];
        for addr in [0x00, SOI, EOI, ROI] {
            let frame = encode(addr, 0x06, &info).unwrap();
            assert_eq!(decode(&frame).unwrap(), info);
        }
    }

    // ========================================================================
    // Integrity
    // ========================================================================

    #[test]
    fn test_single_byte_mutation_is_checksum_mismatch() {
        let info: Vec<u8> = (0..40u8).collect();
        let frame = encode(0x01, 0x0F, &info).unwrap();
        for pos in 1..frame.len() - 1 {
            if frame[pos] == ROI || frame[pos - 1] == ROI {
                continue;
            }
            let mut corrupted = frame.clone();
            // stay clear of reserved values so the escaping is unchanged
            corrupted[pos] = if frame[pos] == 0x55 { 0x56 } else { 0x55 };
            let err = decode(&corrupted).unwrap_err();
            assert!(
                matches!(err, LinkError::ChecksumMismatch { .. }),
                "pos {pos}: {err:?}"
            );
        }
    }

    #[test]
    fn test_bad_delimiters_and_short_frames() {
        let frame = encode(0x01, 0x09, &[0x31]).unwrap();

        let mut bad_start = frame.clone();
        bad_start[0] = 0x00;
        assert!(matches!(decode(&bad_start), Err(LinkError::FrameIntegrity(_))));

        let mut bad_end = frame.clone();
        let last = bad_end.len() - 1;
        bad_end[last] = 0x00;
        assert!(matches!(decode(&bad_end), Err(LinkError::FrameIntegrity(_))));

        assert!(matches!(
            decode(&[SOI, 0x01, 0x09, 0x03, 0x00, EOI]),
            Err(LinkError::FrameIntegrity(_))
        ));
        // seven bytes that collapse to three after unescaping
        assert!(matches!(
            decode(&[SOI, ROI, 0x01, ROI, 0x02, 0x03, EOI]),
            Err(LinkError::FrameIntegrity(_))
        ));
    }

    #[test]
    fn test_fault_codes_never_return_info() {
        for code in 0xF1..=0xF4u8 {
            let frame = encode(0x01, code, &[0x01, 0x02]).unwrap();
            assert_eq!(decode(&frame), Err(LinkError::DeviceFault { code }));
        }
        let frame = encode(0x01, 0xF5, &[0x01]).unwrap();
        assert_eq!(decode(&frame).unwrap(), vec![0x01]);
    }

    #[test]
    fn test_length_field_shorter_than_payload() {
        // len field says 3 (no info) but two info bytes follow
        let payload = [0x01, 0x00, 0x03, 0xAA, 0xBB];
        let sum = checksum(&payload);
        let mut frame = vec![SOI];
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&sum.to_be_bytes());
        frame.push(EOI);
        assert_eq!(decode(&frame).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_length_field_longer_than_payload() {
        let payload = [0x01, 0x00, 0x09, 0xAA];
        let sum = checksum(&payload);
        let mut frame = vec![SOI];
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&sum.to_be_bytes());
        frame.push(EOI);
        assert!(matches!(decode(&frame), Err(LinkError::FrameIntegrity(_))));
    }

    #[test]
    fn test_broadcast_no_reply_set() {
        assert!(!expects_reply(BROADCAST_ADDR, cid::SET_OUTPUT_VOLTAGE));
        assert!(!expects_reply(BROADCAST_ADDR, cid::SET_CHANNEL));
        assert!(!expects_reply(BROADCAST_ADDR, cid::SET_ALL_CHANNELS));
        assert!(expects_reply(BROADCAST_ADDR, cid::READ_STATUS));
        assert!(expects_reply(BROADCAST_ADDR, cid::SET_CHANNEL_PERSIST));
        assert!(expects_reply(0x01, cid::SET_OUTPUT_VOLTAGE));
    }
}
