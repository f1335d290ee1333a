//! Detection board frame codec
//!
//! Modbus-style request/response without delimiters:
//!
//! ```text
//! read:   id 0x03 addrHi addrLo count            crcLo crcHi
//! write:  id 0x10 addrHi addrLo cntHi cntLo n data.. crcLo crcHi
//! ```
//!
//! The read request carries a single count byte, so at most 255 registers
//! per call. Response boundaries come from the channel's idle-gap reader.

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{LinkError, Result};

pub const FC_READ_HOLDING: u8 = 0x03;
pub const FC_WRITE_MULTIPLE: u8 = 0x10;

/// Exception responses set the high bit of the echoed function code
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Writes to this id reach every board on the bus and are not answered reliably
pub const BROADCAST_SLAVE: u8 = 0x00;

/// Byte count of a write request is one byte; 123 keeps within Modbus limits
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Smallest decodable response: one payload byte plus the CRC
pub const MIN_RESPONSE_LEN: usize = 3;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/Modbus over `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC trailer, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Read-holding-registers request
pub fn encode_read_holding(slave: u8, start: u16, count: u8) -> Result<Vec<u8>> {
    if count == 0 {
        return Err(LinkError::validation("register count must be at least 1"));
    }
    let [hi, lo] = start.to_be_bytes();
    let mut frame = vec![slave, FC_READ_HOLDING, hi, lo, count];
    append_crc(&mut frame);
    Ok(frame)
}

/// Write-multiple-registers request; values are sent big-endian
pub fn encode_write_multiple(slave: u8, start: u16, values: &[u16]) -> Result<Vec<u8>> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
        return Err(LinkError::validation(format!(
            "register count {} outside 1..={}",
            values.len(),
            MAX_WRITE_REGISTERS
        )));
    }
    let count = values.len() as u16;
    let mut frame = Vec::with_capacity(9 + values.len() * 2);
    frame.push(slave);
    frame.push(FC_WRITE_MULTIPLE);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame.push((values.len() * 2) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    append_crc(&mut frame);
    Ok(frame)
}

/// Verify the CRC trailer and return everything before it (slave id first)
pub fn decode(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < MIN_RESPONSE_LEN {
        return Err(LinkError::frame(format!(
            "response too short: {} bytes",
            raw.len()
        )));
    }
    let (payload, trailer) = raw.split_at(raw.len() - 2);
    let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
    let expected = crc16(payload);
    if expected != actual {
        return Err(LinkError::CrcMismatch { expected, actual });
    }
    Ok(payload.to_vec())
}

/// Reject a reply echoed by a different board than the one addressed
pub fn check_slave(payload: &[u8], slave: u8) -> Result<()> {
    match payload.first() {
        Some(&echoed) if echoed == slave => Ok(()),
        Some(&echoed) => Err(LinkError::unexpected(format!(
            "reply from slave {}, expected {}",
            echoed, slave
        ))),
        None => Err(LinkError::frame("response missing slave id")),
    }
}

fn check_function(payload: &[u8], function: u8) -> Result<()> {
    if payload.len() < 2 {
        return Err(LinkError::frame("response missing function code"));
    }
    let echoed = payload[1];
    if echoed == function | EXCEPTION_FLAG {
        let code = payload.get(2).copied().unwrap_or(0);
        return Err(LinkError::DeviceFault { code });
    }
    if echoed != function {
        return Err(LinkError::unexpected(format!(
            "function code 0x{:02X}, expected 0x{:02X}",
            echoed, function
        )));
    }
    Ok(())
}

/// Register values of a decoded read-holding-registers response
pub fn parse_read_response(payload: &[u8], slave: u8, expected_count: usize) -> Result<Vec<u16>> {
    check_slave(payload, slave)?;
    check_function(payload, FC_READ_HOLDING)?;
    if payload.len() < 3 {
        return Err(LinkError::frame("read response missing byte count"));
    }
    let byte_count = usize::from(payload[2]);
    let data = &payload[3..];
    if data.len() < byte_count {
        return Err(LinkError::frame(format!(
            "byte count {} but {} data bytes",
            byte_count,
            data.len()
        )));
    }
    let registers: Vec<u16> = data[..byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    if registers.len() < expected_count {
        return Err(LinkError::unexpected(format!(
            "{} registers returned, {} requested",
            registers.len(),
            expected_count
        )));
    }
    Ok(registers)
}

/// Accept a decoded write-multiple-registers response
pub fn parse_write_response(payload: &[u8], slave: u8) -> Result<()> {
    check_slave(payload, slave)?;
    check_function(payload, FC_WRITE_MULTIPLE)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn with_crc(mut bytes: Vec<u8>) -> Vec<u8> {
        append_crc(&mut bytes);
        bytes
    }

    #[test]
    fn test_crc_reference_vector() {
        // 01 03 00 00 00 01 84 0A
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        let frame = with_crc(vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&frame[6..], &[0x84, 0x0A]);
    }

    #[test]
    fn test_encode_read_holding_layout() {
        let frame = encode_read_holding(0x01, 0x8010, 32).unwrap();
        assert_eq!(&frame[..5], &[0x01, 0x03, 0x80, 0x10, 0x20]);
        assert_eq!(frame.len(), 7);
        assert!(decode(&frame).is_ok());
        assert!(encode_read_holding(0x01, 0x8010, 0).is_err());
    }

    #[test]
    fn test_encode_write_multiple_layout() {
        let frame = encode_write_multiple(0x02, 0x8005, &[0x0000, 0x1234]).unwrap();
        assert_eq!(
            &frame[..11],
            &[0x02, 0x10, 0x80, 0x05, 0x00, 0x02, 0x04, 0x00, 0x00, 0x12, 0x34]
        );
        assert_eq!(frame.len(), 13);
        assert!(encode_write_multiple(0x02, 0x8005, &[]).is_err());
        assert!(encode_write_multiple(0x02, 0x8005, &[0; MAX_WRITE_REGISTERS + 1]).is_err());
    }

    #[test]
    fn test_decode_read_voltages_end_to_end() {
        let request = encode_read_holding(0x01, 0x8010, 2).unwrap();
        assert_eq!(&request[..5], &[0x01, 0x03, 0x80, 0x10, 0x02]);

        let response = with_crc(vec![0x01, 0x03, 0x04, 0x01, 0xF4, 0x03, 0xE8]);
        let payload = decode(&response).unwrap();
        let registers = parse_read_response(&payload, 0x01, 2).unwrap();
        assert_eq!(registers, vec![0x01F4, 0x03E8]);
    }

    #[test]
    fn test_write_response_bit_flips_fail_crc() {
        let response = with_crc(vec![0x01, 0x10, 0x80, 0x50, 0x00, 0x20]);
        let payload = decode(&response).unwrap();
        assert!(parse_write_response(&payload, 0x01).is_ok());

        for byte in 0..response.len() - 2 {
            for bit in 0..8 {
                let mut corrupted = response.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    matches!(decode(&corrupted), Err(LinkError::CrcMismatch { .. })),
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(decode(&[0x01, 0x03]), Err(LinkError::FrameIntegrity(_))));
    }

    #[test]
    fn test_exception_response_is_device_fault() {
        let payload = decode(&with_crc(vec![0x01, 0x83, 0x02])).unwrap();
        assert_eq!(
            parse_read_response(&payload, 0x01, 1),
            Err(LinkError::DeviceFault { code: 0x02 })
        );
    }

    #[test]
    fn test_read_response_inconsistent_lengths() {
        // byte count 4, only 2 data bytes
        let payload = decode(&with_crc(vec![0x01, 0x03, 0x04, 0x00, 0x01])).unwrap();
        assert!(matches!(
            parse_read_response(&payload, 0x01, 2),
            Err(LinkError::FrameIntegrity(_))
        ));

        // fewer registers than requested
        let payload = decode(&with_crc(vec![0x01, 0x03, 0x02, 0x00, 0x01])).unwrap();
        assert!(matches!(
            parse_read_response(&payload, 0x01, 2),
            Err(LinkError::UnexpectedResponse(_))
        ));

        // wrong function echoed
        let payload = decode(&with_crc(vec![0x01, 0x10, 0x02, 0x00, 0x01])).unwrap();
        assert!(matches!(
            parse_read_response(&payload, 0x01, 1),
            Err(LinkError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_reply_from_other_slave_rejected() {
        let payload = decode(&with_crc(vec![0x02, 0x03, 0x02, 0x00, 0x01])).unwrap();
        assert!(matches!(
            parse_read_response(&payload, 0x01, 1),
            Err(LinkError::UnexpectedResponse(_))
        ));
        assert_eq!(parse_read_response(&payload, 0x02, 1).unwrap(), vec![0x0001]);

        let payload = decode(&with_crc(vec![0x05, 0x10, 0x80, 0x00, 0x00, 0x01])).unwrap();
        assert!(parse_write_response(&payload, 0x01).is_err());
        assert!(parse_write_response(&payload, 0x05).is_ok());
    }
}
