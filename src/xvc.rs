//! XVC line protocol: byte-exact parsing of the `getinfo:`/`settck:`/`shift:`
//! command stream and the replies to send back.
//!
//! Dispatch is character-at-a-time: the first byte picks `s` vs `g`, the
//! second byte disambiguates `settck:` from `shift:`. Any literal mismatch
//! is fatal for the connection.

use std::io::Read;

use crate::chunker::{self, XVC_BUFFER_SIZE};
use crate::error::{Result, XvcdError};

/// A fully parsed XVC request.
pub enum Command {
    GetInfo,
    SetTck { period_ns: u32 },
    Shift { n_bits: u32, tms: Vec<u8>, tdi: Vec<u8> },
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            XvcdError::UnexpectedEof
        } else {
            XvcdError::Io(e)
        }
    })
}

/// Reads and matches `literal` byte-for-byte, failing with `LiteralMismatch`
/// on the first byte that differs.
fn expect_literal(reader: &mut impl Read, literal: &[u8]) -> Result<()> {
    let mut byte = [0u8; 1];
    for &expected in literal {
        read_exact_or_eof(reader, &mut byte)?;
        if byte[0] != expected {
            return Err(XvcdError::LiteralMismatch { expected, got: byte[0] });
        }
    }
    Ok(())
}

fn read_u32_le(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact_or_eof(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_vec(reader: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact_or_eof(reader, &mut buf)?;
    Ok(buf)
}

/// Reads one command from `reader`. Returns `Ok(None)` on a clean EOF at a
/// command boundary, `Err` on any framing violation mid-command.
pub fn read_command(reader: &mut impl Read) -> Result<Option<Command>> {
    let mut first = [0u8; 1];
    let n = reader.read(&mut first).map_err(XvcdError::Io)?;
    if n == 0 {
        return Ok(None);
    }

    match first[0] {
        b's' => {
            let mut second = [0u8; 1];
            read_exact_or_eof(reader, &mut second)?;
            match second[0] {
                b'e' => {
                    expect_literal(reader, b"ttck:")?;
                    let period_ns = read_u32_le(reader)?;
                    Ok(Some(Command::SetTck { period_ns }))
                }
                b'h' => {
                    expect_literal(reader, b"ift:")?;
                    let n_bits = read_u32_le(reader)?;
                    let byte_len = chunker::validate_bit_count(n_bits as usize)?;
                    let tms = read_vec(reader, byte_len)?;
                    let tdi = read_vec(reader, byte_len)?;
                    Ok(Some(Command::Shift { n_bits, tms, tdi }))
                }
                other => Err(XvcdError::UnexpectedChar(other)),
            }
        }
        b'g' => {
            expect_literal(reader, b"etinfo:")?;
            Ok(Some(Command::GetInfo))
        }
        other => Err(XvcdError::UnexpectedChar(other)),
    }
}

/// The fixed `getinfo:` reply.
pub fn getinfo_reply() -> Vec<u8> {
    format!("xvcServer_v1.0:{XVC_BUFFER_SIZE}\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_getinfo() {
        let mut cursor = Cursor::new(b"getinfo:".to_vec());
        match read_command(&mut cursor).unwrap() {
            Some(Command::GetInfo) => {}
            _ => panic!("expected GetInfo"),
        }
    }

    #[test]
    fn getinfo_reply_has_expected_format() {
        assert_eq!(getinfo_reply(), b"xvcServer_v1.0:1024\n".to_vec());
    }

    #[test]
    fn parses_settck() {
        let mut bytes = b"settck:".to_vec();
        bytes.extend_from_slice(&1_000_000_000u32.to_le_bytes());
        let mut cursor = Cursor::new(bytes);
        match read_command(&mut cursor).unwrap() {
            Some(Command::SetTck { period_ns }) => assert_eq!(period_ns, 1_000_000_000),
            _ => panic!("expected SetTck"),
        }
    }

    #[test]
    fn parses_shift() {
        let mut bytes = b"shift:".to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(0x00);
        bytes.push(0x01);
        let mut cursor = Cursor::new(bytes);
        match read_command(&mut cursor).unwrap() {
            Some(Command::Shift { n_bits, tms, tdi }) => {
                assert_eq!(n_bits, 1);
                assert_eq!(tms, vec![0x00]);
                assert_eq!(tdi, vec![0x01]);
            }
            _ => panic!("expected Shift"),
        }
    }

    #[test]
    fn rejects_oversize_shift() {
        let mut bytes = b"shift:".to_vec();
        bytes.extend_from_slice(&8257u32.to_le_bytes());
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(read_command(&mut cursor), Err(XvcdError::PayloadTooLarge { .. })));
    }

    #[test]
    fn clean_eof_at_boundary_is_none() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_command(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn mismatched_literal_is_fatal() {
        let mut cursor = Cursor::new(b"sextck:".to_vec());
        assert!(matches!(read_command(&mut cursor), Err(XvcdError::LiteralMismatch { .. })));
    }

    #[test]
    fn unknown_first_byte_is_fatal() {
        let mut cursor = Cursor::new(b"zzz".to_vec());
        assert!(matches!(read_command(&mut cursor), Err(XvcdError::UnexpectedChar(b'z'))));
    }
}
