use crate::protocol::mysql::constants::{
    MariaDbCapabilities, SessionTrackType, LAST_GTID, MYSQL_PROTOCOL_VERSION, SCRAMBLE_SIZE,
};

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use num_traits::FromPrimitive;
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};

/// Bit 0 of the capability mask. MariaDB reads it as "this is a MySQL
/// server"; when it is clear the 4 reserved handshake bytes carry the
/// MariaDB extended capabilities.
pub const CLIENT_MYSQL: CapabilityFlags = CapabilityFlags::CLIENT_LONG_PASSWORD;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    pub header: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: StatusFlags,
    pub warnings: u16,
    pub info: String,
    /// Session-tracker key/value pairs decoded from the trailing TLVs.
    pub variables: Vec<(String, String)>,
    pub schema: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrPacketBody {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

/// The server's initial handshake (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub server_version: String,
    pub thread_id: u32,
    pub capabilities: CapabilityFlags,
    pub extra_capabilities: MariaDbCapabilities,
    pub default_collation: u8,
    pub server_status: StatusFlags,
    pub scramble: [u8; SCRAMBLE_SIZE],
    pub auth_plugin: Vec<u8>,
}

pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

pub fn read_length_encoded_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = read_length_encoded_number(i)?;
    take(len).parse_peek(input)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

pub fn eof_server_status(i: &[u8]) -> IResult<&[u8], (u16, StatusFlags)> {
    // 0xfe, warnings u16, status u16
    let (i, _) = le_u8.parse_peek(i)?;
    let (i, warnings) = le_u16.parse_peek(i)?;
    let (i, status_code) = le_u16.parse_peek(i)?;
    Ok((i, (warnings, StatusFlags::from_bits_truncate(status_code))))
}

pub fn ok_packet(i: &[u8], capabilities: CapabilityFlags) -> IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = read_length_encoded_number(i)?;
    let (i, last_insert_id) = read_length_encoded_number(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;
    let status_flags = StatusFlags::from_bits_retain(status_flags_value);
    let (i, warnings) = le_u16.parse_peek(i)?;

    let mut ok = OkPacket {
        header,
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        ..Default::default()
    };

    if i.is_empty() || !capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
        ok.info = lossy(i);
        return Ok((&b""[..], ok));
    }

    let (i, info) = read_length_encoded_string(i)?;
    ok.info = lossy(info);

    let mut i = i;
    if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) && !i.is_empty() {
        let (rest, state_info_len) = read_length_encoded_number(i)?;
        let (rest, mut state_info) = take(state_info_len).parse_peek(rest)?;
        i = rest;

        while !state_info.is_empty() {
            let (body_rest, tlv_type) = le_u8.parse_peek(state_info)?;
            let (body_rest, body) = read_length_encoded_string(body_rest)?;
            state_info = body_rest;

            match SessionTrackType::from_u8(tlv_type) {
                Some(SessionTrackType::SystemVariables) => {
                    let (value_rest, name) = read_length_encoded_string(body)?;
                    let (_, value) = read_length_encoded_string(value_rest)?;
                    ok.variables.push((lossy(name), lossy(value)));
                }
                Some(SessionTrackType::Schema) => {
                    let (_, schema) = read_length_encoded_string(body)?;
                    ok.schema = Some(lossy(schema));
                }
                Some(SessionTrackType::Gtids) => {
                    // encoding specification, then the GTID list itself
                    let (gtid_rest, _spec) = read_length_encoded_number(body)?;
                    let (_, gtid) = read_length_encoded_string(gtid_rest)?;
                    ok.variables.push((LAST_GTID.to_string(), lossy(gtid)));
                }
                Some(SessionTrackType::TransactionCharacteristics) => {
                    let (_, value) = read_length_encoded_string(body)?;
                    ok.variables
                        .push(("trx_characteristics".to_string(), lossy(value)));
                }
                Some(SessionTrackType::TransactionType) => {
                    let (_, value) = read_length_encoded_string(body)?;
                    ok.variables.push(("trx_state".to_string(), lossy(value)));
                }
                Some(SessionTrackType::StateChange) | None => {}
            }
        }
    }

    Ok((i, ok))
}

pub fn err_packet(i: &[u8]) -> IResult<&[u8], ErrPacketBody> {
    let (i, _) = literal([0xff]).parse_peek(i)?;
    let (i, code) = le_u16.parse_peek(i)?;
    let (i, sqlstate) = if i.first() == Some(&b'#') {
        let (i, _) = take(1u8).parse_peek(i)?;
        let (i, state) = take(5u8).parse_peek(i)?;
        (i, lossy(state))
    } else {
        (i, String::new())
    };
    Ok((
        &b""[..],
        ErrPacketBody {
            code,
            sqlstate,
            message: lossy(i),
        },
    ))
}

/// Decode the server's initial handshake packet. Only protocol version 10
/// is accepted.
pub fn server_handshake(i: &[u8]) -> IResult<&[u8], ServerHandshake> {
    let (i, _) = literal([MYSQL_PROTOCOL_VERSION]).parse_peek(i)?;
    let (i, version) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let (i, thread_id) = le_u32.parse_peek(i)?;
    let (i, scramble_1) = take(8u8).parse_peek(i)?;
    let (i, _filler) = take(1u8).parse_peek(i)?;
    let (i, caps_lo) = le_u16.parse_peek(i)?;
    let (i, collation) = le_u8.parse_peek(i)?;
    let (i, status) = le_u16.parse_peek(i)?;
    let (i, caps_hi) = le_u16.parse_peek(i)?;
    let (i, scramble_len_byte) = le_u8.parse_peek(i)?;
    let (i, _reserved) = take(6u8).parse_peek(i)?;

    let capabilities =
        CapabilityFlags::from_bits_truncate((caps_hi as u32) << 16 | caps_lo as u32);

    let (i, extra_capabilities) = if !capabilities.contains(CLIENT_MYSQL) {
        let (i, extra) = le_u32.parse_peek(i)?;
        (i, MariaDbCapabilities::from_bits_truncate(extra))
    } else {
        let (i, _) = take(4u8).parse_peek(i)?;
        (i, MariaDbCapabilities::empty())
    };

    let scramble_len = if scramble_len_byte > 0 {
        std::cmp::min(scramble_len_byte as usize - 1, SCRAMBLE_SIZE)
    } else {
        SCRAMBLE_SIZE
    };
    let part_2_len = std::cmp::max(12, scramble_len.saturating_sub(8));
    let (i, scramble_2) = take(part_2_len).parse_peek(i)?;

    let (i, auth_plugin) = if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        // skip the NUL terminator of the scramble if present
        let i = if i.first() == Some(&0) { &i[1..] } else { i };
        let plugin_rs: IResult<&[u8], &[u8]> = take_until(0.., "\0").parse_peek(i);
        match plugin_rs {
            Ok((i, plugin)) => (i, plugin.to_vec()),
            Err(_) => (&b""[..], i.to_vec()),
        }
    } else {
        (i, Vec::new())
    };

    let mut scramble = [0u8; SCRAMBLE_SIZE];
    scramble[..8].copy_from_slice(scramble_1);
    let tail = std::cmp::min(part_2_len, SCRAMBLE_SIZE - 8);
    scramble[8..8 + tail].copy_from_slice(&scramble_2[..tail]);

    Ok((
        i,
        ServerHandshake {
            server_version: lossy(version),
            thread_id,
            capabilities,
            extra_capabilities,
            default_collation: collation,
            server_status: StatusFlags::from_bits_truncate(status),
            scramble,
            auth_plugin,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lenenc_str(out: &mut Vec<u8>, s: &[u8]) {
        out.push(s.len() as u8);
        out.extend_from_slice(s);
    }

    #[test]
    fn test_lenenc_number() {
        assert_eq!(read_length_encoded_number(&[0x05]).unwrap().1, 5);
        assert_eq!(
            read_length_encoded_number(&[0xfc, 0x34, 0x12]).unwrap().1,
            0x1234
        );
        assert_eq!(
            read_length_encoded_number(&[0xfd, 0x01, 0x02, 0x03]).unwrap().1,
            0x030201
        );
        assert_eq!(
            read_length_encoded_number(&[0xfe, 1, 0, 0, 0, 0, 0, 0, 0])
                .unwrap()
                .1,
            1
        );
    }

    #[test]
    fn test_plain_ok_packet() {
        let bytes = [0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
        let (_, ok) = ok_packet(&bytes, CapabilityFlags::empty()).unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 0);
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));
        assert_eq!(ok.warnings, 0);
    }

    #[test]
    fn test_ok_packet_with_system_variable_tracker() {
        let mut bytes: Vec<u8> = vec![0x00, 0x00, 0x00];
        bytes.write_all(&0x4000u16.to_le_bytes()).unwrap(); // SESSION_STATE_CHANGED
        bytes.write_all(&[0x00, 0x00]).unwrap(); // warnings
        bytes.push(0); // empty info

        let mut tlv_body = Vec::new();
        lenenc_str(&mut tlv_body, b"autocommit");
        lenenc_str(&mut tlv_body, b"OFF");
        let mut state_info = vec![SessionTrackType::SystemVariables as u8];
        state_info.push(tlv_body.len() as u8);
        state_info.extend_from_slice(&tlv_body);
        bytes.push(state_info.len() as u8);
        bytes.extend_from_slice(&state_info);

        let (_, ok) = ok_packet(&bytes, CapabilityFlags::CLIENT_SESSION_TRACK).unwrap();
        assert_eq!(
            ok.variables,
            vec![("autocommit".to_string(), "OFF".to_string())]
        );
    }

    #[test]
    fn test_ok_packet_with_gtid_tracker() {
        let mut bytes: Vec<u8> = vec![0x00, 0x00, 0x00];
        bytes.write_all(&0x4000u16.to_le_bytes()).unwrap();
        bytes.write_all(&[0x00, 0x00]).unwrap();
        bytes.push(0);

        let mut tlv_body = vec![0x00]; // encoding specification
        lenenc_str(&mut tlv_body, b"0-1-42");
        let mut state_info = vec![SessionTrackType::Gtids as u8];
        state_info.push(tlv_body.len() as u8);
        state_info.extend_from_slice(&tlv_body);
        bytes.push(state_info.len() as u8);
        bytes.extend_from_slice(&state_info);

        let (_, ok) = ok_packet(&bytes, CapabilityFlags::CLIENT_SESSION_TRACK).unwrap();
        assert_eq!(ok.variables, vec![(LAST_GTID.to_string(), "0-1-42".to_string())]);
    }

    #[test]
    fn test_err_packet() {
        let mut bytes = vec![0xff];
        bytes.extend_from_slice(&1045u16.to_le_bytes());
        bytes.push(b'#');
        bytes.extend_from_slice(b"28000");
        bytes.extend_from_slice(b"Access denied");
        let (_, err) = err_packet(&bytes).unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.sqlstate, "28000");
        assert_eq!(err.message, "Access denied");
    }

    fn handshake_payload(caps: u32, scramble_len_byte: u8) -> Vec<u8> {
        let mut p = vec![10];
        p.extend_from_slice(b"11.4.2-MariaDB\0");
        p.extend_from_slice(&7u32.to_le_bytes()); // thread id
        p.extend_from_slice(b"abcdefgh"); // scramble part 1
        p.push(0);
        p.extend_from_slice(&(caps as u16).to_le_bytes());
        p.push(45); // collation
        p.extend_from_slice(&2u16.to_le_bytes()); // status: autocommit
        p.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        p.push(scramble_len_byte);
        p.extend_from_slice(&[0; 6]);
        p.extend_from_slice(&[0; 4]); // reserved / extra caps
        p.extend_from_slice(b"ijklmnopqrst"); // scramble part 2
        p.push(0);
        p.extend_from_slice(b"mysql_native_password\0");
        p
    }

    #[test]
    fn test_server_handshake_decode() {
        let caps = (CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_SECURE_CONNECTION)
            .bits();
        let payload = handshake_payload(caps, 21);
        let (_, hs) = server_handshake(&payload).unwrap();
        assert_eq!(hs.server_version, "11.4.2-MariaDB");
        assert_eq!(hs.thread_id, 7);
        assert_eq!(hs.default_collation, 45);
        assert_eq!(&hs.scramble[..8], b"abcdefgh");
        assert_eq!(&hs.scramble[8..], b"ijklmnopqrst");
        assert_eq!(hs.auth_plugin, b"mysql_native_password");
    }

    #[test]
    fn test_server_handshake_rejects_wrong_protocol() {
        let mut payload = handshake_payload(0, 21);
        payload[0] = 9;
        assert!(server_handshake(&payload).is_err());
    }
}
