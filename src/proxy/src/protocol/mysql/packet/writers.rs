use crate::protocol::mysql::constants::{
    AuthPluginName, CommandCode, MariaDbCapabilities, CAPS_SECTION_SIZE,
};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;

use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::CapabilityFlags;
use std::io::{self, Write};
use std::net::SocketAddr;
use tokio::io::AsyncWrite;

pub const MAX_PACKET_SIZE: u32 = 16_777_216;

/// The 32-byte capability section shared by SSLRequest and the handshake
/// response: caps u32, max-packet u32, collation u8, 19 zero bytes,
/// MariaDB extended caps u32.
pub fn caps_section(
    capabilities: CapabilityFlags,
    collation: u8,
    extra: MariaDbCapabilities,
) -> [u8; CAPS_SECTION_SIZE] {
    let mut section = [0u8; CAPS_SECTION_SIZE];
    section[..4].copy_from_slice(&capabilities.bits().to_le_bytes());
    section[4..8].copy_from_slice(&MAX_PACKET_SIZE.to_le_bytes());
    section[8] = collation;
    section[28..].copy_from_slice(&extra.bits().to_le_bytes());
    section
}

/// SSLRequest: just the capability section, written with seq=1 right after
/// the server handshake.
pub async fn write_ssl_request<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    capabilities: CapabilityFlags,
    collation: u8,
    extra: MariaDbCapabilities,
) -> io::Result<()> {
    w.set_seq(1);
    w.write_all(&caps_section(capabilities, collation, extra))?;
    w.end_packet().await?;
    w.flush_all().await
}

pub struct HandshakeResponseParams<'a> {
    pub capabilities: CapabilityFlags,
    pub extra_capabilities: MariaDbCapabilities,
    pub collation: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub db: &'a str,
    pub attributes: Option<&'a [u8]>,
}

/// The client handshake response sent to the backend. seq=2 when an
/// SSLRequest went out first, seq=1 otherwise.
pub async fn write_handshake_response<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    params: &HandshakeResponseParams<'_>,
    with_ssl: bool,
) -> io::Result<()> {
    w.set_seq(if with_ssl { 2 } else { 1 });
    w.write_all(&caps_section(
        params.capabilities,
        params.collation,
        params.extra_capabilities,
    ))?;
    w.write_all(params.user.as_bytes())?;
    w.write_all(&[0x00])?;
    w.write_u8(params.auth_response.len() as u8)?;
    w.write_all(params.auth_response)?;
    if !params.db.is_empty() {
        w.write_all(params.db.as_bytes())?;
        w.write_all(&[0x00])?;
    }
    w.write_all(AuthPluginName::AuthNativePassword.as_ref().as_bytes())?;
    w.write_all(&[0x00])?;
    if let Some(attrs) = params.attributes {
        if params
            .capabilities
            .contains(CapabilityFlags::CLIENT_CONNECT_ATTRS)
        {
            w.write_all(attrs)?;
        }
    }
    w.end_packet().await?;
    w.flush_all().await
}

pub struct ChangeUserParams<'a> {
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub db: &'a str,
    pub collation: u16,
    pub attributes: Option<&'a [u8]>,
    pub with_attributes: bool,
}

/// Build a COM_CHANGE_USER payload from the session's current credentials.
pub fn build_change_user(params: &ChangeUserParams<'_>) -> Vec<u8> {
    let mut payload = vec![CommandCode::ComChangeUser as u8];
    payload.extend_from_slice(params.user.as_bytes());
    payload.push(0x00);
    payload.push(params.auth_response.len() as u8);
    payload.extend_from_slice(params.auth_response);
    payload.extend_from_slice(params.db.as_bytes());
    payload.push(0x00);
    payload.extend_from_slice(&params.collation.to_le_bytes());
    payload.extend_from_slice(AuthPluginName::AuthNativePassword.as_ref().as_bytes());
    payload.push(0x00);
    if params.with_attributes {
        if let Some(attrs) = params.attributes {
            payload.extend_from_slice(attrs);
        }
    }
    payload
}

pub fn build_reset_connection() -> Vec<u8> {
    vec![CommandCode::ComResetConnection as u8]
}

pub fn build_com_query(sql: &str) -> Vec<u8> {
    let mut payload = vec![CommandCode::ComQuery as u8];
    payload.extend_from_slice(sql.as_bytes());
    payload
}

/// ERR packet payload with the '#'-prefixed sqlstate, e.g. the synthesized
/// unknown-prepared-statement error.
pub fn build_err_payload(err: ErrorKind, msg: &str) -> Vec<u8> {
    let mut payload = vec![0xff];
    payload.extend_from_slice(&(err as u16).to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(err.sqlstate());
    payload.extend_from_slice(msg.as_bytes());
    payload
}

pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(err as u16)?;
    w.write_u8(b'#')?;
    w.write_all(err.sqlstate())?;
    w.write_all(msg)?;
    w.end_packet().await
}

/// PROXY protocol v1 text line, sent before the handshake when the backend
/// is configured for it.
pub fn proxy_protocol_v1(client: SocketAddr, server: SocketAddr) -> String {
    let family = if client.is_ipv4() { "TCP4" } else { "TCP6" };
    format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        client.ip(),
        server.ip(),
        client.port(),
        server.port()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_section_layout() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_SESSION_TRACK;
        let section = caps_section(caps, 45, MariaDbCapabilities::MARIADB_CLIENT_CACHE_METADATA);
        assert_eq!(section.len(), 32);
        assert_eq!(&section[..4], &caps.bits().to_le_bytes());
        assert_eq!(&section[4..8], &16_777_216u32.to_le_bytes());
        assert_eq!(section[8], 45);
        assert_eq!(&section[9..28], &[0u8; 19]);
        assert_eq!(&section[28..], &(1u32 << 4).to_le_bytes());
    }

    #[test]
    fn test_change_user_payload() {
        let payload = build_change_user(&ChangeUserParams {
            user: "app",
            auth_response: &[0xaa; 20],
            db: "orders",
            collation: 45,
            attributes: None,
            with_attributes: false,
        });
        assert_eq!(payload[0], CommandCode::ComChangeUser as u8);
        assert_eq!(&payload[1..5], b"app\0");
        assert_eq!(payload[5], 20);
        assert_eq!(&payload[26..33], b"orders\0");
    }

    #[test]
    fn test_err_payload() {
        let payload = build_err_payload(ErrorKind::ER_UNKNOWN_STMT_HANDLER, "boom");
        assert_eq!(payload[0], 0xff);
        assert_eq!(u16::from_le_bytes([payload[1], payload[2]]), 1243);
        assert_eq!(payload[3], b'#');
        assert_eq!(&payload[4..9], b"HY000");
        assert_eq!(&payload[9..], b"boom");
    }

    #[test]
    fn test_proxy_protocol_line() {
        let line = proxy_protocol_v1(
            "10.0.0.1:5531".parse().unwrap(),
            "10.0.0.2:3306".parse().unwrap(),
        );
        assert_eq!(line, "PROXY TCP4 10.0.0.1 10.0.0.2 5531 3306\r\n");
    }
}
