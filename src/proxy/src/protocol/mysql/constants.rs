use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use strum_macros::AsRefStr;

// max packet payload length; a payload of exactly this size is continued
// in the next packet.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// auth-plugin-data-part-1: the first 8 bytes of the scramble.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;
/// Full scramble length (auth-plugin-data-part-1 + auth-plugin-data-part-2).
pub const SCRAMBLE_SIZE: usize = 20;

/// Offset of the 4-byte statement id in COM_STMT_* payloads (after the command byte).
pub const PS_ID_OFFSET: usize = 1;
pub const PS_ID_SIZE: usize = 4;

/// Statement id used by MariaDB for direct execution without a prior prepare.
pub const PS_DIRECT_EXEC_ID: u32 = 0xFFFF_FFFF;

/// The capability section of an SSLRequest / handshake response packet.
pub const CAPS_SECTION_SIZE: usize = 32;

pub const MYSQL_PROTOCOL_VERSION: u8 = 10;

#[derive(Debug, PartialEq, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "auth_unknown_plugin")]
    UnKnowPluginName,
}

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
    LocalInFileHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

impl CommandCode {
    pub fn from_byte(byte: u8) -> Option<CommandCode> {
        CommandCode::from_u8(byte)
    }

    /// Commands that refer to a prepared statement through the 4-byte id
    /// right after the command byte.
    pub fn is_ps_command(byte: u8) -> bool {
        matches!(
            CommandCode::from_u8(byte),
            Some(
                CommandCode::ComStmtExecute
                    | CommandCode::ComStmtSendLongData
                    | CommandCode::ComStmtClose
                    | CommandCode::ComStmtReset
                    | CommandCode::ComStmtFetch
            )
        )
    }

    /// Whether the server sends any response at all for this command.
    pub fn will_respond(byte: u8) -> bool {
        !matches!(
            CommandCode::from_u8(byte),
            Some(
                CommandCode::ComStmtSendLongData
                    | CommandCode::ComStmtClose
                    | CommandCode::ComQuit
            )
        )
    }

    pub fn is_binlog_dump(byte: u8) -> bool {
        matches!(
            CommandCode::from_u8(byte),
            Some(CommandCode::ComBinlogDump | CommandCode::ComBinlogDumpGtid)
        )
    }
}

pub fn cmd_to_string(byte: u8) -> &'static str {
    match CommandCode::from_u8(byte) {
        Some(CommandCode::ComSleep) => "COM_SLEEP",
        Some(CommandCode::ComQuit) => "COM_QUIT",
        Some(CommandCode::ComInitDB) => "COM_INIT_DB",
        Some(CommandCode::ComQuery) => "COM_QUERY",
        Some(CommandCode::ComFieldList) => "COM_FIELD_LIST",
        Some(CommandCode::ComCreateDB) => "COM_CREATE_DB",
        Some(CommandCode::ComDropDB) => "COM_DROP_DB",
        Some(CommandCode::ComRefresh) => "COM_REFRESH",
        Some(CommandCode::ComShutdown) => "COM_SHUTDOWN",
        Some(CommandCode::ComStatistics) => "COM_STATISTICS",
        Some(CommandCode::ComProcessInfo) => "COM_PROCESS_INFO",
        Some(CommandCode::ComConnect) => "COM_CONNECT",
        Some(CommandCode::ComProcessKill) => "COM_PROCESS_KILL",
        Some(CommandCode::ComDebug) => "COM_DEBUG",
        Some(CommandCode::ComPing) => "COM_PING",
        Some(CommandCode::ComTime) => "COM_TIME",
        Some(CommandCode::ComDelayedInsert) => "COM_DELAYED_INSERT",
        Some(CommandCode::ComChangeUser) => "COM_CHANGE_USER",
        Some(CommandCode::ComBinlogDump) => "COM_BINLOG_DUMP",
        Some(CommandCode::ComTableDump) => "COM_TABLE_DUMP",
        Some(CommandCode::ComConnectOut) => "COM_CONNECT_OUT",
        Some(CommandCode::ComRegisterSlave) => "COM_REGISTER_SLAVE",
        Some(CommandCode::ComStmtPrepare) => "COM_STMT_PREPARE",
        Some(CommandCode::ComStmtExecute) => "COM_STMT_EXECUTE",
        Some(CommandCode::ComStmtSendLongData) => "COM_STMT_SEND_LONG_DATA",
        Some(CommandCode::ComStmtClose) => "COM_STMT_CLOSE",
        Some(CommandCode::ComStmtReset) => "COM_STMT_RESET",
        Some(CommandCode::ComSetOption) => "COM_SET_OPTION",
        Some(CommandCode::ComStmtFetch) => "COM_STMT_FETCH",
        Some(CommandCode::ComDaemon) => "COM_DAEMON",
        Some(CommandCode::ComBinlogDumpGtid) => "COM_BINLOG_DUMP_GTID",
        Some(CommandCode::ComResetConnection) => "COM_RESET_CONNECTION",
        Some(CommandCode::ComEnd) => "COM_END",
        None => "COM_UNKNOWN",
    }
}

bitflags::bitflags! {
    /// MariaDB 10.2+ extended capabilities, sent in place of the 4 reserved
    /// bytes of the handshake when CLIENT_MYSQL is not advertised.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MariaDbCapabilities: u32 {
        const MARIADB_CLIENT_PROGRESS = 1 << 0;
        const MARIADB_CLIENT_COM_MULTI = 1 << 1;
        const MARIADB_CLIENT_STMT_BULK_OPERATIONS = 1 << 2;
        const MARIADB_CLIENT_EXTENDED_METADATA = 1 << 3;
        const MARIADB_CLIENT_CACHE_METADATA = 1 << 4;
    }
}

/// Session state tracker TLV types attached to OK packets.
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive)]
#[repr(u8)]
pub enum SessionTrackType {
    SystemVariables = 0,
    Schema = 1,
    StateChange = 2,
    Gtids = 3,
    TransactionCharacteristics = 4,
    TransactionType = 5,
}

/// Key used for the tracked GTID position variable.
pub const LAST_GTID: &str = "last_gtid";

#[cfg(test)]
mod test {
    use crate::protocol::mysql::constants::*;

    #[test]
    pub fn max_packet_size_test() {
        let max_u24_size = 16_777_215;
        assert_eq!(max_u24_size, MAX_PAYLOAD_LEN);
    }

    #[test]
    pub fn test_command_classification() {
        assert!(CommandCode::is_ps_command(CommandCode::ComStmtExecute as u8));
        assert!(CommandCode::is_ps_command(CommandCode::ComStmtClose as u8));
        assert!(!CommandCode::is_ps_command(CommandCode::ComQuery as u8));
        assert!(CommandCode::will_respond(CommandCode::ComQuery as u8));
        assert!(!CommandCode::will_respond(CommandCode::ComStmtClose as u8));
        assert!(!CommandCode::will_respond(CommandCode::ComQuit as u8));
    }

    #[test]
    pub fn test_cmd_to_string() {
        assert_eq!(cmd_to_string(CommandCode::ComQuery as u8), "COM_QUERY");
        assert_eq!(cmd_to_string(0xf0), "COM_UNKNOWN");
    }
}
