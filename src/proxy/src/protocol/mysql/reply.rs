use crate::error::{ProxyError, Result};
use crate::protocol::mysql::basic::{self, read_length_encoded_number, read_length_encoded_string};
use crate::protocol::mysql::constants::{
    cmd_to_string, CommandCode, MariaDbCapabilities, MAX_PAYLOAD_LEN,
};

use mysql_common::constants::{CapabilityFlags, StatusFlags};

/// EOF packet payload length (0xfe + warnings u16 + status u16).
const EOF_PAYLOAD_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Start,
    RsetColDef,
    RsetColDefEof,
    RsetRows,
    LoadData,
    Prepare,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplyError {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

/// Accumulator for the server response currently being processed.
#[derive(Debug, Clone)]
pub struct Reply {
    pub command: u8,
    pub state: ReplyState,
    pub is_ok: bool,
    pub server_status: StatusFlags,
    pub warnings: u16,
    pub field_counts: Vec<u64>,
    pub rows_read: u64,
    pub generated_id: u32,
    pub param_count: u16,
    pub error: Option<ReplyError>,
    pub variables: Vec<(String, String)>,
    pub schema: Option<String>,
    pub upload_bytes: u64,
    pub row_data: Vec<Vec<String>>,
    pub(crate) multiresult: bool,
}

impl Default for Reply {
    fn default() -> Self {
        Reply {
            command: 0,
            state: ReplyState::Done,
            is_ok: false,
            server_status: StatusFlags::empty(),
            warnings: 0,
            field_counts: Vec::new(),
            rows_read: 0,
            generated_id: 0,
            param_count: 0,
            error: None,
            variables: Vec::new(),
            schema: None,
            upload_bytes: 0,
            row_data: Vec::new(),
            multiresult: false,
        }
    }
}

impl Reply {
    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }

    pub fn is_resultset(&self) -> bool {
        !self.field_counts.is_empty()
    }

    pub fn is_multiresult(&self) -> bool {
        self.multiresult
    }

    pub fn command_str(&self) -> &'static str {
        cmd_to_string(self.command)
    }
}

/// Streaming state machine consuming complete server packets, in order, and
/// accumulating the `Reply` for the in-flight request.
pub struct ReplyTracker {
    reply: Reply,
    capabilities: CapabilityFlags,
    extra_capabilities: MariaDbCapabilities,
    num_coldefs: u64,
    ps_packets: u32,
    opening_cursor: bool,
    collect_rows: bool,
    external_ps_id: u32,
    real_ps_id: u32,
}

impl ReplyTracker {
    pub fn new(capabilities: CapabilityFlags, extra_capabilities: MariaDbCapabilities) -> Self {
        ReplyTracker {
            reply: Reply::default(),
            capabilities,
            extra_capabilities,
            num_coldefs: 0,
            ps_packets: 0,
            opening_cursor: false,
            collect_rows: false,
            external_ps_id: 0,
            real_ps_id: 0,
        }
    }

    pub fn set_capabilities(
        &mut self,
        capabilities: CapabilityFlags,
        extra_capabilities: MariaDbCapabilities,
    ) {
        self.capabilities = capabilities;
        self.extra_capabilities = extra_capabilities;
    }

    fn use_deprecate_eof(&self) -> bool {
        self.capabilities
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn is_complete(&self) -> bool {
        self.reply.is_complete()
    }

    /// The id the server assigned to the last COM_STMT_PREPARE.
    pub fn real_ps_id(&self) -> u32 {
        self.real_ps_id
    }

    pub fn add_upload_bytes(&mut self, n: u64) {
        self.reply.upload_bytes += n;
    }

    /// Begin tracking the response for a freshly written request.
    pub fn start(
        &mut self,
        command: u8,
        collect_rows: bool,
        opening_cursor: bool,
        external_ps_id: u32,
    ) {
        self.reply = Reply {
            command,
            ..Default::default()
        };
        self.num_coldefs = 0;
        self.ps_packets = 0;
        self.collect_rows = collect_rows;
        self.opening_cursor = false;
        self.external_ps_id = external_ps_id;

        if CommandCode::will_respond(command) {
            self.reply.state = ReplyState::Start;
        }

        match CommandCode::from_byte(command) {
            Some(CommandCode::ComStmtExecute) => self.opening_cursor = opening_cursor,
            // Rows come straight away, there are no column definitions.
            Some(CommandCode::ComStmtFetch) => self.reply.state = ReplyState::RsetRows,
            _ => {}
        }
    }

    /// Consume one complete logical packet of the response.
    pub fn process(&mut self, payload: &mut [u8]) -> Result<()> {
        let cmd = payload.first().copied().unwrap_or(0);

        match self.reply.state {
            ReplyState::Start => self.process_reply_start(payload)?,

            ReplyState::LoadData => {
                if cmd == 0xff {
                    self.update_error(payload)?;
                    self.reply.state = ReplyState::Done;
                } else if cmd == 0x00 {
                    self.process_ok_packet(payload)?;
                    if self.reply.state != ReplyState::Done {
                        // more results follow the completed upload
                        self.reply.state = ReplyState::Start;
                    }
                } else {
                    return Err(ProxyError::Protocol(format!(
                        "unexpected response to LOAD DATA LOCAL INFILE: 0x{cmd:02x}"
                    )));
                }
            }

            ReplyState::Done => {
                if cmd == 0xff {
                    self.update_error(payload)?;
                } else {
                    return Err(ProxyError::Protocol(format!(
                        "packet 0x{cmd:02x} received with no response in flight"
                    )));
                }
            }

            ReplyState::RsetColDef => {
                debug_assert!(self.num_coldefs > 0);
                self.num_coldefs -= 1;
                if self.num_coldefs == 0 {
                    self.reply.state = if self.use_deprecate_eof() {
                        ReplyState::RsetRows
                    } else {
                        ReplyState::RsetColDefEof
                    };
                }
            }

            ReplyState::RsetColDefEof => {
                if cmd != 0xfe || payload.len() != EOF_PAYLOAD_LEN {
                    return Err(ProxyError::Protocol(
                        "expected EOF after column definitions".into(),
                    ));
                }
                let (_, (warnings, status)) = basic::eof_server_status(payload)
                    .map_err(|e| ProxyError::Protocol(format!("bad EOF packet: {e:?}")))?;
                self.reply.warnings = warnings;
                self.reply.server_status = status;
                self.reply.state = ReplyState::RsetRows;

                if self.opening_cursor {
                    self.opening_cursor = false;
                    // The cursor does not exist if the result has only one row.
                    if status.contains(StatusFlags::SERVER_STATUS_CURSOR_EXISTS) {
                        self.reply.state = ReplyState::Done;
                    }
                }
            }

            ReplyState::RsetRows => {
                if cmd == 0xfe && payload.len() == EOF_PAYLOAD_LEN {
                    let (_, (warnings, status)) = basic::eof_server_status(payload)
                        .map_err(|e| ProxyError::Protocol(format!("bad EOF packet: {e:?}")))?;
                    self.reply.warnings = warnings;
                    self.reply.server_status = status;
                    let more = status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS);
                    self.reply.multiresult |= more;
                    self.reply.state = if more {
                        ReplyState::Start
                    } else {
                        ReplyState::Done
                    };
                } else if cmd == 0xfe && payload.len() < MAX_PAYLOAD_LEN {
                    // OK packet pretending to be an EOF packet
                    self.process_ok_packet(payload)?;
                    if self.reply.state != ReplyState::Done {
                        self.reply.state = ReplyState::Start;
                    }
                } else if cmd == 0xff {
                    self.update_error(payload)?;
                    self.reply.state = ReplyState::Done;
                } else {
                    self.reply.rows_read += 1;
                    if self.collect_rows {
                        self.collect_row(payload)?;
                    }
                }
            }

            ReplyState::Prepare => {
                if self.use_deprecate_eof() || cmd == 0xfe {
                    self.ps_packets -= 1;
                    if self.ps_packets == 0 {
                        self.reply.state = ReplyState::Done;
                    }
                }
            }
        }

        Ok(())
    }

    fn process_reply_start(&mut self, payload: &mut [u8]) -> Result<()> {
        let command = self.reply.command;

        if CommandCode::is_binlog_dump(command) {
            // A binlog dump is a response that never ends.
            return Ok(());
        }

        if command == CommandCode::ComStatistics as u8 {
            // COM_STATISTICS returns a single string without any framing.
            self.reply.state = ReplyState::Done;
            return Ok(());
        }

        if command == CommandCode::ComFieldList as u8 && payload.first() != Some(&0xff) {
            // COM_FIELD_LIST sends a result set without field definitions.
            self.reply.state = ReplyState::RsetRows;
            return Ok(());
        }

        self.process_result_start(payload)
    }

    fn process_result_start(&mut self, payload: &mut [u8]) -> Result<()> {
        match payload.first().copied() {
            Some(0x00) => {
                self.reply.is_ok = true;
                if self.reply.command == CommandCode::ComStmtPrepare as u8 {
                    self.process_ps_response(payload)
                } else {
                    self.process_ok_packet(payload)
                }
            }
            Some(0xfb) => {
                // The client uploads the file contents next; the server ends
                // the exchange with an OK or an ERR.
                self.reply.state = ReplyState::LoadData;
                Ok(())
            }
            Some(0xff) => {
                self.update_error(payload)?;
                self.reply.state = ReplyState::Done;
                Ok(())
            }
            Some(0xfe) if payload.len() < 9 => {
                // The server answers COM_SET_OPTION with an EOF packet even
                // though the documentation promises an OK.
                if self.reply.command == CommandCode::ComSetOption as u8 {
                    if payload.len() == EOF_PAYLOAD_LEN {
                        let (_, (warnings, status)) = basic::eof_server_status(payload)
                            .map_err(|e| ProxyError::Protocol(format!("bad EOF packet: {e:?}")))?;
                        self.reply.warnings = warnings;
                        self.reply.server_status = status;
                    }
                    self.reply.is_ok = true;
                    self.reply.state = ReplyState::Done;
                    Ok(())
                } else {
                    Err(ProxyError::Protocol(format!(
                        "unexpected EOF as first response to {}",
                        self.reply.command_str()
                    )))
                }
            }
            Some(_) => {
                // Start of a result set: the first byte chain is the
                // length-encoded column count.
                let (rest, count) = read_length_encoded_number(payload)
                    .map_err(|e| ProxyError::Protocol(format!("bad column count: {e:?}")))?;
                self.num_coldefs = count;
                self.reply.field_counts.push(count);

                // with metadata caching a flag byte follows the count; zero
                // means the column definitions are not resent
                let skip_metadata = self
                    .extra_capabilities
                    .contains(MariaDbCapabilities::MARIADB_CLIENT_CACHE_METADATA)
                    && rest.first() == Some(&0);
                self.reply.state = if skip_metadata {
                    if self.use_deprecate_eof() {
                        ReplyState::RsetRows
                    } else {
                        ReplyState::RsetColDefEof
                    }
                } else {
                    ReplyState::RsetColDef
                };
                Ok(())
            }
            None => Err(ProxyError::Protocol("empty response packet".into())),
        }
    }

    fn process_ok_packet(&mut self, payload: &[u8]) -> Result<()> {
        let (_, ok) = basic::ok_packet(payload, self.capabilities)
            .map_err(|e| ProxyError::Protocol(format!("bad OK packet: {e:?}")))?;

        self.reply.is_ok = true;
        self.reply.server_status = ok.status_flags;
        self.reply.warnings = ok.warnings;
        self.reply.variables.extend(ok.variables);
        if ok.schema.is_some() {
            self.reply.schema = ok.schema;
        }

        let more = ok
            .status_flags
            .contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS);
        self.reply.multiresult |= more;
        if !more {
            self.reply.state = ReplyState::Done;
        }
        Ok(())
    }

    /// COM_STMT_PREPARE response header:
    /// [0] 0x00, [1-4] statement id, [5-6] columns, [7-8] params,
    /// [9] filler, [10-11] warnings. The id is remapped in place to the
    /// session-global external id so the client only ever sees that one.
    fn process_ps_response(&mut self, payload: &mut [u8]) -> Result<()> {
        if payload.len() < 12 {
            return Err(ProxyError::Protocol("short COM_STMT_PREPARE response".into()));
        }

        self.real_ps_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        payload[1..5].copy_from_slice(&self.external_ps_id.to_le_bytes());

        let columns = u16::from_le_bytes([payload[5], payload[6]]);
        let params = u16::from_le_bytes([payload[7], payload[8]]);
        self.reply.warnings = u16::from_le_bytes([payload[10], payload[11]]);

        self.reply.generated_id = self.external_ps_id;
        self.reply.param_count = params;

        // With DEPRECATE_EOF the definition packets themselves are counted;
        // without it each non-empty group ends in one EOF packet.
        self.ps_packets = 0;
        if columns > 0 {
            self.ps_packets += if self.use_deprecate_eof() {
                columns as u32
            } else {
                1
            };
        }
        if params > 0 {
            self.ps_packets += if self.use_deprecate_eof() {
                params as u32
            } else {
                1
            };
        }

        self.reply.state = if self.ps_packets == 0 {
            ReplyState::Done
        } else {
            ReplyState::Prepare
        };
        Ok(())
    }

    fn collect_row(&mut self, payload: &[u8]) -> Result<()> {
        let fields = *self.reply.field_counts.last().unwrap_or(&0);
        let mut row = Vec::with_capacity(fields as usize);
        let mut rest = payload;
        for _ in 0..fields {
            if rest.first() == Some(&0xfb) {
                row.push(String::new());
                rest = &rest[1..];
                continue;
            }
            let (i, value) = read_length_encoded_string(rest)
                .map_err(|e| ProxyError::Protocol(format!("bad row field: {e:?}")))?;
            row.push(String::from_utf8_lossy(value).to_string());
            rest = i;
        }
        self.reply.row_data.push(row);
        Ok(())
    }

    fn update_error(&mut self, payload: &[u8]) -> Result<()> {
        let (_, err) = basic::err_packet(payload)
            .map_err(|e| ProxyError::Protocol(format!("bad ERR packet: {e:?}")))?;
        self.reply.error = Some(ReplyError {
            code: err.code,
            sqlstate: err.sqlstate,
            message: err.message,
        });
        Ok(())
    }
}
