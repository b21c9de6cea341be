use crate::backend::pool::{PooledSnapshot, ReuseType};
use crate::backend::{BackendState, PsInfo, ServerInfo, TrackedQuery, UserAccountCache};
use crate::error::{ProxyError, Result};
use crate::history::SubscriberId;
use crate::protocol::mysql::auth::AuthExchange;
use crate::protocol::mysql::basic::{self, ServerHandshake, CLIENT_MYSQL};
use crate::protocol::mysql::constants::{
    cmd_to_string, CommandCode, MariaDbCapabilities, PS_DIRECT_EXEC_ID, SCRAMBLE_SIZE,
};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::protocol::mysql::reply::{Reply, ReplyState, ReplyTracker};
use crate::read_logical_packet;
use crate::session::ClientSession;

use hashbrown::HashMap;
use mysql_common::constants::CapabilityFlags;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

/// Vendor phrase XPand emits while a group change is in progress; treated
/// as a transient authentication failure so the session may retry.
const GROUP_CHANGE_PHRASE: &str = "Group change during GTM operation";

/// Service-level requirements folded into capability negotiation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendOptions {
    pub session_track: bool,
    pub multi_statements: bool,
}

/// Outcome of routing one client packet to this backend.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteResult {
    Forwarded,
    Swallowed,
    /// A synthesized error the router must deliver to the client as if it
    /// came from the backend.
    ClientError(Vec<u8>),
}

/// One server packet surfaced to the router, with the tracker's view of the
/// response it belongs to.
#[derive(Debug)]
pub struct ResponseEvent {
    pub seq: u8,
    pub payload: Vec<u8>,
    pub complete: bool,
    pub reply: Reply,
}

struct DelayedPacket {
    payload: Vec<u8>,
    id: u64,
    collect_rows: bool,
}

/// Project the session's announced capabilities onto what the server
/// offers and apply the proxy's own requirements.
pub fn negotiate_capabilities(
    session: &ClientSession,
    server_capabilities: CapabilityFlags,
    options: BackendOptions,
    with_ssl: bool,
) -> CapabilityFlags {
    let mut caps = session.capabilities & server_capabilities;

    caps |= CapabilityFlags::CLIENT_PLUGIN_AUTH
        | CapabilityFlags::CLIENT_SECURE_CONNECTION
        | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_MYSQL;

    caps.remove(CapabilityFlags::CLIENT_SSL_VERIFY_SERVER_CERT);

    if with_ssl {
        caps.insert(CapabilityFlags::CLIENT_SSL);
    } else {
        caps.remove(CapabilityFlags::CLIENT_SSL);
    }

    if options.session_track {
        caps.insert(CapabilityFlags::CLIENT_SESSION_TRACK);
    }
    if options.multi_statements {
        caps.insert(
            CapabilityFlags::CLIENT_MULTI_STATEMENTS | CapabilityFlags::CLIENT_MULTI_RESULTS,
        );
    }

    // The default database may have changed since the client connected, so
    // this cannot be taken from the client's announced capabilities.
    if session.db.is_empty() {
        caps.remove(CapabilityFlags::CLIENT_CONNECT_WITH_DB);
    } else {
        caps.insert(CapabilityFlags::CLIENT_CONNECT_WITH_DB);
    }

    caps
}

/// State machine for one proxy-to-server connection. Drives handshake,
/// authentication, connection initialization, history replay and
/// steady-state routing; owns the reply tracker and the per-backend
/// prepared-statement map.
pub struct BackendConnection<S> {
    server: ServerInfo,
    options: BackendOptions,
    reader: PacketReader<ReadHalf<S>>,
    writer: PacketWriter<WriteHalf<S>>,
    state: BackendState,
    auth: AuthExchange,
    user_cache: Option<Arc<dyn UserAccountCache>>,
    thread_id: u32,
    server_version: String,
    scramble: [u8; SCRAMBLE_SIZE],
    server_capabilities: CapabilityFlags,
    server_extra_capabilities: MariaDbCapabilities,
    capabilities: CapabilityFlags,
    extra_capabilities: MariaDbCapabilities,
    tracker: ReplyTracker,
    track_queue: VecDeque<TrackedQuery>,
    delayed: VecDeque<DelayedPacket>,
    ps_map: HashMap<u32, PsInfo>,
    subscriber: Option<SubscriberId>,
    snapshot: Option<PooledSnapshot>,
    load_data_active: bool,
    pending_change_user: bool,
    malformed_execute_logged: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BackendConnection<S> {
    pub fn new(
        server: ServerInfo,
        options: BackendOptions,
        stream: S,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        BackendConnection {
            server,
            options,
            reader: PacketReader::new(read_half),
            writer: PacketWriter::new(write_half),
            state: BackendState::Handshaking,
            auth: AuthExchange::new(password),
            user_cache: None,
            thread_id: 0,
            server_version: String::new(),
            scramble: [0; SCRAMBLE_SIZE],
            server_capabilities: CapabilityFlags::empty(),
            server_extra_capabilities: MariaDbCapabilities::empty(),
            capabilities: CapabilityFlags::empty(),
            extra_capabilities: MariaDbCapabilities::empty(),
            tracker: ReplyTracker::new(CapabilityFlags::empty(), MariaDbCapabilities::empty()),
            track_queue: VecDeque::new(),
            delayed: VecDeque::new(),
            ps_map: HashMap::new(),
            subscriber: None,
            snapshot: None,
            load_data_active: false,
            pending_change_user: false,
            malformed_execute_logged: false,
        }
    }

    pub fn set_user_cache(&mut self, cache: Arc<dyn UserAccountCache>) {
        self.user_cache = Some(cache);
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    pub fn ps_map(&self) -> &HashMap<u32, PsInfo> {
        &self.ps_map
    }

    pub fn reply(&self) -> &Reply {
        self.tracker.reply()
    }

    pub fn expecting_reply(&self) -> bool {
        !self.tracker.is_complete() || !self.track_queue.is_empty()
    }

    /// Something other than plain client traffic is in flight: login,
    /// initialization, history replay or a connection-reuse exchange.
    pub fn extraordinary_in_process(&self) -> bool {
        !matches!(
            self.state,
            BackendState::Routing | BackendState::PreparePs | BackendState::Failed
        )
    }

    /// Idle in ROUTING with a complete reply and nothing queued; eligible
    /// for the pool.
    pub fn is_idle(&self) -> bool {
        self.state == BackendState::Routing && !self.expecting_reply() && self.delayed.is_empty()
    }

    pub fn is_failed(&self) -> bool {
        self.state == BackendState::Failed
    }

    fn fail<T>(&mut self, err: ProxyError) -> Result<T> {
        self.state = BackendState::Failed;
        Err(err)
    }

    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    /// Run the connection up to ROUTING: handshake, authentication,
    /// connection-init queries, history replay and the delayed queue.
    pub async fn login(&mut self, session: &mut ClientSession) -> Result<()> {
        if self.server.proxy_protocol {
            if let (Some(client), Ok(server)) =
                (session.client_addr, self.server.address.parse())
            {
                let line = writers::proxy_protocol_v1(client, server);
                self.writer.write_raw(line.as_bytes()).await?;
                self.writer.flush_all().await?;
            }
        }

        let (_, handshake_pkt) = read_logical_packet!(self.reader);
        if handshake_pkt.is_err_packet() {
            let (_, err) = basic::err_packet(&handshake_pkt)
                .map_err(|e| ProxyError::Protocol(format!("bad ERR packet: {e:?}")))?;
            return self.fail(ProxyError::Auth {
                server: self.server.name.clone(),
                code: err.code,
                message: err.message,
                transient: false,
            });
        }
        let handshake = match basic::server_handshake(&handshake_pkt) {
            Ok((_, hs)) => hs,
            Err(e) => {
                return self.fail(ProxyError::Protocol(format!(
                    "bad server handshake from '{}': {e:?}",
                    self.server.name
                )))
            }
        };

        self.login_with_handshake(session, handshake, false).await
    }

    /// Continue the login after the server handshake has been consumed,
    /// e.g. when TLS was negotiated in between.
    pub async fn login_with_handshake(
        &mut self,
        session: &mut ClientSession,
        handshake: ServerHandshake,
        with_ssl: bool,
    ) -> Result<()> {
        info!(
            "connected to '{}' ({}) with thread id {}",
            self.server.name, handshake.server_version, handshake.thread_id
        );
        self.thread_id = handshake.thread_id;
        self.server_version = handshake.server_version.clone();
        self.scramble = handshake.scramble;
        self.server_capabilities = handshake.capabilities;
        self.server_extra_capabilities = handshake.extra_capabilities;

        if let Err(e) = self.check_capability_mismatch(session) {
            return self.fail(e);
        }

        self.capabilities = self.create_capabilities(session, with_ssl);
        self.extra_capabilities = session.extra_capabilities;
        self.tracker
            .set_capabilities(self.capabilities, self.extra_capabilities);

        let auth_response = self
            .auth
            .initial_response(&handshake.auth_plugin, &self.scramble);
        writers::write_handshake_response(
            &mut self.writer,
            &writers::HandshakeResponseParams {
                capabilities: self.capabilities,
                extra_capabilities: self.extra_capabilities,
                collation: session.collation,
                user: &session.user,
                auth_response: &auth_response,
                db: &session.db,
                attributes: session.attributes.as_deref(),
            },
            with_ssl,
        )
        .await?;

        self.state = BackendState::Authenticating;
        self.authenticate().await?;

        self.state = BackendState::ConnectionInit;
        self.run_connection_init(session).await?;

        self.send_and_read_history(session).await?;
        self.drain_delayed(session).await?;
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<()> {
        loop {
            let (seq, pkt) = read_logical_packet!(self.reader);
            if pkt.is_ok_packet() {
                debug!("authenticated against '{}'", self.server.name);
                return Ok(());
            }
            if pkt.is_err_packet() {
                return self.handle_auth_error(&pkt);
            }
            let (output, on_track) = self.auth.exchange(&pkt);
            if !output.is_empty() {
                self.writer.set_seq(seq.wrapping_add(1));
                self.writer.write_all(&output)?;
                self.writer.end_packet().await?;
                self.writer.flush_all().await?;
            }
            if !on_track {
                return self.fail(ProxyError::Auth {
                    server: self.server.name.clone(),
                    code: 0,
                    message: "authentication plugin error".into(),
                    transient: false,
                });
            }
        }
    }

    fn handle_auth_error<T>(&mut self, pkt: &[u8]) -> Result<T> {
        let (_, err) = basic::err_packet(pkt)
            .map_err(|e| ProxyError::Protocol(format!("bad ERR packet: {e:?}")))?;

        let mut transient = false;
        if err.code == ErrorKind::ER_HOST_IS_BLOCKED as u16 {
            self.server.set_maintenance();
            tracing::error!(
                "server '{}' has been put into maintenance mode because it blocks our \
                 connections; run 'mysqladmin flush-hosts' against {} before taking it \
                 out of maintenance",
                self.server.name,
                self.server.address
            );
        } else if err.code == ErrorKind::ER_ACCESS_DENIED_ERROR as u16 {
            if let Some(cache) = &self.user_cache {
                if cache.can_update_immediately() {
                    cache.request_update();
                }
            }
        } else if err.code == 1 && err.message.contains(GROUP_CHANGE_PHRASE) {
            transient = true;
        }

        let server = self.server.name.clone();
        self.fail(ProxyError::Auth {
            server,
            code: err.code,
            message: err.message,
            transient,
        })
    }

    fn check_capability_mismatch(&self, session: &ClientSession) -> Result<()> {
        if session
            .capabilities
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
            && !self
                .server_capabilities
                .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
        {
            return Err(ProxyError::Protocol(format!(
                "client uses DEPRECATE_EOF but server '{}' does not implement it",
                self.server.name
            )));
        }

        if !self
            .server_extra_capabilities
            .contains(session.extra_capabilities)
        {
            return Err(ProxyError::Protocol(format!(
                "client uses extended capabilities server '{}' lacks: {:?} != {:?}",
                self.server.name, session.extra_capabilities, self.server_extra_capabilities
            )));
        }
        Ok(())
    }

    fn create_capabilities(&self, session: &ClientSession, with_ssl: bool) -> CapabilityFlags {
        negotiate_capabilities(session, self.server_capabilities, self.options, with_ssl)
    }

    async fn run_connection_init(&mut self, session: &mut ClientSession) -> Result<()> {
        let queries = self.server.init_queries.clone();
        for sql in &queries {
            let payload = writers::build_com_query(sql);
            self.write_request(&payload).await?;
            self.tracker
                .start(CommandCode::ComQuery as u8, false, false, 0);
            let reply = self.read_until_complete(session).await?;
            if !reply.is_ok {
                let message = reply
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unexpected response".into());
                return self.fail(ProxyError::Protocol(format!(
                    "connection initialization query failed on '{}': {message}",
                    self.server.name
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // History replay
    // ------------------------------------------------------------------

    pub fn attach(&mut self, session: &mut ClientSession) {
        self.subscriber = Some(session.history.subscribe());
    }

    pub fn detach(&mut self, session: &mut ClientSession) {
        if let Some(sub) = self.subscriber.take() {
            session.history.unsubscribe(sub);
        }
    }

    /// Write every pending history entry in order. One response per entry
    /// is read back in `read_history_responses`.
    async fn send_history(&mut self, session: &mut ClientSession) -> Result<usize> {
        self.state = BackendState::SendHistory;
        let Some(sub) = self.subscriber else {
            return Ok(0);
        };

        let pending: Vec<_> = session.history.pending(sub).to_vec();
        for entry in &pending {
            debug!(
                "replaying {} {} on '{}'",
                cmd_to_string(entry.payload.first().copied().unwrap_or(0)),
                entry.id,
                self.server.name
            );
            let query = TrackedQuery::new(&entry.payload, entry.id, false);
            self.track_or_queue(session, query);
            self.write_request(&entry.payload).await?;
        }
        Ok(pending.len())
    }

    async fn read_history_responses(
        &mut self,
        session: &mut ClientSession,
        expected: usize,
    ) -> Result<()> {
        self.state = BackendState::ReadHistory;
        for _ in 0..expected {
            let reply = self.read_until_complete(session).await?;
            let code = reply.error.as_ref().map(|e| e.code).unwrap_or(0);
            if let Some(sub) = self.subscriber {
                if session.history.record_response(sub, reply.is_ok, code) == Some(false) {
                    let err = ProxyError::HistoryMismatch {
                        server: self.server.name.clone(),
                        command: cmd_to_string(reply.command).to_string(),
                    };
                    warn!("{err}; closing connection due to inconsistent session state");
                    return self.fail(err);
                }
            }
        }
        Ok(())
    }

    async fn send_and_read_history(&mut self, session: &mut ClientSession) -> Result<()> {
        let expected = self.send_history(session).await?;
        self.read_history_responses(session, expected).await
    }

    async fn drain_delayed(&mut self, session: &mut ClientSession) -> Result<()> {
        self.state = BackendState::SendDelayq;
        self.state = BackendState::Routing;
        // Drain a snapshot: routing a delayed COM_STMT_PREPARE re-enters the
        // PREPARE_PS state and everything after it is delayed again.
        let packets: Vec<DelayedPacket> = self.delayed.drain(..).collect();
        for delayed in packets {
            let result = self
                .route_client_packet(session, delayed.payload, delayed.id, delayed.collect_rows)
                .await?;
            if let RouteResult::ClientError(_) = result {
                warn!("delayed packet failed to route on '{}'", self.server.name);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Route one client packet per the state table: forward, delay, rewrite
    /// prepared-statement ids, splice execute metadata or synthesize an
    /// error for an unknown statement handle.
    pub async fn route_client_packet(
        &mut self,
        session: &mut ClientSession,
        mut payload: Vec<u8>,
        id: u64,
        collect_rows: bool,
    ) -> Result<RouteResult> {
        match self.state {
            BackendState::Failed => {
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("connection to '{}' has failed", self.server.name),
                )))
            }
            BackendState::Routing => {}
            _ => {
                debug!(
                    "storing {} while in state '{}'",
                    cmd_to_string(payload.first().copied().unwrap_or(0)),
                    self.state.as_str()
                );
                self.delayed.push_back(DelayedPacket {
                    payload,
                    id,
                    collect_rows,
                });
                return Ok(RouteResult::Swallowed);
            }
        }

        // A LOAD DATA LOCAL INFILE upload: the packets are file chunks, not
        // commands; forward them untouched. The empty chunk ends the upload.
        if self.tracker.reply().state == ReplyState::LoadData {
            self.tracker.add_upload_bytes(payload.len() as u64);
            if !self.load_data_active {
                self.load_data_active = true;
                self.writer.set_seq(2);
            }
            self.writer.write_all(&payload)?;
            self.writer.end_packet().await?;
            self.writer.flush_all().await?;
            return Ok(RouteResult::Forwarded);
        }

        let cmd = payload.first().copied().unwrap_or(0);

        if cmd == CommandCode::ComChangeUser as u8 {
            // Discard the packet; we synthesize our own with the session's
            // current credentials.
            if self.expecting_reply() {
                self.pending_change_user = true;
                self.state = BackendState::SendChangeUser;
            } else {
                self.send_change_user_to_backend(session).await?;
            }
            return Ok(RouteResult::Swallowed);
        }

        if CommandCode::is_ps_command(cmd) && payload.len() >= 5 {
            let ps_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);

            if self.ps_map.contains_key(&ps_id) {
                if cmd == CommandCode::ComStmtClose as u8 {
                    let info = self.ps_map.remove(&ps_id).unwrap();
                    payload[1..5].copy_from_slice(&info.real_id.to_le_bytes());
                } else {
                    let real_id = self.ps_map.get(&ps_id).unwrap().real_id;
                    payload[1..5].copy_from_slice(&real_id.to_le_bytes());
                    if cmd == CommandCode::ComStmtExecute as u8 {
                        self.process_stmt_execute(session, &mut payload, ps_id);
                    }
                }
            } else if ps_id != PS_DIRECT_EXEC_ID {
                if cmd == CommandCode::ComStmtClose as u8 {
                    // Prepared and closed before this backend existed; the
                    // history entry is already gone, so drop it silently.
                    return Ok(RouteResult::Swallowed);
                }
                let msg = format!(
                    "Unknown prepared statement handler ({}) given to {} by {}",
                    ps_id,
                    cmd_to_string(cmd),
                    session.user_and_host()
                );
                warn!("{msg}");
                return Ok(RouteResult::ClientError(writers::build_err_payload(
                    ErrorKind::ER_UNKNOWN_STMT_HANDLER,
                    &msg,
                )));
            }
        }

        if cmd == CommandCode::ComQuit as u8 && self.server.persistent_conns {
            // Swallow the COM_QUIT to keep the pooled connection alive.
            return Ok(RouteResult::Swallowed);
        }

        if cmd == CommandCode::ComStmtPrepare as u8 {
            // Later COM_STMT_* for this id must not overtake the prepare
            // response.
            self.state = BackendState::PreparePs;
        }

        let query = TrackedQuery::new(&payload, id, collect_rows);
        self.track_or_queue(session, query);
        self.write_request(&payload).await?;
        Ok(RouteResult::Forwarded)
    }

    /// Splice the remembered parameter types into a COM_STMT_EXECUTE whose
    /// new-params-bound flag is cleared, flipping the flag to 1.
    fn process_stmt_execute(
        &mut self,
        session: &ClientSession,
        payload: &mut Vec<u8>,
        external_id: u32,
    ) {
        let Some(info) = self.ps_map.get_mut(&external_id) else {
            return;
        };
        if info.n_params == 0 || info.exec_metadata_sent {
            return;
        }

        let types_offset = 1 + 4 + 1 + 4 + (info.n_params as usize + 7) / 8;
        let Some(&flag) = payload.get(types_offset) else {
            return;
        };

        if flag != 0 {
            info.exec_metadata_sent = true;
            return;
        }

        match session.exec_metadata.get(&external_id) {
            Some(metadata) => {
                let mut spliced = Vec::with_capacity(payload.len() + metadata.len());
                spliced.extend_from_slice(&payload[..types_offset]);
                spliced.push(1);
                spliced.extend_from_slice(metadata);
                spliced.extend_from_slice(&payload[types_offset + 1..]);
                *payload = spliced;
                info.exec_metadata_sent = true;
            }
            None => {
                if !self.malformed_execute_logged {
                    self.malformed_execute_logged = true;
                    warn!(
                        "malformed COM_STMT_EXECUTE (ID {external_id}): no previous execution \
                         with metadata and the current one does not contain it"
                    );
                }
            }
        }
    }

    fn track_or_queue(&mut self, session: &mut ClientSession, query: TrackedQuery) {
        if self.tracker.is_complete() && self.track_queue.is_empty() {
            self.start_tracking(session, query);
        } else {
            self.track_queue.push_back(query);
        }
    }

    fn start_tracking(&mut self, session: &mut ClientSession, query: TrackedQuery) {
        if let Some(sub) = self.subscriber {
            session.history.set_current(sub, query.id);
        }
        self.tracker.start(
            query.command,
            query.collect_rows,
            query.opening_cursor,
            query.id as u32,
        );
    }

    async fn write_request(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.set_seq(0);
        self.writer.write_all(payload)?;
        self.writer.end_packet().await?;
        self.writer.flush_all().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------

    /// Read and process one server packet. On completion of a reply the
    /// prepared-statement map, the session variable snapshot and the
    /// history cursor are updated.
    pub async fn read_response(&mut self, session: &mut ClientSession) -> Result<ResponseEvent> {
        let (seq, pkt) = read_logical_packet!(self.reader);
        let mut payload = pkt.into_vec();

        // Queued commands that expect no response complete as soon as they
        // start; keep popping until one actually owns this packet.
        while self.tracker.is_complete() {
            match self.track_queue.pop_front() {
                Some(query) => self.start_tracking(session, query),
                None => break,
            }
        }

        if let Err(e) = self.tracker.process(&mut payload) {
            return self.fail(e);
        }

        let complete = self.tracker.is_complete();
        if complete {
            self.load_data_active = false;
            self.on_reply_complete(session)?;
        }

        let reply = self.tracker.reply().clone();

        if complete && self.state == BackendState::PreparePs && self.track_queue.is_empty() {
            self.drain_delayed(session).await?;
        }

        if complete
            && self.state == BackendState::SendChangeUser
            && self.pending_change_user
            && !self.expecting_reply()
        {
            self.send_change_user_to_backend(session).await?;
        }

        Ok(ResponseEvent {
            seq,
            payload,
            complete,
            reply,
        })
    }

    fn on_reply_complete(&mut self, session: &mut ClientSession) -> Result<()> {
        let reply = self.tracker.reply().clone();

        if reply.command == CommandCode::ComStmtPrepare as u8 && reply.is_ok {
            self.ps_map.insert(
                reply.generated_id,
                PsInfo {
                    real_id: self.tracker.real_ps_id(),
                    n_params: reply.param_count,
                    exec_metadata_sent: false,
                },
            );
            debug!(
                "PS external ID {} maps to real ID {} on server '{}'",
                reply.generated_id,
                self.tracker.real_ps_id(),
                self.server.name
            );
        }

        session.track_variables(&reply.variables, &reply.schema);

        if let Some(sub) = self.subscriber {
            let code = reply.error.as_ref().map(|e| e.code).unwrap_or(0);
            if session.history.record_response(sub, reply.is_ok, code) == Some(false) {
                let err = ProxyError::HistoryMismatch {
                    server: self.server.name.clone(),
                    command: cmd_to_string(reply.command).to_string(),
                };
                warn!("{err}; closing connection due to inconsistent session state");
                return self.fail(err);
            }
        }
        Ok(())
    }

    async fn read_until_complete(&mut self, session: &mut ClientSession) -> Result<Reply> {
        while self.tracker.is_complete() {
            match self.track_queue.pop_front() {
                Some(query) => self.start_tracking(session, query),
                None => break,
            }
        }
        loop {
            let (_, pkt) = read_logical_packet!(self.reader);
            let mut payload = pkt.into_vec();
            if let Err(e) = self.tracker.process(&mut payload) {
                return self.fail(e);
            }
            if self.tracker.is_complete() {
                return Ok(self.tracker.reply().clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // COM_CHANGE_USER and COM_PING
    // ------------------------------------------------------------------

    async fn send_change_user_to_backend(&mut self, session: &mut ClientSession) -> Result<()> {
        self.pending_change_user = false;
        let auth_response = self.auth.initial_response(
            crate::protocol::mysql::constants::AuthPluginName::AuthNativePassword
                .as_ref()
                .as_bytes(),
            &self.scramble,
        );
        let payload = writers::build_change_user(&writers::ChangeUserParams {
            user: &session.user,
            auth_response: &auth_response,
            db: &session.db,
            collation: session.collation as u16,
            attributes: session.attributes.as_deref(),
            with_attributes: self
                .capabilities
                .contains(CapabilityFlags::CLIENT_CONNECT_ATTRS),
        });
        self.ps_map.clear();
        self.write_request(&payload).await?;
        self.state = BackendState::ReadChangeUser;
        Ok(())
    }

    /// Read the COM_CHANGE_USER outcome, delegating anything that is not a
    /// terminal OK/ERR to the authentication exchange. The returned packet
    /// is the first reply of the new session.
    pub async fn finish_change_user(
        &mut self,
        session: &mut ClientSession,
    ) -> Result<ResponseEvent> {
        debug_assert_eq!(self.state, BackendState::ReadChangeUser);
        loop {
            let (seq, pkt) = read_logical_packet!(self.reader);
            if pkt.is_ok_packet() || pkt.is_err_packet() {
                let is_ok = pkt.is_ok_packet();
                self.tracker
                    .start(CommandCode::ComChangeUser as u8, false, false, 0);
                let mut payload = pkt.into_vec();
                if let Err(e) = self.tracker.process(&mut payload) {
                    return self.fail(e);
                }
                let reply = self.tracker.reply().clone();
                debug!(
                    "COM_CHANGE_USER on '{}' finished: {}",
                    self.server.name,
                    if is_ok { "OK" } else { "ERR" }
                );
                self.drain_delayed(session).await?;
                return Ok(ResponseEvent {
                    seq,
                    payload,
                    complete: true,
                    reply,
                });
            }

            let (output, on_track) = self.auth.exchange(&pkt);
            if !output.is_empty() {
                self.writer.set_seq(seq.wrapping_add(1));
                self.writer.write_all(&output)?;
                self.writer.end_packet().await?;
                self.writer.flush_all().await?;
            }
            if !on_track {
                return self.fail(ProxyError::Auth {
                    server: self.server.name.clone(),
                    code: 0,
                    message: "authentication plugin error".into(),
                    transient: false,
                });
            }
        }
    }

    pub async fn ping(&mut self, session: &mut ClientSession) -> Result<()> {
        self.write_request(&[CommandCode::ComPing as u8]).await?;
        self.state = BackendState::Pinging;
        let (_, pkt) = read_logical_packet!(self.reader);
        if !pkt.is_ok_packet() {
            return self.fail(ProxyError::Protocol(
                "unexpected response to COM_PING".into(),
            ));
        }
        self.drain_delayed(session).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pooling and reuse
    // ------------------------------------------------------------------

    /// Hand the connection back to the pool, snapshotting what a future
    /// session must match or reset.
    pub fn set_to_pooled(&mut self, session: &mut ClientSession) {
        debug_assert!(self.is_idle());
        self.detach(session);
        self.snapshot = Some(PooledSnapshot::take(
            self.capabilities,
            self.extra_capabilities,
            session,
        ));
        self.state = BackendState::Pooled;
    }

    pub fn snapshot(&self) -> Option<&PooledSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn can_reuse(&self, session: &ClientSession) -> ReuseType {
        match &self.snapshot {
            Some(snapshot) => snapshot.classify(session, self.server.proxy_protocol),
            None => ReuseType::NotPossible,
        }
    }

    /// Take the connection out of the pool for `session` and drive it back
    /// to ROUTING. The RESET_CONNECTION fast path sends the reset and the
    /// history replay in one write burst.
    pub async fn resume_from_pool(
        &mut self,
        session: &mut ClientSession,
        reuse: ReuseType,
    ) -> Result<()> {
        debug_assert_eq!(self.state, BackendState::Pooled);
        self.snapshot = None;
        self.ps_map.clear();
        self.attach(session);

        match reuse {
            ReuseType::NotPossible => {
                return Err(ProxyError::Protocol(
                    "connection does not qualify for reuse".into(),
                ))
            }
            ReuseType::ResetConnection => {
                info!("reusing connection to '{}', sending COM_RESET_CONNECTION", self.server.name);
                self.writer.set_seq(0);
                self.writer.write_all(&writers::build_reset_connection())?;
                self.writer.end_packet().await?;

                let expected = if self.server.init_queries.is_empty() {
                    // COM_RESET_CONNECTION answers with exactly one packet,
                    // so the history can follow without waiting.
                    self.state = BackendState::ResetConnectionFast;
                    let n = self.send_history(session).await?;
                    self.state = BackendState::ResetConnectionFast;
                    Some(n)
                } else {
                    self.state = BackendState::ResetConnection;
                    None
                };
                self.writer.flush_all().await?;

                let (_, pkt) = read_logical_packet!(self.reader);
                if !pkt.is_ok_packet() {
                    let message = basic::err_packet(&pkt)
                        .map(|(_, e)| e.message)
                        .unwrap_or_else(|_| "unexpected response".into());
                    return self.fail(ProxyError::Protocol(format!(
                        "failed to reuse connection to '{}': {message}",
                        self.server.name
                    )));
                }

                match expected {
                    Some(n) => self.read_history_responses(session, n).await?,
                    None => {
                        self.state = BackendState::ConnectionInit;
                        self.run_connection_init(session).await?;
                        self.send_and_read_history(session).await?;
                    }
                }
            }
            ReuseType::ChangeUser => {
                info!("reusing connection to '{}', sending COM_CHANGE_USER", self.server.name);
                self.send_change_user_to_backend(session).await?;
                loop {
                    let (seq, pkt) = read_logical_packet!(self.reader);
                    if pkt.is_ok_packet() {
                        break;
                    }
                    if pkt.is_err_packet() {
                        let message = basic::err_packet(&pkt)
                            .map(|(_, e)| e.message)
                            .unwrap_or_default();
                        return self.fail(ProxyError::Protocol(format!(
                            "failed to reuse connection to '{}': {message}",
                            self.server.name
                        )));
                    }
                    let (output, on_track) = self.auth.exchange(&pkt);
                    if !output.is_empty() {
                        self.writer.set_seq(seq.wrapping_add(1));
                        self.writer.write_all(&output)?;
                        self.writer.end_packet().await?;
                        self.writer.flush_all().await?;
                    }
                    if !on_track {
                        return self.fail(ProxyError::Auth {
                            server: self.server.name.clone(),
                            code: 0,
                            message: "authentication plugin error".into(),
                            transient: false,
                        });
                    }
                }
                self.state = BackendState::ConnectionInit;
                self.run_connection_init(session).await?;
                self.send_and_read_history(session).await?;
            }
        }

        self.drain_delayed(session).await?;
        Ok(())
    }
}

#[cfg(test)]
impl<S: AsyncRead + AsyncWrite + Unpin> BackendConnection<S> {
    /// A connection already in ROUTING with sane capabilities, for tests
    /// that exercise the routing table without a login exchange.
    pub(crate) fn into_routing(server: ServerInfo, stream: S) -> Self {
        let mut conn = Self::new(server, BackendOptions::default(), stream, "pw");
        conn.state = BackendState::Routing;
        conn.capabilities = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
            | CapabilityFlags::CLIENT_SESSION_TRACK;
        conn.tracker
            .set_capabilities(conn.capabilities, MariaDbCapabilities::empty());
        conn
    }
}
