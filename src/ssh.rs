//! SSH server implementation using russh.
//!
//! This is the heart of keyhole: the authentication callbacks that harvest
//! every offered public key while never letting one succeed, the
//! keyboard-interactive fallback that completes the handshake, and the
//! per-channel decision gate that waits for the client's forwarding
//! requests before composing the banner.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::access::LogEntry;
use crate::banner;
use crate::github::UserResolver;
use crate::index::KeyIndex;
use crate::metrics::{inc, Metrics};
use crate::registry::{OfferedKey, SessionId, SessionRecord, SessionRegistry};

/// How long a session channel may stay quiet before the banner is composed
/// without the client ever asking for a shell.
const DECISION_DEADLINE: Duration = Duration::from_secs(30);

/// Grace period between the last banner byte and our FIN, so the client's
/// terminal gets to display what we wrote.
const CLOSE_LINGER: Duration = Duration::from_millis(500);

/// Upper bound on waiting for the banner task once the SSH session itself
/// has ended: the gate deadline plus the resolver timeout, with slack.
const BANNER_GRACE: Duration = Duration::from_secs(45);

/// Shared state for the SSH server.
pub struct ServerState {
    pub registry: SessionRegistry,
    pub index: KeyIndex,
    pub resolver: UserResolver,
    pub metrics: Arc<Metrics>,
}

impl ServerState {
    pub fn new(index: KeyIndex, resolver: UserResolver, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            index,
            resolver,
            metrics,
        })
    }
}

// Decision gate states.
const COLLECTING: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

/// Single-shot gate between "still collecting forwarding requests" and
/// "compose the banner now".
///
/// `release` and the deadline race; whichever fires first performs the one
/// COLLECTING → READY transition and the loser is a no-op. There is exactly
/// one waiter per channel.
pub struct DecisionGate {
    state: AtomicU8,
    notify: Notify,
}

impl DecisionGate {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(COLLECTING),
            notify: Notify::new(),
        }
    }

    /// Fire the gate. Returns true only for the call that performed the
    /// transition.
    pub fn release(&self) -> bool {
        let released = self
            .state
            .compare_exchange(COLLECTING, READY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if released {
            // notify_one stores a permit, so a release that lands before
            // the waiter arrives is not lost.
            self.notify.notify_one();
        }
        released
    }

    /// Forwarding flags may only change while the gate is collecting.
    pub fn is_collecting(&self) -> bool {
        self.state.load(Ordering::Acquire) == COLLECTING
    }

    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.notify.notify_one();
    }

    /// Wait until the gate is released or `deadline` elapses. The deadline
    /// path performs the same single transition, so a late `release` after
    /// a timeout (or vice versa) cannot fire the gate twice.
    pub async fn wait(&self, deadline: Duration) {
        if !self.is_collecting() {
            return;
        }
        if tokio::time::timeout(deadline, self.notify.notified())
            .await
            .is_err()
        {
            self.release();
        }
    }
}

impl Default for DecisionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one connection shares between the russh callbacks, the
/// banner task, and the teardown block.
struct ConnState {
    session_id: SessionId,
    log: Mutex<LogEntry>,
    agent_forwarded: AtomicBool,
    x11_forwarded: AtomicBool,
    roaming_requested: AtomicBool,
    gate: DecisionGate,
    served: AtomicBool,
    handshake_done: AtomicBool,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConnState {
    fn new(done: oneshot::Sender<()>) -> Self {
        use russh::keys::ssh_key::rand_core::{OsRng, RngCore};

        let mut session_id = [0u8; 32];
        OsRng.fill_bytes(&mut session_id);

        Self {
            session_id,
            log: Mutex::new(LogEntry::new()),
            agent_forwarded: AtomicBool::new(false),
            x11_forwarded: AtomicBool::new(false),
            roaming_requested: AtomicBool::new(false),
            gate: DecisionGate::new(),
            served: AtomicBool::new(false),
            handshake_done: AtomicBool::new(false),
            done: Mutex::new(Some(done)),
        }
    }

    fn push_request_type(&self, request: &str) {
        self.log
            .lock()
            .unwrap()
            .request_types
            .push(request.to_string());
    }

    fn record_error(&self, err: String) {
        self.log.lock().unwrap().record_error(err);
    }

    fn signal_done(&self) {
        if let Some(done) = self.done.lock().unwrap().take() {
            let _ = done.send(());
        }
    }
}

/// Per-connection handler wired into russh.
pub struct ConnectionHandler {
    state: Arc<ServerState>,
    conn: Arc<ConnState>,
}

/// The rejection every offered key gets: non-success, with publickey kept
/// on the menu so the client offers the rest, and keyboard-interactive as
/// the eventual way in.
fn reject_keep_trying() -> Auth {
    let methods = MethodSet::from(&[MethodKind::PublicKey, MethodKind::KeyboardInteractive][..]);
    Auth::Reject {
        proceed_with_methods: Some(methods),
        partial_success: false,
    }
}

impl ConnectionHandler {
    fn record_offered_key(&self, user: &str, public_key: &PublicKey) {
        let key = OfferedKey::new(public_key);
        debug!("Public key offered by '{user}': {}", key.line());
        self.state
            .registry
            .append_key(&self.conn.session_id, user, key);
        self.conn.log.lock().unwrap().claimed_username = user.to_string();
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Called once per key the client offers. Never accept: accepting
    /// would end authentication and hide every key the client has not
    /// shown yet.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.record_offered_key(user, public_key);
        Ok(reject_keep_trying())
    }

    /// A client may skip the offer round-trip and send a signed request
    /// directly; the key is recorded all the same, and still rejected.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.record_offered_key(user, public_key);
        Ok(reject_keep_trying())
    }

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(reject_keep_trying())
    }

    /// Keyboard-interactive is tried once every public key has failed,
    /// which by construction is always. Succeed without prompting: this is
    /// the only path that completes the handshake.
    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        _response: Option<russh::server::Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        self.conn.log.lock().unwrap().claimed_username = user.to_string();
        self.conn.handshake_done.store(true, Ordering::Release);
        Ok(Auth::Accept)
    }

    /// Serve the first session channel; refuse everything after it.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.conn.served.swap(true, Ordering::AcqRel) {
            debug!("Refusing additional session channel");
            return Ok(false);
        }
        self.conn.handshake_done.store(true, Ordering::Release);
        debug!("Session channel opened: {:?}", channel.id());

        tokio::spawn(serve_session(
            self.state.clone(),
            self.conn.clone(),
            channel,
        ));
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Rejecting direct-tcpip channel");
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    /// `pty-req` and `shell` arrive after the client's forwarding
    /// requests, so either one means the quiet phase is over.
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.conn.push_request_type("pty-req");
        self.conn.gate.release();
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.conn.push_request_type("shell");
        self.conn.gate.release();
        session.channel_success(channel)?;
        Ok(())
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.conn.push_request_type("auth-agent-req@openssh.com");
        if self.conn.gate.is_collecting() {
            self.conn.agent_forwarded.store(true, Ordering::Release);
        }
        Ok(false)
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.conn.push_request_type("x11-req");
        if self.conn.gate.is_collecting() {
            self.conn.x11_forwarded.store(true, Ordering::Release);
        }
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.conn.push_request_type("env");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.conn.push_request_type("exec");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.conn.push_request_type("subsystem");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.conn.push_request_type("window-change");
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.conn.push_request_type("tcpip-forward");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.conn.push_request_type("cancel-tcpip-forward");
        Ok(false)
    }
}

/// Warning banners owed to a channel, in their fixed order.
fn warning_banners(agent: bool, x11: bool, roaming: bool) -> Vec<&'static str> {
    let mut banners = Vec::new();
    if agent {
        banners.push(banner::AGENT_MSG.as_str());
    }
    if x11 {
        banners.push(banner::X11_MSG.as_str());
    }
    if roaming {
        banners.push(banner::ROAMING_MSG.as_str());
    }
    banners
}

/// The key echo appended to the failed banner: each offered line, then a
/// blank line, all formatted for a raw channel.
fn key_echo(record: &SessionRecord) -> String {
    let mut echo = String::new();
    for key in &record.keys_offered {
        echo.push_str(key.line());
        echo.push_str("\n\r");
    }
    echo.push_str("\n\r");
    echo
}

async fn write_channel(conn: &ConnState, channel: &Channel<Msg>, text: &str) {
    // The connection is on its way out either way; a failed write is worth
    // recording but not acting on.
    if let Err(err) = channel.data(text.as_bytes()).await {
        conn.record_error(format!("channel write failed: {err}"));
    }
}

/// Banner task for the one served session channel: wait out the decision
/// gate, emit warnings, resolve the visitor, greet, and signal teardown.
async fn serve_session(state: Arc<ServerState>, conn: Arc<ConnState>, channel: Channel<Msg>) {
    conn.gate.wait(DECISION_DEADLINE).await;

    let agent = conn.agent_forwarded.load(Ordering::Acquire);
    let x11 = conn.x11_forwarded.load(Ordering::Acquire);
    let roaming = conn.roaming_requested.load(Ordering::Acquire);
    if agent {
        inc(&state.metrics.agent);
    }
    if x11 {
        inc(&state.metrics.x11);
    }
    if roaming {
        inc(&state.metrics.roaming);
    }
    for warning in warning_banners(agent, x11, roaming) {
        write_channel(&conn, &channel, warning).await;
    }

    let record = state.registry.take(&conn.session_id).unwrap_or_default();
    {
        let mut log = conn.log.lock().unwrap();
        if log.keys_offered.is_empty() {
            log.keys_offered = record
                .keys_offered
                .iter()
                .map(|k| k.line().to_string())
                .collect();
        }
    }

    resolve_and_greet(&state, &conn, &channel, &record).await;

    let _ = channel.eof().await;
    let _ = channel.close().await;
    conn.signal_done();
}

/// Look the offered keys up in the index and write exactly one of the
/// hello or failed banners (or nothing, on a recorded error).
async fn resolve_and_greet(
    state: &ServerState,
    conn: &ConnState,
    channel: &Channel<Msg>,
    record: &SessionRecord,
) {
    let lines = record.keys_offered.iter().map(|k| k.line());
    let user_id = match state.index.find_user(lines) {
        Ok(user_id) => user_id,
        Err(err) => {
            conn.record_error(format!("user lookup failed: {err}"));
            return;
        }
    };

    let Some(user_id) = user_id else {
        write_channel(conn, channel, &banner::FAILED_MSG).await;
        write_channel(conn, channel, &key_echo(record)).await;
        return;
    };

    conn.log.lock().unwrap().github_id = Some(user_id);

    let user = match state.resolver.user_by_id(user_id).await {
        Ok(user) => user,
        Err(err) => {
            conn.record_error(format!("name lookup failed: {err}"));
            return;
        }
    };
    if user.name.is_some() {
        conn.log.lock().unwrap().github_name = user.name.clone();
    }

    info!("Identified visitor as @{} (id {user_id})", user.login);
    write_channel(
        conn,
        channel,
        &banner::hello(&user.display_name(), &user.login),
    )
    .await;
}

/// Stream adapter that captures the client's `SSH-2.0-...` identification
/// line on its way past; the SSH library itself does not expose it.
struct VersionCapture<S> {
    inner: S,
    version: Arc<Mutex<Option<String>>>,
    pending: Vec<u8>,
    captured: bool,
}

// RFC 4253 caps the identification line at 255 bytes.
const VERSION_LINE_MAX: usize = 255;

impl<S> VersionCapture<S> {
    fn new(inner: S) -> (Arc<Mutex<Option<String>>>, Self) {
        let version = Arc::new(Mutex::new(None));
        (
            version.clone(),
            Self {
                inner,
                version,
                pending: Vec::new(),
                captured: false,
            },
        )
    }

    fn scan(&mut self, bytes: &[u8]) {
        if self.captured {
            return;
        }
        for &b in bytes {
            if b == b'\n' || self.pending.len() >= VERSION_LINE_MAX {
                let line = String::from_utf8_lossy(&self.pending)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                *self.version.lock().unwrap() = Some(line);
                self.captured = true;
                return;
            }
            self.pending.push(b);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for VersionCapture<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut me.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if !me.captured {
                let new = buf.filled()[before..].to_vec();
                me.scan(&new);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for VersionCapture<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// True for the failure modes a port scan or health check produces: the
/// peer went away before speaking SSH.
fn is_end_of_stream(err: &anyhow::Error) -> bool {
    fn eof_kind(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
        )
    }

    if let Some(russh::Error::IO(io_err)) = err.downcast_ref::<russh::Error>() {
        return eof_kind(io_err);
    }
    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        return eof_kind(io_err);
    }
    // The SSH library wraps an early hang-up in different variants across
    // versions; fall back on the rendered message.
    let msg = err.to_string().to_lowercase();
    msg.contains("eof") || msg.contains("hung up") || msg.contains("connection closed")
}

/// Run the SSH server on an already-bound listener.
pub async fn run_server(
    state: Arc<ServerState>,
    host_keys: Vec<russh::keys::PrivateKey>,
    listener: TcpListener,
) -> Result<()> {
    let russh_config = Arc::new(russh::server::Config {
        server_id: russh::SshId::Standard("SSH-2.0-OpenSSH_9.6".to_string()),
        // A per-rejection delay would throttle the key sweep the server
        // exists to perform.
        auth_rejection_time: Duration::ZERO,
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: host_keys,
        ..Default::default()
    });

    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("Accept failed: {err}");
                continue;
            }
        };

        let state = state.clone();
        let russh_config = russh_config.clone();
        tokio::spawn(handle_connection(state, russh_config, stream, peer_addr));
    }
}

/// Drive one accepted connection to completion. Never returns an error;
/// every failure mode ends in at most one emitted log record and a closed
/// socket.
async fn handle_connection(
    state: Arc<ServerState>,
    russh_config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    debug!("Connection from {peer_addr}");

    let (done_tx, mut done_rx) = oneshot::channel();
    let conn = Arc::new(ConnState::new(done_tx));
    let (version, stream) = VersionCapture::new(stream);
    let handler = ConnectionHandler {
        state: state.clone(),
        conn: conn.clone(),
    };

    let session = match russh::server::run_stream(russh_config, stream, handler).await {
        Ok(session) => session,
        Err(err) => {
            finish_handshake_failure(&state, &conn, &version, &err);
            return;
        }
    };
    let mut session = Box::pin(session);

    let result = tokio::select! {
        result = &mut session => Some(result),
        _ = &mut done_rx => None,
    };

    if let Some(Err(err)) = &result {
        if !conn.handshake_done.load(Ordering::Acquire) {
            finish_handshake_failure(&state, &conn, &version, err);
            return;
        }
        // Post-handshake stream errors are the client hanging up; the
        // record already holds anything worth keeping.
        debug!("Session ended: {err}");
    }

    // The session can end on its own while the banner task is still mid
    // resolution (the GitHub call takes up to 10 s). The record is not
    // final until that task signals done, so wait for it before reading
    // the log, bounded in case the task is stuck on the gate.
    if result.is_some() && conn.served.load(Ordering::Acquire) {
        let _ = tokio::time::timeout(BANNER_GRACE, done_rx).await;
    }

    conn.gate.close();
    let removed = state.registry.remove(&conn.session_id);

    {
        let mut log = conn.log.lock().unwrap();
        if let Some(v) = version.lock().unwrap().take() {
            log.client_version = v;
        }
        // Connections that never reached the banner task still log the
        // keys they offered.
        if let Some(record) = &removed {
            if log.keys_offered.is_empty() {
                log.keys_offered = record
                    .keys_offered
                    .iter()
                    .map(|k| k.line().to_string())
                    .collect();
            }
            if log.claimed_username.is_empty() {
                log.claimed_username = record.claimed_username.clone();
            }
        }

        inc(&state.metrics.conns);
        if !log.keys_offered.is_empty() {
            inc(&state.metrics.with_keys);
        }
        if log.error.is_some() {
            inc(&state.metrics.errors);
        }
        if log.github_id.is_some() {
            inc(&state.metrics.identified);
        }
    }

    tokio::time::sleep(CLOSE_LINGER).await;
    drop(session);

    conn.log.lock().unwrap().emit();
}

/// Handshake never completed. End-of-stream is a port scan and stays
/// silent; anything else is counted and logged.
fn finish_handshake_failure(
    state: &ServerState,
    conn: &ConnState,
    version: &Arc<Mutex<Option<String>>>,
    err: &anyhow::Error,
) {
    state.registry.remove(&conn.session_id);
    if is_end_of_stream(err) {
        return;
    }

    inc(&state.metrics.handshake_errors);
    let mut log = conn.log.lock().unwrap();
    if let Some(v) = version.lock().unwrap().take() {
        log.client_version = v;
    }
    log.record_error(format!("Handshake failed: {err}"));
    log.emit();
}
