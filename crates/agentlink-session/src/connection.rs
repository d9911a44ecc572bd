//! The managed link to the agent process.

use std::{
    sync::{
        Arc, Mutex, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use agentlink_core::{
    ClientOptions, DispatchFault, Error, EventDispatcher, PermissionRequest, ResumeSessionConfig,
    Result, RpcError, SDK_PROTOCOL_VERSION, SessionConfig, SessionEvent, SessionHandle,
    Subscription, UserInputRequest,
};
use agentlink_plugins::{PluginManager, PluginRegistry};
use agentlink_transport::{AgentProcess, Inbound, ProcessExit, RpcClient, Transport};

use crate::{
    Session, SessionRegistry,
    session::Handlers,
    types::{
        ConnectionEvent, ConnectionState, GetStatusResponse, LifecycleEvent, ModelInfo,
        PingResponse, SessionMetadata,
    },
};

/// Restarts attempted after unexpected exits before giving up.
const MAX_RESTART_ATTEMPTS: u32 = 3;
/// Grace period for a crashed agent to report its exit status.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// One established transport plus the tasks serving it.
struct Link {
    rpc: RpcClient,
    process: Option<AgentProcess>,
    generation: u64,
    restartable: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.rpc.abort();
        if let Some(process) = self.process.as_mut() {
            process.kill();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.abort();
    }
}

pub(crate) struct ConnectionInner {
    pub(crate) options: ClientOptions,
    pub(crate) registry: SessionRegistry,
    pub(crate) plugins: Arc<PluginManager>,
    this: Weak<Self>,
    state: watch::Sender<ConnectionState>,
    /// Serializes start, stop and restart.
    lifecycle: tokio::sync::Mutex<()>,
    link: RwLock<Option<Link>>,
    events: EventDispatcher<ConnectionEvent>,
    stopping: AtomicBool,
    custom_io: AtomicBool,
    generation: AtomicU64,
    restart_attempts: AtomicU32,
    models: Mutex<Option<Vec<ModelInfo>>>,
    supervisor: Mutex<Option<mpsc::UnboundedSender<u64>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenedSession {
    session_id: String,
    #[serde(default)]
    workspace_path: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventNotification {
    session_id: String,
    event: SessionEvent,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallParams {
    session_id: String,
    tool_call_id: String,
    tool_name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionParams {
    session_id: String,
    permission_request: PermissionRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInputParams {
    session_id: String,
    #[serde(flatten)]
    request: UserInputRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HookParams {
    session_id: String,
    hook_type: String,
    #[serde(default)]
    input: Value,
}

impl ConnectionInner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = %next, "Connection state changed");
            self.events.dispatch(&ConnectionEvent::StateChanged(next));
        }
    }

    /// `Connecting → Connected`, refused when a stop moved the state on in
    /// the meantime.
    fn promote(&self) -> bool {
        let promoted = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if promoted {
            tracing::debug!(state = %ConnectionState::Connected, "Connection state changed");
            self.events
                .dispatch(&ConnectionEvent::StateChanged(ConnectionState::Connected));
        }
        promoted
    }

    /// Final state of a connect attempt.
    fn settle(&self, result: Result<()>, on_failure: ConnectionState) -> Result<()> {
        match result {
            Ok(()) if self.promote() => Ok(()),
            Ok(()) => {
                tracing::debug!("Stop requested while connecting");
                self.write_link().take();
                Err(Error::NotConnected)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to connect to agent");
                if self.stopping.load(Ordering::Acquire) {
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    self.set_state(on_failure);
                }
                Err(e)
            }
        }
    }

    fn read_link(&self) -> std::sync::RwLockReadGuard<'_, Option<Link>> {
        self.link.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_link(&self) -> std::sync::RwLockWriteGuard<'_, Option<Link>> {
        self.link.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Correlator of the live link, without starting one.
    pub(crate) fn current_rpc(&self) -> Option<RpcClient> {
        self.read_link()
            .as_ref()
            .map(|link| link.rpc.clone())
            .filter(|rpc| !rpc.is_closed())
    }

    /// Issue `method` with the default timeout, starting the agent if
    /// auto-start allows it.
    pub(crate) async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let rpc = self.rpc_or_start().await?;
        rpc.call(method, params, self.options.request_timeout).await
    }

    async fn rpc_or_start(&self) -> Result<RpcClient> {
        if let Some(rpc) = self.current_rpc() {
            return Ok(rpc);
        }
        if !self.options.auto_start
            || self.custom_io.load(Ordering::Acquire)
            || self.stopping.load(Ordering::Acquire)
        {
            return Err(Error::NotConnected);
        }

        let _lifecycle = self.lifecycle.lock().await;
        if let Some(rpc) = self.current_rpc() {
            return Ok(rpc);
        }
        tracing::debug!("Auto-starting agent");
        self.connect(ConnectionState::Disconnected).await?;
        self.current_rpc().ok_or(Error::NotConnected)
    }

    /// Spawn or attach per the options. Caller holds the lifecycle lock.
    async fn connect(&self, on_failure: ConnectionState) -> Result<()> {
        self.ensure_supervisor();
        self.set_state(ConnectionState::Connecting);
        let result = match Transport::connect(&self.options).await {
            Ok(transport) => self.establish(transport, true).await,
            Err(e) => Err(e),
        };
        self.settle(result, on_failure)
    }

    /// Handshake over `transport` and install it as the live link. A link
    /// that finishes its handshake after a stop began is torn down instead.
    async fn establish(&self, transport: Transport, restartable: bool) -> Result<()> {
        let Transport {
            reader,
            writer,
            mut process,
            label,
        } = transport;
        let (rpc, inbound) = RpcClient::spawn(reader, writer);

        if let Err(e) = self.handshake(&rpc).await {
            rpc.close().await;
            if let Some(process) = process.as_mut() {
                process.kill();
            }
            return Err(e);
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut tasks = vec![tokio::spawn(demux(self.this.clone(), rpc.clone(), inbound))];
        if let Some(lost) = self.supervisor_sender() {
            let watched = rpc.clone();
            let exit = process.as_ref().map(AgentProcess::exit_watch);
            tasks.push(tokio::spawn(async move {
                match exit {
                    Some(exit) => {
                        tokio::select! {
                            () = watched.closed() => {}
                            () = exited(exit) => {}
                        }
                    }
                    None => watched.closed().await,
                }
                let _ = lost.send(generation);
            }));
        }

        let pid = process.as_ref().and_then(AgentProcess::pid);
        let link = Link {
            rpc,
            process,
            generation,
            restartable,
            tasks,
        };
        let mut slot = self.write_link();
        if self.stopping.load(Ordering::Acquire) {
            drop(slot);
            drop(link);
            tracing::debug!(endpoint = %label, "Discarding link established during stop");
            return Err(Error::NotConnected);
        }
        *slot = Some(link);
        drop(slot);
        tracing::info!(endpoint = %label, ?pid, "Connected to agent");
        Ok(())
    }

    async fn handshake(&self, rpc: &RpcClient) -> Result<()> {
        let reply = rpc
            .call("ping", json!({ "message": null }), self.options.request_timeout)
            .await?;
        let ping: PingResponse = serde_json::from_value(reply)?;
        match ping.protocol_version {
            Some(version) if version == SDK_PROTOCOL_VERSION => Ok(()),
            actual => Err(Error::ProtocolMismatch {
                expected: SDK_PROTOCOL_VERSION,
                actual,
            }),
        }
    }

    fn supervisor_sender(&self) -> Option<mpsc::UnboundedSender<u64>> {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the task that reacts to lost links. Link monitors only report a
    /// generation number; recovery runs here.
    fn ensure_supervisor(&self) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if supervisor.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let weak = self.this.clone();
        tokio::spawn(async move {
            while let Some(generation) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.link_lost(generation).await;
            }
        });
        *supervisor = Some(tx);
    }

    async fn link_lost(&self, generation: u64) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        let link = {
            let mut slot = self.write_link();
            match slot.as_ref() {
                Some(link) if link.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };

        let exit = match link.process.as_ref() {
            Some(process) => process.wait_timeout(EXIT_GRACE).await,
            None => None,
        };
        match exit {
            Some(exit) => tracing::warn!(%exit, "Agent exited unexpectedly"),
            None => tracing::warn!("Agent connection lost"),
        }
        let restartable = link.restartable;
        drop(link);

        self.set_state(ConnectionState::Error);
        self.events.dispatch(&ConnectionEvent::AgentExited { exit });
        for session in self.registry.all() {
            session.interrupt_turn();
        }
        self.clear_models();

        if restartable && self.options.auto_restart {
            self.restart().await;
        }
    }

    async fn restart(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.stopping.load(Ordering::Acquire) || self.current_rpc().is_some() {
            return;
        }
        let attempt = self.restart_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt > MAX_RESTART_ATTEMPTS {
            tracing::warn!(attempts = MAX_RESTART_ATTEMPTS, "Giving up restarting agent");
            return;
        }

        tracing::info!(attempt, "Restarting agent");
        if self.connect(ConnectionState::Error).await.is_ok() {
            self.events
                .dispatch(&ConnectionEvent::Restarted { attempt });
        }
    }

    fn clear_models(&self) {
        *self.models.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn route_notification(&self, method: String, params: Value) {
        match method.as_str() {
            "session.event" => match serde_json::from_value::<EventNotification>(params) {
                Ok(note) => self.registry.route(&note.session_id, note.event),
                Err(e) => tracing::warn!(error = %e, "Dropping malformed session event"),
            },
            "session.lifecycle" => match serde_json::from_value::<LifecycleEvent>(params.clone()) {
                Ok(event) => self.events.dispatch(&ConnectionEvent::Lifecycle(event)),
                Err(_) => self
                    .events
                    .dispatch(&ConnectionEvent::Notification { method, params }),
            },
            _ => self
                .events
                .dispatch(&ConnectionEvent::Notification { method, params }),
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> std::result::Result<Value, RpcError> {
        match method {
            "tool.call" => {
                let params: ToolCallParams = parse_params(params)?;
                let session = self.session_for(&params.session_id)?;
                let result = session
                    .invoke_tool(params.tool_call_id, params.tool_name, params.arguments)
                    .await;
                Ok(json!({ "result": result }))
            }
            "permission.request" => {
                let params: PermissionParams = parse_params(params)?;
                let session = self.session_for(&params.session_id)?;
                let result = session.request_permission(params.permission_request).await;
                Ok(json!({ "result": result }))
            }
            "userInput.request" => {
                let params: UserInputParams = parse_params(params)?;
                let session = self.session_for(&params.session_id)?;
                let response = session.request_user_input(params.request).await?;
                serde_json::to_value(response)
                    .map_err(|e| RpcError::new(RpcError::INTERNAL_ERROR, e.to_string()))
            }
            "hooks.invoke" => {
                let params: HookParams = parse_params(params)?;
                let session = self.session_for(&params.session_id)?;
                let handle: Arc<dyn SessionHandle> = session;
                let output = self
                    .plugins
                    .invoke_remote(&handle, &params.hook_type, params.input)
                    .await;
                Ok(json!({ "output": output }))
            }
            other => {
                tracing::debug!(method = other, "Unhandled agent request");
                Err(RpcError::method_not_found(other))
            }
        }
    }

    fn session_for(&self, session_id: &str) -> std::result::Result<Arc<Session>, RpcError> {
        self.registry.get(session_id).ok_or_else(|| {
            RpcError::new(
                RpcError::SESSION_NOT_FOUND,
                format!("Session not found: {session_id}"),
            )
        })
    }

    /// Register a session and run `onSessionCreated`. A live session with
    /// the same id is ended first.
    async fn open_session(
        &self,
        opened: OpenedSession,
        handlers: Handlers,
        history: Vec<SessionEvent>,
    ) -> Arc<Session> {
        let (session, events) = Session::spawn(
            self.this.clone(),
            opened.session_id,
            opened.workspace_path,
            handlers,
        );
        session.seed_history(history);
        if let Some(replaced) = self.registry.insert(Arc::clone(&session), events) {
            replaced
                .close(self, false, self.options.request_timeout)
                .await;
        }
        let handle: Arc<dyn SessionHandle> = Arc::clone(&session) as Arc<dyn SessionHandle>;
        self.plugins.session_created(&handle).await;
        session
    }
}

async fn exited(mut exit: watch::Receiver<Option<ProcessExit>>) {
    let _ = exit.wait_for(Option::is_some).await;
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> std::result::Result<T, RpcError> {
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(RpcError::INVALID_PARAMS, format!("Invalid params: {e}")))
}

/// Route inbound frames for one link, in arrival order.
async fn demux(
    connection: Weak<ConnectionInner>,
    rpc: RpcClient,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(frame) = inbound.recv().await {
        let Some(inner) = connection.upgrade() else {
            break;
        };
        match frame {
            Inbound::Notification { method, params } => inner.route_notification(method, params),
            Inbound::Request { id, method, params } => {
                let rpc = rpc.clone();
                tokio::spawn(async move {
                    let outcome = inner.handle_request(&method, params).await;
                    if let Err(e) = rpc.respond(&id, outcome).await {
                        tracing::debug!(method, error = %e, "Failed to answer agent request");
                    }
                });
            }
        }
    }
}

/// A connection to one agent process, multiplexing any number of sessions.
///
/// Cloning is cheap; clones share the same link, sessions and plugins.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self::with_plugins(options, Arc::new(PluginManager::new()))
    }

    /// Use `registry` as the catalog for `/plugins install`.
    #[must_use]
    pub fn with_plugin_registry(options: ClientOptions, registry: Arc<PluginRegistry>) -> Self {
        Self::with_plugins(options, Arc::new(PluginManager::with_registry(registry)))
    }

    fn with_plugins(options: ClientOptions, plugins: Arc<PluginManager>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new_cyclic(|this| ConnectionInner {
            options,
            registry: SessionRegistry::new(),
            plugins,
            this: this.clone(),
            state,
            lifecycle: tokio::sync::Mutex::new(()),
            link: RwLock::new(None),
            events: EventDispatcher::new("connection"),
            stopping: AtomicBool::new(false),
            custom_io: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            restart_attempts: AtomicU32::new(0),
            models: Mutex::new(None),
            supervisor: Mutex::new(None),
        });
        Self { inner }
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that follows the connection state.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The plugin pipeline shared by every session of this connection.
    #[must_use]
    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.inner.plugins
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Subscribe to connection-scoped events.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler)
    }

    /// Receiver for connection subscriber panics.
    #[must_use]
    pub fn faults(&self) -> tokio::sync::broadcast::Receiver<DispatchFault> {
        self.inner.events.faults()
    }

    /// Spawn or attach to the agent and check its protocol version.
    ///
    /// On failure nothing is left running and the state is `Disconnected`.
    ///
    /// # Errors
    /// `InvalidConfig`, `ProcessNotFound`, `ConnectionRefused`,
    /// `ProtocolMismatch` or a transport error from the handshake.
    pub async fn start(&self) -> Result<()> {
        self.inner.options.validate()?;
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.stopping.store(false, Ordering::Release);
        if self.inner.current_rpc().is_some() {
            return Ok(());
        }
        self.inner.custom_io.store(false, Ordering::Release);
        self.inner.restart_attempts.store(0, Ordering::Release);
        self.inner.connect(ConnectionState::Disconnected).await
    }

    /// Attach to an agent over caller-supplied I/O, e.g. an in-process
    /// agent. Such links are never restarted.
    ///
    /// # Errors
    /// `ProtocolMismatch` or a transport error from the handshake.
    pub async fn start_with_io<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        inner.stopping.store(false, Ordering::Release);
        if inner.current_rpc().is_some() {
            return Err(Error::InvalidConfig("connection is already started".to_string()));
        }
        inner.custom_io.store(true, Ordering::Release);
        inner.ensure_supervisor();
        inner.set_state(ConnectionState::Connecting);
        let result = inner
            .establish(Transport::from_io(reader, writer), false)
            .await;
        inner.settle(result, ConnectionState::Disconnected)
    }

    /// Graceful shutdown.
    ///
    /// Ends every session (running `onSessionEnd` and a best-effort remote
    /// destroy), waits for in-flight calls to drain, closes the transport
    /// and waits for the agent to exit. All of it shares one deadline of
    /// `stop_timeout`. Errors met on the way are returned rather than
    /// raised; the connection always ends `Disconnected`.
    pub async fn stop(&self) -> Vec<Error> {
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::Release);
        let _lifecycle = inner.lifecycle.lock().await;
        let timeout = inner.options.stop_timeout;
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let mut errors = Vec::new();

        let sessions = inner.registry.drain();
        let teardown = join_all(
            sessions
                .iter()
                .map(|session| session.close(inner, true, remaining())),
        );
        match tokio::time::timeout(remaining(), teardown).await {
            Ok(failures) => errors.extend(failures.into_iter().flatten()),
            Err(_) => {
                tracing::debug!(sessions = sessions.len(), "Session teardown did not finish in time");
                errors.push(Error::Timeout(timeout));
            }
        }
        for session in &sessions {
            session.release();
            inner.plugins.store().close_session(session.id());
        }

        let link = inner.write_link().take();
        if let Some(mut link) = link {
            if !link.rpc.drain(remaining()).await {
                tracing::debug!(pending = link.rpc.pending_count(), "In-flight calls did not drain");
                errors.push(Error::Timeout(timeout));
            }
            link.rpc.close().await;
            if let Some(process) = link.process.as_mut() {
                process.kill();
                if process.wait_timeout(remaining()).await.is_none() {
                    tracing::debug!(pid = ?process.pid(), "Agent did not exit in time");
                    errors.push(Error::Timeout(timeout));
                }
            }
        }

        inner.clear_models();
        inner.set_state(ConnectionState::Disconnected);
        tracing::info!(errors = errors.len(), "Connection stopped");
        errors
    }

    /// Tear everything down immediately: no hooks, no draining, no remote
    /// calls.
    pub fn force_stop(&self) {
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::Release);
        for session in inner.registry.drain() {
            session.shut();
            inner.plugins.store().close_session(session.id());
        }
        let link = inner.write_link().take();
        if let Some(mut link) = link {
            link.abort();
        }
        inner.clear_models();
        inner.set_state(ConnectionState::Disconnected);
        tracing::info!("Connection force-stopped");
    }

    /// Create a session and run `onSessionCreated` before returning it.
    ///
    /// # Errors
    /// Returns error if the `session.create` call fails.
    pub async fn create_session(&self, config: SessionConfig) -> Result<Arc<Session>> {
        config.validate()?;
        let reply = self.inner.call("session.create", config.to_params()).await?;
        let opened: OpenedSession = serde_json::from_value(reply)?;
        tracing::debug!(session_id = %opened.session_id, "Session created");

        let handlers = Handlers {
            tools: config.tools,
            permission: config.permission_handler,
            user_input: config.user_input_handler,
        };
        Ok(self.inner.open_session(opened, handlers, Vec::new()).await)
    }

    /// Resume a persisted session. Its history is fetched from the agent
    /// before the session is returned.
    ///
    /// Resuming an id that is live on this connection ends the live session
    /// first (running `onSessionEnd`); the returned session replaces it.
    ///
    /// # Errors
    /// `SessionNotFound` when the agent does not know `session_id`.
    pub async fn resume_session(
        &self,
        session_id: &str,
        config: ResumeSessionConfig,
    ) -> Result<Arc<Session>> {
        if let Some(live) = self.inner.registry.remove(session_id) {
            tracing::debug!(session_id, "Ending live session before resume");
            live.close(&self.inner, false, self.inner.options.request_timeout)
                .await;
        }

        let reply = match self
            .inner
            .call("session.resume", config.to_params(session_id))
            .await
        {
            Err(Error::Remote(e)) if e.is_session_not_found() => {
                return Err(Error::SessionNotFound(session_id.to_string()));
            }
            other => other?,
        };
        let opened: OpenedSession = serde_json::from_value(reply)?;
        let history = self.fetch_history(&opened.session_id).await?;
        tracing::debug!(session_id = %opened.session_id, events = history.len(), "Session resumed");

        let handlers = Handlers {
            tools: config.tools,
            permission: config.permission_handler,
            user_input: config.user_input_handler,
        };
        Ok(self.inner.open_session(opened, handlers, history).await)
    }

    async fn fetch_history(&self, session_id: &str) -> Result<Vec<SessionEvent>> {
        let reply = self
            .inner
            .call("session.getMessages", json!({ "sessionId": session_id }))
            .await?;
        match reply.get("events") {
            Some(events) => Ok(serde_json::from_value(events.clone())?),
            None => Ok(Vec::new()),
        }
    }

    /// A live session of this connection.
    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.registry.get(session_id)
    }

    /// Sessions persisted by the agent.
    ///
    /// # Errors
    /// Returns error if the `session.list` call fails.
    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>> {
        let reply = self.inner.call("session.list", json!({})).await?;
        match reply.get("sessions") {
            Some(sessions) => Ok(serde_json::from_value(sessions.clone())?),
            None => Ok(Vec::new()),
        }
    }

    /// Permanently delete a persisted session, ending the local record too.
    ///
    /// # Errors
    /// `SessionNotFound` when the agent does not know `session_id`.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let reply = match self
            .inner
            .call("session.delete", json!({ "sessionId": session_id }))
            .await
        {
            Err(Error::Remote(e)) if e.is_session_not_found() => {
                return Err(Error::SessionNotFound(session_id.to_string()));
            }
            other => other?,
        };
        if reply.get("success").and_then(Value::as_bool) == Some(false) {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let error = RpcError::new(RpcError::INTERNAL_ERROR, message);
            if error.is_session_not_found() {
                return Err(Error::SessionNotFound(session_id.to_string()));
            }
            return Err(Error::Remote(error));
        }

        if let Some(session) = self.inner.registry.remove(session_id) {
            session
                .close(&self.inner, false, self.inner.options.request_timeout)
                .await;
        }
        Ok(())
    }

    /// Id of the most recently used persisted session.
    ///
    /// # Errors
    /// Returns error if the `session.getLastId` call fails.
    pub async fn get_last_session_id(&self) -> Result<Option<String>> {
        let reply = self.inner.call("session.getLastId", json!({})).await?;
        Ok(reply
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// # Errors
    /// Returns error if the `ping` call fails.
    pub async fn ping(&self, message: Option<&str>) -> Result<PingResponse> {
        let reply = self.inner.call("ping", json!({ "message": message })).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// # Errors
    /// Returns error if the `status.get` call fails.
    pub async fn get_status(&self) -> Result<GetStatusResponse> {
        let reply = self.inner.call("status.get", json!({})).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Models the agent offers. Cached until the link goes away.
    ///
    /// # Errors
    /// Returns error if the `models.list` call fails.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let cached = self
            .inner
            .models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(models) = cached {
            return Ok(models);
        }

        let reply = self.inner.call("models.list", json!({})).await?;
        let models: Vec<ModelInfo> = match reply.get("models") {
            Some(models) => serde_json::from_value(models.clone())?,
            None => Vec::new(),
        };
        *self
            .inner
            .models
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(models.clone());
        Ok(models)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("sessions", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::testing::{FakeAgent, connected, connected_with};
    use agentlink_core::{
        InfiniteSessionConfig, PermissionHandler, PermissionResult, ReasoningEffort,
        UserInputHandler, UserInputResponse,
    };
    use agentlink_plugins::{HookKind, HookResult, Plugin, PluginContext};
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(5);

    struct Lifecycle {
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Plugin for Lifecycle {
        fn name(&self) -> &str {
            "lifecycle"
        }

        fn hooks(&self) -> &[HookKind] {
            &[HookKind::SessionCreated, HookKind::SessionEnd]
        }

        async fn on_session_created(&self, ctx: &PluginContext) -> HookResult<()> {
            self.log.lock().unwrap().push(format!("created:{}", ctx.session_id()));
            Ok(())
        }

        async fn on_session_end(&self, ctx: &PluginContext) -> HookResult<()> {
            self.log.lock().unwrap().push(format!("end:{}", ctx.session_id()));
            Ok(())
        }
    }

    struct DenyAll;

    #[async_trait::async_trait]
    impl PermissionHandler for DenyAll {
        async fn request_permission(
            &self,
            _session_id: &str,
            _request: PermissionRequest,
        ) -> PermissionResult {
            PermissionResult::denied()
        }
    }

    struct FirstChoice;

    #[async_trait::async_trait]
    impl UserInputHandler for FirstChoice {
        async fn request_user_input(
            &self,
            _session_id: &str,
            request: UserInputRequest,
        ) -> Result<UserInputResponse> {
            let choices = request.choices.unwrap_or_default();
            match choices.first() {
                Some(choice) => Ok(UserInputResponse::choice(choice.clone())),
                None => Ok(UserInputResponse::freeform(format!("re: {}", request.question))),
            }
        }
    }

    fn recorded_events(connection: &Connection) -> Arc<StdMutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = connection.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    #[tokio::test]
    async fn test_handshake_connects() {
        let (connection, _agent) = connected().await;
        assert_eq!(connection.state(), ConnectionState::Connected);

        let pong = connection.ping(Some("hello")).await.unwrap();
        assert_eq!(pong.protocol_version, Some(SDK_PROTOCOL_VERSION));
        assert_eq!(pong.message.as_deref(), Some("pong: hello"));
        let status = connection.get_status().await.unwrap();
        assert_eq!(status.protocol_version, SDK_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_protocol_mismatch_leaves_disconnected() {
        let (agent, reader, writer) = FakeAgent::start(SDK_PROTOCOL_VERSION + 1);
        let connection = Connection::new(ClientOptions::new());
        let events = recorded_events(&connection);

        let err = assert_err!(connection.start_with_io(reader, writer).await);
        assert!(matches!(
            err,
            Error::ProtocolMismatch { expected: 1, actual: Some(2) }
        ));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(agent.calls("ping"), 1);
        assert_eq!(
            *events.lock().unwrap(),
            [
                ConnectionEvent::StateChanged(ConnectionState::Connecting),
                ConnectionEvent::StateChanged(ConnectionState::Disconnected),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_executable_is_process_not_found() {
        let connection = Connection::new(
            ClientOptions::new().cli_path("/nonexistent/agentlink-test/agent-binary"),
        );
        let err = connection.start().await.unwrap_err();
        assert!(matches!(err, Error::ProcessNotFound(_)), "{err:?}");
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_contradictory_options_fail_synchronously() {
        let connection =
            Connection::new(ClientOptions::new().cli_url("localhost:4321").cli_path("agent"));
        assert!(matches!(
            connection.start().await,
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unknown_agent_request_answers_method_not_found() {
        let (_connection, agent) = connected().await;
        let err = agent
            .request("bogus.method", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err["code"], RpcError::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tool_call_for_unknown_tool_returns_failure_result() {
        let (connection, agent) = connected().await;
        let session = connection.create_session(SessionConfig::new()).await.unwrap();

        let reply = agent
            .request(
                "tool.call",
                json!({
                    "sessionId": session.id(),
                    "toolCallId": "call-1",
                    "toolName": "missing",
                    "arguments": {}
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply["result"]["resultType"], "failure");
        assert!(reply["result"]["error"].as_str().unwrap().contains("missing"));

        let err = agent
            .request(
                "tool.call",
                json!({"sessionId": "nope", "toolCallId": "c", "toolName": "x"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err["code"], RpcError::SESSION_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_permission_defaults_to_approve() {
        let (connection, agent) = connected().await;
        let open = connection.create_session(SessionConfig::new()).await.unwrap();
        let strict = connection
            .create_session(SessionConfig::new().permission_handler(Arc::new(DenyAll)))
            .await
            .unwrap();

        let ask = |id: &str| {
            json!({
                "sessionId": id,
                "permissionRequest": {"kind": "shell", "toolCallId": "t1"}
            })
        };
        let approved = agent.request("permission.request", ask(open.id())).await.unwrap();
        assert_eq!(approved["result"]["kind"], "approved");
        let denied = agent.request("permission.request", ask(strict.id())).await.unwrap();
        assert_ne!(denied["result"]["kind"], "approved");
    }

    #[tokio::test]
    async fn test_hooks_invoke_passes_through_without_plugins() {
        let (connection, agent) = connected().await;
        let session = connection.create_session(SessionConfig::new()).await.unwrap();
        let reply = agent
            .request(
                "hooks.invoke",
                json!({
                    "sessionId": session.id(),
                    "hookType": "preToolUse",
                    "input": {"toolName": "view", "toolArgs": {}}
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({ "output": null }));
    }

    #[tokio::test]
    async fn test_lifecycle_and_other_notifications_reach_connection_subscribers() {
        let (connection, agent) = connected().await;
        let events = recorded_events(&connection);

        agent.notify(
            "session.lifecycle",
            json!({"type": "session.deleted", "sessionId": "s9"}),
        );
        agent.notify("account.changed", json!({"plan": "pro"}));

        let seen = Arc::clone(&events);
        tokio::time::timeout(WAIT, async move {
            while seen.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(
            &events[0],
            ConnectionEvent::Lifecycle(LifecycleEvent { kind, session_id, .. })
                if kind == "session.deleted" && session_id == "s9"
        ));
        assert_eq!(
            events[1],
            ConnectionEvent::Notification {
                method: "account.changed".into(),
                params: json!({"plan": "pro"}),
            }
        );
    }

    #[tokio::test]
    async fn test_create_runs_session_created_before_returning() {
        let (connection, _agent) = connected().await;
        let log = Arc::new(StdMutex::new(Vec::new()));
        connection
            .plugins()
            .register(Arc::new(Lifecycle { log: Arc::clone(&log) }))
            .await
            .unwrap();

        let session = connection.create_session(SessionConfig::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), [format!("created:{}", session.id())]);
        assert_eq!(session.workspace_path(), Some(format!("/work/{}", session.id()).as_str()));
        assert!(connection.get_session(session.id()).is_some());
    }

    #[tokio::test]
    async fn test_resume_unknown_session_is_not_found() {
        let (connection, _agent) = connected().await;
        let err = connection
            .resume_session("does-not-exist", ResumeSessionConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(ref id) if id == "does-not-exist"));
        assert!(connection.registry().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_api() {
        let (connection, _agent) = connected().await;
        let first = connection.create_session(SessionConfig::new()).await.unwrap();
        let second = connection
            .create_session(SessionConfig::new().session_id("named"))
            .await
            .unwrap();
        assert_eq!(second.id(), "named");

        let mut listed: Vec<String> = connection
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.session_id)
            .collect();
        listed.sort();
        let mut expected = vec![first.id().to_string(), "named".to_string()];
        expected.sort();
        assert_eq!(listed, expected);
        assert_eq!(
            connection.get_last_session_id().await.unwrap().as_deref(),
            Some("named")
        );

        assert_ok!(connection.delete_session("named").await);
        assert!(connection.get_session("named").is_none());
        assert!(second.is_destroyed());
        assert!(matches!(
            connection.delete_session("named").await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            connection
                .resume_session("named", ResumeSessionConfig::new())
                .await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_models_are_cached() {
        let (connection, agent) = connected().await;
        let first = connection.list_models().await.unwrap();
        let second = connection.list_models().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].id, "test-model");
        assert_eq!(agent.calls("models.list"), 1);
    }

    #[tokio::test]
    async fn test_link_loss_moves_to_error_and_reports_exit() {
        let (connection, agent) = connected().await;
        let events = recorded_events(&connection);
        let mut state = connection.state_watch();

        agent.crash();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Error))
            .await
            .unwrap()
            .unwrap();

        assert!(
            events
                .lock()
                .unwrap()
                .contains(&ConnectionEvent::AgentExited { exit: None })
        );
        // Custom I/O cannot be re-established automatically.
        assert!(matches!(
            connection.ping(None).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_stop_ends_sessions_and_disconnects() {
        let (connection, agent) = connected().await;
        let log = Arc::new(StdMutex::new(Vec::new()));
        connection
            .plugins()
            .register(Arc::new(Lifecycle { log: Arc::clone(&log) }))
            .await
            .unwrap();
        let session = connection.create_session(SessionConfig::new()).await.unwrap();

        let errors = connection.stop().await;
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.registry().is_empty());
        assert!(session.is_destroyed());
        assert_eq!(agent.calls("session.destroy"), 1);
        assert_eq!(log.lock().unwrap().last().unwrap(), &format!("end:{}", session.id()));

        // No silent restart after an explicit stop.
        assert!(matches!(
            connection.ping(None).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_stop_reports_failed_remote_teardown() {
        let (connection, agent) = connected().await;
        let _session = connection.create_session(SessionConfig::new()).await.unwrap();
        agent.fail_method("session.destroy");

        let errors = connection.stop().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_remote());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_force_stop_skips_hooks() {
        let (connection, agent) = connected().await;
        let log = Arc::new(StdMutex::new(Vec::new()));
        connection
            .plugins()
            .register(Arc::new(Lifecycle { log: Arc::clone(&log) }))
            .await
            .unwrap();
        let session = connection.create_session(SessionConfig::new()).await.unwrap();

        connection.force_stop();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(session.is_destroyed());
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(agent.calls("session.destroy"), 0);
    }

    #[tokio::test]
    async fn test_pending_call_fails_when_link_drops() {
        let (connection, agent) = connected().await;
        agent.stall_method("status.get");

        let call = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.get_status().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent.crash();
        assert!(matches!(call.await.unwrap(), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_stop_is_bounded_by_one_deadline() {
        let (connection, agent) =
            connected_with(ClientOptions::new().stop_timeout(Duration::from_millis(200))).await;
        for _ in 0..4 {
            connection.create_session(SessionConfig::new()).await.unwrap();
        }
        agent.stall_method("session.destroy");

        let started = Instant::now();
        let errors = connection.stop().await;
        assert!(
            started.elapsed() < Duration::from_millis(600),
            "stop took {:?}",
            started.elapsed()
        );
        assert!(errors.iter().any(|e| matches!(e, Error::Timeout(_))), "{errors:?}");
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.registry().is_empty());
    }

    #[tokio::test]
    async fn test_link_finished_after_force_stop_is_discarded() {
        let (connection, _first) = connected().await;
        connection.force_stop();

        // A restart that was mid-handshake when the stop landed.
        let (agent, reader, writer) = FakeAgent::start(SDK_PROTOCOL_VERSION);
        let inner = &connection.inner;
        inner.set_state(ConnectionState::Connecting);
        let result = inner
            .establish(Transport::from_io(reader, writer), true)
            .await;
        let err = assert_err!(inner.settle(result, ConnectionState::Error));

        assert!(matches!(err, Error::NotConnected), "{err:?}");
        assert_eq!(agent.calls("ping"), 1);
        assert!(inner.current_rpc().is_none());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_promote_refuses_after_state_moved_on() {
        let (connection, _agent) = connected().await;
        let inner = &connection.inner;
        inner.set_state(ConnectionState::Disconnected);
        assert!(!inner.promote());
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        inner.set_state(ConnectionState::Connecting);
        assert!(inner.promote());
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_resuming_live_session_ends_it_first() {
        let (connection, agent) = connected().await;
        let log = Arc::new(StdMutex::new(Vec::new()));
        connection
            .plugins()
            .register(Arc::new(Lifecycle { log: Arc::clone(&log) }))
            .await
            .unwrap();
        let live = connection.create_session(SessionConfig::new()).await.unwrap();
        let id = live.id().to_string();

        let resumed = connection
            .resume_session(&id, ResumeSessionConfig::new())
            .await
            .unwrap();

        assert!(live.is_destroyed());
        assert!(!resumed.is_destroyed());
        assert_eq!(
            *log.lock().unwrap(),
            [format!("created:{id}"), format!("end:{id}"), format!("created:{id}")]
        );
        assert_eq!(connection.registry().len(), 1);
        assert!(Arc::ptr_eq(&connection.get_session(&id).unwrap(), &resumed));
        assert_eq!(agent.calls("session.destroy"), 0);
    }

    #[tokio::test]
    async fn test_create_sends_effort_skills_and_compaction() {
        let (connection, agent) = connected().await;
        connection
            .create_session(
                SessionConfig::new()
                    .reasoning_effort(ReasoningEffort::High)
                    .disabled_skills(["web"])
                    .infinite_sessions(InfiniteSessionConfig::enabled().thresholds(0.7, 0.9)),
            )
            .await
            .unwrap();

        let params = agent.last_params("session.create");
        assert_eq!(params["reasoningEffort"], "high");
        assert_eq!(params["disabledSkills"], json!(["web"]));
        assert_eq!(params["infiniteSessions"]["enabled"], true);
        assert_eq!(params["requestUserInput"], false);
    }

    #[tokio::test]
    async fn test_invalid_session_config_is_rejected_locally() {
        let (connection, agent) = connected().await;
        let err = connection
            .create_session(
                SessionConfig::new()
                    .infinite_sessions(InfiniteSessionConfig::enabled().thresholds(0.9, 0.5)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err:?}");
        assert_eq!(agent.calls("session.create"), 0);
    }

    #[tokio::test]
    async fn test_user_input_request_reaches_session_handler() {
        let (connection, agent) = connected().await;
        let asking = connection
            .create_session(SessionConfig::new().user_input_handler(Arc::new(FirstChoice)))
            .await
            .unwrap();
        let silent = connection.create_session(SessionConfig::new()).await.unwrap();
        assert_eq!(agent.last_params("session.create")["requestUserInput"], false);

        let ask = |id: &str| {
            json!({
                "sessionId": id,
                "question": "Proceed?",
                "choices": ["yes", "no"],
            })
        };
        let answer = agent.request("userInput.request", ask(asking.id())).await.unwrap();
        assert_eq!(answer, json!({"answer": "yes", "wasFreeform": false}));

        let err = agent
            .request("userInput.request", ask(silent.id()))
            .await
            .unwrap_err();
        assert_eq!(err["code"], RpcError::INTERNAL_ERROR);

        let err = agent
            .request("userInput.request", ask("nope"))
            .await
            .unwrap_err();
        assert_eq!(err["code"], RpcError::SESSION_NOT_FOUND);
    }
}
