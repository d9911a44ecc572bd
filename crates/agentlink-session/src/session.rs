//! One conversation with the agent.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, stream::BoxStream};
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, watch};

use agentlink_core::{
    DispatchFault, Error, EventData, EventDispatcher, EventLog, MessageOptions, PermissionHandler,
    PermissionRequest, PermissionResult, Result, RpcError, SessionEvent, SessionEventType,
    SessionHandle, Subscription, Tool, ToolHandler, ToolInvocation, ToolResult, UserInputHandler,
    UserInputRequest, UserInputResponse, panic_message,
};
use agentlink_plugins::CommandOutcome;

use crate::{
    connection::ConnectionInner,
    types::{SendOutcome, TurnState},
};

/// Caller-side handlers a session answers agent requests with.
#[derive(Default)]
pub(crate) struct Handlers {
    pub(crate) tools: Vec<Tool>,
    pub(crate) permission: Option<Arc<dyn PermissionHandler>>,
    pub(crate) user_input: Option<Arc<dyn UserInputHandler>>,
}

/// A live session.
///
/// Events from the agent are appended to the session's history and then
/// delivered, after the `onSessionEvent` plugin chain, to subscribers in
/// arrival order. History always holds events as the agent produced them.
///
/// The session refers to its connection weakly: dropping the
/// [`Connection`](crate::Connection) ends every session.
pub struct Session {
    id: String,
    workspace_path: Option<String>,
    connection: Weak<ConnectionInner>,
    this: Weak<Self>,
    log: EventLog,
    dispatcher: EventDispatcher<SessionEvent>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    permission_handler: Option<Arc<dyn PermissionHandler>>,
    user_input_handler: Option<Arc<dyn UserInputHandler>>,
    turn: watch::Sender<TurnState>,
    interrupts: watch::Sender<u64>,
    send_lock: tokio::sync::Mutex<()>,
    destroyed: AtomicBool,
}

impl Session {
    /// Build a session and start its event pump. The returned sender feeds
    /// the pump; dropping it stops the pump.
    pub(crate) fn spawn(
        connection: Weak<ConnectionInner>,
        id: String,
        workspace_path: Option<String>,
        handlers: Handlers,
    ) -> (Arc<Self>, mpsc::UnboundedSender<SessionEvent>) {
        let (turn, _) = watch::channel(TurnState::Idle);
        let (interrupts, _) = watch::channel(0);
        let session = Arc::new_cyclic(|this| Self {
            dispatcher: EventDispatcher::new(format!("session:{id}")),
            id,
            workspace_path,
            connection,
            this: this.clone(),
            log: EventLog::new(),
            tools: handlers
                .tools
                .into_iter()
                .map(|tool| (tool.name, tool.handler))
                .collect(),
            permission_handler: handlers.permission,
            user_input_handler: handlers.user_input,
            turn,
            interrupts,
            send_lock: tokio::sync::Mutex::new(()),
            destroyed: AtomicBool::new(false),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pump = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                pump.deliver(event).await;
            }
            tracing::trace!(session_id = %pump.id, "Event pump stopped");
        });
        (session, tx)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn workspace_path(&self) -> Option<&str> {
        self.workspace_path.as_deref()
    }

    #[must_use]
    pub fn turn_state(&self) -> TurnState {
        *self.turn.borrow()
    }

    /// Receiver that follows the turn state.
    #[must_use]
    pub fn turn_watch(&self) -> watch::Receiver<TurnState> {
        self.turn.subscribe()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// History snapshot at call time.
    #[must_use]
    pub fn get_messages(&self) -> Vec<SessionEvent> {
        self.log.snapshot()
    }

    /// Subscribe to every event.
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(handler)
    }

    /// Subscribe to events of one type.
    pub fn on_type<F>(&self, event_type: SessionEventType, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.dispatcher
            .subscribe_filtered(move |e: &SessionEvent| e.r#type == event_type, handler)
    }

    /// History followed by live events, as produced by the agent.
    #[must_use]
    pub fn event_stream(&self) -> BoxStream<'static, SessionEvent> {
        self.log.history_plus_stream()
    }

    /// Receiver for subscriber panics.
    #[must_use]
    pub fn faults(&self) -> tokio::sync::broadcast::Receiver<DispatchFault> {
        self.dispatcher.faults()
    }

    /// Send a message. Returns once the agent has accepted it.
    ///
    /// `/plugins` commands are handled locally and never reach the agent.
    /// Sends on one session are serialized from the prompt hooks through
    /// the agent's acknowledgement, so enqueued messages reach the agent in
    /// the order `send` was called.
    ///
    /// # Errors
    /// `PromptRejected` when a plugin rejects the prompt, `TurnInProgress`
    /// when a turn is active and the message is not enqueued, plus any
    /// transport or remote error from `session.send`.
    pub async fn send(&self, options: MessageOptions) -> Result<SendOutcome> {
        let connection = self.connection()?;
        if let Some(outcome) = connection.plugins.handle_command(&options.prompt).await {
            return Ok(SendOutcome::Command(outcome));
        }

        let _serial = self.send_lock.lock().await;
        let prompt = connection
            .plugins
            .user_prompt_submitted(&self.handle()?, &options.prompt)
            .await?
            .into_message();

        if !options.is_enqueue() && self.turn_state() == TurnState::Active {
            return Err(Error::TurnInProgress(self.id.clone()));
        }

        let mut params = Map::new();
        params.insert("sessionId".into(), Value::String(self.id.clone()));
        params.insert("prompt".into(), Value::String(prompt));
        if !options.attachments.is_empty() {
            params.insert("attachments".into(), serde_json::to_value(&options.attachments)?);
        }
        if let Some(mode) = options.mode {
            params.insert("mode".into(), serde_json::to_value(mode)?);
        }

        let previous = self.turn.send_replace(TurnState::Active);
        match connection.call("session.send", Value::Object(params)).await {
            Ok(reply) => Ok(SendOutcome::Accepted {
                message_id: reply
                    .get("messageId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            Err(e) => {
                self.turn.send_replace(previous);
                Err(e)
            }
        }
    }

    /// Send a message and wait for the turn to end.
    ///
    /// Returns the last `assistant.message` of the turn, or `None` if the
    /// turn produced none. A `/plugins` command yields a synthesized
    /// assistant message that is not added to history. On timeout the
    /// remote turn keeps running; call [`Session::abort`] to stop it.
    ///
    /// # Errors
    /// Everything [`Session::send`] returns, `Timeout` when `timeout`
    /// elapses first, `ConnectionClosed` when the link drops mid-turn.
    pub async fn send_and_wait(
        &self,
        options: MessageOptions,
        timeout: Duration,
    ) -> Result<Option<SessionEvent>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscription = self.dispatcher.subscribe(move |event: &SessionEvent| {
            let _ = tx.send(event.clone());
        });
        let mut interrupts = self.interrupts.subscribe();

        let result = async {
            if let SendOutcome::Command(outcome) = self.send(options).await? {
                return Ok(Some(command_reply(&outcome)));
            }
            tokio::time::timeout(timeout, wait_turn_end(&mut rx, &mut interrupts))
                .await
                .map_err(|_| Error::Timeout(timeout))?
        }
        .await;

        subscription.unsubscribe();
        result
    }

    /// Ask the agent to stop the current turn. The session stays usable.
    ///
    /// # Errors
    /// Returns error if the `session.abort` call fails.
    pub async fn abort(&self) -> Result<()> {
        let connection = self.connection()?;
        connection
            .call("session.abort", json!({ "sessionId": self.id }))
            .await?;
        Ok(())
    }

    /// Switch the model used for the rest of the session. The agent reports
    /// the change as a `session.model_change` event.
    ///
    /// # Errors
    /// Returns error if the `session.model.switchTo` call fails.
    pub async fn switch_model(&self, model: &str) -> Result<()> {
        let connection = self.connection()?;
        connection
            .call(
                "session.model.switchTo",
                json!({ "sessionId": self.id, "modelId": model }),
            )
            .await?;
        tracing::debug!(session_id = %self.id, model, "Model switched");
        Ok(())
    }

    /// Unregister the session and run `onSessionEnd`. Remote teardown is
    /// best-effort; a missing connection is not an error. Idempotent.
    pub async fn destroy(&self) {
        match self.connection.upgrade() {
            Some(connection) => {
                connection.registry.remove(&self.id);
                let timeout = connection.options.request_timeout;
                let _ = self.close(&connection, true, timeout).await;
            }
            None => self.shut(),
        }
    }

    /// Local teardown shared by `destroy`, `delete_session` and `stop`.
    /// Returns the remote teardown error, if any.
    pub(crate) async fn close(
        &self,
        connection: &ConnectionInner,
        remote: bool,
        timeout: Duration,
    ) -> Option<Error> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.interrupt_turn();

        if let Some(handle) = self.this.upgrade() {
            let handle: Arc<dyn SessionHandle> = handle;
            connection.plugins.session_end(&handle).await;
        }

        let mut failure = None;
        if remote {
            if let Some(rpc) = connection.current_rpc() {
                if let Err(e) = rpc
                    .call("session.destroy", json!({ "sessionId": self.id }), timeout)
                    .await
                {
                    tracing::debug!(session_id = %self.id, error = %e, "Remote session teardown failed");
                    failure = Some(e);
                }
            }
        }

        self.dispatcher.clear();
        tracing::debug!(session_id = %self.id, "Session closed");
        failure
    }

    /// Teardown without hooks or remote calls.
    pub(crate) fn shut(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.release();
        }
    }

    /// Wake waiters and drop subscribers. Safe to repeat.
    pub(crate) fn release(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.interrupt_turn();
        self.dispatcher.clear();
    }

    /// Force the turn to idle and wake anyone waiting on it.
    pub(crate) fn interrupt_turn(&self) {
        self.turn.send_replace(TurnState::Idle);
        self.interrupts.send_modify(|n| *n += 1);
    }

    /// Seed history with a transcript fetched from the agent.
    pub(crate) fn seed_history(&self, events: Vec<SessionEvent>) -> usize {
        self.log.extend_history(events)
    }

    pub(crate) async fn invoke_tool(
        &self,
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
    ) -> ToolResult {
        let Some(handler) = self.tools.get(&tool_name).cloned() else {
            tracing::debug!(session_id = %self.id, tool = %tool_name, "Tool not registered");
            return ToolResult::unsupported(&tool_name);
        };

        let invocation = ToolInvocation {
            session_id: self.id.clone(),
            tool_call_id,
            tool_name: tool_name.clone(),
            arguments,
        };
        match AssertUnwindSafe(handler.call(invocation)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::debug!(session_id = %self.id, tool = %tool_name, error = %e, "Tool failed");
                ToolResult::failure(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(session_id = %self.id, tool = %tool_name, "Tool handler panicked: {message}");
                ToolResult::failure(message)
            }
        }
    }

    pub(crate) async fn request_permission(&self, request: PermissionRequest) -> PermissionResult {
        match &self.permission_handler {
            Some(handler) => handler.request_permission(&self.id, request).await,
            None => PermissionResult::approved(),
        }
    }

    pub(crate) async fn request_user_input(
        &self,
        request: UserInputRequest,
    ) -> std::result::Result<UserInputResponse, RpcError> {
        let Some(handler) = self.user_input_handler.clone() else {
            return Err(RpcError::new(
                RpcError::INTERNAL_ERROR,
                "User input requested but no handler is registered",
            ));
        };
        match AssertUnwindSafe(handler.request_user_input(&self.id, request))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::debug!(session_id = %self.id, error = %e, "User input handler failed");
                Err(RpcError::new(RpcError::INTERNAL_ERROR, e.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(session_id = %self.id, "User input handler panicked: {message}");
                Err(RpcError::new(RpcError::INTERNAL_ERROR, message))
            }
        }
    }

    pub(crate) fn handle(&self) -> Result<Arc<dyn SessionHandle>> {
        match self.this.upgrade() {
            Some(this) => Ok(this),
            None => Err(Error::SessionNotFound(self.id.clone())),
        }
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>> {
        if self.is_destroyed() {
            return Err(Error::SessionNotFound(self.id.clone()));
        }
        self.connection.upgrade().ok_or(Error::NotConnected)
    }

    async fn deliver(&self, event: SessionEvent) {
        if !self.log.push(event.clone()) {
            return;
        }
        if event.r#type.ends_turn() {
            self.turn.send_replace(TurnState::Idle);
        } else if event.r#type == SessionEventType::AssistantTurnStart {
            self.turn.send_replace(TurnState::Active);
        }

        let event = match (self.connection.upgrade(), self.this.upgrade()) {
            (Some(connection), Some(this)) => {
                let handle: Arc<dyn SessionHandle> = this;
                connection.plugins.session_event(&handle, event).await
            }
            _ => event,
        };
        self.dispatcher.dispatch(&event);
    }
}

impl SessionHandle for Session {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn messages(&self) -> Vec<SessionEvent> {
        self.log.snapshot()
    }

    fn workspace_path(&self) -> Option<&str> {
        self.workspace_path.as_deref()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("turn", &self.turn_state())
            .field("events", &self.log.len())
            .finish_non_exhaustive()
    }
}

async fn wait_turn_end(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    interrupts: &mut watch::Receiver<u64>,
) -> Result<Option<SessionEvent>> {
    let mut last = None;
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                let Some(event) = event else {
                    return Err(Error::ConnectionClosed);
                };
                if matches!(event.r#type, SessionEventType::SessionIdle | SessionEventType::SessionError) {
                    return Ok(last);
                }
                if event.r#type == SessionEventType::AssistantMessage {
                    last = Some(event);
                }
            }
            changed = interrupts.changed() => {
                if changed.is_ok() {
                    tracing::debug!("Turn interrupted before completion");
                }
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

fn command_reply(outcome: &CommandOutcome) -> SessionEvent {
    SessionEvent::new(
        SessionEventType::AssistantMessage,
        EventData {
            content: Some(outcome.to_string()),
            ..EventData::default()
        },
    )
}
