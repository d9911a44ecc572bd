//! Scripted in-process agent for tests.
//!
//! Speaks `Content-Length` framed JSON-RPC over duplex pipes. Prompts drive
//! the turn script: `hang` blocks in a tool until aborted, `run shell` asks
//! the client's `preToolUse` hooks before calling the `shell` tool,
//! `call tool <name>` calls a client tool directly and `ask <question>` asks
//! the user through the client. Every turn ends with an `echo: <prompt>`
//! assistant message.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Utc;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    sync::{Notify, mpsc, oneshot},
    task::JoinHandle,
};

use agentlink_core::{ClientOptions, RpcError, SDK_PROTOCOL_VERSION};
use agentlink_transport::{FrameReader, Incoming, write_frame};

use crate::Connection;

const PIPE_CAPACITY: usize = 256 * 1024;

type Reply = Result<Value, Value>;

#[derive(Default)]
struct Record {
    events: Vec<Value>,
    prompts: Vec<String>,
    created: String,
}

struct State {
    protocol_version: u32,
    outbound: mpsc::UnboundedSender<Value>,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<String, Record>>,
    last_session: Mutex<Option<String>>,
    turns: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    hanging: Mutex<HashMap<String, Arc<Notify>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
    params: Mutex<HashMap<String, Value>>,
    answers: Mutex<Vec<Value>>,
    denials: Mutex<Vec<String>>,
    tool_results: Mutex<Vec<Value>>,
    failing: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub(crate) struct FakeAgent {
    state: Arc<State>,
}

/// A connection attached to a fresh fake agent.
pub(crate) async fn connected() -> (Connection, FakeAgent) {
    connected_with(ClientOptions::new()).await
}

pub(crate) async fn connected_with(options: ClientOptions) -> (Connection, FakeAgent) {
    let (agent, reader, writer) = FakeAgent::start(SDK_PROTOCOL_VERSION);
    let connection = Connection::new(options);
    connection.start_with_io(reader, writer).await.unwrap();
    (connection, agent)
}

impl FakeAgent {
    /// Returns the agent plus the client's read and write ends.
    pub(crate) fn start(protocol_version: u32) -> (Self, DuplexStream, DuplexStream) {
        let (client_reader, agent_writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (agent_reader, client_writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (outbound, frames) = mpsc::unbounded_channel();

        let agent = Self {
            state: Arc::new(State {
                protocol_version,
                outbound,
                next_id: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
                last_session: Mutex::new(None),
                turns: Mutex::new(HashMap::new()),
                hanging: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                params: Mutex::new(HashMap::new()),
                answers: Mutex::new(Vec::new()),
                denials: Mutex::new(Vec::new()),
                tool_results: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
                stalled: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        agent.track(tokio::spawn(write_loop(agent_writer, frames)));
        agent.track(tokio::spawn(agent.clone().read_loop(agent_reader)));
        (agent, client_reader, client_writer)
    }

    /// Kill the agent: every pipe closes and nothing more is answered.
    pub(crate) fn crash(&self) {
        for task in self.state.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Answer `method` with an error from now on.
    pub(crate) fn fail_method(&self, method: &str) {
        self.state.failing.lock().unwrap().insert(method.to_string());
    }

    /// Never answer `method`.
    pub(crate) fn stall_method(&self, method: &str) {
        self.state.stalled.lock().unwrap().insert(method.to_string());
    }

    pub(crate) fn calls(&self, method: &str) -> usize {
        self.state.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    /// Ids of every event emitted for `session_id`, in order.
    pub(crate) fn event_ids(&self, session_id: &str) -> Vec<String> {
        self.state
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|r| {
                r.events
                    .iter()
                    .filter_map(|e| e["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Prompts received for `session_id`, in arrival order.
    pub(crate) fn prompts(&self, session_id: &str) -> Vec<String> {
        self.state
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|r| r.prompts.clone())
            .unwrap_or_default()
    }

    /// Params of the latest `method` request.
    pub(crate) fn last_params(&self, method: &str) -> Value {
        self.state
            .params
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or_default()
    }

    /// Replies to `userInput.request`, errors included.
    pub(crate) fn answers(&self) -> Vec<Value> {
        self.state.answers.lock().unwrap().clone()
    }

    pub(crate) fn denials(&self) -> Vec<String> {
        self.state.denials.lock().unwrap().clone()
    }

    pub(crate) fn tool_results(&self) -> Vec<Value> {
        self.state.tool_results.lock().unwrap().clone()
    }

    pub(crate) fn notify(&self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}));
    }

    /// Issue a request to the client. `Err` carries the JSON-RPC error object.
    pub(crate) async fn request(&self, method: &str, params: Value) -> Reply {
        let id = format!("agent-{}", self.next());
        let (tx, rx) = oneshot::channel();
        self.state.pending.lock().unwrap().insert(id.clone(), tx);
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}));
        rx.await
            .unwrap_or_else(|_| Err(json!({"code": 0, "message": "agent stopped"})))
    }

    fn track(&self, task: JoinHandle<()>) {
        self.state.tasks.lock().unwrap().push(task);
    }

    fn next(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, frame: Value) {
        let _ = self.state.outbound.send(frame);
    }

    fn emit(&self, session_id: &str, kind: &str, data: Value) {
        let event = json!({
            "id": format!("ev-{}", self.next()),
            "timestamp": Utc::now(),
            "type": kind,
            "data": data,
        });
        if let Some(record) = self.state.sessions.lock().unwrap().get_mut(session_id) {
            record.events.push(event.clone());
        }
        self.notify("session.event", json!({"sessionId": session_id, "event": event}));
    }

    async fn read_loop<R: AsyncRead + Unpin>(self, reader: R) {
        let mut frames = FrameReader::new(reader);
        while let Ok(Some(body)) = frames.read_frame().await {
            let Ok(frame) = Incoming::parse(&body) else {
                continue;
            };
            match frame {
                Incoming::Request { id, method, params } => {
                    *self.state.calls.lock().unwrap().entry(method.clone()).or_default() += 1;
                    self.state
                        .params
                        .lock()
                        .unwrap()
                        .insert(method.clone(), params.clone());
                    let Some(reply) = self.handle(&method, &params) else {
                        continue;
                    };
                    let frame = match reply {
                        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                        Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
                    };
                    self.send(frame);
                }
                Incoming::Response { id, outcome } => {
                    let key = id.as_str().unwrap_or_default().to_string();
                    if let Some(tx) = self.state.pending.lock().unwrap().remove(&key) {
                        let _ = tx.send(outcome.map_err(|e| serde_json::to_value(e).unwrap()));
                    }
                }
                Incoming::Notification { .. } => {}
            }
        }
    }

    /// `None` leaves the request unanswered.
    fn handle(&self, method: &str, params: &Value) -> Option<Reply> {
        if self.state.stalled.lock().unwrap().contains(method) {
            return None;
        }
        if self.state.failing.lock().unwrap().contains(method) {
            return Some(Err(json!({"code": -32000, "message": "injected failure"})));
        }

        let session_id = params["sessionId"].as_str().map(str::to_string);
        let reply = match method {
            "ping" => Ok(json!({
                "message": format!("pong: {}", params["message"].as_str().unwrap_or_default()),
                "timestamp": Utc::now().timestamp_millis(),
                "protocolVersion": self.state.protocol_version,
            })),
            "status.get" => Ok(json!({
                "version": "0.0.0-test",
                "protocolVersion": self.state.protocol_version,
            })),
            "models.list" => Ok(json!({"models": [{"id": "test-model", "name": "Test Model"}]})),
            "session.create" => {
                let id = session_id.unwrap_or_else(|| format!("session-{}", self.next()));
                self.state.sessions.lock().unwrap().insert(
                    id.clone(),
                    Record {
                        created: Utc::now().to_rfc3339(),
                        ..Record::default()
                    },
                );
                self.open(&id);
                self.emit(&id, "session.start", json!({}));
                Ok(json!({"sessionId": id, "workspacePath": format!("/work/{id}")}))
            }
            "session.resume" => match session_id {
                Some(id) if self.knows(&id) => {
                    self.open(&id);
                    self.emit(&id, "session.resume", json!({}));
                    Ok(json!({"sessionId": id, "workspacePath": format!("/work/{id}")}))
                }
                _ => Err(not_found()),
            },
            "session.send" => match session_id {
                Some(id) if self.knows(&id) => {
                    let prompt = params["prompt"].as_str().unwrap_or_default().to_string();
                    if let Some(record) = self.state.sessions.lock().unwrap().get_mut(&id) {
                        record.prompts.push(prompt.clone());
                    }
                    if let Some(queue) = self.state.turns.lock().unwrap().get(&id) {
                        let _ = queue.send(prompt);
                    }
                    Ok(json!({"messageId": format!("msg-{}", self.next())}))
                }
                _ => Err(not_found()),
            },
            "session.abort" => {
                let id = session_id.unwrap_or_default();
                let hanging = self.state.hanging.lock().unwrap().get(&id).cloned();
                match hanging {
                    Some(stop) => stop.notify_one(),
                    None => {
                        self.emit(&id, "abort", json!({"reason": "user initiated"}));
                        self.emit(&id, "session.idle", json!({}));
                    }
                }
                Ok(json!({}))
            }
            "session.destroy" => Ok(json!({})),
            "session.model.switchTo" => match session_id {
                Some(id) if self.knows(&id) => {
                    let model = params["modelId"].as_str().unwrap_or_default().to_string();
                    self.emit(&id, "session.model_change", json!({"newModel": model}));
                    Ok(json!({"modelId": model}))
                }
                _ => Err(not_found()),
            },
            "session.getMessages" => {
                let sessions = self.state.sessions.lock().unwrap();
                match session_id.as_deref().and_then(|id| sessions.get(id)) {
                    Some(record) => Ok(json!({"events": record.events})),
                    None => Err(not_found()),
                }
            }
            "session.list" => {
                let sessions = self.state.sessions.lock().unwrap();
                let listed: Vec<Value> = sessions
                    .iter()
                    .map(|(id, record)| {
                        json!({
                            "sessionId": id,
                            "startTime": record.created,
                            "modifiedTime": record.created,
                            "summary": record.prompts.first(),
                        })
                    })
                    .collect();
                Ok(json!({"sessions": listed}))
            }
            "session.delete" => {
                let id = session_id.unwrap_or_default();
                if self.state.sessions.lock().unwrap().remove(&id).is_some() {
                    self.state.turns.lock().unwrap().remove(&id);
                    Ok(json!({"success": true}))
                } else {
                    Ok(json!({"success": false, "error": format!("Session {id} not found")}))
                }
            }
            "session.getLastId" => Ok(json!({"sessionId": *self.state.last_session.lock().unwrap()})),
            other => Err(serde_json::to_value(RpcError::method_not_found(other)).unwrap()),
        };
        Some(reply)
    }

    fn knows(&self, session_id: &str) -> bool {
        self.state.sessions.lock().unwrap().contains_key(session_id)
    }

    /// Mark `session_id` as most recent and make sure it has a turn worker.
    fn open(&self, session_id: &str) {
        *self.state.last_session.lock().unwrap() = Some(session_id.to_string());
        let mut turns = self.state.turns.lock().unwrap();
        if turns.contains_key(session_id) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        turns.insert(session_id.to_string(), tx);
        drop(turns);
        self.track(tokio::spawn(self.clone().run_turns(session_id.to_string(), rx)));
    }

    async fn run_turns(self, session_id: String, mut queue: mpsc::UnboundedReceiver<String>) {
        while let Some(prompt) = queue.recv().await {
            self.turn(&session_id, &prompt).await;
        }
    }

    async fn turn(&self, session_id: &str, prompt: &str) {
        self.emit(session_id, "user.message", json!({"content": prompt}));
        self.emit(session_id, "assistant.turn_start", json!({}));

        if prompt.starts_with("hang") {
            let stop = Arc::new(Notify::new());
            self.state
                .hanging
                .lock()
                .unwrap()
                .insert(session_id.to_string(), Arc::clone(&stop));
            self.emit(
                session_id,
                "tool.execution_start",
                json!({"toolCallId": format!("call-{}", self.next()), "toolName": "sleep"}),
            );
            stop.notified().await;
            self.state.hanging.lock().unwrap().remove(session_id);
            self.emit(session_id, "abort", json!({"reason": "user initiated"}));
            self.emit(session_id, "session.idle", json!({}));
            return;
        }

        if prompt.starts_with("run shell") {
            self.guarded_shell(session_id).await;
        } else if let Some(rest) = prompt.strip_prefix("call tool ") {
            let name = rest.lines().next().unwrap_or_default().trim();
            self.call_tool(session_id, name, json!({"target": "demo"})).await;
        } else if let Some(question) = prompt.strip_prefix("ask ") {
            let reply = self
                .request(
                    "userInput.request",
                    json!({
                        "sessionId": session_id,
                        "question": question,
                        "choices": ["yes", "no"],
                        "allowFreeform": true,
                    }),
                )
                .await;
            let answer = match reply {
                Ok(answer) | Err(answer) => answer,
            };
            self.state.answers.lock().unwrap().push(answer);
        }

        self.emit(
            session_id,
            "assistant.message",
            json!({"content": format!("echo: {prompt}"), "messageId": format!("msg-{}", self.next())}),
        );
        self.emit(session_id, "session.idle", json!({}));
    }

    async fn guarded_shell(&self, session_id: &str) {
        let args = json!({"command": "ls"});
        let call_id = format!("call-{}", self.next());
        let hook = self
            .request(
                "hooks.invoke",
                json!({
                    "sessionId": session_id,
                    "hookType": "preToolUse",
                    "input": {
                        "timestamp": Utc::now().timestamp_millis(),
                        "toolName": "shell",
                        "toolArgs": args,
                        "toolCallId": call_id,
                    },
                }),
            )
            .await
            .unwrap_or_default();
        let output = &hook["output"];

        if output["permissionDecision"] == "deny" {
            let reason = output["permissionDecisionReason"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            self.state.denials.lock().unwrap().push(reason.clone());
            self.emit(
                session_id,
                "tool.execution_complete",
                json!({
                    "toolCallId": call_id,
                    "toolName": "shell",
                    "success": false,
                    "error": reason,
                }),
            );
            return;
        }
        self.call_tool(session_id, "shell", args).await;
    }

    async fn call_tool(&self, session_id: &str, name: &str, arguments: Value) {
        let call_id = format!("call-{}", self.next());
        self.emit(
            session_id,
            "tool.execution_start",
            json!({"toolCallId": call_id, "toolName": name, "arguments": arguments}),
        );
        let reply = self
            .request(
                "tool.call",
                json!({
                    "sessionId": session_id,
                    "toolCallId": call_id,
                    "toolName": name,
                    "arguments": arguments,
                }),
            )
            .await
            .unwrap_or_default();
        let result = reply["result"].clone();
        self.state.tool_results.lock().unwrap().push(result.clone());
        self.emit(
            session_id,
            "tool.execution_complete",
            json!({
                "toolCallId": call_id,
                "toolName": name,
                "success": result["resultType"] == "success",
                "result": result,
            }),
        );
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Value>) {
    while let Some(frame) = frames.recv().await {
        let body = serde_json::to_vec(&frame).unwrap();
        if write_frame(&mut writer, &body).await.is_err() {
            break;
        }
    }
}

fn not_found() -> Value {
    json!({"code": RpcError::SESSION_NOT_FOUND, "message": "Session not found"})
}
