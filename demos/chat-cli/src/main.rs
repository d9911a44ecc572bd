//! Interactive chat with an agent process.
//!
//! Run with: cargo run -p chat-cli
//!
//! The agent is located through `COPILOT_CLI_PATH` / `COPILOT_CLI_URL` or
//! the default install location. Type `/plugins help` for plugin commands,
//! `/sessions` to list persisted sessions and `/quit` to exit.

use std::{sync::Arc, time::Duration};

use agentlink_core::{
    ClientOptions, MessageOptions, SessionConfig, SessionEventType, Tool, ToolInvocation,
    ToolResult,
};
use agentlink_plugins::{
    HookKind, HookResult, Plugin, PluginContext, PluginRegistry, PreToolUseInput,
    PreToolUseOutput, UserPromptInput, UserPromptOutput,
};
use agentlink_session::{Connection, ConnectionEvent, SendOutcome};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TURN_TIMEOUT: Duration = Duration::from_secs(300);

/// Logs each tool the agent is about to run and counts calls per session.
struct Audit;

#[async_trait::async_trait]
impl Plugin for Audit {
    fn name(&self) -> &str {
        "audit"
    }

    fn description(&self) -> &str {
        "Log every tool call"
    }

    fn hooks(&self) -> &[HookKind] {
        &[HookKind::PreToolUse]
    }

    async fn on_pre_tool_use(
        &self,
        ctx: &PluginContext,
        input: &PreToolUseInput,
    ) -> HookResult<Option<PreToolUseOutput>> {
        tracing::info!(session_id = %ctx.session_id(), tool = %input.tool_name, "Tool requested");
        ctx.data.update("calls", |n| {
            json!(n.as_ref().and_then(Value::as_u64).unwrap_or(0) + 1)
        });
        Ok(None)
    }
}

/// Tells the agent the local time with every prompt.
struct Clock;

#[async_trait::async_trait]
impl Plugin for Clock {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Add the local time to each prompt"
    }

    fn hooks(&self) -> &[HookKind] {
        &[HookKind::UserPromptSubmitted]
    }

    async fn on_user_prompt_submitted(
        &self,
        _ctx: &PluginContext,
        _input: &UserPromptInput,
    ) -> HookResult<Option<UserPromptOutput>> {
        Ok(Some(UserPromptOutput {
            additional_context: Some(format!("Local time: {}", chrono::Local::now().to_rfc2822())),
            ..UserPromptOutput::default()
        }))
    }
}

fn current_time_tool() -> Tool {
    Tool::new(
        "current_time",
        "Returns the current UTC time",
        Arc::new(|_: ToolInvocation| async {
            Ok::<_, agentlink_core::Error>(ToolResult::success(chrono::Utc::now().to_rfc3339()))
        }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let catalog = Arc::new(PluginRegistry::new());
    catalog.add("audit", "Log every tool call", || Arc::new(Audit) as Arc<dyn Plugin>);
    catalog.add("clock", "Add the local time to each prompt", || {
        Arc::new(Clock) as Arc<dyn Plugin>
    });

    let connection = Connection::with_plugin_registry(ClientOptions::from_env(), catalog);
    let mut watcher = connection.subscribe(|event| match event {
        ConnectionEvent::Restarted { attempt } => {
            eprintln!("[agent restarted (attempt {attempt}); resume to continue]");
        }
        ConnectionEvent::AgentExited { exit } => eprintln!("[agent exited: {exit:?}]"),
        _ => {}
    });
    connection.start().await?;
    connection.plugins().register(Arc::new(Audit)).await?;

    let session = connection
        .create_session(SessionConfig::new().tool(current_time_tool()))
        .await?;
    let _deltas = session.on_type(SessionEventType::AssistantMessageDelta, |event| {
        if let Some(delta) = &event.data.delta_content {
            eprint!("{delta}");
        }
    });
    println!("Session {} ready. /quit to exit.", session.id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/sessions" => {
                for meta in connection.list_sessions().await? {
                    println!(
                        "{}  {}  {}",
                        meta.session_id,
                        meta.modified_time,
                        meta.summary.unwrap_or_default()
                    );
                }
                continue;
            }
            _ => {}
        }

        if line.starts_with("/plugins") {
            if let SendOutcome::Command(outcome) = session.send(MessageOptions::new(line)).await? {
                println!("{outcome}");
            }
            continue;
        }

        match session.send_and_wait(MessageOptions::new(line), TURN_TIMEOUT).await {
            Ok(Some(reply)) => println!("{}", reply.assistant_content().unwrap_or_default()),
            Ok(None) => println!("(no reply)"),
            Err(e) => eprintln!("error: {e}"),
        }
    }

    watcher.unsubscribe();
    session.destroy().await;
    for e in connection.stop().await {
        tracing::warn!(error = %e, "Shutdown error");
    }
    Ok(())
}
