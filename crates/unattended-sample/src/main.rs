//! Sample managed application for exercising unattendedd.
//!
//! Reads commands from stdin and answers on stdout, one JSON object per line.
//! Logs go to stderr so they never mix with replies.

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use unattended_common::{Command, CommandReply, CommandRequest};

#[derive(Parser, Debug, Clone)]
#[command(name = "unattended-sample")]
#[command(about = "Sample application managed by unattendedd", long_about = None)]
#[command(version = unattended_common::VERSION)]
struct Args {
    /// Refuse every restart request
    #[arg(long)]
    decline: bool,

    /// Seconds to think before answering a restart request
    #[arg(long, default_value_t = 0)]
    delay_secs: u64,

    /// Label returned by ping, handy for telling versions apart
    #[arg(long, default_value = "A")]
    label: String,
}

/// Immediate answer to a request
fn reply_for(request: &CommandRequest, args: &Args) -> CommandReply {
    match request.command {
        Command::Ping => CommandReply::success(request, json!(format!("Pong {}", args.label))),
        Command::CanUpdate => CommandReply::success(request, json!(!args.decline)),
        Command::Exit => CommandReply::success(request, json!(true)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Sample application {} started (pid {})", args.label, std::process::id());

    let (replies, mut outgoing) = mpsc::unbounded_channel::<CommandReply>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = outgoing.recv().await {
            let mut line = reply.to_line()?;
            line.push('\n');
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: CommandRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring malformed command '{}': {}", line, e);
                continue;
            }
        };
        debug!("Received {}", request.command);

        match request.command {
            Command::CanUpdate if args.delay_secs > 0 => {
                // Answer later so pings keep flowing meanwhile
                let replies = replies.clone();
                let args = args.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(args.delay_secs)).await;
                    let _ = replies.send(reply_for(&request, &args));
                });
            }
            Command::Exit => {
                info!("Exit requested");
                let _ = replies.send(reply_for(&request, &args));
                break;
            }
            _ => {
                let _ = replies.send(reply_for(&request, &args));
            }
        }
    }

    drop(replies);
    writer.await??;
    info!("Sample application {} stopped", args.label);
    Ok(())
}
