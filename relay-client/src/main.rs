//! Smoke-test client for the relay: stream a raw audio file as a session's
//! source, or tail a session's transcript stream.
//!
//! Tokens normally come from the session manager; for local runs this tool
//! can mint one itself when handed the shared secret.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(name = "relay-client")]
struct Args {
    #[arg(long, default_value = "ws://127.0.0.1:8080", help = "relay base URL")]
    relay: String,

    #[arg(long, help = "session to join")]
    session: String,

    #[arg(long, env = "RELAY_TOKEN", help = "pre-minted bearer token")]
    token: Option<String>,

    #[arg(
        long,
        env = "JWT_SECRET",
        help = "shared secret; used to mint a token locally when --token is absent"
    )]
    secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a raw audio file into the session.
    Source {
        #[arg(long)]
        file: PathBuf,

        #[arg(long, default_value_t = 3200, help = "bytes per binary frame")]
        chunk_bytes: usize,

        #[arg(long, default_value_t = 100, help = "delay between frames in ms")]
        interval_ms: u64,
    },
    /// Print the session's transcript stream.
    Sink,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (scope, endpoint) = match &args.command {
        Command::Source { .. } => (jwt_common::Scope::Source, "audio"),
        Command::Sink => (jwt_common::Scope::Sink, "transcription"),
    };
    let token = resolve_token(&args, scope)?;
    let url = format!(
        "{}/{endpoint}/{}?token={token}",
        args.relay.trim_end_matches('/'),
        args.session
    );

    println!("Connecting to {}", args.relay);
    let (ws, _) = connect_async(&url).await.context("websocket connect failed")?;
    let (mut write, mut read) = ws.split();

    match args.command {
        Command::Source {
            file,
            chunk_bytes,
            interval_ms,
        } => {
            let audio =
                std::fs::read(&file).with_context(|| format!("cannot read {}", file.display()))?;
            println!(
                "Streaming {} bytes in {chunk_bytes}-byte frames",
                audio.len()
            );
            for chunk in audio.chunks(chunk_bytes) {
                write.send(Message::Binary(chunk.to_vec())).await?;
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
            write.send(Message::Close(None)).await?;
            println!("Done.");
        }
        Command::Sink => {
            while let Some(message) = read.next().await {
                match message? {
                    Message::Text(text) => println!("{text}"),
                    Message::Close(frame) => {
                        println!("Closed: {frame:?}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

fn resolve_token(args: &Args, scope: jwt_common::Scope) -> Result<String> {
    if let Some(token) = &args.token {
        return Ok(token.clone());
    }
    let Some(secret) = &args.secret else {
        bail!("provide --token, or --secret to mint one locally");
    };

    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as usize;
    let claims = jwt_common::TokenClaims {
        session_id: args.session.clone(),
        scope,
        source_id: None,
        iss: jwt_common::DEFAULT_ISSUER.to_string(),
        exp: now + 3600,
    };
    jwt_common::mint(secret, &claims).context("failed to mint token")
}
