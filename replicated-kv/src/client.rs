//! Client side of the leader's client endpoint.
//!
//! [`Client`] is the programmatic API used by tests and embedders; [`run`] is
//! the interactive session behind the `client` subcommand.

use std::io::ErrorKind;
use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::select;
use tracing::{info, warn};

use crate::cli::ClientArgs;
use crate::console::{ConsoleCommand, HELP};
use crate::error::{Error, Result};
use crate::message::{Kind, Message};
use crate::wire::{WireFormat, read_message, write_message};

/// One connection to the leader's client endpoint.
pub struct Client {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    wire: WireFormat,
}

impl Client {
    pub async fn connect(addr: SocketAddr, wire: WireFormat) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self { reader, writer, wire })
    }

    /// Sends `request` and waits for its single reply.
    pub async fn request(&mut self, request: &Message) -> Result<Message> {
        write_message(&mut self.writer, self.wire, request).await?;
        self.receive().await
    }

    async fn receive(&mut self) -> Result<Message> {
        read_message(&mut self.reader, self.wire).await?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "leader closed the connection",
            ))
        })
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Result<Message> {
        self.request(&Message::set(key, value)).await
    }

    /// Reads a key; `Ok(None)` when the leader does not hold it.
    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        let reply = self.request(&Message::get(key)).await?;
        Ok(reply.is_ok().then_some(reply.value))
    }

    pub async fn delete(&mut self, key: &str) -> Result<Message> {
        self.request(&Message::delete(key)).await
    }

    pub async fn list(&mut self) -> Result<Message> {
        self.request(&Message::list()).await
    }

    /// Requests every logged write after `after`.
    ///
    /// Returns the replayed writes and the terminating ACK. Against a strict
    /// leader the single error reply is returned as the terminator.
    pub async fn sync(&mut self, after: u64) -> Result<(Vec<Message>, Message)> {
        write_message(&mut self.writer, self.wire, &Message::sync(after)).await?;
        let mut replayed = Vec::new();
        loop {
            let message = self.receive().await?;
            if message.kind == Kind::Ack || !message.is_ok() {
                return Ok((replayed, message));
            }
            replayed.push(message);
        }
    }
}

pub async fn run(args: ClientArgs) -> anyhow::Result<()> {
    let mut client = Client::connect(args.server, args.wire)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);
    write_stdout("Type HELP for commands.").await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 || !handle_line(&mut client, &input).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = client.writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    Ok(())
}

/// Runs one input line. Returns false when the session should end.
async fn handle_line(client: &mut Client, line: &str) -> anyhow::Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }
    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("ERROR: {err}")).await?;
            return Ok(true);
        }
    };

    match command {
        ConsoleCommand::Exit => Ok(false),
        ConsoleCommand::Help => {
            write_stdout(HELP).await?;
            Ok(true)
        }
        command => {
            let Some(request) = command.into_request() else {
                return Ok(true);
            };
            let reply = client.request(&request).await.context("request failed")?;
            if reply.is_ok() {
                write_stdout(&reply.response).await?;
            } else {
                write_stdout(&format!("ERROR: {}", reply.response)).await?;
            }
            Ok(true)
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
