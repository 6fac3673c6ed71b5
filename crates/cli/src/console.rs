//! Line-oriented stdin/stdout transport.
//!
//! Each input line is one message. `#room` as the first token picks the
//! channel and `name:` picks the author, so one terminal can play several
//! users: `#ops bob: !kick mallory`.

use std::sync::atomic::{AtomicU64, Ordering};

use {
    async_trait::async_trait,
    neuron_channels::{ChannelOutbound, Error as ChannelError},
    neuron_common::InboundMessage,
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
        sync::{Mutex, mpsc},
    },
    tracing::debug,
};

/// Prints outbound text as `[channel] text`.
pub struct ConsoleOutbound {
    stdout: Mutex<Stdout>,
}

impl ConsoleOutbound {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for ConsoleOutbound {
    fn default() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

#[async_trait]
impl ChannelOutbound for ConsoleOutbound {
    async fn send_text(&self, channel_id: &str, text: &str) -> neuron_channels::Result<()> {
        let line = format!("[{channel_id}] {text}\n");
        let mut out = self.stdout.lock().await;
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::external("console write", e))?;
        out.flush()
            .await
            .map_err(|e| ChannelError::external("console flush", e))
    }
}

/// Channel and author used when a line does not name them.
#[derive(Debug, Clone)]
pub struct ConsoleIdentity {
    pub channel_id: String,
    pub author_id: String,
}

/// Turns input lines into [`InboundMessage`]s.
pub struct LineParser {
    defaults: ConsoleIdentity,
    next_id: AtomicU64,
}

impl LineParser {
    pub fn new(defaults: ConsoleIdentity) -> Self {
        Self {
            defaults,
            next_id: AtomicU64::new(1),
        }
    }

    /// `None` for blank lines.
    pub fn parse(&self, line: &str) -> Option<InboundMessage> {
        let mut rest = line.trim();
        if rest.is_empty() {
            return None;
        }

        let mut channel = self.defaults.channel_id.as_str();
        if let Some(tagged) = rest.strip_prefix('#') {
            let (name, tail) = tagged.split_once(char::is_whitespace).unwrap_or((tagged, ""));
            if !name.is_empty() {
                channel = name;
                rest = tail.trim_start();
            }
        }

        let mut author = self.defaults.author_id.as_str();
        if let Some((name, tail)) = rest.split_once(':')
            && !name.is_empty()
            && !name.chars().any(char::is_whitespace)
            && (tail.is_empty() || tail.starts_with(' '))
        {
            author = name;
            rest = tail.trim_start();
        }

        if rest.is_empty() {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Some(InboundMessage::new(channel, author, rest).with_message_id(format!("console-{id}")))
    }
}

/// Read stdin until EOF, forwarding parsed lines to the dispatcher.
pub async fn pump_stdin(
    parser: LineParser,
    inbound: mpsc::Sender<InboundMessage>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(message) = parser.parse(&line) else {
            continue;
        };
        if inbound.send(message).await.is_err() {
            debug!("dispatcher closed, stopping console input");
            break;
        }
    }
    Ok(())
}
