//! Command execution and reply correlation over a [`TransportChannel`].

use super::binary::{self, BinaryBlock, ProtocolMode, HEADER_LEN};
use super::grammar::{self, ParsedCommand, MULTILINE_MARKER};
use crate::error::{IcepapError, Result};
use crate::transport::{AsyncFrame, TransportChannel};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{debug, instrument, trace};

/// Answer token expected from the liveness probe.
pub const ALIVE_ANSWER: &str = "OK";

/// Timing and dialect settings of one protocol instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSettings {
    /// Wire dialect.
    pub mode: ProtocolMode,
    /// Reply timeout.
    pub timeout: Duration,
    /// Reply timeout after an acknowledged binary upload.
    pub long_timeout: Duration,
    /// Quiet window used when draining stale bytes.
    pub drain_quiet: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            mode: ProtocolMode::IcePap,
            timeout: Duration::from_secs(1),
            long_timeout: Duration::from_secs(20),
            drain_quiet: Duration::from_millis(50),
        }
    }
}

/// Controller answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The command expects no answer.
    None,
    /// ASCII answer with the echoed prefix removed.
    Text(String),
    /// Binary query answer: ASCII part plus the decoded block.
    Binary {
        /// ASCII answer.
        text: String,
        /// Decoded binary block.
        data: BinaryBlock,
    },
}

impl Reply {
    /// ASCII part of the answer, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Reply::None => None,
            Reply::Text(text) | Reply::Binary { text, .. } => Some(text),
        }
    }

    /// ASCII part of the answer, empty when there is none.
    pub fn into_text(self) -> String {
        match self {
            Reply::None => String::new(),
            Reply::Text(text) | Reply::Binary { text, .. } => text,
        }
    }
}

/// Marks the channel dirty unless the command completes.
///
/// A caller dropping the command future mid-exchange leaves unread bytes
/// behind; the next command drains them first.
struct InFlight<'a> {
    channel: &'a TransportChannel,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.channel.mark_dirty();
        }
    }
}

/// ASCII/binary command protocol bound to one controller connection.
///
/// At most one command is in flight at a time, which guarantees that answers
/// are read in request order.
#[derive(Debug)]
pub struct CommandProtocol {
    channel: TransportChannel,
    settings: ProtocolSettings,
    in_flight: Mutex<()>,
    commands: OnceCell<Vec<String>>,
}

impl CommandProtocol {
    /// Wrap an open channel.
    pub fn new(channel: TransportChannel, settings: ProtocolSettings) -> Self {
        Self {
            channel,
            settings,
            in_flight: Mutex::new(()),
            commands: OnceCell::new(),
        }
    }

    /// Controller hostname.
    pub fn host(&self) -> &str {
        self.channel.host()
    }

    /// Wire dialect.
    pub fn mode(&self) -> ProtocolMode {
        self.settings.mode
    }

    /// Active settings.
    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// Subscribe to async frames pushed by the controller.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<AsyncFrame> {
        self.channel.subscribe_frames()
    }

    /// Close the underlying channel.
    pub async fn close(&self) {
        self.channel.close().await;
    }

    /// Send a command and read its answer when one is expected.
    ///
    /// `payload` is required by binary writes (`*KEYWORD`) and rejected
    /// everywhere else.
    pub async fn command(&self, text: &str, payload: Option<&BinaryBlock>) -> Result<Reply> {
        self.execute(text, payload).await
    }

    /// Send a command with acknowledgement forced on.
    ///
    /// Inserts `#` unless the command starts with `#` or `?`, so an answer is
    /// always read.
    pub async fn ackcommand(&self, text: &str, payload: Option<&BinaryBlock>) -> Result<Reply> {
        self.execute(&grammar::with_ack(text), payload).await
    }

    /// Send a query and return its ASCII answer.
    pub async fn query(&self, text: &str) -> Result<String> {
        Ok(self.command(text, None).await?.into_text())
    }

    /// Whether the controller answers the liveness probe.
    #[instrument(skip(self), fields(host = %self.host()))]
    pub async fn is_alive(&self) -> Result<bool> {
        match self.command(self.settings.mode.ping_command(), None).await {
            Ok(reply) => Ok(reply.text().is_some_and(|t| t.contains(ALIVE_ANSWER))),
            Err(IcepapError::Device { message, .. }) => {
                debug!(%message, "ping refused");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Keywords supported by the controller, fetched once and cached.
    pub async fn command_list(&self) -> Result<&[String]> {
        let list = self
            .commands
            .get_or_try_init(|| async {
                let keywords = match self.settings.mode {
                    ProtocolMode::IcePap => self
                        .query("?HELP")
                        .await?
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                    ProtocolMode::Deep => self
                        .query("?HELP ALL")
                        .await?
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .map(|(keyword, _)| keyword.trim().to_string())
                        .collect(),
                };
                Ok::<Vec<String>, IcepapError>(keywords)
            })
            .await?;
        Ok(list.as_slice())
    }

    /// Whether the first keyword of `text` is in the controller's command list.
    pub async fn is_valid_command(&self, text: &str) -> Result<bool> {
        let Some(first) = text.split_whitespace().next() else {
            return Ok(false);
        };
        let first = first.to_uppercase();
        Ok(self.command_list().await?.iter().any(|k| *k == first))
    }

    #[instrument(skip(self, payload), fields(host = %self.host()), err)]
    async fn execute(&self, text: &str, payload: Option<&BinaryBlock>) -> Result<Reply> {
        let line = text.trim_matches(|c| c == ' ' || c == '\n' || c == '\r');
        let parsed = grammar::classify(line).map_err(|e| self.rehost(e, line))?;
        let class = parsed.class();

        match (payload, class.is_binary, class.is_query) {
            (None, true, false) => return Err(self.error(line, "binary data is missing")),
            (Some(_), false, _) => return Err(self.error(line, "downloading binary with a non binary command")),
            (Some(_), true, true) => return Err(self.error(line, "downloading binary with a query binary command")),
            _ => {}
        }
        let upload = match payload {
            Some(block) => Some(binary::encode_upload(self.settings.mode, block).map_err(|e| self.rehost(e, line))?),
            None => None,
        };

        let _lock = self.in_flight.lock().await;
        let mut guard = InFlight {
            channel: &self.channel,
            armed: true,
        };
        let result = self.exchange(line, &parsed, upload.as_ref()).await;
        guard.armed = false;
        if let Err(err) = &result {
            // A malformed answer may leave the rest of it unread.
            if err.is_transport() || matches!(err, IcepapError::Protocol { .. }) {
                self.channel.mark_dirty();
            }
        }
        result
    }

    /// One request/reply exchange; the caller holds the in-flight lock.
    async fn exchange(
        &self,
        line: &str,
        parsed: &ParsedCommand,
        upload: Option<&([u8; HEADER_LEN], Vec<u8>)>,
    ) -> Result<Reply> {
        let class = parsed.class();
        if self.channel.is_dirty() {
            self.channel
                .drain(self.settings.drain_quiet, self.settings.long_timeout)
                .await;
        }

        trace!("===> [{}]", line);
        let framed = format!("{}\n", line);
        let sent = match upload {
            Some((header, data)) => {
                self.channel
                    .send(&[framed.as_bytes(), header.as_slice(), data.as_slice()])
                    .await
            }
            None => self.channel.send(&[framed.as_bytes()]).await,
        };
        sent.map_err(|e| self.rehost(e, line))?;

        if !class.expects_answer() {
            return Ok(Reply::None);
        }

        let timeout = if upload.is_some() && class.is_ack {
            self.settings.long_timeout
        } else {
            self.settings.timeout
        };

        let answer = self.read_ascii(parsed, line, timeout).await?;

        // An acknowledged query asks for the raw answer.
        let check_errors = !(parsed.ack_marker && parsed.query);
        if check_errors {
            if let Some(rest) = answer.strip_prefix("ERROR") {
                return Err(IcepapError::Device {
                    host: self.host().to_string(),
                    command: line.to_string(),
                    message: rest.trim().to_string(),
                });
            }
        }

        if class.is_binary && class.is_query {
            let data = self.read_binary(line).await?;
            Ok(Reply::Binary { text: answer, data })
        } else {
            Ok(Reply::Text(answer))
        }
    }

    async fn read_ascii(&self, parsed: &ParsedCommand, line: &str, timeout: Duration) -> Result<String> {
        let prefix = parsed.reply_prefix(self.settings.mode.echoes_address());
        let raw = self.read_line(line, timeout).await?;

        let answer = if let Some(rest) = raw.strip_prefix(prefix.as_str()) {
            rest.trim().to_string()
        } else if self.settings.mode == ProtocolMode::Deep {
            return Err(self.error(line, format!("missing prefix \"{}\" in device answer: \"{}\"", prefix, raw)));
        } else {
            // Some IcePAP commands echo the keyword without the address field.
            let short = prefix.trim_start_matches(|c: char| c.is_ascii_digit() || c == ':' || c == '*');
            raw.strip_prefix(short).unwrap_or(&raw).trim().to_string()
        };

        let answer = if answer == MULTILINE_MARKER {
            let mut lines = Vec::new();
            loop {
                let next = self.read_line(line, timeout).await?;
                if next == MULTILINE_MARKER {
                    break;
                }
                lines.push(next);
            }
            lines.join("\n")
        } else {
            answer
        };
        trace!("<=== [{}]", answer);
        Ok(answer)
    }

    async fn read_line(&self, line: &str, timeout: Duration) -> Result<String> {
        self.channel
            .read_line(timeout)
            .await
            .map_err(|e| self.rehost(e, line))
    }

    async fn read_binary(&self, line: &str) -> Result<BinaryBlock> {
        let timeout = self.settings.timeout;
        let raw = self
            .channel
            .read_sync(HEADER_LEN, timeout)
            .await
            .map_err(|e| self.rehost(e, line))?;
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&raw);
        let header = binary::decode_header(self.settings.mode, &header_bytes).map_err(|message| self.error(line, message))?;

        let payload = self
            .channel
            .read_sync(header.payload_len(), timeout)
            .await
            .map_err(|e| self.rehost(e, line))?;
        binary::decode_payload(&header, payload).map_err(|(expected, computed)| IcepapError::Checksum {
            host: self.host().to_string(),
            command: line.to_string(),
            expected,
            computed,
        })
    }

    fn error(&self, line: &str, message: impl Into<String>) -> IcepapError {
        IcepapError::protocol(self.host(), line, message)
    }

    /// Attach hostname and command text to errors raised below this layer.
    fn rehost(&self, err: IcepapError, line: &str) -> IcepapError {
        match err {
            IcepapError::Protocol { message, .. } => self.error(line, message),
            IcepapError::Timeout { timeout, .. } => IcepapError::Timeout {
                host: self.host().to_string(),
                command: line.to_string(),
                timeout,
            },
            other => other,
        }
    }
}
