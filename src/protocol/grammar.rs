//! ASCII command grammar.
//!
//! ```text
//! [#][<address>:]<keyword> [param1 [param2] ...]\n
//! keyword := [?|*|?*]<name>
//! ```
//!
//! `#` requests an acknowledgement, `?` marks a query, `*` a binary transfer.
//! An empty address (`:KEYWORD`) broadcasts to every axis of the controller.

use crate::error::{IcepapError, Result};
use std::fmt;

/// Acknowledge marker.
pub const ACK_MARKER: char = '#';
/// Query marker.
pub const QUERY_MARKER: char = '?';
/// Address separator.
pub const ADDRESS_SEPARATOR: char = ':';
/// Binary transfer marker.
pub const BINARY_MARKER: char = '*';
/// Multi-line answer delimiter.
pub const MULTILINE_MARKER: &str = "$";

/// Command kind flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandClass {
    /// Command expects an answer because it is a query.
    pub is_query: bool,
    /// Write command with acknowledgement requested.
    pub is_ack: bool,
    /// Binary transfer (upload for writes, download for queries).
    pub is_binary: bool,
    /// Command carries an `<address>:` field, possibly empty.
    pub has_address: bool,
}

impl CommandClass {
    /// Whether the controller sends an ASCII answer.
    pub fn expects_answer(&self) -> bool {
        self.is_query || self.is_ack
    }
}

/// Parsed form of one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Leading `#` present.
    pub ack_marker: bool,
    /// Address field; `Some("")` is a broadcast.
    pub address: Option<String>,
    /// `?` marker present.
    pub query: bool,
    /// `*` marker present.
    pub binary: bool,
    /// Upper-cased keyword without markers.
    pub keyword: String,
    /// Everything after the first token, trimmed.
    pub params: String,
}

impl ParsedCommand {
    /// Kind flags of this command.
    ///
    /// An acknowledged query is a plain query: the ack marker only changes
    /// whether the answer is checked for errors.
    pub fn class(&self) -> CommandClass {
        CommandClass {
            is_query: self.query,
            is_ack: self.ack_marker && !self.query,
            is_binary: self.binary,
            has_address: self.address.is_some(),
        }
    }

    /// Keyword with its markers, e.g. `?*PARDAT`.
    pub fn marked_keyword(&self) -> String {
        let mut out = String::with_capacity(self.keyword.len() + 2);
        if self.query {
            out.push(QUERY_MARKER);
        }
        if self.binary {
            out.push(BINARY_MARKER);
        }
        out.push_str(&self.keyword);
        out
    }

    /// Prefix the controller echoes at the start of its answer.
    ///
    /// IcePAP controllers also echo a non-empty address field.
    pub fn reply_prefix(&self, with_address: bool) -> String {
        match &self.address {
            Some(addr) if with_address && !addr.is_empty() => {
                format!("{}{}{}", addr, ADDRESS_SEPARATOR, self.marked_keyword())
            }
            _ => self.marked_keyword(),
        }
    }
}

impl fmt::Display for ParsedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ack_marker {
            write!(f, "{}", ACK_MARKER)?;
        }
        if let Some(addr) = &self.address {
            write!(f, "{}{}", addr, ADDRESS_SEPARATOR)?;
        }
        write!(f, "{}", self.marked_keyword())?;
        if !self.params.is_empty() {
            write!(f, " {}", self.params)?;
        }
        Ok(())
    }
}

fn is_word(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse and validate a command line.
///
/// Fails with `Protocol` on a missing keyword, more than one address
/// separator, a broadcast query, or characters outside `[A-Za-z0-9_]` in the
/// address or keyword.
pub fn classify(command: &str) -> Result<ParsedCommand> {
    let syntax = |message: String| IcepapError::protocol("", command, message);

    let trimmed = command.trim_matches(|c| c == ' ' || c == '\n' || c == '\r');
    let (head, params) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    if head.is_empty() {
        return Err(syntax("empty command".to_string()));
    }
    let head = head.to_uppercase();

    let ack_marker = head.starts_with(ACK_MARKER);
    let body = head.trim_start_matches(ACK_MARKER);

    let mut fields = body.split(ADDRESS_SEPARATOR);
    let first = fields.next().unwrap_or_default();
    let (address, prefix) = match (fields.next(), fields.next()) {
        (None, _) => (None, first),
        (Some(rest), None) => (Some(first.to_string()), rest),
        (Some(_), Some(_)) => {
            return Err(syntax(format!("too many \"{}\" chars", ADDRESS_SEPARATOR)))
        }
    };

    if prefix.is_empty() {
        return Err(syntax("missing command keyword".to_string()));
    }

    let query = prefix.starts_with(QUERY_MARKER);
    let keyed = if query { &prefix[1..] } else { prefix };
    if query && address.as_deref() == Some("") {
        return Err(syntax("queries cannot be broadcasted".to_string()));
    }

    let binary = keyed.starts_with(BINARY_MARKER);
    let keyword = if binary { &keyed[1..] } else { keyed };

    if !is_word(keyword) {
        return Err(syntax(format!("invalid character in command {}", prefix)));
    }
    if let Some(addr) = &address {
        if !addr.is_empty() && !is_word(addr) {
            return Err(syntax(format!("invalid character in address {}", addr)));
        }
    }

    Ok(ParsedCommand {
        ack_marker,
        address,
        query,
        binary,
        keyword: keyword.to_string(),
        params: params.to_string(),
    })
}

/// Force acknowledgement: prepend `#` unless the command already starts with `#` or `?`.
pub fn with_ack(command: &str) -> String {
    let trimmed = command.trim();
    if trimmed.starts_with(ACK_MARKER) || trimmed.starts_with(QUERY_MARKER) {
        trimmed.to_string()
    } else {
        format!("{}{}", ACK_MARKER, trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_query() {
        let cmd = classify("?fpos 1 2").unwrap();
        assert!(cmd.query && !cmd.binary && !cmd.ack_marker);
        assert_eq!(cmd.keyword, "FPOS");
        assert_eq!(cmd.params, "1 2");
        assert_eq!(cmd.reply_prefix(true), "?FPOS");
        assert!(cmd.class().expects_answer());
    }

    #[test]
    fn addressed_ack_write() {
        let cmd = classify("#12:move 1000").unwrap();
        let class = cmd.class();
        assert!(class.is_ack && class.has_address && !class.is_query);
        assert_eq!(cmd.address.as_deref(), Some("12"));
        assert_eq!(cmd.reply_prefix(true), "12:MOVE");
        assert_eq!(cmd.reply_prefix(false), "MOVE");
        assert_eq!(cmd.to_string(), "#12:MOVE 1000");
    }

    #[test]
    fn ack_on_query_is_a_query() {
        let class = classify("#?PING").unwrap().class();
        assert!(class.is_query);
        assert!(!class.is_ack);
    }

    #[test]
    fn binary_markers() {
        let cmd = classify("?*PARDAT").unwrap();
        assert!(cmd.query && cmd.binary);
        assert_eq!(cmd.reply_prefix(false), "?*PARDAT");

        let cmd = classify("#*PARDAT").unwrap();
        assert!(cmd.class().is_ack && cmd.binary);
    }

    #[test]
    fn broadcast_write_allowed_but_not_query() {
        let cmd = classify(":STOP").unwrap();
        assert_eq!(cmd.address.as_deref(), Some(""));
        assert_eq!(cmd.reply_prefix(true), "STOP");

        assert!(classify(":?POS").is_err());
    }

    #[test]
    fn syntax_errors() {
        assert!(classify("").is_err());
        assert!(classify("?").is_err());
        assert!(classify("#").is_err());
        assert!(classify("1:2:POS").is_err());
        assert!(classify("1:").is_err());
        assert!(classify("?PO-S").is_err());
        assert!(classify("a.b:POS").is_err());
        assert!(classify("?*").is_err());
    }

    #[test]
    fn ack_insertion() {
        assert_eq!(with_ack("POWER ON"), "#POWER ON");
        assert_eq!(with_ack("#POWER ON"), "#POWER ON");
        assert_eq!(with_ack("?POWER"), "?POWER");
        assert_eq!(with_ack("  1:MOVE 3 "), "#1:MOVE 3");
    }
}
