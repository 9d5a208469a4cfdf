//! Line commands accepted by the interactive client.
//!
//! Parsing is separate from [`crate::message::Message`]: HELP and EXIT never
//! leave the terminal, and the rest map one-to-one onto a request.

use anyhow::{Result, anyhow};

use crate::message::Message;

/// Commands that can be entered at the client prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    List,
    Help,
    Exit,
}

pub const HELP: &str = "\
Commands (case-insensitive):
  SET <key> <value>    (s)  store a value
  GET <key>            (g)  read a value
  DEL <key>            (d)  delete a key, DELETE also works
  LIST                 (l)  list every key
  HELP                 (h)  show this text
  EXIT                 (e)  quit";

impl ConsoleCommand {
    /// Parses one line of user input into a command.
    ///
    /// # Parameters
    /// - `line`: raw input from the prompt, with or without the trailing newline
    ///
    /// # Syntax
    /// Commands are case-insensitive and support aliases:
    /// - `SET <key> <value>` (alias: `s`) - store a value
    /// - `GET <key>` (alias: `g`) - read a value
    /// - `DEL <key>` (aliases: `d`, `DELETE`) - remove a key
    /// - `LIST` (alias: `l`) - list every key on the leader
    /// - `HELP` (alias: `h`) - print the command reference
    /// - `EXIT` (alias: `e`) - leave the client
    ///
    /// Keys and values are single whitespace-free tokens, so `SET k two words`
    /// is a usage error rather than a value with a space in it. Extra tokens
    /// after LIST, HELP and EXIT are ignored.
    ///
    /// # Errors
    /// Empty lines, unknown commands and wrong argument counts return an error
    /// whose message is shown to the user as is.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "S" => "SET",
            "G" => "GET",
            "D" | "DEL" => "DELETE",
            "L" => "LIST",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized_cmd, parts.len()) {
            ("EXIT", _) => Ok(ConsoleCommand::Exit),
            ("HELP", _) => Ok(ConsoleCommand::Help),
            ("LIST", _) => Ok(ConsoleCommand::List),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
            }),
            ("DELETE", 2) => Ok(ConsoleCommand::Delete {
                key: parts[1].to_string(),
            }),
            ("SET", 3) => Ok(ConsoleCommand::Set {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("GET", _) => Err(anyhow!("usage: GET <key>")),
            ("DELETE", _) => Err(anyhow!("usage: DEL <key>")),
            ("SET", _) => Err(anyhow!("usage: SET <key> <value>")),
            _ => Err(anyhow!("unknown command, type HELP for the command list")),
        }
    }

    /// The request this command sends, or `None` for local commands.
    pub fn into_request(self) -> Option<Message> {
        match self {
            ConsoleCommand::Set { key, value } => Some(Message::set(key, value)),
            ConsoleCommand::Get { key } => Some(Message::get(key)),
            ConsoleCommand::Delete { key } => Some(Message::delete(key)),
            ConsoleCommand::List => Some(Message::list()),
            ConsoleCommand::Help | ConsoleCommand::Exit => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kind;

    #[test]
    fn test_case_insensitive_commands() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("ExIt"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("list"), Ok(ConsoleCommand::List)));
        assert!(matches!(ConsoleCommand::parse("Help"), Ok(ConsoleCommand::Help)));
    }

    #[test]
    fn test_aliases() {
        assert_eq!(
            ConsoleCommand::parse("s color blue").unwrap(),
            ConsoleCommand::Set {
                key: "color".into(),
                value: "blue".into()
            }
        );
        assert_eq!(
            ConsoleCommand::parse("g color").unwrap(),
            ConsoleCommand::Get { key: "color".into() }
        );
        for line in ["d color", "DEL color", "delete color"] {
            assert_eq!(
                ConsoleCommand::parse(line).unwrap(),
                ConsoleCommand::Delete { key: "color".into() },
                "{line}"
            );
        }
        assert!(matches!(ConsoleCommand::parse("l"), Ok(ConsoleCommand::List)));
        assert!(matches!(ConsoleCommand::parse("h"), Ok(ConsoleCommand::Help)));
        assert!(matches!(ConsoleCommand::parse("e"), Ok(ConsoleCommand::Exit)));
    }

    #[test]
    fn test_argument_counts() {
        assert!(ConsoleCommand::parse("SET onlykey").is_err());
        assert!(ConsoleCommand::parse("SET k v extra").is_err());
        assert!(ConsoleCommand::parse("GET").is_err());
        assert!(ConsoleCommand::parse("DEL a b").is_err());
    }

    #[test]
    fn test_empty_and_unknown() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("PUT k v").is_err());
    }

    #[test]
    fn test_requests() {
        let request = ConsoleCommand::parse("set k v").unwrap().into_request().unwrap();
        assert_eq!((request.kind, request.key.as_str(), request.value.as_str()), (Kind::Set, "k", "v"));
        assert!(ConsoleCommand::Help.into_request().is_none());
        assert_eq!(ConsoleCommand::List.into_request().unwrap().kind, Kind::List);
    }
}
