//! Operator console command parsing.
//!
//! Parses lines typed at the node's prompt (like `WRITE /notes/a hello`)
//! into [`ConsoleCommand`]s. Only `WRITE` and `DELETE` go through the
//! replicated log; the rest inspect or nudge the local node.

use anyhow::{Result, anyhow};

use crate::mutation::Mutation;

/// Commands accepted at the console prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Write { path: String, content: String },
    Delete { path: String },
    Read { path: String },
    Status,
    Log,
    Campaign,
    Help,
    Exit,
}

pub const HELP: &str = "\
commands (case-insensitive):
  WRITE/w <path> <content>  replicate a write of <content> to <path>
  DELETE/d <path>           replicate a delete of <path>
  READ/r <path>             show this node's applied copy of <path>
  STATUS/s                  show role, term, leader and indices
  LOG/l                     list log entry metadata
  CAMPAIGN/c                force this node to start an election
  HELP/h                    show this help
  EXIT/e                    shut down this node";

impl ConsoleCommand {
    /// Parses one line of input.
    ///
    /// The command word is case-insensitive and has a one-letter alias.
    /// Everything after the path of a `WRITE` is the content, spaces
    /// included.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty command"));
        }

        let mut parts = trimmed.splitn(3, char::is_whitespace);
        let word = parts.next().unwrap_or_default().to_uppercase();
        let path = parts.next().map(str::trim).filter(|p| !p.is_empty());
        let rest = parts.next().map(str::trim).filter(|r| !r.is_empty());

        let normalized = match word.as_str() {
            "W" => "WRITE",
            "D" => "DELETE",
            "R" => "READ",
            "S" => "STATUS",
            "L" => "LOG",
            "C" => "CAMPAIGN",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized, path, rest) {
            ("STATUS", None, None) => Ok(ConsoleCommand::Status),
            ("LOG", None, None) => Ok(ConsoleCommand::Log),
            ("CAMPAIGN", None, None) => Ok(ConsoleCommand::Campaign),
            ("HELP", None, None) => Ok(ConsoleCommand::Help),
            ("EXIT", None, None) => Ok(ConsoleCommand::Exit),
            ("WRITE", Some(path), Some(content)) => Ok(ConsoleCommand::Write {
                path: path.to_string(),
                content: content.to_string(),
            }),
            ("DELETE", Some(path), None) => Ok(ConsoleCommand::Delete {
                path: path.to_string(),
            }),
            ("READ", Some(path), None) => Ok(ConsoleCommand::Read {
                path: path.to_string(),
            }),
            ("WRITE", _, _) => Err(anyhow!("usage: WRITE <path> <content>")),
            ("DELETE", _, _) => Err(anyhow!("usage: DELETE <path>")),
            ("READ", _, _) => Err(anyhow!("usage: READ <path>")),
            ("STATUS" | "LOG" | "CAMPAIGN" | "HELP" | "EXIT", _, _) => {
                Err(anyhow!("{normalized} takes no arguments"))
            }
            _ => Err(anyhow!("unknown command `{word}`. Try HELP")),
        }
    }

    /// The mutation this command replicates, if any.
    pub fn mutation(&self) -> Option<Mutation> {
        match self {
            ConsoleCommand::Write { path, content } => Some(Mutation::write(path, content)),
            ConsoleCommand::Delete { path } => Some(Mutation::delete(path)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_case_insensitive() {
        for line in ["status", "STATUS", "StAtUs", "s", "S"] {
            assert_eq!(ConsoleCommand::parse(line).unwrap(), ConsoleCommand::Status);
        }
        for line in ["exit", "E"] {
            assert_eq!(ConsoleCommand::parse(line).unwrap(), ConsoleCommand::Exit);
        }
        assert_eq!(ConsoleCommand::parse("l").unwrap(), ConsoleCommand::Log);
        assert_eq!(ConsoleCommand::parse("Campaign").unwrap(), ConsoleCommand::Campaign);
        assert_eq!(ConsoleCommand::parse("h").unwrap(), ConsoleCommand::Help);
    }

    #[test]
    fn write_keeps_spaces_in_content() {
        assert_eq!(
            ConsoleCommand::parse("write /notes/todo  buy milk and eggs ").unwrap(),
            ConsoleCommand::Write {
                path: "/notes/todo".into(),
                content: "buy milk and eggs".into(),
            }
        );
        assert_eq!(
            ConsoleCommand::parse("W /a x").unwrap(),
            ConsoleCommand::Write {
                path: "/a".into(),
                content: "x".into(),
            }
        );
    }

    #[test]
    fn path_commands() {
        assert_eq!(
            ConsoleCommand::parse("d /a").unwrap(),
            ConsoleCommand::Delete { path: "/a".into() }
        );
        assert_eq!(
            ConsoleCommand::parse("READ /a").unwrap(),
            ConsoleCommand::Read { path: "/a".into() }
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for line in [
            "",
            "   ",
            "bogus",
            "WRITE",
            "WRITE /a",
            "DELETE",
            "READ",
            "DELETE /a b",
            "STATUS now",
        ] {
            assert!(ConsoleCommand::parse(line).is_err(), "{line:?} should not parse");
        }
    }

    #[test]
    fn only_writes_and_deletes_replicate() {
        let write = ConsoleCommand::parse("w /a x").unwrap().mutation().unwrap();
        assert_eq!(write.op(), Some("write"));
        let delete = ConsoleCommand::parse("d /a").unwrap().mutation().unwrap();
        assert_eq!(delete.op(), Some("delete"));
        assert!(ConsoleCommand::Status.mutation().is_none());
        assert!(ConsoleCommand::Read { path: "/a".into() }.mutation().is_none());
    }
}
