use std::fmt;

use crate::common::ByteStr;

/// Command tag from `CommandComplete`, e.g. `INSERT 0 3` or `SELECT 1`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CommandTag {
    tag: ByteStr,
}

impl CommandTag {
    pub(crate) fn new(tag: ByteStr) -> Self {
        Self { tag }
    }

    /// Tag of `EmptyQueryResponse`.
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.tag
    }

    /// The command word, `CREATE TABLE` for `CREATE TABLE`, `INSERT` for `INSERT 0 1`.
    pub fn command(&self) -> &str {
        let tag = self.tag.as_str();
        match tag.rsplit_once(' ') {
            Some((command, count)) if count.bytes().all(|b| b.is_ascii_digit()) => {
                // INSERT carries the legacy oid before the count
                match command.rsplit_once(' ') {
                    Some((insert @ "INSERT", oid)) if oid.bytes().all(|b| b.is_ascii_digit()) => insert,
                    _ => command,
                }
            }
            _ => tag,
        }
    }

    /// Number of rows affected, `0` for commands without a count.
    pub fn rows_affected(&self) -> u64 {
        let mut whs = self.tag.split_whitespace();
        let Some(tag) = whs.next() else {
            return 0;
        };
        let Some(rows) = whs.next() else {
            return 0;
        };
        match tag {
            "INSERT" => whs.next().unwrap_or_default(),
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }

    /// Returns `true` for the tag of an empty query string.
    pub fn is_empty(&self) -> bool {
        self.tag.is_empty()
    }

    pub fn is_select(&self) -> bool {
        self.command() == "SELECT"
    }

    pub fn is_insert(&self) -> bool {
        self.command() == "INSERT"
    }

    pub fn is_update(&self) -> bool {
        self.command() == "UPDATE"
    }

    pub fn is_delete(&self) -> bool {
        self.command() == "DELETE"
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

impl fmt::Debug for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommandTag").field(&self.tag.as_str()).finish()
    }
}
