//! Sql string operation.

/// Type that represent sql string.
pub trait Sql<'a> {
    /// Returns sql string.
    fn sql(&self) -> &'a str;

    /// Return `true` if current statement should be cached.
    fn persistent(&self) -> bool;
}

impl<'a> Sql<'a> for &'a str {
    fn sql(&self) -> &'a str {
        self
    }

    fn persistent(&self) -> bool {
        true
    }
}

impl<'a> Sql<'a> for &'a String {
    fn sql(&self) -> &'a str {
        self.as_str()
    }

    fn persistent(&self) -> bool {
        true
    }
}

/// Non persistent query string, parsed as the unnamed statement on every execution.
#[derive(Debug, Clone, Copy)]
pub struct SqlOnce<'a>(&'a str);

impl<'a> Sql<'a> for SqlOnce<'a> {
    fn sql(&self) -> &'a str {
        self.0
    }

    fn persistent(&self) -> bool {
        false
    }
}

/// Extension trait for easier query persistence config.
pub trait SqlExt<'a> {
    /// Disable statement caching.
    fn once(self) -> SqlOnce<'a>;
}

impl<'a> SqlExt<'a> for &'a str {
    fn once(self) -> SqlOnce<'a> {
        SqlOnce(self)
    }
}

impl<'a> SqlExt<'a> for SqlOnce<'a> {
    fn once(self) -> SqlOnce<'a> {
        self
    }
}

/// Returns `true` for statements accepted inside a failed transaction block.
pub(crate) fn is_rollback(sql: &str) -> bool {
    let word = sql
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();
    word.eq_ignore_ascii_case("ROLLBACK") || word.eq_ignore_ascii_case("ABORT")
}

/// Quote an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(ident: &str) -> String {
    let mut quoted = String::with_capacity(ident.len() + 2);
    quoted.push('"');
    for c in ident.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Quote a possibly schema qualified name, `schema.table`.
pub(crate) fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rollback_detection() {
        assert!(is_rollback("ROLLBACK"));
        assert!(is_rollback("  rollback to savepoint sp_1"));
        assert!(is_rollback("abort"));
        assert!(!is_rollback("SELECT 1"));
        assert!(!is_rollback("rollbacks"));
    }

    #[test]
    fn identifier_quoting() {
        assert_eq!(quote_ident("chan"), "\"chan\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_qualified("public.users"), "\"public\".\"users\"");
    }
}
