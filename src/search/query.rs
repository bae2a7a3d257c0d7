//! Query AST for the case index.
//!
//! Queries are built as a tree and rendered to the index grammar
//! (`field:"value"` terms joined with AND/OR) only when a string is needed,
//! e.g. to record which query linked a message to a file.

use std::fmt::Write;

pub const NAME: &str = "name";
pub const PATH: &str = "path";
pub const LENGTH: &str = "length";
pub const CONTENT_TYPE: &str = "contentType";
pub const SHA256: &str = "sha-256";
pub const HASH: &str = "hash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// `field:"value"`
    Phrase { field: String, value: String },
    /// `field:value`, for numbers and hashes that need no quoting.
    Exact { field: String, value: String },
    /// `field:value*`
    Prefix { field: String, value: String },
    /// `field:("a" "b")` or `field:(a b)`; matches any listed value.
    AnyOf {
        field: String,
        values: Vec<String>,
        quoted: bool,
    },
    And(Vec<Query>),
    Or(Vec<Query>),
}

impl Query {
    pub fn phrase(field: &str, value: impl Into<String>) -> Self {
        Self::Phrase {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn exact(field: &str, value: impl ToString) -> Self {
        Self::Exact {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn prefix(field: &str, value: impl Into<String>) -> Self {
        Self::Prefix {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn any_of<I, S>(field: &str, values: I, quoted: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AnyOf {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
            quoted,
        }
    }

    pub fn and(self, other: Query) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            q => Self::And(vec![q, other]),
        }
    }

    /// `name:"<name>" AND length:<size>`
    pub fn name_and_length(name: &str, length: u64) -> Self {
        Self::phrase(NAME, name).and(Self::exact(LENGTH, length))
    }

    /// Render to the index grammar, escaping values with `escape`.
    pub fn render(&self, escape: &dyn Fn(&str) -> String) -> String {
        let mut out = String::new();
        self.render_into(&mut out, escape, false);
        out
    }

    fn render_into(&self, out: &mut String, escape: &dyn Fn(&str) -> String, nested: bool) {
        match self {
            Self::Phrase { field, value } => {
                let _ = write!(out, "{field}:\"{}\"", escape(value));
            }
            Self::Exact { field, value } => {
                let _ = write!(out, "{field}:{}", escape(value));
            }
            Self::Prefix { field, value } => {
                let _ = write!(out, "{field}:{}*", escape(value));
            }
            Self::AnyOf {
                field,
                values,
                quoted,
            } => {
                let _ = write!(out, "{field}:(");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    if *quoted {
                        let _ = write!(out, "\"{}\"", escape(v));
                    } else {
                        out.push_str(&escape(v));
                    }
                }
                out.push(')');
            }
            Self::And(parts) => Self::render_joined(parts, " AND ", out, escape, nested),
            Self::Or(parts) => Self::render_joined(parts, " OR ", out, escape, nested),
        }
    }

    fn render_joined(
        parts: &[Query],
        sep: &str,
        out: &mut String,
        escape: &dyn Fn(&str) -> String,
        nested: bool,
    ) {
        if nested && parts.len() > 1 {
            out.push('(');
        }
        for (i, p) in parts.iter().enumerate() {
            if i > 0 {
                out.push_str(sep);
            }
            p.render_into(out, escape, true);
        }
        if nested && parts.len() > 1 {
            out.push(')');
        }
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render(&|s: &str| s.to_string()))
    }
}

/// Backslash-escape the characters the index grammar treats as syntax.
pub fn escape_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(
            c,
            '+' | '-'
                | '&'
                | '|'
                | '!'
                | '('
                | ')'
                | '{'
                | '}'
                | '['
                | ']'
                | '^'
                | '"'
                | '~'
                | '*'
                | '?'
                | ':'
                | '\\'
                | '/'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn renders_hash_batch_unquoted() {
        let q = Query::any_of(SHA256, ["aa", "bb"], false);
        assert_eq!(q.render(&plain), "sha-256:(aa bb)");
    }

    #[test]
    fn renders_or_of_name_and_length_groups() {
        let q = Query::Or(vec![
            Query::name_and_length("a.jpg", 10),
            Query::name_and_length("b.jpg", 20),
        ]);
        assert_eq!(
            q.render(&plain),
            "(name:\"a.jpg\" AND length:10) OR (name:\"b.jpg\" AND length:20)"
        );
    }

    #[test]
    fn top_level_and_is_not_parenthesized() {
        let q = Query::name_and_length("IMG-1.jpg", 42);
        assert_eq!(q.to_string(), "name:\"IMG-1.jpg\" AND length:42");
    }

    #[test]
    fn escape_handles_syntax_characters() {
        assert_eq!(escape_query_value("a-b:c"), "a\\-b\\:c");
        let q = Query::phrase(NAME, "IMG-1.jpg");
        assert_eq!(q.render(&escape_query_value), "name:\"IMG\\-1.jpg\"");
    }
}
