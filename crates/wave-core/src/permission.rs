//! Tool permission pattern parsing and matching.
//!
//! Patterns look like `Read`, `Write(path/*)`, `Bash(cmd *)`, `Edit(*)`,
//! `Deny(Bash(rm -rf /*))`. The grammar is a tool name plus an optional
//! parenthesized argument glob; `*` matches any run of characters.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPattern {
    pub tool: String,
    /// `None` means "match any argument" (bare `Read`, `Edit`, etc.).
    pub arg_glob: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PatternParseError {
    #[error("empty pattern")]
    Empty,
    #[error("unbalanced parentheses in pattern: {0}")]
    Unbalanced(String),
}

impl ToolPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PatternParseError::Empty);
        }
        match raw.find('(') {
            None => Ok(Self {
                tool: raw.to_string(),
                arg_glob: None,
            }),
            Some(open) => {
                if !raw.ends_with(')') {
                    return Err(PatternParseError::Unbalanced(raw.to_string()));
                }
                let tool = raw[..open].to_string();
                let arg_glob = raw[open + 1..raw.len() - 1].to_string();
                Ok(Self {
                    tool,
                    arg_glob: Some(arg_glob),
                })
            }
        }
    }

    /// Does this pattern match a requested `(tool, arg)` use?
    pub fn matches(&self, tool: &str, arg: Option<&str>) -> bool {
        if self.tool != tool {
            return false;
        }
        match (&self.arg_glob, arg) {
            (None, _) => true,
            (Some(glob), Some(arg)) => glob_match(glob, arg),
            (Some(_), None) => false,
        }
    }
}

/// Simple `*`-only glob matcher (no `?`, no character classes — the spec's
/// wildcard syntax only needs `*`).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn helper(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some(b'*') => {
                helper(&pattern[1..], text) || (!text.is_empty() && helper(pattern, &text[1..]))
            }
            Some(&c) => text.first() == Some(&c) && helper(&pattern[1..], &text[1..]),
        }
    }
    helper(pattern.as_bytes(), text.as_bytes())
}

/// A persona's resolved allow/deny permission set. Deny always wins over allow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    pub allow: Vec<ToolPattern>,
    pub deny: Vec<ToolPattern>,
}

impl PermissionSet {
    pub fn from_raw(allow: &[String], deny: &[String]) -> Result<Self, PatternParseError> {
        Ok(Self {
            allow: allow.iter().map(|s| ToolPattern::parse(s)).collect::<Result<_, _>>()?,
            deny: deny.iter().map(|s| ToolPattern::parse(s)).collect::<Result<_, _>>()?,
        })
    }

    /// Is a `(tool, arg)` use permitted? Deny wins; absence from allow means
    /// denied.
    pub fn is_allowed(&self, tool: &str, arg: Option<&str>) -> bool {
        if self.deny.iter().any(|p| p.matches(tool, arg)) {
            return false;
        }
        self.allow.iter().any(|p| p.matches(tool, arg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_tool() {
        let p = ToolPattern::parse("Read").unwrap();
        assert_eq!(p.tool, "Read");
        assert_eq!(p.arg_glob, None);
    }

    #[test]
    fn parses_tool_with_glob() {
        let p = ToolPattern::parse("Write(path/*)").unwrap();
        assert_eq!(p.tool, "Write");
        assert_eq!(p.arg_glob.as_deref(), Some("path/*"));
    }

    #[test]
    fn rejects_unbalanced() {
        assert!(ToolPattern::parse("Write(path/*").is_err());
    }

    #[test]
    fn glob_matches_prefix_and_suffix_wildcards() {
        assert!(glob_match("path/*", "path/to/file.rs"));
        assert!(glob_match("cmd *", "cmd --flag value"));
        assert!(!glob_match("path/*", "other/to/file.rs"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let set = PermissionSet::from_raw(
            &["Bash(*)".to_string()],
            &["Bash(rm -rf /*)".to_string()],
        )
        .unwrap();
        assert!(set.is_allowed("Bash", Some("ls -la")));
        assert!(!set.is_allowed("Bash", Some("rm -rf /tmp/x")));
    }

    #[test]
    fn absence_from_allow_denies() {
        let set = PermissionSet::from_raw(&["Read".to_string()], &[]).unwrap();
        assert!(!set.is_allowed("Write", Some("x")));
    }
}
