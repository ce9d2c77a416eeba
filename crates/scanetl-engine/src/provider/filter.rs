//! Entry name filtering
//!
//! Patterns use shell glob syntax: `*`, `?`, `[abc]`, `[!abc]` and brace
//! alternation `{csv,json}`. They are matched against the entry's file name,
//! not its full path, and compiled to anchored regular expressions once at
//! configuration time.

use regex::Regex;

use crate::config::ConfigError;

#[derive(Debug, Clone)]
pub struct NamePattern {
    glob: String,
    regex: Regex,
}

impl NamePattern {
    pub fn parse(glob: &str) -> Result<Self, ConfigError> {
        let source = glob_to_regex(glob).map_err(|message| ConfigError::Pattern {
            pattern: glob.to_string(),
            message,
        })?;
        let regex = Regex::new(&source).map_err(|e| ConfigError::Pattern {
            pattern: glob.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

fn glob_to_regex(glob: &str) -> Result<String, String> {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');

    let mut chars = glob.chars().peekable();
    let mut brace_depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                if !closed {
                    return Err("unclosed character class".to_string());
                }
                out.push(']');
            },
            '{' => {
                brace_depth += 1;
                out.push_str("(?:");
            },
            '}' if brace_depth > 0 => {
                brace_depth -= 1;
                out.push(')');
            },
            ',' if brace_depth > 0 => out.push('|'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    if brace_depth > 0 {
        return Err("unclosed brace alternation".to_string());
    }

    out.push('$');
    Ok(out)
}

/// Allow-list plus recursion toggle applied by every provider's producer
#[derive(Debug, Clone)]
pub struct EntryFilter {
    patterns: Vec<NamePattern>,
    recursive: bool,
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            recursive: true,
        }
    }
}

impl EntryFilter {
    pub fn new(pattern: Option<&str>, recursive: bool) -> Result<Self, ConfigError> {
        let patterns = match pattern {
            Some(glob) if !glob.trim().is_empty() => vec![NamePattern::parse(glob.trim())?],
            _ => Vec::new(),
        };
        Ok(Self {
            patterns,
            recursive,
        })
    }

    /// Filter that accepts everything and recurses
    pub fn all() -> Self {
        Self::default()
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_question() {
        let p = NamePattern::parse("scan-??.csv").unwrap();
        assert!(p.matches("scan-01.csv"));
        assert!(!p.matches("scan-1.csv"));

        let p = NamePattern::parse("*.csv").unwrap();
        assert!(p.matches("hosts.csv"));
        assert!(!p.matches("hosts.csv.gz"));
        assert!(!p.matches("dir/hosts.csv"));
    }

    #[test]
    fn test_dot_is_literal() {
        let p = NamePattern::parse("a.b").unwrap();
        assert!(p.matches("a.b"));
        assert!(!p.matches("axb"));
    }

    #[test]
    fn test_character_classes() {
        let p = NamePattern::parse("log[0-9].txt").unwrap();
        assert!(p.matches("log7.txt"));
        assert!(!p.matches("logx.txt"));

        let p = NamePattern::parse("[!.]*").unwrap();
        assert!(p.matches("visible"));
        assert!(!p.matches(".hidden"));
    }

    #[test]
    fn test_brace_alternation() {
        let p = NamePattern::parse("*.{csv,json}").unwrap();
        assert!(p.matches("a.csv"));
        assert!(p.matches("b.json"));
        assert!(!p.matches("c.xml"));
    }

    #[test]
    fn test_unparsable_patterns() {
        assert!(matches!(
            NamePattern::parse("[abc"),
            Err(ConfigError::Pattern { .. })
        ));
        assert!(NamePattern::parse("*.{csv,json").is_err());
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = EntryFilter::new(None, false).unwrap();
        assert!(filter.accepts("anything"));
        assert!(!filter.recursive());

        let filter = EntryFilter::new(Some("*.csv"), true).unwrap();
        assert!(filter.accepts("x.csv"));
        assert!(!filter.accepts("x.txt"));
    }
}
