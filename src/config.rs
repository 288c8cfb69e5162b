//! Config Resolver (design.md §4.1).
//!
//! Given a user-supplied alias and an ordered list of OpenSSH-style config
//! files, answers "what real host and port should I dial?". This module is
//! a stateless function over its inputs: it owns no state between calls.
//!
//! The grammar: a line is ignored if empty or if its first non-blank
//! character is `#`. Otherwise it is a directive: a keyword (letters,
//! case-insensitive, normalized to lowercase), an optional `=`, and a value,
//! optionally quoted with `"` (a quoted value ends at the *last* `"` on the
//! line, matching OpenSSH's own liberal parsing). Lines are grouped under
//! `Host pattern-list` sentinels; a pattern may be negated with a leading
//! `!`, and patterns use glob syntax (`*`, `?`, `[set]`).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::net::NetworkAddress;

const DEFAULT_PORT: u16 = 22;

/// One glob pattern from a `Host` directive's pattern list.
struct Pattern {
    negated: bool,
    regex: Regex,
}

impl Pattern {
    fn new(token: &str) -> Option<Self> {
        let (negated, glob) = match token.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let regex = Regex::new(&glob_to_regex(glob)).ok()?;
        Some(Self { negated, regex })
    }
}

/// Translate a `Host`-pattern-list glob (`*`, `?`, `[set]`) into an anchored
/// regex. `[set]` bracket expressions are copied through verbatim since
/// regex's own character-class syntax already matches OpenSSH's closely
/// enough for this purpose.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                for c2 in chars.by_ref() {
                    out.push(c2);
                    if c2 == ']' {
                        break;
                    }
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// True if `alias` matches this pattern list: OpenSSH-style, the first
/// pattern in the list that matches at all decides the outcome (negation
/// flips it).
fn pattern_list_matches(patterns: &[Pattern], alias: &str) -> bool {
    for pattern in patterns {
        if pattern.regex.is_match(alias) {
            return !pattern.negated;
        }
    }
    false
}

/// Parse one line into `(keyword, value)`. Returns `None` for blank lines,
/// comment lines, and lines with no parseable keyword.
fn parse_directive(line: &str) -> Option<(String, String)> {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let keyword_end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let keyword = line[..keyword_end].to_lowercase();
    if keyword.is_empty() {
        return None;
    }

    let mut rest = line[keyword_end..].trim_start();
    if let Some(stripped) = rest.strip_prefix('=') {
        rest = stripped.trim_start();
    }

    let value = if let Some(unquoted) = rest.strip_prefix('"') {
        match unquoted.rfind('"') {
            Some(end) => &unquoted[..end],
            None => unquoted,
        }
    } else {
        rest.trim_end()
    };

    Some((keyword, value.to_string()))
}

/// Walk one file's directives, accumulating first-write-wins values into
/// `values` for every section whose `Host` pattern list matches `alias`.
fn scan_file(contents: &str, alias: &str, values: &mut HashMap<String, String>) {
    let mut in_matching_section = false;

    for raw_line in contents.lines() {
        let (keyword, value) = match parse_directive(raw_line) {
            Some(kv) => kv,
            None => continue,
        };

        if keyword == "host" {
            let patterns: Vec<Pattern> =
                value.split_whitespace().filter_map(Pattern::new).collect();
            in_matching_section = pattern_list_matches(&patterns, alias);
            continue;
        }

        if in_matching_section {
            values.entry(keyword).or_insert(value);
        }
    }
}

/// Resolve `alias` through `files`, in the order given (conventionally: a
/// user-level file before a system-wide one, so personal settings take
/// precedence under first-write-wins).
///
/// A missing or unreadable file is silently skipped (ConfigUnreadable is a
/// recoverable condition here, not surfaced as an error — see design.md
/// §7). A malformed port falls back to the default for that section only.
/// The resolver always returns a NetworkAddress, even with zero matches.
pub fn resolve<P: AsRef<Path>>(alias: &str, files: &[P]) -> NetworkAddress {
    let stripped = match alias.rsplit_once('@') {
        Some((_, "")) => {
            // Malformed alias ("user@" with nothing after); dial it verbatim.
            return NetworkAddress::new(alias, DEFAULT_PORT).expect("default port is nonzero");
        }
        Some((_, host)) => host,
        None => alias,
    };

    let mut values = HashMap::new();
    for path in files {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => scan_file(&contents, stripped, &mut values),
            Err(e) => {
                log::debug!("config resolver: skipping unreadable file {:?}: {}", path, e);
            }
        }
    }

    let hostname = values
        .get("hostname")
        .map(|s| s.as_str())
        .unwrap_or(stripped)
        .to_string();

    let port = values
        .get("port")
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|&p| p != 0)
        .unwrap_or(DEFAULT_PORT);

    NetworkAddress::new(hostname, port).expect("port validated nonzero above")
}
