//! Shell quoting.
//!
//! [`shquote`] makes a single token safe for one layer of shell
//! interpretation. Applying it again quotes the already-quoted text, which
//! is what nested shells (ssh over ssh) need; the command model decides how
//! many times through the quoting depth passed to `formulate`.

/// Quoting dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuoteStyle {
    /// POSIX shells: single quotes, embedded `'` spelled as `'"'"'`.
    #[default]
    Posix,
    /// Hosts where the OS splits argv itself: double quotes with
    /// backslash escapes for `"`, `` ` ``, `$` and `\`.
    Windows,
}

impl QuoteStyle {
    /// Style matching the platform this crate was built for.
    pub fn native() -> Self {
        if cfg!(windows) {
            QuoteStyle::Windows
        } else {
            QuoteStyle::Posix
        }
    }
}

fn is_posix_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c)
}

fn is_windows_safe(c: char) -> bool {
    is_posix_safe(c) || c == '!'
}

const WINDOWS_ESCAPED: &str = "\"`$\\";

/// Quote `token` for a POSIX shell.
pub fn shquote(token: &str) -> String {
    shquote_with(token, QuoteStyle::Posix)
}

/// Quote `token` with an explicit dialect.
pub fn shquote_with(token: &str, style: QuoteStyle) -> String {
    if token.is_empty() {
        return "''".to_string();
    }
    match style {
        QuoteStyle::Posix => {
            if token.chars().all(is_posix_safe) {
                token.to_string()
            } else {
                format!("'{}'", token.replace('\'', "'\"'\"'"))
            }
        }
        QuoteStyle::Windows => {
            if token.chars().all(is_windows_safe) {
                return token.to_string();
            }
            if !token.contains('\'') {
                return format!("'{}'", token);
            }
            let mut quoted = String::with_capacity(token.len() + 2);
            quoted.push('"');
            for c in token.chars() {
                if WINDOWS_ESCAPED.contains(c) {
                    quoted.push('\\');
                }
                quoted.push(c);
            }
            quoted.push('"');
            quoted
        }
    }
}

/// Quote every token and join them with spaces.
pub fn shquote_list<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| shquote(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_tokens_unchanged() {
        assert_eq!(shquote("ls"), "ls");
        assert_eq!(shquote("-la"), "-la");
        assert_eq!(shquote("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(shquote("a=b,c:d@e%f+g"), "a=b,c:d@e%f+g");
    }

    #[test]
    fn test_empty_token() {
        assert_eq!(shquote(""), "''");
        assert_eq!(shquote_with("", QuoteStyle::Windows), "''");
    }

    #[test]
    fn test_spaces_and_metachars() {
        assert_eq!(shquote("hello world"), "'hello world'");
        assert_eq!(shquote("a|b"), "'a|b'");
        assert_eq!(shquote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_embedded_single_quote() {
        assert_eq!(shquote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn test_quoting_twice_quotes_the_quotes() {
        let once = shquote("a b");
        let twice = shquote(&once);
        assert_eq!(twice, "''\"'\"'a b'\"'\"''");
    }

    #[test]
    fn test_windows_style() {
        assert_eq!(shquote_with("hello!", QuoteStyle::Windows), "hello!");
        assert_eq!(shquote_with("a b", QuoteStyle::Windows), "'a b'");
        assert_eq!(
            shquote_with("it's $5 \"x\"", QuoteStyle::Windows),
            "\"it's \\$5 \\\"x\\\"\""
        );
    }

    #[test]
    fn test_shquote_list() {
        assert_eq!(shquote_list(&["ls", "-a", "my dir"]), "ls -a 'my dir'");
        let empty: [&str; 0] = [];
        assert_eq!(shquote_list(&empty), "");
    }
}
