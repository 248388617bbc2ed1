//! Argument values that can be bound to a command.

use std::path::{Path, PathBuf};

use super::Command;
use crate::quoting::{shquote, shquote_list};

/// A value bound to a command.
///
/// Binding keeps the quirks of shell-style argument lists: an explicit
/// empty string stays an (empty) argument, an empty list contributes
/// nothing, and `None` is dropped.
#[derive(Debug, Clone)]
pub enum Arg {
    /// A single token, kept even when empty.
    Str(String),
    /// Several tokens spliced in place.
    List(Vec<String>),
    /// A nested command, rendered one quoting level deeper.
    Command(Command),
    /// Nothing (from `None`).
    Skip,
}

impl Arg {
    /// Render into tokens at `level`, quoting once `level` reaches
    /// `quote_level`.
    pub(crate) fn render(&self, level: usize, quote_level: usize, out: &mut Vec<String>) {
        let quote = level >= quote_level;
        match self {
            Arg::Str(s) => out.push(if quote { shquote(s) } else { s.clone() }),
            Arg::List(items) => {
                for s in items {
                    out.push(if quote { shquote(s) } else { s.clone() });
                }
            }
            Arg::Command(cmd) => {
                let tokens = cmd.formulate(level + 1);
                if quote {
                    out.push(shquote_list(&tokens));
                } else {
                    out.extend(tokens);
                }
            }
            Arg::Skip => {}
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

impl From<&Path> for Arg {
    fn from(p: &Path) -> Self {
        Arg::Str(p.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for Arg {
    fn from(p: PathBuf) -> Self {
        Arg::from(p.as_path())
    }
}

impl From<&PathBuf> for Arg {
    fn from(p: &PathBuf) -> Self {
        Arg::from(p.as_path())
    }
}

impl From<Command> for Arg {
    fn from(cmd: Command) -> Self {
        Arg::Command(cmd)
    }
}

impl From<&Command> for Arg {
    fn from(cmd: &Command) -> Self {
        Arg::Command(cmd.clone())
    }
}

impl From<Vec<String>> for Arg {
    fn from(items: Vec<String>) -> Self {
        Arg::List(items)
    }
}

impl From<Vec<&str>> for Arg {
    fn from(items: Vec<&str>) -> Self {
        Arg::List(items.into_iter().map(String::from).collect())
    }
}

impl From<&[&str]> for Arg {
    fn from(items: &[&str]) -> Self {
        Arg::List(items.iter().map(|s| s.to_string()).collect())
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Arg::Skip, Into::into)
    }
}

macro_rules! arg_from_display {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Arg {
                fn from(value: $t) -> Self {
                    Arg::Str(value.to_string())
                }
            }
        )*
    };
}

arg_from_display!(char, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

/// Build a `Vec<Arg>` from values of mixed types.
///
/// ```
/// use pipewright::args;
/// let v = args!["-n", 3, Some("x"), None::<&str>];
/// assert_eq!(v.len(), 4);
/// ```
#[macro_export]
macro_rules! args {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::Arg::from($value)),*]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(arg: Arg, level: usize, quote_level: usize) -> Vec<String> {
        let mut out = Vec::new();
        arg.render(level, quote_level, &mut out);
        out
    }

    #[test]
    fn test_empty_string_is_kept() {
        assert_eq!(rendered(Arg::from(""), 0, 2), vec![""]);
        assert_eq!(rendered(Arg::from(""), 2, 2), vec!["''"]);
    }

    #[test]
    fn test_empty_list_and_none_are_dropped() {
        assert!(rendered(Arg::from(Vec::<String>::new()), 0, 2).is_empty());
        assert!(rendered(Arg::from(None::<&str>), 0, 2).is_empty());
    }

    #[test]
    fn test_list_is_spliced_and_quoted_per_item() {
        let arg = Arg::from(vec!["a b", "c"]);
        assert_eq!(rendered(arg.clone(), 0, 1), vec!["a b", "c"]);
        assert_eq!(rendered(arg, 1, 1), vec!["'a b'", "c"]);
    }

    #[test]
    fn test_numbers_and_paths() {
        assert_eq!(rendered(Arg::from(42), 0, 2), vec!["42"]);
        assert_eq!(rendered(Arg::from(PathBuf::from("/tmp/x")), 0, 2), vec!["/tmp/x"]);
        assert_eq!(rendered(Arg::from(Some(1.5)), 0, 2), vec!["1.5"]);
    }

    #[test]
    fn test_args_macro() {
        let v = crate::args!["-n", 3, None::<&str>];
        assert!(matches!(v[0], Arg::Str(_)));
        assert!(matches!(v[1], Arg::Str(ref s) if s == "3"));
        assert!(matches!(v[2], Arg::Skip));
    }
}
