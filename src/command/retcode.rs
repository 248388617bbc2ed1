//! Accepted exit codes.

/// Which exit codes count as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retcode {
    /// Any code, including an unknown one. Disables checking.
    Any,
    /// Exactly this code.
    Exact(i32),
    /// Any of these codes.
    OneOf(Vec<i32>),
}

impl Default for Retcode {
    fn default() -> Self {
        Retcode::Exact(0)
    }
}

impl Retcode {
    /// Accept any of `codes`.
    pub fn one_of(codes: impl IntoIterator<Item = i32>) -> Self {
        Retcode::OneOf(codes.into_iter().collect())
    }

    /// Whether `code` is accepted. An unknown code only passes [`Retcode::Any`].
    pub fn accepts(&self, code: Option<i32>) -> bool {
        match (self, code) {
            (Retcode::Any, _) => true,
            (_, None) => false,
            (Retcode::Exact(expected), Some(code)) => *expected == code,
            (Retcode::OneOf(codes), Some(code)) => codes.contains(&code),
        }
    }
}

impl From<i32> for Retcode {
    fn from(code: i32) -> Self {
        Retcode::Exact(code)
    }
}

impl From<Option<i32>> for Retcode {
    fn from(code: Option<i32>) -> Self {
        code.map_or(Retcode::Any, Retcode::Exact)
    }
}

impl From<Vec<i32>> for Retcode {
    fn from(codes: Vec<i32>) -> Self {
        Retcode::OneOf(codes)
    }
}

impl From<&[i32]> for Retcode {
    fn from(codes: &[i32]) -> Self {
        Retcode::OneOf(codes.to_vec())
    }
}

impl<const N: usize> From<[i32; N]> for Retcode {
    fn from(codes: [i32; N]) -> Self {
        Retcode::OneOf(codes.to_vec())
    }
}
