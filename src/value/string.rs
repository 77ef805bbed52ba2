use std::fmt::{self, Debug, Formatter};

/// An interpreted string: UTF-16 code units, as the runtime stores them.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ClrString(Vec<u16>);

impl ClrString {
    pub fn new(chars: Vec<u16>) -> Self {
        Self(chars)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn units(&self) -> &[u16] {
        &self.0
    }

    pub fn as_string(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for ClrString {
    fn from(s: &str) -> Self {
        Self(s.encode_utf16().collect())
    }
}

impl From<String> for ClrString {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl Debug for ClrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_string())
    }
}
