use std::fmt;
use std::sync::Arc;

/// A single fuzzing input: a non-empty, immutable byte string.
///
/// Cloning is cheap; the bytes are shared, which lets the corpus hand out
/// seeds to the mutator without copying them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TestCase {
    bytes: Arc<[u8]>,
}

impl TestCase {
    /// Wraps `bytes`, returning `None` when they are empty.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Option<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return None;
        }
        Some(Self {
            bytes: Arc::from(bytes),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`; kept for API symmetry with slices.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Escaped rendering of at most `limit` leading bytes, suffixed with `...`
    /// when the input was cut.
    pub fn preview(&self, limit: usize) -> String {
        let shown = &self.bytes[..self.bytes.len().min(limit)];
        let mut out = shown.escape_ascii().to_string();
        if self.bytes.len() > limit {
            out.push_str("...");
        }
        out
    }
}

impl AsRef<[u8]> for TestCase {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestCase(b\"{}\")", self.bytes.escape_ascii())
    }
}
