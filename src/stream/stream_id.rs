//! Stream identification type.

use std::sync::Arc;

/// Name of a shared stream.
///
/// `StreamId` is a cheap, cloneable handle on the stream's configured name.
/// It keys the registry, the stage registry of each pipeline and the events
/// the multiplexer emits.
///
/// # Example
///
/// ```
/// use aes67_mux::StreamId;
///
/// let studio = StreamId::new("studio");
/// assert_eq!(studio, StreamId::from("studio"));
/// assert_eq!(studio.to_string(), "studio");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(Arc<str>);

impl StreamId {
    /// Creates a stream id from a name.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StreamId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_equality() {
        assert_eq!(StreamId::new("s1"), StreamId::from(String::from("s1")));
        assert_ne!(StreamId::new("s1"), StreamId::new("s2"));
    }

    #[test]
    fn test_stream_id_map_lookup_by_str() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(StreamId::new("studio"), 1);
        assert_eq!(map.get("studio"), Some(&1));
        assert_eq!(map.get("lobby"), None);
    }
}
