//! Bounded match patterns for the expect engine.
//!
//! The expect engine re-scans only the unconsumed tail of the receive buffer
//! after every read chunk. For that to be safe it has to know how many
//! trailing bytes a pattern could possibly span, so every pattern must have a
//! provable maximum match length. Literals trivially do; regexes are analyzed
//! at construction and rejected if they contain unbounded repetition.

use regex::bytes::Regex;

use crate::error::ChannelError;

/// A literal byte string or a regex with a finite maximum match length.
#[derive(Debug, Clone)]
pub struct BoundedPattern {
    regex: Regex,
    source: String,
    max_len: usize,
}

impl BoundedPattern {
    /// Build a pattern matching `text` literally.
    pub fn literal(text: impl AsRef<[u8]>) -> Self {
        let bytes = text.as_ref();
        let mut escaped = String::with_capacity(bytes.len() * 4);
        for &b in bytes {
            escaped.push_str(&format!(r"\x{:02x}", b));
        }
        let regex = regex::bytes::RegexBuilder::new(&escaped)
            .unicode(false)
            .build()
            .expect("escaped literal is always a valid pattern");
        Self {
            regex,
            source: String::from_utf8_lossy(bytes).into_owned(),
            max_len: bytes.len().max(1),
        }
    }

    /// Build a pattern from a regex, rejecting unbounded repetition.
    ///
    /// Constructs like `*`, `+` and `{n,}` make the maximum match length
    /// unprovable and fail with [`ChannelError::UnboundedPattern`]; bounded
    /// repetition (`{n,m}`, `?`) is fine for any bound.
    pub fn regex(pattern: &str) -> Result<Self, ChannelError> {
        let regex = Regex::new(pattern)?;
        let hir = regex_syntax::parse(pattern)
            .map_err(|_| ChannelError::UnboundedPattern(pattern.to_string()))?;
        let max_len = hir
            .properties()
            .maximum_len()
            .ok_or_else(|| ChannelError::UnboundedPattern(pattern.to_string()))?
            .max(1);
        Ok(Self {
            regex,
            source: pattern.to_string(),
            max_len,
        })
    }

    /// Maximum number of bytes a single match of this pattern can span.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// The pattern source text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub(crate) fn find(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        self.regex.find(haystack).map(|m| (m.start(), m.end()))
    }

    pub(crate) fn captures_at_match(&self, haystack: &[u8]) -> Vec<Option<Vec<u8>>> {
        match self.regex.captures(haystack) {
            Some(caps) => caps
                .iter()
                .map(|g| g.map(|m| m.as_bytes().to_vec()))
                .collect(),
            None => Vec::new(),
        }
    }
}

impl From<&str> for BoundedPattern {
    fn from(text: &str) -> Self {
        Self::literal(text)
    }
}

impl From<&[u8]> for BoundedPattern {
    fn from(bytes: &[u8]) -> Self {
        Self::literal(bytes)
    }
}

impl<const N: usize> From<&[u8; N]> for BoundedPattern {
    fn from(bytes: &[u8; N]) -> Self {
        Self::literal(bytes.as_slice())
    }
}

/// Result of a successful `expect()`.
#[derive(Debug, Clone)]
pub struct ExpectMatch {
    /// Index of the satisfied pattern in the candidate list.
    pub index: usize,

    /// Buffered bytes strictly before the match. Consumed from the buffer.
    pub before: Vec<u8>,

    /// The exact bytes of the match.
    pub matched: Vec<u8>,

    /// Capture groups of the match (group 0 is the whole match).
    pub groups: Vec<Option<Vec<u8>>>,
}

impl ExpectMatch {
    /// A capture group's bytes, if the group participated in the match.
    pub fn group(&self, i: usize) -> Option<&[u8]> {
        self.groups.get(i).and_then(|g| g.as_deref())
    }

    /// The pre-match bytes decoded as text (lossy).
    pub fn before_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.before)
    }

    /// The matched bytes decoded as text (lossy).
    pub fn matched_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.matched)
    }
}
