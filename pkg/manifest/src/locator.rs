use regex::Regex;
use std::sync::LazyLock;

use crate::ManifestError;

static LOCATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{32}\+[0-9]+(\+[A-Z][A-Za-z0-9@_-]*)*$").expect("locator pattern")
});

static REMOTE_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r" [0-9a-f]{32}\+\d+[^ \n]*\+R[^ \n]*").expect("remote hint pattern")
});

/// A parsed block locator: `<md5>+<size>[+<hint>...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    pub hash: String,
    pub size: u64,
    pub hints: Vec<String>,
}

impl BlockLocator {
    pub fn parse(token: &str) -> Result<Self, ManifestError> {
        if !is_locator(token) {
            return Err(ManifestError::InvalidLocator(token.to_string()));
        }
        let mut parts = token.split('+');
        let hash = parts.next().unwrap_or_default().to_string();
        let size = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ManifestError::InvalidLocator(token.to_string()))?;
        Ok(Self {
            hash,
            size,
            hints: parts.map(str::to_string).collect(),
        })
    }

    /// `<md5>+<size>` without hints.
    pub fn stripped(&self) -> String {
        format!("{}+{}", self.hash, self.size)
    }

    /// Remote cluster hint (`R<cluster>-<sig>`), if any.
    pub fn remote_hint(&self) -> Option<&str> {
        self.hints.iter().find(|h| h.starts_with('R')).map(String::as_str)
    }

    /// Signature hint (`A<sig>@<expiry>`), if any.
    pub fn signature(&self) -> Option<&str> {
        self.hints.iter().find(|h| h.starts_with('A')).map(String::as_str)
    }
}

impl std::fmt::Display for BlockLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.hash, self.size)?;
        for h in &self.hints {
            write!(f, "+{}", h)?;
        }
        Ok(())
    }
}

pub fn is_locator(token: &str) -> bool {
    LOCATOR_RE.is_match(token)
}

/// Size field of a locator token, without validating the rest.
pub(crate) fn locator_size(token: &str) -> Option<u64> {
    token.split('+').nth(1).and_then(|s| s.parse().ok())
}

/// True if manifest text references any block stored on a remote cluster.
pub fn has_remote_blocks(manifest_text: &str) -> bool {
    REMOTE_HINT_RE.is_match(manifest_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locator_with_hints() {
        let b = BlockLocator::parse(
            "365f83f5f808896ec834c8b595288735+2310+K@qr1hi+Af0c9a66381f3b028677411926f0be1c6282fe67c@542b5ddf",
        )
        .unwrap();
        assert_eq!(b.hash, "365f83f5f808896ec834c8b595288735");
        assert_eq!(b.size, 2310);
        assert_eq!(b.hints, vec!["K@qr1hi", "Af0c9a66381f3b028677411926f0be1c6282fe67c@542b5ddf"]);
        assert!(b.signature().is_some());
        assert!(b.remote_hint().is_none());
        assert_eq!(b.stripped(), "365f83f5f808896ec834c8b595288735+2310");
    }

    #[test]
    fn test_reject_bad_locators() {
        assert!(!is_locator("acbd18db4cc2f85cedef654fccc4a4+3"));
        assert!(!is_locator("acbd18db4cc2f85cedef654fccc4a4d8"));
        assert!(!is_locator("acbd18db4cc2f85cedef654fccc4a4d8+3+k"));
        assert!(is_locator("acbd18db4cc2f85cedef654fccc4a4d8+3+Rzzzzz-abc"));
    }

    #[test]
    fn test_remote_blocks() {
        assert!(has_remote_blocks(
            ". acbd18db4cc2f85cedef654fccc4a4d8+3+Rzzzzz-0123abcd@53bed294 0:3:foo\n"
        ));
        assert!(!has_remote_blocks(
            ". acbd18db4cc2f85cedef654fccc4a4d8+3+A0123abcd@53bed294 0:3:foo\n"
        ));
    }
}
