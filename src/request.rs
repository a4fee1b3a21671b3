use std::fmt;

/// Identifier of the requesting user, embedded as decimal text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("URL must start with http:// or https://")]
pub struct UrlRejected;

/// A URL that passed validation. Only `parse` can build one, so the
/// pipeline never sees an unchecked string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl(String);

impl TargetUrl {
    /// Only the scheme prefix is checked. The text is kept exactly as sent.
    pub fn parse(raw: &str) -> Result<Self, UrlRejected> {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Ok(Self(raw.to_string()))
        } else {
            Err(UrlRejected)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
