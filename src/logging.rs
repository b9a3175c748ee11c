//! Log-safe rendering of API keys

use std::fmt;

/// Redacted API key for log output
///
/// Shows the first 8 characters followed by `***`; shorter keys are fully masked.
#[derive(Clone, Copy, Debug)]
pub struct SensitiveApiKey<'a> {
    inner: &'a str,
}

impl<'a> SensitiveApiKey<'a> {
    /// # Example
    /// ```
    /// use gateway_telemetry::logging::SensitiveApiKey;
    ///
    /// let key = "sk-ant-api123-abcdef123456";
    /// assert_eq!(SensitiveApiKey::new(key).to_string(), "sk-ant-a***");
    /// ```
    pub fn new(key: &'a str) -> Self {
        Self { inner: key }
    }
}

impl fmt::Display for SensitiveApiKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const VISIBLE: usize = 8;

        match self.inner.char_indices().nth(VISIBLE) {
            Some((cut, _)) => write!(f, "{}***", &self.inner[..cut]),
            None => write!(f, "***"),
        }
    }
}
