use serde::{Deserialize, Serialize};
use std::fmt;

/// Dispatch tier for an outgoing operation.
///
/// - Critical: sent immediately, never batched (completion events)
/// - Normal: batched behind a short debounce to coalesce rapid edits
/// - Background: large or analytic payloads, sent last and dropped first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    Normal = 1,
    Background = 2,
}

impl Priority {
    /// All tiers, most urgent first
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Normal, Priority::Background];

    /// Eviction order under queue pressure
    pub const EVICTION_ORDER: [Priority; 3] =
        [Priority::Background, Priority::Normal, Priority::Critical];

    pub fn name(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Normal => "normal",
            Priority::Background => "background",
        }
    }

    /// Whether sends in this tier wait for a batching window
    pub fn is_batched(&self) -> bool {
        !matches!(self, Priority::Critical)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_urgency() {
        assert!(Priority::Critical < Priority::Normal);
        assert!(Priority::Normal < Priority::Background);
        assert_eq!(Priority::Critical.min(Priority::Background), Priority::Critical);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Priority::Background).unwrap(), r#""background""#);
        let p: Priority = serde_json::from_str(r#""critical""#).unwrap();
        assert_eq!(p, Priority::Critical);
    }
}
