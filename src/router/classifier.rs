//! Failure Classification
//!
//! Maps an upstream status to the failure category that drives cooldowns and retries.

use crate::router::cooldown::CooldownLevel;

/// Classification of an attempt's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Success, nothing to record
    None,

    /// Rate limited or rejected credential
    Key,

    /// Upstream server fault
    Provider,

    /// Malformed or unsatisfiable request; never retried
    Client,
}

impl Category {
    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            429 | 401 | 403 => Category::Key,
            500.. => Category::Provider,
            400..=499 => Category::Client,
            _ => Category::None,
        }
    }

    /// The association window this category opens, if any
    pub fn cooldown_level(self) -> Option<CooldownLevel> {
        match self {
            Category::Key => Some(CooldownLevel::Key),
            Category::Provider => Some(CooldownLevel::Provider),
            Category::None | Category::Client => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(Category::from_status(429), Category::Key);
        assert_eq!(Category::from_status(401), Category::Key);
        assert_eq!(Category::from_status(403), Category::Key);
        assert_eq!(Category::from_status(500), Category::Provider);
        assert_eq!(Category::from_status(503), Category::Provider);
        assert_eq!(Category::from_status(404), Category::Client);
        assert_eq!(Category::from_status(400), Category::Client);
        assert_eq!(Category::from_status(200), Category::None);
        assert_eq!(Category::from_status(304), Category::None);
    }

    #[test]
    fn test_cooldown_level() {
        assert_eq!(Category::Key.cooldown_level(), Some(CooldownLevel::Key));
        assert_eq!(Category::Provider.cooldown_level(), Some(CooldownLevel::Provider));
        assert_eq!(Category::Client.cooldown_level(), None);
        assert_eq!(Category::None.cooldown_level(), None);
    }
}
