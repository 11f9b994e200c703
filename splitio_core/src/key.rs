/// A user key for evaluation. The matching key drives matcher evaluation;
/// the bucketing key drives the hash-to-bucket computation. When no bucketing
/// key is given, the matching key is used for both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    matching_key: String,
    bucketing_key: Option<String>,
}

impl Key {
    pub fn new(matching_key: impl Into<String>) -> Key {
        Key {
            matching_key: matching_key.into(),
            bucketing_key: None,
        }
    }

    pub fn with_bucketing_key(
        matching_key: impl Into<String>,
        bucketing_key: impl Into<String>,
    ) -> Key {
        Key {
            matching_key: matching_key.into(),
            bucketing_key: Some(bucketing_key.into()),
        }
    }

    pub fn matching_key(&self) -> &str {
        &self.matching_key
    }

    /// The key used for bucketing. Falls back to the matching key.
    pub fn bucketing_key(&self) -> &str {
        self.bucketing_key.as_deref().unwrap_or(&self.matching_key)
    }

    /// The bucketing key only if it was explicitly provided.
    pub fn explicit_bucketing_key(&self) -> Option<&str> {
        self.bucketing_key.as_deref()
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Key {
        Key::new(value)
    }
}

impl From<String> for Key {
    fn from(value: String) -> Key {
        Key::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::Key;

    #[test]
    fn bucketing_key_falls_back_to_matching_key() {
        let key = Key::new("alice");
        assert_eq!(key.matching_key(), "alice");
        assert_eq!(key.bucketing_key(), "alice");
        assert_eq!(key.explicit_bucketing_key(), None);

        let key = Key::with_bucketing_key("alice", "bucket-7");
        assert_eq!(key.matching_key(), "alice");
        assert_eq!(key.bucketing_key(), "bucket-7");
    }
}
