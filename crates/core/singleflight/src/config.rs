use std::time::Duration;

#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
/// Config values for [`Caller`](crate::Caller).
pub struct CallerConfig {
    /// Label used when logging
    pub name: String,
    /// Upper bound on how long a follower waits for the leader,
    /// applied on top of whatever the follower's own context allows
    pub follower_timeout: Option<Duration>,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            name: "singleflight".to_string(),
            follower_timeout: None,
        }
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use std::time::Duration;

    use super::CallerConfig;

    #[test]
    fn deserializes_with_defaults() {
        let config: CallerConfig =
            serde_json::from_str(r#"{ "follower_timeout": { "secs": 2, "nanos": 0 } }"#).unwrap();

        assert_eq!(config.name, "singleflight");
        assert_eq!(config.follower_timeout, Some(Duration::from_secs(2)));

        let config: CallerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CallerConfig::default());
    }
}
