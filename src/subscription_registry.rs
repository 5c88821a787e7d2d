use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicState {
    Pending,
    Subscribed,
}

/// Topics that already have a broker subscription (or one in flight).
///
/// There is no reference counting and no unsubscribe: once a topic is marked
/// subscribed it stays that way for the life of the connection.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: HashMap<String, TopicState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the broker has acknowledged a subscription for `topic`.
    pub fn has(&self, topic: &str) -> bool {
        self.topics.get(topic) == Some(&TopicState::Subscribed)
    }

    pub fn mark_subscribed(&mut self, topic: &str) {
        self.topics.insert(topic.to_string(), TopicState::Subscribed);
    }

    /// Claims `topic` for a new subscribe request.
    ///
    /// Returns false when the topic is already subscribed or a request for it
    /// is still waiting on its acknowledgement.
    pub fn begin_request(&mut self, topic: &str) -> bool {
        if self.topics.contains_key(topic) {
            return false;
        }
        self.topics.insert(topic.to_string(), TopicState::Pending);
        true
    }

    /// Releases a pending claim after a failed request so a later caller may retry.
    pub fn abandon(&mut self, topic: &str) {
        if self.topics.get(topic) == Some(&TopicState::Pending) {
            self.topics.remove(topic);
        }
    }

    /// Every topic that is subscribed or has a request in flight.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_topic_is_not_reported_but_blocks_new_requests() {
        let mut registry = SubscriptionRegistry::new();

        assert!(registry.begin_request("GPS/location/1"));
        assert!(!registry.has("GPS/location/1"));
        assert!(!registry.begin_request("GPS/location/1"));
    }

    #[test]
    fn acknowledged_topic_stays_subscribed() {
        let mut registry = SubscriptionRegistry::new();

        registry.begin_request("GPS/location/1");
        registry.mark_subscribed("GPS/location/1");
        registry.abandon("GPS/location/1");

        assert!(registry.has("GPS/location/1"));
        assert!(!registry.begin_request("GPS/location/1"));
        assert_eq!(registry.topics().collect::<Vec<_>>(), vec!["GPS/location/1"]);
    }

    #[test]
    fn abandoned_request_can_be_retried() {
        let mut registry = SubscriptionRegistry::new();

        registry.begin_request("GPS/location/2");
        registry.abandon("GPS/location/2");

        assert!(!registry.has("GPS/location/2"));
        assert!(registry.begin_request("GPS/location/2"));
    }
}
