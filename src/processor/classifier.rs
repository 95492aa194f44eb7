use crate::app::config::ClassificationConfig;
use crate::domain::PriorityId;
use std::collections::HashMap;

/// Maps event names to the priority they are delivered under.
#[derive(Debug, Clone)]
pub struct EventClassifier {
    events: HashMap<String, PriorityId>,
    default_priority: Option<PriorityId>,
}

impl EventClassifier {
    pub fn new(config: &ClassificationConfig) -> Self {
        Self {
            events: config
                .events
                .iter()
                .map(|(name, priority)| (name.clone(), priority.clone()))
                .collect(),
            default_priority: config.default_priority.clone(),
        }
    }

    /// `None` means the event is unclassifiable and must be dropped.
    pub fn classify(&self, name: &str) -> Option<PriorityId> {
        self.events
            .get(name)
            .or(self.default_priority.as_ref())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_explicit_mapping_wins_over_default() {
        let config = ClassificationConfig {
            events: BTreeMap::from([("purchase".to_string(), PriorityId::from("critical"))]),
            default_priority: Some(PriorityId::from("realTime")),
        };
        let classifier = EventClassifier::new(&config);
        assert_eq!(classifier.classify("purchase"), Some("critical".into()));
        assert_eq!(classifier.classify("scroll"), Some("realTime".into()));
    }

    #[test]
    fn test_unmapped_without_default_is_unclassified() {
        let config = ClassificationConfig {
            events: BTreeMap::from([("purchase".to_string(), PriorityId::from("critical"))]),
            default_priority: None,
        };
        assert_eq!(EventClassifier::new(&config).classify("scroll"), None);
    }
}
