//! Include/exclude policies for topics and consumer groups.
//!
//! Each policy is a pair of compiled patterns. Exclude is checked first and
//! always wins. An include pattern that is literally `.*` is treated as the
//! catch-all and skips matching entirely; any other include pattern is
//! restrictive, even if it happens to match everything.

use regex::Regex;

use crate::error::ExporterError;
use crate::types::ConsumerGroup;

/// Include pattern meaning "no include filtering".
pub const MATCH_ALL: &str = ".*";
/// Exclude pattern meaning "no exclude filtering".
pub const MATCH_NONE: &str = "^$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Include,
    Exclude,
}

impl Decision {
    pub fn is_include(self) -> bool {
        self == Decision::Include
    }
}

#[derive(Debug, Clone)]
pub struct FilterPolicy {
    include: Regex,
    exclude: Regex,
}

impl FilterPolicy {
    pub fn new(include: &str, exclude: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            include: Regex::new(include)?,
            exclude: Regex::new(exclude)?,
        })
    }

    pub fn allow_all() -> Self {
        Self {
            include: Regex::new(MATCH_ALL).expect("catch-all pattern is valid"),
            exclude: Regex::new(MATCH_NONE).expect("match-nothing pattern is valid"),
        }
    }

    pub fn include(&self) -> &Regex {
        &self.include
    }

    pub fn exclude(&self) -> &Regex {
        &self.exclude
    }

    /// Checked against the pattern's literal source, not its behaviour.
    pub fn include_is_catch_all(&self) -> bool {
        self.include.as_str() == MATCH_ALL
    }

    pub fn decide(&self, name: &str) -> Decision {
        if self.exclude.is_match(name) {
            return Decision::Exclude;
        }
        if self.include_is_catch_all() || self.include.is_match(name) {
            Decision::Include
        } else {
            Decision::Exclude
        }
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.decide(name).is_include()
    }

    /// Decides for an entity that consumes a set of topics.
    ///
    /// Any topic matching exclude rejects the whole set. A restrictive
    /// include needs at least one matching topic, so an empty set is
    /// rejected unless include is the catch-all.
    pub fn decide_topics<'a, I>(&self, topics: I) -> Decision
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut has_matching_topic = false;
        for topic in topics {
            if self.exclude.is_match(topic) {
                return Decision::Exclude;
            }
            if !has_matching_topic && self.include.is_match(topic) {
                has_matching_topic = true;
            }
        }

        if !self.include_is_catch_all() && !has_matching_topic {
            return Decision::Exclude;
        }
        Decision::Include
    }
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

/// The three policies applied during reconciliation.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    pub topic: FilterPolicy,
    pub group: FilterPolicy,
    pub group_topic: FilterPolicy,
}

/// Raw include/exclude pattern strings, compiled by [`FilterSet::compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPatterns {
    pub topic_filter: String,
    pub topic_exclude: String,
    pub group_filter: String,
    pub group_exclude: String,
    pub group_topic_filter: String,
    pub group_topic_exclude: String,
}

impl Default for FilterPatterns {
    fn default() -> Self {
        Self {
            topic_filter: MATCH_ALL.to_string(),
            topic_exclude: MATCH_NONE.to_string(),
            group_filter: MATCH_ALL.to_string(),
            group_exclude: MATCH_NONE.to_string(),
            group_topic_filter: MATCH_ALL.to_string(),
            group_topic_exclude: MATCH_NONE.to_string(),
        }
    }
}

fn compile(option: &'static str, pattern: &str) -> Result<Regex, ExporterError> {
    Regex::new(pattern).map_err(|source| ExporterError::InvalidPattern { option, source })
}

impl FilterSet {
    pub fn compile(patterns: &FilterPatterns) -> Result<Self, ExporterError> {
        Ok(Self {
            topic: FilterPolicy {
                include: compile("topic_filter", &patterns.topic_filter)?,
                exclude: compile("topic_exclude", &patterns.topic_exclude)?,
            },
            group: FilterPolicy {
                include: compile("group_filter", &patterns.group_filter)?,
                exclude: compile("group_exclude", &patterns.group_exclude)?,
            },
            group_topic: FilterPolicy {
                include: compile("group_topic_filter", &patterns.group_topic_filter)?,
                exclude: compile("group_topic_exclude", &patterns.group_topic_exclude)?,
            },
        })
    }

    /// Group id check, then the consumed-topic check. Both must pass.
    pub fn decide_group(&self, group: &ConsumerGroup) -> Decision {
        if !self.group.accepts(&group.id) {
            return Decision::Exclude;
        }
        self.group_topic.decide_topics(group.consumed_topics())
    }

    pub fn accepts_topic(&self, topic: &str) -> bool {
        self.topic.accepts(topic)
    }
}
