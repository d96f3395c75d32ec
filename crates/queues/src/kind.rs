//! Queue domains and their default tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use taskforge_core::{DomainError, QueueName};
use taskforge_infra::config::{EngineConfig, QueueOptions};

/// AI runs call out to a model and can take a while.
const AI_LEASE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Calendar,
    Slack,
    Github,
    Notion,
    AiJobs,
    Summaries,
}

impl QueueKind {
    pub const ALL: [QueueKind; 6] = [
        QueueKind::Calendar,
        QueueKind::Slack,
        QueueKind::Github,
        QueueKind::Notion,
        QueueKind::AiJobs,
        QueueKind::Summaries,
    ];

    /// Queue name (and table prefix).
    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Calendar => "calendar_sync",
            QueueKind::Slack => "slack_sync",
            QueueKind::Github => "github_sync",
            QueueKind::Notion => "notion_sync",
            QueueKind::AiJobs => "ai_jobs",
            QueueKind::Summaries => "summaries",
        }
    }

    pub fn queue_name(self) -> Result<QueueName, DomainError> {
        QueueName::new(self.as_str())
    }

    pub fn from_queue_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Engine-wide settings from `config`, adjusted for this domain.
    ///
    /// Calendar sync fails jobs in place; every other queue dead-letters
    /// exhausted jobs. Slack, AI jobs and summaries run several jobs per tick.
    pub fn default_options(self, config: &EngineConfig) -> Result<QueueOptions, DomainError> {
        let options = QueueOptions::from_config(self.queue_name()?, config);

        Ok(match self {
            QueueKind::Calendar => options,
            QueueKind::Github | QueueKind::Notion => options.with_dead_letter(true),
            QueueKind::Slack => options.with_parallelism(4).with_dead_letter(true),
            QueueKind::AiJobs => options
                .with_parallelism(4)
                .with_dead_letter(true)
                .with_unique_dedup(true)
                .with_lease_timeout(config.lease_timeout.max(AI_LEASE_TIMEOUT)),
            QueueKind::Summaries => options.with_parallelism(2).with_dead_letter(true),
        })
    }
}

impl core::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_valid_distinct_queue_name() {
        let mut names: Vec<_> = QueueKind::ALL
            .iter()
            .map(|k| k.queue_name().unwrap())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), QueueKind::ALL.len());

        for kind in QueueKind::ALL {
            assert_eq!(QueueKind::from_queue_name(kind.as_str()), Some(kind));
        }
        assert_eq!(QueueKind::from_queue_name("jobs"), None);
    }

    #[test]
    fn defaults_follow_the_domain() {
        let config = EngineConfig::default();

        let calendar = QueueKind::Calendar.default_options(&config).unwrap();
        assert!(!calendar.dead_letter);
        assert_eq!(calendar.parallelism, 1);
        assert_eq!(calendar.poll_interval, config.poll_interval);

        let slack = QueueKind::Slack.default_options(&config).unwrap();
        assert!(slack.dead_letter);
        assert!(slack.parallelism > 1);

        let ai = QueueKind::AiJobs.default_options(&config).unwrap();
        assert!(ai.unique_dedup);
        assert!(ai.lease_timeout >= AI_LEASE_TIMEOUT);
        assert_eq!(ai.default_max_retries, config.max_retries);
    }
}
