//! # Fetch-and-Lock Shapes
//!
//! Request and response bodies of the long-poll protocol. Field names are camelCase;
//! the Camunda names `maxTasks`, `asyncResponseTimeout`, `lockDuration` and `variables`
//! are accepted as aliases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::FetchAndLockError;
use crate::database::{ExternalTaskQuery, TopicFilter};
use crate::models::WorkItem;

/// Shortest accepted long-poll window
pub const MIN_RESPONSE_TIMEOUT_MILLIS: u64 = 60_000;

/// Longest accepted long-poll window
pub const MAX_RESPONSE_TIMEOUT_MILLIS: u64 = 1_800_000;

/// Longest lease a worker may request for one task (30 days)
pub const MAX_LOCK_DURATION_MILLIS: u64 = 30 * 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTopic {
    pub topic_name: String,
    #[serde(alias = "lockDuration")]
    pub lock_duration_millis: u64,
    /// Variables to return; `None` returns all of them
    #[serde(default, alias = "variables")]
    pub variable_filter: Option<Vec<String>>,
    /// When false, object and array values are returned as serialized JSON strings
    #[serde(default)]
    pub deserialize_values: bool,
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub process_definition_key_in: Option<Vec<String>>,
    #[serde(default)]
    pub tenant_id_in: Option<Vec<String>>,
    #[serde(default)]
    pub without_tenant_id: bool,
}

impl FetchTopic {
    pub fn new(topic_name: impl Into<String>, lock_duration_millis: u64) -> Self {
        Self {
            topic_name: topic_name.into(),
            lock_duration_millis,
            ..Default::default()
        }
    }

    pub fn filter(&self) -> TopicFilter {
        TopicFilter {
            topic_name: self.topic_name.clone(),
            business_key: self.business_key.clone(),
            process_definition_key_in: self.process_definition_key_in.clone(),
            tenant_id_in: self.tenant_id_in.clone(),
            without_tenant_id: self.without_tenant_id,
        }
    }

    /// Variables of `item` as this topic asked for them
    pub fn project_variables(&self, item: &WorkItem) -> Map<String, Value> {
        item.variables
            .iter()
            .filter(|(name, _)| {
                self.variable_filter
                    .as_ref()
                    .map_or(true, |names| names.contains(name))
            })
            .map(|(name, value)| {
                let value = match value {
                    Value::Object(_) | Value::Array(_) if !self.deserialize_values => {
                        Value::String(value.to_string())
                    }
                    other => other.clone(),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchAndLockRequest {
    #[serde(alias = "maxTasks")]
    pub max_items: usize,
    pub worker_id: String,
    #[serde(default)]
    pub use_priority: bool,
    pub topics: Vec<FetchTopic>,
    /// Long-poll window; `None` polls once
    #[serde(default, alias = "asyncResponseTimeout")]
    pub response_timeout_millis: Option<u64>,
}

impl FetchAndLockRequest {
    pub fn new(worker_id: impl Into<String>, max_items: usize) -> Self {
        Self {
            worker_id: worker_id.into(),
            max_items,
            ..Default::default()
        }
    }

    pub fn with_topic(mut self, topic: FetchTopic) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn with_response_timeout(mut self, millis: u64) -> Self {
        self.response_timeout_millis = Some(millis);
        self
    }

    pub fn with_priority(mut self) -> Self {
        self.use_priority = true;
        self
    }

    pub fn validate(&self) -> Result<(), FetchAndLockError> {
        if let Some(timeout) = self.response_timeout_millis {
            if !(MIN_RESPONSE_TIMEOUT_MILLIS..=MAX_RESPONSE_TIMEOUT_MILLIS).contains(&timeout) {
                return Err(FetchAndLockError::InvalidRequest(format!(
                    "responseTimeoutMillis {timeout} outside [{MIN_RESPONSE_TIMEOUT_MILLIS}, {MAX_RESPONSE_TIMEOUT_MILLIS}]"
                )));
            }
        }
        if self.worker_id.trim().is_empty() {
            return Err(FetchAndLockError::InvalidRequest(
                "workerId must not be empty".to_string(),
            ));
        }
        for topic in &self.topics {
            if topic.topic_name.is_empty() {
                return Err(FetchAndLockError::InvalidRequest(
                    "topicName must not be empty".to_string(),
                ));
            }
            if !(1..=MAX_LOCK_DURATION_MILLIS).contains(&topic.lock_duration_millis) {
                return Err(FetchAndLockError::InvalidRequest(format!(
                    "lockDuration {} of topic '{}' outside [1, {MAX_LOCK_DURATION_MILLIS}]",
                    topic.lock_duration_millis, topic.topic_name
                )));
            }
        }
        Ok(())
    }

    /// First requested topic matching `item`
    pub fn topic_for(&self, item: &WorkItem) -> Option<&FetchTopic> {
        self.topics.iter().find(|topic| topic.filter().matches(item))
    }

    pub fn query(
        &self,
        authorized_tenant_ids: Option<Vec<String>>,
        overfetch_factor: usize,
    ) -> ExternalTaskQuery {
        ExternalTaskQuery {
            worker_id: self.worker_id.clone(),
            topics: self.topics.iter().map(FetchTopic::filter).collect(),
            use_priority: self.use_priority,
            limit: self.max_items.saturating_mul(overfetch_factor.max(1)),
            authorized_tenant_ids,
        }
    }
}

/// A leased external task as delivered to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedExternalTask {
    pub id: String,
    pub topic_name: String,
    pub worker_id: String,
    pub lock_expiration_time: DateTime<Utc>,
    pub retries: u32,
    pub error_message: Option<String>,
    pub priority: i64,
    pub business_key: Option<String>,
    pub process_instance_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
}

impl LockedExternalTask {
    /// Build from a leased item and the topic it was fetched through
    pub fn from_leased(item: &WorkItem, topic: &FetchTopic, worker_id: &str) -> Option<Self> {
        let lock_expiration_time = item.lock_expiration_time?;
        let variables = match &topic.variable_filter {
            Some(names) if names.is_empty() => None,
            _ => Some(topic.project_variables(item)),
        };
        Some(Self {
            id: item.id.clone(),
            topic_name: topic.topic_name.clone(),
            worker_id: worker_id.to_string(),
            lock_expiration_time,
            retries: item.retries_remaining,
            error_message: item.last_failure_reason.clone(),
            priority: item.priority,
            business_key: item.business_key.clone(),
            process_instance_id: item.process_instance_id.clone(),
            process_definition_key: item.process_definition_key.clone(),
            tenant_id: item.tenant_id.clone(),
            variables,
        })
    }
}
