//! Durable record of a work item that exhausted its retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::work_item::{WorkItem, WorkItemKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IncidentType {
    FailedJob,
    FailedExternalTask,
}

impl IncidentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::FailedJob => "failedJob",
            IncidentType::FailedExternalTask => "failedExternalTask",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "failedJob" => Some(IncidentType::FailedJob),
            "failedExternalTask" => Some(IncidentType::FailedExternalTask),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub incident_type: IncidentType,
    pub work_item_id: String,
    pub process_instance_id: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    pub fn for_work_item(item: &WorkItem, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        let incident_type = match item.kind {
            WorkItemKind::Job => IncidentType::FailedJob,
            WorkItemKind::ExternalTask => IncidentType::FailedExternalTask,
        };
        Self {
            id: Uuid::new_v4(),
            incident_type,
            work_item_id: item.id.clone(),
            process_instance_id: item.process_instance_id.clone(),
            message: message.into(),
            created_at: now,
        }
    }
}
