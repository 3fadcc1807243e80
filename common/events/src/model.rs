use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::wire::{format_wire_time, metadata_as_string, string_or_empty};

pub const DEFAULT_PARTITION_KEY: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory { Agent, Context, Prompt, Access, Policy }

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Agent => "agent",
            EventCategory::Context => "context",
            EventCategory::Prompt => "prompt",
            EventCategory::Access => "access",
            EventCategory::Policy => "policy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "agent" => Some(EventCategory::Agent),
            "context" => Some(EventCategory::Context),
            "prompt" => Some(EventCategory::Prompt),
            "access" => Some(EventCategory::Access),
            "policy" => Some(EventCategory::Policy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AgentRegistered,
    AgentUpdated,
    AgentDeactivated,
    ContextCreated,
    ContextUpdated,
    ContextDeleted,
    PromptCreated,
    PromptVersionPublished,
    InjectSuccess,
    InjectDenied,
    AccessGranted,
    AccessDenied,
    AccessRevoked,
    PolicyViolation,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentRegistered => "AGENT_REGISTERED",
            EventType::AgentUpdated => "AGENT_UPDATED",
            EventType::AgentDeactivated => "AGENT_DEACTIVATED",
            EventType::ContextCreated => "CONTEXT_CREATED",
            EventType::ContextUpdated => "CONTEXT_UPDATED",
            EventType::ContextDeleted => "CONTEXT_DELETED",
            EventType::PromptCreated => "PROMPT_CREATED",
            EventType::PromptVersionPublished => "PROMPT_VERSION_PUBLISHED",
            EventType::InjectSuccess => "INJECT_SUCCESS",
            EventType::InjectDenied => "INJECT_DENIED",
            EventType::AccessGranted => "ACCESS_GRANTED",
            EventType::AccessDenied => "ACCESS_DENIED",
            EventType::AccessRevoked => "ACCESS_REVOKED",
            EventType::PolicyViolation => "POLICY_VIOLATION",
        }
    }

    /// Category an event of this type is routed under when the caller does not pick one.
    pub fn default_category(&self) -> EventCategory {
        match self {
            EventType::AgentRegistered | EventType::AgentUpdated | EventType::AgentDeactivated => EventCategory::Agent,
            EventType::ContextCreated | EventType::ContextUpdated | EventType::ContextDeleted => EventCategory::Context,
            EventType::PromptCreated | EventType::PromptVersionPublished => EventCategory::Prompt,
            EventType::InjectSuccess
            | EventType::InjectDenied
            | EventType::AccessGranted
            | EventType::AccessDenied
            | EventType::AccessRevoked => EventCategory::Access,
            EventType::PolicyViolation => EventCategory::Policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity { #[default] Info, Warning, Critical }

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// One governance occurrence as it travels over the bus and lands in the analytics store.
///
/// Identifier fields are plain strings and empty when not applicable, so rows keep a fixed
/// column set. `metadata` is an opaque JSON document carried as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub event_category: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub agent_id: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub org_id: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub context_id: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub prompt_id: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub version_id: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub data_classification: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub governance_hash: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub hash_type: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub severity: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub trace_id: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub source_ip: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub request_method: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub request_path: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub event_time: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub ingested_at: String,
    #[serde(default = "empty_metadata", deserialize_with = "metadata_as_string")]
    pub metadata: String,
}

pub(crate) fn empty_metadata() -> String { "{}".to_string() }

impl EventEnvelope {
    /// org_id, then agent_id, then a fixed key, so an organization's events share a partition.
    pub fn partition_key(&self) -> &str {
        if !self.org_id.is_empty() {
            &self.org_id
        } else if !self.agent_id.is_empty() {
            &self.agent_id
        } else {
            DEFAULT_PARTITION_KEY
        }
    }
}

/// Builder for the upstream `publish_event(event_type, event_category, ...)` call.
#[derive(Debug, Clone)]
pub struct GovernanceEvent {
    pub event_type: EventType,
    pub event_category: EventCategory,
    pub agent_id: Option<String>,
    pub org_id: Option<String>,
    pub context_id: Option<String>,
    pub prompt_id: Option<String>,
    pub version_id: Option<String>,
    pub data_classification: Option<String>,
    pub governance_hash: Option<String>,
    pub hash_type: Option<String>,
    pub severity: Severity,
    pub trace_id: Option<String>,
    pub source_ip: Option<String>,
    pub request_method: Option<String>,
    pub request_path: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl GovernanceEvent {
    pub fn new(event_type: EventType, event_category: EventCategory) -> Self {
        Self {
            event_type,
            event_category,
            agent_id: None,
            org_id: None,
            context_id: None,
            prompt_id: None,
            version_id: None,
            data_classification: None,
            governance_hash: None,
            hash_type: None,
            severity: Severity::Info,
            trace_id: None,
            source_ip: None,
            request_method: None,
            request_path: None,
            event_time: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn of(event_type: EventType) -> Self { Self::new(event_type, event_type.default_category()) }

    pub fn agent(mut self, id: impl Into<String>) -> Self { self.agent_id = Some(id.into()); self }
    pub fn org(mut self, id: impl Into<String>) -> Self { self.org_id = Some(id.into()); self }
    pub fn context(mut self, id: impl Into<String>) -> Self { self.context_id = Some(id.into()); self }
    pub fn prompt(mut self, id: impl Into<String>) -> Self { self.prompt_id = Some(id.into()); self }
    pub fn version(mut self, id: impl Into<String>) -> Self { self.version_id = Some(id.into()); self }
    pub fn classification(mut self, value: impl Into<String>) -> Self { self.data_classification = Some(value.into()); self }
    pub fn severity(mut self, severity: Severity) -> Self { self.severity = severity; self }
    pub fn trace(mut self, id: impl Into<String>) -> Self { self.trace_id = Some(id.into()); self }
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self { self.event_time = Some(at); self }
    pub fn metadata(mut self, value: serde_json::Value) -> Self { self.metadata = value; self }

    pub fn governance_hash(mut self, hash: impl Into<String>, hash_type: impl Into<String>) -> Self {
        self.governance_hash = Some(hash.into());
        self.hash_type = Some(hash_type.into());
        self
    }

    pub fn request(mut self, method: impl Into<String>, path: impl Into<String>, source_ip: Option<String>) -> Self {
        self.request_method = Some(method.into());
        self.request_path = Some(path.into());
        self.source_ip = source_ip;
        self
    }

    /// Stamps identity and time; `ingested_at` stays empty until the consumer observes the event.
    pub fn into_envelope(self, event_id: Uuid, now: DateTime<Utc>) -> EventEnvelope {
        let metadata = match self.metadata {
            serde_json::Value::Null => empty_metadata(),
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        EventEnvelope {
            event_id: event_id.to_string(),
            event_type: self.event_type.as_str().to_string(),
            event_category: self.event_category.as_str().to_string(),
            agent_id: self.agent_id.unwrap_or_default(),
            org_id: self.org_id.unwrap_or_default(),
            context_id: self.context_id.unwrap_or_default(),
            prompt_id: self.prompt_id.unwrap_or_default(),
            version_id: self.version_id.unwrap_or_default(),
            data_classification: self.data_classification.unwrap_or_default(),
            governance_hash: self.governance_hash.unwrap_or_default(),
            hash_type: self.hash_type.unwrap_or_default(),
            severity: self.severity.as_str().to_string(),
            trace_id: self.trace_id.unwrap_or_default(),
            source_ip: self.source_ip.unwrap_or_default(),
            request_method: self.request_method.unwrap_or_default(),
            request_path: self.request_path.unwrap_or_default(),
            event_time: format_wire_time(self.event_time.unwrap_or(now)),
            ingested_at: String::new(),
            metadata,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher not configured")]
    NotConfigured,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("kafka error: {0}")]
    Kafka(String),
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

pub type PublishResult<T> = Result<T, PublishError>;
