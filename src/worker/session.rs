use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{PoolError, Result};

pub(crate) const QUERY_STRING: &str = "query_string";
pub(crate) const REMOTE_ADDR: &str = "remote_addr";
pub(crate) const TASKS_VIEWED: &str = "tasks_viewed";
pub(crate) const TASKS_FINISHED: &str = "tasks_finished";
pub(crate) const TASKS_CORRECT: &str = "tasks_correct";
pub(crate) const START_TIME: &str = "start_time";
pub(crate) const END_TIME: &str = "end_time";

const RESERVED: [&str; 7] = [
    QUERY_STRING,
    REMOTE_ADDR,
    TASKS_VIEWED,
    TASKS_FINISHED,
    TASKS_CORRECT,
    START_TIME,
    END_TIME,
];

/// What the request layer knows about a worker on first contact.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub remote_addr: Option<String>,
    /// Raw query string, without the leading `?`.
    pub query_string: String,
}

impl SessionContext {
    pub fn new(remote_addr: Option<String>, query_string: impl Into<String>) -> Self {
        Self {
            remote_addr,
            query_string: query_string.into(),
        }
    }

    /// Decoded query parameters. Later duplicates win.
    pub fn params(&self) -> BTreeMap<String, String> {
        url::form_urlencoded::parse(self.query_string.as_bytes())
            .into_owned()
            .collect()
    }
}

/// Progress record of one worker session.
///
/// Stored as a flat hash: the fixed fields below plus every query parameter
/// the worker arrived with (e.g. `assignmentId`, `turkSubmitTo`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSession {
    pub id: String,
    pub query_string: String,
    pub remote_addr: Option<String>,
    pub tasks_viewed: u64,
    pub tasks_finished: u64,
    pub tasks_correct: Option<u64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub params: BTreeMap<String, String>,
}

impl UserSession {
    pub fn new(id: String, context: &SessionContext, track_correct: bool) -> Self {
        Self {
            id,
            query_string: context.query_string.clone(),
            remote_addr: context.remote_addr.clone(),
            tasks_viewed: 0,
            tasks_finished: 0,
            tasks_correct: track_correct.then_some(0),
            start_time: Utc::now(),
            end_time: None,
            params: context.params(),
        }
    }

    /// Hash fields persisting this record. Reserved names shadow parameters.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields: Vec<(String, String)> = self
            .params
            .iter()
            .filter(|(name, _)| !RESERVED.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        fields.push((QUERY_STRING.to_string(), self.query_string.clone()));
        if let Some(addr) = &self.remote_addr {
            fields.push((REMOTE_ADDR.to_string(), addr.clone()));
        }
        fields.push((TASKS_VIEWED.to_string(), self.tasks_viewed.to_string()));
        fields.push((TASKS_FINISHED.to_string(), self.tasks_finished.to_string()));
        if let Some(correct) = self.tasks_correct {
            fields.push((TASKS_CORRECT.to_string(), correct.to_string()));
        }
        fields.push((START_TIME.to_string(), self.start_time.to_rfc3339()));
        if let Some(end) = self.end_time {
            fields.push((END_TIME.to_string(), end.to_rfc3339()));
        }
        fields
    }

    /// Rebuilds a record from its hash fields.
    pub fn from_fields(id: &str, mut fields: HashMap<String, String>) -> Result<Self> {
        let counter = |fields: &mut HashMap<String, String>, name: &str| -> Result<Option<u64>> {
            fields
                .remove(name)
                .map(|raw| {
                    raw.parse::<u64>().map_err(|_| {
                        PoolError::Integrity(format!("session {id}: {name} is not a count: {raw:?}"))
                    })
                })
                .transpose()
        };
        let timestamp = |fields: &mut HashMap<String, String>, name: &str| -> Result<Option<DateTime<Utc>>> {
            fields
                .remove(name)
                .map(|raw| {
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| {
                            PoolError::Integrity(format!("session {id}: bad {name} {raw:?}: {e}"))
                        })
                })
                .transpose()
        };

        let tasks_viewed = counter(&mut fields, TASKS_VIEWED)?.unwrap_or(0);
        let tasks_finished = counter(&mut fields, TASKS_FINISHED)?.unwrap_or(0);
        let tasks_correct = counter(&mut fields, TASKS_CORRECT)?;
        let start_time = timestamp(&mut fields, START_TIME)?
            .ok_or_else(|| PoolError::Integrity(format!("session {id} has no start_time")))?;
        let end_time = timestamp(&mut fields, END_TIME)?;

        Ok(Self {
            id: id.to_string(),
            query_string: fields.remove(QUERY_STRING).unwrap_or_default(),
            remote_addr: fields.remove(REMOTE_ADDR),
            tasks_viewed,
            tasks_finished,
            tasks_correct,
            start_time,
            end_time,
            params: fields.into_iter().collect(),
        })
    }
}

/// Summary handed back to a finished worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub tasks_finished: u64,
    /// Never below `tasks_finished`: a result implies a view.
    pub tasks_viewed: u64,
    pub pct_finished: f64,
    pub pct_correct: Option<f64>,
    /// Seconds between session start and the finishing call.
    pub time_taken: f64,
    pub submit_url: String,
}

/// Outcome of a completion check.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Finished(Verdict),
    InProgress,
}

impl Completion {
    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            Completion::Finished(verdict) => Some(verdict),
            Completion::InProgress => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Completion::Finished(_))
    }
}
