//! Per-plan activity log.
//!
//! Append-only audit trail of what the orchestrator did for a plan. Every
//! append is persisted right away and broadcast as
//! [`OrchestratorEvent::ActivityAdded`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::core::plan::PlanId;
use crate::event::{EventBus, OrchestratorEvent};
use crate::persist::{load_json, save_json, KvStore};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityKind::Info => write!(f, "info"),
            ActivityKind::Success => write!(f, "success"),
            ActivityKind::Warning => write!(f, "warning"),
            ActivityKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub plan_id: PlanId,
    pub kind: ActivityKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

pub fn activities_key(plan_id: &PlanId) -> String {
    format!("activities:{}", plan_id)
}

pub struct ActivityLog {
    kv: Arc<dyn KvStore>,
    events: EventBus,
    cache: Mutex<HashMap<PlanId, Vec<Activity>>>,
}

impl ActivityLog {
    pub fn new(kv: Arc<dyn KvStore>, events: EventBus) -> Self {
        Self {
            kv,
            events,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<PlanId, Vec<Activity>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self, plan_id: &PlanId) -> Result<Vec<Activity>> {
        Ok(load_json(self.kv.as_ref(), &activities_key(plan_id))?.unwrap_or_default())
    }

    /// Append an activity, persist the plan's list and notify observers.
    pub fn add(
        &self,
        plan_id: PlanId,
        kind: ActivityKind,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Result<Activity> {
        let activity = Activity {
            id: Uuid::new_v4(),
            plan_id,
            kind,
            message: message.into(),
            details,
            created_at: Utc::now(),
        };

        {
            let mut cache = self.cache();
            if !cache.contains_key(&plan_id) {
                let existing = self.load(&plan_id)?;
                cache.insert(plan_id, existing);
            }
            let list = cache.entry(plan_id).or_default();
            list.push(activity.clone());
            save_json(self.kv.as_ref(), &activities_key(&plan_id), &*list)?;
        }

        self.events.emit(OrchestratorEvent::ActivityAdded {
            plan_id,
            activity: activity.clone(),
        });
        Ok(activity)
    }

    pub fn list(&self, plan_id: &PlanId) -> Result<Vec<Activity>> {
        if let Some(list) = self.cache().get(plan_id) {
            return Ok(list.clone());
        }
        let loaded = self.load(plan_id)?;
        self.cache().insert(*plan_id, loaded.clone());
        Ok(loaded)
    }

    /// Drop a plan's activities from memory and storage.
    pub fn clear(&self, plan_id: &PlanId) -> Result<()> {
        self.cache().remove(plan_id);
        self.kv.delete(&activities_key(plan_id))
    }
}
