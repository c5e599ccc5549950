use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use super::error::ExecuteError;
use crate::command::model::{
    DashboardCommand, MaterialOrderInfo, ProjectInfo, TaskInfo, WorktimeInfo,
};
use crate::command::time::{normalize_time, parse_date, worked_hours};
use crate::db::models::{
    new_id, Category, Material, Priority, Receipt, Task, TimeEntry, Worksite,
};
use crate::db::{queries, Database};
use crate::resolve::resolver::{Resolver, WorksiteResolution};

/// Prefix on the content of tasks created from material orders.
pub const MATERIAL_MARKER: &str = "[MATERIAL] ";

/// Note attached to time entries captured by voice.
pub const VOICE_NOTE: &str = "Erfasst per Sprachbefehl";

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Project { worksite: Worksite, reused: bool },
    /// An existing worksite matched a create command that did not declare
    /// reuse. Nothing was written.
    Conflict(Worksite),
    Task(Task),
    TimeEntry(TimeEntry),
    Material(Material),
    Receipt(Receipt),
}

impl Outcome {
    pub fn to_json(&self) -> Value {
        match self {
            Outcome::Project { worksite, reused } => {
                json!({ "success": true, "project": worksite, "reused": reused })
            }
            Outcome::Conflict(existing) => json!({
                "error": format!(
                    "Eine Baustelle an dieser Adresse existiert bereits: {}",
                    existing.address
                ),
                "existingProject": existing,
            }),
            Outcome::Task(task) => json!({ "success": true, "task": task }),
            Outcome::TimeEntry(entry) => json!({ "success": true, "timeEntry": entry }),
            Outcome::Material(material) => json!({ "success": true, "material": material }),
            Outcome::Receipt(receipt) => json!({ "success": true, "receipt": receipt }),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Outcome::Conflict(_))
    }
}

/// Routes a dashboard command to its handler. Each handler runs its writes
/// strictly in sequence; handlers share nothing with each other.
#[derive(Clone)]
pub struct Executor {
    store: Database,
    resolver: Resolver,
}

impl Executor {
    pub fn new(store: Database) -> Self {
        Self {
            resolver: Resolver::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    pub async fn execute(
        &self,
        user: &str,
        command: &DashboardCommand,
    ) -> Result<Outcome, ExecuteError> {
        match command {
            DashboardCommand::CreateProject { project_info } => {
                self.create_project(user, project_info).await
            }
            DashboardCommand::CreateTask { task_info } => self.create_task(user, task_info).await,
            DashboardCommand::AddWorktime { worktime_info } => {
                self.add_worktime(user, worktime_info).await
            }
            DashboardCommand::CreateMaterialOrder { task_info } => {
                self.create_material_order(user, task_info).await
            }
        }
    }

    async fn create_project(&self, user: &str, info: &ProjectInfo) -> Result<Outcome, ExecuteError> {
        require("projectInfo.address", &info.address)?;
        require("projectInfo.city", &info.city)?;

        match self.resolver.resolve_for_create(info, user).await? {
            WorksiteResolution::Existing(worksite) => Ok(Outcome::Project {
                worksite,
                reused: true,
            }),
            WorksiteResolution::Conflict(existing) => Ok(Outcome::Conflict(existing)),
            WorksiteResolution::Created { worksite, .. } => Ok(Outcome::Project {
                worksite,
                reused: false,
            }),
        }
    }

    async fn create_task(&self, user: &str, info: &TaskInfo) -> Result<Outcome, ExecuteError> {
        require("taskInfo.projectAddress", &info.project_address)?;
        require("taskInfo.description", &info.description)?;
        let category: Category = info
            .category
            .parse()
            .map_err(|err: anyhow::Error| ExecuteError::InvalidRequest(err.to_string()))?;

        let worksite = self.resolver.resolve_hint(&info.project_address).await?;
        let task = self
            .insert_task(user, &worksite.id, info.description.trim(), info.priority, category)
            .await?;
        Ok(Outcome::Task(task))
    }

    async fn create_material_order(
        &self,
        user: &str,
        info: &MaterialOrderInfo,
    ) -> Result<Outcome, ExecuteError> {
        require("taskInfo.projectAddress", &info.project_address)?;
        require("taskInfo.description", &info.description)?;

        let worksite = self.resolver.resolve_hint(&info.project_address).await?;
        let content = format!("{MATERIAL_MARKER}{}", info.description.trim());
        let task = self
            .insert_task(
                user,
                &worksite.id,
                &content,
                Priority::Urgent,
                Category::UrgentMaterial,
            )
            .await?;
        Ok(Outcome::Task(task))
    }

    async fn add_worktime(&self, user: &str, info: &WorktimeInfo) -> Result<Outcome, ExecuteError> {
        require("worktimeInfo.projectAddress", &info.project_address)?;
        let slot = TimeSlot::checked(&info.date, &info.start_time, &info.end_time)?;

        let worksite = self.resolver.resolve_hint(&info.project_address).await?;
        let entry = self
            .insert_time_entry(
                user,
                &worksite.id,
                slot,
                info.break_minutes.unwrap_or(0),
                info.description.trim(),
                Some(VOICE_NOTE.to_string()),
            )
            .await?;
        Ok(Outcome::TimeEntry(entry))
    }

    pub(super) async fn insert_task(
        &self,
        user: &str,
        worksite_id: &str,
        content: &str,
        priority: Priority,
        category: Category,
    ) -> Result<Task, ExecuteError> {
        let task = Task {
            id: new_id(),
            worksite_id: worksite_id.to_string(),
            content: content.to_string(),
            priority,
            category,
            is_completed: false,
            created_by: user.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };
        let record = task.clone();
        self.store
            .execute(move |conn| queries::insert_task(conn, &record))
            .await
            .map_err(ExecuteError::write_failed)?;
        info!("created {} task {} on {}", task.category, task.id, worksite_id);
        Ok(task)
    }

    pub(super) async fn insert_time_entry(
        &self,
        user: &str,
        worksite_id: &str,
        slot: TimeSlot,
        break_minutes: u32,
        description: &str,
        notes: Option<String>,
    ) -> Result<TimeEntry, ExecuteError> {
        let hours = worked_hours(&slot.start, &slot.end, break_minutes).unwrap_or(0.0);
        let entry = TimeEntry {
            id: new_id(),
            worksite_id: worksite_id.to_string(),
            user_id: user.to_string(),
            date: slot.date,
            start_time: slot.start,
            end_time: slot.end,
            break_minutes,
            hours,
            description: description.to_string(),
            notes,
            created_at: Utc::now().timestamp_millis(),
        };
        let record = entry.clone();
        self.store
            .execute(move |conn| queries::insert_time_entry(conn, &record))
            .await
            .map_err(ExecuteError::write_failed)?;
        info!("logged {:.2}h on {} for {}", entry.hours, worksite_id, user);
        Ok(entry)
    }

    /// Worksite by id for the direct record writes.
    pub(super) async fn worksite_by_id(&self, id: &str) -> Result<Worksite, ExecuteError> {
        require("worksiteId", id)?;
        let key = id.to_string();
        self.store
            .execute(move |conn| queries::get_worksite(conn, &key))
            .await?
            .ok_or_else(|| ExecuteError::WorksiteNotFound(id.to_string()))
    }
}

/// Date and times that passed their shape checks.
pub(super) struct TimeSlot {
    pub date: String,
    pub start: String,
    pub end: String,
}

impl TimeSlot {
    pub fn checked(date: &str, start: &str, end: &str) -> Result<Self, ExecuteError> {
        let date = parse_date(date)
            .ok_or_else(|| ExecuteError::InvalidRequest(format!("invalid date '{date}'")))?;
        let start = normalize_time(start)
            .ok_or_else(|| ExecuteError::InvalidRequest(format!("invalid startTime '{start}'")))?;
        let end = normalize_time(end)
            .ok_or_else(|| ExecuteError::InvalidRequest(format!("invalid endTime '{end}'")))?;
        Ok(Self {
            date: date.format("%Y-%m-%d").to_string(),
            start,
            end,
        })
    }
}

pub(super) fn require(field: &str, value: &str) -> Result<(), ExecuteError> {
    if value.trim().is_empty() {
        Err(ExecuteError::InvalidRequest(format!("{field} is required")))
    } else {
        Ok(())
    }
}
