use serde::{Deserialize, Serialize};

use crate::db::models::{Category, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    CreateWorksite,
    CreateTask,
    LogWorktime,
    OrderMaterial,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::CreateWorksite => "create_worksite",
            CommandKind::CreateTask => "create_task",
            CommandKind::LogWorktime => "log_worktime",
            CommandKind::OrderMaterial => "order_material",
        }
    }

    /// Accepts both the internal names and the endpoint's `type` values.
    pub fn from_discriminant(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "create_worksite" | "create_project" => Some(CommandKind::CreateWorksite),
            "create_task" => Some(CommandKind::CreateTask),
            "log_worktime" | "add_worktime" => Some(CommandKind::LogWorktime),
            "order_material" | "create_material_order" => Some(CommandKind::OrderMaterial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorksiteDraft {
    pub customer_name: String,
    pub street: String,
    pub city: String,
    pub zip_code: Option<String>,
    pub description: Option<String>,
    pub is_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub worksite_address_hint: String,
    pub description: String,
    pub priority: Priority,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktimeDraft {
    pub worksite_address_hint: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub break_minutes: Option<u32>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialOrderDraft {
    pub worksite_address_hint: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandBody {
    CreateWorksite(WorksiteDraft),
    CreateTask(TaskDraft),
    LogWorktime(WorktimeDraft),
    OrderMaterial(MaterialOrderDraft),
}

/// A command produced by the validator. Always structurally complete; how
/// much it can be trusted is carried by `confidence` and `warnings`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedCommand {
    #[serde(flatten)]
    pub body: CommandBody,
    pub confidence: f64,
    pub warnings: Vec<String>,
}

impl ParsedCommand {
    pub fn kind(&self) -> CommandKind {
        match self.body {
            CommandBody::CreateWorksite(_) => CommandKind::CreateWorksite,
            CommandBody::CreateTask(_) => CommandKind::CreateTask,
            CommandBody::LogWorktime(_) => CommandKind::LogWorktime,
            CommandBody::OrderMaterial(_) => CommandKind::OrderMaterial,
        }
    }

    /// The request body accepted by `POST /execute-dashboard-command`.
    pub fn to_request(&self) -> DashboardCommand {
        match &self.body {
            CommandBody::CreateWorksite(d) => DashboardCommand::CreateProject {
                project_info: ProjectInfo {
                    name: d.customer_name.clone(),
                    address: d.street.clone(),
                    city: d.city.clone(),
                    zip_code: d.zip_code.clone(),
                    description: d.description.clone(),
                    is_existing: d.is_existing,
                },
            },
            CommandBody::CreateTask(d) => DashboardCommand::CreateTask {
                task_info: TaskInfo {
                    project_address: d.worksite_address_hint.clone(),
                    description: d.description.clone(),
                    priority: d.priority,
                    category: d.category.as_str().to_string(),
                },
            },
            CommandBody::LogWorktime(d) => DashboardCommand::AddWorktime {
                worktime_info: WorktimeInfo {
                    project_address: d.worksite_address_hint.clone(),
                    date: d.date.clone(),
                    start_time: d.start_time.clone(),
                    end_time: d.end_time.clone(),
                    break_minutes: d.break_minutes,
                    description: d.description.clone(),
                },
            },
            CommandBody::OrderMaterial(d) => DashboardCommand::CreateMaterialOrder {
                task_info: MaterialOrderInfo {
                    project_address: d.worksite_address_hint.clone(),
                    description: d.description.clone(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DashboardCommand {
    #[serde(rename = "create_project")]
    CreateProject {
        #[serde(rename = "projectInfo")]
        project_info: ProjectInfo,
    },
    #[serde(rename = "create_task")]
    CreateTask {
        #[serde(rename = "taskInfo")]
        task_info: TaskInfo,
    },
    #[serde(rename = "add_worktime")]
    AddWorktime {
        #[serde(rename = "worktimeInfo")]
        worktime_info: WorktimeInfo,
    },
    #[serde(rename = "create_material_order")]
    CreateMaterialOrder {
        #[serde(rename = "taskInfo")]
        task_info: MaterialOrderInfo,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    pub address: String,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub project_address: String,
    pub description: String,
    pub priority: Priority,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktimeInfo {
    pub project_address: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_minutes: Option<u32>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialOrderInfo {
    pub project_address: String,
    pub description: String,
}
