use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub city: String,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum WorksiteStatus {
    #[default]
    Active,
    InProgress,
    Completed,
}

impl WorksiteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorksiteStatus::Active => "Active",
            WorksiteStatus::InProgress => "InProgress",
            WorksiteStatus::Completed => "Completed",
        }
    }
}

impl FromStr for WorksiteStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "Active" => Ok(WorksiteStatus::Active),
            "InProgress" => Ok(WorksiteStatus::InProgress),
            "Completed" => Ok(WorksiteStatus::Completed),
            other => Err(anyhow!("unknown worksite status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Worksite {
    pub id: String,
    pub name: String,
    pub address: String,
    pub description: Option<String>,
    pub customer_id: Option<String>,
    pub status: WorksiteStatus,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(anyhow!("unknown priority '{other}'")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Work,
    Material,
    UrgentMaterial,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Work => "work",
            Category::Material => "material",
            Category::UrgentMaterial => "urgent_material",
        }
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "work" => Ok(Category::Work),
            "material" => Ok(Category::Material),
            "urgent_material" => Ok(Category::UrgentMaterial),
            other => Err(anyhow!("unknown category '{other}'")),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub worksite_id: String,
    pub content: String,
    pub priority: Priority,
    pub category: Category,
    pub is_completed: bool,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub id: String,
    pub worksite_id: String,
    pub user_id: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub break_minutes: u32,
    pub hours: f64,
    pub description: String,
    pub notes: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Material {
    pub id: String,
    pub worksite_id: String,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub id: String,
    pub worksite_id: Option<String>,
    pub vendor: String,
    pub amount: f64,
    pub date: String,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: i64,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_parsing_is_case_insensitive() {
        assert_eq!("URGENT".parse::<Priority>().unwrap(), Priority::Urgent);
        assert_eq!(" urgent_material ".parse::<Category>().unwrap(), Category::UrgentMaterial);
        assert!("asap".parse::<Priority>().is_err());
        assert!("Done".parse::<WorksiteStatus>().is_err());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_value(Category::UrgentMaterial).unwrap(),
            serde_json::json!("urgent_material")
        );
        assert_eq!(
            serde_json::to_value(WorksiteStatus::InProgress).unwrap(),
            serde_json::json!("InProgress")
        );
    }
}
