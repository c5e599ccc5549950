//! Single-row writes behind the replay endpoints. Payloads reference the
//! worksite by id, as they were captured against a known worksite.

use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use super::error::ExecuteError;
use super::executor::{require, Executor, Outcome, TimeSlot};
use crate::command::time::parse_date;
use crate::db::models::{new_id, Category, Material, Priority, Receipt};
use crate::db::queries;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTimeEntry {
    pub worksite_id: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub break_minutes: Option<u32>,
    pub description: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub worksite_id: String,
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub category: Category,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMaterial {
    pub worksite_id: String,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReceipt {
    #[serde(default)]
    pub worksite_id: Option<String>,
    pub vendor: String,
    pub amount: f64,
    pub date: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Executor {
    pub async fn record_time_entry(
        &self,
        user: &str,
        entry: NewTimeEntry,
    ) -> Result<Outcome, ExecuteError> {
        let slot = TimeSlot::checked(&entry.date, &entry.start_time, &entry.end_time)?;
        let worksite = self.worksite_by_id(&entry.worksite_id).await?;
        let created = self
            .insert_time_entry(
                user,
                &worksite.id,
                slot,
                entry.break_minutes.unwrap_or(0),
                entry.description.trim(),
                entry.notes,
            )
            .await?;
        Ok(Outcome::TimeEntry(created))
    }

    pub async fn record_task(&self, user: &str, task: NewTask) -> Result<Outcome, ExecuteError> {
        require("content", &task.content)?;
        let worksite = self.worksite_by_id(&task.worksite_id).await?;
        let created = self
            .insert_task(user, &worksite.id, task.content.trim(), task.priority, task.category)
            .await?;
        Ok(Outcome::Task(created))
    }

    pub async fn record_material(
        &self,
        user: &str,
        material: NewMaterial,
    ) -> Result<Outcome, ExecuteError> {
        require("name", &material.name)?;
        require("unit", &material.unit)?;
        if !material.quantity.is_finite() || material.quantity <= 0.0 {
            return Err(ExecuteError::InvalidRequest(
                "quantity must be a positive number".to_string(),
            ));
        }
        let worksite = self.worksite_by_id(&material.worksite_id).await?;

        let record = Material {
            id: new_id(),
            worksite_id: worksite.id,
            name: material.name.trim().to_string(),
            quantity: material.quantity,
            unit: material.unit.trim().to_string(),
            notes: material.notes,
            created_by: user.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };
        let row = record.clone();
        self.store()
            .execute(move |conn| queries::insert_material(conn, &row))
            .await
            .map_err(ExecuteError::write_failed)?;
        info!("recorded material {} on {}", record.id, record.worksite_id);
        Ok(Outcome::Material(record))
    }

    pub async fn record_receipt(
        &self,
        user: &str,
        receipt: NewReceipt,
    ) -> Result<Outcome, ExecuteError> {
        require("vendor", &receipt.vendor)?;
        let date = parse_date(&receipt.date).ok_or_else(|| {
            ExecuteError::InvalidRequest(format!("invalid date '{}'", receipt.date))
        })?;
        let worksite_id = match receipt.worksite_id.as_deref().filter(|id| !id.trim().is_empty()) {
            Some(id) => Some(self.worksite_by_id(id).await?.id),
            None => None,
        };

        let record = Receipt {
            id: new_id(),
            worksite_id,
            vendor: receipt.vendor.trim().to_string(),
            amount: receipt.amount,
            date: date.format("%Y-%m-%d").to_string(),
            notes: receipt.notes,
            created_by: user.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };
        let row = record.clone();
        self.store()
            .execute(move |conn| queries::insert_receipt(conn, &row))
            .await
            .map_err(ExecuteError::write_failed)?;
        info!("recorded receipt {} from {}", record.id, record.vendor);
        Ok(Outcome::Receipt(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::model::{DashboardCommand, ProjectInfo};
    use crate::db::{Database, Schema};

    async fn with_worksite() -> (Executor, String) {
        let exec = Executor::new(Database::open_in_memory(Schema::Store).unwrap());
        let outcome = exec
            .execute(
                "u1",
                &DashboardCommand::CreateProject {
                    project_info: ProjectInfo {
                        name: "Nordbau GmbH".to_string(),
                        address: "Hafenstraße 1".to_string(),
                        city: "Bremen".to_string(),
                        zip_code: Some("28195".to_string()),
                        description: None,
                        is_existing: false,
                    },
                },
            )
            .await
            .unwrap();
        let Outcome::Project { worksite, .. } = outcome else { panic!() };
        (exec, worksite.id)
    }

    #[tokio::test]
    async fn test_time_entry_by_worksite_id() {
        let (exec, worksite_id) = with_worksite().await;
        let outcome = exec
            .record_time_entry(
                "u1",
                NewTimeEntry {
                    worksite_id,
                    date: "2024-03-15".to_string(),
                    start_time: "06:30".to_string(),
                    end_time: "15:00".to_string(),
                    break_minutes: Some(30),
                    description: "Schalung".to_string(),
                    notes: None,
                },
            )
            .await
            .unwrap();
        let Outcome::TimeEntry(entry) = outcome else { panic!() };
        assert_eq!(entry.hours, 8.0);
        assert_eq!(entry.notes, None);
    }

    #[tokio::test]
    async fn test_unknown_worksite_id_is_not_found() {
        let (exec, _) = with_worksite().await;
        let err = exec
            .record_task(
                "u1",
                NewTask {
                    worksite_id: "missing".to_string(),
                    content: "Gerüst".to_string(),
                    priority: Priority::High,
                    category: Category::Work,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::WorksiteNotFound(ref id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_material_and_receipt() {
        let (exec, worksite_id) = with_worksite().await;
        let material: NewMaterial = serde_json::from_value(serde_json::json!({
            "worksiteId": worksite_id, "name": "Zement", "quantity": 20, "unit": "Sack"
        }))
        .unwrap();
        let Outcome::Material(m) = exec.record_material("u1", material).await.unwrap() else {
            panic!()
        };
        assert_eq!(m.quantity, 20.0);

        let bad: NewMaterial = serde_json::from_value(serde_json::json!({
            "worksiteId": worksite_id, "name": "Zement", "quantity": 0, "unit": "Sack"
        }))
        .unwrap();
        assert_eq!(exec.record_material("u1", bad).await.unwrap_err().kind(), "invalid_request");

        let receipt: NewReceipt = serde_json::from_value(serde_json::json!({
            "vendor": "Baumarkt Nord", "amount": 149.9, "date": "2024-03-14"
        }))
        .unwrap();
        let Outcome::Receipt(r) = exec.record_receipt("u1", receipt).await.unwrap() else {
            panic!()
        };
        assert_eq!(r.worksite_id, None);
        assert_eq!(r.date, "2024-03-14");
    }
}
