use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::command::model::ProjectInfo;
use crate::db::models::{new_id, Customer, Worksite, WorksiteStatus};
use crate::db::{queries, Database};
use crate::execute::error::ExecuteError;

use super::matching::{address_fragments, compose_address, normalize, person_name};

#[derive(Debug, Clone, PartialEq)]
pub enum CustomerResolution {
    Reused(Customer),
    Created(Customer),
    /// Company-style or empty name; the worksite gets no customer link.
    Skipped,
}

impl CustomerResolution {
    pub fn customer_id(&self) -> Option<&str> {
        match self {
            CustomerResolution::Reused(c) | CustomerResolution::Created(c) => Some(&c.id),
            CustomerResolution::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorksiteResolution {
    /// Matched, and the command declared it refers to an existing worksite.
    Existing(Worksite),
    /// Matched, but the command did not assert reuse. Nothing was written.
    Conflict(Worksite),
    Created {
        worksite: Worksite,
        customer: CustomerResolution,
    },
}

/// Looks up customers and worksites by fuzzy text match.
///
/// Lookup and creation are separate store calls with no lock held in
/// between: two concurrent commands naming the same new address can both
/// miss and both create.
#[derive(Clone)]
pub struct Resolver {
    store: Database,
}

impl Resolver {
    pub fn new(store: Database) -> Self {
        Self { store }
    }

    /// First worksite whose address contains every fragment.
    pub async fn find_match(&self, fragments: Vec<String>) -> Result<Option<Worksite>> {
        let mut hits = self
            .store
            .execute(move |conn| queries::find_worksites_containing(conn, &fragments))
            .await?;
        if hits.len() > 1 {
            debug!(
                "{} worksites match, picking {} ({})",
                hits.len(),
                hits[0].id,
                hits[0].address
            );
        }
        Ok(if hits.is_empty() { None } else { Some(hits.swap_remove(0)) })
    }

    /// Resolve the address hint of a task, time or material command. There
    /// is no create-on-miss.
    pub async fn resolve_hint(&self, hint: &str) -> Result<Worksite, ExecuteError> {
        let fragments = address_fragments(hint);
        if fragments.is_empty() {
            return Err(ExecuteError::InvalidRequest(
                "projectAddress must not be empty".to_string(),
            ));
        }
        match self.find_match(fragments).await? {
            Some(worksite) => {
                debug!("address hint '{}' resolved to {}", hint, worksite.id);
                Ok(worksite)
            }
            None => {
                info!("no worksite matches '{}'", hint);
                Err(ExecuteError::WorksiteNotFound(hint.trim().to_string()))
            }
        }
    }

    pub async fn resolve_for_create(
        &self,
        info: &ProjectInfo,
        user: &str,
    ) -> Result<WorksiteResolution, ExecuteError> {
        let fragments: Vec<String> = [normalize(&info.address), normalize(&info.city)]
            .into_iter()
            .filter(|f| !f.is_empty())
            .collect();

        if let Some(existing) = self.find_match(fragments).await? {
            return Ok(if info.is_existing {
                info!("reusing existing worksite {} ({})", existing.id, existing.address);
                WorksiteResolution::Existing(existing)
            } else {
                warn!(
                    "worksite conflict: '{}, {}' matches {} ({})",
                    info.address, info.city, existing.id, existing.address
                );
                WorksiteResolution::Conflict(existing)
            });
        }
        if info.is_existing {
            warn!(
                "command refers to an existing worksite at '{}, {}' but none matches; creating it",
                info.address, info.city
            );
        }

        let customer = self.resolve_customer(&info.name, &info.city, user).await?;

        let address = compose_address(&info.address, info.zip_code.as_deref(), &info.city);
        let worksite = Worksite {
            id: new_id(),
            name: address.clone(),
            address,
            description: info.description.clone().filter(|d| !d.trim().is_empty()),
            customer_id: customer.customer_id().map(str::to_string),
            status: WorksiteStatus::Active,
            created_by: user.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };

        let record = worksite.clone();
        let inserted = self
            .store
            .execute(move |conn| queries::insert_worksite(conn, &record))
            .await;

        if let Err(err) = inserted {
            if let CustomerResolution::Created(orphan) = &customer {
                self.remove_orphan(orphan).await;
            }
            return Err(ExecuteError::write_failed(err));
        }

        info!("created worksite {} ({})", worksite.id, worksite.address);
        Ok(WorksiteResolution::Created { worksite, customer })
    }

    pub async fn resolve_customer(
        &self,
        declared_name: &str,
        city: &str,
        user: &str,
    ) -> Result<CustomerResolution, ExecuteError> {
        let Some(name) = person_name(declared_name) else {
            debug!("'{}' is not a person name; no customer link", declared_name);
            return Ok(CustomerResolution::Skipped);
        };

        let key = normalize(&name);
        let mut existing = self
            .store
            .execute(move |conn| queries::find_customers_by_name(conn, &key))
            .await?;
        if !existing.is_empty() {
            let customer = existing.swap_remove(0);
            debug!("reusing customer {} ({})", customer.id, customer.name);
            return Ok(CustomerResolution::Reused(customer));
        }

        let customer = Customer {
            id: new_id(),
            name,
            city: city.trim().to_string(),
            created_by: user.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };
        let record = customer.clone();
        self.store
            .execute(move |conn| queries::insert_customer(conn, &record))
            .await
            .map_err(ExecuteError::write_failed)?;

        info!("created customer {} ({})", customer.id, customer.name);
        Ok(CustomerResolution::Created(customer))
    }

    async fn remove_orphan(&self, customer: &Customer) {
        let id = customer.id.clone();
        match self
            .store
            .execute(move |conn| queries::delete_customer(conn, &id))
            .await
        {
            Ok(_) => warn!("removed customer {} after worksite insert failed", customer.id),
            Err(err) => error!(
                "failed to remove orphaned customer {}: {err:#}",
                customer.id
            ),
        }
    }
}
