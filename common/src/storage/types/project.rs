use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::stored_object;
use crate::{error::AppError, storage::db::SurrealDbClient};

stored_object!(Project, "project", {
    name: String,
    owner_id: String,
    folder_uuid: String,
    dataset_id: Option<String>,
    knowledge_base_name: Option<String>,
    report_path: Option<String>,
    #[serde(with = "crate::storage::types::surreal_opt_datetime", default)]
    report_generated_at: Option<DateTime<Utc>>
});

impl Project {
    pub fn new(name: String, owner_id: String) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name,
            owner_id,
            folder_uuid: Uuid::new_v4().to_string(),
            dataset_id: None,
            knowledge_base_name: None,
            report_path: None,
            report_generated_at: None,
        }
    }

    pub async fn create(
        name: String,
        owner_id: String,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let project = Self::new(name, owner_id);
        db.save(project.clone()).await?;
        Ok(project)
    }

    pub async fn get_by_id(id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.load::<Self>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("project {id}")))
    }

    /// Attaches a knowledge base to a project that does not yet have one.
    ///
    /// The update is conditional on `dataset_id` being unset, which makes
    /// concurrent dataset creation resolve to a single winner. Returns the
    /// updated project when this caller won, `None` when another binding
    /// already exists.
    pub async fn bind_knowledge_base(
        id: &str,
        dataset_id: &str,
        knowledge_base_name: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('project', $id)
                 SET dataset_id = $dataset_id,
                     knowledge_base_name = $kb_name,
                     updated_at = time::now()
                 WHERE dataset_id == NONE OR dataset_id == NULL",
            )
            .bind(("id", id.to_owned()))
            .bind(("dataset_id", dataset_id.to_owned()))
            .bind(("kb_name", knowledge_base_name.to_owned()))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(updated.into_iter().next())
    }

    /// Clears the knowledge-base binding after the remote dataset is gone.
    pub async fn clear_knowledge_base(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('project', $id)
             SET dataset_id = NONE, knowledge_base_name = NONE, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .await?
        .check()?;

        Ok(())
    }

    pub async fn record_report_artifact(
        id: &str,
        report_path: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('project', $id)
             SET report_path = $path,
                 report_generated_at = time::now(),
                 updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .bind(("path", report_path.to_owned()))
        .await?
        .check()?;

        Ok(())
    }
}
