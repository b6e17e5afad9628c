//! Control-plane records: workspaces, projects, generation jobs and schema
//! promotions. Timestamps here are Unix milliseconds.

use std::str::FromStr;

use duckdb::{OptionalExt, Row, params};

use crate::storage::StorageError;
use crate::storage::store::{TelemetryStore, effective_limit};
use crate::storage::types::{
    GenerationJob, JobStatus, Project, PromotionStatus, SchemaPromotion, Workspace,
    WorkspaceStatus, decode_attributes, encode_attributes, now_unix_millis,
};

fn parse_status<S: FromStr>(raw: &str, what: &str) -> Result<S, StorageError> {
    S::from_str(raw)
        .map_err(|_| StorageError::InvalidData(format!("unknown {what} status '{raw}'")))
}

// =============================================================================
// Workspaces
// =============================================================================

const WORKSPACE_SELECT: &str = "SELECT workspace_id, name, service_name, sdk_version,
        runtime_version, framework, git_commit, status, first_seen, last_heartbeat, metadata_json
    FROM workspaces";

fn row_to_workspace(row: &Row<'_>) -> duckdb::Result<(Workspace, String, Option<String>)> {
    let workspace = Workspace {
        workspace_id: row.get(0)?,
        name: row.get(1)?,
        service_name: row.get(2)?,
        sdk_version: row.get(3)?,
        runtime_version: row.get(4)?,
        framework: row.get(5)?,
        git_commit: row.get(6)?,
        first_seen: row.get(8)?,
        last_heartbeat: row.get(9)?,
        ..Default::default()
    };
    Ok((workspace, row.get(7)?, row.get(10)?))
}

fn finish_workspace(
    (mut workspace, status, metadata): (Workspace, String, Option<String>),
) -> Result<Workspace, StorageError> {
    workspace.status = parse_status::<WorkspaceStatus>(&status, "workspace")?;
    workspace.metadata = decode_attributes(metadata)?;
    Ok(workspace)
}

// =============================================================================
// Generation jobs & schema promotions
// =============================================================================

const JOB_SELECT: &str = "SELECT job_id, workspace_id, profile_id, status, output_url,
        error_message, created_at, completed_at
    FROM generation_jobs";

fn row_to_job(row: &Row<'_>) -> duckdb::Result<(GenerationJob, String)> {
    let job = GenerationJob {
        job_id: row.get(0)?,
        workspace_id: row.get(1)?,
        profile_id: row.get(2)?,
        output_url: row.get(4)?,
        error_message: row.get(5)?,
        created_at: row.get(6)?,
        completed_at: row.get(7)?,
        ..Default::default()
    };
    Ok((job, row.get(3)?))
}

fn finish_job((mut job, status): (GenerationJob, String)) -> Result<GenerationJob, StorageError> {
    job.status = parse_status::<JobStatus>(&status, "job")?;
    Ok(job)
}

const PROMOTION_SELECT: &str = "SELECT id, profile_id, source_attribute, target_column,
        target_type, target_table, status, applied_at, created_at
    FROM schema_promotions";

fn row_to_promotion(row: &Row<'_>) -> duckdb::Result<(SchemaPromotion, String)> {
    let promotion = SchemaPromotion {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        source_attribute: row.get(2)?,
        target_column: row.get(3)?,
        target_type: row.get(4)?,
        target_table: row.get(5)?,
        applied_at: row.get(7)?,
        created_at: row.get(8)?,
        ..Default::default()
    };
    Ok((promotion, row.get(6)?))
}

fn finish_promotion(
    (mut promotion, status): (SchemaPromotion, String),
) -> Result<SchemaPromotion, StorageError> {
    promotion.status = parse_status::<PromotionStatus>(&status, "promotion")?;
    Ok(promotion)
}

impl TelemetryStore {
    // -------------------------------------------------------------------------
    // Workspaces
    // -------------------------------------------------------------------------

    /// Register or refresh a workspace. `first_seen` keeps its original value.
    pub async fn upsert_workspace(&self, workspace: Workspace) -> Result<(), StorageError> {
        let metadata = encode_attributes(&workspace.metadata)?;
        self.write("upsert_workspace", move |conn| {
            conn.prepare_cached(
                "INSERT INTO workspaces (workspace_id, name, service_name, sdk_version,
                        runtime_version, framework, git_commit, status, first_seen,
                        last_heartbeat, metadata_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (workspace_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    service_name = EXCLUDED.service_name,
                    sdk_version = EXCLUDED.sdk_version,
                    runtime_version = EXCLUDED.runtime_version,
                    framework = EXCLUDED.framework,
                    git_commit = EXCLUDED.git_commit,
                    status = EXCLUDED.status,
                    last_heartbeat = EXCLUDED.last_heartbeat,
                    metadata_json = EXCLUDED.metadata_json",
            )?
            .execute(params![
                workspace.workspace_id,
                workspace.name,
                workspace.service_name,
                workspace.sdk_version,
                workspace.runtime_version,
                workspace.framework,
                workspace.git_commit,
                workspace.status.as_ref(),
                workspace.first_seen,
                workspace.last_heartbeat,
                metadata,
            ])?;
            Ok(())
        })
        .await
    }

    pub async fn get_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Option<Workspace>, StorageError> {
        let workspace_id = workspace_id.to_string();
        self.read(move |conn| {
            conn.prepare(&format!("{WORKSPACE_SELECT} WHERE workspace_id = ?"))?
                .query_row([&workspace_id], row_to_workspace)
                .optional()?
                .map(finish_workspace)
                .transpose()
        })
        .await
    }

    /// Most recently active workspaces first.
    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>, StorageError> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("{WORKSPACE_SELECT} ORDER BY last_heartbeat DESC"))?;
            let raw = stmt
                .query_map([], row_to_workspace)?
                .collect::<duckdb::Result<Vec<_>>>()?;
            raw.into_iter().map(finish_workspace).collect()
        })
        .await
    }

    /// Mark a workspace active as of now. Returns `false` for an unknown id.
    pub async fn heartbeat_workspace(&self, workspace_id: &str) -> Result<bool, StorageError> {
        let workspace_id = workspace_id.to_string();
        self.write("heartbeat_workspace", move |conn| {
            let updated = conn
                .prepare_cached(
                    "UPDATE workspaces SET last_heartbeat = ?, status = 'active'
                     WHERE workspace_id = ?",
                )?
                .execute(params![now_unix_millis(), workspace_id])?;
            Ok(updated > 0)
        })
        .await
    }

    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<bool, StorageError> {
        let workspace_id = workspace_id.to_string();
        self.write("delete_workspace", move |conn| {
            let deleted = conn
                .prepare_cached("DELETE FROM workspaces WHERE workspace_id = ?")?
                .execute([&workspace_id])?;
            Ok(deleted > 0)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Projects
    // -------------------------------------------------------------------------

    pub async fn insert_project(&self, project: Project) -> Result<(), StorageError> {
        self.write("insert_project", move |conn| {
            conn.prepare_cached(
                "INSERT INTO projects (project_id, workspace_id, name, description,
                                       created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (project_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    description = EXCLUDED.description,
                    updated_at = EXCLUDED.updated_at",
            )?
            .execute(params![
                project.project_id,
                project.workspace_id,
                project.name,
                project.description,
                project.created_at,
                project.updated_at,
            ])?;
            Ok(())
        })
        .await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StorageError> {
        let project_id = project_id.to_string();
        self.read(move |conn| {
            Ok(conn
                .prepare(
                    "SELECT project_id, workspace_id, name, description, created_at, updated_at
                     FROM projects WHERE project_id = ?",
                )?
                .query_row([&project_id], |row| {
                    Ok(Project {
                        project_id: row.get(0)?,
                        workspace_id: row.get(1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                })
                .optional()?)
        })
        .await
    }

    /// Projects of one workspace, or all projects, by name.
    pub async fn list_projects(
        &self,
        workspace_id: Option<&str>,
    ) -> Result<Vec<Project>, StorageError> {
        let workspace_id = workspace_id.map(str::to_string);
        self.read(move |conn| {
            let mut sql = String::from(
                "SELECT project_id, workspace_id, name, description, created_at, updated_at
                 FROM projects",
            );
            if workspace_id.is_some() {
                sql.push_str(" WHERE workspace_id = ?");
            }
            sql.push_str(" ORDER BY name ASC");

            let mut stmt = conn.prepare(&sql)?;
            let map = |row: &Row<'_>| -> duckdb::Result<Project> {
                Ok(Project {
                    project_id: row.get(0)?,
                    workspace_id: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            };
            let projects = match &workspace_id {
                Some(id) => stmt.query_map([id], map)?.collect::<duckdb::Result<Vec<_>>>()?,
                None => stmt.query_map([], map)?.collect::<duckdb::Result<Vec<_>>>()?,
            };
            Ok(projects)
        })
        .await
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<bool, StorageError> {
        let project_id = project_id.to_string();
        self.write("delete_project", move |conn| {
            let deleted = conn
                .prepare_cached("DELETE FROM projects WHERE project_id = ?")?
                .execute([&project_id])?;
            Ok(deleted > 0)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Generation jobs
    // -------------------------------------------------------------------------

    pub async fn insert_generation_job(&self, job: GenerationJob) -> Result<(), StorageError> {
        self.write("insert_generation_job", move |conn| {
            conn.prepare_cached(
                "INSERT INTO generation_jobs (job_id, workspace_id, profile_id, status, output_url,
                        error_message, created_at, completed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                job.job_id,
                job.workspace_id,
                job.profile_id,
                job.status.as_ref(),
                job.output_url,
                job.error_message,
                job.created_at,
                job.completed_at,
            ])?;
            Ok(())
        })
        .await
    }

    /// Move a job to `status`. Terminal states stamp `completed_at`.
    pub async fn update_generation_job(
        &self,
        job_id: &str,
        status: JobStatus,
        output_url: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StorageError> {
        let job_id = job_id.to_string();
        self.write("update_generation_job", move |conn| {
            let completed_at = status.is_terminal().then(now_unix_millis);
            let updated = conn
                .prepare_cached(
                    "UPDATE generation_jobs
                     SET status = ?, output_url = COALESCE(?, output_url),
                         error_message = ?, completed_at = COALESCE(?, completed_at)
                     WHERE job_id = ?",
                )?
                .execute(params![
                    status.as_ref(),
                    output_url,
                    error_message,
                    completed_at,
                    job_id,
                ])?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!("generation job {job_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_generation_job(
        &self,
        job_id: &str,
    ) -> Result<Option<GenerationJob>, StorageError> {
        let job_id = job_id.to_string();
        self.read(move |conn| {
            conn.prepare(&format!("{JOB_SELECT} WHERE job_id = ?"))?
                .query_row([&job_id], row_to_job)
                .optional()?
                .map(finish_job)
                .transpose()
        })
        .await
    }

    /// Newest jobs of a workspace first.
    pub async fn list_generation_jobs(
        &self,
        workspace_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<GenerationJob>, StorageError> {
        let workspace_id = workspace_id.to_string();
        let limit = effective_limit(limit);
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{JOB_SELECT} WHERE workspace_id = ? ORDER BY created_at DESC LIMIT {limit}"
            ))?;
            let raw = stmt
                .query_map([&workspace_id], row_to_job)?
                .collect::<duckdb::Result<Vec<_>>>()?;
            raw.into_iter().map(finish_job).collect()
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Schema promotions
    // -------------------------------------------------------------------------

    pub async fn insert_schema_promotion(
        &self,
        promotion: SchemaPromotion,
    ) -> Result<(), StorageError> {
        self.write("insert_schema_promotion", move |conn| {
            conn.prepare_cached(
                "INSERT INTO schema_promotions (id, profile_id, source_attribute, target_column,
                        target_type, target_table, status, applied_at, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                promotion.id,
                promotion.profile_id,
                promotion.source_attribute,
                promotion.target_column,
                promotion.target_type,
                promotion.target_table,
                promotion.status.as_ref(),
                promotion.applied_at,
                promotion.created_at,
            ])?;
            Ok(())
        })
        .await
    }

    /// Set a promotion's status; `Applied` stamps `applied_at`.
    pub async fn update_schema_promotion_status(
        &self,
        id: &str,
        status: PromotionStatus,
    ) -> Result<(), StorageError> {
        let id = id.to_string();
        self.write("update_schema_promotion_status", move |conn| {
            let applied_at = (status == PromotionStatus::Applied).then(now_unix_millis);
            let updated = conn
                .prepare_cached(
                    "UPDATE schema_promotions
                     SET status = ?, applied_at = COALESCE(?, applied_at)
                     WHERE id = ?",
                )?
                .execute(params![status.as_ref(), applied_at, id])?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!("schema promotion {id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_schema_promotion(
        &self,
        id: &str,
    ) -> Result<Option<SchemaPromotion>, StorageError> {
        let id = id.to_string();
        self.read(move |conn| {
            conn.prepare(&format!("{PROMOTION_SELECT} WHERE id = ?"))?
                .query_row([&id], row_to_promotion)
                .optional()?
                .map(finish_promotion)
                .transpose()
        })
        .await
    }

    /// Promotions in creation order, optionally narrowed to one status.
    pub async fn list_schema_promotions(
        &self,
        status: Option<PromotionStatus>,
    ) -> Result<Vec<SchemaPromotion>, StorageError> {
        self.read(move |conn| {
            let raw = match status {
                Some(status) => conn
                    .prepare(&format!(
                        "{PROMOTION_SELECT} WHERE status = ? ORDER BY created_at ASC"
                    ))?
                    .query_map([status.as_ref()], row_to_promotion)?
                    .collect::<duckdb::Result<Vec<_>>>()?,
                None => conn
                    .prepare(&format!("{PROMOTION_SELECT} ORDER BY created_at ASC"))?
                    .query_map([], row_to_promotion)?
                    .collect::<duckdb::Result<Vec<_>>>()?,
            };
            raw.into_iter().map(finish_promotion).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreBuilder;

    fn workspace(id: &str, first_seen: i64, heartbeat: i64) -> Workspace {
        Workspace {
            workspace_id: id.to_string(),
            name: format!("{id}-app"),
            service_name: Some("checkout".to_string()),
            first_seen,
            last_heartbeat: heartbeat,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_workspace_upsert_preserves_first_seen() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store.upsert_workspace(workspace("w1", 100, 100)).await.unwrap();

        let mut refreshed = workspace("w1", 999, 500);
        refreshed.sdk_version = Some("1.2.0".into());
        store.upsert_workspace(refreshed).await.unwrap();

        let stored = store.get_workspace("w1").await.unwrap().unwrap();
        assert_eq!(stored.first_seen, 100);
        assert_eq!(stored.last_heartbeat, 500);
        assert_eq!(stored.sdk_version.as_deref(), Some("1.2.0"));

        assert!(store.heartbeat_workspace("w1").await.unwrap());
        assert!(!store.heartbeat_workspace("ghost").await.unwrap());
        let beat = store.get_workspace("w1").await.unwrap().unwrap();
        assert!(beat.last_heartbeat > 500);

        assert!(store.delete_workspace("w1").await.unwrap());
        assert!(store.list_workspaces().await.unwrap().is_empty());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_projects_by_workspace() {
        let store = StoreBuilder::in_memory().build().unwrap();
        for (id, ws, name) in [("p1", "w1", "beta"), ("p2", "w1", "alpha"), ("p3", "w2", "gamma")] {
            store
                .insert_project(Project {
                    project_id: id.into(),
                    workspace_id: ws.into(),
                    name: name.into(),
                    description: None,
                    created_at: 1,
                    updated_at: 1,
                })
                .await
                .unwrap();
        }

        let w1 = store.list_projects(Some("w1")).await.unwrap();
        assert_eq!(
            w1.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "beta"]
        );
        assert_eq!(store.list_projects(None).await.unwrap().len(), 3);
        assert!(store.delete_project("p3").await.unwrap());
        assert!(store.get_project("p3").await.unwrap().is_none());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_generation_job_completion_stamps_time() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store
            .insert_generation_job(GenerationJob {
                job_id: "j1".into(),
                workspace_id: "w1".into(),
                created_at: 1,
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .update_generation_job("j1", JobStatus::Running, None, None)
            .await
            .unwrap();
        assert!(store.get_generation_job("j1").await.unwrap().unwrap().completed_at.is_none());

        store
            .update_generation_job("j1", JobStatus::Completed, Some("file:///out.zip".into()), None)
            .await
            .unwrap();
        let job = store.get_generation_job("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.output_url.as_deref(), Some("file:///out.zip"));
        assert_eq!(store.list_generation_jobs("w1", None).await.unwrap().len(), 1);

        let missing = store
            .update_generation_job("nope", JobStatus::Failed, None, None)
            .await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_schema_promotion_applied_at() {
        let store = StoreBuilder::in_memory().build().unwrap();
        store
            .insert_schema_promotion(SchemaPromotion {
                id: "sp1".into(),
                source_attribute: "llm.user_id".into(),
                target_column: "user_id".into(),
                target_type: "VARCHAR".into(),
                target_table: "spans".into(),
                created_at: 1,
                ..Default::default()
            })
            .await
            .unwrap();

        let pending = store
            .list_schema_promotions(Some(PromotionStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].applied_at.is_none());

        store
            .update_schema_promotion_status("sp1", PromotionStatus::Applied)
            .await
            .unwrap();
        let applied = store.get_schema_promotion("sp1").await.unwrap().unwrap();
        assert_eq!(applied.status, PromotionStatus::Applied);
        assert!(applied.applied_at.is_some());
        assert!(store
            .list_schema_promotions(Some(PromotionStatus::Pending))
            .await
            .unwrap()
            .is_empty());
        store.shutdown().await;
    }
}
