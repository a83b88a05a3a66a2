//! Project directory
//!
//! Lists the projects known on this machine, and which one is open. Removing
//! a project leaves a tombstone (name and secrets cleared) so the removal can
//! be shared through the remote directory.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::schema::{init_projects_schema, needs_init};
use crate::models::Project;

/// SQLite-backed list of projects
pub struct ProjectDirectory {
    conn: Connection,
}

impl ProjectDirectory {
    /// Open or create the directory database
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        if needs_init(&conn) {
            init_projects_schema(&conn)?;
        }

        debug!("Opened project directory at {:?}", path);
        Ok(Self { conn })
    }

    /// Open an in-memory directory (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_projects_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Insert or replace a project
    pub fn upsert(&self, project: &Project) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO projects (uuid, name, keys, jwt, deleted) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project.uuid.to_string(),
                project.name,
                project.keys,
                project.jwt,
                project.deleted,
            ],
        )?;
        Ok(())
    }

    /// Get a live project by uuid
    pub fn get(&self, uuid: &Uuid) -> StorageResult<Option<Project>> {
        let row = self
            .conn
            .query_row(
                "SELECT uuid, name, keys, jwt, deleted FROM projects WHERE uuid = ? AND deleted = 0",
                params![uuid.to_string()],
                ProjectRow::from_row,
            )
            .optional()?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Find a live project by uuid, uuid prefix or exact name
    pub fn find(&self, key: &str) -> StorageResult<Option<Project>> {
        let projects = self.list()?;
        if let Some(p) = projects.iter().find(|p| p.name == key) {
            return Ok(Some(p.clone()));
        }
        let matches: Vec<&Project> = projects
            .iter()
            .filter(|p| p.uuid.to_string().starts_with(key))
            .collect();
        Ok(match matches.as_slice() {
            [single] => Some((*single).clone()),
            _ => None,
        })
    }

    /// Live projects, by name
    pub fn list(&self) -> StorageResult<Vec<Project>> {
        self.query("SELECT uuid, name, keys, jwt, deleted FROM projects WHERE deleted = 0 ORDER BY name")
    }

    /// Every project row, tombstones included
    pub fn list_all(&self) -> StorageResult<Vec<Project>> {
        self.query("SELECT uuid, name, keys, jwt, deleted FROM projects ORDER BY name")
    }

    fn query(&self, sql: &str) -> StorageResult<Vec<Project>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map([], ProjectRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ProjectRow::into_project).collect()
    }

    /// Tombstone a project, clearing its name and secrets
    pub fn remove(&self, uuid: &Uuid) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE projects SET deleted = 1, keys = NULL, jwt = NULL, name = '' WHERE uuid = ?",
            params![uuid.to_string()],
        )?;
        if self.current()? == Some(*uuid) {
            self.set_current(None)?;
        }
        Ok(changed > 0)
    }

    /// Record the secret key of a project
    pub fn set_keys(&self, uuid: &Uuid, keys: &str) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE projects SET keys = ?1 WHERE uuid = ?2 AND deleted = 0",
            params![keys, uuid.to_string()],
        )?;
        if changed == 0 {
            return Err(StorageError::missing("project", uuid));
        }
        Ok(())
    }

    /// The project marked open, if any
    pub fn current(&self) -> StorageResult<Option<Uuid>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM schema_info WHERE key = 'current_project'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Uuid::parse_str(&raw)
                .map(Some)
                .map_err(|e| StorageError::InvalidRow {
                    table: "schema_info",
                    details: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Mark a project open (or none)
    pub fn set_current(&self, uuid: Option<Uuid>) -> StorageResult<()> {
        match uuid {
            Some(uuid) => {
                self.conn.execute(
                    "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('current_project', ?)",
                    params![uuid.to_string()],
                )?;
            }
            None => {
                self.conn.execute(
                    "DELETE FROM schema_info WHERE key = 'current_project'",
                    [],
                )?;
            }
        }
        Ok(())
    }
}

struct ProjectRow {
    uuid: String,
    name: String,
    keys: Option<String>,
    jwt: Option<String>,
    deleted: bool,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            name: row.get(1)?,
            keys: row.get(2)?,
            jwt: row.get(3)?,
            deleted: row.get(4)?,
        })
    }

    fn into_project(self) -> StorageResult<Project> {
        let uuid = Uuid::parse_str(&self.uuid).map_err(|e| StorageError::InvalidRow {
            table: "projects",
            details: e.to_string(),
        })?;
        Ok(Project {
            uuid,
            name: self.name,
            keys: self.keys,
            jwt: self.jwt,
            deleted: self.deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data").join("projects.db");
        let dir = ProjectDirectory::open(&path).unwrap();

        assert!(path.exists());
        assert!(dir.list().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_and_find() {
        let dir = ProjectDirectory::open_in_memory().unwrap();
        let infra = Project::new("infra");
        let app = Project::new("app");
        dir.upsert(&infra).unwrap();
        dir.upsert(&app).unwrap();

        let names: Vec<String> = dir.list().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["app", "infra"]);

        assert_eq!(dir.find("infra").unwrap().unwrap().uuid, infra.uuid);
        let prefix = &infra.uuid.to_string()[..8];
        assert_eq!(dir.find(prefix).unwrap().unwrap().uuid, infra.uuid);
        assert!(dir.find("missing").unwrap().is_none());
        assert_eq!(dir.get(&app.uuid).unwrap().unwrap(), app);
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let dir = ProjectDirectory::open_in_memory().unwrap();
        let mut project = Project::new("secret-stuff");
        project.keys = Some("k".into());
        project.jwt = Some("proof".into());
        dir.upsert(&project).unwrap();
        dir.set_current(Some(project.uuid)).unwrap();

        assert!(dir.remove(&project.uuid).unwrap());

        assert!(dir.get(&project.uuid).unwrap().is_none());
        assert!(dir.current().unwrap().is_none());
        let all = dir.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].deleted);
        assert!(all[0].keys.is_none());
        assert!(all[0].name.is_empty());
    }

    #[test]
    fn test_current_project() {
        let dir = ProjectDirectory::open_in_memory().unwrap();
        assert!(dir.current().unwrap().is_none());

        let project = Project::new("p");
        dir.upsert(&project).unwrap();
        dir.set_current(Some(project.uuid)).unwrap();
        assert_eq!(dir.current().unwrap(), Some(project.uuid));

        dir.set_current(None).unwrap();
        assert!(dir.current().unwrap().is_none());
    }

    #[test]
    fn test_set_keys() {
        let dir = ProjectDirectory::open_in_memory().unwrap();
        let project = Project::new("p");
        dir.upsert(&project).unwrap();

        dir.set_keys(&project.uuid, "new-key").unwrap();
        assert_eq!(
            dir.get(&project.uuid).unwrap().unwrap().keys.as_deref(),
            Some("new-key")
        );
        assert!(dir.set_keys(&Uuid::new_v4(), "x").is_err());
    }
}
