use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use timeline::AssetKind;
use uuid::Uuid;

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("strata")
}

pub fn media_dir() -> PathBuf {
    app_data_dir().join("media")
}

/// Copy an external file into managed storage. The copy lives in a
/// per-kind subfolder under a uuid-stamped name, so the original can
/// be moved or deleted without breaking the project and imports of
/// equally-named files never collide.
pub fn import_media(src: &Path, kind: AssetKind) -> Result<PathBuf> {
    import_media_into(&media_dir(), src, kind)
}

pub fn import_media_into(root: &Path, src: &Path, kind: AssetKind) -> Result<PathBuf> {
    let sub = match kind {
        AssetKind::Video => "video",
        AssetKind::Image => "image",
        AssetKind::Audio => "audio",
        AssetKind::Text => "text",
    };
    let dir = root.join(sub);
    fs::create_dir_all(&dir).with_context(|| format!("create managed dir {}", dir.display()))?;
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string());
    let dest = dir.join(format!("{}-{name}", Uuid::new_v4()));
    fs::copy(src, &dest)
        .with_context(|| format!("copy {} into managed storage", src.display()))?;
    Ok(dest)
}

pub struct ProjectDb {
    conn: Connection,
    path: PathBuf,
}

impl ProjectDb {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        // Recommended PRAGMAs for a local interactive app DB
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure_project(&self, id: &str, name: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT OR IGNORE INTO projects(id, name, created_at, updated_at) VALUES(?1, ?2, ?3, ?3)",
            params![id, name, now],
        )?;
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM projects ORDER BY updated_at DESC")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The serialized layer array, one JSON document per project.
    pub fn save_timeline(&self, project_id: &str, layers_json: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT OR REPLACE INTO project_timeline(project_id, layers_json, updated_at) VALUES(?1, ?2, ?3)",
            params![project_id, layers_json, now],
        )?;
        self.conn.execute(
            "UPDATE projects SET updated_at = ?2 WHERE id = ?1",
            params![project_id, now],
        )?;
        Ok(())
    }

    pub fn load_timeline(&self, project_id: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT layers_json FROM project_timeline WHERE project_id = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![project_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS projects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS project_timeline(
            project_id TEXT PRIMARY KEY REFERENCES projects(id),
            layers_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("strata-{tag}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn timeline_json_round_trips() {
        let root = temp_root("db");
        let db = ProjectDb::open_or_create(&root.join("projects.db")).expect("open db");
        db.ensure_project("p1", "demo").unwrap();
        assert_eq!(db.load_timeline("p1").unwrap(), None);

        db.save_timeline("p1", r#"[{"kind":"video_photo"}]"#).unwrap();
        db.save_timeline("p1", r#"[{"kind":"audio"}]"#).unwrap();
        assert_eq!(
            db.load_timeline("p1").unwrap().as_deref(),
            Some(r#"[{"kind":"audio"}]"#)
        );
        assert_eq!(db.list_projects().unwrap().len(), 1);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn import_copies_under_a_collision_proof_name() {
        let root = temp_root("vault");
        let src = temp_root("src").with_extension("mp4");
        fs::write(&src, b"clip").unwrap();

        let first = import_media_into(&root, &src, AssetKind::Video).expect("import");
        let second = import_media_into(&root, &src, AssetKind::Video).expect("import");

        assert!(first.is_file());
        assert_ne!(first, second, "same source twice must not collide");
        assert!(first.parent().unwrap().ends_with("video"));
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(src.file_name().unwrap().to_string_lossy().as_ref()));

        fs::remove_file(&src).ok();
        fs::remove_dir_all(&root).ok();
    }
}
