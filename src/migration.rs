//! Migration applier
//!
//! Loads versioned `<version>_<title>.up.sql` files and applies the ones the
//! sandbox has not seen yet, tracking progress in `schema_migrations`.

use crate::db::SqlSession;
use crate::error::{configuration_error, PipelineError, PipelineResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

static MIGRATION_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)_(.*)\.up\.sql$").expect("migration file pattern compiles"));

const CURRENT_SCHEMA_SQL: &str = "SELECT current_schema();";
const METADATA_TABLE: &str = "schema_migrations";

/// Resolve a migration location (`file:///abs`, `file://relative` or a plain path)
pub fn resolve_location(location: &str) -> PipelineResult<PathBuf> {
    let location = location.trim();
    if location.is_empty() {
        return Err(configuration_error("Migration location is empty"));
    }

    match location.split_once("://") {
        Some(("file", rest)) if rest.starts_with('/') => url::Url::parse(location)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| configuration_error(format!("Invalid migration URI '{}'", location))),
        Some(("file", rest)) => Ok(PathBuf::from(rest)),
        Some((scheme, _)) => Err(configuration_error(format!(
            "Unsupported migration source '{}://'",
            scheme
        ))),
        None => Ok(PathBuf::from(location)),
    }
}

/// One versioned migration step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u64,
    pub name: String,
    pub sql: String,
}

/// Migrations ordered by version
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Load every up-migration found at `location`
    pub fn load(location: &str) -> PipelineResult<Self> {
        let dir = resolve_location(location)?;
        Self::load_dir(&dir)
    }

    fn load_dir(dir: &Path) -> PipelineResult<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::MigrationFailed {
            version: None,
            reason: format!("Cannot read migration directory {}: {}", dir.display(), e),
        })?;

        let mut by_version: BTreeMap<u64, Migration> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::MigrationFailed {
                version: None,
                reason: e.to_string(),
            })?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(captures) = MIGRATION_FILE.captures(file_name) else {
                continue;
            };

            let version: u64 = captures[1].parse().map_err(|_| PipelineError::MigrationFailed {
                version: None,
                reason: format!("Migration version of {} is out of range", file_name),
            })?;
            if by_version.contains_key(&version) {
                return Err(PipelineError::MigrationFailed {
                    version: Some(version),
                    reason: format!("Duplicate migration version in {}", file_name),
                });
            }

            let sql = std::fs::read_to_string(entry.path()).map_err(|e| PipelineError::MigrationFailed {
                version: Some(version),
                reason: format!("Cannot read {}: {}", file_name, e),
            })?;

            by_version.insert(
                version,
                Migration {
                    version,
                    name: captures[2].to_string(),
                    sql,
                },
            );
        }

        Ok(Self {
            migrations: by_version.into_values().collect(),
        })
    }

    #[cfg(test)]
    pub fn from_migrations(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self { migrations }
    }

    pub fn latest_version(&self) -> Option<u64> {
        self.migrations.last().map(|m| m.version)
    }

    pub fn contains(&self, version: u64) -> bool {
        self.migrations.iter().any(|m| m.version == version)
    }

    pub fn pending(&self, current: Option<u64>) -> impl Iterator<Item = &Migration> {
        self.migrations
            .iter()
            .filter(move |m| current.map_or(true, |c| m.version > c))
    }

    pub fn count(&self) -> usize {
        self.migrations.len()
    }
}

/// `schema_migrations` pinned to the schema that was current when applying began,
/// so a migration changing `search_path` cannot move the bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
struct MetadataTable {
    qualified: String,
}

impl MetadataTable {
    fn in_schema(schema: &str) -> Self {
        Self {
            qualified: format!("\"{}\".{}", schema.replace('"', "\"\""), METADATA_TABLE),
        }
    }

    fn ensure_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (version bigint NOT NULL PRIMARY KEY, dirty boolean NOT NULL);",
            self.qualified
        )
    }

    fn current_version_sql(&self) -> String {
        format!("SELECT version, dirty FROM {} LIMIT 1;", self.qualified)
    }

    fn truncate_sql(&self) -> String {
        format!("TRUNCATE {};", self.qualified)
    }

    fn insert_sql(&self, version: u64) -> String {
        format!("INSERT INTO {} (version, dirty) VALUES ({}, false);", self.qualified, version)
    }
}

/// Outcome of applying a migration set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub previous_version: Option<u64>,
    pub current_version: Option<u64>,
    pub applied: Vec<u64>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies migration sets to the sandbox
pub struct MigrationApplier;

impl MigrationApplier {
    /// Load the set at `location` and bring the sandbox up to its latest version
    pub async fn apply<S: SqlSession + ?Sized>(session: &S, location: &str) -> PipelineResult<MigrationReport> {
        let set = MigrationSet::load(location)?;
        info!(
            "Loaded {} migrations from {} (latest version {:?})",
            set.count(),
            location,
            set.latest_version()
        );
        Self::apply_set(session, &set).await
    }

    pub async fn apply_set<S: SqlSession + ?Sized>(session: &S, set: &MigrationSet) -> PipelineResult<MigrationReport> {
        let table = Self::metadata_table(session).await?;
        debug!("Tracking migrations in {}", table.qualified);

        session
            .execute(&table.ensure_sql())
            .await
            .map_err(|e| PipelineError::MigrationFailed {
                version: None,
                reason: format!("Cannot create migration metadata: {}", e),
            })?;

        let previous_version = Self::current_version(session, &table).await?;
        if let Some(current) = previous_version {
            if !set.contains(current) {
                return Err(PipelineError::MigrationFailed {
                    version: Some(current),
                    reason: "Sandbox version is not part of the migration set".to_string(),
                });
            }
        }

        let mut report = MigrationReport {
            previous_version,
            current_version: previous_version,
            applied: Vec::new(),
        };

        for migration in set.pending(previous_version) {
            debug!("Applying migration {} ({})", migration.version, migration.name);

            let mut statements = Vec::with_capacity(3);
            if !migration.sql.trim().is_empty() {
                statements.push(migration.sql.clone());
            }
            statements.push(table.truncate_sql());
            statements.push(table.insert_sql(migration.version));

            session
                .execute_in_transaction(&statements)
                .await
                .map_err(|e| PipelineError::MigrationFailed {
                    version: Some(migration.version),
                    reason: format!("{} failed: {}", migration.name, e),
                })?;

            report.applied.push(migration.version);
            report.current_version = Some(migration.version);
        }

        if report.is_noop() {
            info!("Sandbox already at latest migration version {:?}", report.current_version);
        } else {
            info!(
                "Applied {} migrations, sandbox now at version {:?}",
                report.applied.len(),
                report.current_version
            );
        }
        Ok(report)
    }

    async fn metadata_table<S: SqlSession + ?Sized>(session: &S) -> PipelineResult<MetadataTable> {
        let result = session
            .query_text(CURRENT_SCHEMA_SQL)
            .await
            .map_err(|e| PipelineError::MigrationFailed {
                version: None,
                reason: format!("Cannot read current schema: {}", e),
            })?;

        // NULL when search_path names no existing schema
        let schema = result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_deref())
            .filter(|v| !v.is_empty())
            .unwrap_or("public");
        Ok(MetadataTable::in_schema(schema))
    }

    async fn current_version<S: SqlSession + ?Sized>(
        session: &S,
        table: &MetadataTable,
    ) -> PipelineResult<Option<u64>> {
        let result = session
            .query_text(&table.current_version_sql())
            .await
            .map_err(|e| PipelineError::MigrationFailed {
                version: None,
                reason: format!("Cannot read migration version: {}", e),
            })?;

        let Some(row) = result.rows.first() else {
            return Ok(None);
        };

        let version = row
            .first()
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| PipelineError::MigrationFailed {
                version: None,
                reason: "Unreadable schema_migrations row".to_string(),
            })?;

        let dirty = matches!(row.get(1).and_then(|v| v.as_deref()), Some("t") | Some("true"));
        if dirty {
            return Err(PipelineError::MigrationFailed {
                version: Some(version),
                reason: "Dirty database version; fix it and clean schema_migrations".to_string(),
            });
        }

        Ok(Some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSession;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn migration(version: u64, sql: &str) -> Migration {
        Migration {
            version,
            name: format!("step_{}", version),
            sql: sql.to_string(),
        }
    }

    fn sample_set() -> MigrationSet {
        MigrationSet::from_migrations(vec![
            migration(2, "ALTER TABLE crm.accounts ADD COLUMN tier text;"),
            migration(1, "CREATE SCHEMA crm;"),
        ])
    }

    #[test]
    fn test_resolve_location() {
        assert_eq!(resolve_location("file:///tmp/migrations").unwrap(), PathBuf::from("/tmp/migrations"));
        assert_eq!(resolve_location("file://db/migrations").unwrap(), PathBuf::from("db/migrations"));
        assert_eq!(resolve_location("./migrations").unwrap(), PathBuf::from("./migrations"));
        assert!(resolve_location("s3://bucket/migrations").is_err());
        assert!(resolve_location("  ").is_err());
    }

    #[test]
    fn test_load_orders_by_version_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("10_add_index.up.sql"), "CREATE INDEX i ON t (c);").unwrap();
        fs::write(dir.path().join("2_create.up.sql"), "CREATE TABLE t (c int);").unwrap();
        fs::write(dir.path().join("2_create.down.sql"), "DROP TABLE t;").unwrap();
        fs::write(dir.path().join("README.md"), "notes").unwrap();

        let set = MigrationSet::load(dir.path().to_str().unwrap()).unwrap();
        let versions: Vec<u64> = set.pending(None).map(|m| m.version).collect();
        assert_eq!(versions, vec![2, 10]);
        assert_eq!(set.pending(None).next().unwrap().name, "create");
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1_a.up.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("001_b.up.sql"), "SELECT 1;").unwrap();

        let err = MigrationSet::load(dir.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, PipelineError::MigrationFailed { version: Some(1), .. }));
    }

    #[test]
    fn test_missing_directory() {
        let err = MigrationSet::load("file:///definitely/not/here").unwrap_err();
        assert!(matches!(err, PipelineError::MigrationFailed { version: None, .. }));
    }

    #[tokio::test]
    async fn test_applies_pending_in_order() {
        let session = RecordingSession::new();

        let report = MigrationApplier::apply_set(&session, &sample_set()).await.unwrap();

        assert_eq!(report.previous_version, None);
        assert_eq!(report.current_version, Some(2));
        assert_eq!(report.applied, vec![1, 2]);
        assert_eq!(session.migration_version(), Some((2, false)));

        let executed = session.executed();
        let create = executed.iter().position(|s| s == "CREATE SCHEMA crm;").unwrap();
        let alter = executed.iter().position(|s| s.starts_with("ALTER TABLE crm.accounts")).unwrap();
        assert!(create < alter);
    }

    #[tokio::test]
    async fn test_reapplying_is_noop() {
        let session = RecordingSession::new();
        MigrationApplier::apply_set(&session, &sample_set()).await.unwrap();
        let transactions = session.committed_transactions();

        let report = MigrationApplier::apply_set(&session, &sample_set()).await.unwrap();

        assert!(report.is_noop());
        assert_eq!(report.current_version, Some(2));
        assert_eq!(session.committed_transactions(), transactions);
        assert_eq!(session.count_containing("CREATE SCHEMA crm;"), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_applied_version() {
        let session = RecordingSession::new().fail_on("ADD COLUMN tier");

        let err = MigrationApplier::apply_set(&session, &sample_set()).await.unwrap_err();

        assert!(matches!(err, PipelineError::MigrationFailed { version: Some(2), .. }));
        assert_eq!(session.migration_version(), Some((1, false)));
    }

    #[tokio::test]
    async fn test_dirty_version_aborts() {
        let session = RecordingSession::new().with_migration_version(1, true);
        let err = MigrationApplier::apply_set(&session, &sample_set()).await.unwrap_err();
        assert!(err.to_string().contains("Dirty"));
        assert_eq!(session.committed_transactions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_current_version_aborts() {
        let session = RecordingSession::new().with_migration_version(7, false);
        let err = MigrationApplier::apply_set(&session, &sample_set()).await.unwrap_err();
        assert!(matches!(err, PipelineError::MigrationFailed { version: Some(7), .. }));
    }

    #[test]
    fn test_metadata_statements_are_schema_qualified() {
        let table = MetadataTable::in_schema("public");
        assert_eq!(
            table.ensure_sql(),
            "CREATE TABLE IF NOT EXISTS \"public\".schema_migrations (version bigint NOT NULL PRIMARY KEY, dirty boolean NOT NULL);"
        );
        assert_eq!(
            table.current_version_sql(),
            "SELECT version, dirty FROM \"public\".schema_migrations LIMIT 1;"
        );
        assert_eq!(table.truncate_sql(), "TRUNCATE \"public\".schema_migrations;");
        assert_eq!(
            table.insert_sql(3),
            "INSERT INTO \"public\".schema_migrations (version, dirty) VALUES (3, false);"
        );
        assert_eq!(
            MetadataTable::in_schema("odd\"name").qualified,
            "\"odd\"\"name\".schema_migrations"
        );
    }

    #[tokio::test]
    async fn test_search_path_change_keeps_bookkeeping_in_place() {
        let session = RecordingSession::new().with_result(
            "SELECT current_schema();",
            &["current_schema"],
            vec![vec![Some("app")]],
        );
        let set = MigrationSet::from_migrations(vec![
            migration(1, "CREATE SCHEMA crm; SET search_path TO crm;"),
            migration(2, "CREATE TABLE accounts (id int);"),
        ]);

        let report = MigrationApplier::apply_set(&session, &set).await.unwrap();

        assert_eq!(report.applied, vec![1, 2]);
        assert_eq!(session.migration_version(), Some((2, false)));
        assert_eq!(session.count_containing("TRUNCATE \"app\".schema_migrations;"), 2);
        assert_eq!(
            session.count_containing("INSERT INTO \"app\".schema_migrations (version, dirty) VALUES (2, false);"),
            1
        );
        let unqualified = session
            .executed()
            .into_iter()
            .filter(|s| s.contains("schema_migrations") && !s.contains("\"app\".schema_migrations"))
            .count();
        assert_eq!(unqualified, 0);
    }

    #[tokio::test]
    async fn test_null_current_schema_falls_back_to_public() {
        let session = RecordingSession::new().with_result(
            "SELECT current_schema();",
            &["current_schema"],
            vec![vec![None]],
        );
        MigrationApplier::apply_set(&session, &sample_set()).await.unwrap();
        assert_eq!(session.count_containing("\"public\".schema_migrations"), 6);
    }

    #[tokio::test]
    async fn test_empty_set_is_success() {
        let session = RecordingSession::new();
        let report = MigrationApplier::apply_set(&session, &MigrationSet::default()).await.unwrap();
        assert!(report.is_noop());
        assert_eq!(report.current_version, None);
    }
}
