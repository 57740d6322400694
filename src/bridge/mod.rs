//! Foreign bridge
//!
//! Wires the sandbox to the source database through `postgres_fdw` and clones
//! the selected schemas and tables into `clone_<schema>` namespaces:
//!
//! 1. **Extensions**: the foreign-data wrapper plus auxiliary extensions
//! 2. **Server + user mapping**: exactly one of each per sandbox
//! 3. **Schema-level import**: whole schemas
//! 4. **Table-level import**: named tables grouped by schema
//!
//! Any failing statement aborts the stage; nothing created so far is undone.

pub mod selectors;
pub mod statements;

use crate::connection::ConnectionTarget;
use crate::db::SqlSession;
use crate::error::{bridge_error, configuration_error, PipelineError, PipelineResult, Stage};
pub use selectors::{clone_namespace, CloneSelection, SchemaGroup};
use selectors::validate_identifier;
use serde::Serialize;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Foreign server settings
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub server_name: String,
    pub fetch_size: u32,
    /// Extensions whose operators may be shipped to the source
    pub remote_extensions: Vec<String>,
    /// Extensions installed in the sandbox besides `postgres_fdw`
    pub auxiliary_extensions: Vec<String>,
    pub keep_connections: bool,
    /// Host the sandbox uses to reach the source; defaults to the target host
    pub host: Option<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            server_name: "source_srv".to_string(),
            fetch_size: 1000,
            remote_extensions: vec!["postgres_fdw".to_string()],
            auxiliary_extensions: vec!["hstore".to_string()],
            keep_connections: true,
            host: None,
        }
    }
}

impl BridgeSettings {
    pub fn validate(&self) -> PipelineResult<()> {
        validate_identifier("server", &self.server_name)?;
        if self.fetch_size == 0 {
            return Err(configuration_error("Bridge fetch size must be positive"));
        }
        for extension in self.remote_extensions.iter().chain(&self.auxiliary_extensions) {
            let valid = !extension.is_empty()
                && extension
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid {
                return Err(configuration_error(format!("Invalid extension name '{}'", extension)));
            }
        }
        Ok(())
    }
}

/// What a successful bridge establishment produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeReport {
    pub server_name: String,
    /// Namespaces in creation order
    pub namespaces: Vec<String>,
    pub imported_schemas: Vec<String>,
    pub imported_tables: Vec<SchemaGroup>,
}

/// Establishes the foreign bridge and populates clone namespaces
pub struct BridgeEstablisher<'a> {
    settings: &'a BridgeSettings,
}

impl<'a> BridgeEstablisher<'a> {
    pub fn new(settings: &'a BridgeSettings) -> Self {
        Self { settings }
    }

    pub async fn establish_and_clone<S: SqlSession + ?Sized>(
        &self,
        session: &S,
        working_user: &str,
        target: &ConnectionTarget,
        selection: &CloneSelection,
        cancel: &CancellationToken,
    ) -> PipelineResult<BridgeReport> {
        self.settings.validate()?;
        validate_identifier("user", working_user)?;

        let mut report = BridgeReport {
            server_name: self.settings.server_name.clone(),
            ..BridgeReport::default()
        };

        let extensions = std::iter::once("postgres_fdw")
            .chain(self.settings.auxiliary_extensions.iter().map(String::as_str));
        for extension in extensions {
            let sql = statements::create_extension(extension);
            self.run(session, &format!("extension {}", extension), &sql, cancel).await?;
        }

        info!(
            "Creating foreign server {} for {}",
            self.settings.server_name,
            target.to_display_string()
        );
        let sql = statements::create_server(self.settings, target);
        self.run(session, "foreign server", &sql, cancel).await?;

        let sql = statements::create_user_mapping(working_user, self.settings, target);
        self.run(session, "user mapping", &sql, cancel).await?;

        let mut prepared: HashSet<String> = HashSet::new();

        for schema in selection.schemas() {
            self.prepare(session, schema, working_user, &mut prepared, &mut report, cancel)
                .await?;

            info!("Importing foreign schema {}", schema);
            let sql = statements::import_schema(schema, &self.settings.server_name);
            self.run(session, &format!("import schema {}", schema), &sql, cancel)
                .await?;
            report.imported_schemas.push(schema.clone());
        }

        for group in selection.schema_groups() {
            self.prepare(session, &group.schema, working_user, &mut prepared, &mut report, cancel)
                .await?;

            info!(
                "Importing {} tables from foreign schema {}",
                group.tables.len(),
                group.schema
            );
            let sql = statements::import_tables(&group, &self.settings.server_name);
            self.run(session, &format!("import tables of {}", group.schema), &sql, cancel)
                .await?;
            report.imported_tables.push(group);
        }

        info!(
            "Foreign bridge ready: {} namespaces ({})",
            report.namespaces.len(),
            report.namespaces.join(", ")
        );
        Ok(report)
    }

    /// Create and grant the clone namespace once per schema
    async fn prepare<S: SqlSession + ?Sized>(
        &self,
        session: &S,
        schema: &str,
        working_user: &str,
        prepared: &mut HashSet<String>,
        report: &mut BridgeReport,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        if prepared.contains(schema) {
            return Ok(());
        }

        let namespace = clone_namespace(schema);
        for sql in statements::prepare_namespace(schema, working_user) {
            self.run(session, &format!("namespace {}", namespace), &sql, cancel)
                .await?;
        }

        prepared.insert(schema.to_string());
        report.namespaces.push(namespace);
        Ok(())
    }

    async fn run<S: SqlSession + ?Sized>(
        &self,
        session: &S,
        step: &str,
        sql: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        debug!("Bridge step: {}", step);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled { stage: Stage::Bridge }),
            outcome = session.execute(sql) => outcome.map_err(bridge_error(step)),
        }
    }
}
