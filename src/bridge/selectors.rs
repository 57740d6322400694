//! Clone selectors
//!
//! Which source schemas (whole) and tables (named subset) get mirrored into
//! the sandbox, and how table selectors partition into per-schema groups.

use crate::error::{configuration_error, PipelineResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Prefix of every namespace holding cloned objects
pub const CLONE_PREFIX: &str = "clone_";

const MAX_IDENTIFIER_LEN: usize = 63;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern compiles"));

/// Validate a PostgreSQL identifier spliced into DDL
pub fn validate_identifier(kind: &str, name: &str) -> PipelineResult<()> {
    if !IDENTIFIER.is_match(name) {
        return Err(configuration_error(format!(
            "Invalid {} name '{}'. Must start with a letter or underscore and contain only letters, digits, underscores or dollar signs.",
            kind, name
        )));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(configuration_error(format!(
            "{} name '{}' exceeds {} characters",
            kind, name, MAX_IDENTIFIER_LEN
        )));
    }
    Ok(())
}

/// Namespace inside the sandbox holding the clone of `schema`
pub fn clone_namespace(schema: &str) -> String {
    format!("{}{}", CLONE_PREFIX, schema)
}

/// The clone namespace must fit the identifier limit too, or Postgres
/// truncates it and two long schemas can share one namespace
fn validate_clone_namespace(schema: &str) -> PipelineResult<()> {
    let namespace = clone_namespace(schema);
    if namespace.len() > MAX_IDENTIFIER_LEN {
        return Err(configuration_error(format!(
            "Clone namespace '{}' for schema '{}' exceeds {} characters",
            namespace, schema, MAX_IDENTIFIER_LEN
        )));
    }
    Ok(())
}

/// A fully qualified `schema.table` selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSelector {
    pub schema: String,
    pub table: String,
}

impl TableSelector {
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        let mut parts = raw.trim().split('.');
        let (schema, table) = match (parts.next(), parts.next(), parts.next()) {
            (Some(schema), Some(table), None) => (schema.trim(), table.trim()),
            _ => {
                return Err(configuration_error(format!(
                    "Table selector '{}' must be of the form schema.table",
                    raw.trim()
                )))
            }
        };

        validate_identifier("schema", schema)?;
        validate_identifier("table", table)?;
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }
}

impl fmt::Display for TableSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Tables of one source schema imported by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaGroup {
    pub schema: String,
    /// Unique table names in first-seen order
    pub tables: Vec<String>,
}

impl SchemaGroup {
    pub fn namespace(&self) -> String {
        clone_namespace(&self.schema)
    }
}

/// Partition table selectors by schema in a single pass.
///
/// Groups come out ordered by schema name; duplicate tables are coalesced.
pub fn group_tables(selectors: &[TableSelector]) -> Vec<SchemaGroup> {
    let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for selector in selectors {
        let tables = groups.entry(selector.schema.as_str()).or_default();
        if !tables.contains(&selector.table) {
            tables.push(selector.table.clone());
        }
    }

    groups
        .into_iter()
        .map(|(schema, tables)| SchemaGroup {
            schema: schema.to_string(),
            tables,
        })
        .collect()
}

/// The set of schema and table selectors one clone attempt carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloneSelection {
    schemas: Vec<String>,
    tables: Vec<TableSelector>,
}

impl CloneSelection {
    /// Build a selection; an empty combined set is a configuration error
    pub fn new<S, T>(schemas: S, tables: T) -> PipelineResult<Self>
    where
        S: IntoIterator,
        S::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        let mut unique_schemas: Vec<String> = Vec::new();
        for schema in schemas {
            let schema = schema.as_ref().trim();
            if schema.is_empty() {
                continue;
            }
            validate_identifier("schema", schema)?;
            validate_clone_namespace(schema)?;
            if !unique_schemas.iter().any(|s| s == schema) {
                unique_schemas.push(schema.to_string());
            }
        }

        let tables = tables
            .into_iter()
            .filter(|t| !t.as_ref().trim().is_empty())
            .map(|t| TableSelector::parse(t.as_ref()))
            .collect::<PipelineResult<Vec<_>>>()?;
        for table in &tables {
            validate_clone_namespace(&table.schema)?;
        }

        if unique_schemas.is_empty() && tables.is_empty() {
            return Err(configuration_error(
                "No schemas or tables selected for cloning",
            ));
        }

        Ok(Self {
            schemas: unique_schemas,
            tables,
        })
    }

    /// Selection mirroring whole schemas only
    pub fn schema_level<S>(schemas: S) -> PipelineResult<Self>
    where
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        Self::new(schemas, std::iter::empty::<&str>())
    }

    /// Selection importing named tables only
    pub fn table_level<T>(tables: T) -> PipelineResult<Self>
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        Self::new(std::iter::empty::<&str>(), tables)
    }

    /// Split a comma separated list the way operators type it
    pub fn parse_list(input: &str) -> Vec<String> {
        input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn schemas(&self) -> &[String] {
        &self.schemas
    }

    pub fn tables(&self) -> &[TableSelector] {
        &self.tables
    }

    pub fn schema_groups(&self) -> Vec<SchemaGroup> {
        group_tables(&self.tables)
    }

    /// Short human readable summary for logs
    pub fn describe(&self) -> String {
        let tables: Vec<String> = self.tables.iter().map(ToString::to_string).collect();
        format!("schemas [{}], tables [{}]", self.schemas.join(", "), tables.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_duplicate_tables_are_coalesced() {
        let selection = CloneSelection::table_level([
            "public.profiles",
            "crm.accounts",
            "public.orders",
            "public.profiles",
        ])
        .unwrap();

        assert_eq!(
            selection.schema_groups(),
            vec![
                SchemaGroup { schema: "crm".into(), tables: vec!["accounts".into()] },
                SchemaGroup {
                    schema: "public".into(),
                    tables: vec!["profiles".into(), "orders".into()],
                },
            ]
        );
    }

    #[test]
    fn test_group_order_is_stable() {
        let selectors: Vec<TableSelector> = ["b.t2", "a.t1", "b.t1"]
            .iter()
            .map(|s| TableSelector::parse(s).unwrap())
            .collect();
        let first = group_tables(&selectors);
        let second = group_tables(&selectors);
        assert_eq!(first, second);
        assert_eq!(first[0].schema, "a");
        assert_eq!(first[1].tables, vec!["t2".to_string(), "t1".to_string()]);
    }

    #[test]
    fn test_empty_selection_is_configuration_error() {
        let err = CloneSelection::new(Vec::<String>::new(), Vec::<String>::new()).unwrap_err();
        assert!(err.to_string().contains("No schemas or tables"));

        let err = CloneSelection::schema_level([" ", ""]).unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::Configuration(_)));
    }

    #[test]
    fn test_schema_selectors_deduplicated() {
        let selection = CloneSelection::schema_level(["crm", " crm ", "billing"]).unwrap();
        assert_eq!(selection.schemas(), &["crm".to_string(), "billing".to_string()]);
    }

    #[test]
    fn test_overlapping_selectors_are_allowed() {
        let selection = CloneSelection::new(["public"], ["public.profiles"]).unwrap();
        assert_eq!(selection.schemas().len(), 1);
        assert_eq!(selection.tables().len(), 1);
    }

    #[test]
    fn test_malformed_table_selectors() {
        assert!(TableSelector::parse("profiles").is_err());
        assert!(TableSelector::parse("a.b.c").is_err());
        assert!(TableSelector::parse("public.").is_err());
        assert!(TableSelector::parse("public.pro files").is_err());
        assert!(TableSelector::parse("public.x; DROP TABLE y").is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            CloneSelection::parse_list(" crm, billing,, ,public "),
            vec!["crm".to_string(), "billing".to_string(), "public".to_string()]
        );
        assert!(CloneSelection::parse_list("").is_empty());
    }

    #[test]
    fn test_clone_namespace() {
        assert_eq!(clone_namespace("crm"), "clone_crm");
    }

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("schema", "_private$1").is_ok());
        assert!(validate_identifier("schema", "1abc").is_err());
        assert!(validate_identifier("schema", &"a".repeat(64)).is_err());
    }

    #[test]
    fn test_clone_namespace_length_limit() {
        let longest = "s".repeat(MAX_IDENTIFIER_LEN - CLONE_PREFIX.len());
        assert!(CloneSelection::schema_level([longest.as_str()]).is_ok());

        let too_long = "s".repeat(60);
        assert!(validate_identifier("schema", &too_long).is_ok());
        assert!(CloneSelection::schema_level([too_long.as_str()]).is_err());
        assert!(CloneSelection::table_level([format!("{}.accounts", too_long)]).is_err());
    }
}
