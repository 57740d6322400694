//! Foreign bridge DDL
//!
//! Builds the exact statements issued against the sandbox. Identifiers are
//! validated before they reach these builders; option values are quoted.

use super::selectors::{clone_namespace, SchemaGroup};
use super::BridgeSettings;
use crate::connection::ConnectionTarget;

/// Quote a string literal, doubling embedded single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Extension names may contain hyphens (`uuid-ossp`) and then need quoting
fn extension_ident(name: &str) -> String {
    if name.contains('-') {
        format!("\"{}\"", name)
    } else {
        name.to_string()
    }
}

pub fn create_extension(name: &str) -> String {
    format!("CREATE EXTENSION IF NOT EXISTS {};", extension_ident(name))
}

pub fn create_server(settings: &BridgeSettings, target: &ConnectionTarget) -> String {
    let host = settings.host.as_deref().unwrap_or(&target.host);
    let mut options = vec![
        format!("host {}", quote_literal(host)),
        format!("dbname {}", quote_literal(&target.database)),
        format!("port {}", quote_literal(&target.port.to_string())),
        format!("fetch_size {}", quote_literal(&settings.fetch_size.to_string())),
        format!("extensions {}", quote_literal(&settings.remote_extensions.join(","))),
        format!(
            "keep_connections {}",
            quote_literal(if settings.keep_connections { "on" } else { "off" })
        ),
    ];
    if let Some(mode) = &target.ssl_mode {
        options.push(format!("sslmode {}", quote_literal(mode)));
    }

    format!(
        "CREATE SERVER {} FOREIGN DATA WRAPPER postgres_fdw OPTIONS ({});",
        settings.server_name,
        options.join(", ")
    )
}

pub fn create_user_mapping(
    working_user: &str,
    settings: &BridgeSettings,
    target: &ConnectionTarget,
) -> String {
    format!(
        "CREATE USER MAPPING FOR {} SERVER {} OPTIONS (user {}, password {});",
        working_user,
        settings.server_name,
        quote_literal(&target.user),
        quote_literal(&target.password)
    )
}

/// Create the clone namespace of `schema` and open it up to `working_user`
pub fn prepare_namespace(schema: &str, working_user: &str) -> Vec<String> {
    let namespace = clone_namespace(schema);
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {};", namespace),
        format!("GRANT USAGE ON SCHEMA {} TO {};", namespace, working_user),
        format!("GRANT SELECT ON ALL TABLES IN SCHEMA {} TO {};", namespace, working_user),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT SELECT ON TABLES TO {};",
            namespace, working_user
        ),
    ]
}

pub fn import_schema(schema: &str, server_name: &str) -> String {
    format!(
        "IMPORT FOREIGN SCHEMA {} FROM SERVER {} INTO {};",
        schema,
        server_name,
        clone_namespace(schema)
    )
}

pub fn import_tables(group: &SchemaGroup, server_name: &str) -> String {
    format!(
        "IMPORT FOREIGN SCHEMA {} LIMIT TO ({}) FROM SERVER {} INTO {};",
        group.schema,
        group.tables.join(","),
        server_name,
        group.namespace()
    )
}
