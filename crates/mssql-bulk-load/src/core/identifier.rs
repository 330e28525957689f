//! Identifier validation, quoting and multi-part table names.
//!
//! Identifiers cannot be sent as parameters, so every name that ends up in
//! generated SQL goes through [`quote_mssql`]: it rejects suspicious input
//! and wraps the name in brackets with `]` doubled.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BulkLoadError, Result};

/// SQL Server `sysname` length.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Schema used when a table name has a single part.
pub const DEFAULT_SCHEMA: &str = "dbo";

/// Validate an identifier for security issues.
///
/// Rejects empty names, names containing null bytes, and names longer than
/// `sysname`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BulkLoadError::usage("Identifier cannot be empty"));
    }

    if name.contains('\0') {
        return Err(BulkLoadError::usage(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(BulkLoadError::usage(format!(
            "Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("users")?, "[users]");
/// assert_eq!(quote_mssql("table]name")?, "[table]]name]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// A destination table name: `table`, `schema.table` or `db.schema.table`.
///
/// Parts may be bracket-quoted (`[my schema].[my.table]`), in which case
/// dots inside brackets are part of the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub database: Option<String>,
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: None,
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse a possibly qualified, possibly bracket-quoted table name.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(BulkLoadError::usage(
                "The destination table name is missing or empty.",
            ));
        }

        let parts = split_parts(trimmed)?;
        for part in &parts {
            validate_identifier(part)?;
        }

        let mut parts = parts.into_iter();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Ok(Self::new(DEFAULT_SCHEMA, name)),
            (Some(schema), Some(name), None) => Ok(Self::new(schema, name)),
            (Some(database), Some(schema), Some(name)) => Ok(Self {
                database: Some(database),
                schema,
                name,
            }),
            _ => Err(BulkLoadError::usage(format!(
                "Invalid table name '{}': at most three parts are allowed",
                input
            ))),
        }
    }

    /// Bracket-quoted form for generated SQL.
    pub fn quoted(&self) -> Result<String> {
        let qualified = format!("{}.{}", quote_mssql(&self.schema)?, quote_mssql(&self.name)?);
        match &self.database {
            Some(db) => Ok(format!("{}.{}", quote_mssql(db)?, qualified)),
            None => Ok(qualified),
        }
    }

    /// Case-insensitive key used by registries and caches.
    pub fn cache_key(&self) -> String {
        match &self.database {
            Some(db) => format!("{}.{}.{}", db, self.schema, self.name).to_lowercase(),
            None => format!("{}.{}", self.schema, self.name).to_lowercase(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(db) = &self.database {
            write!(f, "{}.", db)?;
        }
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl std::str::FromStr for TableName {
    type Err = BulkLoadError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn split_parts(input: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut in_brackets = false;

    while let Some(c) = chars.next() {
        match c {
            '[' if !in_brackets && current.is_empty() => in_brackets = true,
            ']' if in_brackets => {
                if chars.peek() == Some(&']') {
                    chars.next();
                    current.push(']');
                } else {
                    in_brackets = false;
                }
            }
            '.' if !in_brackets => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }

    if in_brackets {
        return Err(BulkLoadError::usage(format!(
            "Invalid table name '{}': unclosed bracket",
            input
        )));
    }
    parts.push(current);
    Ok(parts.into_iter().map(|p| p.trim().to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_rejects_empty() {
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        assert!(validate_identifier("bad\0name").is_err());
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        assert!(validate_identifier(&"a".repeat(129)).is_err());
        assert!(validate_identifier(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_quote_mssql_escapes_bracket() {
        assert_eq!(quote_mssql("users").unwrap(), "[users]");
        assert_eq!(quote_mssql("table]name").unwrap(), "[table]]name]");
    }

    #[test]
    fn test_parse_single_part_uses_default_schema() {
        let t = TableName::parse("orders").unwrap();
        assert_eq!(t.schema, "dbo");
        assert_eq!(t.name, "orders");
        assert_eq!(t.quoted().unwrap(), "[dbo].[orders]");
    }

    #[test]
    fn test_parse_bracketed_parts_with_dots() {
        let t = TableName::parse("[sales data].[my.table]").unwrap();
        assert_eq!(t.schema, "sales data");
        assert_eq!(t.name, "my.table");
        assert_eq!(t.quoted().unwrap(), "[sales data].[my.table]");
    }

    #[test]
    fn test_parse_escaped_bracket() {
        let t = TableName::parse("dbo.[a]]b]").unwrap();
        assert_eq!(t.name, "a]b");
        assert_eq!(t.quoted().unwrap(), "[dbo].[a]]b]");
    }

    #[test]
    fn test_parse_three_parts() {
        let t = TableName::parse("warehouse.stage.items").unwrap();
        assert_eq!(t.database.as_deref(), Some("warehouse"));
        assert_eq!(t.to_string(), "warehouse.stage.items");
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        assert!(TableName::parse("").is_err());
        assert!(TableName::parse("   ").is_err());
        assert!(TableName::parse("a.b.c.d").is_err());
        assert!(TableName::parse("[unclosed").is_err());
        assert!(TableName::parse("dbo.").is_err());
    }

    #[test]
    fn test_cache_key_is_case_insensitive() {
        let a = TableName::parse("DBO.Orders").unwrap();
        let b = TableName::parse("dbo.orders").unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
    }
}
