//! Table name validation.
//!
//! Table names are interpolated into `SELECT` and `INSERT` statements, so
//! they are restricted to plain (optionally schema-qualified) identifiers.

use std::fmt;
use std::str::FromStr;

/// Maximum identifier length accepted by PostgreSQL.
const MAX_IDENTIFIER_LEN: usize = 63;

/// A validated `[schema.]table` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    /// Parses and validates a table name.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let mut parts = raw.split('.');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(format!(
                "table name '{}' has more than one schema qualifier",
                raw
            ));
        }

        match second {
            Some(name) => {
                validate_identifier(first)?;
                validate_identifier(name)?;
                Ok(Self {
                    schema: Some(first.to_string()),
                    name: name.to_string(),
                })
            }
            None => {
                validate_identifier(first)?;
                Ok(Self {
                    schema: None,
                    name: first.to_string(),
                })
            }
        }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for TableName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validates a single unquoted SQL identifier.
pub fn validate_identifier(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("identifier must not be empty".to_string());
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(format!(
            "identifier '{}' exceeds maximum length of {} bytes (got {})",
            name,
            MAX_IDENTIFIER_LEN,
            name.len()
        ));
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(format!(
                "identifier must start with a letter or underscore, got '{}'",
                first
            ));
        }
    }

    for ch in chars {
        if !ch.is_ascii_alphanumeric() && ch != '_' {
            return Err(format!("identifier contains invalid character '{}'", ch));
        }
    }

    Ok(())
}
