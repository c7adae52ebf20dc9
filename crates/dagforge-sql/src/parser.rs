//! SQL parsing using datafusion-sqlparser-rs
//!
//! Parses compiled SQL into an AST and provides error handling with diagnostics.

use dagforge_core::{Diagnostic, DiagnosticCode, Location, Severity};
use sqlparser::ast::{Query, Statement};
use sqlparser::dialect::{BigQueryDialect, Dialect, GenericDialect, PostgreSqlDialect, SnowflakeDialect};
use sqlparser::parser::{Parser, ParserError};

/// SQL parser with configurable dialect
pub struct SqlParser {
    dialect: Box<dyn Dialect>,
}

impl SqlParser {
    /// Create a new SQL parser with the default (generic) dialect
    pub fn new() -> Self {
        Self {
            dialect: Box::new(GenericDialect {}),
        }
    }

    /// Create a SQL parser for BigQuery
    pub fn bigquery() -> Self {
        Self {
            dialect: Box::new(BigQueryDialect {}),
        }
    }

    /// Create a SQL parser for PostgreSQL
    pub fn postgres() -> Self {
        Self {
            dialect: Box::new(PostgreSqlDialect {}),
        }
    }

    /// Create a SQL parser for Snowflake
    pub fn snowflake() -> Self {
        Self {
            dialect: Box::new(SnowflakeDialect {}),
        }
    }

    /// Pick a dialect from the target's adapter type; unknown adapters use
    /// the generic dialect
    pub fn for_adapter(adapter_type: &str) -> Self {
        match adapter_type {
            "bigquery" => Self::bigquery(),
            "snowflake" => Self::snowflake(),
            "postgres" | "redshift" => Self::postgres(),
            _ => Self::new(),
        }
    }

    /// Parse SQL string into AST
    pub fn parse(&self, sql: &str, file_path: Option<&str>) -> Result<ParsedSql, ParseError> {
        match Parser::parse_sql(&*self.dialect, sql) {
            Ok(statements) => Ok(ParsedSql {
                sql: sql.to_string(),
                statements,
            }),
            Err(error) => Err(ParseError {
                error,
                file_path: file_path.map(str::to_string),
            }),
        }
    }
}

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Successfully parsed SQL with AST
#[derive(Debug, Clone)]
pub struct ParsedSql {
    /// Original SQL string
    pub sql: String,

    /// Parsed statements
    pub statements: Vec<Statement>,
}

impl ParsedSql {
    /// Get the first statement (most common for models)
    pub fn first_statement(&self) -> Option<&Statement> {
        self.statements.first()
    }

    /// The last statement; a model's query follows any header statements
    pub fn last_statement(&self) -> Option<&Statement> {
        self.statements.last()
    }

    /// Get the query if the last statement is a SELECT
    pub fn as_query(&self) -> Option<&Query> {
        match self.last_statement() {
            Some(Statement::Query(query)) => Some(query.as_ref()),
            _ => None,
        }
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }
}

/// SQL parsing error with diagnostic information
#[derive(Debug)]
pub struct ParseError {
    /// Parser error from sqlparser
    pub error: ParserError,

    /// Source file path
    pub file_path: Option<String>,
}

impl ParseError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::new(
            DiagnosticCode::SqlParseError,
            Severity::Error,
            format!("Failed to parse SQL: {}", self.error),
        );
        match &self.file_path {
            Some(path) => diag.with_location(Location::new(path.clone())),
            None => diag,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SQL parse error: {}", self.error)
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_select() {
        let parsed = SqlParser::new()
            .parse("SELECT id, name FROM users WHERE active = true", None)
            .unwrap();
        assert_eq!(parsed.statement_count(), 1);
        assert!(parsed.as_query().is_some());
    }

    #[test]
    fn parse_with_cte() {
        let sql = r#"
            with __dbt__CTE__base as (select * from users)
            select id from __dbt__CTE__base
        "#;
        assert!(SqlParser::postgres().parse(sql, None).unwrap().as_query().is_some());
    }

    #[test]
    fn parse_invalid_sql() {
        let error = SqlParser::new().parse("SELECT FROM WHERE", Some("models/bad.sql")).unwrap_err();
        let diag = error.to_diagnostic();
        assert_eq!(diag.code, DiagnosticCode::SqlParseError);
        assert_eq!(diag.location.unwrap().file, "models/bad.sql");
    }

    #[test]
    fn dialect_by_adapter() {
        for adapter in ["postgres", "snowflake", "bigquery", "duckdb"] {
            assert!(SqlParser::for_adapter(adapter).parse("SELECT id FROM users", None).is_ok());
        }
    }
}
