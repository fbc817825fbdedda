//! Read-only gate for model-authored SQL.
//!
//! Every query-tool call passes through [`SqlGuard::validate`] before it is
//! dispatched. The query is parsed for the configured dialect, every statement
//! is walked for write or DDL nodes, the first statement's root must be a
//! select-family or metadata statement, and the re-rendered text replaces the
//! model's original input.

use std::fmt;
use std::ops::ControlFlow;

use sqlparser::ast::{visit_statements, Query, SetExpr, Statement, Visit, Visitor};
use sqlparser::dialect::dialect_from_str;
use sqlparser::parser::Parser;
use thiserror::Error;

/// Prefix of every tool result produced for a rejected query.
pub const SAFETY_VIOLATION_MARKER: &str = "[SQL SAFETY VIOLATION]";

pub const READ_ONLY_ERROR: &str =
    "query must be a read-only statement (SELECT, DESCRIBE, SHOW or EXPLAIN)";

const METADATA_KEYWORDS: [(&str, StatementKind); 4] = [
    ("DESCRIBE", StatementKind::Describe),
    ("DESC", StatementKind::Describe),
    ("SHOW", StatementKind::Show),
    ("EXPLAIN", StatementKind::Explain),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("unsupported SQL dialect `{0}`")]
    UnknownDialect(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForbiddenOp {
    Drop,
    Delete,
    Insert,
    Update,
    Merge,
    Alter,
    Create,
    Grant,
    Revoke,
    Truncate,
    Attach,
    Lock,
    Comment,
    /// `SELECT ... FOR UPDATE` and friends, carrying the lock clause.
    LockingRead(String),
    /// Administrative or procedural statement, named by its leading keyword.
    Command(String),
}

impl fmt::Display for ForbiddenOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Drop => "DROP",
            Self::Delete => "DELETE",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Merge => "MERGE",
            Self::Alter => "ALTER",
            Self::Create => "CREATE",
            Self::Grant => "GRANT",
            Self::Revoke => "REVOKE",
            Self::Truncate => "TRUNCATE",
            Self::Attach => "ATTACH",
            Self::Lock => "LOCK",
            Self::Comment => "COMMENT",
            Self::LockingRead(clause) => return write!(f, "LOCKING READ ({clause})"),
            Self::Command(keyword) => return write!(f, "COMMAND ({keyword})"),
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    /// UNION, EXCEPT or INTERSECT.
    SetOperation,
    Describe,
    Show,
    Explain,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::SetOperation => "set_operation",
            Self::Describe => "describe",
            Self::Show => "show",
            Self::Explain => "explain",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_safe: bool,
    pub normalized_query: Option<String>,
    pub error: Option<String>,
    pub kind: Option<StatementKind>,
}

impl ValidationResult {
    fn accepted(normalized_query: String, kind: StatementKind) -> Self {
        Self { is_safe: true, normalized_query: Some(normalized_query), error: None, kind: Some(kind) }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self { is_safe: false, normalized_query: None, error: Some(error.into()), kind: None }
    }

    /// Tool-result text for a rejected query.
    pub fn violation_message(&self) -> String {
        let reason = self.error.as_deref().unwrap_or(READ_ONLY_ERROR);
        format!("{SAFETY_VIOLATION_MARKER} {reason}")
    }
}

/// Stateless validator bound to one SQL dialect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqlGuard {
    dialect: String,
}

impl SqlGuard {
    pub fn new(dialect: impl Into<String>) -> Result<Self, GuardError> {
        let dialect = dialect.into().trim().to_ascii_lowercase();
        if dialect_from_str(&dialect).is_none() {
            return Err(GuardError::UnknownDialect(dialect));
        }
        Ok(Self { dialect })
    }

    pub fn dialect(&self) -> &str {
        &self.dialect
    }

    pub fn validate(&self, raw_query: &str) -> ValidationResult {
        let Some(dialect) = dialect_from_str(&self.dialect) else {
            return ValidationResult::rejected(format!("unsupported SQL dialect `{}`", self.dialect));
        };

        let statements = match Parser::parse_sql(&*dialect, raw_query) {
            Ok(statements) => statements,
            Err(error) => return ValidationResult::rejected(format!("SQL parse error: {error}")),
        };

        let Some(first) = statements.first() else {
            return ValidationResult::rejected("no SQL statement could be parsed");
        };

        // Trailing statements are never emitted, but they are still inspected so
        // a write cannot hide behind a harmless first statement.
        if let Some(op) = statements.iter().find_map(find_forbidden) {
            return ValidationResult::rejected(format!("forbidden operation detected: {op}"));
        }

        let normalized = first.to_string();
        match classify_root(first, &normalized) {
            Some(kind) => ValidationResult::accepted(normalized, kind),
            None => ValidationResult::rejected(READ_ONLY_ERROR),
        }
    }
}

fn find_forbidden(statement: &Statement) -> Option<ForbiddenOp> {
    let nested = visit_statements(statement, |node| match forbidden_op(node) {
        Some(op) => ControlFlow::Break(op),
        None => ControlFlow::Continue(()),
    });
    if let ControlFlow::Break(op) = nested {
        return Some(op);
    }
    if let ControlFlow::Break(clause) = statement.visit(&mut LockClauseFinder) {
        return Some(ForbiddenOp::LockingRead(clause));
    }

    match statement {
        Statement::Query(query) if selects_into(&query.body) => Some(ForbiddenOp::Create),
        _ => None,
    }
}

fn forbidden_op(statement: &Statement) -> Option<ForbiddenOp> {
    let op = match statement {
        Statement::Drop { .. } | Statement::DropFunction { .. } | Statement::DropProcedure { .. } => {
            ForbiddenOp::Drop
        }
        Statement::Delete { .. } => ForbiddenOp::Delete,
        Statement::Insert { .. } => ForbiddenOp::Insert,
        Statement::Update { .. } => ForbiddenOp::Update,
        Statement::Merge { .. } => ForbiddenOp::Merge,
        Statement::AlterTable { .. }
        | Statement::AlterView { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterRole { .. } => ForbiddenOp::Alter,
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateRole { .. }
        | Statement::CreateSequence { .. } => ForbiddenOp::Create,
        Statement::Grant { .. } => ForbiddenOp::Grant,
        Statement::Revoke { .. } => ForbiddenOp::Revoke,
        Statement::Truncate { .. } => ForbiddenOp::Truncate,
        Statement::AttachDatabase { .. } => ForbiddenOp::Attach,
        Statement::LockTables { .. } => ForbiddenOp::Lock,
        Statement::Comment { .. } => ForbiddenOp::Comment,
        Statement::Kill { .. }
        | Statement::Call { .. }
        | Statement::Copy { .. }
        | Statement::Execute { .. } => ForbiddenOp::Command(leading_keyword(&statement.to_string())),
        _ => return None,
    };
    Some(op)
}

/// Finds row locks at any query depth, subqueries and CTEs included.
struct LockClauseFinder;

impl Visitor for LockClauseFinder {
    type Break = String;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        match query.locks.first() {
            Some(lock) => ControlFlow::Break(lock.to_string()),
            None => ControlFlow::Continue(()),
        }
    }
}

fn selects_into(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_some(),
        SetExpr::Query(query) => selects_into(&query.body),
        SetExpr::SetOperation { left, right, .. } => selects_into(left) || selects_into(right),
        _ => false,
    }
}

fn classify_root(statement: &Statement, normalized: &str) -> Option<StatementKind> {
    let kind = match statement {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::SetOperation { .. } => StatementKind::SetOperation,
            SetExpr::Select(_) | SetExpr::Query(_) | SetExpr::Values(_) | SetExpr::Table(_) => {
                StatementKind::Select
            }
            _ => return None,
        },
        Statement::ExplainTable { .. } => StatementKind::Describe,
        Statement::Explain { .. } => StatementKind::Explain,
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowCollation { .. } => StatementKind::Show,
        _ => return metadata_keyword(normalized),
    };
    Some(kind)
}

/// Allow-list for statements the parser models generically.
fn metadata_keyword(normalized: &str) -> Option<StatementKind> {
    let keyword = leading_keyword(normalized);
    METADATA_KEYWORDS
        .iter()
        .find(|(candidate, _)| *candidate == keyword)
        .map(|(_, kind)| kind.clone())
}

fn leading_keyword(sql: &str) -> String {
    sql.split_whitespace().next().unwrap_or_default().to_ascii_uppercase()
}
