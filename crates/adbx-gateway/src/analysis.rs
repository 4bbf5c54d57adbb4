//! SQL policy analysis.
//!
//! Parses one statement with `sqlparser` and decides, before anything runs:
//! - whether the profile's role admits the statement kind
//! - whether it calls any function marked unsafe
//! - whether every reference to a sensitive column is covered
//! - which output columns must be tokenized
//!
//! A sensitive reference is covered when it sits inside an approved function
//! that is itself a top-level projection item; that column's output is then
//! tokenized. With token parameters, `col = ?N` and `col IN (?N, ..)` in a
//! WHERE clause also cover `col`, since the bound value came from a token the
//! caller already holds. A parameter anywhere else is rejected: it would bind
//! a raw value the caller could read back or match guesses against.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, visit_relations, BinaryOperator, Delete, Expr, Function, Ident, SelectItem,
    SetExpr, Statement, Value,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use adbx_core::config::Role;

use crate::profile::ConnectionProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputColumn {
    Plain,
    Tokenized,
}

/// What the gateway needs to know to run and post-process a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub kind: StatementKind,
    /// One entry per projection item, in order. Empty for non-queries.
    pub outputs: Vec<OutputColumn>,
}

impl QueryPlan {
    pub fn output(&self, index: usize) -> OutputColumn {
        self.outputs.get(index).copied().unwrap_or(OutputColumn::Plain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("cannot parse statement: {0}")]
    Parse(String),
    #[error("expected exactly one statement, got {0}")]
    StatementCount(usize),
    #[error("role {role:?} does not allow {statement} statements")]
    RoleForbids { role: Role, statement: &'static str },
    #[error("function {0} is not allowed")]
    UnsafeFunction(String),
    #[error("column {0} is sensitive; read it through an approved function")]
    SensitiveColumn(String),
    #[error("parameter {0} must be compared with = or IN against a sensitive column in WHERE")]
    MisplacedParameter(String),
    #[error("{0}")]
    Policy(&'static str),
}

/// Analyse `sql` against `profile`. `token_filters` enables the `col = ?N`
/// coverage used by token-parameter queries.
pub fn analyze(sql: &str, profile: &ConnectionProfile, token_filters: bool) -> Result<QueryPlan, AnalysisError> {
    let statements =
        Parser::parse_sql(&SQLiteDialect {}, sql).map_err(|e| AnalysisError::Parse(e.to_string()))?;
    if statements.len() != 1 {
        return Err(AnalysisError::StatementCount(statements.len()));
    }
    let statement = &statements[0];

    let (kind, label) = classify(statement);
    check_role(profile.role, kind, label)?;

    let relations = relations_of(statement);

    // Unsafe functions anywhere, and every sensitive reference in order.
    let mut sensitive_refs: Vec<String> = Vec::new();
    let flow = visit_expressions(statement, |expr| {
        match expr {
            Expr::Function(f) => {
                let name = function_name(f);
                if profile.is_unsafe(&name) {
                    return ControlFlow::Break(AnalysisError::UnsafeFunction(name));
                }
            }
            _ => {
                if let Some(rule) = column_of(expr).and_then(|c| profile.sensitive_rule(&c.value, &relations)) {
                    sensitive_refs.push(rule.to_string());
                }
            }
        }
        ControlFlow::Continue(())
    });
    if let ControlFlow::Break(e) = flow {
        return Err(e);
    }

    let mut covered: HashMap<String, usize> = HashMap::new();
    let mut outputs = Vec::new();
    let mut has_wildcard = false;

    if let Statement::Query(query) = statement {
        if let SetExpr::Select(select) = query.body.as_ref() {
            for item in &select.projection {
                let expr = match item {
                    SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => e,
                    SelectItem::Wildcard(..) | SelectItem::QualifiedWildcard(..) => {
                        has_wildcard = true;
                        outputs.push(OutputColumn::Plain);
                        continue;
                    }
                };
                let refs = approved_call(expr, profile)
                    .map(|call| sensitive_refs_in(call, profile, &relations))
                    .unwrap_or_default();
                if refs.is_empty() {
                    outputs.push(OutputColumn::Plain);
                } else {
                    for r in refs {
                        *covered.entry(r).or_default() += 1;
                    }
                    outputs.push(OutputColumn::Tokenized);
                }
            }
        }
    }

    if token_filters {
        let filters = placeholder_filters(statement, profile, &relations);
        check_placeholders(statement, &filters.accepted)?;
        for r in filters.covered {
            *covered.entry(r).or_default() += 1;
        }
    }

    if has_wildcard {
        if let Some(rule) = profile.sensitive.iter().find(|r| r.applies_to(&relations)) {
            return Err(AnalysisError::SensitiveColumn(rule.to_string()));
        }
        if outputs.contains(&OutputColumn::Tokenized) {
            return Err(AnalysisError::Policy("wildcards cannot be combined with tokenized columns"));
        }
    }

    for r in sensitive_refs {
        match covered.get_mut(&r) {
            Some(n) if *n > 0 => *n -= 1,
            _ => return Err(AnalysisError::SensitiveColumn(r)),
        }
    }

    Ok(QueryPlan { kind, outputs })
}

fn classify(statement: &Statement) -> (StatementKind, &'static str) {
    match statement {
        Statement::Query(_) => (StatementKind::Read, "query"),
        Statement::Insert(_) => (StatementKind::Write, "insert"),
        Statement::Update { .. } => (StatementKind::Write, "update"),
        Statement::Delete(_) => (StatementKind::Write, "delete"),
        _ => (StatementKind::Admin, "administrative"),
    }
}

fn check_role(role: Role, kind: StatementKind, label: &'static str) -> Result<(), AnalysisError> {
    let allowed = match role {
        Role::ReadOnly => kind == StatementKind::Read,
        Role::ReadWrite => kind != StatementKind::Admin,
        Role::Admin => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(AnalysisError::RoleForbids { role, statement: label })
    }
}

/// Lower-cased, unqualified names of every table the statement touches.
fn relations_of(statement: &Statement) -> HashSet<String> {
    let mut relations = HashSet::new();
    let _ = visit_relations(statement, |name| {
        if let Some(last) = name.0.last() {
            relations.insert(last.value.to_ascii_lowercase());
        }
        ControlFlow::<()>::Continue(())
    });
    relations
}

/// Last segment of a function name, lower-cased: `main.Foo` -> `foo`.
fn function_name(f: &Function) -> String {
    f.name
        .0
        .last()
        .map(|i| i.value.to_ascii_lowercase())
        .unwrap_or_default()
}

/// The column an identifier expression names, ignoring any qualifier.
fn column_of(expr: &Expr) -> Option<&Ident> {
    match expr {
        Expr::Identifier(ident) => Some(ident),
        Expr::CompoundIdentifier(parts) => parts.last(),
        _ => None,
    }
}

/// The approved function call a projection item consists of, if it is one.
fn approved_call<'a>(expr: &'a Expr, profile: &ConnectionProfile) -> Option<&'a Expr> {
    let mut inner = expr;
    while let Expr::Nested(e) = inner {
        inner = e.as_ref();
    }
    match inner {
        Expr::Function(f) if profile.is_approved(&function_name(f)) => Some(inner),
        _ => None,
    }
}

fn sensitive_refs_in(expr: &Expr, profile: &ConnectionProfile, relations: &HashSet<String>) -> Vec<String> {
    let mut refs = Vec::new();
    let _ = visit_expressions(expr, |e| {
        if let Some(rule) = column_of(e).and_then(|c| profile.sensitive_rule(&c.value, relations)) {
            refs.push(rule.to_string());
        }
        ControlFlow::<()>::Continue(())
    });
    refs
}

/// Placeholders in filter position and the sensitive columns they cover.
#[derive(Debug, Default)]
struct PlaceholderFilters {
    accepted: Vec<String>,
    covered: Vec<String>,
}

/// `col = ?N`, `?N = col` and `col IN (?N, ..)` in a WHERE clause, where
/// `col` is sensitive.
fn placeholder_filters(statement: &Statement, profile: &ConnectionProfile, relations: &HashSet<String>) -> PlaceholderFilters {
    let mut found = PlaceholderFilters::default();
    for filter in where_clauses(statement) {
        let _ = visit_expressions(filter, |e| {
            let (col, params): (Option<&Ident>, Vec<&str>) = match e {
                Expr::BinaryOp { left, op: BinaryOperator::Eq, right } => match (left.as_ref(), right.as_ref()) {
                    (col, Expr::Value(Value::Placeholder(p))) | (Expr::Value(Value::Placeholder(p)), col) => {
                        (column_of(col), vec![p.as_str()])
                    }
                    _ => (None, Vec::new()),
                },
                Expr::InList { expr, list, negated: false } => {
                    let params: Vec<&str> = list.iter().filter_map(placeholder_of).collect();
                    if params.len() == list.len() {
                        (column_of(expr), params)
                    } else {
                        (None, Vec::new())
                    }
                }
                _ => (None, Vec::new()),
            };
            if params.is_empty() {
                return ControlFlow::<()>::Continue(());
            }
            if let Some(rule) = col.and_then(|c| profile.sensitive_rule(&c.value, relations)) {
                found.covered.push(rule.to_string());
                found.accepted.extend(params.into_iter().map(str::to_string));
            }
            ControlFlow::Continue(())
        });
    }
    found
}

/// Every placeholder in the statement must be one of `accepted`, counting
/// repeats: `?1` used twice needs two accepted uses.
fn check_placeholders(statement: &Statement, accepted: &[String]) -> Result<(), AnalysisError> {
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for p in accepted {
        *remaining.entry(p.as_str()).or_default() += 1;
    }
    let flow = visit_expressions(statement, |e| {
        if let Some(p) = placeholder_of(e) {
            match remaining.get_mut(p) {
                Some(n) if *n > 0 => *n -= 1,
                _ => return ControlFlow::Break(AnalysisError::MisplacedParameter(p.to_string())),
            }
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(e) => Err(e),
        ControlFlow::Continue(()) => Ok(()),
    }
}

fn placeholder_of(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Value(Value::Placeholder(p)) => Some(p.as_str()),
        _ => None,
    }
}

/// Top-level WHERE clauses, including each arm of a compound query.
fn where_clauses(statement: &Statement) -> Vec<&Expr> {
    fn from_set_expr<'a>(body: &'a SetExpr, out: &mut Vec<&'a Expr>) {
        match body {
            SetExpr::Select(select) => out.extend(select.selection.as_ref()),
            SetExpr::Query(query) => from_set_expr(&query.body, out),
            SetExpr::SetOperation { left, right, .. } => {
                from_set_expr(left, out);
                from_set_expr(right, out);
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    match statement {
        Statement::Query(query) => from_set_expr(&query.body, &mut out),
        Statement::Update { selection, .. } => out.extend(selection.as_ref()),
        Statement::Delete(Delete { selection, .. }) => out.extend(selection.as_ref()),
        _ => {}
    }
    out
}
