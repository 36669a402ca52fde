//! Value-dependent checks attached to rule nodes.
//!
//! Besides `DROP` and `ACCEPT`, an annotation may name functions that compare
//! values from the incoming query against values from the caller's claims.
//! The only function with an effect is `$dropIf`: when one of its comparisons
//! holds, the request is refused with a message describing the comparison.
//!
//! ```text
//! # {"$dropIf": [{"roles": ["customer"], "$eq": {"id": "userClaims.uid"}}]}
//! ```
//!
//! Each entry lists the roles it applies to, then any number of operators.
//! Under an operator, keys are paths relative to the annotated node's parent
//! in the query tree and values are dotted references into the caller's
//! validation parameters.
//!
//! # Operators
//!
//! - `$eq` - query value equals the reference
//! - `$neq` - query value differs from the reference
//! - `$gt`, `$gte`, `$lt`, `$lte` - ordered comparisons
//!
//! Numbers compare numerically, strings lexicographically and booleans with
//! `false < true`. Missing values on either side count as `null`. Values of
//! different kinds are never equal and never ordered.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{trace, warn};

use crate::claims::Caller;
use crate::policy::RoleSet;
use crate::tree::{parse_relative, Facet, Tree, TreePath};

static NULL: Value = Value::Null;

/// A function with a built-in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Function {
    /// Deny the request when a comparison holds.
    DropIf,
}

impl Function {
    /// Resolves an annotation key such as `$dropIf`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "$dropIf" => Some(Function::DropIf),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::DropIf => "$dropIf",
        }
    }
}

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    /// Resolves an annotation key such as `$gte`.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$eq" => Some(Operator::Eq),
            "$neq" => Some(Operator::Neq),
            "$gt" => Some(Operator::Gt),
            "$gte" => Some(Operator::Gte),
            "$lt" => Some(Operator::Lt),
            "$lte" => Some(Operator::Lte),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Operator::Eq => "$eq",
            Operator::Neq => "$neq",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
        }
    }

    /// Applies the operator with the query value on the left.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldgate::Operator;
    /// use serde_json::json;
    ///
    /// assert!(Operator::Eq.apply(&json!(1234), &json!(1234.0)));
    /// assert!(Operator::Lt.apply(&json!("abc"), &json!("abd")));
    /// assert!(!Operator::Gt.apply(&json!("10"), &json!(9)));
    /// assert!(Operator::Neq.apply(&json!("10"), &json!(10)));
    /// ```
    pub fn apply(self, left: &Value, right: &Value) -> bool {
        let ordering = compare(left, right);
        match self {
            Operator::Eq => ordering == Some(Ordering::Equal),
            Operator::Neq => ordering != Some(Ordering::Equal),
            Operator::Gt => ordering == Some(Ordering::Greater),
            Operator::Gte => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            Operator::Lt => ordering == Some(Ordering::Less),
            Operator::Lte => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        }
    }

    fn describe(self, path: &TreePath, operand: &Value) -> String {
        let operand = match operand {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match self {
            Operator::Eq => format!("Input type \"{path}\" value can't match value \"{operand}\""),
            Operator::Neq => {
                format!("Input type \"{path}\" value doesn't match expected value \"{operand}\"")
            }
            Operator::Gt => format!("Input type \"{path}\" value can't be > \"{operand}\""),
            Operator::Gte => format!("Input type \"{path}\" value can't be >= \"{operand}\""),
            Operator::Lt => format!("Input type \"{path}\" value can't be < \"{operand}\""),
            Operator::Lte => format!("Input type \"{path}\" value can't be <= \"{operand}\""),
        }
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// One comparison: the query value at `path` against the claim at `reference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub operator: Operator,
    pub path: String,
    pub reference: String,
}

impl Clause {
    pub fn new(operator: Operator, path: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            operator,
            path: path.into(),
            reference: reference.into(),
        }
    }

    /// Applies the clause to one resolved query value, returning the failure message if any.
    fn check(&self, function: Function, path: &TreePath, left: &Value, right: &Value) -> Option<String> {
        let holds = self.operator.apply(left, right);
        trace!(%path, operator = self.operator.key(), %left, %right, holds, "evaluated clause");
        match function {
            Function::DropIf if holds => Some(self.operator.describe(path, right)),
            Function::DropIf => None,
        }
    }
}

/// A role-scoped group of comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionEntry {
    roles: RoleSet,
    clauses: Vec<Clause>,
}

impl FunctionEntry {
    pub fn new(roles: RoleSet, clauses: Vec<Clause>) -> Self {
        Self { roles, clauses }
    }

    pub fn roles(&self) -> &RoleSet {
        &self.roles
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// An entry applies when it names the wildcard or every one of the caller's roles.
    pub fn applies_to<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        self.roles.has_wildcard() || roles.iter().all(|role| self.roles.contains(role.as_ref()))
    }
}

/// The functions attached to one rule node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionConfig {
    functions: BTreeMap<Function, Vec<FunctionEntry>>,
}

impl FunctionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry under `function`.
    pub fn with_entry(mut self, function: Function, entry: FunctionEntry) -> Self {
        self.push(function, entry);
        self
    }

    pub(crate) fn push(&mut self, function: Function, entry: FunctionEntry) {
        self.functions.entry(function).or_default().push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn entries(&self, function: Function) -> &[FunctionEntry] {
        self.functions.get(&function).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Runs every applicable entry and returns one message per failed check.
    ///
    /// Clause paths are resolved against `scope`, the exact query path of the
    /// annotated node's parent. A leading bare name takes `facet`, the facet
    /// the annotated node itself sits on. Field names in a clause path match
    /// aliased selections of that field too; each match is checked and
    /// reported by its exact path. A path with no match compares `null`.
    pub fn evaluate(&self, query: &Tree, scope: &TreePath, facet: Facet, caller: &Caller) -> Vec<String> {
        let base = query.get(scope);
        let mut messages = Vec::new();
        for (function, entries) in &self.functions {
            for entry in entries.iter().filter(|entry| entry.applies_to(caller.roles())) {
                for clause in entry.clauses() {
                    let Some(relative) = parse_relative(&clause.path, facet) else {
                        warn!(path = %clause.path, function = function.name(), "invalid relative path in function; skipped");
                        continue;
                    };
                    let right = caller.lookup(&clause.reference).unwrap_or(&NULL);
                    let found = base.map(|base| base.resolve(&relative)).unwrap_or_default();
                    if found.is_empty() {
                        messages.extend(clause.check(*function, &scope.join(&relative), &NULL, right));
                    }
                    for (segments, node) in found {
                        let left = node.value().unwrap_or(&NULL);
                        messages.extend(clause.check(*function, &scope.join(&segments), left, right));
                    }
                }
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::query_tree;
    use crate::builder::Variables;
    use serde_json::json;

    fn drop_if(roles: &[&str], clauses: Vec<Clause>) -> FunctionConfig {
        FunctionConfig::new().with_entry(
            Function::DropIf,
            FunctionEntry::new(roles.iter().copied().collect(), clauses),
        )
    }

    fn books_scope() -> TreePath {
        TreePath::parse("query.$out.books").unwrap()
    }

    #[test]
    fn test_drop_if_eq_matches() {
        let query = query_tree("{ books(id: 1234) }", &Variables::new()).unwrap();
        let config = drop_if(&["customer"], vec![Clause::new(Operator::Eq, "id", "userClaims.uid")]);
        let caller = Caller::new(["customer"]).with_claim("uid", 1234);

        let messages = config.evaluate(&query, &books_scope(), Facet::Input, &caller);
        assert_eq!(
            messages,
            vec!["Input type \"query.$out.books.$in.id\" value can't match value \"1234\"".to_string()]
        );
    }

    #[test]
    fn test_drop_if_eq_does_not_match() {
        let query = query_tree("{ books(id: 1234) }", &Variables::new()).unwrap();
        let config = drop_if(&["customer"], vec![Clause::new(Operator::Eq, "id", "userClaims.uid")]);
        let caller = Caller::new(["customer"]).with_claim("uid", 9999);

        assert!(config.evaluate(&query, &books_scope(), Facet::Input, &caller).is_empty());
    }

    #[test]
    fn test_entry_requires_every_caller_role() {
        let query = query_tree("{ books(id: 1) }", &Variables::new()).unwrap();
        let config = drop_if(&["customer"], vec![Clause::new(Operator::Eq, "id", "userClaims.uid")]);

        let admin = Caller::new(["customer", "admin"]).with_claim("uid", 1);
        assert!(config.evaluate(&query, &books_scope(), Facet::Input, &admin).is_empty());

        let everyone = drop_if(&["*"], vec![Clause::new(Operator::Eq, "id", "userClaims.uid")]);
        assert_eq!(everyone.evaluate(&query, &books_scope(), Facet::Input, &admin).len(), 1);
    }

    #[test]
    fn test_missing_values_count_as_null() {
        let query = query_tree("{ books(title: \"x\") }", &Variables::new()).unwrap();
        let caller = Caller::new(["customer"]);

        let eq = drop_if(&["*"], vec![Clause::new(Operator::Eq, "id", "userClaims.uid")]);
        assert_eq!(
            eq.evaluate(&query, &books_scope(), Facet::Input, &caller),
            vec!["Input type \"query.$out.books.$in.id\" value can't match value \"null\"".to_string()]
        );

        let gt = drop_if(&["*"], vec![Clause::new(Operator::Gt, "id", "userClaims.uid")]);
        assert!(gt.evaluate(&query, &books_scope(), Facet::Input, &caller).is_empty());
    }

    #[test]
    fn test_relative_path_crosses_facets() {
        let query = query_tree(
            "{ books(filter: {ids: [5, 6]}) { owner(id: 6) { name } } }",
            &Variables::new(),
        )
        .unwrap();
        let caller = Caller::new(["customer"]).with_claim("uid", 6);
        let config = drop_if(
            &["*"],
            vec![
                Clause::new(Operator::Eq, "filter.$in.ids.1", "userClaims.uid"),
                Clause::new(Operator::Neq, "$out.owner.$in.id", "userClaims.uid"),
            ],
        );

        let messages = config.evaluate(&query, &books_scope(), Facet::Input, &caller);
        assert_eq!(
            messages,
            vec!["Input type \"query.$out.books.$in.filter.$in.ids.1\" value can't match value \"6\"".to_string()]
        );
    }

    #[test]
    fn test_clause_path_matches_aliased_fields() {
        let query = query_tree(
            "{ mine: books(id: 1234) books: authors(id: 1234) }",
            &Variables::new(),
        )
        .unwrap();
        let caller = Caller::new(["customer"]).with_claim("uid", 1234);
        let config = drop_if(&["*"], vec![Clause::new(Operator::Eq, "books.$in.id", "userClaims.uid")]);

        let messages = config.evaluate(&query, &TreePath::new("query"), Facet::Output, &caller);
        assert_eq!(
            messages,
            vec!["Input type \"query.$out.mine.$in.id\" value can't match value \"1234\"".to_string()]
        );
    }

    #[test]
    fn test_operator_messages() {
        let path = TreePath::parse("query.$out.books.$in.year").unwrap();
        let operand = json!("2000");
        let rendered: Vec<String> = [
            Operator::Neq,
            Operator::Gt,
            Operator::Gte,
            Operator::Lt,
            Operator::Lte,
        ]
        .iter()
        .map(|op| op.describe(&path, &operand))
        .collect();
        assert_eq!(
            rendered,
            vec![
                "Input type \"query.$out.books.$in.year\" value doesn't match expected value \"2000\"",
                "Input type \"query.$out.books.$in.year\" value can't be > \"2000\"",
                "Input type \"query.$out.books.$in.year\" value can't be >= \"2000\"",
                "Input type \"query.$out.books.$in.year\" value can't be < \"2000\"",
                "Input type \"query.$out.books.$in.year\" value can't be <= \"2000\"",
            ]
        );
    }

    #[test]
    fn test_ordered_comparisons() {
        assert!(Operator::Gte.apply(&json!(5), &json!(5)));
        assert!(Operator::Lte.apply(&json!(4.5), &json!(5)));
        assert!(Operator::Gt.apply(&json!(true), &json!(false)));
        assert!(!Operator::Lt.apply(&json!(null), &json!(1)));
        assert!(Operator::Eq.apply(&json!(null), &json!(null)));
        assert!(!Operator::Eq.apply(&json!([1]), &json!([1])));
    }

    #[test]
    fn test_lookup_function_names() {
        assert_eq!(Function::from_name("$dropIf"), Some(Function::DropIf));
        assert_eq!(Function::from_name("$allowIf"), None);
        assert_eq!(Operator::from_key("$gte"), Some(Operator::Gte));
        assert_eq!(Operator::from_key("$in"), None);
    }
}
