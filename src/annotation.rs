//! Access annotations carried in rule comments.
//!
//! A comment in a rule source is an annotation when its text starts with `{`.
//! The JSON object may set `DROP` and `ACCEPT` role lists (each a single role
//! or an array) and name functions:
//!
//! ```text
//! # {"DROP": "*", "ACCEPT": ["customer", "admin"]}
//! # {"$dropIf": [{"roles": ["customer"], "$eq": {"id": "userClaims.uid"}}]}
//! ```
//!
//! Any other comment is documentation and is ignored.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AnnotationError;
use crate::function::{Clause, Function, FunctionConfig, FunctionEntry, Operator};
use crate::policy::{PolicySet, RoleList, RoleSet};

#[derive(Debug, Deserialize)]
struct RawAnnotation {
    #[serde(rename = "DROP", default)]
    drop: Option<RoleList>,
    #[serde(rename = "ACCEPT", default)]
    accept: Option<RoleList>,
    /// Everything besides `DROP` and `ACCEPT`. Decoded one entry at a time.
    #[serde(flatten)]
    functions: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    roles: RoleList,
    #[serde(flatten)]
    operators: BTreeMap<String, Value>,
}

/// A decoded annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    policy: PolicySet,
    functions: Option<FunctionConfig>,
}

impl Annotation {
    /// Decodes a comment, returning `Ok(None)` for comments that are not annotations.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldgate::Annotation;
    ///
    /// let annotation = Annotation::parse(r#"{"ACCEPT": "admin"}"#).unwrap().unwrap();
    /// assert!(annotation.policy().accepts().contains("admin"));
    ///
    /// assert_eq!(Annotation::parse("just a note").unwrap(), None);
    /// assert!(Annotation::parse("{not json").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Option<Annotation>, AnnotationError> {
        let raw = raw.trim();
        if !raw.starts_with('{') {
            return Ok(None);
        }
        let decoded: RawAnnotation = serde_json::from_str(raw)?;
        let policy = PolicySet::new(
            decoded.drop.map(RoleSet::from).unwrap_or_default(),
            decoded.accept.map(RoleSet::from).unwrap_or_default(),
        );
        Ok(Some(Annotation {
            policy,
            functions: compile_functions(decoded.functions),
        }))
    }

    /// The `DROP`/`ACCEPT` override this annotation applies.
    pub fn policy(&self) -> &PolicySet {
        &self.policy
    }

    pub fn functions(&self) -> Option<&FunctionConfig> {
        self.functions.as_ref()
    }
}

/// Applies the annotation in `raw` on top of `parent`.
///
/// Plain comments leave the parent policy unchanged.
pub fn merge_annotation(
    parent: &PolicySet,
    raw: &str,
) -> Result<(PolicySet, Option<FunctionConfig>), AnnotationError> {
    match Annotation::parse(raw)? {
        Some(annotation) => Ok((parent.merge(&annotation.policy), annotation.functions)),
        None => {
            debug!(comment = raw, "comment is not an annotation");
            Ok((parent.clone(), None))
        }
    }
}

fn compile_functions(raw: BTreeMap<String, Value>) -> Option<FunctionConfig> {
    let mut config = FunctionConfig::new();
    for (name, entries) in raw {
        let Some(function) = Function::from_name(&name) else {
            warn!(function = %name, "unknown annotation function; ignored");
            continue;
        };
        let Value::Array(entries) = entries else {
            warn!(function = %name, "function entries must be an array; ignored");
            continue;
        };
        for entry in entries {
            let entry: RawEntry = match serde_json::from_value(entry) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(function = %name, error = %err, "malformed function entry; ignored");
                    continue;
                }
            };
            let mut clauses = Vec::new();
            for (key, paths) in entry.operators {
                let Some(operator) = Operator::from_key(&key) else {
                    warn!(function = %name, operator = %key, "unknown operator; ignored");
                    continue;
                };
                let paths: BTreeMap<String, String> = match serde_json::from_value(paths) {
                    Ok(paths) => paths,
                    Err(err) => {
                        warn!(function = %name, operator = %key, error = %err, "malformed operator; ignored");
                        continue;
                    }
                };
                clauses.extend(
                    paths
                        .into_iter()
                        .map(|(path, reference)| Clause::new(operator, path, reference)),
                );
            }
            config.push(function, FunctionEntry::new(entry.roles.into(), clauses));
        }
    }
    (!config.is_empty()).then_some(config)
}
