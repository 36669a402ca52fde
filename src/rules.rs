use serde_json::Value;
use tracing::{debug, trace};

use crate::builder::{self, Annotations, Variables};
use crate::claims::Caller;
use crate::error::ConfigError;
use crate::policy::PolicySet;
use crate::syntax::{self, Document};
use crate::tree::{Facet, Node, Segment, Tree, TreePath};
use crate::verdict::{DefaultPolicy, Verdict};

/// What a custom check sees for each evaluated leaf.
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    /// The exact path of the leaf in the query.
    pub path: &'a TreePath,
    /// The path of the rule the leaf was checked against.
    pub rule_path: &'a TreePath,
    /// The rule policy, or `None` when the default policy applied.
    pub policy: Option<&'a PolicySet>,
    pub caller: &'a Caller,
    /// The literal the query supplied at this leaf, if any.
    pub value: Option<&'a Value>,
}

/// A user-supplied check run on every evaluated leaf.
///
/// Only leaves are passed in: nodes that have arguments, selected fields or
/// list elements are never seen by the check, only their leaves are. Each
/// element of a list is its own leaf. Each returned string is reported as a
/// failure and denies the query.
pub type CustomCheck = dyn Fn(&NodeContext<'_>) -> Vec<String> + Send + Sync;

/// Rules compiled into a policy-annotated tree.
///
/// A rule tree is compiled once and can validate any number of queries.
/// Each query leaf is checked against the rule at the same path (aliases
/// resolved and list indices dropped); leaves with no rule fall back to the
/// default policy.
///
/// # Example
///
/// ```
/// use fieldgate::{Caller, DefaultPolicy, RuleTree};
/// use fieldgate::builder::Variables;
///
/// let policy = DefaultPolicy::Drop;
/// let rules = RuleTree::compile(
///     r#"
///     query {
///         ## {"ACCEPT": ["customer"]}
///         books { title }
///     }
///     "#,
///     &policy.root_policy(),
/// ).unwrap();
///
/// let query = "{ books { title } }".parse().unwrap();
/// let verdict = rules.validate(&query, &Variables::new(), &Caller::new(["customer"]), policy);
/// assert!(verdict.is_allowed);
///
/// let verdict = rules.validate(&query, &Variables::new(), &Caller::new(["guest"]), policy);
/// assert_eq!(
///     verdict.message,
///     "User with roles [guest] is not authorized to access resources: query.$out.books.$out.title."
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleTree {
    tree: Tree,
}

impl RuleTree {
    /// Creates a rule tree with no rules; the default policy governs everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses and compiles a rule source on top of `root_policy`.
    pub fn compile(source: &str, root_policy: &PolicySet) -> Result<Self, ConfigError> {
        let document = syntax::parse(source)?;
        Ok(Self::from_document(&document, root_policy))
    }

    /// Compiles an already parsed rule source.
    pub fn from_document(document: &Document, root_policy: &PolicySet) -> Self {
        let tree = builder::build(
            document,
            &Variables::new(),
            &Annotations::Compile(root_policy.clone()),
        );
        debug!(operations = tree.len(), "compiled rule tree");
        Self { tree }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// The policy of the rule at a normalized path.
    pub fn policy_at(&self, path: &TreePath) -> Option<&PolicySet> {
        self.tree.rule_at(path)?.policy()
    }

    /// Validates a query for `caller`.
    pub fn validate(
        &self,
        query: &Document,
        variables: &Variables,
        caller: &Caller,
        default_policy: DefaultPolicy,
    ) -> Verdict {
        self.validate_with(query, variables, caller, default_policy, None)
    }

    /// Validates a query, also running `check` on every evaluated leaf.
    pub fn validate_with(
        &self,
        query: &Document,
        variables: &Variables,
        caller: &Caller,
        default_policy: DefaultPolicy,
        check: Option<&CustomCheck>,
    ) -> Verdict {
        let query = builder::build(query, variables, &Annotations::Ignore);
        let mut walker = Walker {
            rules: &self.tree,
            query: &query,
            caller,
            default_policy,
            check,
            denied: Vec::new(),
            failures: Vec::new(),
        };
        for (key, root) in query.roots() {
            walker.root(key, root);
        }
        walker.finish()
    }
}

/// The segment a query child is looked up under in the rule tree.
///
/// Aliases resolve to the field they select, so an alias cannot borrow the
/// rule of another field. List elements have no segment of their own.
fn rule_segment(segment: &Segment, node: &Node) -> Option<Segment> {
    let facet = segment.facet()?;
    let name = node.original_name().or(segment.name())?;
    Some(Segment::field(facet, name))
}

/// Walks a query tree, keeping its exact path and the matching rule path side by side.
struct Walker<'r> {
    rules: &'r Tree,
    query: &'r Tree,
    caller: &'r Caller,
    default_policy: DefaultPolicy,
    check: Option<&'r CustomCheck>,
    denied: Vec<TreePath>,
    failures: Vec<String>,
}

impl<'r> Walker<'r> {
    fn root(&mut self, key: &str, node: &Node) {
        let path = TreePath::new(key);
        let rules = self.rules;
        // Root functions resolve their paths from the root itself.
        if let Some(functions) = rules.root(key).and_then(Node::functions) {
            let messages = functions.evaluate(self.query, &path, Facet::Output, self.caller);
            self.record_functions(messages);
        }
        if node.is_leaf() {
            self.leaf(node, &path, &path);
        }
        self.walk(node, &path, &path);
    }

    fn walk(&mut self, node: &Node, exact: &TreePath, normalized: &TreePath) {
        for (segment, child) in node.children() {
            let exact_child = exact.child(segment.clone());
            let normalized_child = match rule_segment(&segment, child) {
                Some(rule_segment) => {
                    let normalized_child = normalized.child(rule_segment);
                    self.run_functions(&segment, exact, &normalized_child);
                    normalized_child
                }
                None => normalized.clone(),
            };
            if child.is_leaf() {
                self.leaf(child, &exact_child, &normalized_child);
            }
            self.walk(child, &exact_child, &normalized_child);
        }
    }

    /// Runs the functions of the rule at `normalized`, resolving paths from `scope`.
    fn run_functions(&mut self, segment: &Segment, scope: &TreePath, normalized: &TreePath) {
        let rules = self.rules;
        let (Some(functions), Some(facet)) = (rules.rule_at(normalized).and_then(Node::functions), segment.facet())
        else {
            return;
        };
        let messages = functions.evaluate(self.query, scope, facet, self.caller);
        self.record_functions(messages);
    }

    /// Aliased siblings share one rule, so the same function can run more than
    /// once for a scope; each failure is kept once.
    fn record_functions(&mut self, messages: Vec<String>) {
        for message in messages {
            if !self.failures.contains(&message) {
                self.failures.push(message);
            }
        }
    }

    fn leaf(&mut self, node: &Node, exact: &TreePath, normalized: &TreePath) {
        let rules = self.rules;
        let policy = rules.rule_at(normalized).and_then(Node::policy);
        let allowed = match policy {
            Some(policy) => policy.allows(self.caller.roles()),
            None => self.default_policy == DefaultPolicy::Accept,
        };
        trace!(path = %exact, rule = %normalized, allowed, "checked leaf");
        if !allowed {
            self.denied.push(exact.clone());
        }
        if let Some(check) = self.check {
            let context = NodeContext {
                path: exact,
                rule_path: normalized,
                policy,
                caller: self.caller,
                value: node.value(),
            };
            self.failures.extend(check(&context));
        }
    }

    fn finish(self) -> Verdict {
        let mut parts = Vec::new();
        if !self.denied.is_empty() {
            let paths: Vec<String> = self.denied.iter().map(ToString::to_string).collect();
            parts.push(format!(
                "User with roles [{}] is not authorized to access resources: {}.",
                self.caller.roles().join(", "),
                paths.join("; ")
            ));
        }
        if !self.failures.is_empty() {
            parts.push(self.failures.join("; "));
        }
        debug!(
            denied = self.denied.len(),
            failures = self.failures.len(),
            "validated query"
        );
        if parts.is_empty() {
            Verdict::allowed()
        } else {
            Verdict::denied(parts.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    const BOOKS: &str = r#"
        query {
            books(
                # {"ACCEPT": ["customer"], "$dropIf": [{"roles": ["customer"], "$eq": {"id": "userClaims.uid"}}]}
                id: 1
                # {"ACCEPT": "*"}
                filters: [{
                    # {"DROP": "*", "ACCEPT": ["admin"]}
                    author: ""
                }]
            ) {
                # {"ACCEPT": ["customer", "admin"]}
                title
                author
            }
        }
        # {"DROP": "*", "ACCEPT": "admin"}
        mutation {
            addBook(title: "")
        }
    "#;

    fn rules(policy: DefaultPolicy) -> RuleTree {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("fieldgate=trace")
            .with_test_writer()
            .try_init();
        RuleTree::compile(BOOKS, &policy.root_policy()).unwrap()
    }

    fn validate(rules: &RuleTree, query: &str, caller: &Caller, policy: DefaultPolicy) -> Verdict {
        let document = syntax::parse(query).unwrap();
        rules.validate(&document, &Variables::new(), caller, policy)
    }

    fn customer(uid: i64) -> Caller {
        Caller::new(["customer"]).with_claim("uid", uid)
    }

    #[test]
    fn test_accepted_leaves() {
        let verdict = validate(
            &rules(DefaultPolicy::Drop),
            "{ books(id: 1) { title } }",
            &customer(99),
            DefaultPolicy::Drop,
        );
        assert_eq!(verdict, Verdict::allowed());
    }

    #[test]
    fn test_unannotated_field_inherits_drop_all() {
        let verdict = validate(
            &rules(DefaultPolicy::Drop),
            "{ books { title author } }",
            &customer(99),
            DefaultPolicy::Drop,
        );
        assert_eq!(
            verdict.message,
            "User with roles [customer] is not authorized to access resources: query.$out.books.$out.author."
        );
    }

    #[test]
    fn test_unknown_field_uses_default_policy() {
        let rules = rules(DefaultPolicy::Drop);
        let caller = customer(99);
        assert!(!validate(&rules, "{ reviews }", &caller, DefaultPolicy::Drop).is_allowed);
        assert!(validate(&rules, "{ reviews }", &caller, DefaultPolicy::Accept).is_allowed);
    }

    #[test]
    fn test_drop_if_denies_matching_value() {
        let rules = rules(DefaultPolicy::Drop);
        let verdict = validate(&rules, "{ books(id: 1234) { title } }", &customer(1234), DefaultPolicy::Drop);
        assert_eq!(
            verdict,
            Verdict::denied("Input type \"query.$out.books.$in.id\" value can't match value \"1234\"")
        );

        let verdict = validate(&rules, "{ books(id: 1234) { title } }", &customer(9999), DefaultPolicy::Drop);
        assert!(verdict.is_allowed);
    }

    #[test]
    fn test_drop_if_skips_other_roles() {
        let rules = rules(DefaultPolicy::Drop);
        let caller = Caller::new(["customer", "admin"]).with_claim("uid", 1234);
        let verdict = validate(&rules, "{ books(id: 1234) { title } }", &caller, DefaultPolicy::Drop);
        assert!(verdict.is_allowed);
    }

    #[test]
    fn test_denials_and_failures_combine() {
        let rules = rules(DefaultPolicy::Drop);
        let verdict = validate(&rules, "{ books(id: 7) { author } }", &customer(7), DefaultPolicy::Drop);
        assert_eq!(
            verdict.message,
            "User with roles [customer] is not authorized to access resources: query.$out.books.$out.author. \
             Input type \"query.$out.books.$in.id\" value can't match value \"7\""
        );
    }

    #[test]
    fn test_aliases_resolve_to_original_field() {
        let rules = rules(DefaultPolicy::Drop);
        let caller = customer(99);
        assert!(validate(&rules, "{ books { heading: title } }", &caller, DefaultPolicy::Drop).is_allowed);

        let verdict = validate(&rules, "{ books { title: author } }", &caller, DefaultPolicy::Drop);
        assert_eq!(
            verdict.message,
            "User with roles [customer] is not authorized to access resources: query.$out.books.$out.title."
        );
    }

    #[test]
    fn test_drop_if_through_aliased_field() {
        let rules = RuleTree::compile(
            r#"
            query {
                # {"ACCEPT": "*", "$dropIf": [{"roles": "*", "$eq": {"books.$in.id": "userClaims.uid"}}]}
                books(id: 1)
            }
            "#,
            &PolicySet::drop_all(),
        )
        .unwrap();
        let caller = customer(1234);

        let verdict = validate(&rules, "{ mine: books(id: 1234) }", &caller, DefaultPolicy::Drop);
        assert_eq!(
            verdict,
            Verdict::denied("Input type \"query.$out.mine.$in.id\" value can't match value \"1234\"")
        );

        let verdict = validate(
            &rules,
            "{ books(id: 1234) mine: books(id: 1234) other: books(id: 5) }",
            &caller,
            DefaultPolicy::Drop,
        );
        assert_eq!(
            verdict,
            Verdict::denied(
                "Input type \"query.$out.books.$in.id\" value can't match value \"1234\"; \
                 Input type \"query.$out.mine.$in.id\" value can't match value \"1234\""
            )
        );

        assert!(validate(&rules, "{ mine: books(id: 5) }", &caller, DefaultPolicy::Drop).is_allowed);
    }

    #[test]
    fn test_list_elements_share_the_list_rule() {
        let rules = rules(DefaultPolicy::Drop);
        let admin = Caller::new(["admin"]);
        let query = r#"{ books(filters: [{author: "a"}, {author: "b"}]) }"#;
        assert!(validate(&rules, query, &admin, DefaultPolicy::Drop).is_allowed);

        let verdict = validate(&rules, query, &customer(1), DefaultPolicy::Drop);
        assert_eq!(
            verdict.message,
            "User with roles [customer] is not authorized to access resources: \
             query.$out.books.$in.filters.0.$in.author; query.$out.books.$in.filters.1.$in.author."
        );
    }

    #[test]
    fn test_scalar_list_elements_are_leaves() {
        let rules = RuleTree::compile(
            "query { books(\n# {\"ACCEPT\": \"customer\"}\nids: [0]) }",
            &PolicySet::drop_all(),
        )
        .unwrap();
        let caller = Caller::new(["customer"]);
        assert!(validate(&rules, "{ books(ids: [1, 2, 3]) }", &caller, DefaultPolicy::Drop).is_allowed);
        let verdict = validate(&rules, "{ books(ids: [1, 2]) }", &Caller::new(["guest"]), DefaultPolicy::Drop);
        assert_eq!(
            verdict.message,
            "User with roles [guest] is not authorized to access resources: \
             query.$out.books.$in.ids.0; query.$out.books.$in.ids.1."
        );
    }

    #[test]
    fn test_mutation_root_annotation() {
        let rules = rules(DefaultPolicy::Accept);
        let query = r#"mutation { addBook(title: "Dune") }"#;
        assert!(validate(&rules, query, &Caller::new(["admin"]), DefaultPolicy::Accept).is_allowed);
        assert!(!validate(&rules, query, &customer(1), DefaultPolicy::Accept).is_allowed);
    }

    #[test]
    fn test_accept_default_policy() {
        let rules = rules(DefaultPolicy::Accept);
        // Unannotated `author` inherits ACCEPT *.
        assert!(validate(&rules, "{ books { author } }", &Caller::new(["guest"]), DefaultPolicy::Accept).is_allowed);
    }

    #[test]
    fn test_empty_rules() {
        let rules = RuleTree::empty();
        let caller = Caller::new(["guest"]);
        assert!(!validate(&rules, "{ books { id } }", &caller, DefaultPolicy::Drop).is_allowed);
        assert!(validate(&rules, "{ books { id } }", &caller, DefaultPolicy::Accept).is_allowed);
    }

    #[test]
    fn test_no_roles_is_denied() {
        let rules = rules(DefaultPolicy::Accept);
        let caller = Caller::new(Vec::<String>::new());
        let verdict = validate(&rules, "{ books { author } }", &caller, DefaultPolicy::Accept);
        assert_eq!(
            verdict.message,
            "User with roles [] is not authorized to access resources: query.$out.books.$out.author."
        );
    }

    #[test]
    fn test_custom_check_sees_every_leaf() {
        let rules = rules(DefaultPolicy::Drop);
        let document = syntax::parse("{ books(id: 5) { title } }").unwrap();
        let check: &CustomCheck = &|node| match node.value {
            Some(value) if value == &json!(5) => vec![format!("{} is reserved", node.path)],
            _ => Vec::new(),
        };
        let verdict = rules.validate_with(
            &document,
            &Variables::new(),
            &customer(1),
            DefaultPolicy::Drop,
            Some(check),
        );
        assert_eq!(verdict, Verdict::denied("query.$out.books.$in.id is reserved"));
    }

    #[test]
    fn test_custom_check_skips_inner_nodes() {
        let rules = rules(DefaultPolicy::Accept);
        let document = syntax::parse(r#"{ books(id: 5, filters: [{author: "a"}]) { title } }"#).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let check: &CustomCheck = &move |node| {
            recorder.lock().unwrap().push(node.path.to_string());
            Vec::new()
        };
        rules.validate_with(
            &document,
            &Variables::new(),
            &Caller::new(["admin"]),
            DefaultPolicy::Accept,
            Some(check),
        );
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "query.$out.books.$in.filters.0.$in.author",
                "query.$out.books.$in.id",
                "query.$out.books.$out.title",
            ]
        );
    }

    #[test]
    fn test_policy_at() {
        let rules = rules(DefaultPolicy::Drop);
        let path = TreePath::parse("query.$out.books.$in.filters.$in.author").unwrap();
        let policy = rules.policy_at(&path).unwrap();
        assert!(policy.allows(&["admin"]));
        assert!(!policy.allows(&["customer"]));
    }

    #[test]
    fn test_rule_segment() {
        let mut aliased = Node::default();
        aliased.original_name = Some("title".into());
        assert_eq!(
            rule_segment(&Segment::Output("heading".into()), &aliased),
            Some(Segment::Output("title".into()))
        );
        assert_eq!(
            rule_segment(&Segment::Input("id".into()), &Node::default()),
            Some(Segment::Input("id".into()))
        );
        assert_eq!(rule_segment(&Segment::Index(2), &Node::default()), None);
    }
}
