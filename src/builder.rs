//! Conversion of parsed documents into [`Tree`]s.
//!
//! The same walk serves both sides of a validation. For an incoming query it
//! records argument literals and resolved variables; for a rule source it
//! also compiles each comment annotation into the policy of the node it
//! precedes, starting from a root policy and inheriting downwards.
//!
//! # Example
//!
//! ```
//! use fieldgate::builder::{query_tree, Variables};
//! use fieldgate::TreePath;
//! use serde_json::json;
//!
//! let mut variables = Variables::new();
//! variables.insert("id".into(), json!(42));
//!
//! let tree = query_tree("query ($id: ID) { books(id: $id, tags: [\"a\", \"b\"]) { title } }", &variables).unwrap();
//!
//! let id = TreePath::parse("query.$out.books.$in.id").unwrap();
//! assert_eq!(tree.value_at(&id), Some(&json!(42)));
//!
//! let tag = TreePath::parse("query.$out.books.$in.tags.1").unwrap();
//! assert_eq!(tree.value_at(&tag), Some(&json!("b")));
//! ```

use std::collections::HashMap;

use serde_json::{Map, Number, Value as Json};
use tracing::{trace, warn};

use crate::annotation::merge_annotation;
use crate::policy::PolicySet;
use crate::syntax::{
    self, Document, Field, FragmentDefinition, OperationDefinition, Selection, SyntaxError, Value, MAX_DEPTH,
};
use crate::tree::{insert_child, Node, Tree};

/// Runtime variable bindings, keyed by variable name without the `$`.
pub type Variables = Map<String, Json>;

/// Whether comments are compiled into policies while building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotations {
    /// Comments are ignored. Used for incoming queries.
    Ignore,
    /// Comments are compiled on top of the given root policy. Used for rules.
    Compile(PolicySet),
}

/// Builds the tree for `document`.
///
/// Every operation becomes a root keyed by its operation type; operations of
/// the same type are merged.
pub fn build(document: &Document, variables: &Variables, annotations: &Annotations) -> Tree {
    let builder = TreeBuilder {
        variables,
        fragments: document
            .fragments()
            .map(|fragment| (fragment.name.as_str(), fragment))
            .collect(),
    };
    let root_policy = match annotations {
        Annotations::Ignore => None,
        Annotations::Compile(policy) => Some(policy),
    };

    let mut tree = Tree::new();
    for operation in document.operations() {
        tree.insert(operation.kind.as_str(), builder.operation(operation, root_policy));
    }
    tree
}

/// Parses `source` and builds its query tree.
pub fn query_tree(source: &str, variables: &Variables) -> Result<Tree, SyntaxError> {
    let document = syntax::parse(source)?;
    Ok(build(&document, variables, &Annotations::Ignore))
}

struct TreeBuilder<'a> {
    variables: &'a Variables,
    fragments: HashMap<&'a str, &'a FragmentDefinition>,
}

/// Fragments being expanded and how deep the selections reached through them go.
///
/// Spreads can nest selections past what the parser sees in any one
/// definition, so expansion enforces [`MAX_DEPTH`] again.
#[derive(Default)]
struct Expansion<'a> {
    spreads: Vec<&'a str>,
    depth: usize,
}

impl Expansion<'_> {
    fn descend(&mut self) -> bool {
        if self.depth >= MAX_DEPTH {
            return false;
        }
        self.depth += 1;
        true
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }
}

/// State shared by everything inside one operation.
#[derive(Default)]
struct Frame<'a> {
    /// Declared variable defaults.
    defaults: HashMap<&'a str, &'a Value>,
}

impl<'a> TreeBuilder<'a> {
    fn operation(&self, operation: &'a OperationDefinition, root_policy: Option<&PolicySet>) -> Node {
        let frame = Frame {
            defaults: operation
                .variables
                .iter()
                .filter_map(|var| Some((var.name.as_str(), var.default_value.as_ref()?)))
                .collect(),
        };
        let mut node = self.start(operation.comment.as_deref(), root_policy);
        let policy = node.policy.clone();
        self.selections(
            &operation.selection_set,
            &frame,
            policy.as_ref(),
            &mut Expansion::default(),
            &mut node,
        );
        node
    }

    /// Creates a node, compiling its annotation when a policy is being inherited.
    fn start(&self, comment: Option<&str>, inherited: Option<&PolicySet>) -> Node {
        let Some(inherited) = inherited else {
            return Node::default();
        };
        let (policy, functions) = match comment {
            Some(raw) => merge_annotation(inherited, raw).unwrap_or_else(|err| {
                warn!(comment = raw, error = %err, "ignoring malformed annotation");
                (inherited.clone(), None)
            }),
            None => (inherited.clone(), None),
        };
        Node {
            policy: Some(policy),
            functions,
            ..Node::default()
        }
    }

    fn selections(
        &self,
        selections: &'a [Selection],
        frame: &Frame<'a>,
        policy: Option<&PolicySet>,
        expansion: &mut Expansion<'a>,
        node: &mut Node,
    ) {
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    let (key, child) = self.field(field, frame, policy, expansion);
                    insert_child(&mut node.outputs, key, child);
                }
                Selection::InlineFragment(fragment) => {
                    self.selections(&fragment.selection_set, frame, policy, expansion, node);
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.name.as_str();
                    let Some(&fragment) = self.fragments.get(name) else {
                        warn!(fragment = name, "unknown fragment; skipped");
                        continue;
                    };
                    if expansion.spreads.contains(&name) {
                        warn!(fragment = name, "fragment spreads itself; skipped");
                        continue;
                    }
                    if !expansion.descend() {
                        warn!(fragment = name, "fragment nested too deeply; skipped");
                        continue;
                    }
                    expansion.spreads.push(name);
                    self.selections(&fragment.selection_set, frame, policy, expansion, node);
                    expansion.spreads.pop();
                    expansion.ascend();
                }
            }
        }
    }

    /// Builds a selected field, returning the key it is stored under.
    fn field(
        &self,
        field: &'a Field,
        frame: &Frame<'a>,
        inherited: Option<&PolicySet>,
        expansion: &mut Expansion<'a>,
    ) -> (String, Node) {
        let mut node = self.start(field.comment.as_deref(), inherited);
        let key = match &field.alias {
            Some(alias) => {
                node.original_name = Some(field.name.clone());
                alias.clone()
            }
            None => field.name.clone(),
        };
        let policy = node.policy.clone();
        for argument in &field.arguments {
            let child = self.input(argument.comment.as_deref(), &argument.value, frame, policy.as_ref());
            insert_child(&mut node.inputs, argument.name.clone(), child);
        }
        if !field.selection_set.is_empty() {
            if expansion.descend() {
                self.selections(&field.selection_set, frame, policy.as_ref(), expansion, &mut node);
                expansion.ascend();
            } else {
                warn!(field = %field.name, "selection nested too deeply; skipped");
            }
        }
        (key, node)
    }

    /// Builds an argument or object field node.
    fn input(&self, comment: Option<&str>, value: &'a Value, frame: &Frame<'a>, inherited: Option<&PolicySet>) -> Node {
        let mut node = self.start(comment, inherited);
        let policy = node.policy.clone();
        self.fill(&mut node, value, frame, policy.as_ref());
        node
    }

    /// Records `value` into `node`.
    ///
    /// Scalars land in the value slot. Object fields become `$in` children of
    /// `node` itself and list elements become its items.
    fn fill(&self, node: &mut Node, value: &'a Value, frame: &Frame<'a>, policy: Option<&PolicySet>) {
        match value {
            Value::Variable(name) => self.variable(node, name, frame, policy),
            Value::Int(raw) => node.value = Some(int_literal(raw)),
            Value::Float(raw) => node.value = Some(float_literal(raw)),
            Value::String(text) | Value::Enum(text) => node.value = Some(Json::String(text.clone())),
            Value::Boolean(flag) => node.value = Some(Json::Bool(*flag)),
            Value::Null => node.value = Some(Json::Null),
            Value::List(values) => {
                for value in values {
                    let mut item = Node::with_policy(policy);
                    self.fill(&mut item, value, frame, policy);
                    node.items.push(item);
                }
            }
            Value::Object(fields) => {
                for field in fields {
                    let child = self.input(field.comment.as_deref(), &field.value, frame, policy);
                    insert_child(&mut node.inputs, field.name.clone(), child);
                }
            }
        }
    }

    /// Resolves a variable: runtime binding first, then the declared default.
    fn variable(&self, node: &mut Node, name: &str, frame: &Frame<'a>, policy: Option<&PolicySet>) {
        if let Some(bound) = self.variables.get(name) {
            fill_json(node, bound, policy);
        } else if let Some(&default) = frame.defaults.get(name) {
            // Defaults are constants; variables inside them stay unresolved.
            self.fill(node, default, &Frame::default(), policy);
        } else {
            trace!(variable = name, "unbound variable; no value recorded");
        }
    }
}

fn fill_json(node: &mut Node, value: &Json, policy: Option<&PolicySet>) {
    match value {
        Json::Object(fields) => {
            for (name, value) in fields {
                let mut child = Node::with_policy(policy);
                fill_json(&mut child, value, policy);
                insert_child(&mut node.inputs, name.clone(), child);
            }
        }
        Json::Array(values) => {
            for value in values {
                let mut item = Node::with_policy(policy);
                fill_json(&mut item, value, policy);
                node.items.push(item);
            }
        }
        scalar => node.value = Some(scalar.clone()),
    }
}

/// Integers outside the 64-bit range are recorded as `null`.
fn int_literal(raw: &str) -> Json {
    raw.parse::<i64>().map(Json::from).unwrap_or(Json::Null)
}

fn float_literal(raw: &str) -> Json {
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map_or(Json::Null, Json::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RoleSet;
    use crate::tree::TreePath;
    use proptest::prelude::*;
    use serde_json::json;

    fn path(raw: &str) -> TreePath {
        TreePath::parse(raw).unwrap()
    }

    fn query(source: &str) -> Tree {
        query_tree(source, &Variables::new()).unwrap()
    }

    fn rules(source: &str) -> Tree {
        let document = syntax::parse(source).unwrap();
        build(&document, &Variables::new(), &Annotations::Compile(PolicySet::drop_all()))
    }

    #[test]
    fn test_scalar_literals() {
        let tree = query(r#"{ books(a: 1, b: 2.5, c: "x", d: false, e: null, f: RED, g: 99999999999999999999) }"#);
        let value = |name: &str| tree.value_at(&path(&format!("query.$out.books.$in.{name}"))).cloned();
        assert_eq!(value("a"), Some(json!(1)));
        assert_eq!(value("b"), Some(json!(2.5)));
        assert_eq!(value("c"), Some(json!("x")));
        assert_eq!(value("d"), Some(json!(false)));
        assert_eq!(value("e"), Some(Json::Null));
        assert_eq!(value("f"), Some(json!("RED")));
        assert_eq!(value("g"), Some(Json::Null));
    }

    #[test]
    fn test_objects_are_inlined() {
        let tree = query(r#"{ books(filter: {author: "x", year: {min: 1990}}) }"#);
        assert_eq!(
            tree.value_at(&path("query.$out.books.$in.filter.$in.year.$in.min")),
            Some(&json!(1990))
        );
        assert!(tree.get(&path("query.$out.books.$in.filter.$in.author")).unwrap().is_leaf());
    }

    #[test]
    fn test_lists_of_objects() {
        let tree = query(r#"{ books(filters: [{author: "a"}, {author: "b"}]) }"#);
        assert_eq!(
            tree.value_at(&path("query.$out.books.$in.filters.1.$in.author")),
            Some(&json!("b"))
        );
    }

    #[test]
    fn test_variables_resolution() {
        let mut variables = Variables::new();
        variables.insert("id".into(), json!(5));
        variables.insert("filter".into(), json!({"ids": [1, 2]}));
        let tree = query_tree(
            "query ($id: ID, $limit: Int = 10, $filter: Filter, $missing: Int) { books(id: $id, limit: $limit, filter: $filter, other: $missing) }",
            &variables,
        )
        .unwrap();

        assert_eq!(tree.value_at(&path("query.$out.books.$in.id")), Some(&json!(5)));
        assert_eq!(tree.value_at(&path("query.$out.books.$in.limit")), Some(&json!(10)));
        assert_eq!(
            tree.value_at(&path("query.$out.books.$in.filter.$in.ids.1")),
            Some(&json!(2))
        );
        let other = tree.get(&path("query.$out.books.$in.other")).unwrap();
        assert!(other.is_leaf());
        assert_eq!(other.value(), None);
    }

    #[test]
    fn test_binding_overrides_default() {
        let mut variables = Variables::new();
        variables.insert("limit".into(), json!(3));
        let tree = query_tree("query ($limit: Int = 10) { books(limit: $limit) }", &variables).unwrap();
        assert_eq!(tree.value_at(&path("query.$out.books.$in.limit")), Some(&json!(3)));
    }

    #[test]
    fn test_aliases_keep_original_name() {
        let tree = query("{ mine: books(id: 1) { heading: title } books { id } }");
        let mine = tree.get(&path("query.$out.mine")).unwrap();
        assert_eq!(mine.original_name(), Some("books"));
        let heading = tree.get(&path("query.$out.mine.$out.heading")).unwrap();
        assert_eq!(heading.original_name(), Some("title"));
        assert_eq!(tree.get(&path("query.$out.books")).unwrap().original_name(), None);
    }

    #[test]
    fn test_operations_are_keyed_by_type() {
        let tree = query("query A { a } query B { b } mutation { c }");
        assert_eq!(tree.len(), 2);
        assert!(tree.get(&path("query.$out.a")).is_some());
        assert!(tree.get(&path("query.$out.b")).is_some());
        assert!(tree.get(&path("mutation.$out.c")).is_some());
    }

    #[test]
    fn test_fragments_are_expanded() {
        let tree = query(
            r#"
            query { books { ...Fields ... on Book { author } } }
            fragment Fields on Book { title ...Loop }
            fragment Loop on Book { id ...Fields }
            "#,
        );
        let books = tree.get(&path("query.$out.books")).unwrap();
        let names: Vec<&str> = books.outputs().keys().map(String::as_str).collect();
        assert_eq!(names, vec!["author", "id", "title"]);
    }

    #[test]
    fn test_fragment_chains_stop_at_max_depth() {
        let mut source = String::from("{ ...F0 }\n");
        for i in 0..500 {
            source.push_str(&format!("fragment F{i} on Book {{ a {{ ...F{} }} }}\n", i + 1));
        }
        let tree = query(&source);

        let mut node = tree.root("query").unwrap();
        let mut levels = 0;
        while let Some(next) = node.outputs().get("a") {
            node = next;
            levels += 1;
        }
        // Each level costs one spread and one selection set.
        assert_eq!(levels, MAX_DEPTH / 2);
    }

    #[test]
    fn test_rules_inherit_and_merge_policies() {
        let tree = rules(
            r#"
            query {
                # {"ACCEPT": ["customer"]}
                books(
                    # {"DROP": ["customer"]}
                    secret: 1
                    # a note, not an annotation
                    id: 1
                ) {
                    title
                }
            }
            "#,
        );
        let policy_at = |raw: &str| tree.get(&path(raw)).unwrap().policy().cloned().unwrap();
        let roles = |names: &[&str]| names.iter().copied().collect::<RoleSet>();

        assert_eq!(policy_at("query"), PolicySet::drop_all());
        assert_eq!(
            policy_at("query.$out.books"),
            PolicySet::new(roles(&["*"]), roles(&["customer"]))
        );
        assert_eq!(
            policy_at("query.$out.books.$out.title"),
            PolicySet::new(roles(&["*"]), roles(&["customer"]))
        );
        assert_eq!(policy_at("query.$out.books.$in.secret"), PolicySet::drop_all());
        assert_eq!(
            policy_at("query.$out.books.$in.id"),
            PolicySet::new(roles(&["*"]), roles(&["customer"]))
        );
    }

    #[test]
    fn test_rules_record_functions_and_list_policies() {
        let tree = rules(
            r#"
            query {
                books(
                    # {"ACCEPT": "*", "$dropIf": [{"roles": "*", "$eq": {"ids": "userClaims.uid"}}]}
                    ids: [1]
                )
            }
            "#,
        );
        let ids = tree.get(&path("query.$out.books.$in.ids")).unwrap();
        assert!(ids.functions().is_some());
        assert_eq!(ids.items()[0].policy(), Some(&PolicySet::accept_all()));
    }

    #[test]
    fn test_malformed_annotation_inherits() {
        let tree = rules("query {\n  # {\"ACCEPT\": oops}\n  books\n}");
        let books = tree.get(&path("query.$out.books")).unwrap();
        assert_eq!(books.policy(), Some(&PolicySet::drop_all()));
        assert_eq!(books.functions(), None);
    }

    #[test]
    fn test_queries_carry_no_policies() {
        let tree = query("query {\n  # {\"ACCEPT\": [\"admin\"]}\n  books\n}");
        assert_eq!(tree.get(&path("query.$out.books")).unwrap().policy(), None);
    }

    proptest! {
        #[test]
        fn test_list_elements_are_indexed_in_order(values in prop::collection::vec(any::<i32>(), 0..12)) {
            let list = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
            let tree = query(&format!("{{ books(ids: [{list}]) }}"));
            let ids = tree.get(&path("query.$out.books.$in.ids")).unwrap();
            prop_assert_eq!(ids.items().len(), values.len());
            for (item, expected) in ids.items().iter().zip(&values) {
                prop_assert_eq!(item.value(), Some(&Json::from(i64::from(*expected))));
            }
        }

        #[test]
        fn test_variables_match_literals(value in any::<i64>(), text in "[a-zA-Z0-9 ]{0,12}") {
            let literal = query(&format!("{{ books(id: {value}, title: \"{text}\") }}"));

            let mut variables = Variables::new();
            variables.insert("id".into(), json!(value));
            variables.insert("title".into(), json!(text));
            let bound = query_tree("query ($id: ID, $title: String) { books(id: $id, title: $title) }", &variables).unwrap();

            prop_assert_eq!(literal, bound);
        }
    }
}
