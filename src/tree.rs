//! Typed trees built from GraphQL documents.
//!
//! Both rule sources and incoming queries are turned into the same shape: a
//! map from operation type to a root [`Node`], where every node keeps its
//! arguments and its selected fields apart. Arguments (and the fields of
//! object values) live under the `$in` facet, selected fields under `$out`,
//! and list elements under numeric indices. A path through such a tree is a
//! [`TreePath`], rendered the way it appears in denial messages:
//!
//! ```text
//! query.$out.books.$in.filter.$in.author
//! ```

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::function::FunctionConfig;
use crate::policy::PolicySet;

/// Which side of a node a named child lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facet {
    /// Arguments and object-value fields.
    Input,
    /// Selected fields.
    Output,
}

impl Facet {
    /// The path marker for this facet.
    pub fn marker(self) -> &'static str {
        match self {
            Facet::Input => "$in",
            Facet::Output => "$out",
        }
    }
}

/// One step of a [`TreePath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Input(String),
    Output(String),
    Index(usize),
}

impl Segment {
    pub fn field(facet: Facet, name: impl Into<String>) -> Self {
        match facet {
            Facet::Input => Segment::Input(name.into()),
            Facet::Output => Segment::Output(name.into()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Segment::Input(name) | Segment::Output(name) => Some(name),
            Segment::Index(_) => None,
        }
    }

    pub fn facet(&self) -> Option<Facet> {
        match self {
            Segment::Input(_) => Some(Facet::Input),
            Segment::Output(_) => Some(Facet::Output),
            Segment::Index(_) => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Input(name) => write!(f, "$in.{name}"),
            Segment::Output(name) => write!(f, "$out.{name}"),
            Segment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// An absolute path into a [`Tree`]: an operation key followed by segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreePath {
    root: String,
    segments: Vec<Segment>,
}

impl TreePath {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            segments: Vec::new(),
        }
    }

    /// Parses a rendered path such as `query.$out.books.$in.id`.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldgate::{Segment, TreePath};
    ///
    /// let path = TreePath::parse("query.$out.books.$in.ids.0").unwrap();
    /// assert_eq!(path.root(), "query");
    /// assert_eq!(path.last(), Some(&Segment::Index(0)));
    /// assert_eq!(path.to_string(), "query.$out.books.$in.ids.0");
    ///
    /// // Names need a facet marker in front of them.
    /// assert!(TreePath::parse("query.books").is_none());
    /// ```
    pub fn parse(raw: &str) -> Option<TreePath> {
        let mut parts = raw.split('.');
        let root = parts.next().filter(|root| !root.is_empty())?;
        let segments = parse_segments(parts, None)?;
        Some(TreePath {
            root: root.to_string(),
            segments,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Returns this path extended by one segment.
    pub fn child(&self, segment: Segment) -> TreePath {
        let mut path = self.clone();
        path.segments.push(segment);
        path
    }

    /// Returns this path extended by every segment of `relative`.
    pub fn join(&self, relative: &[Segment]) -> TreePath {
        let mut path = self.clone();
        path.segments.extend_from_slice(relative);
        path
    }

    /// Returns this path with its last segment removed, or `None` at a root.
    pub fn parent(&self) -> Option<TreePath> {
        let (_, rest) = self.segments.split_last()?;
        Some(TreePath {
            root: self.root.clone(),
            segments: rest.to_vec(),
        })
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for segment in &self.segments {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// Parses a dotted path relative to some node.
///
/// A leading bare name takes `facet`; `$in` and `$out` switch the facet for
/// the names that follow; numeric parts are list indices.
///
/// # Example
///
/// ```
/// use fieldgate::{parse_relative, Facet, Segment};
///
/// let segments = parse_relative("filter.$in.ids.1", Facet::Input).unwrap();
/// assert_eq!(
///     segments,
///     vec![
///         Segment::Input("filter".into()),
///         Segment::Input("ids".into()),
///         Segment::Index(1),
///     ]
/// );
/// ```
pub fn parse_relative(raw: &str, facet: Facet) -> Option<Vec<Segment>> {
    parse_segments(raw.split('.'), Some(facet))
}

fn parse_segments<'s>(
    parts: impl Iterator<Item = &'s str>,
    mut facet: Option<Facet>,
) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut marker_pending = false;
    for part in parts {
        match part {
            "" => return None,
            "$in" => {
                facet = Some(Facet::Input);
                marker_pending = true;
            }
            "$out" => {
                facet = Some(Facet::Output);
                marker_pending = true;
            }
            index if !marker_pending && index.bytes().all(|b| b.is_ascii_digit()) => {
                segments.push(Segment::Index(index.parse().ok()?));
            }
            name => {
                segments.push(Segment::field(facet?, name));
                marker_pending = false;
            }
        }
    }
    (!marker_pending).then_some(segments)
}

/// A node of a query tree or a rule tree.
///
/// Query trees fill in `value` and leave `policy`/`functions` empty; rule
/// trees do the opposite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub(crate) inputs: BTreeMap<String, Node>,
    pub(crate) outputs: BTreeMap<String, Node>,
    pub(crate) items: Vec<Node>,
    pub(crate) value: Option<Value>,
    pub(crate) original_name: Option<String>,
    pub(crate) policy: Option<PolicySet>,
    pub(crate) functions: Option<FunctionConfig>,
}

impl Node {
    /// Creates an empty node carrying `policy`, if any.
    pub(crate) fn with_policy(policy: Option<&PolicySet>) -> Self {
        Node {
            policy: policy.cloned(),
            ..Node::default()
        }
    }

    pub fn inputs(&self) -> &BTreeMap<String, Node> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeMap<String, Node> {
        &self.outputs
    }

    pub fn items(&self) -> &[Node] {
        &self.items
    }

    /// The literal recorded at this node, if any.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The schema field name when this node was selected under an alias.
    pub fn original_name(&self) -> Option<&str> {
        self.original_name.as_deref()
    }

    pub fn policy(&self) -> Option<&PolicySet> {
        self.policy.as_ref()
    }

    pub fn functions(&self) -> Option<&FunctionConfig> {
        self.functions.as_ref()
    }

    /// A leaf has no arguments, no selected fields and no list elements.
    pub fn is_leaf(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty() && self.items.is_empty()
    }

    pub fn child(&self, segment: &Segment) -> Option<&Node> {
        match segment {
            Segment::Input(name) => self.inputs.get(name),
            Segment::Output(name) => self.outputs.get(name),
            Segment::Index(index) => self.items.get(*index),
        }
    }

    /// Follows `segments` down from this node.
    pub fn get(&self, segments: &[Segment]) -> Option<&Node> {
        segments
            .iter()
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Follows `segments` the way rules name fields: an output segment
    /// matches every selection of that field, under its own name or an alias.
    ///
    /// Returns each match with the exact segments leading to it.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldgate::builder::{query_tree, Variables};
    /// use fieldgate::Segment;
    ///
    /// let tree = query_tree("{ books(id: 1) mine: books(id: 2) }", &Variables::new()).unwrap();
    /// let root = tree.root("query").unwrap();
    ///
    /// let found = root.resolve(&[Segment::Output("books".into()), Segment::Input("id".into())]);
    /// let keys: Vec<_> = found.iter().map(|(path, _)| path[0].to_string()).collect();
    /// assert_eq!(keys, ["$out.books", "$out.mine"]);
    /// ```
    pub fn resolve(&self, segments: &[Segment]) -> Vec<(Vec<Segment>, &Node)> {
        let Some((first, rest)) = segments.split_first() else {
            return vec![(Vec::new(), self)];
        };
        let matches: Vec<(Segment, &Node)> = match first {
            Segment::Output(name) => self
                .outputs
                .iter()
                .filter(|(key, node)| node.original_name().unwrap_or(key.as_str()) == name)
                .map(|(key, node)| (Segment::Output(key.clone()), node))
                .collect(),
            other => self.child(other).map(|node| (other.clone(), node)).into_iter().collect(),
        };
        let mut found = Vec::new();
        for (segment, node) in matches {
            for (tail, target) in node.resolve(rest) {
                let mut path = Vec::with_capacity(tail.len() + 1);
                path.push(segment.clone());
                path.extend(tail);
                found.push((path, target));
            }
        }
        found
    }

    /// Like [`child`](Node::child), but a named segment missing from this
    /// node is looked up inside its list elements as well.
    ///
    /// Rule trees describe list arguments through an example element, so a
    /// normalized query path that skips indices still finds the rule.
    pub fn rule_child(&self, segment: &Segment) -> Option<&Node> {
        self.child(segment)
            .or_else(|| self.items.iter().find_map(|item| item.rule_child(segment)))
    }

    /// Iterates over the children: arguments first, then selected fields, then list elements.
    pub fn children(&self) -> impl Iterator<Item = (Segment, &Node)> {
        let inputs = self
            .inputs
            .iter()
            .map(|(name, node)| (Segment::Input(name.clone()), node));
        let outputs = self
            .outputs
            .iter()
            .map(|(name, node)| (Segment::Output(name.clone()), node));
        let items = self
            .items
            .iter()
            .enumerate()
            .map(|(index, node)| (Segment::Index(index), node));
        inputs.chain(outputs).chain(items)
    }

    /// Folds `other` into this node. Children are merged recursively; slots
    /// set on `other` replace the ones set here.
    pub(crate) fn merge(&mut self, other: Node) {
        for (name, child) in other.inputs {
            insert_child(&mut self.inputs, name, child);
        }
        for (name, child) in other.outputs {
            insert_child(&mut self.outputs, name, child);
        }
        let mut items = other.items.into_iter();
        for existing in self.items.iter_mut() {
            match items.next() {
                Some(item) => existing.merge(item),
                None => break,
            }
        }
        self.items.extend(items);
        if other.value.is_some() {
            self.value = other.value;
        }
        if other.original_name.is_some() {
            self.original_name = other.original_name;
        }
        if other.policy.is_some() {
            self.policy = other.policy;
        }
        if other.functions.is_some() {
            self.functions = other.functions;
        }
    }
}

/// Inserts `node` under `name`, merging with a node already there.
pub(crate) fn insert_child(children: &mut BTreeMap<String, Node>, name: String, node: Node) {
    match children.entry(name) {
        Entry::Vacant(entry) => {
            entry.insert(node);
        }
        Entry::Occupied(mut entry) => entry.get_mut().merge(node),
    }
}

/// A forest of operation roots keyed by operation type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tree {
    roots: BTreeMap<String, Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn root(&self, key: &str) -> Option<&Node> {
        self.roots.get(key)
    }

    pub fn roots(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.roots.iter().map(|(key, node)| (key.as_str(), node))
    }

    /// Adds an operation root, merging it into an existing root of the same type.
    pub(crate) fn insert(&mut self, key: impl Into<String>, node: Node) {
        insert_child(&mut self.roots, key.into(), node);
    }

    /// Looks up the node at an exact path.
    pub fn get(&self, path: &TreePath) -> Option<&Node> {
        self.root(path.root())?.get(path.segments())
    }

    /// Looks up the literal recorded at an exact path.
    pub fn value_at(&self, path: &TreePath) -> Option<&Value> {
        self.get(path)?.value()
    }

    /// Looks up a rule by normalized path, descending into list elements
    /// where the path has no index.
    pub fn rule_at(&self, path: &TreePath) -> Option<&Node> {
        path.segments()
            .iter()
            .try_fold(self.root(path.root())?, |node, segment| node.rule_child(segment))
    }
}
