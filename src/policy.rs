use serde::Deserialize;

/// The role that stands for every caller.
pub const WILDCARD: &str = "*";

/// An ordered set of role names.
///
/// Insertion order is preserved so that merged policies stay readable in logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RoleSet {
    roles: Vec<String>,
}

impl RoleSet {
    /// Creates an empty role set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a role set holding only the wildcard.
    pub fn wildcard() -> Self {
        Self {
            roles: vec![WILDCARD.to_string()],
        }
    }

    /// Adds a role, returning `false` if it was already present.
    pub fn insert(&mut self, role: impl Into<String>) -> bool {
        let role = role.into();
        if self.contains(&role) {
            return false;
        }
        self.roles.push(role);
        true
    }

    /// Removes a role, returning `true` if it was present.
    pub fn remove(&mut self, role: &str) -> bool {
        let before = self.roles.len();
        self.roles.retain(|r| r != role);
        self.roles.len() != before
    }

    pub fn contains(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_wildcard(&self) -> bool {
        self.contains(WILDCARD)
    }

    pub fn clear(&mut self) {
        self.roles.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for RoleSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = RoleSet::new();
        for role in iter {
            set.insert(role);
        }
        set
    }
}

/// A role list as written in JSON: either a single role or an array of roles.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub(crate) enum RoleList {
    One(String),
    Many(Vec<String>),
}

impl RoleList {
    pub(crate) fn into_vec(self) -> Vec<String> {
        match self {
            RoleList::One(role) => vec![role],
            RoleList::Many(roles) => roles,
        }
    }
}

impl From<RoleList> for RoleSet {
    fn from(list: RoleList) -> Self {
        list.into_vec().into_iter().collect()
    }
}

/// The pair of role sets governing one rule node.
///
/// A policy works in one of two modes. While `DROP` has no wildcard it is
/// opt-out: every role not listed in `DROP` may access the node. Once `DROP`
/// holds the wildcard it is opt-in: only roles listed in `ACCEPT` (or an
/// `ACCEPT` wildcard) may access it.
///
/// # Example
///
/// ```
/// use fieldgate::{PolicySet, RoleSet};
///
/// let inherited = PolicySet::drop_all();
/// let annotation = PolicySet::new(RoleSet::new(), ["customer"].into_iter().collect());
///
/// let merged = inherited.merge(&annotation);
/// assert!(merged.allows(&["customer"]));
/// assert!(!merged.allows(&["guest"]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    drop: RoleSet,
    accept: RoleSet,
}

impl PolicySet {
    pub fn new(drop: RoleSet, accept: RoleSet) -> Self {
        Self { drop, accept }
    }

    /// `{DROP: ["*"], ACCEPT: []}`
    pub fn drop_all() -> Self {
        Self::new(RoleSet::wildcard(), RoleSet::new())
    }

    /// `{DROP: [], ACCEPT: ["*"]}`
    pub fn accept_all() -> Self {
        Self::new(RoleSet::new(), RoleSet::wildcard())
    }

    /// The roles denied access.
    pub fn drops(&self) -> &RoleSet {
        &self.drop
    }

    /// The roles granted access.
    pub fn accepts(&self) -> &RoleSet {
        &self.accept
    }

    pub fn is_empty(&self) -> bool {
        self.drop.is_empty() && self.accept.is_empty()
    }

    /// Layers `incoming` over this policy and returns the result.
    ///
    /// An empty policy takes `incoming` as-is. Otherwise a `DROP` wildcard in
    /// `incoming` resets the result to drop everyone, after which each dropped
    /// role is added (unless a wildcard already covers it) and withdrawn from
    /// `ACCEPT`. `ACCEPT` is then applied the same way with the sides
    /// swapped, so an `ACCEPT` wildcard beats a `DROP` wildcard in the same
    /// annotation.
    pub fn merge(&self, incoming: &PolicySet) -> PolicySet {
        if self.is_empty() {
            return incoming.clone();
        }

        let mut merged = self.clone();

        if incoming.drop.has_wildcard() {
            merged.drop = RoleSet::wildcard();
            merged.accept.clear();
        }
        absorb(&mut merged.drop, &mut merged.accept, &incoming.drop);

        if incoming.accept.has_wildcard() {
            merged.accept = RoleSet::wildcard();
            merged.drop.clear();
        }
        absorb(&mut merged.accept, &mut merged.drop, &incoming.accept);

        merged
    }

    /// Decides whether a caller holding `roles` may access a node with this policy.
    ///
    /// A caller with no roles is denied in both modes.
    pub fn allows<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        if !self.drop.has_wildcard() {
            return roles.iter().any(|role| !self.drop.contains(role.as_ref()));
        }
        self.accept.has_wildcard() || roles.iter().any(|role| self.accept.contains(role.as_ref()))
    }
}

fn absorb(target: &mut RoleSet, opposite: &mut RoleSet, roles: &RoleSet) {
    for role in roles.iter() {
        if !target.has_wildcard() {
            target.insert(role);
        }
        opposite.remove(role);
    }
}
