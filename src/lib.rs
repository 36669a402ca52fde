//! Fieldgate: role-based authorization for GraphQL queries, with the rules written in GraphQL.
//!
//! Rules are an ordinary GraphQL document whose comments carry JSON
//! **annotations**. Fieldgate compiles them into a **rule tree** and checks
//! every leaf of an incoming query against it, producing a **verdict**.
//!
//! # Example
//!
//! ```
//! use fieldgate::Authorization;
//! use serde_json::json;
//!
//! let rules = r#"
//!     query {
//!         books(
//!             ## {"ACCEPT": ["customer"]}
//!             id: 1
//!         )
//!     }
//! "#;
//! let auth = Authorization::new(rules).unwrap().with_debug(true);
//!
//! let customer = json!({"userClaims": {"roles": ["customer"]}});
//! let verdict = auth.validate("query { books(id: 1) }", &customer).unwrap();
//! assert!(verdict.is_allowed);
//!
//! let guest = json!({"userClaims": {"roles": ["guest"]}});
//! let verdict = auth.validate("query { books(id: 1) }", &guest).unwrap();
//! assert!(!verdict.is_allowed);
//! assert_eq!(
//!     verdict.message,
//!     "User with roles [guest] is not authorized to access resources: query.$out.books.$in.id."
//! );
//! ```

mod annotation;
mod authorization;
mod claims;
mod error;
mod function;
mod policy;
mod rules;
mod tree;
mod verdict;

pub mod builder;
pub mod syntax;

pub use annotation::{merge_annotation, Annotation};
pub use authorization::{Authorization, Request};
pub use claims::Caller;
pub use error::{AnnotationError, ConfigError, InvocationError};
pub use function::{Clause, Function, FunctionConfig, FunctionEntry, Operator};
pub use policy::{PolicySet, RoleSet, WILDCARD};
pub use rules::{CustomCheck, NodeContext, RuleTree};
pub use syntax::SyntaxError;
pub use tree::{parse_relative, Facet, Node, Segment, Tree, TreePath};
pub use verdict::{DefaultPolicy, Verdict, NOT_AUTHORIZED};
