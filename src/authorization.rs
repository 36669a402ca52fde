//! The host-facing entry point.
//!
//! [`Authorization`] holds the compiled rules together with the settings a
//! host configures once (default policy, debug messages, custom check) and
//! validates incoming queries against them. It is immutable while
//! validating, so one instance can be shared across threads behind an `Arc`.
//!
//! # Example
//!
//! ```
//! use fieldgate::{Authorization, DefaultPolicy, NOT_AUTHORIZED};
//! use serde_json::json;
//!
//! let mut auth = Authorization::new(r#"
//!     query {
//!         books {
//!             ## {"ACCEPT": ["customer"]}
//!             title
//!         }
//!     }
//! "#).unwrap();
//!
//! let params = json!({"userClaims": {"roles": ["guest"]}});
//! let verdict = auth.validate("{ books { title } }", &params).unwrap();
//! assert_eq!(verdict.message, NOT_AUTHORIZED);
//!
//! auth.set_policy(DefaultPolicy::Accept);
//! let verdict = auth.validate("{ books { author } }", &params).unwrap();
//! assert!(verdict.is_allowed);
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::builder::Variables;
use crate::claims::Caller;
use crate::error::{ConfigError, InvocationError};
use crate::rules::{CustomCheck, NodeContext, RuleTree};
use crate::syntax::{self, Document};
use crate::verdict::{DefaultPolicy, Verdict, NOT_AUTHORIZED};

/// A parsed query ready for validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub document: Document,
    pub variables: Variables,
    pub caller: Caller,
}

impl Request {
    pub fn new(document: Document, caller: Caller) -> Self {
        Self {
            document,
            variables: Variables::new(),
            caller,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}

/// Validates GraphQL queries against a set of rules.
pub struct Authorization {
    source: Option<Document>,
    rules: RuleTree,
    default_policy: DefaultPolicy,
    debug: bool,
    custom_check: Option<Arc<CustomCheck>>,
}

impl Authorization {
    /// Creates an authorization from a rule source with the `DROP` default policy.
    ///
    /// A blank source configures no rules.
    pub fn new(rules: &str) -> Result<Self, ConfigError> {
        let mut auth = Self {
            source: None,
            rules: RuleTree::empty(),
            default_policy: DefaultPolicy::default(),
            debug: false,
            custom_check: None,
        };
        auth.set_rules(rules)?;
        Ok(auth)
    }

    /// Replaces the rules. A blank source leaves the current rules in place.
    pub fn set_rules(&mut self, rules: &str) -> Result<(), ConfigError> {
        if rules.trim().is_empty() {
            return Ok(());
        }
        let document = syntax::parse(rules)?;
        self.rules = RuleTree::from_document(&document, &self.default_policy.root_policy());
        self.source = Some(document);
        info!(operations = self.rules.tree().len(), "rules configured");
        Ok(())
    }

    /// Sets the default policy and recompiles the rules on top of it.
    pub fn set_policy(&mut self, policy: DefaultPolicy) {
        self.default_policy = policy;
        if let Some(document) = &self.source {
            self.rules = RuleTree::from_document(document, &policy.root_policy());
        }
        debug!(%policy, "default policy set");
    }

    /// Like [`set_policy`](Self::set_policy), from `"DROP"` or `"ACCEPT"`.
    pub fn set_policy_str(&mut self, policy: &str) -> Result<(), ConfigError> {
        self.set_policy(policy.parse()?);
        Ok(())
    }

    pub fn with_policy(mut self, policy: DefaultPolicy) -> Self {
        self.set_policy(policy);
        self
    }

    /// Enables detailed denial messages.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.set_debug(debug);
        self
    }

    /// Installs a check that runs on every evaluated leaf.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldgate::Authorization;
    /// use serde_json::json;
    ///
    /// let mut auth = Authorization::new("").unwrap().with_debug(true);
    /// auth.set_policy_str("ACCEPT").unwrap();
    /// auth.set_custom_check(|node| {
    ///     if node.value == Some(&json!("secret")) {
    ///         vec![format!("{} is off limits", node.path)]
    ///     } else {
    ///         Vec::new()
    ///     }
    /// });
    ///
    /// let params = json!({"userClaims": {"roles": "guest"}});
    /// let verdict = auth.validate(r#"{ books(tag: "secret") }"#, &params).unwrap();
    /// assert_eq!(verdict.message, "query.$out.books.$in.tag is off limits");
    /// ```
    pub fn set_custom_check<F>(&mut self, check: F)
    where
        F: Fn(&NodeContext<'_>) -> Vec<String> + Send + Sync + 'static,
    {
        let check: Arc<CustomCheck> = Arc::new(check);
        self.custom_check = Some(check);
    }

    pub fn default_policy(&self) -> DefaultPolicy {
        self.default_policy
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn rules(&self) -> &RuleTree {
        &self.rules
    }

    /// Validates a query source for the caller described by `params`.
    ///
    /// `params` must carry `userClaims.roles`.
    pub fn validate(&self, query: &str, params: &Value) -> Result<Verdict, InvocationError> {
        self.validate_with_variables(query, &Value::Object(Variables::new()), params)
    }

    /// Like [`validate`](Self::validate), with runtime variable bindings.
    pub fn validate_with_variables(
        &self,
        query: &str,
        variables: &Value,
        params: &Value,
    ) -> Result<Verdict, InvocationError> {
        let caller = Caller::from_params(params)?;
        let variables = variables
            .as_object()
            .cloned()
            .ok_or(InvocationError::InvalidVariables)?;
        let document = syntax::parse(query)?;
        Ok(self.validate_request(&Request::new(document, caller).with_variables(variables)))
    }

    /// Validates an already parsed request.
    pub fn validate_request(&self, request: &Request) -> Verdict {
        let verdict = self.rules.validate_with(
            &request.document,
            &request.variables,
            &request.caller,
            self.default_policy,
            self.custom_check.as_deref(),
        );
        debug!(allowed = verdict.is_allowed, "validated request");
        if verdict.is_allowed || self.debug {
            verdict
        } else {
            Verdict::denied(NOT_AUTHORIZED)
        }
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("rules", &self.rules)
            .field("default_policy", &self.default_policy)
            .field("debug", &self.debug)
            .field("custom_check", &self.custom_check.is_some())
            .finish()
    }
}
