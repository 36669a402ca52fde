use serde_json::{json, Map, Value};

use crate::error::InvocationError;
use crate::policy::RoleList;

/// The identity a query is validated for.
///
/// A caller is built from the validation parameters handed to
/// [`Authorization::validate`](crate::Authorization::validate), which carry
/// the caller's claims under `userClaims`:
///
/// ```json
/// {"userClaims": {"roles": ["customer"], "uid": 1234}}
/// ```
///
/// The roles decide access; the whole parameter object is what function
/// references such as `userClaims.uid` resolve against.
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    roles: Vec<String>,
    params: Value,
}

impl Caller {
    /// Creates a caller with the given roles and no other claims.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldgate::Caller;
    /// use serde_json::json;
    ///
    /// let caller = Caller::new(["customer"]).with_claim("uid", 1234);
    /// assert_eq!(caller.roles(), ["customer"]);
    /// assert_eq!(caller.lookup("userClaims.uid"), Some(&json!(1234)));
    /// ```
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let roles: Vec<String> = roles.into_iter().map(Into::into).collect();
        let params = json!({ "userClaims": { "roles": roles } });
        Self { roles, params }
    }

    /// Adds a claim under `userClaims`.
    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Some(claims) = self.params.get_mut("userClaims").and_then(Value::as_object_mut) {
            claims.insert(name.into(), value.into());
        }
        self
    }

    /// Extracts the caller from validation parameters.
    ///
    /// `userClaims.roles` may be a single role or an array of roles.
    pub fn from_params(params: &Value) -> Result<Self, InvocationError> {
        let claims = params
            .get("userClaims")
            .and_then(Value::as_object)
            .ok_or(InvocationError::MissingClaims)?;
        let roles = claims
            .get("roles")
            .filter(|roles| !roles.is_null())
            .ok_or(InvocationError::MissingRoles)?;
        let roles = serde_json::from_value::<RoleList>(roles.clone())
            .map_err(|_| InvocationError::InvalidRoles)?
            .into_vec();
        Ok(Self {
            roles,
            params: params.clone(),
        })
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// The full validation parameters.
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// The `userClaims` object.
    pub fn claims(&self) -> Option<&Map<String, Value>> {
        self.params.get("userClaims").and_then(Value::as_object)
    }

    /// Resolves a dotted reference such as `userClaims.uid` against the parameters.
    ///
    /// Numeric parts index into arrays.
    pub fn lookup(&self, reference: &str) -> Option<&Value> {
        reference
            .split('.')
            .try_fold(&self.params, |value, key| match value {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|index| items.get(index)),
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_params() {
        let params = json!({"userClaims": {"roles": ["customer", "admin"], "uid": 7}});
        let caller = Caller::from_params(&params).unwrap();
        assert_eq!(caller.roles(), ["customer", "admin"]);
        assert_eq!(caller.lookup("userClaims.uid"), Some(&json!(7)));
        assert_eq!(caller.params(), &params);
    }

    #[test]
    fn test_single_role_string() {
        let params = json!({"userClaims": {"roles": "customer"}});
        assert_eq!(Caller::from_params(&params).unwrap().roles(), ["customer"]);
    }

    #[test]
    fn test_missing_claims() {
        assert!(matches!(
            Caller::from_params(&json!({})),
            Err(InvocationError::MissingClaims)
        ));
        assert!(matches!(
            Caller::from_params(&json!({"userClaims": "admin"})),
            Err(InvocationError::MissingClaims)
        ));
    }

    #[test]
    fn test_missing_roles() {
        assert!(matches!(
            Caller::from_params(&json!({"userClaims": {"uid": 1}})),
            Err(InvocationError::MissingRoles)
        ));
        assert!(matches!(
            Caller::from_params(&json!({"userClaims": {"roles": null}})),
            Err(InvocationError::MissingRoles)
        ));
    }

    #[test]
    fn test_invalid_roles() {
        assert!(matches!(
            Caller::from_params(&json!({"userClaims": {"roles": [1, 2]}})),
            Err(InvocationError::InvalidRoles)
        ));
    }

    #[test]
    fn test_lookup() {
        let caller = Caller::new(["customer"])
            .with_claim("tenants", json!([{"id": "a"}, {"id": "b"}]));
        assert_eq!(caller.lookup("userClaims.tenants.1.id"), Some(&json!("b")));
        assert_eq!(caller.lookup("userClaims.tenants.2.id"), None);
        assert_eq!(caller.lookup("userClaims.roles.0"), Some(&json!("customer")));
        assert_eq!(caller.lookup("session.id"), None);
        assert!(caller.claims().unwrap().contains_key("tenants"));
    }
}
