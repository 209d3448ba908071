//! The two-axis permission table: `username → method → level`.
//!
//! Loaded from configuration at process start and immutable afterwards, so
//! it can be shared freely without locking.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

/// Permission level for one user on one RPC method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
pub enum Permission {
    /// The method is denied outright.
    None,
    /// The method is allowed against the user's own jobs only.
    Own,
    /// The method is allowed against any job.
    Super,
}

impl TryFrom<i64> for Permission {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Permission::None),
            1 => Ok(Permission::Own),
            100 => Ok(Permission::Super),
            other => Err(format!(
                "'{other}' is not a valid permission, valid permissions are 0 (none), 1 (own), 100 (super)"
            )),
        }
    }
}

/// The four RPC methods subject to the ACL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Start,
    Stop,
    Status,
    Output,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::Start, Method::Stop, Method::Status, Method::Output];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Start => "start",
            Method::Stop => "stop",
            Method::Status => "status",
            Method::Output => "output",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The access-control list. Method names are the lowercase RPC names.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Acl(HashMap<String, HashMap<String, Permission>>);

impl Acl {
    pub fn new(users: HashMap<String, HashMap<String, Permission>>) -> Self {
        Self(users)
    }

    /// Reject empty ACLs, users without methods, and unknown method names.
    /// Permission values outside {0, 1, 100} are already unrepresentable.
    pub fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("acl can't be empty, require at least one configured user".into());
        }
        for (user, methods) in &self.0 {
            if methods.is_empty() {
                return Err(format!("rpc permissions for '{user}' are empty"));
            }
            for method in methods.keys() {
                if !Method::ALL.iter().any(|known| known.as_str() == method) {
                    return Err(format!(
                        "'{method}' is not a valid route, valid routes: start, stop, status, output"
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn contains_user(&self, username: &str) -> bool {
        self.0.contains_key(username)
    }

    /// The user's level for `method`; missing entries mean `None`.
    pub fn permission(&self, username: &str, method: Method) -> Permission {
        self.0
            .get(username)
            .and_then(|methods| methods.get(method.as_str()))
            .copied()
            .unwrap_or(Permission::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(entries: &[(&str, &[(&str, Permission)])]) -> Acl {
        Acl::new(
            entries
                .iter()
                .map(|(user, methods)| {
                    (
                        user.to_string(),
                        methods
                            .iter()
                            .map(|(m, p)| (m.to_string(), *p))
                            .collect(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn empty_acl_is_invalid() {
        assert!(Acl::default().validate().is_err());
        assert!(acl(&[("alice", &[])]).validate().is_err());
    }

    #[test]
    fn unknown_methods_are_rejected() {
        let bad = acl(&[("alice", &[("restart", Permission::Own)])]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn lookups_default_to_none() {
        let table = acl(&[("alice", &[("start", Permission::Own)])]);
        assert!(table.validate().is_ok());
        assert_eq!(table.permission("alice", Method::Start), Permission::Own);
        assert_eq!(table.permission("alice", Method::Stop), Permission::None);
        assert_eq!(table.permission("mallory", Method::Start), Permission::None);
        assert!(table.contains_user("alice"));
        assert!(!table.contains_user("mallory"));
    }

    #[test]
    fn permissions_decode_from_levels() {
        let decoded: HashMap<String, HashMap<String, Permission>> =
            serde_json::from_str(r#"{"admin":{"start":100,"stop":1,"output":0}}"#)
                .expect("decode acl");
        assert_eq!(decoded["admin"]["start"], Permission::Super);
        assert_eq!(decoded["admin"]["stop"], Permission::Own);
        assert_eq!(decoded["admin"]["output"], Permission::None);

        let bad: Result<HashMap<String, HashMap<String, Permission>>, _> =
            serde_json::from_str(r#"{"admin":{"start":2}}"#);
        assert!(bad.is_err());
    }
}
