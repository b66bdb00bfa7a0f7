//! Session context: the explicit carrier of the auth token and role.
//!
//! Nothing in this crate reads the token from ambient state. The transport
//! and the REST client both take a `SessionContext` (or an `Arc` of one)
//! when they are constructed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CRM role of the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Resident,
    Executor,
    Manager,
    Admin,
    Dispatcher,
    DepartmentHead,
}

impl Role {
    /// Roles that can see the executor roster and its load counters.
    pub fn sees_executors(self) -> bool {
        matches!(
            self,
            Role::Manager | Role::Admin | Role::Dispatcher | Role::DepartmentHead
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Resident => write!(f, "resident"),
            Role::Executor => write!(f, "executor"),
            Role::Manager => write!(f, "manager"),
            Role::Admin => write!(f, "admin"),
            Role::Dispatcher => write!(f, "dispatcher"),
            Role::DepartmentHead => write!(f, "department_head"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resident" => Ok(Role::Resident),
            "executor" => Ok(Role::Executor),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            "dispatcher" => Ok(Role::Dispatcher),
            "department_head" | "department-head" => Ok(Role::DepartmentHead),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Credentials and identity for one authenticated session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub token: String,
    pub user_id: String,
    pub role: Role,
}

impl SessionContext {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>, role: Role) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
            role,
        }
    }
}

// Keep the token out of logs.
impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_roles_see_executors() {
        assert!(Role::Manager.sees_executors());
        assert!(Role::Admin.sees_executors());
        assert!(Role::Dispatcher.sees_executors());
        assert!(Role::DepartmentHead.sees_executors());
        assert!(!Role::Resident.sees_executors());
        assert!(!Role::Executor.sees_executors());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Manager".parse::<Role>().unwrap(), Role::Manager);
        assert_eq!("department-head".parse::<Role>().unwrap(), Role::DepartmentHead);
        assert!("janitor".parse::<Role>().is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let ctx = SessionContext::new("secret-token", "u1", Role::Resident);
        let s = format!("{:?}", ctx);
        assert!(!s.contains("secret-token"));
        assert!(s.contains("u1"));
    }
}
