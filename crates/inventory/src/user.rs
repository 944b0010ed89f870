use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, Entity, UserId};

/// A user known to the ledger; only needed as the actor stamped on movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn create(id: UserId, draft: NewUser, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            username: draft.username,
            email: draft.email,
            is_admin: draft.is_admin,
            active: true,
            created_at,
        }
    }

    /// Whether movements may be stamped with this user.
    pub fn can_act(&self) -> bool {
        self.active
    }
}

impl Entity for User {
    type Id = UserId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Command: CreateUser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
    pub is_admin: bool,
}

impl NewUser {
    pub fn staff(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: None,
            is_admin: false,
        }
    }

    pub fn admin(username: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::staff(username)
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn validated(self) -> DomainResult<Self> {
        let username = self.username.trim().to_string();
        if username.is_empty() {
            return Err(DomainError::validation("username cannot be empty"));
        }

        let email = self
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        if let Some(email) = &email {
            if !looks_like_email(email) {
                return Err(DomainError::validation(format!("invalid email '{email}'")));
            }
        }

        Ok(Self {
            username,
            email,
            is_admin: self.is_admin,
        })
    }
}

// local@domain.tld with no whitespace
fn looks_like_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_is_required() {
        assert!(NewUser::staff("  ").validated().is_err());
        assert_eq!(NewUser::staff(" kim ").validated().unwrap().username, "kim");
    }

    #[test]
    fn email_shape_is_checked() {
        assert!(NewUser::staff("kim").with_email("kim@example.com").validated().is_ok());
        assert!(NewUser::staff("kim").with_email("kim@example").validated().is_err());
        assert!(NewUser::staff("kim").with_email("k im@example.com").validated().is_err());
        assert_eq!(NewUser::staff("kim").with_email(" ").validated().unwrap().email, None);
    }

    #[test]
    fn created_users_can_act() {
        let u = User::create(UserId::new(), NewUser::admin("admin"), Utc::now());
        assert!(u.can_act());
        assert!(u.is_admin);
    }
}
