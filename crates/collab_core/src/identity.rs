//! Who is editing, and which project they are editing.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::awareness::AwarenessUser;
use crate::error::{CollabError, Result};

/// The signed-in user, supplied by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub email: String,
}

impl UserIdentity {
    /// Presence record published to other peers.
    pub fn awareness_user(&self) -> AwarenessUser {
        AwarenessUser::new(&self.user_id, &self.display_name, self.avatar_url.clone())
    }
}

/// The project a document belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ProjectMetadata {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub collaborator_emails: Vec<String>,
    pub owner_email: String,
}

impl ProjectMetadata {
    /// Case-insensitive membership check against owner and collaborators.
    pub fn is_member(&self, email: &str) -> bool {
        let email = email.trim();
        if email.is_empty() {
            return false;
        }
        self.owner_email.trim().eq_ignore_ascii_case(email)
            || self
                .collaborator_emails
                .iter()
                .any(|e| e.trim().eq_ignore_ascii_case(email))
    }

    /// Reject users who are neither the owner nor a collaborator.
    pub fn authorize(&self, user: &UserIdentity) -> Result<()> {
        if self.is_member(&user.email) {
            Ok(())
        } else {
            Err(CollabError::Authorization(format!(
                "{} is not a collaborator of project '{}'",
                user.email, self.title
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> ProjectMetadata {
        ProjectMetadata {
            project_id: "p1".into(),
            title: "Notes".into(),
            collaborator_emails: vec!["Bo@Example.com".into()],
            owner_email: "ann@example.com".into(),
        }
    }

    fn user(email: &str) -> UserIdentity {
        UserIdentity {
            user_id: "u".into(),
            display_name: "U".into(),
            avatar_url: None,
            email: email.into(),
        }
    }

    #[test]
    fn test_membership_ignores_case() {
        let p = project();
        assert!(p.authorize(&user("ANN@example.com")).is_ok());
        assert!(p.authorize(&user("bo@example.com")).is_ok());
        assert!(matches!(
            p.authorize(&user("eve@example.com")),
            Err(CollabError::Authorization(_))
        ));
        assert!(!p.is_member(""));
    }
}
