//! Project-level authorization and membership mutation.
//!
//! A user's effective role on a project is `owner` if they created it,
//! otherwise the role on their membership row, otherwise nothing. Mutations
//! are rejected whole when any precondition fails; the last-owner rule is
//! re-checked by the store inside the write transaction.

use thiserror::Error;

use crate::auth::Principal;
use crate::error::Error as StoreError;
use crate::store::StoreHandle;
use crate::types::{NewMembership, ProjectMembership, Role};

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("insufficient permissions")]
    Forbidden,

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] StoreError),
}

#[derive(Clone)]
pub struct ProjectRoleGuard {
    store: StoreHandle,
}

impl ProjectRoleGuard {
    #[must_use]
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Returns the user's effective role, or `None` if they have no access.
    /// Fails with `NotFound` when the project does not exist.
    pub async fn effective_role(
        &self,
        user_id: i64,
        project_id: i64,
    ) -> Result<Option<Role>, AccessError> {
        let lookup = self
            .store
            .run(move |store| {
                let Some(owner_id) = store.find_project_owner_id(project_id)? else {
                    return Ok(None);
                };
                if owner_id == user_id {
                    return Ok(Some(Some(Role::Owner)));
                }
                let membership = store.get_user_membership(project_id, user_id)?;
                Ok(Some(membership.map(|m| m.role)))
            })
            .await?;

        lookup.ok_or(AccessError::NotFound("project"))
    }

    /// True if the user created the project or holds any membership on it.
    pub async fn has_access(&self, user_id: i64, project_id: i64) -> Result<bool, AccessError> {
        Ok(self.effective_role(user_id, project_id).await?.is_some())
    }

    /// True if the user created the project or holds an `owner` membership.
    pub async fn is_owner_or_admin(
        &self,
        user_id: i64,
        project_id: i64,
    ) -> Result<bool, AccessError> {
        Ok(self.effective_role(user_id, project_id).await? == Some(Role::Owner))
    }

    /// Requires `principal` to hold at least `required` on the project.
    pub async fn check(
        &self,
        principal: &Principal,
        project_id: i64,
        required: Role,
    ) -> Result<Role, AccessError> {
        match self.effective_role(principal.user_id, project_id).await? {
            Some(role) if role.satisfies(required) => Ok(role),
            _ => {
                tracing::debug!(
                    user_id = principal.user_id,
                    project_id,
                    required = %required,
                    "project access denied"
                );
                Err(AccessError::Forbidden)
            }
        }
    }

    pub async fn list_members(
        &self,
        principal: &Principal,
        project_id: i64,
    ) -> Result<Vec<ProjectMembership>, AccessError> {
        self.check(principal, project_id, Role::Viewer).await?;

        Ok(self
            .store
            .run(move |store| store.list_project_members(project_id))
            .await?)
    }

    pub async fn add_member(
        &self,
        principal: &Principal,
        project_id: i64,
        email: &str,
        role: &str,
    ) -> Result<ProjectMembership, AccessError> {
        self.check(principal, project_id, Role::Owner).await?;
        let role = parse_role(role)?;

        let email = email.to_string();
        let (project, target) = self
            .store
            .run(move |store| {
                let project = store.get_project(project_id)?;
                let target = store.get_user_by_email(&email)?;
                Ok((project, target))
            })
            .await?;
        let project = project.ok_or(AccessError::NotFound("project"))?;
        let target = target.ok_or(AccessError::NotFound("user"))?;

        if target.id == project.owner_id {
            return Err(AccessError::Validation(
                "the project owner cannot be added as a member".to_string(),
            ));
        }

        let team_id = project.team_id;
        let target_id = target.id;
        let in_team = self
            .store
            .run(move |store| store.is_active_team_member(team_id, target_id))
            .await?;
        if !in_team {
            return Err(AccessError::Validation(
                "user must be a member of the team".to_string(),
            ));
        }

        let membership = NewMembership {
            project_id,
            user_id: target.id,
            role,
            granted_by: principal.user_id,
        };
        let created = self
            .store
            .run(move |store| store.insert_membership(&membership))
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists => {
                    AccessError::Conflict("user is already a member of this project".to_string())
                }
                other => AccessError::Internal(other),
            })?;

        tracing::info!(
            project_id,
            user_id = created.user_id,
            role = %created.role,
            granted_by = principal.user_id,
            "project member added"
        );
        Ok(created)
    }

    pub async fn update_member_role(
        &self,
        principal: &Principal,
        project_id: i64,
        member_id: i64,
        role: &str,
    ) -> Result<ProjectMembership, AccessError> {
        self.check(principal, project_id, Role::Owner).await?;
        let role = parse_role(role)?;

        let updated = self
            .store
            .run(move |store| store.update_membership_role(project_id, member_id, role))
            .await
            .map_err(|e| membership_error(e, "cannot demote the last owner of the project"))?;

        tracing::info!(project_id, member_id, role = %updated.role, "project member role changed");
        Ok(updated)
    }

    pub async fn remove_member(
        &self,
        principal: &Principal,
        project_id: i64,
        member_id: i64,
    ) -> Result<(), AccessError> {
        self.check(principal, project_id, Role::Owner).await?;

        self.store
            .run(move |store| store.delete_membership(project_id, member_id))
            .await
            .map_err(|e| membership_error(e, "cannot remove the last owner of the project"))?;

        tracing::info!(project_id, member_id, "project member removed");
        Ok(())
    }
}

fn parse_role(role: &str) -> Result<Role, AccessError> {
    role.parse::<Role>()
        .map_err(|e| AccessError::Validation(e.to_string()))
}

fn membership_error(err: StoreError, last_owner_message: &str) -> AccessError {
    match err {
        StoreError::NotFound => AccessError::NotFound("member"),
        StoreError::LastOwner => AccessError::Validation(last_owner_message.to_string()),
        other => AccessError::Internal(other),
    }
}
