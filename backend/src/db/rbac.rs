// Role, group, assignment and override persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vaulthalla_core::types::{GroupId, RoleId, UserId, VaultId};
use vaulthalla_core::{Error, Result};
use vaulthalla_store::model::{
    Group, NewOverride, OverrideEffect, PermissionOverride, Role, RoleAssignment, RoleType,
    Subject, SubjectType,
};
use vaulthalla_store::RbacStore;

use super::{db_err, PgStore};

#[derive(sqlx::FromRow)]
struct RoleRow {
    id: i32,
    name: String,
    role_type: String,
    permissions: i64,
}

impl RoleRow {
    fn into_model(self) -> Result<Role> {
        let role_type = match self.role_type.as_str() {
            "user" => RoleType::User,
            "vault" => RoleType::Vault,
            other => return Err(Error::Corrupt(format!("role carries unknown type '{other}'"))),
        };
        Ok(Role {
            id: self.id as u32,
            name: self.name,
            role_type,
            permissions: self.permissions as u64,
        })
    }
}

fn role_type_token(role_type: RoleType) -> &'static str {
    match role_type {
        RoleType::User => "user",
        RoleType::Vault => "vault",
    }
}

fn subject_token(kind: SubjectType) -> &'static str {
    match kind {
        SubjectType::User => "user",
        SubjectType::Group => "group",
    }
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    id: i32,
    subject_type: String,
    subject_id: i32,
    role_id: i32,
    vault_id: Option<i32>,
}

impl AssignmentRow {
    fn into_model(self) -> Result<RoleAssignment> {
        let kind = match self.subject_type.as_str() {
            "user" => SubjectType::User,
            "group" => SubjectType::Group,
            other => {
                return Err(Error::Corrupt(format!(
                    "assignment carries unknown subject '{other}'"
                )))
            }
        };
        Ok(RoleAssignment {
            id: self.id as u32,
            subject: Subject { kind, id: self.subject_id as u32 },
            role_id: self.role_id as u32,
            vault_id: self.vault_id.map(|v| v as u32),
        })
    }
}

#[derive(sqlx::FromRow)]
struct OverrideRow {
    id: i32,
    assignment_id: i32,
    capability_bit: i64,
    pattern: String,
    effect: String,
    enabled: bool,
}

impl OverrideRow {
    fn into_model(self) -> Result<PermissionOverride> {
        let effect = match self.effect.as_str() {
            "allow" => OverrideEffect::Allow,
            "deny" => OverrideEffect::Deny,
            other => {
                return Err(Error::Corrupt(format!(
                    "override carries unknown effect '{other}'"
                )))
            }
        };
        Ok(PermissionOverride {
            id: self.id as u32,
            assignment_id: self.assignment_id as u32,
            capability_bit: self.capability_bit as u64,
            pattern: self.pattern,
            effect,
            enabled: self.enabled,
        })
    }
}

#[async_trait]
impl RbacStore for PgStore {
    async fn create_role(&self, name: &str, role_type: RoleType, permissions: u64) -> Result<Role> {
        let row = sqlx::query_as::<_, RoleRow>(
            "INSERT INTO roles (name, role_type, permissions) VALUES ($1, $2, $3) \
             RETURNING id, name, role_type, permissions",
        )
        .bind(name)
        .bind(role_type_token(role_type))
        .bind(permissions as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("create role", e))?;
        row.into_model()
    }

    async fn role(&self, id: RoleId) -> Result<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(
            "SELECT id, name, role_type, permissions FROM roles WHERE id = $1",
        )
        .bind(id as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch role", e))?;
        row.map(RoleRow::into_model).transpose()
    }

    async fn role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(
            "SELECT id, name, role_type, permissions FROM roles WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("fetch role by name", e))?;
        row.map(RoleRow::into_model).transpose()
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            "SELECT id, name, role_type, permissions FROM roles ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list roles", e))?;
        rows.into_iter().map(RoleRow::into_model).collect()
    }

    async fn update_role_permissions(&self, id: RoleId, permissions: u64) -> Result<()> {
        sqlx::query("UPDATE roles SET permissions = $2 WHERE id = $1")
            .bind(id as i32)
            .bind(permissions as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("update role permissions", e))?;
        Ok(())
    }

    async fn delete_role(&self, id: RoleId) -> Result<()> {
        let result = sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(id as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete role", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("role {id}")));
        }
        Ok(())
    }

    async fn create_group(&self, name: &str) -> Result<Group> {
        #[derive(sqlx::FromRow)]
        struct GroupRow {
            id: i32,
            name: String,
            created_at: DateTime<Utc>,
        }
        let row = sqlx::query_as::<_, GroupRow>(
            "INSERT INTO groups (name) VALUES ($1) RETURNING id, name, created_at",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("create group", e))?;
        Ok(Group {
            id: row.id as u32,
            name: row.name,
            created_at: row.created_at,
        })
    }

    async fn add_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(group_id as i32)
        .bind(user_id as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("add group member", e))?;
        Ok(())
    }

    async fn remove_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND user_id = $2")
            .bind(group_id as i32)
            .bind(user_id as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("remove group member", e))?;
        Ok(())
    }

    async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<GroupId>> {
        let ids: Vec<i32> = sqlx::query_scalar(
            "SELECT group_id FROM group_members WHERE user_id = $1 ORDER BY group_id",
        )
        .bind(user_id as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list groups for user", e))?;
        Ok(ids.into_iter().map(|id| id as u32).collect())
    }

    async fn create_assignment(
        &self,
        subject: Subject,
        role_id: RoleId,
        vault_id: Option<VaultId>,
    ) -> Result<RoleAssignment> {
        let row = sqlx::query_as::<_, AssignmentRow>(
            "INSERT INTO role_assignments (subject_type, subject_id, role_id, vault_id) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, subject_type, subject_id, role_id, vault_id",
        )
        .bind(subject_token(subject.kind))
        .bind(subject.id as i32)
        .bind(role_id as i32)
        .bind(vault_id.map(|v| v as i32))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("create assignment", e))?;
        row.into_model()
    }

    async fn delete_assignment(&self, id: u32) -> Result<()> {
        let result = sqlx::query("DELETE FROM role_assignments WHERE id = $1")
            .bind(id as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete assignment", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("role assignment {id}")));
        }
        Ok(())
    }

    async fn assignments_for_subject(&self, subject: Subject) -> Result<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(
            "SELECT id, subject_type, subject_id, role_id, vault_id FROM role_assignments \
             WHERE subject_type = $1 AND subject_id = $2 ORDER BY id",
        )
        .bind(subject_token(subject.kind))
        .bind(subject.id as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list assignments", e))?;
        rows.into_iter().map(AssignmentRow::into_model).collect()
    }

    async fn create_override(&self, draft: NewOverride) -> Result<PermissionOverride> {
        let effect = match draft.effect {
            OverrideEffect::Allow => "allow",
            OverrideEffect::Deny => "deny",
        };
        let row = sqlx::query_as::<_, OverrideRow>(
            "INSERT INTO permission_overrides (assignment_id, capability_bit, pattern, effect) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, assignment_id, capability_bit, pattern, effect, enabled",
        )
        .bind(draft.assignment_id as i32)
        .bind(draft.capability_bit as i64)
        .bind(&draft.pattern)
        .bind(effect)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("create override", e))?;
        row.into_model()
    }

    async fn overrides_for_assignment(
        &self,
        assignment_id: u32,
    ) -> Result<Vec<PermissionOverride>> {
        let rows = sqlx::query_as::<_, OverrideRow>(
            "SELECT id, assignment_id, capability_bit, pattern, effect, enabled \
             FROM permission_overrides WHERE assignment_id = $1 ORDER BY id",
        )
        .bind(assignment_id as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list overrides", e))?;
        rows.into_iter().map(OverrideRow::into_model).collect()
    }

    async fn set_override_enabled(&self, id: u32, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE permission_overrides SET enabled = $2 WHERE id = $1")
            .bind(id as i32)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("toggle override", e))?;
        Ok(())
    }

    async fn delete_override(&self, id: u32) -> Result<()> {
        let result = sqlx::query("DELETE FROM permission_overrides WHERE id = $1")
            .bind(id as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete override", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("permission override {id}")));
        }
        Ok(())
    }
}
