//! Users and ACL rules on SQLite.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use crate::types::{AclRule, User};
use crate::{Result, StorageError, UserStore};

use super::{millis_to_time, SqliteStore};

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;
    Ok(User {
        username: row.get("username")?,
        password_hash: row.get("password_hash")?,
        enabled: row.get("enabled")?,
        can_subscribe: row.get("can_subscribe")?,
        can_publish: row.get("can_publish")?,
        is_admin: row.get("is_admin")?,
        created_at: millis_to_time(created_at).unwrap_or_else(Utc::now),
        updated_at: millis_to_time(updated_at).unwrap_or_else(Utc::now),
    })
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<AclRule> {
    let created_at: i64 = row.get("created_at")?;
    Ok(AclRule {
        id: row.get("id")?,
        username: row.get("username")?,
        topic_pattern: row.get("topic_pattern")?,
        can_subscribe: row.get("can_subscribe")?,
        can_publish: row.get("can_publish")?,
        priority: row.get("priority")?,
        created_at: millis_to_time(created_at).unwrap_or_else(Utc::now),
    })
}

const USER_COLUMNS: &str =
    "username, password_hash, enabled, can_subscribe, can_publish, is_admin, created_at, updated_at";

const RULE_COLUMNS: &str =
    "id, username, topic_pattern, can_subscribe, can_publish, priority, created_at";

#[async_trait]
impl UserStore for SqliteStore {
    async fn create_user(&self, user: User) -> Result<()> {
        self.blocking(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO users ({USER_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    user.username,
                    user.password_hash,
                    user.enabled,
                    user.can_subscribe,
                    user.can_publish,
                    user.is_admin,
                    user.created_at.timestamp_millis(),
                    user.updated_at.timestamp_millis(),
                ],
            )?;
            if inserted == 0 {
                return Err(StorageError::Permanent(format!(
                    "user `{}` already exists",
                    user.username
                )));
            }
            Ok(())
        })
        .await
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let username = username.to_string();
        self.blocking(move |conn| {
            let user = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                    params![username],
                    row_to_user,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn update_user(&self, user: User) -> Result<()> {
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE users SET password_hash = ?2, enabled = ?3, can_subscribe = ?4,
                     can_publish = ?5, is_admin = ?6, updated_at = ?7
                 WHERE username = ?1",
                params![
                    user.username,
                    user.password_hash,
                    user.enabled,
                    user.can_subscribe,
                    user.can_publish,
                    user.is_admin,
                    Utc::now().timestamp_millis(),
                ],
            )?;
            if updated == 0 {
                return Err(StorageError::NotFound(user.username));
            }
            Ok(())
        })
        .await
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        let username = username.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM acl_rules WHERE username = ?1", params![username])?;
            tx.execute("DELETE FROM users WHERE username = ?1", params![username])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY username"))?;
            let rows = stmt.query_map([], row_to_user)?;

            let mut users = Vec::new();
            for row in rows {
                match row {
                    Ok(user) => users.push(user),
                    Err(e) => warn!(error = %e, "skipping unreadable user row"),
                }
            }
            Ok(users)
        })
        .await
    }

    async fn validate_credentials(&self, username: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_user(username).await? else {
            return Ok(None);
        };
        if !user.enabled {
            return Ok(None);
        }

        let password = password.to_string();
        let hash = user.password_hash.clone();
        // Adaptive hash verification is CPU-bound; keep it off the event loop.
        let valid = tokio::task::spawn_blocking(move || {
            crate::password::verify_password(&password, &hash)
        })
        .await
        .map_err(|e| StorageError::Transient(e.to_string()))?;

        Ok(valid.then_some(user))
    }

    async fn create_acl_rule(&self, rule: AclRule) -> Result<AclRule> {
        self.blocking(move |conn| {
            let user_exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM users WHERE username = ?1",
                    params![rule.username],
                    |row| row.get(0),
                )
                .optional()?;
            if user_exists.is_none() {
                return Err(StorageError::NotFound(rule.username));
            }

            conn.execute(
                "INSERT INTO acl_rules
                     (username, topic_pattern, can_subscribe, can_publish, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    rule.username,
                    rule.topic_pattern,
                    rule.can_subscribe,
                    rule.can_publish,
                    rule.priority,
                    rule.created_at.timestamp_millis(),
                ],
            )?;

            let id = conn.last_insert_rowid();
            Ok(AclRule { id, ..rule })
        })
        .await
    }

    async fn update_acl_rule(&self, rule: AclRule) -> Result<()> {
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE acl_rules SET topic_pattern = ?2, can_subscribe = ?3,
                     can_publish = ?4, priority = ?5
                 WHERE id = ?1",
                params![
                    rule.id,
                    rule.topic_pattern,
                    rule.can_subscribe,
                    rule.can_publish,
                    rule.priority
                ],
            )?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!("acl rule {}", rule.id)));
            }
            Ok(())
        })
        .await
    }

    async fn delete_acl_rule(&self, id: i64) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute("DELETE FROM acl_rules WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn list_acl_rules(&self, username: Option<&str>) -> Result<Vec<AclRule>> {
        let username = username.map(|s| s.to_string());
        self.blocking(move |conn| {
            let mut rules = Vec::new();
            match username {
                Some(username) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {RULE_COLUMNS} FROM acl_rules
                         WHERE username = ?1 ORDER BY priority DESC, id"
                    ))?;
                    let rows = stmt.query_map(params![username], row_to_rule)?;
                    for row in rows {
                        rules.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {RULE_COLUMNS} FROM acl_rules ORDER BY priority DESC, id"
                    ))?;
                    let rows = stmt.query_map([], row_to_rule)?;
                    for row in rows {
                        rules.push(row?);
                    }
                }
            }
            Ok(rules)
        })
        .await
    }

    async fn load_all_users_and_acls(&self) -> Result<(Vec<User>, Vec<AclRule>)> {
        let users = self.list_users().await?;
        let rules = self.list_acl_rules(None).await?;
        Ok((users, rules))
    }
}
