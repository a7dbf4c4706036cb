//! Directory database schema and operations
//!
//! Tables:
//! - users: Core account records (credentials, profile, recovery state)
//! - channels: Contact channels owned by users
//! - groups: Named channel groupings, unique per (owner, name)
//! - channel_groups: Channel to group many-to-many join table
//! - contacts: Directed "added as contact" edges with lifecycle state
//!
//! Uniqueness of emails, usernames, and group names is enforced by SQL
//! constraints; the pre-checks in callers only shape the error message.
//! Constraint violations are translated back to the matching domain error
//! so a lost check-then-insert race still surfaces as `Duplicate*`.

use linkbook_common::{
    Channel, ChannelType, Contact, ContactState, Database, Error, Group, OAuthProvider,
    PublicUser, Result, User,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;

pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Directory database wrapper
#[derive(Clone)]
pub struct DirectoryDb {
    db: Database,
}

// ============================================================================
// Input types
// ============================================================================

/// Fields for a new user row. Exactly one of `password_hash` or a provider id
/// must be present so the at-least-one-login-method invariant holds.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: Option<String>,
    pub google_id: Option<String>,
    pub github_id: Option<String>,
    pub discord_id: Option<String>,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
}

/// Partial profile update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
}

/// Partial channel update; `None` fields are left untouched. A present
/// `group_ids` (including an empty list) replaces the whole association set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelUpdate {
    #[serde(rename = "type")]
    pub channel_type: Option<ChannelType>,
    pub value: Option<String>,
    pub label: Option<String>,
    pub is_public: Option<bool>,
    pub is_primary: Option<bool>,
    pub sort_order: Option<i64>,
    pub group_ids: Option<Vec<i64>>,
}

/// Partial group update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub sort_order: Option<i64>,
}

// ============================================================================
// Output types
// ============================================================================

/// One entry in a user's contact list: the edge joined with the target's
/// public profile.
#[derive(Debug, Clone, Serialize)]
pub struct ContactEntry {
    pub contact_id: i64,
    pub added_at: i64,
    #[serde(flatten)]
    pub user: PublicUser,
}

/// A user search hit, annotated with whether the searcher already has an
/// active contact edge to it.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub user: PublicUser,
    pub is_contact: bool,
}

// ============================================================================
// Row mapping
// ============================================================================

const USER_COLUMNS: &str = "id, email, username, password_hash, google_id, github_id, discord_id, \
     display_name, first_name, last_name, avatar_url, bio, \
     otp_code, otp_expires_at, recovery_token, recovery_expires_at, created_at, updated_at";

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        password_hash: row.get(3)?,
        google_id: row.get(4)?,
        github_id: row.get(5)?,
        discord_id: row.get(6)?,
        display_name: row.get(7)?,
        first_name: row.get(8)?,
        last_name: row.get(9)?,
        avatar_url: row.get(10)?,
        bio: row.get(11)?,
        otp_code: row.get(12)?,
        otp_expires_at: row.get(13)?,
        recovery_token: row.get(14)?,
        recovery_expires_at: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        sort_order: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_public_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublicUser> {
    Ok(PublicUser {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        avatar_url: row.get(5)?,
        bio: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Translate a UNIQUE constraint violation into the matching domain error.
fn map_unique_violation(e: rusqlite::Error) -> Error {
    let msg = e.to_string();
    if msg.contains("users.email") {
        Error::DuplicateEmail
    } else if msg.contains("users.username") {
        Error::DuplicateUsername
    } else if msg.contains("groups.user_id") || msg.contains("groups.name") {
        Error::DuplicateGroupName
    } else {
        Error::Database(e)
    }
}

fn channel_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let type_str: String = row.get(2)?;
    Ok(Channel {
        id: row.get(0)?,
        user_id: row.get(1)?,
        channel_type: ChannelType::from_str(&type_str).map_err(|_| {
            rusqlite::Error::InvalidColumnType(2, "type".into(), rusqlite::types::Type::Text)
        })?,
        value: row.get(3)?,
        label: row.get(4)?,
        is_public: row.get::<_, i64>(5)? != 0,
        is_primary: row.get::<_, i64>(6)? != 0,
        sort_order: row.get(7)?,
        group_ids: Vec::new(),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const CHANNEL_COLUMNS: &str =
    "id, user_id, type, value, label, is_public, is_primary, sort_order, created_at, updated_at";

// ============================================================================
// Database implementation
// ============================================================================

impl DirectoryDb {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Initialize directory schema
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute_batch(
            r#"
            -- Accounts
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT,
                google_id TEXT UNIQUE,
                github_id TEXT UNIQUE,
                discord_id TEXT UNIQUE,
                display_name TEXT,
                first_name TEXT,
                last_name TEXT,
                avatar_url TEXT,
                bio TEXT,
                otp_code TEXT,
                otp_expires_at INTEGER,
                recovery_token TEXT,
                recovery_expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);
            CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

            -- Contact channels
            CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                value TEXT NOT NULL,
                label TEXT,
                is_public INTEGER NOT NULL DEFAULT 1,
                is_primary INTEGER NOT NULL DEFAULT 0,
                sort_order INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_channels_user ON channels(user_id);

            -- Channel groups, name unique per owner
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                sort_order INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE,
                UNIQUE(user_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_groups_user ON groups(user_id);

            -- Channel <-> group associations
            CREATE TABLE IF NOT EXISTS channel_groups (
                channel_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                PRIMARY KEY (channel_id, group_id),
                FOREIGN KEY(channel_id) REFERENCES channels(id) ON DELETE CASCADE,
                FOREIGN KEY(group_id) REFERENCES groups(id) ON DELETE CASCADE
            );

            -- Contact edges
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                contact_user_id INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'active',
                created_at INTEGER NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY(contact_user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_user ON contacts(user_id);
            CREATE INDEX IF NOT EXISTS idx_contacts_pair ON contacts(user_id, contact_user_id);
            "#,
        )?;

        info!("Directory database schema initialized");
        Ok(())
    }

    // ========================================================================
    // User operations
    // ========================================================================

    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let now = now_epoch_secs();
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO users (email, username, password_hash, google_id, github_id, discord_id, \
             display_name, first_name, last_name, avatar_url, bio, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                new.email,
                new.username,
                new.password_hash,
                new.google_id,
                new.github_id,
                new.discord_id,
                new.display_name,
                new.first_name,
                new.last_name,
                new.avatar_url,
                new.bio,
                now,
            ],
        )
        .map_err(map_unique_violation)?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.get_user(id)?.ok_or(Error::UserNotFound)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            params![id],
            row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
            params![email],
            row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
            params![username],
            row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_user_by_provider_id(
        &self,
        provider: OAuthProvider,
        provider_id: &str,
    ) -> Result<Option<User>> {
        let column = provider_column(provider);
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column),
            params![provider_id],
            row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Attach an OAuth provider id to an existing account.
    pub fn link_provider(
        &self,
        user_id: i64,
        provider: OAuthProvider,
        provider_id: &str,
    ) -> Result<()> {
        let column = provider_column(provider);
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            &format!(
                "UPDATE users SET {} = ?1, updated_at = ?2 WHERE id = ?3",
                column
            ),
            params![provider_id, now_epoch_secs(), user_id],
        )?;
        Ok(())
    }

    pub fn update_profile(&self, user_id: i64, update: &ProfileUpdate) -> Result<User> {
        let now = now_epoch_secs();
        {
            let conn = self.db.connection();
            let conn = conn.lock();
            conn.execute(
                "UPDATE users SET \
                 display_name = COALESCE(?1, display_name), \
                 first_name = COALESCE(?2, first_name), \
                 last_name = COALESCE(?3, last_name), \
                 avatar_url = COALESCE(?4, avatar_url), \
                 bio = COALESCE(?5, bio), \
                 updated_at = ?6 \
                 WHERE id = ?7",
                params![
                    update.display_name,
                    update.first_name,
                    update.last_name,
                    update.avatar_url,
                    update.bio,
                    now,
                    user_id,
                ],
            )?;
        }
        self.get_user(user_id)?.ok_or(Error::UserNotFound)
    }

    // ========================================================================
    // Recovery state
    // ========================================================================

    /// Persist a freshly issued OTP and recovery token. Supersedes any
    /// previous in-flight recovery for this user.
    pub fn set_recovery_state(
        &self,
        user_id: i64,
        otp_code: &str,
        otp_expires_at: i64,
        recovery_token: &str,
        recovery_expires_at: i64,
    ) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE users SET otp_code = ?1, otp_expires_at = ?2, \
             recovery_token = ?3, recovery_expires_at = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                otp_code,
                otp_expires_at,
                recovery_token,
                recovery_expires_at,
                now_epoch_secs(),
                user_id
            ],
        )?;
        Ok(())
    }

    /// Clear the OTP pair after a successful email verification.
    pub fn clear_otp(&self, user_id: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE users SET otp_code = NULL, otp_expires_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_epoch_secs(), user_id],
        )?;
        Ok(())
    }

    /// Clear the recovery session token once any method has verified.
    pub fn clear_recovery_token(&self, user_id: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE users SET recovery_token = NULL, recovery_expires_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_epoch_secs(), user_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Channel operations
    // ========================================================================

    pub fn list_channels(&self, user_id: i64) -> Result<Vec<Channel>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE user_id = ?1 ORDER BY sort_order, id",
            CHANNEL_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], channel_from_row)?;

        let mut channels = Vec::new();
        for row in rows {
            let mut ch = row?;
            ch.group_ids = load_group_ids(&conn, ch.id)?;
            channels.push(ch);
        }
        Ok(channels)
    }

    /// Public channels only, ordered for display. Used by the public profile.
    pub fn list_public_channels(&self, user_id: i64) -> Result<Vec<Channel>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE user_id = ?1 AND is_public = 1 ORDER BY sort_order, id",
            CHANNEL_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], channel_from_row)?;

        let mut channels = Vec::new();
        for row in rows {
            let mut ch = row?;
            ch.group_ids = load_group_ids(&conn, ch.id)?;
            channels.push(ch);
        }
        Ok(channels)
    }

    pub fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let ch = conn
            .query_row(
                &format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLUMNS),
                params![id],
                channel_from_row,
            )
            .optional()?;
        match ch {
            Some(mut ch) => {
                ch.group_ids = load_group_ids(&conn, ch.id)?;
                Ok(Some(ch))
            }
            None => Ok(None),
        }
    }

    /// Create a channel. Group ids not owned by `user_id` are silently
    /// filtered out of the association set.
    #[allow(clippy::too_many_arguments)]
    pub fn create_channel(
        &self,
        user_id: i64,
        channel_type: ChannelType,
        value: &str,
        label: Option<&str>,
        is_public: bool,
        is_primary: bool,
        sort_order: i64,
        group_ids: &[i64],
    ) -> Result<Channel> {
        let now = now_epoch_secs();
        let id = {
            let conn = self.db.connection();
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO channels (user_id, type, value, label, is_public, is_primary, sort_order, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    user_id,
                    channel_type.to_string(),
                    value,
                    label,
                    is_public as i64,
                    is_primary as i64,
                    sort_order,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            let owned = filter_owned_groups(&conn, user_id, group_ids)?;
            for gid in owned {
                conn.execute(
                    "INSERT OR IGNORE INTO channel_groups (channel_id, group_id) VALUES (?1, ?2)",
                    params![id, gid],
                )?;
            }
            id
        };
        self.get_channel(id)?.ok_or(Error::ChannelNotFound)
    }

    /// Apply a partial update. When `group_ids` is present the association
    /// set is replaced wholesale, so an empty list detaches everything.
    pub fn update_channel(&self, channel: &Channel, update: &ChannelUpdate) -> Result<Channel> {
        let now = now_epoch_secs();
        {
            let conn = self.db.connection();
            let conn = conn.lock();
            conn.execute(
                "UPDATE channels SET \
                 type = COALESCE(?1, type), \
                 value = COALESCE(?2, value), \
                 label = COALESCE(?3, label), \
                 is_public = COALESCE(?4, is_public), \
                 is_primary = COALESCE(?5, is_primary), \
                 sort_order = COALESCE(?6, sort_order), \
                 updated_at = ?7 \
                 WHERE id = ?8",
                params![
                    update.channel_type.map(|t| t.to_string()),
                    update.value,
                    update.label,
                    update.is_public.map(|b| b as i64),
                    update.is_primary.map(|b| b as i64),
                    update.sort_order,
                    now,
                    channel.id,
                ],
            )?;

            if let Some(group_ids) = &update.group_ids {
                conn.execute(
                    "DELETE FROM channel_groups WHERE channel_id = ?1",
                    params![channel.id],
                )?;
                let owned = filter_owned_groups(&conn, channel.user_id, group_ids)?;
                for gid in owned {
                    conn.execute(
                        "INSERT OR IGNORE INTO channel_groups (channel_id, group_id) VALUES (?1, ?2)",
                        params![channel.id, gid],
                    )?;
                }
            }
        }
        self.get_channel(channel.id)?.ok_or(Error::ChannelNotFound)
    }

    pub fn delete_channel(&self, id: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute("DELETE FROM channel_groups WHERE channel_id = ?1", params![id])?;
        conn.execute("DELETE FROM channels WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ========================================================================
    // Group operations
    // ========================================================================

    pub fn list_groups(&self, user_id: i64) -> Result<Vec<Group>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, description, sort_order, created_at, updated_at \
             FROM groups WHERE user_id = ?1 ORDER BY sort_order, name",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_group)?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    pub fn get_group(&self, id: i64, user_id: i64) -> Result<Option<Group>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            "SELECT id, user_id, name, description, sort_order, created_at, updated_at \
             FROM groups WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
            row_to_group,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_group_by_name(&self, user_id: i64, name: &str) -> Result<Option<Group>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            "SELECT id, user_id, name, description, sort_order, created_at, updated_at \
             FROM groups WHERE user_id = ?1 AND name = ?2",
            params![user_id, name],
            row_to_group,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn create_group(
        &self,
        user_id: i64,
        name: &str,
        description: Option<&str>,
        sort_order: i64,
    ) -> Result<Group> {
        let now = now_epoch_secs();
        let id = {
            let conn = self.db.connection();
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO groups (user_id, name, description, sort_order, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![user_id, name, description, sort_order, now],
            )
            .map_err(map_unique_violation)?;
            conn.last_insert_rowid()
        };
        self.get_group(id, user_id)?.ok_or(Error::GroupNotFound)
    }

    pub fn update_group(&self, group: &Group, update: &GroupUpdate) -> Result<Group> {
        let now = now_epoch_secs();
        {
            let conn = self.db.connection();
            let conn = conn.lock();
            conn.execute(
                "UPDATE groups SET \
                 name = COALESCE(?1, name), \
                 description = COALESCE(?2, description), \
                 sort_order = COALESCE(?3, sort_order), \
                 updated_at = ?4 \
                 WHERE id = ?5",
                params![update.name, update.description, update.sort_order, now, group.id],
            )
            .map_err(map_unique_violation)?;
        }
        self.get_group(group.id, group.user_id)?
            .ok_or(Error::GroupNotFound)
    }

    /// Delete a group and its channel associations. The channels themselves
    /// are untouched.
    pub fn delete_group(&self, id: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute("DELETE FROM channel_groups WHERE group_id = ?1", params![id])?;
        conn.execute("DELETE FROM groups WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ========================================================================
    // Contact operations
    // ========================================================================

    pub fn add_contact(&self, user_id: i64, contact_user_id: i64) -> Result<Contact> {
        if user_id == contact_user_id {
            return Err(Error::SelfContact);
        }

        let now = now_epoch_secs();
        let conn = self.db.connection();
        let conn = conn.lock();

        let target_exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE id = ?1",
                params![contact_user_id],
                |row| row.get(0),
            )
            .optional()?;
        if target_exists.is_none() {
            return Err(Error::TargetNotFound);
        }

        let active: Option<i64> = conn
            .query_row(
                "SELECT id FROM contacts WHERE user_id = ?1 AND contact_user_id = ?2 AND state = 'active'",
                params![user_id, contact_user_id],
                |row| row.get(0),
            )
            .optional()?;
        if active.is_some() {
            return Err(Error::ContactExists);
        }

        conn.execute(
            "INSERT INTO contacts (user_id, contact_user_id, state, created_at) \
             VALUES (?1, ?2, 'active', ?3)",
            params![user_id, contact_user_id, now],
        )?;

        Ok(Contact {
            id: conn.last_insert_rowid(),
            user_id,
            contact_user_id,
            state: ContactState::Active,
            created_at: now,
        })
    }

    /// Soft-remove the active edge. Returns false when there is nothing to
    /// remove; that is not an error.
    pub fn remove_contact(&self, user_id: i64, contact_user_id: i64) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "UPDATE contacts SET state = 'removed' \
             WHERE user_id = ?1 AND contact_user_id = ?2 AND state = 'active'",
            params![user_id, contact_user_id],
        )?;
        Ok(changed > 0)
    }

    pub fn is_contact(&self, user_id: i64, contact_user_id: i64) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let row: Option<i64> = conn
            .query_row(
                "SELECT id FROM contacts WHERE user_id = ?1 AND contact_user_id = ?2 AND state = 'active'",
                params![user_id, contact_user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Active contacts joined with the target's public profile.
    pub fn list_contacts(&self, user_id: i64) -> Result<Vec<ContactEntry>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.created_at, \
             u.id, u.username, u.display_name, u.first_name, u.last_name, u.avatar_url, u.bio, u.created_at \
             FROM contacts c JOIN users u ON u.id = c.contact_user_id \
             WHERE c.user_id = ?1 AND c.state = 'active' ORDER BY c.created_at, c.id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(ContactEntry {
                contact_id: row.get(0)?,
                added_at: row.get(1)?,
                user: PublicUser {
                    id: row.get(2)?,
                    username: row.get(3)?,
                    display_name: row.get(4)?,
                    first_name: row.get(5)?,
                    last_name: row.get(6)?,
                    avatar_url: row.get(7)?,
                    bio: row.get(8)?,
                    created_at: row.get(9)?,
                },
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Case-insensitive substring search across username, names, and email.
    /// The searching user is excluded and each hit is annotated with whether
    /// it is already an active contact.
    pub fn search_users(&self, searcher_id: i64, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let pattern = format!("%{}%", query.to_lowercase());
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, display_name, first_name, last_name, avatar_url, bio, created_at \
             FROM users WHERE id != ?1 AND ( \
                 lower(username) LIKE ?2 OR \
                 lower(COALESCE(first_name, '')) LIKE ?2 OR \
                 lower(COALESCE(last_name, '')) LIKE ?2 OR \
                 lower(COALESCE(display_name, '')) LIKE ?2 OR \
                 lower(email) LIKE ?2 \
             ) ORDER BY username LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![searcher_id, pattern, limit], row_to_public_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }

        let mut hits = Vec::new();
        for user in users {
            let is_contact: Option<i64> = conn
                .query_row(
                    "SELECT id FROM contacts WHERE user_id = ?1 AND contact_user_id = ?2 AND state = 'active'",
                    params![searcher_id, user.id],
                    |row| row.get(0),
                )
                .optional()?;
            hits.push(SearchHit {
                user,
                is_contact: is_contact.is_some(),
            });
        }
        Ok(hits)
    }
}

fn provider_column(provider: OAuthProvider) -> &'static str {
    match provider {
        OAuthProvider::Google => "google_id",
        OAuthProvider::GitHub => "github_id",
        OAuthProvider::Discord => "discord_id",
    }
}

fn load_group_ids(conn: &Connection, channel_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn
        .prepare("SELECT group_id FROM channel_groups WHERE channel_id = ?1 ORDER BY group_id")?;
    let rows = stmt.query_map(params![channel_id], |row| row.get(0))?;
    rows.collect()
}

/// Keep only group ids that actually belong to `user_id`. Foreign or
/// nonexistent ids are dropped without error.
fn filter_owned_groups(conn: &Connection, user_id: i64, group_ids: &[i64]) -> rusqlite::Result<Vec<i64>> {
    let mut owned = Vec::new();
    for gid in group_ids {
        let hit: Option<i64> = conn
            .query_row(
                "SELECT id FROM groups WHERE id = ?1 AND user_id = ?2",
                params![gid, user_id],
                |row| row.get(0),
            )
            .optional()?;
        if hit.is_some() {
            owned.push(*gid);
        }
    }
    Ok(owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> DirectoryDb {
        let db = Database::open_memory().unwrap();
        let ddb = DirectoryDb::new(db);
        ddb.init_schema().unwrap();
        ddb
    }

    fn user(db: &DirectoryDb, email: &str, username: &str) -> User {
        db.create_user(&NewUser {
            email: email.to_string(),
            username: username.to_string(),
            password_hash: Some("$argon2id$stub".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_duplicate_email_and_username() {
        let db = test_db();
        user(&db, "a@example.com", "alice");

        let err = db
            .create_user(&NewUser {
                email: "a@example.com".to_string(),
                username: "other".to_string(),
                password_hash: Some("h".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateEmail));

        let err = db
            .create_user(&NewUser {
                email: "b@example.com".to_string(),
                username: "alice".to_string(),
                password_hash: Some("h".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateUsername));
    }

    #[test]
    fn test_group_name_unique_per_user_only() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let b = user(&db, "b@example.com", "bob");

        db.create_group(a.id, "Work", None, 0).unwrap();
        let err = db.create_group(a.id, "Work", None, 1).unwrap_err();
        assert!(matches!(err, Error::DuplicateGroupName));

        // Same name for a different owner is fine.
        db.create_group(b.id, "Work", None, 0).unwrap();
    }

    #[test]
    fn test_group_rename_collision() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        db.create_group(a.id, "Work", None, 0).unwrap();
        let personal = db.create_group(a.id, "Personal", None, 1).unwrap();

        let err = db
            .update_group(
                &personal,
                &GroupUpdate {
                    name: Some("Work".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateGroupName));
    }

    #[test]
    fn test_channel_group_association_filters_foreign_groups() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let b = user(&db, "b@example.com", "bob");

        let mine = db.create_group(a.id, "Mine", None, 0).unwrap();
        let theirs = db.create_group(b.id, "Theirs", None, 0).unwrap();

        let ch = db
            .create_channel(
                a.id,
                ChannelType::Phone,
                "+1555",
                None,
                true,
                false,
                0,
                &[mine.id, theirs.id, 9999],
            )
            .unwrap();
        assert_eq!(ch.group_ids, vec![mine.id]);
    }

    #[test]
    fn test_channel_update_replaces_group_set() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let g1 = db.create_group(a.id, "One", None, 0).unwrap();
        let g2 = db.create_group(a.id, "Two", None, 1).unwrap();

        let ch = db
            .create_channel(a.id, ChannelType::Email, "a@x.com", None, true, false, 0, &[g1.id])
            .unwrap();
        assert_eq!(ch.group_ids, vec![g1.id]);

        // Replace with g2 only.
        let ch = db
            .update_channel(
                &ch,
                &ChannelUpdate {
                    group_ids: Some(vec![g2.id]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(ch.group_ids, vec![g2.id]);

        // Explicit empty set detaches everything.
        let ch = db
            .update_channel(
                &ch,
                &ChannelUpdate {
                    group_ids: Some(vec![]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(ch.group_ids.is_empty());

        // Absent group_ids leaves associations alone.
        let ch = db
            .update_channel(
                &ch,
                &ChannelUpdate {
                    group_ids: Some(vec![g1.id, g2.id]),
                    ..Default::default()
                },
            )
            .unwrap();
        let ch = db
            .update_channel(
                &ch,
                &ChannelUpdate {
                    value: Some("new@x.com".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(ch.value, "new@x.com");
        assert_eq!(ch.group_ids, vec![g1.id, g2.id]);
    }

    #[test]
    fn test_delete_group_keeps_channels() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let g = db.create_group(a.id, "G", None, 0).unwrap();
        let ch = db
            .create_channel(a.id, ChannelType::Phone, "+1", None, true, false, 0, &[g.id])
            .unwrap();

        db.delete_group(g.id).unwrap();

        let ch = db.get_channel(ch.id).unwrap().unwrap();
        assert!(ch.group_ids.is_empty());
        assert!(db.get_group(g.id, a.id).unwrap().is_none());
    }

    #[test]
    fn test_channel_ordering() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        db.create_channel(a.id, ChannelType::Phone, "second", None, true, false, 5, &[])
            .unwrap();
        db.create_channel(a.id, ChannelType::Phone, "first", None, true, false, 1, &[])
            .unwrap();
        db.create_channel(a.id, ChannelType::Phone, "third", None, true, false, 5, &[])
            .unwrap();

        let values: Vec<String> = db
            .list_channels(a.id)
            .unwrap()
            .into_iter()
            .map(|c| c.value)
            .collect();
        assert_eq!(values, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_public_channels_filter() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        db.create_channel(a.id, ChannelType::Phone, "public", None, true, false, 0, &[])
            .unwrap();
        db.create_channel(a.id, ChannelType::Phone, "private", None, false, false, 1, &[])
            .unwrap();

        let public = db.list_public_channels(a.id).unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].value, "public");
    }

    #[test]
    fn test_self_contact_rejected() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let err = db.add_contact(a.id, a.id).unwrap_err();
        assert!(matches!(err, Error::SelfContact));
    }

    #[test]
    fn test_contact_add_remove_lifecycle() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let b = user(&db, "b@example.com", "bob");

        db.add_contact(a.id, b.id).unwrap();
        let err = db.add_contact(a.id, b.id).unwrap_err();
        assert!(matches!(err, Error::ContactExists));

        assert!(db.remove_contact(a.id, b.id).unwrap());
        assert!(!db.is_contact(a.id, b.id).unwrap());
        // Second removal finds nothing, reports false rather than an error.
        assert!(!db.remove_contact(a.id, b.id).unwrap());

        // Re-adding after removal is allowed.
        db.add_contact(a.id, b.id).unwrap();
        assert!(db.is_contact(a.id, b.id).unwrap());
    }

    #[test]
    fn test_contact_edges_are_directed() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let b = user(&db, "b@example.com", "bob");

        db.add_contact(a.id, b.id).unwrap();
        db.add_contact(b.id, a.id).unwrap();

        db.remove_contact(a.id, b.id).unwrap();
        assert!(!db.is_contact(a.id, b.id).unwrap());
        assert!(db.is_contact(b.id, a.id).unwrap());
    }

    #[test]
    fn test_add_contact_unknown_target() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let err = db.add_contact(a.id, 424242).unwrap_err();
        assert!(matches!(err, Error::TargetNotFound));
    }

    #[test]
    fn test_search_users() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let b = db
            .create_user(&NewUser {
                email: "bob@example.com".to_string(),
                username: "bobby".to_string(),
                password_hash: Some("h".to_string()),
                first_name: Some("Robert".to_string()),
                ..Default::default()
            })
            .unwrap();
        user(&db, "carol@example.com", "carol");

        // Substring of first_name, case-insensitive.
        let hits = db.search_users(a.id, "ROBER", 20).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user.id, b.id);
        assert!(!hits[0].is_contact);

        db.add_contact(a.id, b.id).unwrap();
        let hits = db.search_users(a.id, "bobby", 20).unwrap();
        assert!(hits[0].is_contact);

        // Searcher is excluded from results.
        let hits = db.search_users(a.id, "alice", 20).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_provider_linking() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        db.link_provider(a.id, OAuthProvider::GitHub, "gh-123").unwrap();

        let found = db
            .get_user_by_provider_id(OAuthProvider::GitHub, "gh-123")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, a.id);
        assert_eq!(found.login_methods(), vec!["email", "github"]);
    }

    #[test]
    fn test_profile_partial_update() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        let updated = db
            .update_profile(
                a.id,
                &ProfileUpdate {
                    display_name: Some("Alice".to_string()),
                    bio: Some("hi".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("Alice"));

        // Untouched fields survive the next partial update.
        let updated = db
            .update_profile(
                a.id,
                &ProfileUpdate {
                    first_name: Some("A".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("Alice"));
        assert_eq!(updated.bio.as_deref(), Some("hi"));
    }

    #[test]
    fn test_recovery_state_roundtrip() {
        let db = test_db();
        let a = user(&db, "a@example.com", "alice");
        db.set_recovery_state(a.id, "123456", 100, "tok", 200).unwrap();

        let u = db.get_user(a.id).unwrap().unwrap();
        assert_eq!(u.otp_code.as_deref(), Some("123456"));
        assert_eq!(u.recovery_token.as_deref(), Some("tok"));

        db.clear_otp(a.id).unwrap();
        let u = db.get_user(a.id).unwrap().unwrap();
        assert!(u.otp_code.is_none());
        assert!(u.otp_expires_at.is_none());
        assert_eq!(u.recovery_token.as_deref(), Some("tok"));

        db.clear_recovery_token(a.id).unwrap();
        let u = db.get_user(a.id).unwrap().unwrap();
        assert!(u.recovery_token.is_none());
        assert!(u.recovery_expires_at.is_none());
    }
}
