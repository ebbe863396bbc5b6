use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use super::Store;
use super::commit;
use super::schema::SCHEMA;
use crate::error::{Error, Result};
use crate::types::*;

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn()
    }

    /// Holds the connection on another thread for `duration`. Returns once
    /// the lock is taken.
    #[cfg(test)]
    pub(crate) fn stall(
        self: &std::sync::Arc<Self>,
        duration: Duration,
    ) -> std::thread::JoinHandle<()> {
        let store = std::sync::Arc::clone(self);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let _conn = store.conn();
            let _ = locked_tx.send(());
            std::thread::sleep(duration);
        });
        let _ = locked_rx.recv();
        handle
    }

    /// Runs `f` in an IMMEDIATE transaction. Nothing is committed if the
    /// timed call this runs under has already been reported as timed out.
    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;

        commit::ensure_may_commit()?;
        tx.commit()?;
        Ok(out)
    }
}

fn unique_as_exists(err: rusqlite::Error) -> Error {
    if is_unique_violation(&err) {
        Error::AlreadyExists
    } else {
        Error::from(err)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn role_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Role> {
    let raw: String = row.get(idx)?;
    raw.parse::<Role>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn encode_backup_codes(codes: &[String]) -> Result<Option<String>> {
    if codes.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(codes)
        .map(Some)
        .map_err(|e| Error::Internal(format!("failed to encode backup codes: {e}")))
}

fn decode_backup_codes(raw: Option<String>) -> Result<Vec<String>> {
    match raw {
        Some(s) if !s.is_empty() => serde_json::from_str(&s)
            .map_err(|e| Error::Internal(format!("corrupt backup codes: {e}"))),
        _ => Ok(Vec::new()),
    }
}

const USER_COLUMNS: &str = "id, email, created_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        created_at: parse_datetime(&row.get::<_, String>(2)?),
    })
}

const PROJECT_COLUMNS: &str = "id, owner_id, team_id, name, created_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        team_id: row.get(2)?,
        name: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

const MEMBERSHIP_COLUMNS: &str = "id, project_id, user_id, role, granted_by, granted_at";

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectMembership> {
    Ok(ProjectMembership {
        id: row.get(0)?,
        project_id: row.get(1)?,
        user_id: row.get(2)?,
        role: role_column(row, 3)?,
        granted_by: row.get(4)?,
        granted_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

const CREDENTIAL_COLUMNS: &str =
    "k.id, k.user_id, k.name, k.key_hash, k.key_prefix, k.created_at, k.expires_at, k.last_used_at";

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<ApiCredential> {
    Ok(ApiCredential {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        name: row.get(2)?,
        key_hash: row.get(3)?,
        key_prefix: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        expires_at: row.get::<_, Option<String>>(6)?.map(|s| parse_datetime(&s)),
        last_used_at: row.get::<_, Option<String>>(7)?.map(|s| parse_datetime(&s)),
    })
}

/// Loads the role of one membership and, if demoting or removing an owner,
/// verifies another owner remains. Runs inside the caller's transaction.
fn check_owner_retained(
    tx: &rusqlite::Transaction<'_>,
    project_id: i64,
    member_id: i64,
    next_role: Option<Role>,
) -> Result<()> {
    let current = tx
        .query_row(
            "SELECT role FROM project_members WHERE id = ?1 AND project_id = ?2",
            params![member_id, project_id],
            |row| role_column(row, 0),
        )
        .optional()?
        .ok_or(Error::NotFound)?;

    let loses_owner = current == Role::Owner && next_role != Some(Role::Owner);
    if loses_owner {
        let owners: i64 = tx.query_row(
            "SELECT COUNT(*) FROM project_members WHERE project_id = ?1 AND role = 'owner'",
            params![project_id],
            |row| row.get(0),
        )?;
        if owners <= 1 {
            return Err(Error::LastOwner);
        }
    }
    Ok(())
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // User operations

    fn create_user(&self, email: &str, password_hash: &str) -> Result<User> {
        let now = Utc::now();
        self.write(|tx| {
            tx.execute(
                "INSERT INTO users (email, password_hash, created_at) VALUES (?1, ?2, ?3)",
                params![email, password_hash, format_datetime(&now)],
            )
            .map_err(unique_as_exists)?;

            Ok(User {
                id: tx.last_insert_rowid(),
                email: email.to_string(),
                created_at: now,
            })
        })
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            params![email],
            user_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_user_password_hash(&self, user_id: i64) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT password_hash FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    fn update_user_password(&self, user_id: i64, password_hash: &str) -> Result<()> {
        self.write(|tx| {
            let rows = tx.execute(
                "UPDATE users SET password_hash = ?1, password_changed_at = ?2 WHERE id = ?3",
                params![password_hash, format_datetime(&Utc::now()), user_id],
            )?;

            if rows == 0 {
                return Err(Error::NotFound);
            }
            Ok(())
        })
    }

    // Team operations

    fn create_team(&self, name: &str, owner_id: i64) -> Result<Team> {
        let now = Utc::now();
        self.write(|tx| {
            tx.execute(
                "INSERT INTO teams (name, owner_id, created_at) VALUES (?1, ?2, ?3)",
                params![name, owner_id, format_datetime(&now)],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO team_members (team_id, user_id, status, joined_at)
                 VALUES (?1, ?2, 'active', ?3)",
                params![id, owner_id, format_datetime(&now)],
            )?;

            Ok(Team {
                id,
                name: name.to_string(),
                owner_id,
                created_at: now,
            })
        })
    }

    fn set_team_member(
        &self,
        team_id: i64,
        user_id: i64,
        status: TeamMemberStatus,
    ) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO team_members (team_id, user_id, status, joined_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (team_id, user_id) DO UPDATE SET status = excluded.status",
                params![
                    team_id,
                    user_id,
                    status.as_str(),
                    format_datetime(&Utc::now())
                ],
            )?;
            Ok(())
        })
    }

    fn is_active_team_member(&self, team_id: i64, user_id: i64) -> Result<bool> {
        let conn = self.conn();
        conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM team_members
                 WHERE team_id = ?1 AND user_id = ?2 AND status = 'active'
             )",
            params![team_id, user_id],
            |row| row.get(0),
        )
        .map_err(Error::from)
    }

    // Project operations

    fn create_project(&self, owner_id: i64, team_id: i64, name: &str) -> Result<Project> {
        let now = Utc::now();
        self.write(|tx| {
            tx.execute(
                "INSERT INTO projects (owner_id, team_id, name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![owner_id, team_id, name, format_datetime(&now)],
            )?;

            Ok(Project {
                id: tx.last_insert_rowid(),
                owner_id,
                team_id,
                name: name.to_string(),
                created_at: now,
            })
        })
    }

    fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            params![id],
            project_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn find_project_owner_id(&self, project_id: i64) -> Result<Option<i64>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT owner_id FROM projects WHERE id = ?1",
            params![project_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    // Membership operations

    fn list_project_members(&self, project_id: i64) -> Result<Vec<ProjectMembership>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM project_members
             WHERE project_id = ?1 ORDER BY granted_at, id"
        ))?;

        let rows = stmt.query_map(params![project_id], membership_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn get_user_membership(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> Result<Option<ProjectMembership>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {MEMBERSHIP_COLUMNS} FROM project_members WHERE project_id = ?1 AND user_id = ?2"
            ),
            params![project_id, user_id],
            membership_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn count_owners(&self, project_id: i64) -> Result<i64> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM project_members WHERE project_id = ?1 AND role = 'owner'",
            params![project_id],
            |row| row.get(0),
        )
        .map_err(Error::from)
    }

    fn insert_membership(&self, membership: &NewMembership) -> Result<ProjectMembership> {
        let now = Utc::now();
        self.write(|tx| {
            tx.execute(
                "INSERT INTO project_members (project_id, user_id, role, granted_by, granted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    membership.project_id,
                    membership.user_id,
                    membership.role.as_str(),
                    membership.granted_by,
                    format_datetime(&now),
                ],
            )
            .map_err(unique_as_exists)?;

            Ok(ProjectMembership {
                id: tx.last_insert_rowid(),
                project_id: membership.project_id,
                user_id: membership.user_id,
                role: membership.role,
                granted_by: membership.granted_by,
                granted_at: now,
            })
        })
    }

    fn update_membership_role(
        &self,
        project_id: i64,
        member_id: i64,
        role: Role,
    ) -> Result<ProjectMembership> {
        self.write(|tx| {
            check_owner_retained(tx, project_id, member_id, Some(role))?;

            tx.execute(
                "UPDATE project_members SET role = ?1 WHERE id = ?2 AND project_id = ?3",
                params![role.as_str(), member_id, project_id],
            )?;

            tx.query_row(
                &format!("SELECT {MEMBERSHIP_COLUMNS} FROM project_members WHERE id = ?1"),
                params![member_id],
                membership_from_row,
            )
            .map_err(Error::from)
        })
    }

    fn delete_membership(&self, project_id: i64, member_id: i64) -> Result<()> {
        self.write(|tx| {
            check_owner_retained(tx, project_id, member_id, None)?;

            tx.execute(
                "DELETE FROM project_members WHERE id = ?1 AND project_id = ?2",
                params![member_id, project_id],
            )?;
            Ok(())
        })
    }

    // API credential operations

    fn create_api_credential(&self, credential: &NewApiCredential) -> Result<ApiCredential> {
        let now = Utc::now();
        self.write(|tx| {
            tx.execute(
                "INSERT INTO api_keys (user_id, name, key_hash, key_prefix, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    credential.owner_user_id,
                    credential.name,
                    credential.key_hash,
                    credential.key_prefix,
                    format_datetime(&now),
                    credential.expires_at.as_ref().map(format_datetime),
                ],
            )
            .map_err(unique_as_exists)?;

            Ok(ApiCredential {
                id: tx.last_insert_rowid(),
                owner_user_id: credential.owner_user_id,
                name: credential.name.clone(),
                key_hash: credential.key_hash.clone(),
                key_prefix: credential.key_prefix.clone(),
                created_at: now,
                expires_at: credential.expires_at,
                last_used_at: None,
            })
        })
    }

    fn find_user_by_credential_digest(&self, digest: &str) -> Result<Option<CredentialOwner>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {CREDENTIAL_COLUMNS}, u.id, u.email, u.created_at
                 FROM api_keys k JOIN users u ON u.id = k.user_id
                 WHERE k.key_hash = ?1"
            ),
            params![digest],
            |row| {
                Ok(CredentialOwner {
                    credential: credential_from_row(row)?,
                    user: User {
                        id: row.get(8)?,
                        email: row.get(9)?,
                        created_at: parse_datetime(&row.get::<_, String>(10)?),
                    },
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_user_credentials(&self, user_id: i64) -> Result<Vec<ApiCredential>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM api_keys k
             WHERE k.user_id = ?1 ORDER BY k.created_at DESC, k.id DESC"
        ))?;

        let rows = stmt.query_map(params![user_id], credential_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_user_credential(&self, user_id: i64, credential_id: i64) -> Result<bool> {
        self.write(|tx| {
            let rows = tx.execute(
                "DELETE FROM api_keys WHERE id = ?1 AND user_id = ?2",
                params![credential_id, user_id],
            )?;
            Ok(rows > 0)
        })
    }

    fn touch_credential(&self, credential_id: i64) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                params![format_datetime(&Utc::now()), credential_id],
            )?;
            Ok(())
        })
    }

    // Second factor operations

    fn get_totp_state(&self, user_id: i64) -> Result<Option<TwoFactorState>> {
        let row = {
            let conn = self.conn();
            conn.query_row(
                "SELECT totp_enabled, totp_secret, backup_codes FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?
        };

        row.map(|(enabled, secret, codes)| {
            Ok(TwoFactorState {
                enabled,
                secret,
                backup_codes: decode_backup_codes(codes)?,
            })
        })
        .transpose()
    }

    fn set_totp_state(&self, user_id: i64, state: &TwoFactorState) -> Result<()> {
        let codes = encode_backup_codes(&state.backup_codes)?;
        self.write(|tx| {
            let rows = tx.execute(
                "UPDATE users SET totp_enabled = ?1, totp_secret = ?2, backup_codes = ?3
                 WHERE id = ?4",
                params![state.enabled, state.secret, codes, user_id],
            )?;

            if rows == 0 {
                return Err(Error::NotFound);
            }
            Ok(())
        })
    }

    fn stage_totp_secret(&self, user_id: i64, secret: &str) -> Result<bool> {
        self.write(|tx| {
            let enabled: bool = tx
                .query_row(
                    "SELECT totp_enabled FROM users WHERE id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(Error::NotFound)?;
            if enabled {
                return Ok(false);
            }

            tx.execute(
                "UPDATE users SET totp_secret = ?1, backup_codes = NULL WHERE id = ?2",
                params![secret, user_id],
            )?;
            Ok(true)
        })
    }

    fn swap_backup_codes(
        &self,
        user_id: i64,
        expected: &[String],
        next: &[String],
    ) -> Result<bool> {
        let expected = encode_backup_codes(expected)?;
        let next = encode_backup_codes(next)?;
        self.write(|tx| {
            let rows = tx.execute(
                "UPDATE users SET backup_codes = ?1
                 WHERE id = ?2 AND totp_enabled = 1 AND backup_codes IS ?3",
                params![next, user_id, expected],
            )?;
            Ok(rows > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: SqliteStore,
        owner: User,
        project: Project,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();

        let owner = store.create_user("owner@example.com", "hash").unwrap();
        let team = store.create_team("core", owner.id).unwrap();
        let project = store.create_project(owner.id, team.id, "alpha").unwrap();

        Fixture {
            _temp: temp,
            store,
            owner,
            project,
        }
    }

    fn add(f: &Fixture, email: &str, role: Role) -> ProjectMembership {
        let user = f.store.create_user(email, "hash").unwrap();
        f.store
            .insert_membership(&NewMembership {
                project_id: f.project.id,
                user_id: user.id,
                role,
                granted_by: f.owner.id,
            })
            .unwrap()
    }

    #[test]
    fn test_initialize_creates_tables() {
        let f = fixture();
        let conn = f.store.connection();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["users", "teams", "team_members", "projects", "project_members", "api_keys"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_duplicate_email_is_already_exists() {
        let f = fixture();
        let result = f.store.create_user("owner@example.com", "other");
        assert!(matches!(result, Err(Error::AlreadyExists)));
    }

    #[test]
    fn test_team_creator_is_active_member() {
        let f = fixture();
        assert!(
            f.store
                .is_active_team_member(f.project.team_id, f.owner.id)
                .unwrap()
        );

        let other = f.store.create_user("other@example.com", "hash").unwrap();
        assert!(
            !f.store
                .is_active_team_member(f.project.team_id, other.id)
                .unwrap()
        );

        f.store
            .set_team_member(f.project.team_id, other.id, TeamMemberStatus::Invited)
            .unwrap();
        assert!(
            !f.store
                .is_active_team_member(f.project.team_id, other.id)
                .unwrap()
        );

        f.store
            .set_team_member(f.project.team_id, other.id, TeamMemberStatus::Active)
            .unwrap();
        assert!(
            f.store
                .is_active_team_member(f.project.team_id, other.id)
                .unwrap()
        );
    }

    #[test]
    fn test_duplicate_membership_is_already_exists() {
        let f = fixture();
        let member = add(&f, "a@example.com", Role::Member);

        let result = f.store.insert_membership(&NewMembership {
            project_id: f.project.id,
            user_id: member.user_id,
            role: Role::Editor,
            granted_by: f.owner.id,
        });
        assert!(matches!(result, Err(Error::AlreadyExists)));
    }

    #[test]
    fn test_demoting_last_owner_rolls_back() {
        let f = fixture();
        let sole = add(&f, "a@example.com", Role::Owner);

        let result = f
            .store
            .update_membership_role(f.project.id, sole.id, Role::Editor);
        assert!(matches!(result, Err(Error::LastOwner)));

        let unchanged = f
            .store
            .get_user_membership(f.project.id, sole.user_id)
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.role, Role::Owner);
        assert_eq!(f.store.count_owners(f.project.id).unwrap(), 1);
    }

    #[test]
    fn test_demoting_owner_with_co_owner_succeeds() {
        let f = fixture();
        let first = add(&f, "a@example.com", Role::Owner);
        add(&f, "b@example.com", Role::Owner);

        let updated = f
            .store
            .update_membership_role(f.project.id, first.id, Role::Viewer)
            .unwrap();
        assert_eq!(updated.role, Role::Viewer);
        assert_eq!(f.store.count_owners(f.project.id).unwrap(), 1);
    }

    #[test]
    fn test_deleting_last_owner_rejected() {
        let f = fixture();
        let sole = add(&f, "a@example.com", Role::Owner);
        add(&f, "b@example.com", Role::Editor);

        let result = f.store.delete_membership(f.project.id, sole.id);
        assert!(matches!(result, Err(Error::LastOwner)));
        assert_eq!(f.store.list_project_members(f.project.id).unwrap().len(), 2);
    }

    #[test]
    fn test_membership_scoped_to_project() {
        let f = fixture();
        let member = add(&f, "a@example.com", Role::Member);
        let other_project = f
            .store
            .create_project(f.owner.id, f.project.team_id, "beta")
            .unwrap();

        let result = f.store.delete_membership(other_project.id, member.id);
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[test]
    fn test_credential_lookup_by_digest() {
        let f = fixture();
        let created = f
            .store
            .create_api_credential(&NewApiCredential {
                owner_user_id: f.owner.id,
                name: "ci".to_string(),
                key_hash: "digest-1".to_string(),
                key_prefix: "abcdefgh".to_string(),
                expires_at: None,
            })
            .unwrap();

        let found = f
            .store
            .find_user_by_credential_digest("digest-1")
            .unwrap()
            .unwrap();
        assert_eq!(found.credential.id, created.id);
        assert_eq!(found.user.email, "owner@example.com");
        assert!(found.credential.last_used_at.is_none());

        f.store.touch_credential(created.id).unwrap();
        let listed = f.store.list_user_credentials(f.owner.id).unwrap();
        assert!(listed[0].last_used_at.is_some());

        assert!(f.store.find_user_by_credential_digest("nope").unwrap().is_none());
        assert!(!f.store.delete_user_credential(f.owner.id + 100, created.id).unwrap());
        assert!(f.store.delete_user_credential(f.owner.id, created.id).unwrap());
    }

    #[test]
    fn test_totp_state_round_trip_and_swap() {
        let f = fixture();
        let initial = f.store.get_totp_state(f.owner.id).unwrap().unwrap();
        assert_eq!(initial, TwoFactorState::default());

        let enabled = TwoFactorState {
            enabled: true,
            secret: Some("JBSWY3DPEHPK3PXP".to_string()),
            backup_codes: vec!["h1".to_string(), "h2".to_string()],
        };
        f.store.set_totp_state(f.owner.id, &enabled).unwrap();
        assert_eq!(f.store.get_totp_state(f.owner.id).unwrap().unwrap(), enabled);

        let next = vec!["h2".to_string()];
        assert!(
            f.store
                .swap_backup_codes(f.owner.id, &enabled.backup_codes, &next)
                .unwrap()
        );
        // Stale expectation loses the race.
        assert!(
            !f.store
                .swap_backup_codes(f.owner.id, &enabled.backup_codes, &next)
                .unwrap()
        );

        assert!(!f.store.stage_totp_secret(f.owner.id, "NEWSECRET").unwrap());
        assert_eq!(
            f.store.get_totp_state(f.owner.id).unwrap().unwrap().secret,
            enabled.secret
        );

        f.store
            .set_totp_state(f.owner.id, &TwoFactorState::default())
            .unwrap();
        assert!(f.store.stage_totp_secret(f.owner.id, "NEWSECRET").unwrap());
        assert!(matches!(
            f.store.stage_totp_secret(f.owner.id + 100, "NEWSECRET"),
            Err(Error::NotFound)
        ));
        f.store
            .set_totp_state(f.owner.id, &TwoFactorState::default())
            .unwrap();
        let cleared = f.store.get_totp_state(f.owner.id).unwrap().unwrap();
        assert!(cleared.secret.is_none());
        assert!(cleared.backup_codes.is_empty());
    }
}
