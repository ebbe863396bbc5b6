mod commit;
mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::*;

/// Store defines the database interface.
///
/// Every method is a single statement or a single short transaction; no
/// transaction is held across a call back into the caller.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // User operations
    fn create_user(&self, email: &str, password_hash: &str) -> Result<User>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;
    fn get_user_password_hash(&self, user_id: i64) -> Result<Option<String>>;
    fn update_user_password(&self, user_id: i64, password_hash: &str) -> Result<()>;

    // Team operations
    fn create_team(&self, name: &str, owner_id: i64) -> Result<Team>;
    fn set_team_member(
        &self,
        team_id: i64,
        user_id: i64,
        status: TeamMemberStatus,
    ) -> Result<()>;
    fn is_active_team_member(&self, team_id: i64, user_id: i64) -> Result<bool>;

    // Project operations
    fn create_project(&self, owner_id: i64, team_id: i64, name: &str) -> Result<Project>;
    fn get_project(&self, id: i64) -> Result<Option<Project>>;
    fn find_project_owner_id(&self, project_id: i64) -> Result<Option<i64>>;

    // Membership operations
    fn list_project_members(&self, project_id: i64) -> Result<Vec<ProjectMembership>>;
    fn get_user_membership(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> Result<Option<ProjectMembership>>;
    fn count_owners(&self, project_id: i64) -> Result<i64>;
    /// Fails with `AlreadyExists` when the `(project, user)` pair is taken.
    fn insert_membership(&self, membership: &NewMembership) -> Result<ProjectMembership>;
    /// Re-checks the last-owner invariant and writes in one transaction.
    /// Fails with `LastOwner` when the change would leave no owner.
    fn update_membership_role(
        &self,
        project_id: i64,
        member_id: i64,
        role: Role,
    ) -> Result<ProjectMembership>;
    /// Same transactional guard as `update_membership_role`.
    fn delete_membership(&self, project_id: i64, member_id: i64) -> Result<()>;

    // API credential operations
    fn create_api_credential(&self, credential: &NewApiCredential) -> Result<ApiCredential>;
    fn find_user_by_credential_digest(&self, digest: &str) -> Result<Option<CredentialOwner>>;
    fn list_user_credentials(&self, user_id: i64) -> Result<Vec<ApiCredential>>;
    fn delete_user_credential(&self, user_id: i64, credential_id: i64) -> Result<bool>;
    fn touch_credential(&self, credential_id: i64) -> Result<()>;

    // Second factor operations
    fn get_totp_state(&self, user_id: i64) -> Result<Option<TwoFactorState>>;
    fn set_totp_state(&self, user_id: i64, state: &TwoFactorState) -> Result<()>;
    /// Stores a new unconfirmed secret and clears backup codes, unless the
    /// factor is enabled. Returns false (and writes nothing) when enabled.
    fn stage_totp_secret(&self, user_id: i64, secret: &str) -> Result<bool>;
    /// Replaces the stored backup-code hashes only if they still equal
    /// `expected` and the factor is enabled. Returns false otherwise.
    fn swap_backup_codes(
        &self,
        user_id: i64,
        expected: &[String],
        next: &[String],
    ) -> Result<bool>;
}

/// Runs blocking store calls off the async executor, bounded by a timeout.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Executes `f` on the blocking pool. A stalled store surfaces as
    /// `Error::Timeout`, and a call reported that way commits nothing: the
    /// detached call may keep running but its writes roll back. If the
    /// timeout fires while a commit is already under way, the outcome of
    /// that commit is returned instead.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let gate = Arc::new(commit::CommitGate::default());
        let scoped_gate = Arc::clone(&gate);
        let mut task = tokio::task::spawn_blocking(move || {
            commit::scoped(scoped_gate, || f(store.as_ref()))
        });

        let joined = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) if gate.abandon() => return Err(Error::Timeout),
            Err(_) => task.await,
        };
        joined.map_err(|e| Error::Internal(format!("store task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn fixture() -> (TempDir, Arc<SqliteStore>, User) {
        let temp = TempDir::new().unwrap();
        let sqlite = SqliteStore::new(temp.path().join("test.db")).unwrap();
        sqlite.initialize().unwrap();
        let user = sqlite.create_user("alice@example.com", "old-hash").unwrap();
        (temp, Arc::new(sqlite), user)
    }

    #[tokio::test]
    async fn test_run_returns_result() {
        let (_temp, sqlite, user) = fixture();
        let handle = StoreHandle::new(sqlite, Duration::from_secs(5));

        let email = handle
            .run(move |store| store.get_user_by_email("alice@example.com"))
            .await
            .unwrap()
            .map(|u| u.email);
        assert_eq!(email.as_deref(), Some(user.email.as_str()));
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let (_temp, sqlite, user) = fixture();
        let handle = StoreHandle::new(sqlite.clone(), Duration::from_millis(50));

        let holder = sqlite.stall(Duration::from_millis(300));
        let result = handle
            .run(move |store| store.get_user_password_hash(user.id))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_write_is_not_committed() {
        let (_temp, sqlite, user) = fixture();
        let id = user.id;
        let handle = StoreHandle::new(sqlite.clone(), Duration::from_millis(50));

        let holder = sqlite.stall(Duration::from_millis(300));
        let result = handle
            .run(move |store| store.update_user_password(id, "new-hash"))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));

        // Release the connection and give the detached call time to finish.
        holder.join().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored = sqlite.get_user_password_hash(id).unwrap();
        assert_eq!(stored.as_deref(), Some("old-hash"));

        // The same write succeeds once the store is responsive again.
        handle
            .run(move |store| store.update_user_password(id, "new-hash"))
            .await
            .unwrap();
        let stored = sqlite.get_user_password_hash(id).unwrap();
        assert_eq!(stored.as_deref(), Some("new-hash"));
    }
}
