use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use zeroize::Zeroizing;

use voicehub_crypto::{hash_password, KEY_LEN};

/// Account privilege level, stored as an INTEGER column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    User = 0,
    Administrator = 1,
}

impl UserType {
    fn from_db(value: i64) -> Self {
        if value == 1 {
            UserType::Administrator
        } else {
            UserType::User
        }
    }
}

/// A persistent user record, cached in memory for the process lifetime.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Credential {
    pub username: String,
    pub password_hash: [u8; 32],
    pub user_type: UserType,
    pub created_at: String,
    pub last_login: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Ok,
    Exists,
    BadInput,
}

/// The user store: a SQLite-backed credential table with a full
/// in-memory cache, plus the in-memory session registry.
///
/// The DB write and the cache update of every mutation happen under
/// one `&mut self` call, so callers holding the store lock see the
/// two in lockstep. A failed insert leaves the cache untouched.
pub struct UserStore {
    db: Connection,
    users: HashMap<String, Credential>,
    /// session_id -> username
    sessions: HashMap<String, String>,
    /// session_id -> envelope key
    session_keys: HashMap<String, Zeroizing<[u8; KEY_LEN]>>,
}

impl UserStore {
    /// Open (or create) the database at `path` and load all users.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Connection::open(path)
            .with_context(|| format!("failed to open user database {}", path.display()))?;
        info!(path = %path.display(), "user database opened");
        Self::init(db)
    }

    /// An in-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                user_type INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_login TEXT
            )",
            [],
        )
        .context("failed to create users table")?;

        let mut store = Self {
            db,
            users: HashMap::new(),
            sessions: HashMap::new(),
            session_keys: HashMap::new(),
        };
        store.load_users()?;

        if store.users.is_empty() {
            info!("no users found, seeding default admin account");
            store.register("admin", &hash_password("admin_pass"), UserType::Administrator)?;
        }

        Ok(store)
    }

    fn load_users(&mut self) -> Result<()> {
        let rows: Vec<(String, String, i64, String, Option<String>)> = {
            let mut stmt = self.db.prepare(
                "SELECT username, password_hash, user_type, created_at, last_login FROM users",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        self.users.clear();
        for (username, hash_hex, user_type, created_at, last_login) in rows {
            let Some(password_hash) = decode_stored_hash(&hash_hex) else {
                warn!(%username, "skipping user row with malformed password hash");
                continue;
            };
            self.users.insert(
                username.clone(),
                Credential {
                    username,
                    password_hash,
                    user_type: UserType::from_db(user_type),
                    created_at,
                    last_login,
                },
            );
        }

        info!(count = self.users.len(), "loaded users from database");
        Ok(())
    }

    /// Create a new account. The row is written before the cache is
    /// updated; a DB failure surfaces as `Err` with the cache intact.
    pub fn register(
        &mut self,
        username: &str,
        password_hash: &[u8; 32],
        user_type: UserType,
    ) -> Result<RegisterOutcome> {
        if username.is_empty() {
            return Ok(RegisterOutcome::BadInput);
        }
        if self.users.contains_key(username) {
            return Ok(RegisterOutcome::Exists);
        }

        let created_at = Utc::now().to_rfc3339();
        self.db
            .execute(
                "INSERT INTO users (username, password_hash, user_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    username,
                    hex::encode(password_hash),
                    user_type as i64,
                    created_at
                ],
            )
            .context("failed to insert user")?;

        self.users.insert(
            username.to_string(),
            Credential {
                username: username.to_string(),
                password_hash: *password_hash,
                user_type,
                created_at,
                last_login: None,
            },
        );

        info!(%username, ?user_type, "user registered");
        Ok(RegisterOutcome::Ok)
    }

    /// Verify a login attempt against the cached hash (constant-time)
    /// and stamp `last_login` on success.
    pub fn authenticate(&mut self, username: &str, password_hash: &[u8]) -> bool {
        let Some(cred) = self.users.get_mut(username) else {
            return false;
        };
        if !bool::from(cred.password_hash[..].ct_eq(password_hash)) {
            warn!(%username, "authentication failed");
            return false;
        }
        let user_type = cred.user_type;

        let now = Utc::now().to_rfc3339();
        cred.last_login = Some(now.clone());
        // Losing the timestamp is not worth failing the login over.
        if let Err(e) = self.db.execute(
            "UPDATE users SET last_login = ?1 WHERE username = ?2",
            params![now, username],
        ) {
            warn!(%username, "failed to update last_login: {}", e);
        }

        info!(%username, ?user_type, "authentication successful");
        true
    }

    // ── Session registry (in-memory only) ──────────────────────────

    /// Register a session for `username` and return its id, the hex
    /// of the random token.
    pub fn create_session(&mut self, username: &str, token: &[u8]) -> String {
        let session_id = hex::encode(token);
        self.sessions.insert(session_id.clone(), username.to_string());
        info!(%username, session = %&session_id[..16.min(session_id.len())], "session created");
        session_id
    }

    pub fn set_session_key(&mut self, session_id: &str, key: [u8; KEY_LEN]) {
        self.session_keys
            .insert(session_id.to_string(), Zeroizing::new(key));
    }

    pub fn session_key(&self, session_id: &str) -> Option<[u8; KEY_LEN]> {
        self.session_keys.get(session_id).map(|k| **k)
    }

    /// Drop a session and its key.
    pub fn remove_session(&mut self, session_id: &str) {
        if let Some(username) = self.sessions.remove(session_id) {
            info!(%username, "session removed");
        }
        self.session_keys.remove(session_id);
    }
}

/// Account and session lookups with no control-plane message behind
/// them; admin promotion is driven from operator tooling.
#[allow(dead_code)]
impl UserStore {
    pub fn user_exists(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn user_type(&self, username: &str) -> Option<UserType> {
        self.users.get(username).map(|c| c.user_type)
    }

    /// Promote or demote an account, in the DB and the cache.
    pub fn set_user_type(&mut self, username: &str, user_type: UserType) -> Result<bool> {
        if !self.users.contains_key(username) {
            return Ok(false);
        }
        self.db
            .execute(
                "UPDATE users SET user_type = ?1 WHERE username = ?2",
                params![user_type as i64, username],
            )
            .context("failed to update user type")?;
        if let Some(cred) = self.users.get_mut(username) {
            cred.user_type = user_type;
        }
        info!(%username, ?user_type, "user type updated");
        Ok(true)
    }

    pub fn usernames(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    pub fn validate_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_username(&self, session_id: &str) -> Option<&str> {
        self.sessions.get(session_id).map(String::as_str)
    }
}

fn decode_stored_hash(hash_hex: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hash_hex).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> UserStore {
        UserStore::open_in_memory().unwrap()
    }

    #[test]
    fn fresh_store_seeds_admin() {
        let store = make_store();
        assert!(store.user_exists("admin"));
        assert_eq!(store.user_type("admin"), Some(UserType::Administrator));
    }

    #[test]
    fn seeded_admin_authenticates() {
        let mut store = make_store();
        assert!(store.authenticate("admin", &hash_password("admin_pass")));
        assert!(!store.authenticate("admin", &hash_password("wrong")));
    }

    #[test]
    fn register_then_authenticate() {
        let mut store = make_store();
        let hash = hash_password("pw");
        assert_eq!(
            store.register("alice", &hash, UserType::User).unwrap(),
            RegisterOutcome::Ok
        );
        assert!(store.authenticate("alice", &hash));
        assert!(!store.authenticate("alice", &hash_password("other")));
        assert!(!store.authenticate("nobody", &hash));
    }

    #[test]
    fn duplicate_register_rejected() {
        let mut store = make_store();
        let hash = hash_password("pw");
        store.register("alice", &hash, UserType::User).unwrap();
        assert_eq!(
            store.register("alice", &hash, UserType::User).unwrap(),
            RegisterOutcome::Exists
        );
        // Same username, different password: still a duplicate.
        assert_eq!(
            store
                .register("alice", &hash_password("pw2"), UserType::User)
                .unwrap(),
            RegisterOutcome::Exists
        );
    }

    #[test]
    fn empty_username_rejected() {
        let mut store = make_store();
        assert_eq!(
            store
                .register("", &hash_password("pw"), UserType::User)
                .unwrap(),
            RegisterOutcome::BadInput
        );
    }

    #[test]
    fn usernames_are_case_sensitive() {
        let mut store = make_store();
        let hash = hash_password("pw");
        store.register("Alice", &hash, UserType::User).unwrap();
        assert_eq!(
            store.register("alice", &hash, UserType::User).unwrap(),
            RegisterOutcome::Ok
        );
        assert!(store.authenticate("Alice", &hash));
        assert!(store.authenticate("alice", &hash));
    }

    #[test]
    fn authenticate_stamps_last_login() {
        let mut store = make_store();
        let hash = hash_password("pw");
        store.register("alice", &hash, UserType::User).unwrap();
        assert!(store.users.get("alice").unwrap().last_login.is_none());
        store.authenticate("alice", &hash);
        assert!(store.users.get("alice").unwrap().last_login.is_some());
    }

    #[test]
    fn promotion_persists_in_cache() {
        let mut store = make_store();
        store
            .register("bob", &hash_password("pw"), UserType::User)
            .unwrap();
        assert!(store.set_user_type("bob", UserType::Administrator).unwrap());
        assert_eq!(store.user_type("bob"), Some(UserType::Administrator));
        assert!(!store.set_user_type("ghost", UserType::User).unwrap());
    }

    #[test]
    fn session_lifecycle() {
        let mut store = make_store();
        let token = [0xABu8; 32];
        let session_id = store.create_session("alice", &token);
        assert_eq!(session_id, hex::encode(token));
        assert_eq!(session_id.len(), 64);
        assert!(store.validate_session(&session_id));
        assert_eq!(store.session_username(&session_id), Some("alice"));

        let key = [7u8; KEY_LEN];
        store.set_session_key(&session_id, key);
        assert_eq!(store.session_key(&session_id), Some(key));

        store.remove_session(&session_id);
        assert!(!store.validate_session(&session_id));
        assert!(store.session_key(&session_id).is_none());
    }

    #[test]
    fn malformed_hash_row_skipped_on_load() {
        let store = make_store();
        store
            .db
            .execute(
                "INSERT INTO users (username, password_hash, user_type, created_at)
                 VALUES ('broken', 'zz-not-hex', 0, '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        let mut reloaded = UserStore {
            db: store.db,
            users: HashMap::new(),
            sessions: HashMap::new(),
            session_keys: HashMap::new(),
        };
        reloaded.load_users().unwrap();
        assert!(!reloaded.user_exists("broken"));
        assert!(reloaded.user_exists("admin"));
    }
}
