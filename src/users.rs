//! User, session, and tenant records over the store adapter.
//!
//! The REST credential façade (sign-up, sign-in) and the admin control plane
//! live outside this crate; what they call into is [`UserDirectory`]. The
//! WebSocket upgrade path calls [`UserDirectory::verify_session`] to turn a
//! presented session token into an [`AuthContext`].
//!
//! Nothing here sees plaintext user data: public keys, salts, password
//! tokens, and seed backups are client-derived opaque strings.

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::crypto::KeySalts;
use crate::error::{RequestError, RequestResult};
use crate::protocol::UpdateUserParams;
use crate::store::{BatchOp, Store, StoreError};

const USERS_PARTITION: &str = "users";
const SESSIONS_PARTITION: &str = "sessions";

fn usernames_partition(app_id: Uuid) -> String {
    format!("usernames/{app_id}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Case-folded username for the per-tenant uniqueness index.
fn fold_username(username: &str) -> String {
    username.to_lowercase()
}

/// Persisted user record. One application tenant owns each user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: Uuid,
    pub app_id: Uuid,
    pub username: String,
    /// Opaque client public key.
    pub public_key: String,
    pub key_salts: KeySalts,
    /// Password-derived token; compared on sign-in, never reversed.
    pub password_token: String,
    /// Encrypted seed backup recoverable with the password.
    pub password_based_backup: Option<String>,
    pub email: Option<String>,
    pub profile: Option<Value>,
    pub created_at: u64,
    pub deleted_at: Option<u64>,
}

/// Remember-me class of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RememberMe {
    None,
    Session,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub remember_me: RememberMe,
    pub created_at: u64,
    pub invalidated_at: Option<u64>,
}

impl SessionRecord {
    pub fn is_valid(&self) -> bool {
        self.invalidated_at.is_none()
    }
}

/// What the sign-up façade hands over.
#[derive(Debug, Clone)]
pub struct SignUpParams {
    pub app_id: Uuid,
    pub username: String,
    pub public_key: String,
    pub key_salts: KeySalts,
    pub password_token: String,
    pub password_based_backup: Option<String>,
    pub email: Option<String>,
    pub profile: Option<Value>,
}

/// Authenticated identity attached to an upgraded connection.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: UserRecord,
    pub session_id: Uuid,
    pub admin_id: Option<Uuid>,
}

/// User store: records keyed by id, a case-folded username index per tenant,
/// and the session table.
pub struct UserDirectory {
    store: Arc<dyn Store>,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn load_user(&self, user_id: Uuid) -> RequestResult<UserRecord> {
        let bytes = self
            .store
            .get(USERS_PARTITION, user_id.as_bytes())?
            .ok_or(RequestError::NotFound("user"))?;
        decode(&bytes)
    }

    fn save_user(&self, user: &UserRecord) -> RequestResult<()> {
        self.store
            .put(USERS_PARTITION, user.user_id.as_bytes(), &encode(user)?, false)?;
        Ok(())
    }

    fn load_session(&self, session_id: Uuid) -> RequestResult<SessionRecord> {
        let bytes = self
            .store
            .get(SESSIONS_PARTITION, session_id.as_bytes())?
            .ok_or_else(|| RequestError::Unauthorized("Invalid session".into()))?;
        decode(&bytes)
    }

    fn save_session(&self, session: &SessionRecord) -> RequestResult<()> {
        self.store.put(
            SESSIONS_PARTITION,
            session.session_id.as_bytes(),
            &encode(session)?,
            false,
        )?;
        Ok(())
    }

    /// Create a user. Fails with 403 when the case-folded username is taken
    /// within the tenant; the conditional put on the index row is the
    /// uniqueness guarantee under concurrent sign-ups.
    pub fn sign_up(&self, params: SignUpParams) -> RequestResult<(UserRecord, SessionRecord)> {
        let user_id = Uuid::new_v4();
        let index_partition = usernames_partition(params.app_id);
        let folded = fold_username(&params.username);

        match self
            .store
            .put(&index_partition, folded.as_bytes(), user_id.as_bytes(), true)
        {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                return Err(RequestError::Forbidden("Username already exists".into()));
            }
            Err(e) => return Err(e.into()),
        }

        let user = UserRecord {
            user_id,
            app_id: params.app_id,
            username: params.username,
            public_key: params.public_key,
            key_salts: params.key_salts,
            password_token: params.password_token,
            password_based_backup: params.password_based_backup,
            email: params.email,
            profile: params.profile,
            created_at: now_millis(),
            deleted_at: None,
        };
        self.save_user(&user)?;
        let session = self.create_session(user_id, RememberMe::Session)?;
        Ok((user, session))
    }

    /// Password-token sign-in against the stored user.
    pub fn sign_in(
        &self,
        app_id: Uuid,
        username: &str,
        password_token: &str,
        remember_me: RememberMe,
    ) -> RequestResult<(UserRecord, SessionRecord)> {
        let user = self
            .find_by_username(app_id, username)?
            .ok_or_else(|| RequestError::Unauthorized("Invalid username or password".into()))?;
        if user.password_token != password_token {
            return Err(RequestError::Unauthorized("Invalid username or password".into()));
        }
        let session = self.create_session(user.user_id, remember_me)?;
        Ok((user, session))
    }

    pub fn find_by_username(
        &self,
        app_id: Uuid,
        username: &str,
    ) -> RequestResult<Option<UserRecord>> {
        let folded = fold_username(username);
        let Some(id_bytes) = self
            .store
            .get(&usernames_partition(app_id), folded.as_bytes())?
        else {
            return Ok(None);
        };
        let user_id = Uuid::from_slice(&id_bytes)
            .map_err(|e| RequestError::Internal(format!("username index: {e}")))?;
        match self.load_user(user_id) {
            Ok(user) if user.deleted_at.is_none() => Ok(Some(user)),
            Ok(_) => Ok(None),
            Err(RequestError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn create_session(
        &self,
        user_id: Uuid,
        remember_me: RememberMe,
    ) -> RequestResult<SessionRecord> {
        let session = SessionRecord {
            session_id: Uuid::new_v4(),
            user_id,
            remember_me,
            created_at: now_millis(),
            invalidated_at: None,
        };
        self.save_session(&session)?;
        Ok(session)
    }

    /// Resolve a presented session token against a tenant. The upgrade path
    /// runs this before the WebSocket handshake completes.
    pub fn verify_session(
        &self,
        app_id: Uuid,
        session_id: Uuid,
        admin_id: Option<Uuid>,
    ) -> RequestResult<AuthContext> {
        let session = self.load_session(session_id)?;
        if !session.is_valid() {
            return Err(RequestError::Unauthorized("Session has been invalidated".into()));
        }
        let user = self.load_user(session.user_id)?;
        if user.deleted_at.is_some() {
            return Err(RequestError::Unauthorized("User no longer exists".into()));
        }
        if user.app_id != app_id {
            return Err(RequestError::Unauthorized("App ID does not match session".into()));
        }
        Ok(AuthContext {
            user,
            session_id,
            admin_id,
        })
    }

    pub fn invalidate_session(&self, session_id: Uuid) -> RequestResult<()> {
        let mut session = self.load_session(session_id)?;
        if session.invalidated_at.is_none() {
            session.invalidated_at = Some(now_millis());
            self.save_session(&session)?;
        }
        Ok(())
    }

    /// Invalidate every session of `user_id` except `keep`. Runs on password
    /// rotation and user deletion.
    pub fn invalidate_other_sessions(
        &self,
        user_id: Uuid,
        keep: Option<Uuid>,
    ) -> RequestResult<usize> {
        let mut revoked = 0;
        for (_, bytes) in self.store.range(SESSIONS_PARTITION, &[], None)? {
            let mut session: SessionRecord = decode(&bytes)?;
            if session.user_id != user_id || Some(session.session_id) == keep {
                continue;
            }
            if session.invalidated_at.is_none() {
                session.invalidated_at = Some(now_millis());
                self.save_session(&session)?;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    /// Apply an `UpdateUser` mutation. Returns the updated record and whether
    /// the password token was rotated (which revokes other sessions).
    pub fn update_user(
        &self,
        user_id: Uuid,
        params: &UpdateUserParams,
    ) -> RequestResult<(UserRecord, bool)> {
        let mut user = self.load_user(user_id)?;
        if user.deleted_at.is_some() {
            return Err(RequestError::NotFound("user"));
        }

        if let Some(new_username) = &params.username {
            let old_folded = fold_username(&user.username);
            let new_folded = fold_username(new_username);
            if new_folded != old_folded {
                // Atomic claim-new / release-old on the tenant's index.
                let result = self.store.batch(
                    &usernames_partition(user.app_id),
                    &[
                        BatchOp::Put {
                            sort: new_folded.into_bytes(),
                            value: user_id.as_bytes().to_vec(),
                            if_absent: true,
                        },
                        BatchOp::Delete {
                            sort: old_folded.into_bytes(),
                        },
                    ],
                );
                match result {
                    Ok(()) => {}
                    Err(StoreError::ConditionFailed) | Err(StoreError::TxConflict) => {
                        return Err(RequestError::Forbidden("Username already exists".into()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            user.username = new_username.clone();
        }

        if let Some(email) = &params.email {
            user.email = Some(email.clone());
        }
        if let Some(profile) = &params.profile {
            user.profile = Some(profile.clone());
        }

        let mut password_rotated = false;
        if let Some(token) = &params.password_token {
            if *token != user.password_token {
                user.password_token = token.clone();
                password_rotated = true;
            }
        }
        if let Some(backup) = &params.password_based_backup {
            user.password_based_backup = Some(backup.clone());
        }

        self.save_user(&user)?;
        Ok((user, password_rotated))
    }

    /// Soft-delete: the record stays (tombstoned) until [`purge_user`], the
    /// username is released, and every session dies.
    ///
    /// [`purge_user`]: Self::purge_user
    pub fn delete_user(&self, user_id: Uuid) -> RequestResult<UserRecord> {
        let mut user = self.load_user(user_id)?;
        if user.deleted_at.is_none() {
            user.deleted_at = Some(now_millis());
            self.save_user(&user)?;
        }
        self.store.delete(
            &usernames_partition(user.app_id),
            fold_username(&user.username).as_bytes(),
        )?;
        self.invalidate_other_sessions(user_id, None)?;
        Ok(user)
    }

    /// Hard-delete a tombstoned record. The admin control plane calls this
    /// after its retention window.
    pub fn purge_user(&self, user_id: Uuid) -> RequestResult<()> {
        let user = self.load_user(user_id)?;
        if user.deleted_at.is_none() {
            return Err(RequestError::BadRequest("User is not deleted".into()));
        }
        self.store.delete(USERS_PARTITION, user_id.as_bytes())?;
        Ok(())
    }

    pub fn get(&self, user_id: Uuid) -> RequestResult<UserRecord> {
        self.load_user(user_id)
    }
}

fn encode<T: Serialize>(value: &T) -> RequestResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> RequestResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| RequestError::Internal(format!("corrupt record: {e}")))
}
