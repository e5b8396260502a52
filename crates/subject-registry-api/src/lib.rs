use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use subject_registry_core::{
    paginate, sort_subjects, OrderByClause, PageRequest, RegistryError, Subject, SubjectId,
    SubjectInput, SubjectPage, SubjectPatch, TokenId, User,
};
use subject_registry_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, UpsertOutcome};

mod credentials;

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const LOGOUT_MESSAGE: &str = "Gone Away";
const MIN_PASSWORD_LEN: usize = 8;
const DEFAULT_TOKEN_NAME: &str = "spa";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterUserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssuedToken {
    pub token_type: String,
    pub access_token: String,
    pub user: User,
}

/// The caller behind a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user: User,
    pub token_id: TokenId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogoutResult {
    pub message: String,
    pub revoked_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct SubjectRegistryApi {
    db_path: PathBuf,
}

impl SubjectRegistryApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        tracing::info!(
            from = before.current_version,
            to = after.current_version,
            "database migrated"
        );
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Register a user account with an argon2 password hash.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] for a blank name, malformed email or short
    /// password, and [`RegistryError::Conflict`] when the email is taken.
    pub fn register_user(&self, input: RegisterUserRequest) -> Result<User> {
        let name = input.name.trim();
        let email = normalize_email(&input.email);
        if name.is_empty() {
            return Err(RegistryError::Validation("name MUST be provided".to_string()).into());
        }
        if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
            return Err(RegistryError::Validation(format!("invalid email address: {email}")).into());
        }
        if input.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(RegistryError::Validation(format!(
                "password MUST be at least {MIN_PASSWORD_LEN} characters"
            ))
            .into());
        }

        let password_hash = credentials::hash_password(&input.password)?;
        let user = self.open_store()?.create_user(name, &email, &password_hash)?;
        tracing::info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Verify credentials and issue a personal access token.
    ///
    /// The plaintext token is only returned here; the store keeps its SHA-256 digest.
    ///
    /// # Errors
    /// Returns [`RegistryError::Unauthenticated`] for unknown emails or wrong passwords.
    pub fn login(&self, input: LoginRequest) -> Result<IssuedToken> {
        let mut store = self.open_store()?;
        let email = normalize_email(&input.email);
        let account = store.find_user_credentials(&email)?;
        let Some(account) = account.filter(|account| {
            credentials::verify_password(&input.password, &account.password_hash)
        }) else {
            tracing::warn!("rejected login attempt");
            return Err(RegistryError::Unauthenticated("invalid credentials".to_string()).into());
        };

        let secret = credentials::new_token_secret();
        let token_name = input.device_name.as_deref().unwrap_or(DEFAULT_TOKEN_NAME);
        let token_id = store.insert_token(
            account.user.id,
            token_name,
            &credentials::token_digest(&secret),
        )?;
        tracing::info!(user_id = %account.user.id, token_id = %token_id, "access token issued");

        Ok(IssuedToken {
            token_type: "Bearer".to_string(),
            access_token: format!("{token_id}|{secret}"),
            user: account.user,
        })
    }

    /// Resolve a presented bearer token to its user.
    ///
    /// # Errors
    /// Returns [`RegistryError::Unauthenticated`] for malformed, unknown or revoked tokens.
    pub fn authenticate(&self, presented: &str) -> Result<AuthContext> {
        let (claimed_id, secret) = credentials::split_token(presented)?;
        let mut store = self.open_store()?;
        let token = store
            .find_token(&credentials::token_digest(secret), claimed_id)?
            .ok_or_else(|| RegistryError::Unauthenticated("invalid access token".to_string()))?;
        let user = store
            .get_user(token.user_id)?
            .ok_or_else(|| RegistryError::Unauthenticated("token owner no longer exists".to_string()))?;
        Ok(AuthContext { user, token_id: token.id })
    }

    /// Revoke the presented token and every other token of its owner.
    ///
    /// Always answers [`LOGOUT_MESSAGE`]. A missing or invalid token revokes
    /// nothing, and a store failure is logged and reported as zero revocations.
    #[must_use]
    pub fn logout(&self, presented: Option<&str>) -> LogoutResult {
        let revoked_tokens = match presented {
            Some(presented) => match self.revoke_session(presented) {
                Ok(revoked) => revoked,
                Err(err) => {
                    if err.downcast_ref::<RegistryError>().is_none() {
                        tracing::warn!(error = %format!("{err:#}"), "logout could not revoke tokens");
                    }
                    0
                }
            },
            None => 0,
        };

        LogoutResult { message: LOGOUT_MESSAGE.to_string(), revoked_tokens }
    }

    fn revoke_session(&self, presented: &str) -> Result<usize> {
        let auth = self.authenticate(presented)?;
        let mut store = self.open_store()?;
        let revoked_tokens =
            store.delete_token(auth.token_id)? + store.delete_user_tokens(auth.user.id)?;
        tracing::info!(user_id = %auth.user.id, revoked_tokens, "user logged out");
        Ok(revoked_tokens)
    }

    /// Create-or-update a subject by name on behalf of the caller, who becomes an owner.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] for invalid input, or an error when the
    /// transaction fails (in which case nothing is written).
    pub fn create_subject(&self, auth: &AuthContext, input: SubjectInput) -> Result<UpsertOutcome> {
        let input = input.normalized()?;
        let outcome = self.open_store()?.upsert_subject(Some(auth.user.id), &input);
        match &outcome {
            Ok(outcome) => tracing::info!(
                subject_id = %outcome.subject.id,
                created = outcome.created,
                user_id = %auth.user.id,
                "subject upserted"
            ),
            Err(err) => tracing::warn!(error = %err, name = %input.name, "subject upsert rolled back"),
        }
        outcome
    }

    /// Apply a partial edit to an existing subject.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`], [`RegistryError::Validation`] or
    /// [`RegistryError::Conflict`] as appropriate.
    pub fn update_subject(
        &self,
        auth: &AuthContext,
        id: SubjectId,
        patch: &SubjectPatch,
    ) -> Result<Subject> {
        let mut store = self.open_store()?;
        let current = store
            .get_subject(id)?
            .ok_or_else(|| RegistryError::NotFound(format!("subject {id}")))?;
        let merged = patch.apply(&current)?;
        let subject = store.update_subject(id, &merged)?;
        tracing::info!(subject_id = %id, user_id = %auth.user.id, "subject updated");
        Ok(subject)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_subject(&self, id: SubjectId) -> Result<Option<Subject>> {
        self.open_store()?.get_subject(id)
    }

    /// Every subject, ordered by `order_by` with ascending id as the final tie-break.
    ///
    /// # Errors
    /// Returns an error when subjects cannot be loaded.
    pub fn list_subjects(&self, order_by: &[OrderByClause]) -> Result<Vec<Subject>> {
        let mut subjects = self.open_store()?.list_subjects()?;
        sort_subjects(&mut subjects, order_by);
        Ok(subjects)
    }

    /// One ordered page of subjects plus paginator info.
    ///
    /// # Errors
    /// Returns an error when subjects cannot be loaded.
    pub fn page_subjects(&self, order_by: &[OrderByClause], page: PageRequest) -> Result<SubjectPage> {
        Ok(paginate(self.list_subjects(order_by)?, page))
    }

    /// # Errors
    /// Returns an error when subjects cannot be loaded.
    pub fn my_subjects(&self, auth: &AuthContext) -> Result<Vec<Subject>> {
        self.open_store()?.subjects_for_user(auth.user.id)
    }

    /// # Errors
    /// Returns [`RegistryError::NotFound`] for an unknown subject.
    pub fn subject_owners(&self, id: SubjectId) -> Result<Vec<User>> {
        let store = self.open_store()?;
        if store.get_subject(id)?.is_none() {
            return Err(RegistryError::NotFound(format!("subject {id}")).into());
        }
        store.owners_of_subject(id)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}
