use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{
    params, Connection, DatabaseName, OptionalExtension, Params, Row, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use subject_registry_core::{
    BirthDate, RegistryError, Subject, SubjectId, SubjectInput, TokenId, User, UserId, UserSubject,
};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  email TEXT NOT NULL UNIQUE,
  password_hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS personal_access_tokens (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  token_hash TEXT NOT NULL UNIQUE,
  last_used_at TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS subjects (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  test_chamber INTEGER NOT NULL CHECK (test_chamber >= 0),
  date_of_birth TEXT NOT NULL,
  score INTEGER NOT NULL,
  alive INTEGER NOT NULL CHECK (alive IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_subjects (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  subject_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (user_id, subject_id),
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
  FOREIGN KEY (subject_id) REFERENCES subjects(id) ON DELETE CASCADE
);
";

const MIGRATION_002_SQL: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_subjects_name ON subjects(name);
CREATE INDEX IF NOT EXISTS idx_subjects_date_of_birth ON subjects(date_of_birth);
CREATE INDEX IF NOT EXISTS idx_subjects_test_chamber ON subjects(test_chamber);
CREATE INDEX IF NOT EXISTS idx_user_subjects_subject ON user_subjects(subject_id);
CREATE INDEX IF NOT EXISTS idx_personal_access_tokens_user ON personal_access_tokens(user_id);
";

const SUBJECT_SELECT: &str = "SELECT s.id, s.name, s.test_chamber, s.date_of_birth, s.score, \
     s.alive, s.created_at, s.updated_at FROM subjects s";

const USER_SELECT: &str = "SELECT u.id, u.name, u.email, u.created_at, u.updated_at FROM users u";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// A user together with the stored password hash. Never serialized.
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user: User,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredToken {
    pub id: TokenId,
    pub user_id: UserId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of the name-keyed create-or-update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub subject: Subject,
    pub created: bool,
}

impl SqliteStore {
    /// Open a SQLite-backed subject store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails, or the database was written
    /// by a newer schema than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration v1")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
        }

        if version < 2 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration v2")?;
            let duplicates = duplicate_subject_names(&tx)?;
            if !duplicates.is_empty() {
                return Err(anyhow!(
                    "cannot enforce unique subject names; duplicated names: {}",
                    duplicates.join(", ")
                ));
            }
            tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
            record_schema_version(&tx, 2)?;
            tx.commit().context("failed to commit migration v2")?;
        }

        Ok(())
    }

    /// Insert a new user account.
    ///
    /// # Errors
    /// Returns [`RegistryError::Conflict`] when the email is taken, or an error when
    /// the insert fails.
    pub fn create_user(&mut self, name: &str, email: &str, password_hash: &str) -> Result<User> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let taken = tx
            .query_row("SELECT id FROM users WHERE email = ?1", params![email], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .context("failed to check user email")?;
        if taken.is_some() {
            return Err(RegistryError::Conflict(format!("email already registered: {email}")).into());
        }

        let now = now_rfc3339()?;
        let inserted = tx.execute(
            "INSERT INTO users(name, email, password_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![name, email, password_hash, now],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) => {
                return Err(
                    RegistryError::Conflict(format!("email already registered: {email}")).into()
                );
            }
            Err(err) => return Err(anyhow::Error::new(err).context("failed to insert user")),
        }
        let user = load_user(&tx, UserId(tx.last_insert_rowid()))?
            .ok_or_else(|| anyhow!("inserted user could not be read back"))?;
        tx.commit().context("failed to commit user transaction")?;
        Ok(user)
    }

    /// Look up a user and the stored password hash by email.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_user_credentials(&self, email: &str) -> Result<Option<UserCredentials>> {
        let mut stmt = self.conn.prepare(
            "SELECT password_hash, id, name, email, created_at, updated_at
             FROM users WHERE email = ?1",
        )?;
        let mut rows = stmt.query(params![email])?;
        let credentials = match rows.next()? {
            Some(row) => {
                let password_hash: String = row.get(0)?;
                let user = User {
                    id: UserId(row.get(1)?),
                    name: row.get(2)?,
                    email: row.get(3)?,
                    created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
                    updated_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
                };
                Some(UserCredentials { user, password_hash })
            }
            None => None,
        };
        Ok(credentials)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_user(&self, id: UserId) -> Result<Option<User>> {
        load_user(&self.conn, id)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let users =
            query_users(&self.conn, &format!("{USER_SELECT} WHERE u.email = ?1"), params![email])?;
        Ok(users.into_iter().next())
    }

    /// Persist a personal access token digest for `user_id`.
    ///
    /// # Errors
    /// Returns an error when the insert fails, including an unknown user.
    pub fn insert_token(&mut self, user_id: UserId, name: &str, token_hash: &str) -> Result<TokenId> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO personal_access_tokens(user_id, name, token_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id.0, name, token_hash, now_rfc3339()?],
        )
        .context("failed to insert personal access token")?;
        let id = TokenId(tx.last_insert_rowid());
        tx.commit().context("failed to commit token transaction")?;
        Ok(id)
    }

    /// Resolve a token digest and stamp its `last_used_at`.
    ///
    /// When `claimed_id` is given the row must also carry that id; a mismatch
    /// resolves to `None` and nothing is stamped.
    ///
    /// # Errors
    /// Returns an error when the lookup or the stamp fails.
    pub fn find_token(
        &mut self,
        token_hash: &str,
        claimed_id: Option<TokenId>,
    ) -> Result<Option<StoredToken>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, name, last_used_at, created_at
                 FROM personal_access_tokens
                 WHERE token_hash = ?1 AND (?2 IS NULL OR id = ?2)",
                params![token_hash, claimed_id.map(|id| id.0)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("failed to look up personal access token")?;

        let Some((id, user_id, name, last_used_at, created_at)) = row else {
            return Ok(None);
        };

        self.conn
            .execute(
                "UPDATE personal_access_tokens SET last_used_at = ?1 WHERE id = ?2",
                params![now_rfc3339()?, id],
            )
            .context("failed to stamp personal access token")?;

        Ok(Some(StoredToken {
            id: TokenId(id),
            user_id: UserId(user_id),
            name,
            last_used_at: last_used_at.as_deref().map(parse_rfc3339).transpose()?,
            created_at: parse_rfc3339(&created_at)?,
        }))
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_token(&mut self, id: TokenId) -> Result<usize> {
        self.conn
            .execute("DELETE FROM personal_access_tokens WHERE id = ?1", params![id.0])
            .context("failed to delete personal access token")
    }

    /// Remove every token belonging to `user_id`, returning how many were removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_user_tokens(&mut self, user_id: UserId) -> Result<usize> {
        self.conn
            .execute("DELETE FROM personal_access_tokens WHERE user_id = ?1", params![user_id.0])
            .context("failed to delete personal access tokens")
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored row cannot be decoded.
    pub fn get_subject(&self, id: SubjectId) -> Result<Option<Subject>> {
        load_subject(&self.conn, id)
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored row cannot be decoded.
    pub fn find_subject_by_name(&self, name: &str) -> Result<Option<Subject>> {
        let subjects =
            query_subjects(&self.conn, &format!("{SUBJECT_SELECT} WHERE s.name = ?1"), params![name])?;
        Ok(subjects.into_iter().next())
    }

    /// Load every subject ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_subjects(&self) -> Result<Vec<Subject>> {
        query_subjects(&self.conn, &format!("{SUBJECT_SELECT} ORDER BY s.id ASC"), params![])
    }

    /// Create-or-update one subject keyed by name inside a single transaction.
    ///
    /// The subject is looked up by name; a missing subject is created; the
    /// submitted fields are then written; `owner`, when given, is linked through
    /// `user_subjects`. Any failure rolls the whole transaction back.
    ///
    /// # Errors
    /// Returns an error when validation or any statement in the transaction fails.
    pub fn upsert_subject(
        &mut self,
        owner: Option<UserId>,
        input: &SubjectInput,
    ) -> Result<UpsertOutcome> {
        input.validate()?;

        // IMMEDIATE takes the write lock up front so two writers cannot both miss the name.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let existing = tx
            .query_row("SELECT id FROM subjects WHERE name = ?1", params![input.name], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .context("failed to look up subject by name")?;

        let now = now_rfc3339()?;
        let (id, created) = match existing {
            Some(id) => (SubjectId(id), false),
            None => {
                tx.execute(
                    "INSERT INTO subjects(
                        name, test_chamber, date_of_birth, score, alive, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        input.name,
                        input.test_chamber,
                        input.date_of_birth.to_string(),
                        input.score,
                        input.alive,
                        now,
                    ],
                )
                .context("failed to insert subject")?;
                (SubjectId(tx.last_insert_rowid()), true)
            }
        };

        if !created {
            write_subject_fields(&tx, id, input, &now)?;
        }

        if let Some(owner) = owner {
            link_in(&tx, owner, id, &now)?;
        }

        let subject =
            load_subject(&tx, id)?.ok_or_else(|| anyhow!("subject {id} vanished during upsert"))?;
        tx.commit().context("failed to commit subject upsert")?;
        Ok(UpsertOutcome { subject, created })
    }

    /// Overwrite an existing subject by id.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] for an unknown id, [`RegistryError::Conflict`]
    /// when the new name belongs to another subject, or an error when the write fails.
    pub fn update_subject(&mut self, id: SubjectId, input: &SubjectInput) -> Result<Subject> {
        input.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        if load_subject(&tx, id)?.is_none() {
            return Err(RegistryError::NotFound(format!("subject {id}")).into());
        }

        let clash = tx
            .query_row(
                "SELECT id FROM subjects WHERE name = ?1 AND id != ?2",
                params![input.name, id.0],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to check subject name")?;
        if let Some(other) = clash {
            return Err(RegistryError::Conflict(format!(
                "subject name {:?} already belongs to subject {other}",
                input.name
            ))
            .into());
        }

        write_subject_fields(&tx, id, input, &now_rfc3339()?)?;

        let subject =
            load_subject(&tx, id)?.ok_or_else(|| anyhow!("subject {id} vanished during update"))?;
        tx.commit().context("failed to commit subject update")?;
        Ok(subject)
    }

    /// Link a user to a subject. Linking an existing pair returns the existing row.
    ///
    /// # Errors
    /// Returns an error when either side does not exist or the write fails.
    pub fn link_user_subject(&mut self, user_id: UserId, subject_id: SubjectId) -> Result<UserSubject> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let link = link_in(&tx, user_id, subject_id, &now_rfc3339()?)?;
        tx.commit().context("failed to commit link transaction")?;
        Ok(link)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn user_subject(&self, id: i64) -> Result<Option<UserSubject>> {
        let link = self
            .conn
            .query_row(
                "SELECT id, user_id, subject_id, created_at, updated_at
                 FROM user_subjects WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("failed to look up user subject")?;

        let Some((id, user_id, subject_id, created_at, updated_at)) = link else {
            return Ok(None);
        };

        Ok(Some(UserSubject {
            id,
            user_id: UserId(user_id),
            subject_id: SubjectId(subject_id),
            created_at: parse_rfc3339(&created_at)?,
            updated_at: parse_rfc3339(&updated_at)?,
        }))
    }

    /// Subjects owned by `user_id`, ordered by subject id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn subjects_for_user(&self, user_id: UserId) -> Result<Vec<Subject>> {
        query_subjects(
            &self.conn,
            &format!(
                "{SUBJECT_SELECT} JOIN user_subjects us ON us.subject_id = s.id
                 WHERE us.user_id = ?1 ORDER BY s.id ASC"
            ),
            params![user_id.0],
        )
    }

    /// Users linked to `subject_id`, ordered by user id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn owners_of_subject(&self, subject_id: SubjectId) -> Result<Vec<User>> {
        query_users(
            &self.conn,
            &format!(
                "{USER_SELECT} JOIN user_subjects us ON us.user_id = u.id
                 WHERE us.subject_id = ?1 ORDER BY u.id ASC"
            ),
            params![subject_id.0],
        )
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn write_subject_fields(
    conn: &Connection,
    id: SubjectId,
    input: &SubjectInput,
    now: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE subjects
         SET name = ?1, test_chamber = ?2, date_of_birth = ?3, score = ?4, alive = ?5,
             updated_at = ?6
         WHERE id = ?7",
        params![
            input.name,
            input.test_chamber,
            input.date_of_birth.to_string(),
            input.score,
            input.alive,
            now,
            id.0,
        ],
    )
    .context("failed to update subject")?;
    Ok(())
}

fn link_in(conn: &Connection, user_id: UserId, subject_id: SubjectId, now: &str) -> Result<UserSubject> {
    conn.execute(
        "INSERT OR IGNORE INTO user_subjects(user_id, subject_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        params![user_id.0, subject_id.0, now],
    )
    .with_context(|| format!("failed to link user {user_id} to subject {subject_id}"))?;

    let (id, created_at, updated_at) = conn
        .query_row(
            "SELECT id, created_at, updated_at FROM user_subjects
             WHERE user_id = ?1 AND subject_id = ?2",
            params![user_id.0, subject_id.0],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
        )
        .context("failed to read user subject link")?;

    Ok(UserSubject {
        id,
        user_id,
        subject_id,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

fn subject_from_row(row: &Row<'_>) -> Result<Subject> {
    let date_of_birth_raw: String = row.get(3)?;
    Ok(Subject {
        id: SubjectId(row.get(0)?),
        name: row.get(1)?,
        test_chamber: row.get(2)?,
        date_of_birth: BirthDate::parse(&date_of_birth_raw)
            .map_err(|err| anyhow!("stored date_of_birth is invalid: {err}"))?,
        score: row.get(4)?,
        alive: row.get(5)?,
        created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
    })
}

fn user_from_row(row: &Row<'_>) -> Result<User> {
    Ok(User {
        id: UserId(row.get(0)?),
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
    })
}

fn query_subjects(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<Subject>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare subject query")?;
    let mut rows = stmt.query(params)?;
    let mut subjects = Vec::new();
    while let Some(row) = rows.next()? {
        subjects.push(subject_from_row(row)?);
    }
    Ok(subjects)
}

fn query_users(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare user query")?;
    let mut rows = stmt.query(params)?;
    let mut users = Vec::new();
    while let Some(row) = rows.next()? {
        users.push(user_from_row(row)?);
    }
    Ok(users)
}

fn load_subject(conn: &Connection, id: SubjectId) -> Result<Option<Subject>> {
    let subjects = query_subjects(conn, &format!("{SUBJECT_SELECT} WHERE s.id = ?1"), params![id.0])?;
    Ok(subjects.into_iter().next())
}

fn load_user(conn: &Connection, id: UserId) -> Result<Option<User>> {
    let users = query_users(conn, &format!("{USER_SELECT} WHERE u.id = ?1"), params![id.0])?;
    Ok(users.into_iter().next())
}

fn duplicate_subject_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM subjects GROUP BY name HAVING COUNT(*) > 1 ORDER BY name")
        .context("failed to prepare duplicate name probe")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
