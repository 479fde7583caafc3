use anyhow::{anyhow, Error};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};

use super::AuthBackend;

/// SQLite credential store.
///
/// Two columns per user: `password` (plaintext, enables DIGEST-MD5) and
/// `password_argon2`. Verification prefers the hash when both are present.
pub struct SqliteAuthBackend {
    pool: Pool<Sqlite>,
}

impl SqliteAuthBackend {
    pub async fn new(database_url: &str) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT NOT NULL,
                realm TEXT NOT NULL,
                password TEXT,
                password_argon2 TEXT,
                PRIMARY KEY (username, realm)
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    async fn fetch(
        &self,
        user: &str,
        realm: &str,
    ) -> Result<Option<(Option<String>, Option<String>)>, Error> {
        let row = sqlx::query(
            r#"
            SELECT password, password_argon2
            FROM users
            WHERE username = ? AND realm = ?
            "#,
        )
        .bind(user)
        .bind(realm)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| (row.get("password"), row.get("password_argon2"))))
    }

    fn hash(password: &str) -> Result<String, Error> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow!(e))?;
        Ok(hash.to_string())
    }
}

impl AuthBackend for SqliteAuthBackend {
    fn supports_get_password(&self) -> bool {
        true
    }

    async fn user_exists(&self, user: &str, realm: &str) -> Result<bool, Error> {
        Ok(self.fetch(user, realm).await?.is_some())
    }

    async fn get_password(&self, user: &str, realm: &str) -> Result<Option<String>, Error> {
        Ok(self.fetch(user, realm).await?.and_then(|(plain, _)| plain))
    }

    async fn check_password(
        &self,
        user: &str,
        realm: &str,
        candidate: &str,
    ) -> Result<bool, Error> {
        match self.fetch(user, realm).await? {
            Some((_, Some(hash))) => {
                let parsed = PasswordHash::new(&hash).map_err(|e| anyhow!(e))?;
                Ok(Argon2::default()
                    .verify_password(candidate.as_bytes(), &parsed)
                    .is_ok())
            }
            Some((Some(plain), None)) => Ok(plain == candidate),
            _ => Ok(false),
        }
    }

    async fn set_password(&mut self, user: &str, realm: &str, password: &str) -> Result<(), Error> {
        let hash = Self::hash(password)?;
        let updated = sqlx::query(
            r#"
            UPDATE users
            SET password = ?, password_argon2 = ?
            WHERE username = ? AND realm = ?
            "#,
        )
        .bind(password)
        .bind(hash)
        .bind(user)
        .bind(realm)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(anyhow!("no such user {user}@{realm}"));
        }
        Ok(())
    }

    async fn create_user(&mut self, user: &str, realm: &str, password: &str) -> Result<(), Error> {
        let hash = Self::hash(password)?;
        sqlx::query(
            r#"
            INSERT INTO users (username, realm, password, password_argon2)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(user)
        .bind(realm)
        .bind(password)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_user(&mut self, user: &str, realm: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            DELETE FROM users
            WHERE username = ? AND realm = ?
            "#,
        )
        .bind(user)
        .bind(realm)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> SqliteAuthBackend {
        SqliteAuthBackend::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn round_trip_credentials() {
        let mut backend = backend().await;
        backend
            .create_user("alice", "example.net", "sekrit")
            .await
            .unwrap();
        assert!(backend.user_exists("alice", "example.net").await.unwrap());
        assert_eq!(
            backend.get_password("alice", "example.net").await.unwrap(),
            Some("sekrit".to_string())
        );
        assert!(backend
            .check_password("alice", "example.net", "sekrit")
            .await
            .unwrap());
        assert!(!backend
            .check_password("alice", "example.net", "nope")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn set_password_requires_existing_user() {
        let mut backend = backend().await;
        assert!(backend
            .set_password("ghost", "example.net", "x")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn realms_are_distinct() {
        let mut backend = backend().await;
        backend
            .create_user("alice", "a.example", "one")
            .await
            .unwrap();
        assert!(!backend.user_exists("alice", "b.example").await.unwrap());
    }
}
