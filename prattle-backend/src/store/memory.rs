use std::collections::HashMap;

use anyhow::{bail, Error};

use super::AuthBackend;

/// Plain in-memory credential map. Used by tests and as the registration
/// target when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryAuthBackend {
    users: HashMap<(String, String), String>,
}

impl MemoryAuthBackend {
    pub fn with_user(user: &str, realm: &str, password: &str) -> Self {
        let mut backend = Self::default();
        backend.users.insert(
            (user.to_string(), realm.to_string()),
            password.to_string(),
        );
        backend
    }
}

impl AuthBackend for MemoryAuthBackend {
    fn supports_get_password(&self) -> bool {
        true
    }

    async fn user_exists(&self, user: &str, realm: &str) -> Result<bool, Error> {
        Ok(self
            .users
            .contains_key(&(user.to_string(), realm.to_string())))
    }

    async fn get_password(&self, user: &str, realm: &str) -> Result<Option<String>, Error> {
        Ok(self
            .users
            .get(&(user.to_string(), realm.to_string()))
            .cloned())
    }

    async fn check_password(
        &self,
        user: &str,
        realm: &str,
        candidate: &str,
    ) -> Result<bool, Error> {
        Ok(self
            .users
            .get(&(user.to_string(), realm.to_string()))
            .map(|stored| stored == candidate)
            .unwrap_or(false))
    }

    async fn set_password(&mut self, user: &str, realm: &str, password: &str) -> Result<(), Error> {
        let key = (user.to_string(), realm.to_string());
        if !self.users.contains_key(&key) {
            bail!("no such user {user}@{realm}");
        }
        self.users.insert(key, password.to_string());
        Ok(())
    }

    async fn create_user(&mut self, user: &str, realm: &str, password: &str) -> Result<(), Error> {
        let key = (user.to_string(), realm.to_string());
        if self.users.contains_key(&key) {
            bail!("user {user}@{realm} already exists");
        }
        self.users.insert(key, password.to_string());
        Ok(())
    }

    async fn delete_user(&mut self, user: &str, realm: &str) -> Result<(), Error> {
        self.users.remove(&(user.to_string(), realm.to_string()));
        Ok(())
    }
}
