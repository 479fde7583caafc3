use std::future::Future;

use anyhow::Error;
use tokio::select;
use tokio::sync::{mpsc, oneshot};

pub mod memory;
pub mod sqlite;

/// Credential storage the gateways authenticate and register against.
///
/// Either `get_password` or `check_password` must be usable; mechanisms are
/// offered accordingly (DIGEST-MD5 needs the stored password, PLAIN only
/// needs verification).
pub trait AuthBackend: Send + 'static {
    /// Whether this backend can reveal stored passwords. Backends that only
    /// hold hashes answer `false` and DIGEST-MD5 is not offered.
    fn supports_get_password(&self) -> bool;

    fn user_exists(
        &self,
        user: &str,
        realm: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// `Ok(None)` when the user does not exist or the password cannot be
    /// revealed.
    fn get_password(
        &self,
        user: &str,
        realm: &str,
    ) -> impl Future<Output = Result<Option<String>, Error>> + Send;

    fn check_password(
        &self,
        user: &str,
        realm: &str,
        candidate: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    fn set_password(
        &mut self,
        user: &str,
        realm: &str,
        password: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn create_user(
        &mut self,
        user: &str,
        realm: &str,
        password: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn delete_user(
        &mut self,
        user: &str,
        realm: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

enum Query {
    UserExists {
        user: String,
        realm: String,
        result_tx: oneshot::Sender<Result<bool, Error>>,
    },
    GetPassword {
        user: String,
        realm: String,
        result_tx: oneshot::Sender<Result<Option<String>, Error>>,
    },
    CheckPassword {
        user: String,
        realm: String,
        candidate: String,
        result_tx: oneshot::Sender<Result<bool, Error>>,
    },
}

enum Command {
    SetPassword {
        user: String,
        realm: String,
        password: String,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    CreateUser {
        user: String,
        realm: String,
        password: String,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    DeleteUser {
        user: String,
        realm: String,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
}

struct Store<B>
where
    B: AuthBackend,
{
    queries: mpsc::Receiver<Query>,
    commands: mpsc::Receiver<Command>,
    backend: B,
}

impl<B> Store<B>
where
    B: AuthBackend,
{
    async fn run(&mut self) {
        loop {
            select! {
                Some(query) = self.queries.recv() => {
                    self.handle_query(query).await;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                else => break,
            }
        }
    }

    async fn handle_query(&mut self, query: Query) {
        match query {
            Query::UserExists {
                user,
                realm,
                result_tx,
            } => {
                let result = self.backend.user_exists(&user, &realm).await;
                let _ = result_tx.send(result);
            }
            Query::GetPassword {
                user,
                realm,
                result_tx,
            } => {
                let result = self.backend.get_password(&user, &realm).await;
                let _ = result_tx.send(result);
            }
            Query::CheckPassword {
                user,
                realm,
                candidate,
                result_tx,
            } => {
                let result = self.backend.check_password(&user, &realm, &candidate).await;
                let _ = result_tx.send(result);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetPassword {
                user,
                realm,
                password,
                result_tx,
            } => {
                let result = self.backend.set_password(&user, &realm, &password).await;
                let _ = result_tx.send(result);
            }
            Command::CreateUser {
                user,
                realm,
                password,
                result_tx,
            } => {
                let result = self.backend.create_user(&user, &realm, &password).await;
                let _ = result_tx.send(result);
            }
            Command::DeleteUser {
                user,
                realm,
                result_tx,
            } => {
                let result = self.backend.delete_user(&user, &realm).await;
                let _ = result_tx.send(result);
            }
        }
    }
}

/// Clonable front to the store actor; one task owns the backend.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    queries: mpsc::Sender<Query>,
    commands: mpsc::Sender<Command>,
    can_get_password: bool,
}

impl StoreHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: AuthBackend,
    {
        let can_get_password = backend.supports_get_password();
        let (queries_tx, queries_rx) = mpsc::channel(8);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let mut store = Store {
            queries: queries_rx,
            commands: commands_rx,
            backend,
        };
        tokio::spawn(async move {
            store.run().await;
        });

        StoreHandle {
            queries: queries_tx,
            commands: commands_tx,
            can_get_password,
        }
    }

    pub fn supports_get_password(&self) -> bool {
        self.can_get_password
    }

    pub async fn user_exists(&self, user: &str, realm: &str) -> Result<bool, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .queries
            .send(Query::UserExists {
                user: user.to_string(),
                realm: realm.to_string(),
                result_tx,
            })
            .await;
        result_rx.await.map_err(|_| anyhow::anyhow!("store is gone"))?
    }

    pub async fn get_password(&self, user: &str, realm: &str) -> Result<Option<String>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .queries
            .send(Query::GetPassword {
                user: user.to_string(),
                realm: realm.to_string(),
                result_tx,
            })
            .await;
        result_rx.await.map_err(|_| anyhow::anyhow!("store is gone"))?
    }

    pub async fn check_password(
        &self,
        user: &str,
        realm: &str,
        candidate: &str,
    ) -> Result<bool, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .queries
            .send(Query::CheckPassword {
                user: user.to_string(),
                realm: realm.to_string(),
                candidate: candidate.to_string(),
                result_tx,
            })
            .await;
        result_rx.await.map_err(|_| anyhow::anyhow!("store is gone"))?
    }

    pub async fn set_password(&self, user: &str, realm: &str, password: &str) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::SetPassword {
                user: user.to_string(),
                realm: realm.to_string(),
                password: password.to_string(),
                result_tx,
            })
            .await;
        result_rx.await.map_err(|_| anyhow::anyhow!("store is gone"))?
    }

    pub async fn create_user(&self, user: &str, realm: &str, password: &str) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::CreateUser {
                user: user.to_string(),
                realm: realm.to_string(),
                password: password.to_string(),
                result_tx,
            })
            .await;
        result_rx.await.map_err(|_| anyhow::anyhow!("store is gone"))?
    }

    pub async fn delete_user(&self, user: &str, realm: &str) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::DeleteUser {
                user: user.to_string(),
                realm: realm.to_string(),
                result_tx,
            })
            .await;
        result_rx.await.map_err(|_| anyhow::anyhow!("store is gone"))?
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryAuthBackend;
    use super::*;

    #[tokio::test]
    async fn create_then_check_password() {
        let store = StoreHandle::new(MemoryAuthBackend::default());
        store
            .create_user("alice", "example.net", "sekrit")
            .await
            .unwrap();
        assert!(store.user_exists("alice", "example.net").await.unwrap());
        assert!(store
            .check_password("alice", "example.net", "sekrit")
            .await
            .unwrap());
        assert!(!store
            .check_password("alice", "example.net", "wrong")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_removes_the_user() {
        let store = StoreHandle::new(MemoryAuthBackend::default());
        store
            .create_user("alice", "example.net", "sekrit")
            .await
            .unwrap();
        store.delete_user("alice", "example.net").await.unwrap();
        assert!(!store.user_exists("alice", "example.net").await.unwrap());
    }

    #[tokio::test]
    async fn set_password_changes_credentials() {
        let store = StoreHandle::new(MemoryAuthBackend::default());
        store
            .create_user("alice", "example.net", "old")
            .await
            .unwrap();
        store
            .set_password("alice", "example.net", "new")
            .await
            .unwrap();
        assert!(store
            .check_password("alice", "example.net", "new")
            .await
            .unwrap());
        assert_eq!(
            store.get_password("alice", "example.net").await.unwrap(),
            Some("new".to_string())
        );
    }
}
