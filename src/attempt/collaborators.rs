//! Collaborators the pipeline reaches through traits: maze storage, session
//! resolution and attempt persistence. The in-memory versions back the CLI
//! and the tests.

use crate::attempt::MazeAttempt;
use crate::config::types::{MazeId, MazeboxError, Result, UserId};
use crate::maze::MazeLayout;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

pub trait MazeRepository: Send + Sync {
    fn layout(&self, maze_id: MazeId) -> Result<Option<MazeLayout>>;
}

pub trait SessionResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Option<UserId>>;
}

/// Only written for durable submissions
pub trait AttemptStore: Send + Sync {
    fn save(&self, attempt: &MazeAttempt) -> Result<()>;
    /// Attempts of one user in insertion order
    fn attempts_for(&self, user_id: UserId) -> Result<Vec<MazeAttempt>>;
    fn all(&self) -> Result<Vec<MazeAttempt>>;
}

fn poisoned(what: &str) -> MazeboxError {
    MazeboxError::Store(format!("{} lock poisoned", what))
}

#[derive(Debug, Default)]
pub struct InMemoryMazeRepository {
    mazes: RwLock<HashMap<MazeId, MazeLayout>>,
}

impl InMemoryMazeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, maze_id: MazeId, layout: MazeLayout) -> Result<()> {
        self.mazes
            .write()
            .map_err(|_| poisoned("maze repository"))?
            .insert(maze_id, layout);
        Ok(())
    }
}

impl MazeRepository for InMemoryMazeRepository {
    fn layout(&self, maze_id: MazeId) -> Result<Option<MazeLayout>> {
        let mazes = self.mazes.read().map_err(|_| poisoned("maze repository"))?;
        Ok(mazes.get(&maze_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessions {
    sessions: RwLock<HashMap<String, UserId>>,
}

impl InMemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login(&self, token: impl Into<String>, user_id: UserId) -> Result<()> {
        self.sessions
            .write()
            .map_err(|_| poisoned("session"))?
            .insert(token.into(), user_id);
        Ok(())
    }

    pub fn logout(&self, token: &str) -> Result<bool> {
        Ok(self
            .sessions
            .write()
            .map_err(|_| poisoned("session"))?
            .remove(token)
            .is_some())
    }
}

impl SessionResolver for InMemorySessions {
    fn resolve(&self, token: &str) -> Result<Option<UserId>> {
        let sessions = self.sessions.read().map_err(|_| poisoned("session"))?;
        Ok(sessions.get(token).copied())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAttemptStore {
    attempts: Mutex<Vec<MazeAttempt>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttemptStore for InMemoryAttemptStore {
    fn save(&self, attempt: &MazeAttempt) -> Result<()> {
        self.attempts
            .lock()
            .map_err(|_| poisoned("attempt store"))?
            .push(attempt.clone());
        Ok(())
    }

    fn attempts_for(&self, user_id: UserId) -> Result<Vec<MazeAttempt>> {
        let attempts = self.attempts.lock().map_err(|_| poisoned("attempt store"))?;
        Ok(attempts
            .iter()
            .filter(|a| a.user_id() == user_id)
            .cloned()
            .collect())
    }

    fn all(&self) -> Result<Vec<MazeAttempt>> {
        Ok(self
            .attempts
            .lock()
            .map_err(|_| poisoned("attempt store"))?
            .clone())
    }
}
