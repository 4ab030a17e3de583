use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::account::Account;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    CapacityExceeded { max: usize },
    DuplicateEmail(String),
    UnknownAccount(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::CapacityExceeded { max } => {
                write!(f, "account pool is full (max {max})")
            }
            PoolError::DuplicateEmail(email) => write!(f, "account already present: {email}"),
            PoolError::UnknownAccount(email) => write!(f, "no such account: {email}"),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug)]
struct Entry {
    account: Arc<Account>,
    /// model -> limited-until. Entries in the past count as free and are
    /// dropped lazily or by `clear_expired`.
    limits: HashMap<String, Instant>,
    access_token: Option<(String, Instant)>,
    project_id: Option<String>,
}

impl Entry {
    fn is_free(&self, model: &str, now: Instant) -> bool {
        match self.limits.get(model) {
            Some(until) => *until <= now,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: Vec<Entry>,
    /// model -> email of the preferred account. Always points at a free
    /// account or is absent.
    sticky: HashMap<String, String>,
    /// model -> next round-robin index.
    cursor: HashMap<String, usize>,
}

/// Registry of upstream accounts with per-model rate-limit state.
///
/// Selection is sticky per model to maximize upstream prompt-cache hits;
/// stickiness is broken only when the account gets rate limited.
pub struct AccountPool {
    inner: Mutex<PoolInner>,
    max_accounts: usize,
}

impl AccountPool {
    pub fn new(max_accounts: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            max_accounts,
        }
    }

    pub async fn add(&self, account: Account) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.len() >= self.max_accounts {
            return Err(PoolError::CapacityExceeded {
                max: self.max_accounts,
            });
        }
        if inner.entries.iter().any(|e| e.account.email == account.email) {
            return Err(PoolError::DuplicateEmail(account.email));
        }
        debug!(event = "pool_add", email = %account.email);
        inner.entries.push(Entry {
            account: Arc::new(account),
            limits: HashMap::new(),
            access_token: None,
            project_id: None,
        });
        Ok(())
    }

    pub async fn remove(&self, email: &str) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|e| e.account.email != email);
        if inner.entries.len() == before {
            return Err(PoolError::UnknownAccount(email.to_string()));
        }
        inner.sticky.retain(|_, v| v != email);
        debug!(event = "pool_remove", email = %email);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Accounts whose state for `model` is currently free, in insertion order.
    pub async fn available_for(&self, model: &str) -> Vec<Arc<Account>> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| e.is_free(model, now))
            .map(|e| e.account.clone())
            .collect()
    }

    /// Current sticky account for `model`, if it is still free.
    pub async fn sticky_for(&self, model: &str) -> Option<Arc<Account>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let email = inner.sticky.get(model)?.clone();
        let entry = inner
            .entries
            .iter()
            .find(|e| e.account.email == email && e.is_free(model, now));
        match entry {
            Some(entry) => Some(entry.account.clone()),
            None => {
                inner.sticky.remove(model);
                None
            }
        }
    }

    /// Advance the round-robin cursor to the next free account and install it
    /// as the new sticky. Ties broken by insertion order.
    pub async fn pick_next(&self, model: &str) -> Option<Arc<Account>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let len = inner.entries.len();
        if len == 0 {
            return None;
        }
        let start = inner.cursor.get(model).copied().unwrap_or(0) % len;
        for step in 0..len {
            let idx = (start + step) % len;
            if inner.entries[idx].is_free(model, now) {
                let account = inner.entries[idx].account.clone();
                inner.cursor.insert(model.to_string(), idx + 1);
                inner
                    .sticky
                    .insert(model.to_string(), account.email.clone());
                debug!(event = "pool_pick", email = %account.email, model = %model);
                return Some(account);
            }
        }
        None
    }

    /// Mark `email` limited for `model` until `now + reset`. Clears the
    /// sticky pointer when it targets this account.
    pub async fn mark_limited(&self, email: &str, reset: Duration, model: &str) {
        let until = Instant::now() + reset;
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.iter_mut().find(|e| e.account.email == email) else {
            return;
        };
        entry.limits.insert(model.to_string(), until);
        if inner.sticky.get(model).map(String::as_str) == Some(email) {
            inner.sticky.remove(model);
        }
        debug!(
            event = "pool_limited",
            email = %email,
            model = %model,
            reset_ms = reset.as_millis() as u64
        );
    }

    /// Sweep rate-limit entries whose reset instant is past.
    pub async fn clear_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        for entry in &mut inner.entries {
            entry.limits.retain(|_, until| *until > now);
        }
    }

    /// True when the pool is non-empty and every account is limited for
    /// `model`.
    pub async fn all_limited(&self, model: &str) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        !inner.entries.is_empty() && inner.entries.iter().all(|e| !e.is_free(model, now))
    }

    /// Minimum remaining cooldown across the pool for `model`. `None` when
    /// some account is already free.
    pub async fn min_wait(&self, model: &str) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let mut min: Option<Duration> = None;
        for entry in &inner.entries {
            let until = match entry.limits.get(model) {
                Some(until) if *until > now => *until,
                _ => return None,
            };
            let wait = until - now;
            min = Some(match min {
                Some(current) if current <= wait => current,
                _ => wait,
            });
        }
        min
    }

    /// Cached access token for `email` when its expiry is at least `min_ttl`
    /// in the future.
    pub async fn cached_token(&self, email: &str, min_ttl: Duration) -> Option<String> {
        let inner = self.inner.lock().await;
        let entry = inner.entries.iter().find(|e| e.account.email == email)?;
        let (token, expires_at) = entry.access_token.as_ref()?;
        if *expires_at > Instant::now() + min_ttl {
            Some(token.clone())
        } else {
            None
        }
    }

    pub async fn store_token(&self, email: &str, token: String, expires_at: Instant) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.account.email == email) {
            entry.access_token = Some((token, expires_at));
        }
    }

    pub async fn invalidate_token(&self, email: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.account.email == email) {
            entry.access_token = None;
        }
    }

    pub async fn cached_project(&self, email: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .find(|e| e.account.email == email)
            .and_then(|e| e.project_id.clone())
    }

    pub async fn store_project(&self, email: &str, project_id: String) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.account.email == email) {
            entry.project_id = Some(project_id);
        }
    }

    pub async fn invalidate_project(&self, email: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.account.email == email) {
            entry.project_id = None;
        }
    }
}
