use serde::{Deserialize, Serialize};

/// An upstream OAuth identity. The credential triple comes from the external
/// login flow; everything else is cached at runtime by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub email: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub created_at: i64,
}

impl Account {
    pub fn from_stored(stored: StoredAccount) -> Self {
        Self {
            email: stored.email,
            refresh_token: stored.refresh_token,
            client_id: stored.client_id,
            client_secret: stored.client_secret,
            created_at: stored.created_at,
        }
    }
}

/// On-disk shape, one element of the `accounts.json` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAccount {
    pub email: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub created_at: i64,
}

impl From<&Account> for StoredAccount {
    fn from(account: &Account) -> Self {
        Self {
            email: account.email.clone(),
            refresh_token: account.refresh_token.clone(),
            client_id: account.client_id.clone(),
            client_secret: account.client_secret.clone(),
            created_at: account.created_at,
        }
    }
}
