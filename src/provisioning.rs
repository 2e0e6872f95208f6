//! Broker-account provisioning: form validation, tier counts and the create command.
//!
//! Writes go through [`AccountProvisioner::create`], which waits for the backend's confirmation
//! and then invalidates and refetches the cached listing. The cache is never patched by hand.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    backend::{BackendClient, NewBrokerAccount},
    models::{BrokerAccount, BrokerAccountView, Platform, Secret},
    store::{SqliteStore, CACHE_BROKER_ACCOUNTS},
    utils::now_ts,
};

// ── Tiers ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceTier {
    pub amount: f64,
    pub label: &'static str,
}

pub const ACCOUNT_TIERS: [BalanceTier; 5] = [
    BalanceTier { amount: 5_000.0, label: "$5,000" },
    BalanceTier { amount: 10_000.0, label: "$10,000" },
    BalanceTier { amount: 25_000.0, label: "$25,000" },
    BalanceTier { amount: 50_000.0, label: "$50,000" },
    BalanceTier { amount: 100_000.0, label: "$100,000" },
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierCount {
    pub amount: f64,
    pub label: String,
    pub count: usize,
}

/// Accounts per tier. Balances off the tier list are not counted.
pub fn tier_counts(accounts: &[BrokerAccountView]) -> Vec<TierCount> {
    ACCOUNT_TIERS
        .iter()
        .map(|t| TierCount {
            amount: t.amount,
            label: t.label.to_string(),
            count: accounts.iter().filter(|a| a.balance == Some(t.amount)).count(),
        })
        .collect()
}

// ── Form ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum FormError {
    MissingField(&'static str),
    InvalidLogin,
    InvalidBalance(String),
    InvalidPlatform(String),
}

impl std::fmt::Display for FormError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormError::MissingField(field) => write!(f, "{} is required", field),
            FormError::InvalidLogin => write!(f, "login must contain only letters and digits"),
            FormError::InvalidBalance(v) => write!(f, "balance must be a positive number (got {})", v),
            FormError::InvalidPlatform(v) => write!(f, "platform must be mt4 or mt5 (got {})", v),
        }
    }
}

impl std::error::Error for FormError {}

/// Operator input as submitted. Everything is text until validated.
#[derive(Clone, Default, Deserialize)]
pub struct AccountForm {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub server: String,
    #[serde(default, deserialize_with = "de_text")]
    pub balance: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default, rename = "inversorPass")]
    pub inversor_pass: String,
}

fn de_text<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match Option::<serde_json::Value>::deserialize(d)? {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

impl std::fmt::Debug for AccountForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountForm")
            .field("login", &self.login)
            .field("server", &self.server)
            .field("balance", &self.balance)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl AccountForm {
    pub fn validate(&self) -> std::result::Result<NewBrokerAccount, FormError> {
        let login = self.login.trim();
        if login.is_empty() {
            return Err(FormError::MissingField("login"));
        }
        if !login.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(FormError::InvalidLogin);
        }
        if self.password.is_empty() {
            return Err(FormError::MissingField("password"));
        }
        let server = self.server.trim();
        if server.is_empty() {
            return Err(FormError::MissingField("server"));
        }
        let balance_text = self.balance.trim();
        if balance_text.is_empty() {
            return Err(FormError::MissingField("balance"));
        }
        let balance = balance_text
            .parse::<f64>()
            .ok()
            .filter(|b| b.is_finite() && *b > 0.0)
            .ok_or_else(|| FormError::InvalidBalance(balance_text.to_string()))?;
        let platform = match self.platform.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            None => Platform::default(),
            Some(p) => Platform::parse(p).ok_or_else(|| FormError::InvalidPlatform(p.to_string()))?,
        };

        Ok(NewBrokerAccount {
            login: login.to_string(),
            password: Secret::new(self.password.clone()),
            server: server.to_string(),
            balance,
            platform,
            used: false,
            inversor_pass: Secret::new(self.inversor_pass.clone()),
        })
    }
}

// ── Listing / command ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountListing {
    pub accounts: Vec<BrokerAccountView>,
    pub tiers: Vec<TierCount>,
    pub fetched_ts: Option<f64>,
}

#[derive(Clone)]
pub struct AccountProvisioner {
    client: BackendClient,
    store: SqliteStore,
    cache_ttl_secs: u64,
    // Token the backend accepted for the cached rows. Held across every refetch and create, so
    // one write sequence runs at a time inside this process.
    reader: Arc<Mutex<Option<Secret>>>,
}

impl AccountProvisioner {
    pub fn new(client: BackendClient, store: SqliteStore, cache_ttl_secs: u64) -> Self {
        Self {
            client,
            store,
            cache_ttl_secs,
            reader: Arc::new(Mutex::new(None)),
        }
    }

    fn listing_from_cache(&self) -> Result<AccountListing> {
        let accounts = self.store.fetch_broker_accounts()?;
        let tiers = tier_counts(&accounts);
        Ok(AccountListing {
            accounts,
            tiers,
            fetched_ts: self.store.cache_fetched_ts(CACHE_BROKER_ACCOUNTS)?,
        })
    }

    async fn refetch(&self, reader: &mut Option<Secret>, token: &str) -> Result<AccountListing> {
        let accounts = self
            .client
            .list_unused_broker_accounts(token)
            .await
            .context("list unused broker accounts")?;
        self.store.replace_broker_accounts(&accounts, now_ts())?;
        *reader = Some(Secret::new(token));
        log::info!("accounts.refetched count={}", accounts.len());
        self.listing_from_cache()
    }

    /// Cached listing while fresh and `token` was accepted for it, otherwise an authoritative
    /// refetch under `token`.
    pub async fn listing(&self, token: &str) -> Result<AccountListing> {
        let mut reader = self.reader.lock().await;
        let fetched = self.store.cache_fetched_ts(CACHE_BROKER_ACCOUNTS)?;
        let fresh = fetched.is_some_and(|ts| now_ts() - ts < self.cache_ttl_secs as f64);
        if fresh && reader.as_ref().is_some_and(|r| r.expose() == token) {
            return self.listing_from_cache();
        }
        self.refetch(&mut reader, token).await
    }

    /// Drop the cached listing and fetch it again.
    pub async fn refresh(&self, token: &str) -> Result<AccountListing> {
        let mut reader = self.reader.lock().await;
        self.store.invalidate(CACHE_BROKER_ACCOUNTS)?;
        self.refetch(&mut reader, token).await
    }

    /// Create an account. Returns the confirmed record and the refetched listing.
    pub async fn create(&self, token: &str, form: &AccountForm) -> Result<(BrokerAccountView, AccountListing)> {
        let new_account = form.validate()?;
        let command_id = uuid::Uuid::new_v4();
        let mut reader = self.reader.lock().await;

        log::info!(
            "accounts.create command={} login={} balance={} platform={}",
            command_id,
            new_account.login,
            new_account.balance,
            new_account.platform.as_str()
        );
        let created: BrokerAccount = self
            .client
            .create_broker_account(token, &new_account)
            .await
            .context("create broker account")?;
        log::info!(
            "accounts.created command={} id={:?} document_id={:?}",
            command_id,
            created.id,
            created.document_id
        );

        self.store.invalidate(CACHE_BROKER_ACCOUNTS)?;
        let listing = self.refetch(&mut reader, token).await?;
        Ok((created.view(), listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            fake::{FakeBackend, TOKEN},
            BackendError,
        },
        config::test_settings,
        store::temp_store,
    };
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn form(login: &str, balance: &str) -> AccountForm {
        AccountForm {
            login: login.to_string(),
            password: "pw".to_string(),
            server: "Demo-1".to_string(),
            balance: balance.to_string(),
            platform: None,
            inversor_pass: "ro".to_string(),
        }
    }

    fn view(balance: Option<f64>) -> BrokerAccountView {
        BrokerAccountView {
            id: None,
            document_id: None,
            login: None,
            balance,
            server: None,
            platform: None,
            used: false,
            has_password: false,
            has_investor_password: false,
        }
    }

    #[test]
    fn tiers_count_exact_balances() {
        let accounts = vec![
            view(Some(5000.0)),
            view(Some(5000.0)),
            view(Some(100_000.0)),
            view(Some(7_500.0)),
            view(None),
        ];
        let counts = tier_counts(&accounts);
        assert_eq!(counts.len(), 5);
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[0].label, "$5,000");
        assert_eq!(counts[1].count, 0);
        assert_eq!(counts[4].count, 1);
    }

    #[test]
    fn string_balances_count_after_decode() {
        let acc = BrokerAccount::from_value(&json!({"balance": "25000"})).unwrap();
        let counts = tier_counts(&[acc.view()]);
        assert_eq!(counts[2].count, 1);
    }

    #[test]
    fn form_validation() {
        let ok = form("abc123", "10000").validate().unwrap();
        assert_eq!(ok.balance, 10_000.0);
        assert_eq!(ok.platform, Platform::Mt4);
        assert!(!ok.used);

        assert!(matches!(form("", "10000").validate(), Err(FormError::MissingField("login"))));
        assert!(matches!(form("ab-12", "10000").validate(), Err(FormError::InvalidLogin)));
        assert!(matches!(form("abc", "").validate(), Err(FormError::MissingField("balance"))));
        assert!(matches!(form("abc", "-5").validate(), Err(FormError::InvalidBalance(_))));
        assert!(matches!(form("abc", "lots").validate(), Err(FormError::InvalidBalance(_))));

        let mut f = form("abc", "5000");
        f.password.clear();
        assert!(matches!(f.validate(), Err(FormError::MissingField("password"))));

        let mut f = form("abc", "5000");
        f.platform = Some("MT5".to_string());
        assert_eq!(f.validate().unwrap().platform, Platform::Mt5);
        f.platform = Some("ctrader".to_string());
        assert!(matches!(f.validate(), Err(FormError::InvalidPlatform(_))));
    }

    #[test]
    fn form_accepts_numeric_balance_json() {
        let f: AccountForm = serde_json::from_value(json!({
            "login": "abc", "password": "pw", "server": "s", "balance": 50000, "platform": "mt5"
        }))
        .unwrap();
        assert_eq!(f.validate().unwrap().balance, 50_000.0);
        assert!(!format!("{f:?}").contains("pw"));
    }

    #[tokio::test]
    async fn create_refetches_instead_of_appending() {
        let backend = FakeBackend::default();
        backend
            .accounts
            .lock()
            .await
            .push(json!({"id": 100, "login": "old", "balance": 5000, "used": false}));
        let url = backend.spawn().await;
        let client = BackendClient::new(&test_settings(&url, "./unused.sqlite")).unwrap();
        let prov = AccountProvisioner::new(client, temp_store(), 60);

        let before = prov.listing(TOKEN).await.unwrap();
        assert_eq!(before.accounts.len(), 1);
        assert_eq!(backend.account_gets.load(Ordering::SeqCst), 1);

        // a write from elsewhere lands on the backend
        backend
            .accounts
            .lock()
            .await
            .push(json!({"id": 101, "login": "other", "balance": 10000, "used": false}));

        let (created, listing) = prov.create(TOKEN, &form("fresh1", "25000")).await.unwrap();
        assert_eq!(created.login.as_deref(), Some("fresh1"));
        assert_eq!(backend.account_gets.load(Ordering::SeqCst), 2);

        let logins: Vec<_> = listing.accounts.iter().filter_map(|a| a.login.clone()).collect();
        assert_eq!(logins, vec!["old", "other", "fresh1"]);
        assert_eq!(listing.tiers[0].count, 1);
        assert_eq!(listing.tiers[1].count, 1);
        assert_eq!(listing.tiers[2].count, 1);

        // fresh cache: no extra backend round trip
        prov.listing(TOKEN).await.unwrap();
        assert_eq!(backend.account_gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_create_leaves_cache_alone() {
        let backend = FakeBackend::default();
        let url = backend.spawn().await;
        let client = BackendClient::new(&test_settings(&url, "./unused.sqlite")).unwrap();
        let store = temp_store();
        let prov = AccountProvisioner::new(client, store.clone(), 60);

        prov.listing(TOKEN).await.unwrap();
        let ts = store.cache_fetched_ts(CACHE_BROKER_ACCOUNTS).unwrap();
        assert!(ts.is_some());

        let err = prov.create(TOKEN, &form("taken", "5000")).await.unwrap_err();
        assert!(format!("{err:#}").contains("must be unique"));
        assert_eq!(store.cache_fetched_ts(CACHE_BROKER_ACCOUNTS).unwrap(), ts);

        let err = prov.create(TOKEN, &form("bad login", "5000")).await.unwrap_err();
        assert!(err.downcast_ref::<FormError>().is_some());
    }

    #[tokio::test]
    async fn cached_listing_requires_an_accepted_token() {
        let backend = FakeBackend::default();
        backend
            .accounts
            .lock()
            .await
            .push(json!({"id": 1, "login": "pool-1", "balance": 5000, "used": false}));
        let url = backend.spawn().await;
        let client = BackendClient::new(&test_settings(&url, "./unused.sqlite")).unwrap();
        let store = temp_store();
        let prov = AccountProvisioner::new(client.clone(), store.clone(), 60);

        prov.listing(TOKEN).await.unwrap();
        let err = prov.listing("forged").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackendError>(),
            Some(BackendError::Unauthorized(_))
        ));

        // the accepted caller still reads from cache
        prov.listing(TOKEN).await.unwrap();
        assert_eq!(backend.account_gets.load(Ordering::SeqCst), 1);

        // rows left on disk by an earlier process are not served unchecked
        let restarted = AccountProvisioner::new(client, store, 60);
        assert!(restarted.listing("forged").await.is_err());
        restarted.listing(TOKEN).await.unwrap();
        assert_eq!(backend.account_gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_stale_listings_share_one_refetch() {
        let backend = FakeBackend::default();
        let url = backend.spawn().await;
        let client = BackendClient::new(&test_settings(&url, "./unused.sqlite")).unwrap();
        let prov = AccountProvisioner::new(client, temp_store(), 60);

        let (a, b, c) = tokio::join!(prov.listing(TOKEN), prov.listing(TOKEN), prov.listing(TOKEN));
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(backend.account_gets.load(Ordering::SeqCst), 1);
    }
}
