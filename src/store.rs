 use std::path::Path;

 use anyhow::{Context, Result};
 use rusqlite::{params, Connection, OptionalExtension};
 use serde_json::Value as JsonValue;

 use crate::models::{BrokerAccount, BrokerAccountView, Platform};

 pub const CACHE_BROKER_ACCOUNTS: &str = "broker_accounts";

 #[derive(Clone)]
 pub struct SqliteStore {
     path: String,
 }

 impl SqliteStore {
     pub fn new(path: &str) -> Result<Self> {
         if path.trim().is_empty() {
             anyhow::bail!("SQLITE_PATH is empty");
         }
         if path != ":memory:" && !path.starts_with("file:") {
             if let Some(parent) = Path::new(path).parent() {
                 std::fs::create_dir_all(parent)
                     .with_context(|| format!("create sqlite parent dir for {path}"))?;
             }
         }

         // rusqlite::Connection is not Send/Sync. We keep only a path here and open
         // short-lived connections per operation.
         Ok(Self { path: path.to_string() })
     }

     pub fn path(&self) -> &str {
         &self.path
     }

     fn open_conn(&self) -> Result<Connection> {
         let conn = Connection::open(&self.path).with_context(|| format!("open sqlite {}", self.path))?;
         conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
         Ok(conn)
     }

     pub fn init_db(&self) -> Result<()> {
         let conn = self.open_conn()?;
         conn.execute_batch(
             r#"
 CREATE TABLE IF NOT EXISTS broker_accounts (
   id INTEGER,
   document_id TEXT,
   login TEXT,
   balance REAL,
   server TEXT,
   platform TEXT,
   used INTEGER,
   has_password INTEGER,
   has_investor_password INTEGER,
   fetched_ts REAL
 );

 CREATE INDEX IF NOT EXISTS idx_broker_accounts_balance ON broker_accounts(balance);

 CREATE TABLE IF NOT EXISTS cache_meta (
   key TEXT PRIMARY KEY,
   fetched_ts REAL
 );

 CREATE TABLE IF NOT EXISTS runtime_status (
   component TEXT PRIMARY KEY,
   ts REAL,
   level TEXT,
   message TEXT,
   detail TEXT
 );
 "#,
         )?;
         Ok(())
     }

     /// Drops every cached listing. Runtime status survives.
     pub fn clear_cache(&self) -> Result<()> {
         let conn = self.open_conn()?;
         conn.execute_batch(
             r#"
 DELETE FROM broker_accounts;
 DELETE FROM cache_meta;
 "#,
         )?;
         Ok(())
     }

     /// Marks a cached listing stale. The rows stay until the next refetch replaces them.
     pub fn invalidate(&self, key: &str) -> Result<()> {
         let conn = self.open_conn()?;
         conn.execute("DELETE FROM cache_meta WHERE key = ?", params![key])?;
         Ok(())
     }

     pub fn cache_fetched_ts(&self, key: &str) -> Result<Option<f64>> {
         let conn = self.open_conn()?;
         let v: Option<f64> = conn
             .query_row("SELECT fetched_ts FROM cache_meta WHERE key = ?", params![key], |r| r.get(0))
             .optional()?;
         Ok(v)
     }

     /// Replace the cached unused-account listing with an authoritative fetch. Credentials are
     /// never written.
     pub fn replace_broker_accounts(&self, accounts: &[BrokerAccount], ts: f64) -> Result<()> {
         let mut conn = self.open_conn()?;
         let tx = conn.transaction()?;
         tx.execute("DELETE FROM broker_accounts", [])?;
         {
             let mut stmt = tx.prepare(
                 r#"
 INSERT INTO broker_accounts(
   id, document_id, login, balance, server, platform, used,
   has_password, has_investor_password, fetched_ts
 )
 VALUES(?,?,?,?,?,?,?,?,?,?)
 "#,
             )?;
             for a in accounts {
                 let v = a.view();
                 stmt.execute(params![
                     v.id,
                     v.document_id,
                     v.login,
                     v.balance,
                     v.server,
                     v.platform.map(|p| p.as_str()),
                     if v.used { 1 } else { 0 },
                     if v.has_password { 1 } else { 0 },
                     if v.has_investor_password { 1 } else { 0 },
                     ts
                 ])?;
             }
         }
         tx.execute(
             r#"
 INSERT INTO cache_meta(key, fetched_ts) VALUES(?,?)
 ON CONFLICT(key) DO UPDATE SET fetched_ts=excluded.fetched_ts
 "#,
             params![CACHE_BROKER_ACCOUNTS, ts],
         )?;
         tx.commit()?;
         Ok(())
     }

     pub fn fetch_broker_accounts(&self) -> Result<Vec<BrokerAccountView>> {
         let conn = self.open_conn()?;
         let mut stmt = conn.prepare(
             r#"
 SELECT id, document_id, login, balance, server, platform, used, has_password, has_investor_password
 FROM broker_accounts
 ORDER BY rowid ASC
 "#,
         )?;
         let mut rows = stmt.query([])?;
         let mut out = vec![];
         while let Some(r) = rows.next()? {
             let platform: Option<String> = r.get(5)?;
             out.push(BrokerAccountView {
                 id: r.get(0)?,
                 document_id: r.get(1)?,
                 login: r.get(2)?,
                 balance: r.get(3)?,
                 server: r.get(4)?,
                 platform: platform.as_deref().and_then(Platform::parse),
                 used: r.get::<_, i64>(6)? != 0,
                 has_password: r.get::<_, i64>(7)? != 0,
                 has_investor_password: r.get::<_, i64>(8)? != 0,
             });
         }
         Ok(out)
     }

     pub fn upsert_runtime_status(
         &self,
         component: &str,
         level: &str,
         message: &str,
         detail: Option<&str>,
         ts: f64,
     ) -> Result<()> {
         let conn = self.open_conn()?;
         conn.execute(
             r#"
 INSERT INTO runtime_status(component, ts, level, message, detail)
 VALUES(?,?,?,?,?)
 ON CONFLICT(component) DO UPDATE SET
   ts=excluded.ts,
   level=excluded.level,
   message=excluded.message,
   detail=excluded.detail
 "#,
             params![component, ts, level, message, detail],
         )?;
         Ok(())
     }

     pub fn fetch_runtime_statuses(&self) -> Result<JsonValue> {
         let conn = self.open_conn()?;
         let mut stmt = conn.prepare("SELECT component, ts, level, message, detail FROM runtime_status ORDER BY ts DESC")?;
         let mut rows = stmt.query([])?;
         let mut out = serde_json::Map::new();
         while let Some(r) = rows.next()? {
             let component: String = r.get(0)?;
             let ts: f64 = r.get(1)?;
             let level: String = r.get(2)?;
             let message: String = r.get(3)?;
             let detail: Option<String> = r.get(4)?;
             out.insert(
                 component.clone(),
                 serde_json::json!({
                     "component": component,
                     "ts": ts,
                     "level": level,
                     "message": message,
                     "detail": detail.unwrap_or_default(),
                 }),
             );
         }
         Ok(JsonValue::Object(out))
     }
 }

 #[cfg(test)]
 pub(crate) fn temp_store() -> SqliteStore {
     let path = std::env::temp_dir().join(format!("metrix-test-{}.sqlite", uuid::Uuid::new_v4()));
     let store = SqliteStore::new(path.to_str().unwrap()).unwrap();
     store.init_db().unwrap();
     store
 }
