use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::store::db;

/// Provider family an account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Codewhisperer,
    Gemini,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Codewhisperer => "codewhisperer",
            AccountKind::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "gemini" => AccountKind::Gemini,
            _ => AccountKind::Codewhisperer,
        }
    }
}

/// One provider identity registered in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub kind: AccountKind,
    pub enabled: bool,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
    /// Provider-specific extension bag; unknown keys survive round-trips.
    pub other: Value,
    pub last_refresh_time: Option<String>,
    pub last_refresh_status: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Account {
    pub fn project_id(&self) -> Option<String> {
        self.other
            .get("project")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn api_endpoint(&self, default: &str) -> String {
        self.other
            .get("api_endpoint")
            .and_then(|v| v.as_str())
            .unwrap_or(default)
            .to_string()
    }

    pub fn is_suspended(&self) -> bool {
        self.other
            .get("suspended")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn ledger_entry(&self, model: &str) -> Option<&Value> {
        self.other.get("creditsInfo")?.get("models")?.get(model)
    }
}

/// Attributes for account creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAccount {
    pub label: Option<String>,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
    pub other: Option<Value>,
    pub enabled: Option<bool>,
    #[serde(rename = "type", default)]
    pub kind: Option<AccountKind>,
}

/// Partial update; unspecified fields are preserved.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountPatch {
    pub label: Option<String>,
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(rename = "clientSecret")]
    pub client_secret: Option<String>,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
    pub other: Option<Value>,
    pub enabled: Option<bool>,
}

fn now_stamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn row_to_account(row: &Row) -> rusqlite::Result<Account> {
    let other_raw: Option<String> = row.get("other")?;
    let other = other_raw
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| json!({}));

    Ok(Account {
        id: row.get("id")?,
        label: row.get("label")?,
        kind: AccountKind::parse(&row.get::<_, Option<String>>("type")?.unwrap_or_default()),
        enabled: row.get::<_, Option<i64>>("enabled")?.unwrap_or(1) != 0,
        client_id: row.get::<_, Option<String>>("clientId")?.unwrap_or_default(),
        client_secret: row
            .get::<_, Option<String>>("clientSecret")?
            .unwrap_or_default(),
        refresh_token: row.get("refreshToken")?,
        access_token: row.get("accessToken")?,
        other,
        last_refresh_time: row.get("last_refresh_time")?,
        last_refresh_status: row.get("last_refresh_status")?,
        created_at: row.get::<_, Option<String>>("created_at")?.unwrap_or_default(),
        updated_at: row.get::<_, Option<String>>("updated_at")?.unwrap_or_default(),
    })
}

/// Durable keyed collection of accounts. All mutations go through one
/// process-wide lock; write volume is low.
#[derive(Clone)]
pub struct AccountStore {
    conn: Arc<Mutex<Connection>>,
}

impl AccountStore {
    pub fn open(path: &PathBuf) -> GatewayResult<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(db::open(path)?)),
        })
    }

    pub fn open_in_memory() -> GatewayResult<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(db::open_in_memory()?)),
        })
    }

    pub fn list_enabled(&self, kind: Option<AccountKind>) -> GatewayResult<Vec<Account>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        match kind {
            Some(k) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM accounts WHERE enabled=1 AND type=?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![k.as_str()], row_to_account)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM accounts WHERE enabled=1 ORDER BY created_at DESC")?;
                let rows = stmt.query_map([], row_to_account)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn list_all(&self) -> GatewayResult<Vec<Account>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM accounts ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], row_to_account)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> GatewayResult<Option<Account>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM accounts WHERE id=?1")?;
        let mut rows = stmt.query_map(params![id], row_to_account)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn create(&self, attrs: NewAccount) -> GatewayResult<Account> {
        let id = Uuid::new_v4().to_string();
        let now = now_stamp();
        let kind = attrs.kind.unwrap_or(AccountKind::Codewhisperer);
        let other_str = attrs.other.as_ref().map(|o| o.to_string());

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO accounts (id, label, clientId, clientSecret, refreshToken, accessToken, other, last_refresh_time, last_refresh_status, created_at, updated_at, enabled, type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 'never', ?8, ?8, ?9, ?10)",
                params![
                    id,
                    attrs.label,
                    attrs.client_id,
                    attrs.client_secret,
                    attrs.refresh_token,
                    attrs.access_token,
                    other_str,
                    now,
                    attrs.enabled.unwrap_or(true) as i64,
                    kind.as_str(),
                ],
            )?;
        }

        self.get(&id)?
            .ok_or_else(|| GatewayError::NotFound(format!("account {} vanished after insert", id)))
    }

    pub fn update(&self, id: &str, patch: AccountPatch) -> GatewayResult<Option<Account>> {
        let now = now_stamp();
        let mut fields: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(label) = patch.label {
            fields.push("label=?");
            values.push(Box::new(label));
        }
        if let Some(client_id) = patch.client_id {
            fields.push("clientId=?");
            values.push(Box::new(client_id));
        }
        if let Some(client_secret) = patch.client_secret {
            fields.push("clientSecret=?");
            values.push(Box::new(client_secret));
        }
        if let Some(refresh_token) = patch.refresh_token {
            fields.push("refreshToken=?");
            values.push(Box::new(refresh_token));
        }
        if let Some(access_token) = patch.access_token {
            fields.push("accessToken=?");
            values.push(Box::new(access_token));
        }
        if let Some(other) = patch.other {
            fields.push("other=?");
            values.push(Box::new(other.to_string()));
        }
        if let Some(enabled) = patch.enabled {
            fields.push("enabled=?");
            values.push(Box::new(enabled as i64));
        }

        if fields.is_empty() {
            return self.get(id);
        }

        fields.push("updated_at=?");
        values.push(Box::new(now));
        values.push(Box::new(id.to_string()));

        let sql = format!("UPDATE accounts SET {} WHERE id=?", fields.join(", "));
        let changed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                &sql,
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            )?
        };

        if changed == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    /// Token write used by the token manager; stamps refresh time/status
    /// atomically with the token itself.
    pub fn update_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        status: &str,
    ) -> GatewayResult<Option<Account>> {
        let now = now_stamp();
        let changed = {
            let conn = self.conn.lock().unwrap();
            match refresh_token {
                Some(rt) => conn.execute(
                    "UPDATE accounts SET accessToken=?1, refreshToken=?2, last_refresh_time=?3, last_refresh_status=?4, updated_at=?3 WHERE id=?5",
                    params![access_token, rt, now, status, id],
                )?,
                None => conn.execute(
                    "UPDATE accounts SET accessToken=?1, last_refresh_time=?2, last_refresh_status=?3, updated_at=?2 WHERE id=?4",
                    params![access_token, now, status, id],
                )?,
            }
        };

        if changed == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    pub fn update_refresh_status(&self, id: &str, status: &str) -> GatewayResult<()> {
        let now = now_stamp();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET last_refresh_time=?1, last_refresh_status=?2, updated_at=?1 WHERE id=?3",
            params![now, status, id],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> GatewayResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM accounts WHERE id=?1", params![id])?;
        Ok(changed > 0)
    }

    /// Read-clone-patch-write on the `other` bag; keys absent from `patch`
    /// survive untouched.
    pub fn merge_other(&self, id: &str, patch: Value) -> GatewayResult<Option<Account>> {
        let Some(account) = self.get(id)? else {
            return Ok(None);
        };
        let mut other = account.other.clone();
        merge_json(&mut other, patch);
        self.update(
            id,
            AccountPatch {
                other: Some(other),
                ..Default::default()
            },
        )
    }

    /// Disable the account and record the suspension in the `other` bag.
    pub fn set_suspended(&self, id: &str, reason: &str) -> GatewayResult<()> {
        let Some(account) = self.get(id)? else {
            return Ok(());
        };
        let mut other = account.other.clone();
        merge_json(
            &mut other,
            json!({
                "suspended": true,
                "suspended_at": Utc::now().to_rfc3339(),
                "suspend_reason": reason,
            }),
        );
        self.update(
            id,
            AccountPatch {
                enabled: Some(false),
                other: Some(other),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Write the quota ledger entry for `model` to exhausted.
    pub fn mark_model_exhausted(
        &self,
        id: &str,
        model: &str,
        reset_time: &str,
    ) -> GatewayResult<()> {
        let Some(account) = self.get(id)? else {
            tracing::error!("mark_model_exhausted: account {} does not exist", id);
            return Ok(());
        };

        let mut other = account.other.clone();
        ensure_ledger(&mut other);
        other["creditsInfo"]["models"][model] = json!({
            "remainingFraction": 0,
            "remainingPercent": 0,
            "resetTime": reset_time,
        });

        self.update(
            id,
            AccountPatch {
                other: Some(other),
                ..Default::default()
            },
        )?;
        tracing::info!(
            "Marked model {} exhausted for account {}, reset at {}",
            model,
            id,
            reset_time
        );
        Ok(())
    }

    /// Self-heal an exhausted ledger entry once its reset instant has passed.
    /// Returns true when the model is usable (healed or never exhausted).
    pub fn restore_model_quota_if_due(&self, id: &str, model: &str) -> GatewayResult<bool> {
        let Some(account) = self.get(id)? else {
            return Ok(false);
        };

        let Some(entry) = account.ledger_entry(model) else {
            return Ok(true);
        };

        let fraction = entry
            .get("remainingFraction")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        if fraction > 0.0 {
            return Ok(true);
        }

        let Some(reset_time) = entry.get("resetTime").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        let Ok(reset_at) = DateTime::parse_from_rfc3339(reset_time) else {
            tracing::error!("Unparsable resetTime for account {}: {}", id, reset_time);
            return Ok(false);
        };

        if Utc::now() < reset_at {
            return Ok(false);
        }

        let mut other = account.other.clone();
        other["creditsInfo"]["models"][model]["remainingFraction"] = json!(1.0);
        other["creditsInfo"]["models"][model]["remainingPercent"] = json!(100);
        self.update(
            id,
            AccountPatch {
                other: Some(other),
                ..Default::default()
            },
        )?;
        tracing::info!("Restored quota for model {} on account {}", model, id);
        Ok(true)
    }

    /// Quota availability check for the router. The self-heal write happens
    /// here so an entry whose reset time passed becomes usable on read.
    pub fn is_model_available(&self, account: &Account, model: &str) -> bool {
        let Some(entry) = account.ledger_entry(model) else {
            return true;
        };

        let fraction = entry
            .get("remainingFraction")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        if fraction > 0.0 {
            return true;
        }

        match self.restore_model_quota_if_due(&account.id, model) {
            Ok(restored) => restored,
            Err(e) => {
                tracing::error!("Quota restore check failed for {}: {}", account.id, e);
                false
            }
        }
    }
}

fn ensure_ledger(other: &mut Value) {
    if !other.is_object() {
        *other = json!({});
    }
    let obj = other.as_object_mut().unwrap();
    let credits = obj
        .entry("creditsInfo")
        .or_insert_with(|| json!({"models": {}, "summary": {"totalModels": 0, "averageRemaining": 0}}));
    if credits.get("models").map_or(true, |m| !m.is_object()) {
        credits["models"] = json!({});
    }
}

/// Shallow merge preserving keys absent from the patch.
pub fn merge_json(target: &mut Value, patch: Value) {
    if !target.is_object() {
        *target = json!({});
    }
    if let (Some(target_map), Value::Object(patch_map)) = (target.as_object_mut(), patch) {
        for (k, v) in patch_map {
            target_map.insert(k, v);
        }
    }
}
