//! Domain records as the backend serves them, plus the secret-free views the service hands out.
//!
//! The backend is Strapi-style: entities arrive either flat (`{id, documentId, ...}`) or wrapped
//! (`{data: {id, attributes: {...}}}`), and numeric fields are sometimes numeric strings. Decoding
//! here is lenient so one odd field never sinks a whole record.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::utils::as_number;

/// Credential text. Never printed, never serialized back out.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Mt4,
    Mt5,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mt4 => "mt4",
            Platform::Mt5 => "mt5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mt4" => Some(Platform::Mt4),
            "mt5" => Some(Platform::Mt5),
            _ => None,
        }
    }
}

fn string_like(v: JsonValue) -> Option<String> {
    match v {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<JsonValue>::deserialize(d)?.and_then(string_like))
}

fn de_opt_secret<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Secret>, D::Error> {
    Ok(Option::<JsonValue>::deserialize(d)?
        .and_then(string_like)
        .map(Secret))
}

fn de_opt_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<JsonValue>::deserialize(d)?.as_ref().and_then(as_number))
}

fn de_opt_platform<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Platform>, D::Error> {
    Ok(Option::<JsonValue>::deserialize(d)?
        .and_then(string_like)
        .and_then(|s| Platform::parse(&s)))
}

fn de_opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(match Option::<JsonValue>::deserialize(d)? {
        Some(JsonValue::Bool(b)) => Some(b),
        Some(JsonValue::String(s)) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Some(JsonValue::Number(n)) => n.as_i64().map(|i| i != 0),
        _ => None,
    })
}

// ---- Strapi envelopes ----

fn is_envelope(m: &Map<String, JsonValue>) -> bool {
    m.contains_key("data") && m.keys().all(|k| k == "data" || k == "meta")
}

/// Flatten one Strapi entity: strips a `{data: ...}` envelope and hoists `attributes` next to `id`.
/// `None` for null relations and non-objects.
pub fn unwrap_entity(v: &JsonValue) -> Option<Map<String, JsonValue>> {
    let mut obj = v.as_object()?;
    if is_envelope(obj) {
        obj = obj.get("data")?.as_object()?;
    }
    let mut out = obj.clone();
    if let Some(JsonValue::Object(attrs)) = out.remove("attributes") {
        for (k, val) in attrs {
            out.entry(k).or_insert(val);
        }
    }
    Some(out)
}

/// Items of a Strapi collection, either a bare array or `{data: [...]}`.
pub fn unwrap_collection(v: &JsonValue) -> Option<Vec<JsonValue>> {
    match v {
        JsonValue::Array(items) => Some(items.clone()),
        JsonValue::Object(m) if is_envelope(m) => m.get("data")?.as_array().cloned(),
        _ => None,
    }
}

// ---- Broker accounts ----

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerAccount {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, rename = "documentId")]
    pub document_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub login: Option<String>,
    #[serde(default, deserialize_with = "de_opt_secret")]
    pub password: Option<Secret>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub balance: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub server: Option<String>,
    #[serde(default, deserialize_with = "de_opt_platform")]
    pub platform: Option<Platform>,
    #[serde(default, rename = "inversorPass", deserialize_with = "de_opt_secret")]
    pub inversor_pass: Option<Secret>,
    #[serde(default, deserialize_with = "de_opt_bool")]
    pub used: Option<bool>,
}

impl BrokerAccount {
    pub fn from_value(v: &JsonValue) -> Option<Self> {
        let m = unwrap_entity(v)?;
        serde_json::from_value(JsonValue::Object(m)).ok()
    }

    pub fn view(&self) -> BrokerAccountView {
        BrokerAccountView {
            id: self.id,
            document_id: self.document_id.clone(),
            login: self.login.clone(),
            balance: self.balance,
            server: self.server.clone(),
            platform: self.platform,
            used: self.used.unwrap_or(false),
            has_password: self.password.as_ref().is_some_and(|p| !p.is_empty()),
            has_investor_password: self.inversor_pass.as_ref().is_some_and(|p| !p.is_empty()),
        }
    }
}

/// What the service shows of a broker account: everything except credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAccountView {
    pub id: Option<i64>,
    pub document_id: Option<String>,
    pub login: Option<String>,
    pub balance: Option<f64>,
    pub server: Option<String>,
    pub platform: Option<Platform>,
    pub used: bool,
    pub has_password: bool,
    pub has_investor_password: bool,
}

// ---- Challenges ----

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeStage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub maximum_total_loss: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub profit_target: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub maximum_daily_loss: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub minimum_trading_days: Option<f64>,
}

/// Stage list from a raw value. `None` when the value is not a sequence. Elements that do not
/// decode keep their slot as an empty stage so indices stay aligned with phases.
pub fn stages_from_value(v: &JsonValue) -> Option<Vec<ChallengeStage>> {
    let items = unwrap_collection(v)?;
    Some(
        items
            .iter()
            .map(|item| {
                unwrap_entity(item)
                    .and_then(|m| serde_json::from_value(JsonValue::Object(m)).ok())
                    .unwrap_or_default()
            })
            .collect(),
    )
}

#[derive(Debug, Clone, Default)]
pub struct Challenge {
    pub id: Option<i64>,
    pub document_id: Option<String>,
    pub phase: Option<u32>,
    pub result: Option<String>,
    /// Opaque payload: a JSON string or an already structured value.
    pub metadata: Option<JsonValue>,
    pub broker_account: Option<BrokerAccount>,
    /// `challenge_relation.challenge_stages`; `None` when the relation or its stages are absent.
    pub relation_stages: Option<Vec<ChallengeStage>>,
}

fn phase_from(v: &JsonValue) -> Option<u32> {
    let p = as_number(v)?;
    if p < 0.0 || p.fract() != 0.0 || p > u32::MAX as f64 {
        return None;
    }
    Some(p as u32)
}

impl Challenge {
    pub fn from_value(v: &JsonValue) -> Self {
        let Some(m) = unwrap_entity(v) else {
            return Self::default();
        };
        Self::from_map(&m)
    }

    pub fn from_map(m: &Map<String, JsonValue>) -> Self {
        let relation_stages = m
            .get("challenge_relation")
            .and_then(unwrap_entity)
            .and_then(|rel| rel.get("challenge_stages").and_then(stages_from_value));

        Self {
            id: m.get("id").and_then(|x| x.as_i64()),
            document_id: m
                .get("documentId")
                .and_then(|x| x.as_str())
                .map(|s| s.to_string()),
            phase: m.get("phase").and_then(phase_from),
            result: m
                .get("result")
                .and_then(|x| x.as_str())
                .map(|s| s.to_string()),
            metadata: m.get("metadata").filter(|x| !x.is_null()).cloned(),
            broker_account: m.get("broker_account").and_then(BrokerAccount::from_value),
            relation_stages,
        }
    }

    pub fn summary(&self) -> ChallengeSummary {
        ChallengeSummary {
            id: self.id,
            document_id: self.document_id.clone(),
            phase: self.phase,
            result: self.result.clone(),
            login: self.broker_account.as_ref().and_then(|b| b.login.clone()),
        }
    }
}

/// Shallow merge of the listing record with its detail record, detail winning. The broker account
/// always comes from the detail when it has one.
pub fn merge_challenge(basic: &JsonValue, detailed: &JsonValue) -> JsonValue {
    let mut out = unwrap_entity(basic).unwrap_or_default();
    if let Some(detail) = unwrap_entity(detailed) {
        for (k, v) in detail {
            out.insert(k, v);
        }
    }
    JsonValue::Object(out)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSummary {
    pub id: Option<i64>,
    pub document_id: Option<String>,
    pub phase: Option<u32>,
    pub result: Option<String>,
    pub login: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Certificate {
    #[serde(default, rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(default, rename = "lastName")]
    pub last_name: Option<String>,
    #[serde(default, rename = "tipoChallenge")]
    pub challenge_type: Option<String>,
    #[serde(default, rename = "fechaFinChallenge")]
    pub completed_on: Option<String>,
    #[serde(default, rename = "pdfUrl")]
    pub pdf_url: Option<String>,
}

/// `/api/users/me` with its populated challenges.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub username: Option<String>,
    /// Raw records, kept raw so they can be merged with detail fetches.
    pub challenges: Vec<JsonValue>,
    pub certificates: Vec<Certificate>,
}

impl UserProfile {
    pub fn from_value(v: &JsonValue) -> Self {
        let Some(m) = unwrap_entity(v) else {
            return Self::default();
        };
        let certificates = m
            .get("certificates")
            .and_then(unwrap_collection)
            .unwrap_or_default()
            .iter()
            .filter_map(|c| unwrap_entity(c))
            .filter_map(|c| serde_json::from_value(JsonValue::Object(c)).ok())
            .collect();
        Self {
            username: m
                .get("username")
                .and_then(|x| x.as_str())
                .map(|s| s.to_string()),
            challenges: m
                .get("challenges")
                .and_then(unwrap_collection)
                .unwrap_or_default(),
            certificates,
        }
    }

    /// Raw listing record of the challenge with this document id.
    pub fn find_challenge(&self, document_id: &str) -> Option<&JsonValue> {
        self.challenges.iter().find(|c| {
            unwrap_entity(c)
                .and_then(|m| m.get("documentId").and_then(|d| d.as_str()).map(|d| d == document_id))
                .unwrap_or(false)
        })
    }

    /// The certificate shown to the user: the first one on record.
    pub fn featured_certificate(&self) -> Option<&Certificate> {
        self.certificates.first()
    }
}
