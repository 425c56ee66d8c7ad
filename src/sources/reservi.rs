// src/sources/reservi.rs
//! Booking-calendar adapter for the reservi.ru fit-calendar API.
//!
//! One POST per poll returns the whole calendar as two HTML fragments: a
//! filter block listing trainers and a timetable body listing slots. Parsing
//! lifts both into typed records, keeps only the configured training types,
//! and folds the identifying fields into each entry's identity key.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::snapshot::{Entry, Snapshot};
use crate::sources::SourceAdapter;

const API_URL: &str = "https://reservi.ru/api-fit1c/json/v2/";
// Shipped in the booking site's public web client; appears to be long-lived.
const API_KEY: &str = "9dd877e0-8eaf-41dc-97b0-a9a0ef8e5400";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Booking configuration for one pool: stable slug, display label, salon id
/// in the booking system, and the training-type ids worth watching.
pub struct PoolConfig {
    pub slug: &'static str,
    pub label: &'static str,
    pub salon_id: &'static str,
    pub trainings: &'static [&'static str],
}

pub const POOLS: &[PoolConfig] = &[
    PoolConfig {
        slug: "chaika",
        label: "Чайка",
        salon_id: "65b64540-c816-11ea-bbd3-0050568342b3",
        trainings: &["ad66550f-cb3f-11ea-bbd3-0050568342b3"],
    },
    PoolConfig {
        slug: "mchs",
        label: "МЧС",
        salon_id: "da11d109-cb37-11ea-bbd3-0050568342b3",
        trainings: &["632f7da9-23f8-11eb-bbe5-0050568342b3"],
    },
    PoolConfig {
        slug: "zil",
        label: "ЗИЛ",
        salon_id: "da11d108-cb37-11ea-bbd3-0050568342b3",
        trainings: &["ad505156-f343-11ea-bbe4-0050568342b3"],
    },
];

/// One bookable slot as stored in entry payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub training: String,
    pub starts_at: String,
    pub trainer: String,
    pub free: u32,
    pub total: u32,
}

/// Identity key: every field participates, so a change in free/total counts
/// as a new entry while an unchanged slot stays silent.
fn identity_key(rec: &SlotRecord) -> String {
    format!(
        "{}/{}/{}/t{}/f{}",
        rec.training, rec.starts_at, rec.trainer, rec.total, rec.free
    )
}

fn entry_of(rec: &SlotRecord) -> Result<Entry> {
    let payload = serde_json::to_value(rec).context("serializing slot payload")?;
    Ok(Entry::new(identity_key(rec), payload))
}

#[derive(Debug, Deserialize)]
struct CalendarResponse {
    #[serde(rename = "SLIDER")]
    slider: Slider,
}

#[derive(Debug, Deserialize)]
struct Slider {
    #[serde(rename = "ALL_BLOCK")]
    all_block: String,
    #[serde(rename = "BODY")]
    body: String,
}

pub struct ReserviAdapter {
    pool: &'static PoolConfig,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http { client: reqwest::Client },
}

impl ReserviAdapter {
    pub fn from_pool(pool: &'static PoolConfig) -> Self {
        Self {
            pool,
            mode: Mode::Http {
                client: reqwest::Client::new(),
            },
        }
    }

    /// Parse from a canned API response instead of the network.
    pub fn from_fixture(pool: &'static PoolConfig, raw: &str) -> Self {
        Self {
            pool,
            mode: Mode::Fixture(raw.to_string()),
        }
    }

    fn parse_snapshot(&self, raw: &str) -> Result<Snapshot> {
        let t0 = std::time::Instant::now();
        let calendar: CalendarResponse =
            serde_json::from_str(raw).context("parsing calendar response")?;

        let trainers = parse_trainers(&calendar.slider.all_block);
        let mut slots = parse_slots(&calendar.slider.body, &trainers);
        slots.retain(|s| self.pool.trainings.contains(&s.training.as_str()));
        slots.sort_by_key(|s| parse_start(&s.starts_at));

        let snapshot = slots
            .iter()
            .map(entry_of)
            .collect::<Result<Snapshot>>()?;

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("source_parse_ms").record(ms);
        counter!("source_entries_total").increment(snapshot.len() as u64);
        Ok(snapshot)
    }

    async fn fetch_calendar(&self, client: &reqwest::Client) -> Result<String> {
        let form = [
            ("method", "getFitCalendar"),
            ("api_key", API_KEY),
            ("params[salonId]", self.pool.salon_id),
            ("params[getAll]", "Y"),
            ("lang", "en"),
        ];
        let resp = client
            .post(API_URL)
            .timeout(REQUEST_TIMEOUT)
            .form(&form)
            .send()
            .await
            .context("calendar request failed")?;
        let resp = resp
            .error_for_status()
            .context("calendar returned error status")?;
        resp.text().await.context("reading calendar body")
    }
}

#[async_trait]
impl SourceAdapter for ReserviAdapter {
    fn name(&self) -> &str {
        self.pool.slug
    }

    async fn fetch(&self) -> Result<Snapshot> {
        match &self.mode {
            Mode::Fixture(raw) => self.parse_snapshot(raw),
            Mode::Http { client } => {
                let body = self.fetch_calendar(client).await?;
                self.parse_snapshot(&body)
            }
        }
    }

    fn render_message(&self, diff: &Snapshot) -> String {
        let mut blocks = Vec::with_capacity(diff.len());
        for entry in diff {
            match serde_json::from_value::<SlotRecord>(entry.payload.clone()) {
                Ok(rec) => blocks.push(format!(
                    "_{}_\n{}\nFree *{} of {}*\n",
                    format_date(&rec.starts_at),
                    rec.trainer,
                    rec.free,
                    rec.total
                )),
                Err(e) => {
                    tracing::warn!(error = ?e, source = self.pool.slug, "unreadable entry payload");
                }
            }
        }
        format!("*{}*\n{}", self.pool.label, blocks.join("\n"))
    }
}

/// Trainer id → display name, from the filter block markup. Elements carry
/// `data-employee` and a `data-filter-option` attribute holding `{"id": ...}`.
fn parse_trainers(html: &str) -> HashMap<String, String> {
    static RE_TAG: OnceCell<Regex> = OnceCell::new();
    let re_tag =
        RE_TAG.get_or_init(|| Regex::new(r"(?is)<[a-z][^>]*\bdata-employee\b[^>]*>").unwrap());

    let mut trainers = HashMap::new();
    for m in re_tag.find_iter(html) {
        let id = attr_json(m.as_str(), "data-filter-option")
            .and_then(|v| v.get("id").map(json_key));
        let Some(id) = id else {
            tracing::warn!("failed to parse trainer record");
            continue;
        };
        let rest = &html[m.end()..];
        let name = rest.split('<').next().unwrap_or_default();
        let name = html_escape::decode_html_entities(name).trim().to_string();
        trainers.insert(id, name);
    }
    trainers
}

/// Slot records from the timetable body. Each record is an element with a
/// `data-option-filter` attribute; its occupancy text lives in nested
/// `place-table_res` elements and its fields in the record attribute merged
/// with the nested `data-timetable-item` element's `data-options`.
fn parse_slots(html: &str, trainers: &HashMap<String, String>) -> Vec<SlotRecord> {
    static RE_RECORD: OnceCell<Regex> = OnceCell::new();
    static RE_ITEM: OnceCell<Regex> = OnceCell::new();
    static RE_COUNTS: OnceCell<Regex> = OnceCell::new();
    let re_record = RE_RECORD
        .get_or_init(|| Regex::new(r"(?is)<[a-z][^>]*\bdata-option-filter\b[^>]*>").unwrap());
    let re_item = RE_ITEM
        .get_or_init(|| Regex::new(r"(?is)<[a-z][^>]*\bdata-timetable-item\b[^>]*>").unwrap());
    let re_counts = RE_COUNTS
        .get_or_init(|| Regex::new(r"(?is)<[a-z][^>]*\bplace-table_res\b[^>]*>([^<]*)").unwrap());

    let tags: Vec<(usize, usize)> = re_record
        .find_iter(html)
        .map(|m| (m.start(), m.end()))
        .collect();

    let mut slots = Vec::with_capacity(tags.len());
    for (i, (start, end)) in tags.iter().enumerate() {
        let segment_end = tags.get(i + 1).map_or(html.len(), |next| next.0);
        let tag = &html[*start..*end];
        let segment = &html[*end..segment_end];

        // No parseable occupancy text means the row is not offering places.
        let Some((free, total)) = slot_counts(re_counts, segment) else {
            continue;
        };

        let filter = attr_json(tag, "data-option-filter");
        let options = re_item
            .find(segment)
            .and_then(|m| attr_json(m.as_str(), "data-options"));
        let Some(merged) = merge_objects(filter, options) else {
            tracing::warn!(item = i, "failed to parse slot options, skipping");
            continue;
        };

        let trainer_key = merged.get("employee").map(json_key).unwrap_or_default();
        slots.push(SlotRecord {
            training: merged.get("service").map(json_key).unwrap_or_default(),
            starts_at: merged.get("start_date").map(json_key).unwrap_or_default(),
            trainer: trainers.get(&trainer_key).cloned().unwrap_or_default(),
            free,
            total,
        });
    }
    slots
}

/// Occupancy from the first recognizable "free: N from M" text, matched
/// after dropping whitespace and case ("Free: 3 from 10" → "free:3from10").
fn slot_counts(re_counts: &Regex, segment: &str) -> Option<(u32, u32)> {
    for caps in re_counts.captures_iter(segment) {
        let Some(text) = caps.get(1) else { continue };
        let decoded = html_escape::decode_html_entities(text.as_str());
        let compact: String = decoded
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        if !compact.contains("free") {
            continue;
        }
        let after = compact.split(':').nth(1)?;
        let (free, total) = after.split_once("from")?;
        return Some((free.parse().ok()?, total.parse().ok()?));
    }
    None
}

/// Quoted attribute value from a single opening tag.
fn attr_value<'a>(tag: &'a str, attr: &str) -> Option<&'a str> {
    let at = tag.find(attr)?;
    let rest = tag[at + attr.len()..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let quote = rest.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(&rest[..end])
}

fn attr_json(tag: &str, attr: &str) -> Option<serde_json::Value> {
    let raw = attr_value(tag, attr)?;
    let decoded = html_escape::decode_html_entities(raw);
    serde_json::from_str(decoded.trim()).ok()
}

/// Spread semantics: `over` wins on key collisions. Both sides must be
/// JSON objects or the record is unusable.
fn merge_objects(
    base: Option<serde_json::Value>,
    over: Option<serde_json::Value>,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    let mut out = base?.as_object()?.clone();
    for (k, v) in over?.as_object()? {
        out.insert(k.clone(), v.clone());
    }
    Some(out)
}

/// JSON scalars used as map keys: strings verbatim, anything else via its
/// JSON rendering (ids arrive as both strings and numbers).
fn json_key(v: &serde_json::Value) -> String {
    match v.as_str() {
        Some(s) => s.to_string(),
        None => v.to_string(),
    }
}

fn parse_start(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Long-form date for messages; an unparseable start date falls back to the
/// raw string rather than dropping the entry.
fn format_date(raw: &str) -> String {
    match parse_start(raw) {
        Some(dt) => dt.format("%A, %B %-d, %Y").to_string(),
        None => raw.to_string(),
    }
}
