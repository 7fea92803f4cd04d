use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde_json::Value;
use tokio::sync::watch;

use crate::send::OutboundSender;
use crate::subscriber_store::SubscriberStore;

const DEFAULT_PACING_MS: u64 = 150;
const DEFAULT_SCHEDULE_TIMEOUT_MS: u64 = 12_000;

#[derive(Clone)]
pub struct BroadcastConfig {
    /// Cron expression with seconds field, evaluated in `timezone`.
    pub cron_expression: String,
    pub timezone: String,
    /// Delay between consecutive sends; rate-limit avoidance, not throughput.
    pub pacing_ms: u64,
    /// Fixed messages indexed by hour of day when no schedule slot matches.
    pub rotation: Vec<String>,
    pub fallback_message: Option<String>,
    /// Optional endpoint serving per-time-slot scheduled messages.
    pub schedule_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            cron_expression: "0 0 * * * *".to_string(),
            timezone: "Asia/Ho_Chi_Minh".to_string(),
            pacing_ms: DEFAULT_PACING_MS,
            rotation: Vec::new(),
            fallback_message: None,
            schedule_url: None,
            request_timeout_ms: DEFAULT_SCHEDULE_TIMEOUT_MS,
        }
    }
}

/// One externally scheduled broadcast slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBroadcastItem {
    pub id: String,
    pub topic_id: Option<String>,
    pub message: Option<String>,
    /// Local wall-clock slot, `"HH:MM"`.
    pub send_time: String,
    /// Weekday filter, 0 = Sunday; `None` means every day.
    pub days_of_week: Option<Vec<u8>>,
    pub last_sent_at_unix_ms: Option<u64>,
}

impl ScheduledBroadcastItem {
    /// True when the item's slot matches the current minute and weekday.
    pub fn matches_slot(&self, now: &DateTime<Tz>) -> bool {
        if self.send_time != now.format("%H:%M").to_string() {
            return false;
        }
        match &self.days_of_week {
            Some(days) => days.contains(&(now.weekday().num_days_from_sunday() as u8)),
            None => true,
        }
    }

    /// True when `last_sent_at` falls in the same local-time minute as `now`,
    /// meaning the item already fired for this slot.
    pub fn fired_this_minute(&self, now: &DateTime<Tz>) -> bool {
        let Some(last_ms) = self.last_sent_at_unix_ms else {
            return false;
        };
        let tz = now.timezone();
        match tz.timestamp_millis_opt(i64::try_from(last_ms).unwrap_or(i64::MAX)).single() {
            Some(last) => minute_key(&last) == minute_key(now),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub sent: usize,
    pub failed: usize,
    pub total: usize,
}

/// Time-driven fan-out of one message to every known subscriber.
///
/// Sequential on purpose: pacing between sends keeps the bot under the
/// platform's rate limits, and the job is low-frequency enough that
/// throughput does not matter. A single subscriber's failure never aborts
/// the loop; cancellation is checked between sends.
pub struct BroadcastScheduler {
    schedule: Schedule,
    tz: Tz,
    config: BroadcastConfig,
    http: reqwest::Client,
    sender: Arc<OutboundSender>,
    subscribers: Arc<dyn SubscriberStore>,
    fired_minutes: tokio::sync::Mutex<HashMap<String, String>>,
}

impl BroadcastScheduler {
    pub fn new(
        config: BroadcastConfig,
        sender: Arc<OutboundSender>,
        subscribers: Arc<dyn SubscriberStore>,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(&config.cron_expression).with_context(|| {
            format!("invalid broadcast cron expression '{}'", config.cron_expression)
        })?;
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|error| anyhow!("invalid broadcast timezone '{}': {error}", config.timezone))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create broadcast schedule client")?;
        Ok(Self {
            schedule,
            tz,
            config,
            http,
            sender,
            subscribers,
            fired_minutes: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Next trigger instant strictly after `from`, in the configured zone.
    pub fn next_due_after(&self, from: DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(&from).next()
    }

    /// Trigger loop. Sleeps until each cron occurrence, fires, and repeats
    /// until the shutdown channel flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        println!(
            "broadcast scheduler started: cron='{}' tz={}",
            self.config.cron_expression, self.config.timezone
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now().with_timezone(&self.tz);
            let Some(next) = self.next_due_after(now) else {
                eprintln!("broadcast cron has no future occurrence; scheduler stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match self.fire_once(&shutdown).await {
                        Ok(summary) => println!(
                            "broadcast complete: sent={} failed={} total={}",
                            summary.sent, summary.failed, summary.total
                        ),
                        Err(error) => eprintln!("broadcast firing failed: {error}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        println!("broadcast scheduler shutdown requested");
                        break;
                    }
                }
            }
        }
    }

    /// One full firing: pick the slot's message and fan it out.
    pub async fn fire_once(&self, shutdown: &watch::Receiver<bool>) -> Result<BroadcastSummary> {
        let now = Utc::now().with_timezone(&self.tz);
        let Some(message) = self.select_message(&now).await else {
            tracing::debug!("no broadcast message configured for this slot");
            return Ok(BroadcastSummary::default());
        };
        self.fan_out(&message, shutdown).await
    }

    /// Message precedence: external schedule slot, then hourly rotation,
    /// then the configured fallback string.
    pub async fn select_message(&self, now: &DateTime<Tz>) -> Option<String> {
        if let Some(url) = &self.config.schedule_url {
            match self.fetch_schedule(url).await {
                Ok(items) => {
                    if let Some(message) = self.match_schedule_item(&items, now).await {
                        return Some(message);
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "broadcast schedule fetch failed; using rotation/fallback");
                }
            }
        }
        if !self.config.rotation.is_empty() {
            let index = now.hour() as usize % self.config.rotation.len();
            return Some(self.config.rotation[index].clone());
        }
        self.config.fallback_message.clone()
    }

    /// Sends `message` to every subscriber with pacing, counting outcomes.
    pub async fn fan_out(
        &self,
        message: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BroadcastSummary> {
        let subscribers = self
            .subscribers
            .list()
            .await
            .context("failed to load subscriber list for broadcast")?;
        let mut summary = BroadcastSummary {
            total: subscribers.len(),
            ..BroadcastSummary::default()
        };

        for (index, user_id) in subscribers.iter().enumerate() {
            if *shutdown.borrow() {
                eprintln!(
                    "broadcast cancelled after {} of {} subscribers",
                    index, summary.total
                );
                break;
            }
            if index > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.pacing_ms)).await;
            }
            match self.sender.send(user_id, message).await {
                Ok(result) if result.is_success() => summary.sent += 1,
                Ok(result) => {
                    summary.failed += 1;
                    tracing::warn!(
                        user_id = %user_id,
                        error = result.error,
                        "broadcast send rejected; continuing"
                    );
                }
                Err(error) => {
                    summary.failed += 1;
                    tracing::warn!(%error, user_id = %user_id, "broadcast send failed; continuing");
                }
            }
        }
        Ok(summary)
    }

    async fn match_schedule_item(
        &self,
        items: &[ScheduledBroadcastItem],
        now: &DateTime<Tz>,
    ) -> Option<String> {
        let minute = minute_key(now);
        let mut fired = self.fired_minutes.lock().await;
        for item in items {
            if !item.matches_slot(now) || item.fired_this_minute(now) {
                continue;
            }
            let Some(message) = item
                .message
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty())
            else {
                continue;
            };
            if fired.get(&item.id) == Some(&minute) {
                continue;
            }
            fired.insert(item.id.clone(), minute);
            return Some(message.to_string());
        }
        None
    }

    async fn fetch_schedule(&self, url: &str) -> Result<Vec<ScheduledBroadcastItem>> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .context("broadcast schedule request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("broadcast schedule fetch failed with status {}", status.as_u16());
        }
        let raw = response
            .json::<Value>()
            .await
            .context("failed to decode broadcast schedule response")?;
        Ok(parse_schedule_items(&raw))
    }
}

/// Decodes the schedule endpoint's list, tolerating the backend's assorted
/// response envelopes (`items`, `data`, `result`, bare array, paged items).
pub(crate) fn parse_schedule_items(raw: &Value) -> Vec<ScheduledBroadcastItem> {
    shape_list(raw)
        .iter()
        .filter_map(schedule_item_from_value)
        .collect()
}

fn shape_list(raw: &Value) -> Vec<Value> {
    if let Some(list) = raw.as_array() {
        return list.clone();
    }
    for key in ["items", "data", "result"] {
        if let Some(list) = raw[key].as_array() {
            return list.clone();
        }
    }
    raw["pagedItems"]["items"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

fn schedule_item_from_value(value: &Value) -> Option<ScheduledBroadcastItem> {
    let id = first_string(value, &["id", "Id"])?;
    let send_time_raw = first_string(value, &["sendTime", "SendTime"])?;
    let send_time: String = send_time_raw.chars().take(5).collect();
    if send_time.len() < 5 {
        return None;
    }
    let days_of_week = value["daysOfWeek"].as_array().map(|days| {
        days.iter()
            .filter_map(Value::as_u64)
            .map(|day| day as u8)
            .collect::<Vec<_>>()
    });
    Some(ScheduledBroadcastItem {
        id,
        topic_id: first_string(value, &["topicId", "TopicId"]),
        message: first_string(value, &["message", "Message"]),
        send_time,
        days_of_week,
        last_sent_at_unix_ms: value["lastSentAt"].as_u64(),
    })
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match &value[*key] {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn minute_key<Z: TimeZone>(instant: &DateTime<Z>) -> String
where
    Z::Offset: std::fmt::Display,
{
    instant.format("%Y-%m-%d %H:%M").to_string()
}
