//! Read-only queries over the modelled fact tables (`fct_messages`,
//! `fct_image_detections`).

use std::cmp::Reverse;
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbPool;

pub const DEFAULT_TOP_PRODUCTS_LIMIT: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopProduct {
    pub detected_object_class: String,
    pub mention_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChannelActivity {
    pub message_date: NaiveDate,
    pub message_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageSearchResult {
    pub message_id: i64,
    pub channel_name: String,
    pub message_text: Option<String>,
    pub message_timestamp: Option<DateTime<Utc>>,
}

/// One `fct_messages` row.
#[derive(Debug, Clone, PartialEq)]
pub struct FactMessage {
    pub message_id: i64,
    pub channel_name: String,
    pub message_text: Option<String>,
    pub message_timestamp: Option<DateTime<Utc>>,
}

impl FactMessage {
    pub fn message_date_key(&self) -> Option<NaiveDate> {
        self.message_timestamp.map(|timestamp| timestamp.date_naive())
    }
}

/// One `fct_image_detections` row.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionFact {
    pub message_id: i64,
    pub channel_name: String,
    pub detected_object_class: String,
    pub confidence_score: f64,
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Limit must be positive")]
    InvalidLimit,

    #[error("Query parameter is required")]
    EmptyQuery,

    #[error("Channel not found or no activity")]
    ChannelNotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopProductsLimit(i64);

impl TopProductsLimit {
    pub fn new(limit: Option<i64>) -> Result<Self, AnalyticsError> {
        match limit.unwrap_or(DEFAULT_TOP_PRODUCTS_LIMIT) {
            limit if limit < 1 => Err(AnalyticsError::InvalidLimit),
            limit => Ok(Self(limit)),
        }
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

/// A search term with surrounding whitespace removed. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery(String);

impl SearchQuery {
    pub fn new(query: Option<&str>) -> Result<Self, AnalyticsError> {
        match query.map(str::trim) {
            Some(query) if !query.is_empty() => Ok(Self(query.to_string())),
            _ => Err(AnalyticsError::EmptyQuery),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `%term%` with LIKE metacharacters escaped by `\`.
    pub fn like_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.0.len() + 2);
        pattern.push('%');
        for ch in self.0.chars() {
            if matches!(ch, '\\' | '%' | '_') {
                pattern.push('\\');
            }
            pattern.push(ch);
        }
        pattern.push('%');
        pattern
    }
}

#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn top_products(&self, limit: TopProductsLimit) -> anyhow::Result<Vec<TopProduct>>;

    async fn channel_activity(&self, channel_name: &str) -> anyhow::Result<Vec<ChannelActivity>>;

    async fn search_messages(&self, query: &SearchQuery)
        -> anyhow::Result<Vec<MessageSearchResult>>;
}

/// Most detected object classes, highest count first and ties by class name.
pub async fn top_products(
    store: &dyn AnalyticsStore,
    limit: Option<i64>,
) -> Result<Vec<TopProduct>, AnalyticsError> {
    let limit = TopProductsLimit::new(limit)?;
    Ok(store.top_products(limit).await?)
}

/// Daily message counts for one channel, oldest day first.
pub async fn channel_activity(
    store: &dyn AnalyticsStore,
    channel_name: &str,
) -> Result<Vec<ChannelActivity>, AnalyticsError> {
    let activity = store.channel_activity(channel_name).await?;
    if activity.is_empty() {
        return Err(AnalyticsError::ChannelNotFound(channel_name.to_string()));
    }
    Ok(activity)
}

/// Case-insensitive substring search, newest message first.
pub async fn search_messages(
    store: &dyn AnalyticsStore,
    query: Option<&str>,
) -> Result<Vec<MessageSearchResult>, AnalyticsError> {
    let query = SearchQuery::new(query)?;
    Ok(store.search_messages(&query).await?)
}

#[derive(Debug, Clone)]
pub struct PgAnalytics {
    pool: DbPool,
}

impl PgAnalytics {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalyticsStore for PgAnalytics {
    async fn top_products(&self, limit: TopProductsLimit) -> anyhow::Result<Vec<TopProduct>> {
        let rows = sqlx::query_as::<_, TopProduct>(
            r#"
                SELECT detected_object_class, COUNT(*) AS mention_count
                FROM fct_image_detections
                GROUP BY detected_object_class
                ORDER BY mention_count DESC, detected_object_class ASC
                LIMIT $1
            "#,
        )
        .bind(limit.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn channel_activity(&self, channel_name: &str) -> anyhow::Result<Vec<ChannelActivity>> {
        let rows = sqlx::query_as::<_, ChannelActivity>(
            r#"
                SELECT message_date_key::date AS message_date, COUNT(*) AS message_count
                FROM fct_messages
                WHERE channel_name = $1
                  AND message_date_key IS NOT NULL
                GROUP BY message_date_key::date
                ORDER BY message_date ASC
            "#,
        )
        .bind(channel_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn search_messages(
        &self,
        query: &SearchQuery,
    ) -> anyhow::Result<Vec<MessageSearchResult>> {
        let rows = sqlx::query_as::<_, MessageSearchResult>(
            r#"
                SELECT message_id::bigint AS message_id,
                       channel_name,
                       message_text,
                       message_timestamp::timestamptz AS message_timestamp
                FROM fct_messages
                WHERE message_text ILIKE $1 ESCAPE '\'
                ORDER BY message_timestamp DESC NULLS LAST, channel_name ASC, message_id ASC
            "#,
        )
        .bind(query.like_pattern())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// In-memory fact tables with the same query semantics as [`PgAnalytics`].
#[derive(Debug, Clone, Default)]
pub struct MemoryAnalytics {
    pub messages: Vec<FactMessage>,
    pub detections: Vec<DetectionFact>,
}

#[async_trait]
impl AnalyticsStore for MemoryAnalytics {
    async fn top_products(&self, limit: TopProductsLimit) -> anyhow::Result<Vec<TopProduct>> {
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for detection in &self.detections {
            *counts.entry(&detection.detected_object_class).or_default() += 1;
        }
        let mut products: Vec<TopProduct> = counts
            .into_iter()
            .map(|(class, count)| TopProduct {
                detected_object_class: class.to_string(),
                mention_count: count,
            })
            .collect();
        // Stable sort keeps the BTreeMap's name order within equal counts.
        products.sort_by_key(|product| Reverse(product.mention_count));
        products.truncate(usize::try_from(limit.get()).unwrap_or(usize::MAX));
        Ok(products)
    }

    async fn channel_activity(&self, channel_name: &str) -> anyhow::Result<Vec<ChannelActivity>> {
        let mut counts: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for message in self
            .messages
            .iter()
            .filter(|message| message.channel_name == channel_name)
        {
            if let Some(date) = message.message_date_key() {
                *counts.entry(date).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(message_date, message_count)| ChannelActivity {
                message_date,
                message_count,
            })
            .collect())
    }

    async fn search_messages(
        &self,
        query: &SearchQuery,
    ) -> anyhow::Result<Vec<MessageSearchResult>> {
        let needle = query.as_str().to_lowercase();
        let mut results: Vec<MessageSearchResult> = self
            .messages
            .iter()
            .filter(|message| {
                message
                    .message_text
                    .as_deref()
                    .is_some_and(|text| text.to_lowercase().contains(&needle))
            })
            .map(|message| MessageSearchResult {
                message_id: message.message_id,
                channel_name: message.channel_name.clone(),
                message_text: message.message_text.clone(),
                message_timestamp: message.message_timestamp,
            })
            .collect();
        results.sort_by(|a, b| {
            // Timestamp descending with missing timestamps last.
            b.message_timestamp
                .is_some()
                .cmp(&a.message_timestamp.is_some())
                .then_with(|| b.message_timestamp.cmp(&a.message_timestamp))
                .then_with(|| a.channel_name.cmp(&b.channel_name))
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(results)
    }
}
