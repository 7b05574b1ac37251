use crate::models::Candle;
use crate::Result;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};

/// Candle as stored in Redis (instrument lives in the key)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCandle {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    synthetic: bool,
}

impl StoredCandle {
    fn into_candle(self, instrument: &str) -> Candle {
        Candle {
            instrument: instrument.to_string(),
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            synthetic: self.synthetic,
        }
    }
}

impl From<&Candle> for StoredCandle {
    fn from(candle: &Candle) -> Self {
        Self {
            timestamp: candle.timestamp,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            synthetic: candle.synthetic,
        }
    }
}

fn candle_key(instrument: &str) -> String {
    format!("candles:{}", instrument)
}

/// Redis archive of finalized candles, used to warm indicators after a restart
///
/// Uses sorted sets with the interval start as score
#[derive(Clone)]
pub struct CandleArchive {
    conn: ConnectionManager,
}

impl CandleArchive {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis candle archive at {}", redis_url);

        Ok(Self { conn })
    }

    /// Store one finalized candle, replacing any earlier copy of the same interval
    pub async fn save_candle(&self, candle: &Candle) -> Result<()> {
        let key = candle_key(&candle.instrument);
        let value = serde_json::to_string(&StoredCandle::from(candle))?;
        let score = candle.timestamp.timestamp() as f64;

        let mut conn = self.conn.clone();
        conn.zrembyscore::<_, _, _, ()>(&key, score, score).await?;
        conn.zadd::<_, _, _, ()>(&key, value, score).await?;

        Ok(())
    }

    /// Candles with an interval start at or after `since`, oldest first
    pub async fn load_since(&self, instrument: &str, since: DateTime<Utc>) -> Result<Vec<Candle>> {
        let key = candle_key(instrument);
        let min_score = since.timestamp() as f64;

        let mut conn = self.conn.clone();
        let results: Vec<String> = conn.zrangebyscore(&key, min_score, "+inf").await?;

        let candles = results
            .iter()
            .map(|json| serde_json::from_str::<StoredCandle>(json).map(|c| c.into_candle(instrument)))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        tracing::info!("Loaded {} archived candles for {} from Redis", candles.len(), instrument);

        Ok(candles)
    }

    /// Remove candles older than `keep_hours`
    pub async fn cleanup_old(&self, instrument: &str, keep_hours: u64) -> Result<usize> {
        let key = candle_key(instrument);
        let cutoff = Utc::now() - chrono::Duration::hours(keep_hours as i64);
        let max_score = cutoff.timestamp() as f64;

        let mut conn = self.conn.clone();
        let removed: usize = conn.zrembyscore(&key, "-inf", max_score).await?;

        if removed > 0 {
            tracing::debug!("Cleaned up {} archived candles for {}", removed, instrument);
        }

        Ok(removed)
    }

    pub async fn count_candles(&self, instrument: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(candle_key(instrument)).await?;
        Ok(count)
    }
}
