//! Device Registrations
//! Push endpoints of installed clients, keyed by endpoint token

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::engine::database::{Database, DatabaseError};
use crate::engine::metadata::{format_ts, parse_ts};

/// Fan-out cap for a single dispatch
pub const MAX_ENDPOINTS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Android,
    Ios,
    Desktop,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Desktop => "desktop",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "desktop" => Ok(Platform::Desktop),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub endpoint_token: String,
    /// `None` keeps the stored platform; new rows default to android
    pub platform: Option<Platform>,
    pub app_version: Option<String>,
    pub device_id: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DeviceStore {
    db: Database,
}

impl DeviceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or merge. Absent optional fields keep what is already stored.
    pub fn upsert(&self, registration: &DeviceRegistration) -> Result<(), DatabaseError> {
        let conn = self.db.get_connection()?;
        let seen = format_ts(&registration.last_seen_at);
        conn.execute(
            "INSERT INTO devices (endpoint_token, platform, app_version, device_id, first_seen_at, last_seen_at)
             VALUES (?1, COALESCE(?2, ?6), ?3, ?4, ?5, ?5)
             ON CONFLICT(endpoint_token) DO UPDATE SET
                platform = COALESCE(?2, devices.platform),
                app_version = COALESCE(excluded.app_version, devices.app_version),
                device_id = COALESCE(excluded.device_id, devices.device_id),
                last_seen_at = excluded.last_seen_at",
            params![
                registration.endpoint_token,
                registration.platform.map(|p| p.as_str()),
                registration.app_version,
                registration.device_id,
                seen,
                Platform::default().as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, endpoint_token: &str) -> Result<Option<DeviceRegistration>, DatabaseError> {
        Ok(self
            .query(
                "SELECT endpoint_token, platform, app_version, device_id, last_seen_at
                 FROM devices WHERE endpoint_token = ?1",
                params![endpoint_token],
            )?
            .into_iter()
            .next())
    }

    /// Most recently seen first, capped at `limit`
    pub fn list(&self, limit: usize) -> Result<Vec<DeviceRegistration>, DatabaseError> {
        self.query(
            "SELECT endpoint_token, platform, app_version, device_id, last_seen_at
             FROM devices ORDER BY last_seen_at DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    pub fn delete(&self, endpoint_token: &str) -> Result<bool, DatabaseError> {
        let conn = self.db.get_connection()?;
        let removed = conn.execute(
            "DELETE FROM devices WHERE endpoint_token = ?1",
            params![endpoint_token],
        )?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> Result<usize, DatabaseError> {
        let conn = self.db.get_connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DeviceRegistration>, DatabaseError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(endpoint_token, platform, app_version, device_id, last_seen)| {
                let platform = platform.parse().map_err(|reason| DatabaseError::CorruptRow {
                    table: "devices",
                    reason,
                })?;
                Ok(DeviceRegistration {
                    endpoint_token,
                    platform: Some(platform),
                    app_version,
                    device_id,
                    last_seen_at: parse_ts(&last_seen)?,
                })
            })
            .collect()
    }
}
