use chrono::NaiveDateTime;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a video.
///
/// `Processing` until the enrichment job finishes, then `Ready` when both
/// derived fields were written or `Degraded` when at least one is missing.
/// Both terminal states are playable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Processing,
    Ready,
    Degraded,
}

impl VideoStatus {
    pub const READY_CLASS: [VideoStatus; 2] = [VideoStatus::Ready, VideoStatus::Degraded];

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Processing => "processing",
            VideoStatus::Ready => "ready",
            VideoStatus::Degraded => "degraded",
        }
    }

    pub fn is_ready(&self) -> bool {
        Self::READY_CLASS.contains(self)
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown video status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for VideoStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(VideoStatus::Processing),
            "ready" => Ok(VideoStatus::Ready),
            "degraded" => Ok(VideoStatus::Degraded),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl ToSql<Text, Pg> for VideoStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for VideoStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(raw.parse()?)
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Selectable, Clone, PartialEq)]
#[diesel(table_name = crate::db::schema::videos)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Video {
    pub id: Uuid,
    pub title: String,
    pub storage_key: String,
    pub status: VideoStatus,
    pub duration_seconds: Option<i32>,
    pub thumbnail_key: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// What intake knows about a video before it is inserted.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub id: Uuid,
    pub title: String,
    pub storage_key: String,
}
