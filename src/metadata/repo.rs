//! Typed access to the metadata tables.
//!
//! Everything here goes through the `MetadataStore` trait, so both backends
//! share one mapping between rows and records.

use super::error::{MetadataError, MetadataResult};
use super::schema::{FieldValue, Filter, Row, Table};
use super::MetadataStore;
use crate::models::{gc_log::GcLogEntry, image::ImageRecord, statistic::DailyStatistic};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct MetadataRepo {
    store: Arc<dyn MetadataStore>,
}

impl MetadataRepo {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub async fn insert_image(&self, record: &ImageRecord) -> MetadataResult<()> {
        self.store
            .insert(Table::ImageInfo, image_values(record)?)
            .await
    }

    /// At most one record exists per guid; more than one row is corruption.
    pub async fn find_image(&self, guid: &str) -> MetadataResult<Option<ImageRecord>> {
        let rows = self
            .store
            .select(Table::ImageInfo, &Filter::all().eq("guid", guid))
            .await?;
        match rows.as_slice() {
            [] => Ok(None),
            [row] => image_from_row(row).map(Some),
            _ => Err(MetadataError::Decode {
                column: "guid".into(),
                reason: format!("{} rows for guid `{guid}`", rows.len()),
            }),
        }
    }

    /// Atomic `download_count + 1`. Returns 0 when the record is gone.
    pub async fn increment_download_count(&self, guid: &str) -> MetadataResult<u64> {
        self.store
            .increment(
                Table::ImageInfo,
                &[("download_count", 1)],
                &Filter::all().eq("guid", guid),
            )
            .await
    }

    pub async fn delete_image(&self, guid: &str) -> MetadataResult<u64> {
        self.store
            .delete(Table::ImageInfo, &Filter::all().eq("guid", guid))
            .await
    }

    /// Records uploaded strictly before `cutoff`, oldest guid order, at most
    /// `limit` of them.
    pub async fn expired_images(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> MetadataResult<Vec<ImageRecord>> {
        self.store
            .select_older_than(Table::ImageInfo, "upload_time", cutoff, limit)
            .await?
            .iter()
            .map(image_from_row)
            .collect()
    }

    pub async fn append_gc_log(
        &self,
        collection_time: DateTime<Utc>,
        garbage_count: i64,
    ) -> MetadataResult<()> {
        self.store
            .insert(
                Table::GcLog,
                vec![
                    FieldValue::Time(truncate_micros(collection_time)),
                    FieldValue::Int(garbage_count),
                ],
            )
            .await
    }

    /// The most recently inserted GC entry (greatest id).
    pub async fn last_gc_log(&self) -> MetadataResult<Option<GcLogEntry>> {
        let Some(row) = self.store.select_last(Table::GcLog, &Filter::all()).await? else {
            return Ok(None);
        };
        Ok(Some(GcLogEntry {
            id: row.int("id")?,
            collection_time: row.time("collection_time")?,
            garbage_count: row.int("garbage_count")?,
        }))
    }

    pub async fn record_upload(&self, date: &str, size: u64) -> MetadataResult<()> {
        self.bump_statistic(date, [("upload_count", 1), ("upload_size_byte", to_i64(size)?)])
            .await
    }

    pub async fn record_download(&self, date: &str, size: u64) -> MetadataResult<()> {
        self.bump_statistic(
            date,
            [("download_count", 1), ("download_size_byte", to_i64(size)?)],
        )
        .await
    }

    pub async fn daily_statistic(&self, date: &str) -> MetadataResult<Option<DailyStatistic>> {
        let rows = self
            .store
            .select(Table::ImageStatistics, &Filter::all().eq("date", date))
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(Some(DailyStatistic {
            date: row.text("date")?,
            upload_count: row.unsigned("upload_count")?,
            download_count: row.unsigned("download_count")?,
            upload_size_byte: row.unsigned("upload_size_byte")?,
            download_size_byte: row.unsigned("download_size_byte")?,
        }))
    }

    /// Increment the day's row, creating it on the first event of the day.
    /// A concurrent creator makes our insert fail with `AlreadyExists`, in
    /// which case the row now exists and the increment is retried once.
    async fn bump_statistic(&self, date: &str, deltas: [(&str, i64); 2]) -> MetadataResult<()> {
        let filter = Filter::all().eq("date", date);
        if self
            .store
            .increment(Table::ImageStatistics, &deltas, &filter)
            .await?
            > 0
        {
            return Ok(());
        }

        let values = Table::ImageStatistics
            .insert_columns()
            .iter()
            .map(|column| {
                if column.name == "date" {
                    FieldValue::from(date)
                } else {
                    let delta = deltas
                        .iter()
                        .find(|(name, _)| *name == column.name)
                        .map_or(0, |(_, delta)| *delta);
                    FieldValue::Int(delta)
                }
            })
            .collect();

        match self.store.insert(Table::ImageStatistics, values).await {
            Ok(()) => Ok(()),
            Err(MetadataError::AlreadyExists(_)) => {
                self.store
                    .increment(Table::ImageStatistics, &deltas, &filter)
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Both backends keep microseconds; trimming up front makes stored and
/// in-memory timestamps compare equal.
pub fn truncate_micros(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(time.timestamp_micros()).unwrap_or(time)
}

fn to_i64(value: u64) -> MetadataResult<i64> {
    i64::try_from(value).map_err(|_| MetadataError::InvalidRow {
        table: Table::ImageInfo.name(),
        reason: format!("value {value} exceeds i64"),
    })
}

fn image_values(record: &ImageRecord) -> MetadataResult<Vec<FieldValue>> {
    Ok(vec![
        FieldValue::from(record.guid.as_str()),
        FieldValue::Int(i64::from(record.year)),
        FieldValue::Int(i64::from(record.month)),
        FieldValue::Int(to_i64(record.file_size_byte)?),
        FieldValue::from(record.file_storage_format.as_str()),
        FieldValue::Time(truncate_micros(record.upload_time)),
        FieldValue::from(record.app_code.as_str()),
        FieldValue::from(record.md5.as_str()),
        FieldValue::Int(to_i64(record.download_count)?),
    ])
}

fn image_from_row(row: &Row) -> MetadataResult<ImageRecord> {
    let year = row.int("year")?;
    let month = row.int("month")?;
    Ok(ImageRecord {
        guid: row.text("guid")?,
        year: i32::try_from(year).map_err(|_| MetadataError::Decode {
            column: "year".into(),
            reason: format!("{year} out of range"),
        })?,
        month: u32::try_from(month).map_err(|_| MetadataError::Decode {
            column: "month".into(),
            reason: format!("{month} out of range"),
        })?,
        file_size_byte: row.unsigned("file_size_byte")?,
        file_storage_format: row.text("file_storage_format")?,
        upload_time: row.time("upload_time")?,
        app_code: row.text("app_code")?,
        md5: row.text("md5")?,
        download_count: row.unsigned("download_count")?,
    })
}
