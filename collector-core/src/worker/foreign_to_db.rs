//! Sync Worker (Foreign→DB), spec.md §4.2.
//!
//! The foreign database is a different kind of RDBMS reached through the
//! blocking `mysql` client; every call into it is dispatched onto
//! [`crate::blocking::BlockingPool`] so the scheduling loop never blocks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mysql::prelude::Queryable;
use tracing::{error, info, warn};

use collector_config::{DatabaseEndpoint, ForeignJobConfig};

use crate::error::{CollectorError, Result};
use crate::pool::PoolSettings;
use crate::types::{ForeignRow, ForeignValue, Record};
use crate::worker::backoff::Backoff;
use crate::worker::{
    destination_key, epoch_sentinel, postgres_connection_string, read_watermark, run_sync_cycle,
    WorkerServices,
};

pub struct ForeignToDbWorker {
    name: String,
    job: ForeignJobConfig,
    destination: DatabaseEndpoint,
    services: WorkerServices,
    sync_interval: std::time::Duration,
    foreign_pool: Option<mysql::Pool>,
}

impl ForeignToDbWorker {
    pub fn new(
        job: ForeignJobConfig,
        destination: DatabaseEndpoint,
        services: WorkerServices,
        default_sync_interval_secs: u64,
    ) -> Self {
        let sync_interval = std::time::Duration::from_secs(
            job.sync_interval_secs.unwrap_or(default_sync_interval_secs),
        );
        Self {
            name: job.name.clone(),
            job,
            destination,
            services,
            sync_interval,
            foreign_pool: None,
        }
    }

    pub async fn run(mut self) {
        let mut backoff = Backoff::default();
        loop {
            if self.services.shutdown.is_shutdown() {
                return;
            }
            match self.cycle().await {
                Ok(()) => {
                    backoff.reset();
                    self.services.status.mark_healthy(&self.name, Utc::now());
                }
                Err(err) => {
                    error!(worker = %self.name, error = %err, "foreign sync cycle failed");
                    self.services.status.mark_unhealthy(&self.name, err.to_string());
                    self.foreign_pool = None; // discard and reconnect next cycle (spec.md §4.1 "Failure policy")
                    let delay = backoff.fail();
                    if self.services.shutdown.sleep_or_stop(delay).await {
                        return;
                    }
                    continue;
                }
            }

            if self.services.shutdown.sleep_or_stop(self.sync_interval).await {
                return;
            }
        }
    }

    async fn cycle(&mut self) -> Result<()> {
        let destination_pool = self
            .services
            .destination_pool
            .get_or_create(
                &destination_key(&self.destination),
                &postgres_connection_string(&self.destination),
                &PoolSettings::default(),
            )
            .await?;

        let watermark = read_watermark(
            &self.services.watermark,
            &destination_pool,
            &self.job.destination_table,
        )
        .await?;

        let foreign_pool = self.ensure_foreign_pool()?.clone();
        let source_table = self
            .job
            .foreign
            .table
            .clone()
            .ok_or_else(|| CollectorError::DataFormat("foreign job missing source table".into()))?;
        let object_filter_id = self.job.object_filter_id.clone();

        self.check_staleness(&source_table, &object_filter_id, watermark).await?;

        let blocking = Arc::clone(&self.services.blocking);
        let rows: Vec<ForeignRow> = blocking
            .spawn(move || fetch_foreign_delta(&foreign_pool, &source_table, watermark, &object_filter_id))
            .await?;

        let records: Vec<Record> = rows.iter().map(foreign_row_to_record).collect();
        let cycle = run_sync_cycle(
            &destination_pool,
            &self.services.watermark,
            &self.job.destination_table,
            watermark,
            records,
        )
        .await?;

        info!(
            worker = %self.name,
            inserted = cycle.outcome.inserted,
            rejected = cycle.outcome.rejected,
            watermark = %cycle.watermark,
            "foreign sync cycle complete"
        );
        Ok(())
    }

    fn ensure_foreign_pool(&mut self) -> Result<&mysql::Pool> {
        if self.foreign_pool.is_none() {
            let opts = foreign_connect_opts(&self.job.foreign)?;
            let pool = mysql::Pool::new(opts).map_err(CollectorError::from)?;
            self.foreign_pool = Some(pool);
        }
        Ok(self.foreign_pool.as_ref().expect("just initialized above"))
    }

    /// Identical outer shape to the DB-to-DB worker's own staleness check
    /// (spec.md §4.2 "Identical outer shape to §4.1"): compare the foreign
    /// source's own latest timestamp against `notification_timeout` and
    /// raise a rate-limited chat alert at most once per stale period.
    async fn check_staleness(
        &mut self,
        source_table: &str,
        object_filter_id: &str,
        watermark: DateTime<Utc>,
    ) -> Result<()> {
        let foreign_pool = self.ensure_foreign_pool()?.clone();
        let source_table = source_table.to_string();
        let object_filter_id = object_filter_id.to_string();
        let blocking = Arc::clone(&self.services.blocking);
        let latest: Option<DateTime<Utc>> = blocking
            .spawn(move || fetch_foreign_max_rectime(&foreign_pool, &source_table, &object_filter_id))
            .await?;
        let latest = latest.unwrap_or_else(epoch_sentinel);

        let threshold = self.services.notification_timeout;
        let now = Utc::now();
        if self
            .services
            .staleness
            .check(&self.job.destination_table, latest, now, threshold)
        {
            let text = format!(
                "[{}] no new data since {} (watermark {})",
                self.name, latest, watermark
            );
            if self.services.notification_gate.can_send(false) {
                if let Err(err) = self.services.chat.send(&text).await {
                    warn!(worker = %self.name, error = %err, "failed to deliver staleness alert");
                }
            }
        }
        Ok(())
    }
}

/// Runs on the blocking pool: reads the foreign table's own latest
/// `RECTIME` for the filtered object, independent of the destination's
/// watermark, so a stalled foreign source is detected even if this job has
/// never successfully synced (spec.md §4.2).
fn fetch_foreign_max_rectime(
    pool: &mysql::Pool,
    table: &str,
    object_filter_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let mut conn = pool.get_conn().map_err(CollectorError::from)?;
    let sql = format!("SELECT MAX(RECTIME) FROM {table} WHERE OBJID = :objid");
    let mut rows: Vec<mysql::Row> = conn
        .exec(&sql, mysql::params! { "objid" => object_filter_id })
        .map_err(CollectorError::from)?;
    let Some(mut row) = rows.pop() else {
        return Ok(None);
    };
    let value = row.take::<mysql::Value, usize>(0).unwrap_or(mysql::Value::NULL);
    Ok(match convert_value(value) {
        ForeignValue::Timestamp(ts) => Some(ts),
        _ => None,
    })
}

fn foreign_connect_opts(endpoint: &DatabaseEndpoint) -> Result<mysql::Opts> {
    let builder = mysql::OptsBuilder::new()
        .ip_or_hostname(Some(endpoint.host.clone()))
        .tcp_port(endpoint.port)
        .db_name(Some(endpoint.database.clone()))
        .user(Some(endpoint.user.clone()))
        .pass(Some(endpoint.password.clone()));
    Ok(mysql::Opts::from(builder))
}

/// Runs on the blocking pool: connects, fetches rows with
/// `timestamp > watermark` matching `object_filter_id`, and converts each
/// `mysql::Row` into a column-name-tagged [`ForeignRow`] without assuming
/// any particular column set (spec.md §4.2, §9 REDESIGN FLAG 4).
fn fetch_foreign_delta(
    pool: &mysql::Pool,
    table: &str,
    watermark: DateTime<Utc>,
    object_filter_id: &str,
) -> Result<Vec<ForeignRow>> {
    let mut conn = pool.get_conn().map_err(CollectorError::from)?;
    let sql = format!(
        "SELECT * FROM {table} WHERE RECTIME > :watermark AND OBJID = :objid ORDER BY RECTIME ASC"
    );
    let rows: Vec<mysql::Row> = conn
        .exec(
            &sql,
            mysql::params! {
                "watermark" => watermark.naive_utc(),
                "objid" => object_filter_id,
            },
        )
        .map_err(CollectorError::from)?;

    Ok(rows.into_iter().map(convert_row).collect())
}

fn convert_row(mut row: mysql::Row) -> ForeignRow {
    let names: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().into_owned())
        .collect();
    let mut out = Vec::with_capacity(names.len());
    for (idx, name) in names.into_iter().enumerate() {
        let value = row
            .take::<mysql::Value, usize>(idx)
            .map(convert_value)
            .unwrap_or(ForeignValue::Null);
        out.push((name, value));
    }
    out
}

fn convert_value(value: mysql::Value) -> ForeignValue {
    use mysql::Value;
    match value {
        Value::NULL => ForeignValue::Null,
        Value::Bytes(bytes) => ForeignValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(i) => ForeignValue::Int(i),
        Value::UInt(u) => ForeignValue::Int(u as i64),
        Value::Float(f) => ForeignValue::Float(f as f64),
        Value::Double(d) => ForeignValue::Float(d),
        Value::Date(year, month, day, hour, min, sec, micro) => {
            let naive = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                .and_then(|d| d.and_hms_micro_opt(hour as u32, min as u32, sec as u32, micro));
            match naive {
                Some(naive) => ForeignValue::Timestamp(DateTime::from_naive_utc_and_offset(naive, Utc)),
                None => ForeignValue::Null,
            }
        }
        Value::Time(..) => ForeignValue::Null,
    }
}

/// Maps a foreign row to the destination's fixed shape (spec.md §4.2:
/// "the foreign `OBJID` field is mapped to the destination's `ObjectId`;
/// any other absent fields default to empty").
fn foreign_row_to_record(row: &ForeignRow) -> Record {
    let lookup = |name: &str| row.iter().find(|(col, _)| col.eq_ignore_ascii_case(name)).map(|(_, v)| v);

    let objid = lookup("OBJID").and_then(ForeignValue::as_string).unwrap_or_default();
    let timestamp = lookup("RECTIME")
        .and_then(|v| match v {
            ForeignValue::Timestamp(ts) => Some(*ts),
            _ => None,
        })
        .unwrap_or_else(crate::worker::epoch_sentinel);

    Record {
        object_id: objid.clone(),
        id: lookup("ID").and_then(ForeignValue::as_string).unwrap_or_default(),
        objid,
        timestamp,
        t1: lookup("T1").and_then(ForeignValue::as_f64),
        t2: lookup("T2").and_then(ForeignValue::as_f64),
        t3: lookup("T3").and_then(ForeignValue::as_f64),
        t4: lookup("T4").and_then(ForeignValue::as_f64),
        t5: lookup("T5").and_then(ForeignValue::as_f64),
        t6: lookup("T6").and_then(ForeignValue::as_f64),
        t7: lookup("T7").and_then(ForeignValue::as_f64),
        t8: lookup("T8").and_then(ForeignValue::as_f64),
        v1: lookup("V1").and_then(ForeignValue::as_f64),
        v2: lookup("V2").and_then(ForeignValue::as_f64),
        v3: lookup("V3").and_then(ForeignValue::as_f64),
        v4: lookup("V4").and_then(ForeignValue::as_f64),
        v5: lookup("V5").and_then(ForeignValue::as_f64),
        p1: lookup("P1").and_then(ForeignValue::as_f64),
        p2: lookup("P2").and_then(ForeignValue::as_f64),
        p3: lookup("P3").and_then(ForeignValue::as_f64),
        p4: lookup("P4").and_then(ForeignValue::as_f64),
        h1: lookup("H1").and_then(ForeignValue::as_f64),
        h2: lookup("H2").and_then(ForeignValue::as_f64),
        h3: lookup("H3").and_then(ForeignValue::as_f64),
        h4: lookup("H4").and_then(ForeignValue::as_f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_row_maps_objid_into_object_id() {
        let row: ForeignRow = vec![
            ("OBJID".to_string(), ForeignValue::Text("sensor-7".to_string())),
            ("RECTIME".to_string(), ForeignValue::Timestamp(Utc::now())),
            ("T1".to_string(), ForeignValue::Text("12,5".to_string())),
        ];
        let record = foreign_row_to_record(&row);
        assert_eq!(record.object_id, "sensor-7");
        assert_eq!(record.objid, "sensor-7");
        assert_eq!(record.t1, Some(12.5));
        assert_eq!(record.t2, None);
    }

    #[test]
    fn missing_rectime_falls_back_to_epoch_sentinel() {
        let row: ForeignRow = vec![("OBJID".to_string(), ForeignValue::Text("x".to_string()))];
        let record = foreign_row_to_record(&row);
        assert_eq!(record.timestamp, crate::worker::epoch_sentinel());
    }
}
