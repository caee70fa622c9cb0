//! SQLite backend on sqlx.
//!
//! Every call that touches more than one statement runs inside a single
//! transaction; on failure the transaction is rolled back and a rollback
//! failure is reported together with the original error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};

use super::{group_workstations, Database, MachineRecord};
use crate::error::{DbError, Result};
use crate::types::{
    average_samples, AttachFileRequest, AttachedFile, FileEntry, GpuInfo, GpuStatSample, GpuView,
    MachineLastSeen, ModifyMachineRequest, NewMachineRequest, RemoveFileRequest,
    RemoveMachineRequest, WorkstationGroup, DEFAULT_GROUP,
};

const SCHEMA_VERSION: i64 = 1;

// Every statement is safe to re-run against an initialised store.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
    r#"CREATE TABLE IF NOT EXISTS machines (
        hostname    TEXT PRIMARY KEY,
        group_name  TEXT NOT NULL,
        cpu         TEXT,
        motherboard TEXT,
        notes       TEXT,
        owner       TEXT,
        last_seen   INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS gpus (
        uuid           TEXT PRIMARY KEY,
        machine        TEXT NOT NULL REFERENCES machines(hostname) ON DELETE CASCADE,
        name           TEXT NOT NULL,
        brand          TEXT NOT NULL,
        driver_version TEXT NOT NULL,
        memory_total   INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stats (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        gpu                TEXT NOT NULL REFERENCES gpus(uuid) ON DELETE CASCADE,
        received           INTEGER NOT NULL,
        memory_util        REAL NOT NULL,
        gpu_util           REAL NOT NULL,
        memory_used        INTEGER NOT NULL,
        fan_speed          REAL NOT NULL,
        gpu_temp           REAL NOT NULL,
        memory_temp        REAL NOT NULL,
        graphics_voltage   REAL NOT NULL,
        power_draw         REAL NOT NULL,
        graphics_clock     INTEGER NOT NULL,
        max_graphics_clock INTEGER NOT NULL,
        memory_clock       INTEGER NOT NULL,
        max_memory_clock   INTEGER NOT NULL,
        processes          TEXT NOT NULL DEFAULT '[]'
    )"#,
    "CREATE INDEX IF NOT EXISTS stats_gpu_received ON stats (gpu, received)",
    r#"CREATE TABLE IF NOT EXISTS files (
        hostname TEXT NOT NULL REFERENCES machines(hostname) ON DELETE CASCADE,
        filename TEXT NOT NULL,
        mime     TEXT NOT NULL,
        payload  BLOB NOT NULL,
        PRIMARY KEY (hostname, filename)
    )"#,
];

const SAMPLE_COLUMNS: &str = "gpu, received, memory_util, gpu_util, memory_used, fan_speed, \
     gpu_temp, memory_temp, graphics_voltage, power_draw, graphics_clock, max_graphics_clock, \
     memory_clock, max_memory_clock, processes";

pub struct SqliteDatabase {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl SqliteDatabase {
    /// Open (or create) a database file and make sure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(options, Some(path)).await
    }

    /// Private in-memory database (tests, `:memory:` config).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect(options, None).await
    }

    async fn connect(options: SqliteConnectOptions, path: Option<PathBuf>) -> Result<Self> {
        // One connection: SQLite has a single writer, and an in-memory
        // database lives only as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool, path };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = create_schema(&mut tx).await;
        finish(tx, result).await
    }
}

async fn create_schema(conn: &mut SqliteConnection) -> Result<()> {
    for stmt in SCHEMA {
        sqlx::query(*stmt).execute(&mut *conn).await?;
    }
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Commit on success; otherwise roll back and join a rollback failure with the cause.
async fn finish<T>(tx: Transaction<'static, Sqlite>, result: Result<T>) -> Result<T> {
    match result {
        Ok(v) => {
            tx.commit().await?;
            Ok(v)
        }
        Err(cause) => Err(join_rollback(cause, tx.rollback().await)),
    }
}

fn join_rollback(cause: DbError, rollback: std::result::Result<(), sqlx::Error>) -> DbError {
    match rollback {
        Ok(()) => cause,
        Err(rollback) => DbError::Transaction {
            source: Box::new(cause),
            rollback,
        },
    }
}

fn corrupt(table: &'static str, reason: impl ToString) -> DbError {
    DbError::Corrupt {
        table,
        reason: reason.to_string(),
    }
}

fn time_from_micros(us: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us).ok_or_else(|| corrupt("stats", format!("timestamp {us}")))
}

fn time_from_secs(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| corrupt("machines", format!("last_seen {secs}")))
}

fn sample_from_row(row: &SqliteRow) -> Result<GpuStatSample> {
    let received: i64 = row.try_get("received")?;
    let processes: String = row.try_get("processes")?;
    Ok(GpuStatSample {
        uuid: row.try_get("gpu")?,
        memory_util: row.try_get("memory_util")?,
        gpu_util: row.try_get("gpu_util")?,
        memory_used: row.try_get("memory_used")?,
        fan_speed: row.try_get("fan_speed")?,
        gpu_temp: row.try_get("gpu_temp")?,
        memory_temp: row.try_get("memory_temp")?,
        graphics_voltage: row.try_get("graphics_voltage")?,
        power_draw: row.try_get("power_draw")?,
        graphics_clock: row.try_get("graphics_clock")?,
        max_graphics_clock: row.try_get("max_graphics_clock")?,
        memory_clock: row.try_get("memory_clock")?,
        max_memory_clock: row.try_get("max_memory_clock")?,
        time: time_from_micros(received)?,
        processes: serde_json::from_str(&processes).map_err(|e| corrupt("stats", e))?,
    })
}

fn machine_from_row(row: &SqliteRow) -> Result<(String, MachineRecord)> {
    let last_seen: Option<i64> = row.try_get("last_seen")?;
    Ok((
        row.try_get("hostname")?,
        MachineRecord {
            group: row.try_get("group_name")?,
            cpu: row.try_get("cpu")?,
            motherboard: row.try_get("motherboard")?,
            notes: row.try_get("notes")?,
            owner: row.try_get("owner")?,
            last_seen: last_seen.map(time_from_secs).transpose()?,
        },
    ))
}

async fn insert_sample(conn: &mut SqliteConnection, s: &GpuStatSample) -> Result<()> {
    let processes = serde_json::to_string(&s.processes).map_err(|e| corrupt("stats", e))?;
    let sql = format!(
        "INSERT INTO stats ({SAMPLE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(&s.uuid)
        .bind(s.time.timestamp_micros())
        .bind(s.memory_util)
        .bind(s.gpu_util)
        .bind(s.memory_used)
        .bind(s.fan_speed)
        .bind(s.gpu_temp)
        .bind(s.memory_temp)
        .bind(s.graphics_voltage)
        .bind(s.power_draw)
        .bind(s.graphics_clock)
        .bind(s.max_graphics_clock)
        .bind(s.memory_clock)
        .bind(s.max_memory_clock)
        .bind(processes)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn machine_exists(conn: &mut SqliteConnection, hostname: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM machines WHERE hostname = ?")
        .bind(hostname)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

async fn upsert_gpu(conn: &mut SqliteConnection, hostname: &str, info: &GpuInfo) -> Result<()> {
    if !machine_exists(conn, hostname).await? {
        return Err(DbError::no_such_machine(hostname));
    }
    sqlx::query(
        r#"
        INSERT INTO gpus (uuid, machine, name, brand, driver_version, memory_total)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (uuid) DO UPDATE SET
            machine = excluded.machine,
            name = excluded.name,
            brand = excluded.brand,
            driver_version = excluded.driver_version,
            memory_total = excluded.memory_total
        "#,
    )
    .bind(&info.uuid)
    .bind(hostname)
    .bind(&info.gpu_name)
    .bind(&info.gpu_brand)
    .bind(&info.driver_ver)
    .bind(info.memory_total)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn append_checked(conn: &mut SqliteConnection, sample: &GpuStatSample) -> Result<()> {
    let owner = sqlx::query(
        "SELECT m.hostname, m.last_seen FROM gpus g \
         JOIN machines m ON m.hostname = g.machine WHERE g.uuid = ?",
    )
    .bind(&sample.uuid)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(owner) = owner else {
        return Err(DbError::gpu_not_present(&sample.uuid));
    };
    let last_seen: Option<i64> = owner.try_get("last_seen")?;
    if last_seen.is_none() {
        let hostname: String = owner.try_get("hostname")?;
        return Err(DbError::no_such_machine(hostname));
    }
    insert_sample(conn, sample).await
}

async fn read_latest(conn: &mut SqliteConnection) -> Result<Vec<WorkstationGroup>> {
    let machines = sqlx::query(
        "SELECT hostname, group_name, cpu, motherboard, notes, owner, last_seen FROM machines",
    )
    .fetch_all(&mut *conn)
    .await?;

    let sql = format!(
        "SELECT g.uuid, g.machine, g.name, g.brand, g.driver_version, g.memory_total, {cols} \
         FROM gpus g JOIN stats s ON s.id = ( \
             SELECT id FROM stats WHERE gpu = g.uuid ORDER BY received DESC, id DESC LIMIT 1)",
        cols = SAMPLE_COLUMNS
            .split(", ")
            .map(|c| format!("s.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let gpu_rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

    let mut views: HashMap<String, Vec<GpuView>> = HashMap::new();
    for row in &gpu_rows {
        let info = GpuInfo {
            uuid: row.try_get("uuid")?,
            gpu_name: row.try_get("name")?,
            gpu_brand: row.try_get("brand")?,
            driver_ver: row.try_get("driver_version")?,
            memory_total: row.try_get("memory_total")?,
        };
        let sample = sample_from_row(row)?;
        let machine: String = row.try_get("machine")?;
        views
            .entry(machine)
            .or_default()
            .push(GpuView::new(&info, &sample));
    }

    let mut out = Vec::with_capacity(machines.len());
    for row in &machines {
        let (hostname, record) = machine_from_row(row)?;
        let gpus = views.remove(&hostname).unwrap_or_default();
        out.push((hostname, record, gpus));
    }
    Ok(group_workstations(out, Utc::now()))
}

async fn delete_machine(conn: &mut SqliteConnection, hostname: &str) -> Result<()> {
    sqlx::query("DELETE FROM stats WHERE gpu IN (SELECT uuid FROM gpus WHERE machine = ?)")
        .bind(hostname)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM gpus WHERE machine = ?")
        .bind(hostname)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM files WHERE hostname = ?")
        .bind(hostname)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM machines WHERE hostname = ?")
        .bind(hostname)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn store_file(conn: &mut SqliteConnection, file: &AttachFileRequest) -> Result<()> {
    if !machine_exists(conn, &file.hostname).await? {
        return Err(DbError::no_such_machine(&file.hostname));
    }
    sqlx::query(
        r#"
        INSERT INTO files (hostname, filename, mime, payload) VALUES (?, ?, ?, ?)
        ON CONFLICT (hostname, filename) DO UPDATE SET
            mime = excluded.mime,
            payload = excluded.payload
        "#,
    )
    .bind(&file.hostname)
    .bind(&file.filename)
    .bind(&file.mime)
    .bind(&file.payload)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_file_list(conn: &mut SqliteConnection, hostname: &str) -> Result<Vec<FileEntry>> {
    if !machine_exists(conn, hostname).await? {
        return Err(DbError::no_such_machine(hostname));
    }
    let rows = sqlx::query("SELECT filename, mime FROM files WHERE hostname = ? ORDER BY filename")
        .bind(hostname)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| -> Result<FileEntry> {
            Ok(FileEntry {
                filename: row.try_get("filename")?,
                mime: row.try_get("mime")?,
            })
        })
        .collect()
}

async fn merge_old_samples(conn: &mut SqliteConnection, cutoff: i64) -> Result<()> {
    let gpus: Vec<String> = sqlx::query_scalar(
        "SELECT gpu FROM stats WHERE received < ? GROUP BY gpu HAVING COUNT(*) >= 2",
    )
    .bind(cutoff)
    .fetch_all(&mut *conn)
    .await?;

    let select = format!(
        "SELECT {SAMPLE_COLUMNS} FROM stats WHERE gpu = ? AND received < ? ORDER BY received, id"
    );
    for uuid in gpus {
        let rows = sqlx::query(&select)
            .bind(&uuid)
            .bind(cutoff)
            .fetch_all(&mut *conn)
            .await?;
        let old = rows.iter().map(sample_from_row).collect::<Result<Vec<_>>>()?;
        let Some(merged) = average_samples(&old) else {
            continue;
        };
        sqlx::query("DELETE FROM stats WHERE gpu = ? AND received < ?")
            .bind(&uuid)
            .bind(cutoff)
            .execute(&mut *conn)
            .await?;
        insert_sample(conn, &merged).await?;
    }
    Ok(())
}

async fn drop_tables(conn: &mut SqliteConnection) -> Result<()> {
    for table in ["stats", "files", "gpus", "machines", "schema_version"] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn remove_if_exists(path: PathBuf) -> Result<()> {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn update_last_seen(&self, hostname: &str, timestamp: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO machines (hostname, group_name, last_seen) VALUES (?, ?, ?)
            ON CONFLICT (hostname) DO UPDATE SET last_seen = excluded.last_seen
            "#,
        )
        .bind(hostname)
        .bind(DEFAULT_GROUP)
        .bind(timestamp.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_gpu_context(&self, hostname: &str, info: &GpuInfo) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = upsert_gpu(&mut tx, hostname, info).await;
        finish(tx, result).await
    }

    async fn append_data_point(&self, sample: &GpuStatSample) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = append_checked(&mut tx, sample).await;
        finish(tx, result).await
    }

    async fn latest_data(&self) -> Result<Vec<WorkstationGroup>> {
        let mut tx = self.pool.begin().await?;
        let result = read_latest(&mut tx).await;
        finish(tx, result).await
    }

    async fn last_seen(&self) -> Result<Vec<MachineLastSeen>> {
        let rows = sqlx::query(
            "SELECT hostname, last_seen FROM machines WHERE last_seen IS NOT NULL ORDER BY hostname",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<MachineLastSeen> {
                Ok(MachineLastSeen {
                    hostname: row.try_get("hostname")?,
                    last_seen: time_from_secs(row.try_get("last_seen")?)?,
                })
            })
            .collect()
    }

    async fn new_machine(&self, req: &NewMachineRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO machines (hostname, group_name) VALUES (?, ?)
            ON CONFLICT (hostname) DO UPDATE SET group_name = COALESCE(?, group_name)
            "#,
        )
        .bind(&req.hostname)
        .bind(req.group.as_deref().unwrap_or(DEFAULT_GROUP))
        .bind(&req.group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_machine(&self, req: &ModifyMachineRequest) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE machines SET
                cpu = COALESCE(?, cpu),
                motherboard = COALESCE(?, motherboard),
                notes = COALESCE(?, notes),
                group_name = COALESCE(?, group_name),
                owner = COALESCE(?, owner)
            WHERE hostname = ?
            "#,
        )
        .bind(&req.cpu)
        .bind(&req.motherboard)
        .bind(&req.notes)
        .bind(&req.group)
        .bind(&req.owner)
        .bind(&req.hostname)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_machine(&self, req: &RemoveMachineRequest) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = delete_machine(&mut tx, &req.hostname).await;
        finish(tx, result).await
    }

    async fn attach_file(&self, file: &AttachFileRequest) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = store_file(&mut tx, file).await;
        finish(tx, result).await
    }

    async fn get_file(&self, hostname: &str, filename: &str) -> Result<AttachedFile> {
        let row = sqlx::query("SELECT mime, payload FROM files WHERE hostname = ? AND filename = ?")
            .bind(hostname)
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::file_not_present(hostname, filename))?;
        Ok(AttachedFile {
            hostname: hostname.to_string(),
            filename: filename.to_string(),
            mime: row.try_get("mime")?,
            payload: row.try_get("payload")?,
        })
    }

    async fn list_files(&self, hostname: &str) -> Result<Vec<FileEntry>> {
        let mut tx = self.pool.begin().await?;
        let result = read_file_list(&mut tx, hostname).await;
        finish(tx, result).await
    }

    async fn remove_file(&self, req: &RemoveFileRequest) -> Result<()> {
        let done = sqlx::query("DELETE FROM files WHERE hostname = ? AND filename = ?")
            .bind(&req.hostname)
            .bind(&req.filename)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(DbError::file_not_present(&req.hostname, &req.filename));
        }
        Ok(())
    }

    async fn downsample(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = merge_old_samples(&mut tx, cutoff.timestamp_micros()).await;
        finish(tx, result).await
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query("DELETE FROM stats WHERE received < ?")
            .bind(cutoff.timestamp_micros())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn destroy(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = drop_tables(&mut tx).await;
        finish(tx, result).await?;
        self.pool.close().await;
        if let Some(path) = &self.path {
            for suffix in ["", "-wal", "-shm"] {
                let mut name = path.clone().into_os_string();
                name.push(suffix);
                remove_if_exists(PathBuf::from(name)).await?;
            }
        }
        Ok(())
    }
}
