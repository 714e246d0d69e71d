//! SQLite-backed store implementations for the CLI.
//!
//! The core only sees trait objects; everything SQLite lives here. Queries
//! are defensive about schema drift — historical tables accumulate columns
//! and type affinities over years, so values are read generically and rows
//! that cannot be interpreted are skipped rather than failing the run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use tracing::debug;

use signal_bench::cooldown::CooldownStore;
use signal_bench::error::{BacktestError, Result};
use signal_bench::models::{Bar, SignalRecord};
use signal_bench::rules::IndicatorRow;
use signal_bench::store::{CandleStore, IndicatorStore, RunContext, SignalStore};
use signal_bench::time::{floor_minute, format_utc, normalize_timeframe, parse_timestamp};

fn open_connection(path: &Path) -> Result<Connection> {
    Connection::open(path)
        .map_err(|err| BacktestError::store_fatal("sqlite.open", format!("{}: {err}", path.display())))
}

fn sql_err(op: &str, err: rusqlite::Error) -> BacktestError {
    BacktestError::store_fatal(op, err.to_string())
}

fn value_to_string(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Integer(v) => v.to_string(),
        SqlValue::Real(v) => v.to_string(),
        SqlValue::Text(v) => v.clone(),
        SqlValue::Blob(_) => String::new(),
    }
}

fn value_to_json(value: SqlValue) -> serde_json::Value {
    match value {
        SqlValue::Null | SqlValue::Blob(_) => serde_json::Value::Null,
        SqlValue::Integer(v) => serde_json::Value::from(v),
        SqlValue::Real(v) => {
            serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        SqlValue::Text(v) => serde_json::Value::String(v),
    }
}

fn value_to_f64(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::Integer(v) => Some(*v as f64),
        SqlValue::Real(v) => Some(*v),
        SqlValue::Text(v) => v.trim().parse().ok(),
        _ => None,
    }
}

/// Databases are provisioned by other services; a missing table reads as
/// empty coverage rather than failing the precheck outright.
fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )
    .map_err(|err| sql_err("table_exists", err))
}

// ── Signal history ───────────────────────────────────────────────────────────

/// `signal_history` table reader.
pub struct SqliteSignalStore {
    conn: Mutex<Connection>,
}

impl SqliteSignalStore {
    /// Open the history database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
        })
    }
}

#[async_trait]
impl SignalStore for SqliteSignalStore {
    async fn load_signals(
        &self,
        ctx: &RunContext,
        _symbols: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _timeframe: &str,
    ) -> Result<Vec<SignalRecord>> {
        ctx.check("load_signals")?;
        let conn = self.conn.lock().expect("signal store poisoned");
        if !table_exists(&conn, "signal_history")? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, symbol, direction, strength, signal_type, \
                        timeframe, source, price \
                 FROM signal_history \
                 WHERE timestamp >= ?1 AND timestamp <= ?2 \
                 ORDER BY timestamp ASC, id ASC",
            )
            .map_err(|err| sql_err("load_signals", err))?;

        let rows = stmt
            .query_map([format_utc(start), format_utc(end)], |row| {
                Ok(SignalRecord {
                    id: row.get::<_, i64>(0)?,
                    timestamp: value_to_string(&row.get::<_, SqlValue>(1)?),
                    symbol: value_to_string(&row.get::<_, SqlValue>(2)?),
                    direction: value_to_string(&row.get::<_, SqlValue>(3)?),
                    strength: value_to_string(&row.get::<_, SqlValue>(4)?),
                    signal_type: value_to_string(&row.get::<_, SqlValue>(5)?),
                    timeframe: value_to_string(&row.get::<_, SqlValue>(6)?),
                    source: value_to_string(&row.get::<_, SqlValue>(7)?),
                    price: value_to_f64(&row.get::<_, SqlValue>(8)?),
                })
            })
            .map_err(|err| sql_err("load_signals", err))?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record.map_err(|err| sql_err("load_signals", err))?);
        }
        debug!(rows = records.len(), "loaded signal_history rows");
        Ok(records)
    }
}

// ── Candles ──────────────────────────────────────────────────────────────────

/// `candles_1m` table reader.
pub struct SqliteCandleStore {
    conn: Mutex<Connection>,
}

impl SqliteCandleStore {
    /// Open the market-data database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
        })
    }
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn load_bars(
        &self,
        ctx: &RunContext,
        symbols: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _timeframe: &str,
    ) -> Result<HashMap<String, Vec<Bar>>> {
        ctx.check("load_bars")?;
        let mut out: HashMap<String, Vec<Bar>> =
            symbols.iter().map(|s| (s.clone(), Vec::new())).collect();
        if symbols.is_empty() {
            return Ok(out);
        }

        let conn = self.conn.lock().expect("candle store poisoned");
        if !table_exists(&conn, "candles_1m")? {
            return Ok(out);
        }
        let placeholders = vec!["?"; symbols.len()].join(",");
        let query = format!(
            "SELECT symbol, ts, open, high, low, close, COALESCE(volume, 0) \
             FROM candles_1m \
             WHERE upper(symbol) IN ({placeholders}) AND ts >= ? AND ts <= ? \
             ORDER BY symbol ASC, ts ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&query).map_err(|err| sql_err("load_bars", err))?;

        let mut params: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        params.push(format_utc(start));
        params.push(format_utc(end));

        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                Ok((
                    value_to_string(&row.get::<_, SqlValue>(0)?),
                    value_to_string(&row.get::<_, SqlValue>(1)?),
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            })
            .map_err(|err| sql_err("load_bars", err))?;

        let mut total = 0usize;
        for row in rows {
            let (symbol, ts_text, open, high, low, close, volume) =
                row.map_err(|err| sql_err("load_bars", err))?;
            let symbol = symbol.trim().to_uppercase();
            let Some(ts) = parse_timestamp(&ts_text) else {
                continue;
            };
            let Some(bars) = out.get_mut(&symbol) else {
                continue;
            };
            let bar = Bar {
                symbol: symbol.clone(),
                ts,
                open,
                high,
                low,
                close,
                volume,
            };
            // Duplicate minute rows keep the newest write.
            if bars.last().is_some_and(|prev| prev.ts == ts) {
                *bars.last_mut().expect("non-empty") = bar;
            } else {
                bars.push(bar);
            }
            total += 1;
        }
        debug!(rows = total, "loaded candle rows");
        Ok(out)
    }
}

// ── Indicator tables ─────────────────────────────────────────────────────────

/// Reader over arbitrary indicator tables in the market database.
///
/// Tables are only required to carry a symbol column and a timestamp column
/// (`ts` or `timestamp`); a `timeframe` column is used when present. Rows
/// are re-sorted in process so non-standard tables still replay
/// deterministically.
pub struct SqliteIndicatorStore {
    conn: Mutex<Connection>,
    preferred_timeframe: String,
}

impl SqliteIndicatorStore {
    /// Open the indicator database at `path`.
    pub fn open(path: &Path, preferred_timeframe: &str) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
            preferred_timeframe: preferred_timeframe.to_string(),
        })
    }
}

#[async_trait]
impl IndicatorStore for SqliteIndicatorStore {
    async fn load_rows(
        &self,
        ctx: &RunContext,
        table: &str,
        symbols: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IndicatorRow>> {
        ctx.check("load_rows")?;
        if table.contains('"') {
            return Err(BacktestError::store_fatal(
                "load_rows",
                format!("invalid table name: {table}"),
            ));
        }
        let conn = self.conn.lock().expect("indicator store poisoned");
        if !table_exists(&conn, table)? {
            return Ok(Vec::new());
        }

        let query = format!("SELECT rowid, * FROM \"{table}\"");
        let mut stmt = conn.prepare(&query).map_err(|err| sql_err("load_rows", err))?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|name| name.to_string()).collect();

        let symbol_set: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        let mut rows_out: Vec<IndicatorRow> = Vec::new();

        let mut raw_rows = stmt.query([]).map_err(|err| sql_err("load_rows", err))?;
        while let Some(row) = raw_rows.next().map_err(|err| sql_err("load_rows", err))? {
            let mut fields = indexmap::IndexMap::new();
            let mut rowid = 0i64;
            for (idx, name) in column_names.iter().enumerate() {
                let value: SqlValue = row
                    .get(idx)
                    .map_err(|err| sql_err("load_rows", err))?;
                if name == "rowid" && idx == 0 {
                    if let SqlValue::Integer(v) = value {
                        rowid = v;
                    }
                    continue;
                }
                fields.insert(name.clone(), value_to_json(value));
            }

            let symbol = fields
                .get("symbol")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_uppercase();
            if symbol.is_empty() || !symbol_set.contains(&symbol) {
                continue;
            }

            let ts_text = fields
                .get("ts")
                .or_else(|| fields.get("timestamp"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let Some(ts) = parse_timestamp(&ts_text) else {
                continue;
            };
            let ts = floor_minute(ts);
            if ts < start || ts > end {
                continue;
            }

            let timeframe = fields
                .get("timeframe")
                .and_then(|v| v.as_str())
                .map(|raw| normalize_timeframe(raw, &self.preferred_timeframe))
                .unwrap_or_default();

            rows_out.push(IndicatorRow::new(symbol, timeframe, ts, rowid, fields));
        }

        rows_out.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then_with(|| a.timeframe.cmp(&b.timeframe))
                .then_with(|| a.ts.cmp(&b.ts))
                .then_with(|| a.rowid.cmp(&b.rowid))
        });
        debug!(table, rows = rows_out.len(), "loaded indicator rows");
        Ok(rows_out)
    }

    async fn tables(&self, ctx: &RunContext) -> Result<Vec<String>> {
        ctx.check("tables")?;
        let conn = self.conn.lock().expect("indicator store poisoned");
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .map_err(|err| sql_err("tables", err))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| sql_err("tables", err))?;
        let mut names = Vec::new();
        for name in rows {
            names.push(name.map_err(|err| sql_err("tables", err))?);
        }
        Ok(names)
    }
}

// ── Cooldown ─────────────────────────────────────────────────────────────────

/// Durable cooldown store in a dedicated SQLite file.
pub struct SqliteCooldownStore {
    conn: Mutex<Connection>,
}

impl SqliteCooldownStore {
    /// Open (creating schema if needed) at `path`.
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_connection(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cooldown_state (\
                key TEXT PRIMARY KEY, \
                last_fire_ts INTEGER NOT NULL)",
            [],
        )
        .map_err(|err| sql_err("cooldown.init", err))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CooldownStore for SqliteCooldownStore {
    fn get(&self, key: &str) -> i64 {
        let conn = self.conn.lock().expect("cooldown store poisoned");
        conn.query_row(
            "SELECT last_fire_ts FROM cooldown_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .unwrap_or(0)
    }

    fn set(&self, key: &str, ts: i64) -> Result<()> {
        let conn = self.conn.lock().expect("cooldown store poisoned");
        conn.execute(
            "INSERT INTO cooldown_state (key, last_fire_ts) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET last_fire_ts = excluded.last_fire_ts",
            rusqlite::params![key, ts],
        )
        .map_err(|err| sql_err("cooldown.set", err))?;
        Ok(())
    }

    fn load_all(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().expect("cooldown store poisoned");
        let mut stmt = conn
            .prepare("SELECT key, last_fire_ts FROM cooldown_state")
            .map_err(|err| sql_err("cooldown.load_all", err))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|err| sql_err("cooldown.load_all", err))?;
        let mut out = HashMap::new();
        for row in rows {
            let (key, ts) = row.map_err(|err| sql_err("cooldown.load_all", err))?;
            out.insert(key, ts);
        }
        Ok(out)
    }
}
