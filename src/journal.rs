//! Trade journal for live trading
//!
//! SQLite-backed audit trail of closed trades, DCA fills and exits, plus a
//! snapshot of every open position. On restart the live trader reloads the
//! open positions and each symbol's DCA window from here, so the 24h DCA cap
//! and the trailing state survive a process restart.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::execution::FillResult;
use crate::position::DcaWindow;
use crate::state_machine::OpenPosition;
use crate::{ExitReason, Symbol, Trade};

#[derive(Clone)]
pub struct Journal {
    conn: Arc<Mutex<Connection>>,
}

impl Journal {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let journal = Self::from_connection(conn)?;
        info!("Trade journal opened at {}", db_path.display());
        Ok(journal)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let journal = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        journal.create_tables()?;
        Ok(journal)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("journal connection lock poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                quantity REAL NOT NULL,
                dca_count INTEGER NOT NULL,
                cost_basis REAL NOT NULL,
                gross_proceeds REAL NOT NULL,
                fees REAL NOT NULL,
                pnl REAL NOT NULL,
                pnl_pct REAL NOT NULL,
                holding_hours REAL NOT NULL,
                exit_reason TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS dca_fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                filled_at TEXT NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                fee REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS exits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                exited_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS open_positions (
                symbol TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
            CREATE INDEX IF NOT EXISTS idx_dca_fills_symbol ON dca_fills(symbol, filled_at);
            CREATE INDEX IF NOT EXISTS idx_exits_symbol ON exits(symbol, exited_at);",
        )?;

        debug!("Journal schema created/verified");
        Ok(())
    }

    pub fn record_trade(&self, trade: &Trade) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trades
             (symbol, entry_time, exit_time, entry_price, exit_price, quantity,
              dca_count, cost_basis, gross_proceeds, fees, pnl, pnl_pct,
              holding_hours, exit_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                trade.symbol.as_str(),
                trade.entry_time.to_rfc3339(),
                trade.exit_time.to_rfc3339(),
                trade.entry_price,
                trade.exit_price,
                trade.quantity,
                trade.dca_count as i64,
                trade.cost_basis,
                trade.gross_proceeds,
                trade.fees,
                trade.pnl,
                trade.pnl_pct,
                trade.holding_hours,
                exit_reason_str(trade.exit_reason),
            ],
        )?;

        let result = if trade.is_win() { "WIN" } else { "LOSS" };
        info!(
            "Trade recorded: {} {:.8} @ {:.6} -> {:.6} | P&L {:.2} ({:+.2}%) | {} DCA | {}",
            trade.symbol,
            trade.quantity,
            trade.entry_price,
            trade.exit_price,
            trade.pnl,
            trade.pnl_pct,
            trade.dca_count,
            result
        );
        Ok(())
    }

    pub fn record_dca_fill(&self, symbol: &Symbol, at: DateTime<Utc>, fill: &FillResult) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO dca_fills (symbol, filled_at, price, quantity, fee)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![symbol.as_str(), at.to_rfc3339(), fill.price, fill.quantity, fill.fee],
        )?;
        Ok(())
    }

    pub fn record_exit(&self, symbol: &Symbol, at: DateTime<Utc>) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO exits (symbol, exited_at) VALUES (?1, ?2)",
            params![symbol.as_str(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Snapshot an open position, replacing any earlier snapshot
    pub fn save_position(&self, symbol: &Symbol, open: &OpenPosition) -> Result<()> {
        let state = serde_json::to_string(open)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO open_positions (symbol, state, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)",
            params![symbol.as_str(), state],
        )?;
        Ok(())
    }

    pub fn clear_position(&self, symbol: &Symbol) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM open_positions WHERE symbol = ?1",
            params![symbol.as_str()],
        )?;
        Ok(())
    }

    pub fn load_position(&self, symbol: &Symbol) -> Result<Option<OpenPosition>> {
        let conn = self.conn()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM open_positions WHERE symbol = ?1",
                params![symbol.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        state
            .map(|s| {
                serde_json::from_str(&s)
                    .with_context(|| format!("Corrupt position snapshot for {}", symbol))
            })
            .transpose()
    }

    /// Rebuild a symbol's DCA window as of `now`: fills after the last exit
    /// that are less than 24h old
    pub fn load_dca_window(&self, symbol: &Symbol, now: DateTime<Utc>) -> Result<DcaWindow> {
        let conn = self.conn()?;

        let last_exit: Option<String> = conn.query_row(
            "SELECT MAX(exited_at) FROM exits WHERE symbol = ?1",
            params![symbol.as_str()],
            |row| row.get(0),
        )?;
        let last_exit = last_exit.as_deref().map(parse_ts).transpose()?;

        let since = now - Duration::hours(DcaWindow::SPAN_HOURS);
        let mut stmt = conn.prepare(
            "SELECT filled_at FROM dca_fills WHERE symbol = ?1 ORDER BY filled_at",
        )?;
        let fills = stmt
            .query_map(params![symbol.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .iter()
            .map(|s| parse_ts(s))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|&t| t > since && last_exit.map_or(true, |exit| t > exit))
            .collect();

        Ok(DcaWindow::from_parts(fills, last_exit))
    }

    /// Closed trades, oldest first, optionally for one symbol
    pub fn load_trades(&self, symbol: Option<&Symbol>) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, entry_time, exit_time, entry_price, exit_price, quantity,
                    dca_count, cost_basis, gross_proceeds, fees, pnl, pnl_pct,
                    holding_hours, exit_reason
             FROM trades
             WHERE ?1 IS NULL OR symbol = ?1
             ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![symbol.map(|s| s.as_str())], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    [
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, f64>(5)?,
                    ],
                    row.get::<_, i64>(6)?,
                    [
                        row.get::<_, f64>(7)?,
                        row.get::<_, f64>(8)?,
                        row.get::<_, f64>(9)?,
                        row.get::<_, f64>(10)?,
                        row.get::<_, f64>(11)?,
                        row.get::<_, f64>(12)?,
                    ],
                    row.get::<_, String>(13)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(sym, entry, exit, [entry_price, exit_price, quantity], dca, m, reason)| {
                let [cost_basis, gross_proceeds, fees, pnl, pnl_pct, holding_hours] = m;
                Ok(Trade {
                    symbol: Symbol::new(sym),
                    entry_time: parse_ts(&entry)?,
                    exit_time: parse_ts(&exit)?,
                    entry_price,
                    exit_price,
                    quantity,
                    dca_count: dca.max(0) as usize,
                    cost_basis,
                    gross_proceeds,
                    fees,
                    pnl,
                    pnl_pct,
                    holding_hours,
                    exit_reason: parse_exit_reason(&reason)?,
                })
            })
            .collect()
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in journal: {}", s))
}

fn exit_reason_str(reason: ExitReason) -> &'static str {
    match reason {
        ExitReason::TrailingStop => "trailing_stop",
        ExitReason::EndOfData => "end_of_data",
    }
}

fn parse_exit_reason(s: &str) -> Result<ExitReason> {
    match s {
        "trailing_stop" => Ok(ExitReason::TrailingStop),
        "end_of_data" => Ok(ExitReason::EndOfData),
        other => Err(anyhow!("Unknown exit reason in journal: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{Position, TrailingExit};
    use chrono::TimeZone;

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn fill() -> FillResult {
        FillResult {
            price: 100.0,
            quantity: 1.0,
            fee: 0.1,
        }
    }

    fn trade(symbol: &str) -> Trade {
        Trade {
            symbol: Symbol::new(symbol),
            entry_time: t(0),
            exit_time: t(5),
            entry_price: 100.0,
            exit_price: 105.0,
            quantity: 1.0,
            dca_count: 1,
            cost_basis: 100.0,
            gross_proceeds: 105.0,
            fees: 0.2,
            pnl: 4.9,
            pnl_pct: 4.9,
            holding_hours: 5.0,
            exit_reason: ExitReason::TrailingStop,
        }
    }

    #[test]
    fn test_trades_roundtrip_and_filter() {
        let journal = Journal::open_in_memory().unwrap();
        journal.record_trade(&trade("BTC")).unwrap();
        journal.record_trade(&trade("ETH")).unwrap();

        assert_eq!(journal.load_trades(None).unwrap().len(), 2);
        let btc = journal.load_trades(Some(&Symbol::new("BTC"))).unwrap();
        assert_eq!(btc, vec![trade("BTC")]);
    }

    #[test]
    fn test_dca_window_reload_respects_exit_and_age() {
        let journal = Journal::open_in_memory().unwrap();
        let btc = Symbol::new("BTC");

        journal.record_dca_fill(&btc, t(0), &fill()).unwrap();
        journal.record_exit(&btc, t(1)).unwrap();
        journal.record_dca_fill(&btc, t(2), &fill()).unwrap();
        journal.record_dca_fill(&btc, t(20), &fill()).unwrap();
        journal.record_dca_fill(&Symbol::new("ETH"), t(21), &fill()).unwrap();

        let window = journal.load_dca_window(&btc, t(22)).unwrap();
        assert_eq!(window.last_exit(), Some(t(1)));
        assert_eq!(window.fills(), &[t(2), t(20)]);
        assert_eq!(window.count_recent(t(22)), 2);

        // t(2) has aged out 24h later
        let window = journal.load_dca_window(&btc, t(26)).unwrap();
        assert_eq!(window.fills(), &[t(20)]);
    }

    #[test]
    fn test_position_snapshot_lifecycle() {
        let journal = Journal::open_in_memory().unwrap();
        let btc = Symbol::new("BTC");
        assert!(journal.load_position(&btc).unwrap().is_none());

        let mut position = Position::default();
        position.add(100.0, 0.5, 0.04, t(0));
        let open = OpenPosition {
            position,
            trailing: TrailingExit::new(105.0),
        };
        journal.save_position(&btc, &open).unwrap();
        assert_eq!(journal.load_position(&btc).unwrap(), Some(open));

        journal.clear_position(&btc).unwrap();
        assert!(journal.load_position(&btc).unwrap().is_none());
    }

    #[test]
    fn test_file_backed_journal_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("journal.db");
        {
            let journal = Journal::open(&path).unwrap();
            journal.record_trade(&trade("BTC")).unwrap();
        }
        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.load_trades(None).unwrap().len(), 1);
    }
}
