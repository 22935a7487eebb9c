//! Structured JSON-lines logging.
//!
//! Every record goes to stdout. With `LOG_DIR` set, records are also
//! appended under `LOG_DIR/<run_id>/`: debug and trace to `trace.jsonl`,
//! everything else to `events.jsonl`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

// =============================================================================
// Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "trace" => Level::Trace,
            "debug" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }

    /// `LOG_LEVEL`, read once.
    pub fn threshold() -> Self {
        static THRESHOLD: OnceLock<Level> = OnceLock::new();
        *THRESHOLD.get_or_init(|| {
            std::env::var("LOG_LEVEL").map(|v| Level::parse(&v)).unwrap_or(Level::Info)
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

// =============================================================================
// Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Market,   // Ticker, candles
    Strategy, // Signal evaluation, seed/flip decisions
    Risk,     // Budget and quantity guards
    Exec,     // Order submission and cancellation
    Fill,     // Position transitions
    System,   // Startup, retries, cycle errors
    Audit,    // Reconciliation against the venue
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Strategy => "strategy",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Fill => "fill",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        static DOMAINS: OnceLock<Option<Vec<String>>> = OnceLock::new();
        let filter = DOMAINS.get_or_init(|| match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => None,
            Ok(list) => Some(list.split(',').map(|d| d.trim().to_string()).collect()),
        });
        match filter {
            None => true,
            Some(list) => list.iter().any(|d| d == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_append(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to open {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let Ok(base) = std::env::var("LOG_DIR") else {
            return RunContext { run_id, events: None, trace: None };
        };
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext { run_id, events: None, trace: None };
        }
        RunContext {
            events: open_append(run_dir.join("events.jsonl")),
            trace: open_append(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["api_key", "api_secret", "signature", "X-BAPI-API-KEY", "X-BAPI-SIGN"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["symbol", "order_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Emit
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::threshold() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn build_record(
    run_id: &str,
    level: Level,
    component: &str,
    event: &str,
    fields: Map<String, Value>,
) -> Value {
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(run_id));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));
    Value::Object(entry)
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let line = build_record(&ctx.run_id, level, component, event, fields).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

// =============================================================================
// Event helpers
// =============================================================================

pub fn log_signal(symbol: &str, long: bool, short: bool, fresh_long: bool, fresh_short: bool) {
    log(
        Level::Debug,
        Domain::Strategy,
        "signal",
        obj(&[
            ("symbol", v_str(symbol)),
            ("long", json!(long)),
            ("short", json!(short)),
            ("fresh_long", json!(fresh_long)),
            ("fresh_short", json!(fresh_short)),
        ]),
    );
}

pub fn log_risk_check(check: &str, result: &str, value: f64, threshold: f64) {
    log(
        Level::Debug,
        Domain::Risk,
        "guard",
        obj(&[
            ("check", v_str(check)),
            ("result", v_str(result)),
            ("value", v_num(value)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

pub fn log_order_submit(
    link_id: &str,
    symbol: &str,
    order_type: &str,
    side: &str,
    qty: f64,
    price: f64,
    reduce_only: bool,
) {
    log(
        Level::Info,
        Domain::Exec,
        "order_submit",
        obj(&[
            ("link_id", v_str(link_id)),
            ("symbol", v_str(symbol)),
            ("order_type", v_str(order_type)),
            ("side", v_str(side)),
            ("qty", v_num(qty)),
            ("price", v_num(price)),
            ("reduce_only", json!(reduce_only)),
        ]),
    );
}

pub fn log_transition(
    transition: &str,
    direction: &str,
    qty: f64,
    avg_price: Option<f64>,
    level: i32,
    price: f64,
) {
    log(
        Level::Info,
        Domain::Fill,
        "transition",
        obj(&[
            ("transition", v_str(transition)),
            ("direction", v_str(direction)),
            ("qty", v_num(qty)),
            ("avg_price", avg_price.map(v_num).unwrap_or(Value::Null)),
            ("level", json!(level)),
            ("price", v_num(price)),
        ]),
    );
}

pub fn log_reconcile(symbol: &str, local_qty: f64, venue_qty: f64, status: &str) {
    let level = match status {
        "external_close" => Level::Info,
        "untracked" => Level::Warn,
        _ => Level::Debug,
    };
    log(
        level,
        Domain::Audit,
        "reconcile",
        obj(&[
            ("symbol", v_str(symbol)),
            ("local_qty", v_num(local_qty)),
            ("venue_qty", v_num(venue_qty)),
            ("status", v_str(status)),
        ]),
    );
}

pub fn log_retry(operation: &str, attempt: u32, max_retries: u32, err: &anyhow::Error, delay: Duration) {
    log(
        Level::Warn,
        Domain::System,
        "retry",
        obj(&[
            ("operation", v_str(operation)),
            ("attempt", json!(attempt)),
            ("max_retries", json!(max_retries)),
            ("error", v_str(&format!("{:#}", err))),
            ("delay_ms", json!(delay.as_millis() as u64)),
        ]),
    );
}

pub fn log_warn(domain: Domain, event: &str, msg: &str, err: &anyhow::Error) {
    log(
        Level::Warn,
        domain,
        event,
        obj(&[("msg", v_str(msg)), ("error", v_str(&format!("{:#}", err)))]),
    );
}

pub fn log_cycle_error(cycle: u64, err: &anyhow::Error) {
    log(
        Level::Error,
        Domain::System,
        "cycle_aborted",
        obj(&[("cycle", json!(cycle)), ("error", v_str(&format!("{:#}", err)))]),
    );
}

// =============================================================================
// Field builders
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn test_level_parse_accepts_warning_alias() {
        assert_eq!(Level::parse("WARNING"), Level::Warn);
        assert_eq!(Level::parse("INFO"), Level::Info);
        assert_eq!(Level::parse("bogus"), Level::Info);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_record_redacts_and_lifts() {
        let rec = build_record(
            "run-1",
            Level::Info,
            "exec",
            "order_submit",
            obj(&[("symbol", v_str("ADAUSDT")), ("api_key", v_str("secret")), ("qty", v_num(5.0))]),
        );
        assert_eq!(rec["symbol"], "ADAUSDT");
        assert_eq!(rec["data"]["api_key"], "[REDACTED]");
        assert_eq!(rec["data"]["qty"], 5.0);
        assert_eq!(rec["lvl"], "INFO");
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
