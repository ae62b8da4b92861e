//! InfluxDB sink.
//!
//! Converts stats to line-protocol points tagged by cluster and node and
//! writes them over the v1 HTTP API. Nested values flatten into one point
//! per leaf: mapping members join the measurement name with `_`, string
//! members and integer members whose key ends in `id` become tags instead
//! of points, sequence members flatten by index. Points are buffered and
//! written in batches; a failed write is logged and dropped, never fatal.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use statpoll_core::processor::{ProcessorError, StreamingProcessor};
use statpoll_core::stats::{Stat, StatValue};
use tracing::{debug, error, info};

/// Points buffered before a write is issued.
const MAX_POINTS_PER_WRITE: usize = 100;

/// Joins a stat key with sub-keys of nested values.
const SUB_KEY_SEPARATOR: &str = "_";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct State {
    http: Option<reqwest::blocking::Client>,
    base_url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
    points: Vec<String>,
    points_written: u64,
}

impl State {
    fn request(&self, method: reqwest::Method, path: &str) -> Option<reqwest::blocking::RequestBuilder> {
        let client = self.http.as_ref()?;
        let mut request = client.request(method, format!("{}{}", self.base_url, path));
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            request = request.basic_auth(username, Some(password));
        }
        Some(request)
    }

    fn run_query(&self, q: &str) -> Result<serde_json::Value, String> {
        let request = self
            .request(reqwest::Method::POST, "/query")
            .ok_or_else(|| "sink not started".to_string())?;
        let response = request
            .query(&[("q", q)])
            .send()
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("query returned {}", status));
        }
        response.json().map_err(|e| e.to_string())
    }

    /// Names from the `SHOW DATABASES` result.
    fn list_databases(&self) -> Result<Vec<String>, String> {
        let body = self.run_query("SHOW DATABASES")?;
        let mut names = Vec::new();
        if let Some(values) = body
            .pointer("/results/0/series/0/values")
            .and_then(|v| v.as_array())
        {
            for row in values {
                if let Some(name) = row.get(0).and_then(|n| n.as_str()) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Writes every buffered point in batches of [`MAX_POINTS_PER_WRITE`].
    fn flush(&mut self) {
        if self.points.is_empty() || self.http.is_none() {
            return;
        }
        let points = std::mem::take(&mut self.points);
        for chunk in points.chunks(MAX_POINTS_PER_WRITE) {
            debug!("writing {} points", chunk.len());
            let Some(request) = self.request(reqwest::Method::POST, "/write") else {
                return;
            };
            let result = request
                .query(&[("db", self.database.as_str()), ("precision", "ns")])
                .body(chunk.join("\n"))
                .send();
            match result {
                Ok(response) if response.status().is_success() => {
                    self.points_written += chunk.len() as u64;
                }
                Ok(response) => {
                    error!(
                        "failed to write {} points to InfluxDB: {}",
                        chunk.len(),
                        response.status()
                    );
                }
                Err(e) => {
                    error!("failed to write {} points to InfluxDB: {}", chunk.len(), e);
                }
            }
        }
    }
}

pub struct InfluxDbSink {
    state: Mutex<State>,
}

impl InfluxDbSink {
    pub fn new() -> Self {
        InfluxDbSink {
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for InfluxDbSink {
    fn default() -> Self {
        InfluxDbSink::new()
    }
}

impl StreamingProcessor for InfluxDbSink {
    /// Expected args: `<host> <port> <database> [<username> <password>]`.
    /// The database is created if it does not exist; an unreachable server
    /// is fatal at configuration time.
    fn start(&self, args: &[String]) -> Result<(), ProcessorError> {
        if args.len() < 3 {
            return Err(ProcessorError::Start(
                "influxdb expects args: <host> <port> <database> [<username> <password>]".into(),
            ));
        }
        let host = &args[0];
        let port: u16 = args[1]
            .parse()
            .map_err(|_| ProcessorError::Start(format!("invalid port '{}'", args[1])))?;
        let database = args[2].clone();
        let (username, password) = match (args.get(3), args.get(4)) {
            (Some(username), Some(password)) => (Some(username.clone()), Some(password.clone())),
            (Some(_), None) => {
                return Err(ProcessorError::Start(
                    "influxdb username given without a password".into(),
                ));
            }
            _ => (None, None),
        };

        info!(
            "connecting to InfluxDB at {}:{}, database {}",
            host, port, database
        );
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ProcessorError::Start(e.to_string()))?;

        let mut state = self.state.lock();
        *state = State {
            http: Some(http),
            base_url: format!("http://{}:{}", host, port),
            database: database.clone(),
            username,
            password,
            points: Vec::new(),
            points_written: 0,
        };
        let databases = state.list_databases().map_err(|e| {
            ProcessorError::Start(format!(
                "failed to connect to InfluxDB at {}:{}: {}",
                host, port, e
            ))
        })?;
        if !databases.contains(&database) {
            info!("creating database {}", database);
            state
                .run_query(&format!("CREATE DATABASE \"{}\"", database))
                .map_err(|e| {
                    ProcessorError::Start(format!("failed to create database {}: {}", database, e))
                })?;
        }
        Ok(())
    }

    fn process_stat(&self, cluster_name: &str, stat: &Stat) {
        if stat.error.is_some() {
            return;
        }
        let mut tags = BTreeMap::new();
        tags.insert("cluster".to_string(), cluster_name.to_string());
        if stat.devid != 0 {
            tags.insert("node".to_string(), stat.devid.to_string());
        }
        let mut state = self.state.lock();
        append_points(&stat.key, stat.time, &stat.value, &tags, &mut state.points);
        if state.points.len() >= MAX_POINTS_PER_WRITE {
            state.flush();
        }
    }

    fn end_process(&self, cluster_name: &str) {
        let mut state = self.state.lock();
        state.flush();
        debug!(
            "done processing stats for {}, {} points written so far",
            cluster_name, state.points_written
        );
    }

    fn stop(&self) {
        self.state.lock().flush();
    }
}

/// True when a mapping member should become a tag rather than a point:
/// strings carry no numeric value, and integer `*id` members identify the
/// thing being measured.
fn is_tag_member(sub_key: &str, value: &StatValue) -> bool {
    matches!(value, StatValue::Str(_))
        || (sub_key.ends_with("id") && matches!(value, StatValue::Int(_)))
}

/// Flattens one stat value into line-protocol points.
fn append_points(
    key: &str,
    time: i64,
    value: &StatValue,
    tags: &BTreeMap<String, String>,
    points: &mut Vec<String>,
) {
    match value {
        StatValue::Map(map) => {
            let mut map_tags = tags.clone();
            for (sub_key, sub_value) in map {
                if is_tag_member(sub_key, sub_value) {
                    map_tags.insert(sub_key.clone(), tag_value(sub_value));
                }
            }
            for (sub_key, sub_value) in map {
                if is_tag_member(sub_key, sub_value) {
                    continue;
                }
                let sub_name = format!("{}{}{}", key, SUB_KEY_SEPARATOR, sub_key);
                append_points(&sub_name, time, sub_value, &map_tags, points);
            }
        }
        StatValue::List(items) => {
            for (index, item) in items.iter().enumerate() {
                if matches!(item, StatValue::Map(_)) {
                    // the mapping's keys name the points
                    append_points(key, time, item, tags, points);
                } else {
                    let sub_name = format!("{}{}{}", key, SUB_KEY_SEPARATOR, index);
                    append_points(&sub_name, time, item, tags, points);
                }
            }
        }
        StatValue::Null => {}
        StatValue::Str(s) if s.is_empty() => {}
        scalar => points.push(line_point(key, time, scalar, tags)),
    }
}

fn line_point(measurement: &str, time: i64, value: &StatValue, tags: &BTreeMap<String, String>) -> String {
    let mut line = escape_identifier(measurement);
    for (tag_key, tag_val) in tags {
        line.push(',');
        line.push_str(&escape_identifier(tag_key));
        line.push('=');
        line.push_str(&escape_identifier(tag_val));
    }
    let timestamp_ns = time * 1_000_000_000;
    line.push_str(&format!(" value={} {}", field_value(value), timestamp_ns));
    line
}

fn tag_value(value: &StatValue) -> String {
    match value {
        StatValue::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_value(value: &StatValue) -> String {
    match value {
        StatValue::Int(v) => format!("{}i", v),
        StatValue::Float(v) => format!("{}", v),
        StatValue::Bool(v) => format!("{}", v),
        StatValue::Str(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        // flattened away before this point
        StatValue::Null | StatValue::List(_) | StatValue::Map(_) => "0".to_string(),
    }
}

/// Escapes the characters line protocol treats specially in measurement
/// names and tags.
fn escape_identifier(text: &str) -> String {
    text.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}
