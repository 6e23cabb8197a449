//! BlobSink - partitioned JSON-lines files
//!
//! Layout: `{base}/{topic}/dt=YYYY-MM-DD/hr=HH/part-{instance}-{seq}.jsonl`,
//! bucketed by message timestamp (UTC). Once a topic writes into a later hour,
//! its files for earlier hours are closed; late records open a fresh part.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use contracts::{DataEntry, Message, Sink, SinkError};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

const HOUR_MS: i64 = 3_600_000;

/// Distinguishes files of sinks sharing one base path
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Configuration for BlobSink
#[derive(Debug, Clone)]
pub struct BlobSinkConfig {
    /// Base output directory
    pub base_path: PathBuf,
    /// Records per file before rolling
    pub max_records_per_file: usize,
}

impl BlobSinkConfig {
    /// Create config from params map
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, String> {
        let base_path = params
            .get("base_path")
            .map(PathBuf::from)
            .ok_or_else(|| "missing 'base_path' parameter".to_string())?;

        let max_records_per_file = match params.get("max_records_per_file") {
            Some(value) => value
                .parse()
                .map_err(|e| format!("invalid max_records_per_file: {}", e))?,
            None => 1000,
        };
        if max_records_per_file == 0 {
            return Err("max_records_per_file must be > 0".to_string());
        }

        Ok(Self {
            base_path,
            max_records_per_file,
        })
    }
}

/// Message provenance stored with every record
#[derive(Debug, Clone, Serialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub key: String,
}

/// One JSON line
#[derive(Debug, Clone, Serialize)]
pub struct BlobRecord {
    pub metadata: RecordMetadata,
    pub message: Value,
}

impl BlobRecord {
    pub fn from_message(message: &Message) -> Result<Self, String> {
        let payload = serde_json::from_slice(&message.value)
            .map_err(|e| format!("invalid JSON payload: {}", e))?;
        Ok(Self {
            metadata: RecordMetadata {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                timestamp: message.timestamp,
                key: message.key_str().into_owned(),
            },
            message: payload,
        })
    }
}

/// Partition directory of a message
pub fn partition_dir(base: &Path, message: &Message) -> Result<PathBuf, String> {
    let time: DateTime<Utc> = DateTime::from_timestamp_millis(message.timestamp)
        .ok_or_else(|| format!("timestamp {} out of range", message.timestamp))?;
    Ok(base
        .join(&message.topic)
        .join(format!("dt={}", time.format("%Y-%m-%d")))
        .join(format!("hr={}", time.format("%H"))))
}

struct StagedRecord {
    dir: PathBuf,
    topic: String,
    /// Hours since the epoch
    hour: i64,
    line: String,
}

struct RollingFile {
    writer: BufWriter<File>,
    records: usize,
    topic: String,
    hour: i64,
}

/// Sink that appends records to partitioned local files
pub struct BlobSink {
    name: String,
    config: BlobSinkConfig,
    instance: u64,
    next_seq: u64,
    open_files: HashMap<PathBuf, RollingFile>,
    created_dirs: HashSet<PathBuf>,
    staged: Vec<Message>,
    records: Vec<DataEntry<StagedRecord>>,
    closed: bool,
}

impl BlobSink {
    /// Create a new BlobSink
    pub fn new(name: impl Into<String>, config: BlobSinkConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.base_path)?;

        Ok(Self {
            name: name.into(),
            config,
            instance: INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed),
            next_seq: 0,
            open_files: HashMap::new(),
            created_dirs: HashSet::new(),
            staged: Vec::new(),
            records: Vec::new(),
            closed: false,
        })
    }

    /// Create from params map (for factory)
    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
    ) -> std::io::Result<Self> {
        let config = BlobSinkConfig::from_params(params)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        Self::new(name, config)
    }

    fn stage_record(&self, message: &Message) -> Result<StagedRecord, String> {
        let dir = partition_dir(&self.config.base_path, message)?;
        let record = BlobRecord::from_message(message)?;
        let line = serde_json::to_string(&record).map_err(|e| e.to_string())?;
        Ok(StagedRecord {
            dir,
            topic: message.topic.clone(),
            hour: message.timestamp.div_euclid(HOUR_MS),
            line,
        })
    }

    fn open_next(&mut self, dir: &Path, topic: &str, hour: i64) -> std::io::Result<RollingFile> {
        if !self.created_dirs.contains(dir) {
            fs::create_dir_all(dir)?;
            self.created_dirs.insert(dir.to_path_buf());
        }

        let path = dir.join(format!(
            "part-{}-{}-{:05}.jsonl",
            std::process::id(),
            self.instance,
            self.next_seq
        ));
        self.next_seq += 1;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(sink = %self.name, path = %path.display(), "Opened blob file");
        Ok(RollingFile {
            writer: BufWriter::new(file),
            records: 0,
            topic: topic.to_string(),
            hour,
        })
    }

    fn write_group(
        &mut self,
        dir: &Path,
        topic: &str,
        hour: i64,
        lines: &[&str],
    ) -> std::io::Result<()> {
        for line in lines {
            let needs_roll = self
                .open_files
                .get(dir)
                .map_or(true, |file| file.records >= self.config.max_records_per_file);
            if needs_roll {
                if let Some(mut full) = self.open_files.remove(dir) {
                    full.writer.flush()?;
                    full.writer.get_ref().sync_all()?;
                }
                let file = self.open_next(dir, topic, hour)?;
                self.open_files.insert(dir.to_path_buf(), file);
            }

            let Some(file) = self.open_files.get_mut(dir) else {
                return Err(std::io::Error::other("blob file vanished"));
            };
            file.writer.write_all(line.as_bytes())?;
            file.writer.write_all(b"\n")?;
            file.records += 1;
        }

        if let Some(file) = self.open_files.get_mut(dir) {
            file.writer.flush()?;
            file.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Close files of hours a topic has already moved past
    fn close_past_hours(&mut self, latest: &HashMap<String, i64>) {
        let expired: Vec<PathBuf> = self
            .open_files
            .iter()
            .filter(|(_, file)| latest.get(&file.topic).is_some_and(|&hour| file.hour < hour))
            .map(|(dir, _)| dir.clone())
            .collect();

        for dir in expired {
            let Some(mut file) = self.open_files.remove(&dir) else {
                continue;
            };
            // Records were synced when written; a failure here loses nothing
            let closed = file.writer.flush().and_then(|_| file.writer.get_ref().sync_all());
            match closed {
                Ok(()) => {
                    debug!(sink = %self.name, path = %dir.display(), "Closed blob file of a past hour")
                }
                Err(e) => {
                    warn!(sink = %self.name, path = %dir.display(), error = %e, "Closing blob file failed")
                }
            }
        }
    }

    /// Partition directories with an open file
    pub fn open_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.open_files.keys().cloned().collect();
        dirs.sort();
        dirs
    }

    fn flush_all(&mut self) -> std::io::Result<()> {
        for file in self.open_files.values_mut() {
            file.writer.flush()?;
            file.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

impl Sink for BlobSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "blob_sink_prepare",
        skip(self, batch),
        fields(sink = %self.name, messages = batch.len())
    )]
    fn prepare(&mut self, batch: &[Message]) -> Result<(), SinkError> {
        self.staged.clear();
        self.records.clear();

        let mut records = Vec::with_capacity(batch.len());
        for (origin, message) in batch.iter().enumerate() {
            let record = self.stage_record(message).map_err(|e| {
                SinkError::deserialization(&self.name, e, Some(message.id()))
            })?;
            records.push(DataEntry::new(origin, record));
        }

        self.records = records;
        self.staged = batch.to_vec();
        Ok(())
    }

    #[instrument(
        name = "blob_sink_execute",
        skip(self),
        fields(sink = %self.name, staged = self.staged.len())
    )]
    async fn execute(&mut self) -> Result<Vec<Message>, SinkError> {
        let staged = std::mem::take(&mut self.staged);
        let records = std::mem::take(&mut self.records);
        if staged.is_empty() {
            return Ok(Vec::new());
        }
        if self.closed {
            return Err(SinkError::closed(&self.name));
        }

        let mut groups: BTreeMap<PathBuf, Vec<DataEntry<StagedRecord>>> = BTreeMap::new();
        for record in records {
            groups.entry(record.body.dir.clone()).or_default().push(record);
        }

        let mut failed = Vec::new();
        let mut latest: HashMap<String, i64> = HashMap::new();
        for (dir, group) in groups {
            let Some(first) = group.first() else {
                continue;
            };
            let (topic, hour) = (first.body.topic.clone(), first.body.hour);
            let newest = latest.entry(topic.clone()).or_insert(hour);
            *newest = (*newest).max(hour);

            let lines: Vec<&str> = group.iter().map(|r| r.body.line.as_str()).collect();
            if let Err(e) = self.write_group(&dir, &topic, hour, &lines) {
                error!(
                    sink = %self.name,
                    path = %dir.display(),
                    records = group.len(),
                    error = %e,
                    "Write failed"
                );
                // Reopen on the next attempt
                self.open_files.remove(&dir);
                failed.extend(group.iter().filter_map(|r| staged.get(r.origin).cloned()));
            }
        }

        self.close_past_hours(&latest);
        Ok(failed)
    }

    #[instrument(name = "blob_sink_close", skip(self), fields(sink = %self.name))]
    async fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            debug!(sink = %self.name, "BlobSink already closed");
            return Ok(());
        }
        self.closed = true;
        self.staged.clear();

        let result = self.flush_all();
        self.open_files.clear();
        result?;
        info!(sink = %self.name, "BlobSink closed");
        Ok(())
    }
}
