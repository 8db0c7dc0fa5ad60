//! Writes bids into hourly (by default) CSV or TSV files, one "all" and one "top" file per bucket.

use std::{
    collections::{hash_map::Entry, HashMap},
    fs::{self, File, OpenOptions},
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

use anyhow::{anyhow, Context, Result};
use chrono::DateTime;
use tracing::info;

use super::{CommonBid, COMMON_BID_CSV_FIELDS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Every distinct bid.
    All,
    /// Each new highest bid of a slot.
    Top,
}

impl OutputKind {
    fn as_str(&self) -> &'static str {
        match self {
            OutputKind::All => "all",
            OutputKind::Top => "top",
        }
    }
}

pub trait BidSink: Send + Sync {
    fn write_bid(&self, bid: &CommonBid, kind: OutputKind) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct RotatingFileSinkConfig {
    pub out_dir: PathBuf,
    pub bucket_seconds: i64,
    /// Distinguishes the files of collectors sharing an output directory.
    pub uid: Option<String>,
    pub use_tsv: bool,
}

impl Default for RotatingFileSinkConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("csv"),
            bucket_seconds: 3600,
            uid: None,
            use_tsv: false,
        }
    }
}

type SharedWriter = Arc<Mutex<csv::Writer<File>>>;

pub struct RotatingFileSink {
    config: RotatingFileSinkConfig,
    // Writers are kept for the life of the process, buckets are only opened once.
    writers: RwLock<HashMap<(i64, OutputKind), SharedWriter>>,
}

impl RotatingFileSink {
    pub fn new(config: RotatingFileSinkConfig) -> Result<Self> {
        if config.bucket_seconds <= 0 {
            return Err(anyhow!(
                "bucket seconds must be positive, got {}",
                config.bucket_seconds
            ));
        }

        Ok(Self {
            config,
            writers: RwLock::new(HashMap::new()),
        })
    }

    /// Start of the bucket the timestamp falls in, in unix seconds.
    pub fn bucket_start(&self, received_at_ms: i64) -> i64 {
        let seconds = received_at_ms.div_euclid(1000);
        seconds.div_euclid(self.config.bucket_seconds) * self.config.bucket_seconds
    }

    pub fn file_path(&self, bucket_start: i64, kind: OutputKind) -> Result<PathBuf> {
        let date_time = DateTime::from_timestamp(bucket_start, 0)
            .ok_or_else(|| anyhow!("bucket start out of range: {bucket_start}"))?;

        let uid_part = self
            .config
            .uid
            .as_ref()
            .map(|uid| format!("_{uid}"))
            .unwrap_or_default();
        let extension = if self.config.use_tsv { "tsv" } else { "csv" };
        let file_name = format!(
            "{}{}_{}.{}",
            date_time.format("%Y-%m-%d_%H-%M"),
            uid_part,
            kind.as_str(),
            extension
        );

        Ok(self
            .config
            .out_dir
            .join(date_time.format("%Y-%m-%d").to_string())
            .join(file_name))
    }

    fn open_writer(&self, bucket_start: i64, kind: OutputKind) -> Result<SharedWriter> {
        let path = self.file_path(bucket_start, kind)?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create bid output dir {}", dir.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open bid output file {}", path.display()))?;
        let is_new_file = file.metadata()?.len() == 0;

        let delimiter = if self.config.use_tsv { b'\t' } else { b',' };
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .from_writer(file);

        if is_new_file {
            writer.write_record(COMMON_BID_CSV_FIELDS)?;
            writer.flush()?;
        }

        info!(path = %path.display(), is_new_file, "opened bid output file");

        Ok(Arc::new(Mutex::new(writer)))
    }

    fn writer(&self, bucket_start: i64, kind: OutputKind) -> Result<SharedWriter> {
        let key = (bucket_start, kind);

        if let Some(writer) = self
            .writers
            .read()
            .map_err(|_| anyhow!("bid writers lock poisoned"))?
            .get(&key)
        {
            return Ok(writer.clone());
        }

        let mut writers = self
            .writers
            .write()
            .map_err(|_| anyhow!("bid writers lock poisoned"))?;

        // Another writer may have opened the file between our read and write lock.
        match writers.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let writer = self.open_writer(bucket_start, kind)?;
                Ok(entry.insert(writer).clone())
            }
        }
    }
}

impl BidSink for RotatingFileSink {
    fn write_bid(&self, bid: &CommonBid, kind: OutputKind) -> Result<()> {
        let bucket_start = self.bucket_start(bid.received_at_ms);
        let writer = self.writer(bucket_start, kind)?;

        let mut writer = writer
            .lock()
            .map_err(|_| anyhow!("bid writer lock poisoned"))?;
        writer.write_record(bid.to_csv_record())?;
        writer.flush()?;

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let writers = self
            .writers
            .read()
            .map_err(|_| anyhow!("bid writers lock poisoned"))?;

        for writer in writers.values() {
            writer
                .lock()
                .map_err(|_| anyhow!("bid writer lock poisoned"))?
                .flush()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        beacon_chain::Slot,
        bids::{test_utils::CommonBidBuilder, SourceType},
    };

    use super::*;

    fn sink_in(dir: &tempfile::TempDir, uid: Option<&str>, use_tsv: bool) -> RotatingFileSink {
        RotatingFileSink::new(RotatingFileSinkConfig {
            out_dir: dir.path().to_path_buf(),
            bucket_seconds: 3600,
            uid: uid.map(str::to_string),
            use_tsv,
        })
        .unwrap()
    }

    // 2023-06-04T23:59:59Z, one second before an hour boundary.
    const SLOT_6591598_MS: i64 = 1685923199000;

    #[test]
    fn bucket_start_test() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir, None, false);

        assert_eq!(sink.bucket_start(SLOT_6591598_MS), 1685919600);
        assert_eq!(sink.bucket_start(SLOT_6591598_MS + 1000), 1685923200);
    }

    #[test]
    fn file_path_test() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir, Some("collector-1"), true);

        let path = sink.file_path(1685919600, OutputKind::Top).unwrap();
        assert_eq!(
            path,
            dir.path()
                .join("2023-06-04")
                .join("2023-06-04_23-00_collector-1_top.tsv")
        );
    }

    #[test]
    fn invalid_bucket_seconds_test() {
        let result = RotatingFileSink::new(RotatingFileSinkConfig {
            bucket_seconds: 0,
            ..RotatingFileSinkConfig::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn writes_header_once_test() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir, None, false);
        let slot = Slot(6591598);

        let first = CommonBidBuilder::new(SourceType::DataApi, slot, 100)
            .received_at_ms(SLOT_6591598_MS)
            .build();
        let second = CommonBidBuilder::new(SourceType::DataApi, slot, 200)
            .received_at_ms(SLOT_6591598_MS + 500)
            .build();
        sink.write_bid(&first, OutputKind::All).unwrap();
        sink.write_bid(&second, OutputKind::All).unwrap();

        let path = sink.file_path(1685919600, OutputKind::All).unwrap();
        let contents = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], COMMON_BID_CSV_FIELDS.join(","));
        assert!(lines[1].starts_with("data-api,1685923199000,"));
        assert!(lines[2].contains(",200,"));
    }

    #[test]
    fn reopening_appends_without_header_test() {
        let dir = tempfile::tempdir().unwrap();
        let bid = CommonBidBuilder::new(SourceType::UltrasoundStream, Slot(6591598), 100)
            .received_at_ms(SLOT_6591598_MS)
            .build();

        // Two sinks over one directory act like a restarted process.
        sink_in(&dir, None, false)
            .write_bid(&bid, OutputKind::Top)
            .unwrap();
        let sink = sink_in(&dir, None, false);
        sink.write_bid(&bid, OutputKind::Top).unwrap();

        let path = sink.file_path(1685919600, OutputKind::Top).unwrap();
        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert_eq!(
            contents
                .lines()
                .filter(|line| line.starts_with("source_type"))
                .count(),
            1
        );
    }

    #[test]
    fn splits_buckets_and_kinds_test() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir, None, true);

        let before_hour = CommonBidBuilder::new(SourceType::DataApi, Slot(6591598), 1)
            .received_at_ms(SLOT_6591598_MS)
            .build();
        let after_hour = CommonBidBuilder::new(SourceType::DataApi, Slot(6591599), 2)
            .received_at_ms(SLOT_6591598_MS + 12_000)
            .build();

        sink.write_bid(&before_hour, OutputKind::All).unwrap();
        sink.write_bid(&before_hour, OutputKind::Top).unwrap();
        sink.write_bid(&after_hour, OutputKind::All).unwrap();

        let first_all = sink.file_path(1685919600, OutputKind::All).unwrap();
        let first_top = sink.file_path(1685919600, OutputKind::Top).unwrap();
        let second_all = sink.file_path(1685923200, OutputKind::All).unwrap();

        assert!(first_all.exists());
        assert!(first_top.exists());
        assert!(second_all.exists());
        assert!(!sink
            .file_path(1685923200, OutputKind::Top)
            .unwrap()
            .exists());

        let header = fs::read_to_string(second_all)
            .unwrap()
            .lines()
            .next()
            .unwrap()
            .to_string();
        assert_eq!(header, COMMON_BID_CSV_FIELDS.join("\t"));
    }

    #[test]
    fn concurrent_writers_share_one_file_test() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(sink_in(&dir, None, false));

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for j in 0..25u64 {
                        let value = i * 100 + j;
                        let bid = CommonBidBuilder::new(SourceType::DataApi, Slot(6591598), value)
                            .received_at_ms(SLOT_6591598_MS)
                            .build();
                        sink.write_bid(&bid, OutputKind::All).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let path = sink.file_path(1685919600, OutputKind::All).unwrap();
        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 1 + 8 * 25);
        assert!(contents
            .lines()
            .skip(1)
            .all(|line| line.split(',').count() == COMMON_BID_CSV_FIELDS.len()));
    }
}
