//! Per-repeat export of results.
//!
//! The engine hands every measured repeat to a [`RepeatSink`], one call per
//! channel, after announcing the channels with [`RepeatSink::begin_repeat`]. [`CsvSink`] is the production sink: one headerless file per
//! channel named `<channel>_<timestamp>_<device>.csv`, one line per repeat.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, info};

use crate::errors::Result;
use crate::output::RepeatResult;
use crate::protocol::ChannelTag;

pub trait RepeatSink: Send {
    /// Called before the rows of a repeat are written. A sink that can fail
    /// per channel should do it here, before any row lands.
    fn begin_repeat(&mut self, _tags: &[ChannelTag]) -> Result<()> {
        Ok(())
    }

    /// Persist one channel's result of a completed repeat.
    fn write_repeat(&mut self, tag: ChannelTag, result: &RepeatResult) -> Result<()>;

    /// Called once when the run ends, whatever the outcome.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<F> RepeatSink for F
where
    F: FnMut(ChannelTag, &RepeatResult) -> Result<()> + Send,
{
    fn write_repeat(&mut self, tag: ChannelTag, result: &RepeatResult) -> Result<()> {
        self(tag, result)
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RepeatSink for NullSink {
    fn write_repeat(&mut self, _tag: ChannelTag, _result: &RepeatResult) -> Result<()> {
        Ok(())
    }
}

pub struct CsvSink {
    dir: PathBuf,
    device_name: String,
    timestamp: String,
    writers: BTreeMap<ChannelTag, csv::Writer<File>>,
}

impl CsvSink {
    /// Files are created lazily in `dir`, stamped with the current local time.
    pub fn new(dir: impl Into<PathBuf>, device_name: impl Into<String>) -> Self {
        Self::with_timestamp(
            dir,
            device_name,
            Local::now().format("%Y-%m-%dT%H-%M-%S").to_string(),
        )
    }

    pub fn with_timestamp(
        dir: impl Into<PathBuf>,
        device_name: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            device_name: device_name.into(),
            timestamp: timestamp.into(),
            writers: BTreeMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tag: ChannelTag) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.csv",
            tag.name(),
            self.timestamp,
            self.device_name
        ))
    }

    fn writer(&mut self, tag: ChannelTag) -> Result<&mut csv::Writer<File>> {
        let path = self.path_for(tag);
        match self.writers.entry(tag) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                fs::create_dir_all(&self.dir)?;
                let writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .from_path(&path)?;
                info!("csv output opened: channel={}, path={}", tag, path.display());
                Ok(entry.insert(writer))
            }
        }
    }
}

impl RepeatSink for CsvSink {
    /// Opens the file of every channel up front.
    fn begin_repeat(&mut self, tags: &[ChannelTag]) -> Result<()> {
        for &tag in tags {
            self.writer(tag)?;
        }
        Ok(())
    }

    fn write_repeat(&mut self, tag: ChannelTag, result: &RepeatResult) -> Result<()> {
        let writer = self.writer(tag)?;
        writer.write_record(result.values().iter().map(|v| v.to_string()))?;
        writer.flush()?;
        debug!("csv row written: channel={}, values={}", tag, result.values().len());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        self.writers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_headerless_line_per_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::with_timestamp(dir.path(), "device0", "T0");
        sink.write_repeat(ChannelTag::Left, &RepeatResult::Sweep(vec![1, -2, 3]))
            .unwrap();
        sink.write_repeat(ChannelTag::Left, &RepeatResult::Sweep(vec![4, 5, 6]))
            .unwrap();
        sink.write_repeat(ChannelTag::Right, &RepeatResult::Fixed(42))
            .unwrap();
        sink.finish().unwrap();

        let left = fs::read_to_string(dir.path().join("left_T0_device0.csv")).unwrap();
        assert_eq!(left, "1,-2,3\n4,5,6\n");
        let right = fs::read_to_string(dir.path().join("right_T0_device0.csv")).unwrap();
        assert_eq!(right, "42\n");
    }

    #[test]
    fn closures_are_sinks() {
        let mut rows = Vec::new();
        {
            let mut sink = |tag: ChannelTag, r: &RepeatResult| -> Result<()> {
                rows.push((tag, r.values().to_vec()));
                Ok(())
            };
            sink.write_repeat(ChannelTag::Right, &RepeatResult::Fixed(3))
                .unwrap();
        }
        assert_eq!(rows, vec![(ChannelTag::Right, vec![3])]);
    }

    #[test]
    fn unopenable_channel_file_fails_before_any_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::with_timestamp(dir.path(), "device0", "T0");
        fs::create_dir(sink.path_for(ChannelTag::Right)).unwrap();

        let tags = [ChannelTag::Left, ChannelTag::Right];
        assert!(sink.begin_repeat(&tags).is_err());
        sink.finish().unwrap();

        let left = fs::read_to_string(sink.path_for(ChannelTag::Left)).unwrap();
        assert!(left.is_empty());
    }
}
