//! Accumulated results of a run.
//!
//! The acquisition thread is the only writer of an [`OutputModel`]; any number
//! of observers read it concurrently. Results are appended whole, so a reader
//! never sees half of a repeat. Readers keep an integer cursor per channel
//! and ask for everything appended since; [`OutputReader`] does that
//! bookkeeping for them.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::protocol::ChannelTag;

/// Outcome of one repeat on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatResult {
    /// One mean per sweep address, in address order.
    Sweep(Vec<i64>),
    /// The mean read at the fixed reference address.
    Fixed(i64),
}

impl RepeatResult {
    pub fn values(&self) -> &[i64] {
        match self {
            RepeatResult::Sweep(values) => values,
            RepeatResult::Fixed(value) => std::slice::from_ref(value),
        }
    }
}

#[derive(Debug, Default)]
struct Series {
    generation: u64,
    channels: BTreeMap<ChannelTag, Vec<RepeatResult>>,
    /// First sweep index reaching the reference pulse, one entry per repeat.
    crossings: Vec<Option<usize>>,
}

impl Series {
    fn since(&self, tag: ChannelTag, cursor: usize) -> (Vec<RepeatResult>, usize) {
        let all = self.channels.get(&tag).map(Vec::as_slice).unwrap_or(&[]);
        let start = cursor.min(all.len());
        (all[start..].to_vec(), all.len())
    }

    fn crossings_since(&self, cursor: usize) -> (Vec<Option<usize>>, usize) {
        let start = cursor.min(self.crossings.len());
        (self.crossings[start..].to_vec(), self.crossings.len())
    }
}

/// Shared handle to the results of the current run.
#[derive(Debug, Clone, Default)]
pub struct OutputModel {
    inner: Arc<RwLock<Series>>,
}

impl OutputModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Series> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Series> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one result to one channel.
    pub fn append(&self, tag: ChannelTag, result: RepeatResult) {
        self.write().channels.entry(tag).or_default().push(result);
    }

    /// Append a complete repeat across channels in one step.
    pub fn commit(&self, results: Vec<(ChannelTag, RepeatResult)>) {
        let mut series = self.write();
        for (tag, result) in results {
            series.channels.entry(tag).or_default().push(result);
        }
    }

    /// Like [`OutputModel::commit`], also recording the reference-pulse crossing.
    pub fn commit_with_crossing(
        &self,
        results: Vec<(ChannelTag, RepeatResult)>,
        crossing: Option<usize>,
    ) {
        let mut series = self.write();
        for (tag, result) in results {
            series.channels.entry(tag).or_default().push(result);
        }
        series.crossings.push(crossing);
    }

    /// Results of `tag` appended after `cursor`, and the cursor to use next time.
    pub fn snapshot_since(&self, tag: ChannelTag, cursor: usize) -> (Vec<RepeatResult>, usize) {
        self.read().since(tag, cursor)
    }

    pub fn crossings_since(&self, cursor: usize) -> (Vec<Option<usize>>, usize) {
        self.read().crossings_since(cursor)
    }

    pub fn len(&self, tag: ChannelTag) -> usize {
        self.read().channels.get(&tag).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.read().channels.values().all(Vec::is_empty)
    }

    pub fn tags(&self) -> Vec<ChannelTag> {
        self.read().channels.keys().copied().collect()
    }

    /// Discard everything. Readers notice and restart from zero.
    pub fn reset(&self) {
        let mut series = self.write();
        let generation = series.generation.wrapping_add(1);
        *series = Series {
            generation,
            ..Series::default()
        };
    }

    pub fn reader(&self) -> OutputReader {
        OutputReader::new(self.clone())
    }
}

/// Incremental consumer of an [`OutputModel`], e.g. a plot refresher.
#[derive(Debug, Clone)]
pub struct OutputReader {
    model: OutputModel,
    generation: u64,
    cursors: BTreeMap<ChannelTag, usize>,
    crossing_cursor: usize,
}

impl OutputReader {
    pub fn new(model: OutputModel) -> Self {
        let generation = model.read().generation;
        Self {
            model,
            generation,
            cursors: BTreeMap::new(),
            crossing_cursor: 0,
        }
    }

    /// Results of `tag` not yet seen by this reader.
    pub fn poll(&mut self, tag: ChannelTag) -> Vec<RepeatResult> {
        let series = self.model.read();
        if series.generation != self.generation {
            self.generation = series.generation;
            self.cursors.clear();
            self.crossing_cursor = 0;
        }
        let cursor = self.cursors.entry(tag).or_insert(0);
        let (fresh, next) = series.since(tag, *cursor);
        *cursor = next;
        fresh
    }

    /// Reference-pulse crossings not yet seen by this reader.
    pub fn poll_crossings(&mut self) -> Vec<Option<usize>> {
        let series = self.model.read();
        if series.generation != self.generation {
            self.generation = series.generation;
            self.cursors.clear();
            self.crossing_cursor = 0;
        }
        let (fresh, next) = series.crossings_since(self.crossing_cursor);
        self.crossing_cursor = next;
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn snapshot_since_returns_only_new_results() {
        let model = OutputModel::new();
        model.append(ChannelTag::Left, RepeatResult::Fixed(1));
        model.append(ChannelTag::Left, RepeatResult::Fixed(2));

        let (first, cursor) = model.snapshot_since(ChannelTag::Left, 0);
        assert_eq!(first, vec![RepeatResult::Fixed(1), RepeatResult::Fixed(2)]);
        assert_eq!(cursor, 2);

        model.append(ChannelTag::Left, RepeatResult::Fixed(3));
        let (second, cursor) = model.snapshot_since(ChannelTag::Left, cursor);
        assert_eq!(second, vec![RepeatResult::Fixed(3)]);
        assert_eq!(cursor, 3);

        let (none, cursor) = model.snapshot_since(ChannelTag::Left, cursor);
        assert!(none.is_empty());
        assert_eq!(cursor, 3);
    }

    #[test]
    fn unknown_channel_is_empty() {
        let model = OutputModel::new();
        assert_eq!(model.snapshot_since(ChannelTag::Right, 5), (vec![], 0));
        assert!(model.is_empty());
    }

    #[test]
    fn commit_appends_every_channel() {
        let model = OutputModel::new();
        model.commit(vec![
            (ChannelTag::Left, RepeatResult::Sweep(vec![1, 2])),
            (ChannelTag::Right, RepeatResult::Sweep(vec![3, 4])),
        ]);
        assert_eq!(model.len(ChannelTag::Left), 1);
        assert_eq!(model.len(ChannelTag::Right), 1);
        assert_eq!(model.tags(), vec![ChannelTag::Left, ChannelTag::Right]);
    }

    #[test]
    fn reader_tracks_cursors_per_channel() {
        let model = OutputModel::new();
        let mut reader = model.reader();
        model.append(ChannelTag::Left, RepeatResult::Fixed(1));
        model.append(ChannelTag::Right, RepeatResult::Fixed(9));

        assert_eq!(reader.poll(ChannelTag::Left), vec![RepeatResult::Fixed(1)]);
        assert!(reader.poll(ChannelTag::Left).is_empty());
        assert_eq!(reader.poll(ChannelTag::Right), vec![RepeatResult::Fixed(9)]);
    }

    #[test]
    fn reader_restarts_after_reset() {
        let model = OutputModel::new();
        let mut reader = model.reader();
        model.append(ChannelTag::Left, RepeatResult::Fixed(1));
        model.append(ChannelTag::Left, RepeatResult::Fixed(2));
        assert_eq!(reader.poll(ChannelTag::Left).len(), 2);

        model.reset();
        model.append(ChannelTag::Left, RepeatResult::Fixed(7));
        assert_eq!(reader.poll(ChannelTag::Left), vec![RepeatResult::Fixed(7)]);
    }

    #[test]
    fn crossings_are_recorded_with_the_repeat() {
        let model = OutputModel::new();
        let mut reader = model.reader();
        model.commit_with_crossing(
            vec![(ChannelTag::Right, RepeatResult::Sweep(vec![0, 5, 10]))],
            Some(2),
        );
        model.commit_with_crossing(
            vec![(ChannelTag::Right, RepeatResult::Sweep(vec![0, 0, 0]))],
            None,
        );
        assert_eq!(reader.poll_crossings(), vec![Some(2), None]);
        assert!(reader.poll_crossings().is_empty());
    }

    #[test]
    fn concurrent_reader_sees_whole_sweeps() {
        let model = OutputModel::new();
        let writer = model.clone();
        let handle = thread::spawn(move || {
            for rep in 0..200 {
                writer.append(ChannelTag::Left, RepeatResult::Sweep(vec![rep; 128]));
            }
        });

        let mut reader = model.reader();
        let mut seen = 0;
        while seen < 200 {
            for result in reader.poll(ChannelTag::Left) {
                assert_eq!(result.values().len(), 128);
                assert!(result.values().iter().all(|v| *v == seen as i64));
                seen += 1;
            }
        }
        handle.join().unwrap();
    }
}
