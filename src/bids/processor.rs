//! Deduplicates bids coming in from every source and keeps track of the top bid per slot.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::beacon_chain::Slot;

use super::{BidSink, CommonBid, OutputKind};

/// Slots further than this behind the current slot no longer receive bids.
const SLOTS_TO_KEEP: i64 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BidProcessorStats {
    pub bids_received: u64,
    pub unique_bids: u64,
    pub top_bids: u64,
    pub tracked_slots: usize,
}

#[derive(Default)]
struct BidCaches {
    bids: HashMap<Slot, HashMap<String, CommonBid>>,
    top_bids: HashMap<Slot, CommonBid>,
    bids_received: u64,
    unique_bids: u64,
    top_bids_written: u64,
}

pub struct BidProcessor {
    // One lock for both caches. Whether a bid is the new top bid depends on the current top bid,
    // deciding that under a separate lock would let two concurrent bids both win.
    caches: Mutex<BidCaches>,
    sink: Arc<dyn BidSink>,
}

impl BidProcessor {
    pub fn new(sink: Arc<dyn BidSink>) -> Self {
        Self {
            caches: Mutex::new(BidCaches::default()),
            sink,
        }
    }

    /// Applies bids in order. Fails only when the sink fails, after which output may be
    /// incomplete and the caller should stop.
    pub fn process_batch(&self, bids: &[CommonBid]) -> Result<()> {
        let mut guard = self
            .caches
            .lock()
            .map_err(|_| anyhow!("bid caches lock poisoned"))?;
        let caches = &mut *guard;

        for bid in bids {
            caches.bids_received += 1;

            if let Entry::Vacant(entry) = caches
                .bids
                .entry(bid.slot)
                .or_default()
                .entry(bid.unique_key())
            {
                entry.insert(bid.clone());
                caches.unique_bids += 1;
                self.sink.write_bid(bid, OutputKind::All)?;
            }

            // Ties keep the bid seen first.
            let is_new_top = caches
                .top_bids
                .get(&bid.slot)
                .map_or(true, |top_bid| bid.value > top_bid.value);
            if is_new_top {
                debug!(
                    slot = %bid.slot,
                    value = %bid.value,
                    relay = %bid.relay,
                    source = %bid.source_type,
                    "new top bid"
                );
                caches.top_bids.insert(bid.slot, bid.clone());
                caches.top_bids_written += 1;
                self.sink.write_bid(bid, OutputKind::Top)?;
            }
        }

        Ok(())
    }

    /// Forgets slots older than two slots before `current_slot`. Returns how many slots were
    /// evicted.
    pub fn housekeeping(&self, current_slot: Slot) -> Result<usize> {
        let oldest_kept = current_slot - SLOTS_TO_KEEP;

        let mut caches = self
            .caches
            .lock()
            .map_err(|_| anyhow!("bid caches lock poisoned"))?;

        let slots_before = caches.bids.len();
        caches.bids.retain(|slot, _| *slot >= oldest_kept);
        caches.top_bids.retain(|slot, _| *slot >= oldest_kept);
        let evicted = slots_before - caches.bids.len();

        debug!(%current_slot, %oldest_kept, evicted, "bid cache housekeeping");

        Ok(evicted)
    }

    pub fn stats(&self) -> Result<BidProcessorStats> {
        let caches = self
            .caches
            .lock()
            .map_err(|_| anyhow!("bid caches lock poisoned"))?;

        Ok(BidProcessorStats {
            bids_received: caches.bids_received,
            unique_bids: caches.unique_bids,
            top_bids: caches.top_bids_written,
            tracked_slots: caches.bids.len(),
        })
    }

    pub fn top_bid(&self, slot: Slot) -> Result<Option<CommonBid>> {
        let caches = self
            .caches
            .lock()
            .map_err(|_| anyhow!("bid caches lock poisoned"))?;

        Ok(caches.top_bids.get(&slot).cloned())
    }

    pub fn tracked_slots(&self) -> Result<Vec<Slot>> {
        let caches = self
            .caches
            .lock()
            .map_err(|_| anyhow!("bid caches lock poisoned"))?;

        let mut slots: Vec<Slot> = caches.bids.keys().copied().collect();
        slots.sort();
        Ok(slots)
    }

    /// Flushes any buffered output.
    pub fn shutdown(&self) -> Result<()> {
        self.sink.flush()
    }
}

#[cfg(test)]
pub mod tests {
    use alloy_primitives::U256;

    use crate::bids::{test_utils::CommonBidBuilder, SourceType};

    use super::*;

    /// Remembers what was written, in order.
    #[derive(Default)]
    pub struct RecordingSink {
        pub rows: Mutex<Vec<(OutputKind, CommonBid)>>,
        pub flushes: Mutex<usize>,
    }

    impl RecordingSink {
        pub fn written(&self, kind: OutputKind) -> Vec<CommonBid> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(row_kind, _)| *row_kind == kind)
                .map(|(_, bid)| bid.clone())
                .collect()
        }
    }

    impl BidSink for RecordingSink {
        fn write_bid(&self, bid: &CommonBid, kind: OutputKind) -> Result<()> {
            self.rows.lock().unwrap().push((kind, bid.clone()));
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct FailingSink;

    impl BidSink for FailingSink {
        fn write_bid(&self, _bid: &CommonBid, _kind: OutputKind) -> Result<()> {
            Err(anyhow!("disk full"))
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn processor() -> (BidProcessor, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (BidProcessor::new(sink.clone()), sink)
    }

    fn values(bids: &[CommonBid]) -> Vec<U256> {
        bids.iter().map(|bid| bid.value).collect()
    }

    const SLOT: Slot = Slot(6591598);

    #[test]
    fn deduplicates_within_batch_test() {
        let (processor, sink) = processor();
        let bid = CommonBidBuilder::new(SourceType::DataApi, SLOT, 100).build();
        let same_bid_other_relay = CommonBidBuilder::new(SourceType::DataApi, SLOT, 100)
            .relay("boost-relay.flashbots.net")
            .build();

        processor
            .process_batch(&[bid.clone(), bid, same_bid_other_relay])
            .unwrap();

        assert_eq!(sink.written(OutputKind::All).len(), 1);
        assert_eq!(sink.written(OutputKind::Top).len(), 1);
        let stats = processor.stats().unwrap();
        assert_eq!(stats.bids_received, 3);
        assert_eq!(stats.unique_bids, 1);
    }

    #[test]
    fn deduplicates_across_batches_and_sources_test() {
        let (processor, sink) = processor();
        let from_api = CommonBidBuilder::new(SourceType::DataApi, SLOT, 100).build();
        let from_stream = CommonBidBuilder::new(SourceType::UltrasoundStream, SLOT, 100).build();

        processor.process_batch(&[from_api.clone()]).unwrap();
        processor.process_batch(&[from_stream]).unwrap();
        processor.process_batch(&[from_api]).unwrap();

        let all = sink.written(OutputKind::All);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].source_type, SourceType::DataApi);
    }

    #[test]
    fn same_block_different_value_is_distinct_test() {
        let (processor, sink) = processor();
        let low = CommonBidBuilder::new(SourceType::DataApi, SLOT, 100)
            .block_hash("0xsame")
            .build();
        let high = CommonBidBuilder::new(SourceType::DataApi, SLOT, 101)
            .block_hash("0xsame")
            .build();

        processor.process_batch(&[low, high]).unwrap();

        assert_eq!(sink.written(OutputKind::All).len(), 2);
    }

    #[test]
    fn top_bids_are_non_decreasing_test() {
        let (processor, sink) = processor();
        let bids: Vec<CommonBid> = [5, 3, 8, 8, 1, 13, 12, 21, 2]
            .into_iter()
            .map(|value| CommonBidBuilder::new(SourceType::DataApi, SLOT, value).build())
            .collect();

        for bid in &bids {
            processor.process_batch(std::slice::from_ref(bid)).unwrap();
        }

        let top = values(&sink.written(OutputKind::Top));
        assert_eq!(top, [5u64, 8, 13, 21].map(U256::from).to_vec());
        assert!(top.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(
            processor.top_bid(SLOT).unwrap().unwrap().value,
            U256::from(21)
        );
    }

    #[test]
    fn ties_keep_first_seen_test() {
        let (processor, sink) = processor();
        let first = CommonBidBuilder::new(SourceType::DataApi, SLOT, 100)
            .block_hash("0xfirst")
            .build();
        let second = CommonBidBuilder::new(SourceType::GetHeader, SLOT, 100)
            .block_hash("0xsecond")
            .build();

        processor.process_batch(&[first, second]).unwrap();

        let top = sink.written(OutputKind::Top);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].block_hash, "0xfirst");
        assert_eq!(sink.written(OutputKind::All).len(), 2);
    }

    #[test]
    fn top_bids_are_tracked_per_slot_test() {
        let (processor, sink) = processor();
        let high = CommonBidBuilder::new(SourceType::DataApi, SLOT, 1000).build();
        let low_next_slot = CommonBidBuilder::new(SourceType::DataApi, SLOT + 1, 1).build();

        processor.process_batch(&[high, low_next_slot]).unwrap();

        assert_eq!(sink.written(OutputKind::Top).len(), 2);
    }

    #[test]
    fn end_to_end_scenario_test() {
        let (processor, sink) = processor();
        let first = CommonBidBuilder::new(SourceType::DataApi, SLOT, 100).build();
        let second = CommonBidBuilder::new(SourceType::DataApi, SLOT, 300).build();
        let third = CommonBidBuilder::new(SourceType::UltrasoundStream, SLOT, 200).build();

        processor.process_batch(&[first, second]).unwrap();
        processor.process_batch(&[third]).unwrap();

        assert_eq!(sink.written(OutputKind::All).len(), 3);
        assert_eq!(
            values(&sink.written(OutputKind::Top)),
            vec![U256::from(100), U256::from(300)]
        );
    }

    #[test]
    fn housekeeping_boundary_test() {
        let (processor, _sink) = processor();
        let bids: Vec<CommonBid> = (95..=101)
            .map(|slot| CommonBidBuilder::new(SourceType::DataApi, Slot(slot), 1).build())
            .collect();
        processor.process_batch(&bids).unwrap();

        let evicted = processor.housekeeping(Slot(100)).unwrap();

        assert_eq!(evicted, 3);
        assert_eq!(
            processor.tracked_slots().unwrap(),
            vec![Slot(98), Slot(99), Slot(100), Slot(101)]
        );
        assert!(processor.top_bid(Slot(97)).unwrap().is_none());
        assert!(processor.top_bid(Slot(98)).unwrap().is_some());
    }

    #[test]
    fn sink_failure_is_returned_test() {
        let processor = BidProcessor::new(Arc::new(FailingSink));
        let bid = CommonBidBuilder::new(SourceType::DataApi, SLOT, 1).build();
        assert!(processor.process_batch(&[bid]).is_err());
    }

    #[test]
    fn concurrent_batches_keep_maximum_test() {
        let (processor, sink) = processor();
        let processor = Arc::new(processor);

        let handles: Vec<_> = (0..4u64)
            .map(|thread| {
                let processor = processor.clone();
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let value = i * 4 + thread;
                        let bid = CommonBidBuilder::new(SourceType::DataApi, SLOT, value).build();
                        processor.process_batch(&[bid]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let top = values(&sink.written(OutputKind::Top));
        assert!(top.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(top.last(), Some(&U256::from(199)));
        assert_eq!(sink.written(OutputKind::All).len(), 200);
    }
}
