//! Wires the sources to the bid processor. Each source gets its own bounded channel, a single
//! loop takes batches off all of them and hands them to the processor.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{interval, timeout, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    beacon_chain::{BeaconNode, BeaconNodeHttp, Slot},
    bids::{BidProcessor, BidSink, RotatingFileSink, SourceType},
    config::CollectorConfig,
    relays::{RelayApi, RelayApiHttp},
    sources::{
        BidBatch, BidReceiver, BidSender, DataApiPoller, GetHeaderPoller, UltrasoundStreamClient,
    },
};

pub const CHANNEL_CAPACITY: usize = 1000;

/// How long sources get to wind down after cancellation before they are aborted.
const SOURCE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct BidReceivers {
    data_api: BidReceiver,
    get_header: BidReceiver,
    ultrasound_stream: BidReceiver,
}

impl BidReceivers {
    fn all_mut(&mut self) -> [&mut BidReceiver; 3] {
        [
            &mut self.data_api,
            &mut self.get_header,
            &mut self.ultrasound_stream,
        ]
    }
}

struct BidSenders {
    data_api: BidSender,
    get_header: BidSender,
    ultrasound_stream: BidSender,
}

fn bid_channels() -> (BidSenders, BidReceivers) {
    let (data_api_tx, data_api_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (get_header_tx, get_header_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (ultrasound_stream_tx, ultrasound_stream_rx) = mpsc::channel(CHANNEL_CAPACITY);

    (
        BidSenders {
            data_api: data_api_tx,
            get_header: get_header_tx,
            ultrasound_stream: ultrasound_stream_tx,
        },
        BidReceivers {
            data_api: data_api_rx,
            get_header: get_header_rx,
            ultrasound_stream: ultrasound_stream_rx,
        },
    )
}

pub struct Collector {
    config: CollectorConfig,
    processor: BidProcessor,
    relay_apis: Vec<Arc<dyn RelayApi>>,
    beacon_node: Option<Arc<dyn BeaconNode>>,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Result<Self> {
        config.validate()?;

        let sink = RotatingFileSink::new(config.sink_config())?;

        let relay_apis = config
            .relays
            .iter()
            .map(|relay| {
                RelayApiHttp::new(relay.clone(), config.http_timeout)
                    .map(|relay_api| Arc::new(relay_api) as Arc<dyn RelayApi>)
            })
            .collect::<Result<Vec<_>>>()?;

        let beacon_node = match (config.is_enabled(SourceType::GetHeader), &config.beacon_url) {
            (true, Some(beacon_url)) => Some(
                Arc::new(BeaconNodeHttp::new(beacon_url, config.http_timeout)?)
                    as Arc<dyn BeaconNode>,
            ),
            _ => None,
        };

        Ok(Self::with_parts(
            config,
            Arc::new(sink),
            relay_apis,
            beacon_node,
        ))
    }

    pub fn with_parts(
        config: CollectorConfig,
        sink: Arc<dyn BidSink>,
        relay_apis: Vec<Arc<dyn RelayApi>>,
        beacon_node: Option<Arc<dyn BeaconNode>>,
    ) -> Self {
        Self {
            config,
            processor: BidProcessor::new(sink),
            relay_apis,
            beacon_node,
        }
    }

    pub fn processor(&self) -> &BidProcessor {
        &self.processor
    }

    /// Collects until cancelled, then processes what the sources already delivered and flushes
    /// the output. Only returns an error when bids can no longer be written.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let (senders, mut receivers) = bid_channels();

        let sources_cancel = cancel.child_token();
        let mut sources = self.spawn_sources(senders, &sources_cancel)?;

        let result = self.process_until_cancelled(&mut receivers, &cancel).await;
        sources_cancel.cancel();

        if let Err(err) = result {
            error!(?err, "failed to process bids, stopping collector");
            sources.abort_all();
            return Err(err);
        }

        info!("stopping collector, draining buffered bids");

        // Sources blocked on a full channel need room before they notice cancellation.
        self.drain(&mut receivers)?;

        let sources_stopped = timeout(SOURCE_SHUTDOWN_TIMEOUT, async {
            while let Some(joined) = sources.join_next().await {
                if let Err(err) = joined {
                    warn!(?err, "bid source task failed");
                }
            }
        })
        .await;
        if sources_stopped.is_err() {
            warn!("bid sources did not stop in time, aborting them");
            sources.abort_all();
        }

        self.drain(&mut receivers)?;
        self.processor.shutdown()?;

        let stats = self.processor.stats()?;
        info!(
            bids_received = stats.bids_received,
            unique_bids = stats.unique_bids,
            top_bids = stats.top_bids,
            "collector stopped"
        );

        Ok(())
    }

    fn spawn_sources(
        &self,
        senders: BidSenders,
        cancel: &CancellationToken,
    ) -> Result<JoinSet<()>> {
        let mut sources = JoinSet::new();

        // Senders of disabled sources are dropped here, their receivers simply stay empty.
        if self.config.is_enabled(SourceType::DataApi) {
            let poller = DataApiPoller::new(self.relay_apis.clone(), senders.data_api);
            sources.spawn(poller.run(cancel.clone()));
        }

        if self.config.is_enabled(SourceType::GetHeader) {
            let beacon_node = self
                .beacon_node
                .clone()
                .ok_or_else(|| anyhow!("a beacon node is required to collect get-header bids"))?;
            let poller = GetHeaderPoller::new(
                beacon_node,
                self.relay_apis.clone(),
                self.config.get_header_known_errors.clone(),
                senders.get_header,
            );
            sources.spawn(poller.run(cancel.clone()));
        }

        if self.config.is_enabled(SourceType::UltrasoundStream) {
            let client = UltrasoundStreamClient::new(
                &self.config.ultrasound_stream_url,
                &self.config.ultrasound_stream_relay,
                senders.ultrasound_stream,
            );
            sources.spawn(client.run(cancel.clone()));
        }

        info!(sources = ?self.config.sources, "started bid sources");

        Ok(sources)
    }

    async fn process_until_cancelled(
        &self,
        receivers: &mut BidReceivers,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut housekeeping = interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),
                Some(batch) = receivers.data_api.recv() => self.process(batch)?,
                Some(batch) = receivers.get_header.recv() => self.process(batch)?,
                Some(batch) = receivers.ultrasound_stream.recv() => self.process(batch)?,
                _ = housekeeping.tick() => self.housekeeping()?,
            }
        }
    }

    fn process(&self, batch: BidBatch) -> Result<()> {
        self.processor
            .process_batch(&batch)
            .context("failed to process bid batch")
    }

    fn housekeeping(&self) -> Result<()> {
        let evicted = self.processor.housekeeping(Slot::now())?;
        let stats = self.processor.stats()?;

        info!(
            bids_received = stats.bids_received,
            unique_bids = stats.unique_bids,
            top_bids = stats.top_bids,
            tracked_slots = stats.tracked_slots,
            evicted,
            "bid collection progress"
        );

        Ok(())
    }

    /// Processes every batch already waiting in the channels without waiting for more.
    fn drain(&self, receivers: &mut BidReceivers) -> Result<()> {
        let mut drained = 0;

        for receiver in receivers.all_mut() {
            while let Ok(batch) = receiver.try_recv() {
                self.process(batch)?;
                drained += 1;
            }
        }

        debug!(drained, "drained buffered bid batches");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::bids::{test_utils::CommonBidBuilder, OutputKind, RecordingSink};

    use super::*;

    fn stream_only_config() -> CollectorConfig {
        CollectorConfig {
            sources: vec![SourceType::UltrasoundStream],
            // Nothing listens here, the client keeps backing off until cancelled.
            ultrasound_stream_url: "ws://127.0.0.1:1/ws/v1/top_bid".to_string(),
            ..CollectorConfig::default()
        }
    }

    #[tokio::test]
    async fn drain_processes_buffered_batches_test() {
        let sink = Arc::new(RecordingSink::default());
        let collector = Collector::with_parts(stream_only_config(), sink.clone(), vec![], None);
        let (senders, mut receivers) = bid_channels();
        let slot = Slot(6591598);

        senders
            .data_api
            .send(vec![
                CommonBidBuilder::new(SourceType::DataApi, slot, 100).build(),
                CommonBidBuilder::new(SourceType::DataApi, slot, 300).build(),
            ])
            .await
            .unwrap();
        senders
            .ultrasound_stream
            .send(vec![
                CommonBidBuilder::new(SourceType::UltrasoundStream, slot, 200).build(),
            ])
            .await
            .unwrap();

        collector.drain(&mut receivers).unwrap();

        assert_eq!(sink.written(OutputKind::All).len(), 3);
        assert_eq!(sink.written(OutputKind::Top).len(), 2);
    }

    #[tokio::test]
    async fn processes_batches_until_cancelled_test() {
        let sink = Arc::new(RecordingSink::default());
        let collector = Collector::with_parts(stream_only_config(), sink.clone(), vec![], None);
        let (senders, mut receivers) = bid_channels();
        let slot = Slot::now();

        senders
            .get_header
            .send(vec![
                CommonBidBuilder::new(SourceType::GetHeader, slot, 1).build(),
            ])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let cancel_later = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_later.cancel();
        });

        collector
            .process_until_cancelled(&mut receivers, &cancel)
            .await
            .unwrap();

        assert_eq!(sink.written(OutputKind::All).len(), 1);
        assert_eq!(collector.processor().tracked_slots().unwrap(), vec![slot]);
    }

    #[tokio::test]
    async fn run_shuts_down_on_cancel_test() {
        let sink = Arc::new(RecordingSink::default());
        let collector = Collector::with_parts(stream_only_config(), sink.clone(), vec![], None);

        let cancel = CancellationToken::new();
        let cancel_later = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_later.cancel();
        });

        collector.run(cancel).await.unwrap();

        assert_eq!(*sink.flushes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn get_header_requires_beacon_node_test() {
        let collector = Collector::with_parts(
            CollectorConfig {
                sources: vec![SourceType::GetHeader],
                ..CollectorConfig::default()
            },
            Arc::new(RecordingSink::default()),
            vec![],
            None,
        );

        let result = collector.run(CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[test]
    fn new_rejects_invalid_config_test() {
        let result = Collector::new(CollectorConfig {
            sources: vec![],
            ..CollectorConfig::default()
        });
        assert!(result.is_err());
    }
}
