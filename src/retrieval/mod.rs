//! Request orchestration: type lookup, processor selection, source resolution across
//! tiers, task scheduling and the merge into a sink.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use jiff::Timestamp;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, debug, info, span, warn};
use uuid::Uuid;

use crate::{
    config::RetrievalSettings,
    merge::{MergeDedupConsumer, MergeStats},
    metadata::{LiveMetadata, MetadataJobs},
    partition::{PartitionId, PartitionedEventStream, StreamError, Tier},
    postprocess::{ExtraFields, PostProcessor, find_post_processor, raw, wrap},
    registry::{TypeInfo, TypeRegistry},
    sample::{PayloadType, Sample, SampleValue, StreamDescriptor},
    sink::{Sink, SinkError},
    time::{TimeSpan, year_of, year_start_second},
};

pub mod error;
pub mod profile;
pub mod request;

pub use error::RetrievalError;
pub use profile::Profiler;
pub use request::{RequestParams, RetrievalRequest};

const PING_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalOutcome {
    /// Nothing stored for the request, the sink saw no PV
    NoData,
    Complete(MergeStats),
    /// The sink went away mid request
    SinkDisconnected(MergeStats),
}

/// One tier's share of one requested span
#[derive(Debug, Clone, PartialEq)]
pub struct SourceResolution {
    pub tier: Tier,
    /// clipped to the tier's extent
    pub span: TimeSpan,
}

/// Per span, per tier (in registry order), the part of the span each tier can answer
pub fn resolve_sources(
    type_info: &TypeInfo,
    spans: &[TimeSpan],
) -> Result<Vec<SourceResolution>, RetrievalError> {
    verify_ascending(spans)?;

    let mut out = Vec::new();
    for span in spans {
        for tier in &type_info.tiers {
            let clipped = match &tier.extent {
                Some(extent) => span.clip(extent),
                None => Some(*span),
            };
            match clipped {
                Some(span) => out.push(SourceResolution {
                    tier: tier.clone(),
                    span,
                }),
                None => debug!("tier {} holds nothing in {span}", tier.name),
            }
        }
    }
    Ok(out)
}

fn verify_ascending(spans: &[TimeSpan]) -> Result<(), RetrievalError> {
    for pair in spans.windows(2) {
        if pair[1].start < pair[0].end {
            return Err(RetrievalError::AscendingOrderViolation {
                previous_end: pair[0].end,
                start: pair[1].start,
            });
        }
    }
    Ok(())
}

pub enum RetrievalResult {
    NoData,
    /// In time order
    Streams(Vec<PartitionedEventStream>),
}

/// Opens the partitions of one [`SourceResolution`]
#[derive(Debug, Clone)]
pub struct RetrievalTask {
    pub pv_name: String,
    pub declared: PayloadType,
    pub resolution: SourceResolution,
    pub skip_search: bool,
}

impl RetrievalTask {
    /// Absent and unreadable partitions are skipped. A type mismatch skips the rest of
    /// the tier since every later partition was written the same way.
    pub fn run(&self) -> RetrievalResult {
        let SourceResolution { tier, span } = &self.resolution;
        let ids = match tier.covering(&self.pv_name, span) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("tier {}: cannot list partitions for {span}: {e}", tier.name);
                return RetrievalResult::NoData;
            }
        };

        let mut streams = Vec::new();
        let mut boundary_found = false;
        for (i, id) in ids.iter().enumerate() {
            match self.open(id, span.start, span.end) {
                Opened::Stream(stream) => {
                    boundary_found |= i == 0 && stream.has_boundary();
                    streams.push(stream);
                }
                Opened::Skipped => {}
                Opened::TypeMismatch => return Self::result(streams),
            }
        }

        // the value in force at the start may sit at the end of the bucket before
        if !boundary_found {
            if let Some(Ok(previous)) = ids.first().map(PartitionId::previous) {
                if let Opened::Stream(stream) = self.open(&previous, span.start, span.start) {
                    if stream.has_boundary() {
                        debug!("tier {}: value before {} from the previous bucket", tier.name, span.start);
                        streams.insert(0, stream);
                    }
                }
            }
        }
        Self::result(streams)
    }

    fn result(streams: Vec<PartitionedEventStream>) -> RetrievalResult {
        match streams.is_empty() {
            true => RetrievalResult::NoData,
            false => RetrievalResult::Streams(streams),
        }
    }

    fn open(&self, id: &PartitionId, start: Timestamp, end: Timestamp) -> Opened {
        let tier = &self.resolution.tier;
        let Some(path) = tier.resolve(id) else {
            debug!("tier {}: no {}", tier.name, id.relative_path().display());
            return Opened::Skipped;
        };
        match PartitionedEventStream::open_window(
            &path,
            self.declared,
            &self.pv_name,
            start,
            end,
            self.skip_search,
        ) {
            Ok(stream) if stream.is_finished() => Opened::Skipped,
            Ok(stream) => Opened::Stream(stream),
            Err(e @ StreamError::TypeMismatch { .. }) => {
                warn!("{}: {e}, skipping the rest of tier {}", path.display(), tier.name);
                Opened::TypeMismatch
            }
            Err(e) => {
                warn!("{}: {e}, skipping", path.display());
                Opened::Skipped
            }
        }
    }
}

enum Opened {
    Stream(PartitionedEventStream),
    /// absent, empty or unreadable
    Skipped,
    TypeMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorChoice {
    /// Tasks run inline, one after another
    CurrentThread,
    /// Tasks run on the blocking pool, results are still consumed in order
    WorkerPool,
}

pub fn choose_executor(estimate: u64, settings: &RetrievalSettings) -> ExecutorChoice {
    match settings.parallel_retrieval && estimate > settings.memory_cutoff_bytes() {
        true => ExecutorChoice::WorkerPool,
        false => ExecutorChoice::CurrentThread,
    }
}

enum Scheduled {
    Inline(RetrievalTask),
    Spawned(JoinHandle<RetrievalResult>),
}

impl Scheduled {
    async fn result(self) -> Result<RetrievalResult, RetrievalError> {
        match self {
            Scheduled::Inline(task) => Ok(task.run()),
            Scheduled::Spawned(handle) => Ok(handle.await?),
        }
    }
}

/// Feeds the deduplicated sequence to a consolidating processor
struct ConsolidatingSink<'a> {
    pp: &'a mut dyn PostProcessor,
}

impl Sink for ConsolidatingSink<'_> {
    fn begin_pv(&mut self, _descriptor: &StreamDescriptor) -> Result<(), SinkError> {
        Ok(())
    }

    fn write(&mut self, sample: &Sample) -> Result<(), SinkError> {
        self.pp.consume(sample);
        Ok(())
    }

    fn end(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// `Ok(false)` once the sink has gone away
fn still_connected(result: Result<(), SinkError>) -> Result<bool, SinkError> {
    match result {
        Ok(()) => Ok(true),
        Err(SinkError::Disconnected) => Ok(false),
        Err(e) => Err(e),
    }
}

fn pass_through(
    consumer: &mut MergeDedupConsumer,
    pp: &mut dyn PostProcessor,
    descriptor: &StreamDescriptor,
    stream: PartitionedEventStream,
    sink: &mut dyn Sink,
) -> Result<(), SinkError> {
    consumer.processing_pv(sink, &pp.describe(descriptor))?;
    consumer.consume_stream(wrap(pp, stream), sink)
}

/// Field processors settle their output type on the first value they see, so the PV
/// begins on the first sample that survives the transform
fn field_pass_through(
    consumer: &mut MergeDedupConsumer,
    pp: &mut dyn PostProcessor,
    descriptor: &StreamDescriptor,
    mut stream: PartitionedEventStream,
    sink: &mut dyn Sink,
) -> Result<(), SinkError> {
    let first = loop {
        match stream.next() {
            None => return Ok(()),
            Some(Ok(sample)) => {
                if let Some(out) = pp.transform(sample) {
                    break out;
                }
            }
            Some(Err(e)) => {
                warn!("stream ended early: {e}");
                return Ok(());
            }
        }
    };
    consumer.processing_pv(sink, &pp.describe(descriptor))?;
    consumer.consume_stream(std::iter::once(Ok(first)).chain(wrap(pp, stream)), sink)
}

fn emit_all(
    consumer: &mut MergeDedupConsumer,
    descriptor: &StreamDescriptor,
    samples: &[Sample],
    sink: &mut dyn Sink,
) -> Result<(), SinkError> {
    consumer.processing_pv(sink, descriptor)?;
    for sample in samples {
        consumer.consume(sample, sink)?;
    }
    Ok(())
}

pub struct RetrievalEngine {
    registry: Arc<dyn TypeRegistry>,
    settings: RetrievalSettings,
    live_metadata: Option<Arc<dyn LiveMetadata>>,
    metadata_jobs: MetadataJobs,
}

impl RetrievalEngine {
    pub fn new(registry: Arc<dyn TypeRegistry>, settings: RetrievalSettings) -> Self {
        Self {
            registry,
            settings,
            live_metadata: None,
            metadata_jobs: MetadataJobs::new(),
        }
    }

    pub fn with_live_metadata(mut self, live: Arc<dyn LiveMetadata>) -> Self {
        self.live_metadata = Some(live);
        self
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    pub fn metadata_jobs(&self) -> &MetadataJobs {
        &self.metadata_jobs
    }

    pub async fn retrieve(
        &self,
        request: &RetrievalRequest,
        sink: &mut dyn Sink,
    ) -> Result<RetrievalOutcome, RetrievalError> {
        let span = span!(Level::INFO, "Retrieval", id = %Uuid::now_v7(), pv = %request.pv_name);
        async move {
            let mut profiler = Profiler::new();
            let res = self.run(request, sink, &mut profiler).await;
            profiler.mark("finish");

            match &res {
                Ok(outcome) => info!("{outcome:?} {profiler}"),
                Err(e) => warn!("failed: {e}"),
            }
            if profiler.is_slow(Duration::from_millis(self.settings.slow_request_ms)) {
                warn!("slow request: {profiler}");
            }
            res
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request: &RetrievalRequest,
        sink: &mut dyn Sink,
        profiler: &mut Profiler,
    ) -> Result<RetrievalOutcome, RetrievalError> {
        if request.pv_name == self.settings.ping_pv {
            return self.ping(sink);
        }

        verify_ascending(&request.spans)?;
        let (Some(start), Some(end)) = (request.start(), request.end()) else {
            return Ok(RetrievalOutcome::NoData);
        };

        let (info, field) = self.lookup(&request.pv_name)?;
        let mut pp = self.select_post_processor(request, &info, field)?;
        let caps = pp.capabilities();
        pp.set_window(start, end);
        let estimate = pp.estimate_memory_consumption(&info.pv_name, &info, start, end);
        let executor = choose_executor(estimate, &self.settings);
        debug!("{} estimated at {estimate} bytes, running {executor:?}", pp.identity());

        let live = match (&self.live_metadata, request.fetch_latest_metadata) {
            (Some(live), true) => self.fetch_live_metadata(live.clone(), &info.pv_name).await,
            _ => BTreeMap::new(),
        };

        let tasks: Vec<RetrievalTask> = resolve_sources(&info, &request.spans)?
            .into_iter()
            .map(|resolution| RetrievalTask {
                pv_name: info.pv_name.clone(),
                declared: info.payload_type,
                resolution,
                skip_search: request.skip_search,
            })
            .collect();
        let scheduled: Vec<Scheduled> = match executor {
            ExecutorChoice::CurrentThread => tasks.into_iter().map(Scheduled::Inline).collect(),
            ExecutorChoice::WorkerPool => tasks
                .into_iter()
                .map(|task| Scheduled::Spawned(tokio::task::spawn_blocking(move || task.run())))
                .collect(),
        };
        profiler.mark("setup");

        let mut main = MergeDedupConsumer::new();
        let mut staged = MergeDedupConsumer::new();
        let mut source: Option<StreamDescriptor> = None;
        let mut connected = true;

        // remaining spawned tasks are detached when this loop exits early
        'tasks: for task in scheduled {
            let RetrievalResult::Streams(streams) = task.result().await? else {
                continue;
            };
            for stream in streams {
                let mut descriptor = stream.descriptor().clone();
                descriptor.merge_metadata([&info.metadata, &live]);
                if source.is_none() {
                    source = Some(descriptor.clone());
                }

                let step = match caps.consolidated {
                    true => {
                        let mut into_pp = ConsolidatingSink { pp: pp.as_mut() };
                        staged
                            .processing_pv(&mut into_pp, &descriptor)
                            .and_then(|()| staged.consume_stream(stream, &mut into_pp))
                    }
                    false if caps.extra_field => {
                        field_pass_through(&mut main, pp.as_mut(), &descriptor, stream, sink)
                    }
                    false => pass_through(&mut main, pp.as_mut(), &descriptor, stream, sink),
                };
                if !still_connected(step)? {
                    connected = false;
                    break 'tasks;
                }
            }
        }
        profiler.mark("stream");

        let Some(source) = source else {
            still_connected(sink.end())?;
            return Ok(RetrievalOutcome::NoData);
        };

        if connected && caps.consolidated {
            let samples = pp.consolidated_stream();
            connected = still_connected(emit_all(&mut main, &pp.describe(&source), &samples, sink))?;
        }
        if connected && caps.final_data {
            if let Some(last) = pp.final_sample() {
                connected = still_connected(emit_all(&mut main, &pp.describe(&source), &[last], sink))?;
            }
        }
        if connected {
            connected = still_connected(sink.end())?;
        }
        profiler.mark("postprocess");

        Ok(match connected {
            true => RetrievalOutcome::Complete(main.stats()),
            false => RetrievalOutcome::SinkDisconnected(main.stats()),
        })
    }

    /// At most one fetch per PV is in flight; a request arriving meanwhile goes without
    async fn fetch_live_metadata(&self, live: Arc<dyn LiveMetadata>, pv_name: &str) -> BTreeMap<String, String> {
        let pv = pv_name.to_string();
        let Some(rx) = self
            .metadata_jobs
            .spawn(pv_name, async move { live.fetch(&pv).await })
        else {
            debug!("live metadata for {pv_name} already being fetched");
            return BTreeMap::new();
        };
        match rx.await {
            Ok(fetched) => fetched.map(|m| m.into_iter().collect()).unwrap_or_default(),
            Err(_) => {
                warn!("live metadata job for {pv_name} was aborted");
                BTreeMap::new()
            }
        }
    }

    /// Exact name, then `PV.FIELD` served from `PV`, then the retired PV template
    fn lookup(&self, pv_name: &str) -> Result<(TypeInfo, Option<String>), RetrievalError> {
        if let Some(info) = self.registry.type_info(pv_name) {
            return Ok((info, None));
        }
        if let Some((base, field)) = pv_name.rsplit_once('.') {
            if let Some(info) = self.registry.type_info(base) {
                return Ok((info, Some(field.to_string())));
            }
        }
        if let Some(template) = &self.settings.retired_pv_template {
            if let Some(info) = self.registry.type_info(template) {
                info!("serving {pv_name} with the type info of {template}");
                return Ok((info.renamed(pv_name), None));
            }
        }
        Err(RetrievalError::UnknownPv(pv_name.to_string()))
    }

    fn select_post_processor(
        &self,
        request: &RetrievalRequest,
        info: &TypeInfo,
        field: Option<String>,
    ) -> Result<Box<dyn PostProcessor>, RetrievalError> {
        let identifier = request.post_processor.clone().or_else(|| {
            request
                .use_reduced
                .then(|| self.settings.use_reduced_default.clone())
        });

        if let Some(field) = field {
            if let Some(identifier) = identifier {
                warn!("{identifier} ignored for field {field}");
            }
            let mut pp = ExtraFields::new(field);
            pp.initialize(&request.pv_name, &info.pv_name)?;
            return Ok(Box::new(pp));
        }

        Ok(find_post_processor(
            identifier.as_deref().unwrap_or(raw::NAME),
            &info.pv_name,
        )?)
    }

    /// Synthetic samples for health checks, storage is never touched
    fn ping(&self, sink: &mut dyn Sink) -> Result<RetrievalOutcome, RetrievalError> {
        let year = year_of(Timestamp::now());
        let year_start = year_start_second(year)
            .and_then(Timestamp::from_second)
            .map_err(|source| RetrievalError::InvalidTime {
                input: year.to_string(),
                source,
            })?;

        let descriptor = StreamDescriptor {
            pv_name: self.settings.ping_pv.clone(),
            payload_type: PayloadType::ScalarDouble,
            element_count: 1,
            year,
            source: "ping".to_string(),
            headers: BTreeMap::new(),
        };
        let samples: Vec<Sample> = (0..PING_SAMPLES)
            .filter_map(|i| {
                let ts = year_start
                    .checked_add(jiff::SignedDuration::from_secs(i as i64))
                    .ok()?;
                Some(Sample::new(ts, SampleValue::Double(0.1 * i as f64)))
            })
            .collect();

        let mut main = MergeDedupConsumer::new();
        let connected = still_connected(emit_all(&mut main, &descriptor, &samples, sink))?
            && still_connected(sink.end())?;
        Ok(match connected {
            true => RetrievalOutcome::Complete(main.stats()),
            false => RetrievalOutcome::SinkDisconnected(main.stats()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use futures_util::future::BoxFuture;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        partition::{
            Granularity,
            testing::{int_samples, write_partitions},
        },
        registry::StaticTypeRegistry,
        sample::FieldValue,
        sink::VecSink,
        time::parse_instant,
    };

    fn ts(s: &str) -> Timestamp {
        parse_instant(s).unwrap()
    }

    fn tier(dir: &TempDir, name: &str, granularity: Granularity) -> Tier {
        Tier {
            name: name.into(),
            root: dir.path().join(name),
            granularity,
            extent: None,
        }
    }

    fn type_info(pv: &str, tiers: Vec<Tier>) -> TypeInfo {
        TypeInfo {
            pv_name: pv.into(),
            payload_type: PayloadType::ScalarInt,
            element_count: 1,
            sampling_period_secs: 60.0,
            tiers,
            metadata: Default::default(),
        }
    }

    fn engine(infos: Vec<TypeInfo>, settings: RetrievalSettings) -> RetrievalEngine {
        RetrievalEngine::new(Arc::new(StaticTypeRegistry::new(infos)), settings)
    }

    /// three hours of one minute samples from 10:00, value = minute index
    fn minutes() -> Vec<Sample> {
        int_samples(ts("2024-06-01T10:00:00Z"), 60_000, 180)
    }

    /// `lts` (daily) holds the first two hours, `sts` (hourly) the last two
    fn two_tiers(dir: &TempDir) -> TypeInfo {
        let lts = tier(dir, "lts", Granularity::Day);
        let sts = tier(dir, "sts", Granularity::Hour);
        let all = minutes();
        write_partitions(&lts, "PV", PayloadType::ScalarInt, &all[..120]);
        write_partitions(&sts, "PV", PayloadType::ScalarInt, &all[60..]);
        type_info("PV", vec![lts, sts])
    }

    fn values(sink: &VecSink) -> Vec<i32> {
        sink.samples()
            .map(|s| match s.value {
                SampleValue::Int(v) => v,
                ref other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_overlapping_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(vec![two_tiers(&dir)], RetrievalSettings::default());
        let mut sink = VecSink::new();

        let req = RetrievalRequest::new("PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T12:59:00Z")).unwrap();
        let outcome = engine.retrieve(&req, &mut sink).await.unwrap();

        assert_eq!(values(&sink), (0..180).collect::<Vec<_>>());
        assert_eq!(
            outcome,
            RetrievalOutcome::Complete(MergeStats {
                total: 180,
                skipped: 60,
                compared: 240,
            })
        );
        assert_eq!(sink.pvs.len(), 1);
        assert_eq!(sink.pvs[0].0.pv_name, "PV");
        assert!(sink.ended);
    }

    #[tokio::test]
    async fn test_sample_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(vec![two_tiers(&dir)], RetrievalSettings::default());
        let mut sink = VecSink::new();

        let req = RetrievalRequest::new("PV", ts("2024-06-01T10:29:30Z"), ts("2024-06-01T10:35:00Z")).unwrap();
        engine.retrieve(&req, &mut sink).await.unwrap();
        assert_eq!(values(&sink), (29..=35).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_value_from_previous_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let sts = tier(&dir, "sts", Granularity::Hour);
        write_partitions(&sts, "PV", PayloadType::ScalarInt, &minutes()[..150]);
        let sparse = tier(&dir, "sparse", Granularity::Hour);
        write_partitions(&sparse, "SPARSE", PayloadType::ScalarInt, &minutes()[..90]);
        let engine = engine(
            vec![type_info("PV", vec![sts]), type_info("SPARSE", vec![sparse])],
            RetrievalSettings::default(),
        );

        // window opens on a bucket boundary, 11:59 is in the bucket before
        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("PV", ts("2024-06-01T12:00:00Z"), ts("2024-06-01T12:10:00Z")).unwrap();
        engine.retrieve(&req, &mut sink).await.unwrap();
        assert_eq!(values(&sink), (119..=130).collect::<Vec<_>>());

        // nothing stored in the window's bucket at all
        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("SPARSE", ts("2024-06-01T12:00:00Z"), ts("2024-06-01T12:30:00Z")).unwrap();
        engine.retrieve(&req, &mut sink).await.unwrap();
        assert_eq!(values(&sink), [89]);
    }

    #[tokio::test]
    async fn test_mismatched_tier_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = two_tiers(&dir);
        let odd = tier(&dir, "odd", Granularity::Hour);
        let doubles: Vec<Sample> = minutes()
            .into_iter()
            .map(|s| Sample::new(s.timestamp, SampleValue::Double(-1.0)))
            .collect();
        write_partitions(&odd, "PV", PayloadType::ScalarDouble, &doubles);
        info.tiers.insert(0, odd);

        let engine = engine(vec![info], RetrievalSettings::default());
        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T12:59:00Z")).unwrap();
        let outcome = engine.retrieve(&req, &mut sink).await.unwrap();

        assert_eq!(values(&sink), (0..180).collect::<Vec<_>>());
        assert!(matches!(outcome, RetrievalOutcome::Complete(_)));
    }

    #[tokio::test]
    async fn test_corrupt_partition_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let info = two_tiers(&dir);
        let sts = &info.tiers[1];
        let id = crate::partition::PartitionId::for_instant("PV", ts("2024-06-01T11:00:00Z"), sts.granularity)
            .unwrap();
        std::fs::write(sts.root.join(id.relative_path()), b"\x1bZgarbage\n").unwrap();

        let engine = engine(vec![info], RetrievalSettings::default());
        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T12:59:00Z")).unwrap();
        engine.retrieve(&req, &mut sink).await.unwrap();

        // lts still covers the hour that went missing
        assert_eq!(values(&sink), (0..180).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(vec![two_tiers(&dir)], RetrievalSettings::default());
        let mut sink = VecSink::new();

        let req = RetrievalRequest::new("PV", ts("2023-06-01T10:00:00Z"), ts("2023-06-01T12:00:00Z")).unwrap();
        let outcome = engine.retrieve(&req, &mut sink).await.unwrap();
        assert_eq!(outcome, RetrievalOutcome::NoData);
        assert!(sink.pvs.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_pv() {
        let engine = engine(vec![], RetrievalSettings::default());
        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("NOPE", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T11:00:00Z")).unwrap();
        assert!(matches!(
            engine.retrieve(&req, &mut sink).await,
            Err(RetrievalError::UnknownPv(pv)) if pv == "NOPE"
        ));
    }

    #[tokio::test]
    async fn test_retired_pv_template() {
        let dir = tempfile::tempdir().unwrap();
        let lts = tier(&dir, "lts", Granularity::Day);
        write_partitions(&lts, "OLD:PV", PayloadType::ScalarInt, &minutes()[..10]);

        let settings = RetrievalSettings {
            retired_pv_template: Some("TEMPLATE".into()),
            ..Default::default()
        };
        let engine = engine(vec![type_info("TEMPLATE", vec![lts])], settings);
        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("OLD:PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T11:00:00Z")).unwrap();
        engine.retrieve(&req, &mut sink).await.unwrap();

        assert_eq!(values(&sink), (0..10).collect::<Vec<_>>());
        assert_eq!(sink.pvs[0].0.pv_name, "OLD:PV");
    }

    #[tokio::test]
    async fn test_optimized() {
        let dir = tempfile::tempdir().unwrap();
        let lts = tier(&dir, "lts", Granularity::Day);
        write_partitions(
            &lts,
            "PV",
            PayloadType::ScalarInt,
            &int_samples(ts("2024-06-01T10:00:00Z"), 60_000, 1440),
        );
        let engine = engine(vec![type_info("PV", vec![lts])], RetrievalSettings::default());

        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-02T10:00:00Z"))
            .unwrap()
            .with_post_processor("optimized_160");
        let outcome = engine.retrieve(&req, &mut sink).await.unwrap();

        assert_eq!(sink.samples().count(), 161);
        assert_eq!(sink.pvs[0].0.payload_type, PayloadType::WaveformDouble);
        assert_eq!(sink.pvs[0].0.element_count, 5);
        let RetrievalOutcome::Complete(stats) = outcome else {
            panic!("{outcome:?}");
        };
        assert_eq!(stats.total, 161);

        let mut sink = VecSink::new();
        let req = req.with_post_processor("optimized_10000");
        engine.retrieve(&req, &mut sink).await.unwrap();
        assert_eq!(sink.samples().count(), 1440);
        assert_eq!(sink.pvs[0].0.payload_type, PayloadType::ScalarInt);
    }

    #[tokio::test]
    async fn test_last_fill() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(vec![two_tiers(&dir)], RetrievalSettings::default());
        let mut sink = VecSink::new();

        let end = ts("2024-06-01T14:00:00Z");
        let req = RetrievalRequest::new("PV", ts("2024-06-01T12:00:00Z"), end)
            .unwrap()
            .with_post_processor("lastFill");
        engine.retrieve(&req, &mut sink).await.unwrap();

        // 11:59 from before the start, the hour from 12:00, then the fill
        let got: Vec<_> = sink.samples().collect();
        assert_eq!(got.len(), 62);
        assert_eq!(got[0].value, SampleValue::Int(119));
        assert_eq!(got[61].timestamp, end);
        assert_eq!(got[61].value, SampleValue::Int(179));
    }

    #[tokio::test]
    async fn test_reduced_default() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(vec![two_tiers(&dir)], RetrievalSettings::default());
        let mut sink = VecSink::new();

        let mut req = RetrievalRequest::new("PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T12:59:00Z")).unwrap();
        req.use_reduced = true;
        engine.retrieve(&req, &mut sink).await.unwrap();
        // one sample per 15 minutes
        assert_eq!(values(&sink), (0..180).step_by(15).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_field_request() {
        let dir = tempfile::tempdir().unwrap();
        let lts = tier(&dir, "lts", Granularity::Day);
        let mut samples = minutes()[..5].to_vec();
        samples[1].fields.push(FieldValue {
            name: "HIHI".into(),
            value: "42.5".into(),
        });
        write_partitions(&lts, "PV", PayloadType::ScalarInt, &samples);
        let engine = engine(vec![type_info("PV", vec![lts])], RetrievalSettings::default());

        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("PV.HIHI", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T11:00:00Z")).unwrap();
        engine.retrieve(&req, &mut sink).await.unwrap();

        assert_eq!(sink.pvs[0].0.pv_name, "PV.HIHI");
        assert_eq!(sink.pvs[0].0.payload_type, PayloadType::ScalarDouble);
        let got: Vec<_> = sink.samples().map(|s| s.value.clone()).collect();
        assert_eq!(got, vec![SampleValue::Double(42.5); 4]);
    }

    #[tokio::test]
    async fn test_text_field_request() {
        let dir = tempfile::tempdir().unwrap();
        let lts = tier(&dir, "lts", Granularity::Day);
        let mut samples = minutes()[..5].to_vec();
        samples[2].fields.push(FieldValue {
            name: "DESC".into(),
            value: "inlet".into(),
        });
        write_partitions(&lts, "PV", PayloadType::ScalarInt, &samples);
        let engine = engine(vec![type_info("PV", vec![lts])], RetrievalSettings::default());

        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("PV.DESC", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T11:00:00Z")).unwrap();
        engine.retrieve(&req, &mut sink).await.unwrap();

        // the descriptor matches the samples that follow it
        assert_eq!(sink.pvs.len(), 1);
        assert_eq!(sink.pvs[0].0.payload_type, PayloadType::ScalarString);
        let got: Vec<_> = sink.samples().map(|s| s.value.clone()).collect();
        assert_eq!(got, vec![SampleValue::String("inlet".into()); 3]);
    }

    #[tokio::test]
    async fn test_sink_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(vec![two_tiers(&dir)], RetrievalSettings::default());
        let mut sink = VecSink::disconnecting_after(5);

        let req = RetrievalRequest::new("PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T12:59:00Z")).unwrap();
        let outcome = engine.retrieve(&req, &mut sink).await.unwrap();
        let RetrievalOutcome::SinkDisconnected(stats) = outcome else {
            panic!("{outcome:?}");
        };
        assert_eq!(stats.total, 5);
        assert!(!sink.ended);
    }

    #[tokio::test]
    async fn test_ping() {
        let engine = engine(vec![], RetrievalSettings::default());
        let mut sink = VecSink::new();
        let req = RetrievalRequest::new("ArchApplPingPV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T11:00:00Z")).unwrap();
        let outcome = engine.retrieve(&req, &mut sink).await.unwrap();

        assert!(matches!(outcome, RetrievalOutcome::Complete(MergeStats { total: 10, .. })));
        assert_eq!(sink.pvs[0].0.payload_type, PayloadType::ScalarDouble);
        let got: Vec<_> = sink.samples().filter_map(|s| s.value.as_f64()).collect();
        assert_eq!(got.len(), 10);
        assert!((got[9] - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_choose_executor() {
        let mut settings = RetrievalSettings::default();
        let big = settings.memory_cutoff_bytes() + 1;
        assert_eq!(choose_executor(big, &settings), ExecutorChoice::CurrentThread);

        settings.parallel_retrieval = true;
        assert_eq!(choose_executor(big, &settings), ExecutorChoice::WorkerPool);
        assert_eq!(choose_executor(1024, &settings), ExecutorChoice::CurrentThread);
    }

    #[tokio::test]
    async fn test_worker_pool_same_output() {
        let dir = tempfile::tempdir().unwrap();
        let info = two_tiers(&dir);
        let req = RetrievalRequest::new("PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T12:59:00Z")).unwrap();

        let mut inline = VecSink::new();
        let a = engine(vec![info.clone()], RetrievalSettings::default())
            .retrieve(&req, &mut inline)
            .await
            .unwrap();

        let parallel = RetrievalSettings {
            parallel_retrieval: true,
            memory_cutoff_mb: 0,
            ..Default::default()
        };
        let mut pooled = VecSink::new();
        let b = engine(vec![info], parallel).retrieve(&req, &mut pooled).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(inline.pvs, pooled.pvs);
    }

    #[tokio::test]
    async fn test_unordered_spans_fail_first() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(vec![two_tiers(&dir)], RetrievalSettings::default());
        let mut req = RetrievalRequest::new("PV", ts("2024-06-01T11:00:00Z"), ts("2024-06-01T12:00:00Z")).unwrap();
        req.spans.push(TimeSpan {
            start: ts("2024-06-01T10:00:00Z"),
            end: ts("2024-06-01T10:30:00Z"),
        });

        let mut sink = VecSink::new();
        assert!(matches!(
            engine.retrieve(&req, &mut sink).await,
            Err(RetrievalError::AscendingOrderViolation { .. })
        ));
        assert!(sink.pvs.is_empty());
        assert!(!sink.ended);
    }

    #[test]
    fn test_resolve_clips_to_extent() {
        let dir = tempfile::tempdir().unwrap();
        let mut lts = tier(&dir, "lts", Granularity::Day);
        lts.extent = TimeSpan::new(ts("2024-01-01T00:00:00Z"), ts("2024-06-01T11:00:00Z"));
        let mut sts = tier(&dir, "sts", Granularity::Hour);
        sts.extent = TimeSpan::new(ts("2024-06-01T11:00:00Z"), ts("2025-01-01T00:00:00Z"));
        let info = type_info("PV", vec![lts, sts]);

        let spans = [
            TimeSpan::new(ts("2024-06-01T10:00:00Z"), ts("2024-06-01T10:30:00Z")).unwrap(),
            TimeSpan::new(ts("2024-06-01T10:45:00Z"), ts("2024-06-01T12:00:00Z")).unwrap(),
        ];
        let resolved = resolve_sources(&info, &spans).unwrap();
        let got: Vec<_> = resolved
            .iter()
            .map(|r| (r.tier.name.as_str(), r.span.start, r.span.end))
            .collect();
        assert_eq!(
            got,
            vec![
                ("lts", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T10:30:00Z")),
                ("lts", ts("2024-06-01T10:45:00Z"), ts("2024-06-01T11:00:00Z")),
                ("sts", ts("2024-06-01T11:00:00Z"), ts("2024-06-01T12:00:00Z")),
            ]
        );
    }

    struct StaticMetadata(HashMap<String, String>);

    impl LiveMetadata for StaticMetadata {
        fn fetch<'a>(&'a self, _pv_name: &'a str) -> BoxFuture<'a, Option<HashMap<String, String>>> {
            Box::pin(async move { Some(self.0.clone()) })
        }
    }

    #[tokio::test]
    async fn test_metadata_layers() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = two_tiers(&dir);
        info.metadata.insert("EGU".into(), "degC".into());
        info.metadata.insert("PREC".into(), "2".into());
        let live = StaticMetadata(HashMap::from([("PREC".to_string(), "3".to_string())]));
        let engine = engine(vec![info], RetrievalSettings::default()).with_live_metadata(Arc::new(live));

        let mut req = RetrievalRequest::new("PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T10:10:00Z")).unwrap();
        let mut sink = VecSink::new();
        engine.retrieve(&req, &mut sink).await.unwrap();
        assert_eq!(sink.pvs[0].0.headers["PREC"], "2");

        req.fetch_latest_metadata = true;
        let mut sink = VecSink::new();
        engine.retrieve(&req, &mut sink).await.unwrap();
        let headers = &sink.pvs[0].0.headers;
        assert_eq!(headers["EGU"], "degC");
        assert_eq!(headers["PREC"], "3");
        assert_eq!(engine.metadata_jobs().pending(), 0);
    }

    struct SlowMetadata {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl LiveMetadata for SlowMetadata {
        fn fetch<'a>(&'a self, _pv_name: &'a str) -> BoxFuture<'a, Option<HashMap<String, String>>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some(HashMap::from([("PREC".to_string(), "3".to_string())]))
            })
        }
    }

    #[tokio::test]
    async fn test_one_metadata_fetch_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let live = Arc::new(SlowMetadata {
            calls: Default::default(),
        });
        let engine = engine(vec![two_tiers(&dir)], RetrievalSettings::default()).with_live_metadata(live.clone());

        let mut req = RetrievalRequest::new("PV", ts("2024-06-01T10:00:00Z"), ts("2024-06-01T10:10:00Z")).unwrap();
        req.fetch_latest_metadata = true;
        let (mut first, mut second) = (VecSink::new(), VecSink::new());
        let (a, b) = tokio::join!(engine.retrieve(&req, &mut first), engine.retrieve(&req, &mut second));
        a.unwrap();
        b.unwrap();

        assert_eq!(live.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        // the first request owns the fetch, the second is served without it
        assert_eq!(first.pvs[0].0.headers.get("PREC").map(String::as_str), Some("3"));
        assert!(!second.pvs[0].0.headers.contains_key("PREC"));
        assert_eq!(values(&first), values(&second));
        assert_eq!(engine.metadata_jobs().pending(), 0);
    }
}
