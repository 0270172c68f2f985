//! Live metadata: values read from the control system at request time and layered over
//! what the partitions recorded.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use futures_util::future::BoxFuture;
use tokio::{sync::oneshot, task::AbortHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::sample::SampleValue;

/// Current metadata for a PV, merged into its descriptor before samples go out.
/// `None` means nothing could be fetched and never fails a request.
pub trait LiveMetadata: Send + Sync {
    fn fetch<'a>(&'a self, pv_name: &'a str) -> BoxFuture<'a, Option<HashMap<String, String>>>;
}

/// Reads one channel (ie. `ROOM:TEMP.NAME$`) from the control system
pub trait FieldReader: Send + Sync {
    fn read<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Option<SampleValue>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaInfo {
    pub alias: Option<String>,
    pub other: BTreeMap<String, String>,
}

fn fmt_double(v: f64) -> String {
    format!("{v:?}")
}

impl MetaInfo {
    /// `NAME$` is a byte vector holding a NUL terminated name, `NAME` a string
    pub fn parse_alias(&mut self, pv_name: &str, value: &SampleValue) {
        match value {
            SampleValue::String(name) => {
                self.alias = Some(name.clone());
                self.other.insert("NAME".to_string(), name.clone());
            }
            SampleValue::StringVec(_) => {
                let name = value.to_string();
                if name != pv_name {
                    self.alias = Some(name);
                }
            }
            SampleValue::ByteVec(_)
            | SampleValue::ShortVec(_)
            | SampleValue::EnumVec(_)
            | SampleValue::IntVec(_)
            | SampleValue::FloatVec(_)
            | SampleValue::DoubleVec(_) => match nul_terminated(value) {
                Some(name) => {
                    self.alias = Some(name.clone());
                    self.other.insert("NAME".to_string(), name);
                }
                None => error!("NAME$ of {pv_name} is not a NUL terminated name"),
            },
            scalar => {
                if let Some(v) = scalar.as_f64() {
                    self.alias = Some(fmt_double(v));
                }
            }
        }
    }

    pub fn add_field(&mut self, field: &str, value: &SampleValue) {
        let text = match value {
            _ if field.ends_with("RTYP") => value.to_string(),
            SampleValue::String(s) => s.clone(),
            SampleValue::StringVec(_) => value.to_string(),
            v => match v.as_f64() {
                Some(d) => fmt_double(d),
                None => return,
            },
        };
        self.other.insert(field.to_string(), text);
    }
}

fn nul_terminated(value: &SampleValue) -> Option<String> {
    let bytes: Vec<u8> = match value {
        SampleValue::ByteVec(v) => v.clone(),
        SampleValue::ShortVec(v) | SampleValue::EnumVec(v) => v.iter().map(|b| *b as u8).collect(),
        SampleValue::IntVec(v) => v.iter().map(|b| *b as u8).collect(),
        SampleValue::FloatVec(v) => v.iter().map(|b| *b as u8).collect(),
        SampleValue::DoubleVec(v) => v.iter().map(|b| *b as u8).collect(),
        _ => return None,
    };
    let end = bytes.iter().position(|b| *b == 0)?;
    String::from_utf8(bytes[..end].to_vec()).ok()
}

/// Reads the alias (`NAME$`, falling back to `NAME`) and every requested field of `pv_name`
pub async fn collect_meta_info(reader: &dyn FieldReader, pv_name: &str, fields: &[String]) -> MetaInfo {
    let mut info = MetaInfo::default();

    let alias = match reader.read(&format!("{pv_name}.NAME$")).await {
        Some(v) => Some(v),
        None => reader.read(&format!("{pv_name}.NAME")).await,
    };
    match alias {
        Some(v) => info.parse_alias(pv_name, &v),
        None => warn!("could not read NAME of {pv_name}"),
    }

    for field in fields {
        match reader.read(&format!("{pv_name}.{field}")).await {
            Some(v) => info.add_field(field, &v),
            None => warn!("could not read {field} of {pv_name}"),
        }
    }
    info
}

/// [`LiveMetadata`] backed by a control system reader
pub struct ChannelMetadata {
    reader: Arc<dyn FieldReader>,
    fields: Vec<String>,
}

impl ChannelMetadata {
    pub fn new(reader: Arc<dyn FieldReader>, fields: Vec<String>) -> Self {
        Self { reader, fields }
    }
}

impl LiveMetadata for ChannelMetadata {
    fn fetch<'a>(&'a self, pv_name: &'a str) -> BoxFuture<'a, Option<HashMap<String, String>>> {
        Box::pin(async move {
            let info = collect_meta_info(self.reader.as_ref(), pv_name, &self.fields).await;
            match info.other.is_empty() {
                true => None,
                false => Some(info.other.into_iter().collect()),
            }
        })
    }
}

struct Job {
    id: Uuid,
    handle: AbortHandle,
}

/// In-flight metadata collections, at most one per PV
#[derive(Clone, Default)]
pub struct MetadataJobs {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
}

fn lock(jobs: &Mutex<HashMap<String, Job>>) -> MutexGuard<'_, HashMap<String, Job>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetadataJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a collection for `pv_name` unless one is already running
    pub fn start(
        &self,
        pv_name: &str,
        fields: Vec<String>,
        reader: Arc<dyn FieldReader>,
    ) -> Option<oneshot::Receiver<MetaInfo>> {
        let pv = pv_name.to_string();
        self.spawn(pv_name, async move {
            collect_meta_info(reader.as_ref(), &pv, &fields).await
        })
    }

    /// Spawns `job` for `pv_name` unless one is already running, `None` then.
    /// The job removes itself from the table when it completes.
    pub fn spawn<T, F>(&self, pv_name: &str, job: F) -> Option<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut jobs = lock(&self.jobs);
        if jobs.contains_key(pv_name) {
            debug!("metadata job for {pv_name} already running");
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let id = Uuid::now_v7();
        let table = self.jobs.clone();
        let pv = pv_name.to_string();
        let handle = tokio::spawn(async move {
            let out = job.await;
            {
                let mut jobs = lock(&table);
                if jobs.get(&pv).is_some_and(|job| job.id == id) {
                    jobs.remove(&pv);
                }
            }
            // requester may have stopped waiting
            let _ = tx.send(out);
        });

        jobs.insert(
            pv_name.to_string(),
            Job {
                id,
                handle: handle.abort_handle(),
            },
        );
        Some(rx)
    }

    /// `true` if a job was running for `pv_name`
    pub fn abort(&self, pv_name: &str) -> bool {
        match lock(&self.jobs).remove(pv_name) {
            Some(job) => {
                job.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.jobs).len()
    }
}
