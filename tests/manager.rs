//! End-to-end manager scenarios: imports, background tagging, merging,
//! converter delegation and state persistence.

use chrono::{TimeZone, Utc};
use flowdex::index::{
    next_index_filename, write_index_file, Converter, ConverterSearchData, IndexBuilder,
    IndexReader, IndexResult, PcapInfo, Protocol, StreamChunk, StreamEntry,
};
use flowdex::query::Direction;
use flowdex::{Config, Manager, ManagerError, UpdateTagOperation};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "flowdex=debug".into()),
        )
        .try_init();
}

fn entry(stream_id: u64, c2s: &[u8], s2c: &[u8]) -> StreamEntry {
    let mut chunks = Vec::new();
    if !c2s.is_empty() {
        chunks.push(StreamChunk {
            direction: Direction::ClientToServer,
            data: c2s.to_vec(),
        });
    }
    if !s2c.is_empty() {
        chunks.push(StreamChunk {
            direction: Direction::ServerToClient,
            data: s2c.to_vec(),
        });
    }
    StreamEntry {
        stream_id,
        client_host: "10.0.0.1".to_string(),
        server_host: "10.0.0.2".to_string(),
        client_port: 40000,
        server_port: 80,
        protocol: Protocol::Tcp,
        first_packet_time: Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap(),
        last_packet_time: Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 5).unwrap(),
        packet_count: 2,
        chunks,
    }
}

/// Builder double: serves pre-configured stream batches per capture file.
struct StubBuilder {
    index_dir: PathBuf,
    batches: Mutex<HashMap<String, Vec<StreamEntry>>>,
    known: Mutex<Vec<PcapInfo>>,
}

impl StubBuilder {
    fn new(index_dir: &Path) -> Self {
        Self {
            index_dir: index_dir.to_path_buf(),
            batches: Mutex::new(HashMap::new()),
            known: Mutex::new(Vec::new()),
        }
    }

    fn stage(&self, filename: &str, entries: Vec<StreamEntry>) {
        self.batches
            .lock()
            .unwrap()
            .insert(filename.to_string(), entries);
    }
}

impl IndexBuilder for StubBuilder {
    fn from_pcap(
        &self,
        _pcap_dir: &Path,
        filenames: &[String],
        _existing: &[Arc<IndexReader>],
    ) -> IndexResult<(usize, Vec<Arc<IndexReader>>)> {
        let mut created = Vec::new();
        for filename in filenames {
            let entries = self.batches.lock().unwrap().remove(filename);
            let Some(entries) = entries else {
                continue;
            };
            if !entries.is_empty() {
                let path = next_index_filename(&self.index_dir);
                write_index_file(&path, &entries)?;
                created.push(Arc::new(IndexReader::open(&path)?));
            }
            self.known.lock().unwrap().push(PcapInfo {
                filename: filename.clone(),
                filesize: 1024,
                packet_count: entries.iter().map(|e| e.packet_count).sum(),
                first_packet_time: Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap(),
                last_packet_time: Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 5).unwrap(),
            });
        }
        Ok((filenames.len(), created))
    }

    fn known_pcaps(&self) -> Vec<PcapInfo> {
        self.known.lock().unwrap().clone()
    }

    fn set_known_pcaps(&self, cached: Vec<PcapInfo>) {
        *self.known.lock().unwrap() = cached;
    }
}

/// Converter double recording enqueued streams; `data_for_search` can be
/// blocked to hold a tagging job open.
struct StubConverter {
    name: String,
    enqueued: Mutex<Vec<u64>>,
    attached: Mutex<Vec<String>>,
    blocked: AtomicBool,
}

impl StubConverter {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            enqueued: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            blocked: AtomicBool::new(false),
        })
    }

    fn enqueued(&self) -> Vec<u64> {
        self.enqueued.lock().unwrap().clone()
    }
}

impl Converter for StubConverter {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach_tag(&self, tag_name: &str) {
        self.attached.lock().unwrap().push(tag_name.to_string());
    }

    fn detach_tag(&self, tag_name: &str) -> IndexResult<()> {
        self.attached.lock().unwrap().retain(|t| t != tag_name);
        Ok(())
    }

    fn enqueue_stream(&self, record: &flowdex::StreamRecord) {
        self.enqueued.lock().unwrap().push(record.stream_id);
    }

    fn has_stream(&self, stream_id: u64) -> bool {
        self.enqueued.lock().unwrap().contains(&stream_id)
    }

    fn data_for_search(&self, _stream_id: u64) -> IndexResult<ConverterSearchData> {
        while self.blocked.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(ConverterSearchData::default())
    }

    fn reset(&self) -> IndexResult<()> {
        self.enqueued.lock().unwrap().clear();
        Ok(())
    }

    fn kill(&self) -> IndexResult<()> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        false
    }
}

async fn settle(manager: &Manager) {
    for _ in 0..1000 {
        let status = manager.status().await.unwrap();
        let tags = manager.list_tags().await.unwrap();
        let busy = status.import_job_count > 0
            || status.tagging_job_running
            || status.merge_job_running
            || tags.iter().any(|t| t.uncertain_count > 0);
        if !busy {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("manager did not settle in time");
}

fn count_index_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "fdx"))
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_import_accumulates_counts() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::under(dir.path());
    std::fs::create_dir_all(&config.index_dir).unwrap();
    let builder = Arc::new(StubBuilder::new(&config.index_dir));
    builder.stage(
        "a.pcap",
        vec![entry(0, b"one", b""), entry(1, b"two", b"")],
    );
    builder.stage("b.pcap", vec![entry(2, b"three", b"")]);

    let manager = Manager::new(config, builder, Vec::new()).unwrap();
    manager.import_pcap("a.pcap").unwrap();
    manager.import_pcap("b.pcap").unwrap();
    settle(&manager).await;

    let status = manager.status().await.unwrap();
    assert_eq!(status.stream_count, 3);
    assert_eq!(status.packet_count, 6);
    assert_eq!(status.pcap_count, 2);
    assert_eq!(manager.known_pcaps().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mark_tag_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::under(dir.path());
    std::fs::create_dir_all(&config.index_dir).unwrap();
    let builder = Arc::new(StubBuilder::new(&config.index_dir));
    builder.stage(
        "a.pcap",
        (0..10).map(|i| entry(i, b"payload", b"")).collect(),
    );

    let manager = Manager::new(config, builder, Vec::new()).unwrap();
    manager.import_pcap("a.pcap").unwrap();
    settle(&manager).await;

    manager.add_tag("mark/x", "#fff", "id:3,5,9").await.unwrap();
    let tags = manager.list_tags().await.unwrap();
    assert_eq!(tags[0].name, "mark/x");
    assert_eq!(tags[0].matching_count, 3);
    assert_eq!(tags[0].uncertain_count, 0);

    manager
        .update_tag("mark/x", UpdateTagOperation::MarkDelStreams(vec![5]))
        .await
        .unwrap();
    manager
        .update_tag("mark/x", UpdateTagOperation::MarkAddStreams(vec![7]))
        .await
        .unwrap();
    settle(&manager).await;

    let tags = manager.list_tags().await.unwrap();
    assert_eq!(tags[0].definition, "id:3,7,9");
    assert_eq!(tags[0].matching_count, 3);
    assert_eq!(tags[0].uncertain_count, 0);

    // mark operations only apply to mark/generated tags
    manager.add_tag("tag/t", "#000", "id:1").await.unwrap();
    let err = manager
        .update_tag("tag/t", UpdateTagOperation::MarkAddStreams(vec![1]))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::MalformedMark));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transitive_invalidation_and_tagging() {
    trace_init();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::under(dir.path());
    std::fs::create_dir_all(&config.index_dir).unwrap();
    let builder = Arc::new(StubBuilder::new(&config.index_dir));
    builder.stage(
        "a.pcap",
        vec![
            entry(0, b"nothing", b""),
            entry(1, b"", b"foo here"),
            entry(2, b"other", b""),
            entry(3, b"", b"also foo"),
            entry(4, b"", b"bar"),
        ],
    );

    let manager = Manager::new(config, builder, Vec::new()).unwrap();
    manager.add_tag("tag/a", "#f00", r#"sdata:"foo""#).await.unwrap();
    manager.add_tag("tag/b", "#0f0", "tag:a").await.unwrap();
    manager.import_pcap("a.pcap").unwrap();
    settle(&manager).await;

    let tags = manager.list_tags().await.unwrap();
    let a = tags.iter().find(|t| t.name == "tag/a").unwrap();
    let b = tags.iter().find(|t| t.name == "tag/b").unwrap();
    assert_eq!(a.matching_count, 2);
    assert_eq!(a.uncertain_count, 0);
    assert_eq!(b.matching_count, 2);
    assert_eq!(b.uncertain_count, 0);

    // the dependent tag resolves to the same stream set
    let mut view = manager.get_view();
    let context = view.stream(1).await.unwrap().unwrap();
    assert!(context.has_tag("tag/a").unwrap());
    assert!(context.has_tag("tag/b").unwrap());
    let context = view.stream(0).await.unwrap().unwrap();
    assert!(!context.has_tag("tag/b").unwrap());
    view.release();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_merge_respects_view_reference_counts() {
    trace_init();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::under(dir.path());
    let index_dir = config.index_dir.clone();
    std::fs::create_dir_all(&index_dir).unwrap();
    let builder = Arc::new(StubBuilder::new(&index_dir));
    builder.stage("a.pcap", vec![entry(0, b"first", b"")]);
    builder.stage(
        "b.pcap",
        vec![entry(1, b"second", b""), entry(2, b"third", b"")],
    );
    let slow = StubConverter::new("slow");
    slow.blocked.store(true, Ordering::SeqCst);

    let manager = Manager::new(config, builder, vec![slow.clone()]).unwrap();
    // the tag's evaluation blocks on the converter, which keeps the merge
    // from starting while we take the view
    manager
        .add_tag("tag/hold", "#00f", r#"cdata.slow:"x""#)
        .await
        .unwrap();
    manager.import_pcap("a.pcap").unwrap();
    manager.import_pcap("b.pcap").unwrap();

    for _ in 0..1000 {
        let status = manager.status().await.unwrap();
        if status.index_count == 2 && status.stream_count == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(count_index_files(&index_dir), 2);

    let mut view = manager.get_view();
    assert!(view.stream(0).await.unwrap().is_some());

    slow.blocked.store(false, Ordering::SeqCst);
    settle(&manager).await;
    let status = manager.status().await.unwrap();
    assert_eq!(status.index_count, 1);
    assert_eq!(status.stream_count, 3);

    // superseded files survive until the view lets go
    assert_eq!(count_index_files(&index_dir), 3);
    view.release();
    for _ in 0..1000 {
        if count_index_files(&index_dir) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(count_index_files(&index_dir), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_converter_attach_detach() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::under(dir.path());
    std::fs::create_dir_all(&config.index_dir).unwrap();
    let builder = Arc::new(StubBuilder::new(&config.index_dir));
    builder.stage(
        "a.pcap",
        (0..4).map(|i| entry(i, b"data", b"")).collect(),
    );
    let converter = StubConverter::new("upper");

    let manager = Manager::new(config, builder, vec![converter.clone()]).unwrap();
    manager.import_pcap("a.pcap").unwrap();
    settle(&manager).await;

    manager.add_tag("mark/m", "#fff", "id:1,3").await.unwrap();
    manager
        .update_tag("mark/m", UpdateTagOperation::AddConverter("upper".to_string()))
        .await
        .unwrap();

    for _ in 0..1000 {
        let mut enqueued = converter.enqueued();
        enqueued.sort_unstable();
        if enqueued == vec![1, 3] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut enqueued = converter.enqueued();
    enqueued.sort_unstable();
    assert_eq!(enqueued, vec![1, 3]);
    assert_eq!(converter.attached.lock().unwrap().as_slice(), ["mark/m"]);

    // attaching again is a no-op by identity
    manager
        .update_tag("mark/m", UpdateTagOperation::AddConverter("upper".to_string()))
        .await
        .unwrap();
    settle(&manager).await;
    assert_eq!(converter.attached.lock().unwrap().len(), 1);

    manager
        .update_tag("mark/m", UpdateTagOperation::DelConverter("upper".to_string()))
        .await
        .unwrap();
    assert!(converter.attached.lock().unwrap().is_empty());
    let err = manager
        .update_tag("mark/m", UpdateTagOperation::DelConverter("upper".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::ConverterNotAttached(_)));

    let err = manager
        .update_tag("mark/m", UpdateTagOperation::AddConverter("gone".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::UnknownConverter(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::under(dir.path());
    std::fs::create_dir_all(&config.index_dir).unwrap();
    let builder = Arc::new(StubBuilder::new(&config.index_dir));
    builder.stage("a.pcap", (0..5).map(|i| entry(i, b"x", b"")).collect());

    let manager = Manager::new(config.clone(), builder, Vec::new()).unwrap();
    manager.import_pcap("a.pcap").unwrap();
    settle(&manager).await;
    manager.add_tag("mark/kept", "#fff", "id:2,4").await.unwrap();
    manager.add_tag("tag/data", "#abc", r#"cdata:"x""#).await.unwrap();
    settle(&manager).await;
    drop(manager);

    let builder = Arc::new(StubBuilder::new(&config.index_dir));
    let manager = Manager::new(config, builder, Vec::new()).unwrap();
    settle(&manager).await;
    let tags = manager.list_tags().await.unwrap();
    assert_eq!(tags.len(), 2);
    let kept = tags.iter().find(|t| t.name == "mark/kept").unwrap();
    assert_eq!(kept.definition, "id:2,4");
    assert_eq!(kept.matching_count, 2);
    assert_eq!(kept.uncertain_count, 0);
    // non-mark tags reload fully uncertain and re-evaluate
    let data = tags.iter().find(|t| t.name == "tag/data").unwrap();
    assert_eq!(data.matching_count, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_tag_validation() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::under(dir.path());
    let builder = Arc::new(StubBuilder::new(&config.index_dir));
    let manager = Manager::new(config, builder, Vec::new()).unwrap();

    assert!(matches!(
        manager.add_tag("bogus", "#fff", "id:1").await.unwrap_err(),
        ManagerError::InvalidTagName
    ));
    assert!(matches!(
        manager.add_tag("tag/", "#fff", "id:1").await.unwrap_err(),
        ManagerError::InvalidTagName
    ));
    assert!(matches!(
        manager.add_tag("tag/x", "#fff", "id:???").await.unwrap_err(),
        ManagerError::InvalidTagQuery(_)
    ));
    assert!(matches!(
        manager
            .add_tag("tag/x", "#fff", "rtime:-60..")
            .await
            .unwrap_err(),
        ManagerError::UnsupportedFeature("relative times")
    ));
    assert!(matches!(
        manager
            .add_tag("tag/x", "#fff", "id:1 group:service")
            .await
            .unwrap_err(),
        ManagerError::UnsupportedFeature("grouping")
    ));
    assert!(matches!(
        manager.add_tag("tag/x", "#fff", "tag:x").await.unwrap_err(),
        ManagerError::SelfReference
    ));
    assert!(matches!(
        manager
            .add_tag("mark/x", "#fff", r#"cdata:"foo""#)
            .await
            .unwrap_err(),
        ManagerError::MalformedMark
    ));

    manager.add_tag("tag/ok", "#fff", "id:1").await.unwrap();
    assert!(matches!(
        manager.add_tag("tag/ok", "#fff", "id:2").await.unwrap_err(),
        ManagerError::TagAlreadyExists
    ));
    assert!(matches!(
        manager
            .del_tag("tag/missing")
            .await
            .unwrap_err(),
        ManagerError::UnknownTag(_)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_view_search_with_sub_query() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::under(dir.path());
    std::fs::create_dir_all(&config.index_dir).unwrap();
    let builder = Arc::new(StubBuilder::new(&config.index_dir));
    builder.stage(
        "a.pcap",
        vec![
            entry(0, b"login alice", b""),
            entry(1, b"login bob", b""),
            entry(2, b"hello bob", b""),
            entry(3, b"hello mallory", b""),
        ],
    );

    let manager = Manager::new(config, builder, Vec::new()).unwrap();
    manager.import_pcap("a.pcap").unwrap();
    settle(&manager).await;

    let query =
        flowdex::parse_query(r#"sq@cdata:"login (?P<u>\w+)" cdata:"hello ${sq.u}""#).unwrap();
    let mut view = manager.get_view();
    let (matches, has_more, offset) = view
        .search(&query, Default::default())
        .await
        .unwrap();
    assert_eq!(
        matches.iter().map(|m| m.stream_id).collect::<Vec<_>>(),
        vec![2]
    );
    assert!(!has_more);
    assert_eq!(offset, 0);
    view.release();
}
