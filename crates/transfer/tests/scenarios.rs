//! End-to-end upload scenarios against a durable store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use landfall_protocol::messages::{ChunkAck, ChunkRequest, FileDescriptor};
use landfall_protocol::{FileStatus, SessionStatus};
use landfall_store::{FileStore, SessionStore};
use landfall_transfer::{
    Cleaner, TransferError, UploadConfig, UploadSessionManager, checksum_bytes,
};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    config: UploadConfig,
    store: Arc<dyn SessionStore>,
    mgr: UploadSessionManager,
}

impl Harness {
    async fn new(f: impl FnOnce(&mut UploadConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = UploadConfig::with_base_dir(dir.path());
        f(&mut config);
        let store: Arc<dyn SessionStore> =
            Arc::new(FileStore::open(dir.path().join("store")).await.unwrap());
        let mgr = UploadSessionManager::new(Arc::clone(&store), config.clone());
        Self {
            dir,
            config,
            store,
            mgr,
        }
    }

    /// A second manager over the same store and directories, as after a
    /// process restart.
    fn restart(&self) -> UploadSessionManager {
        UploadSessionManager::new(Arc::clone(&self.store), self.config.clone())
    }

    fn dest(&self, owner: &str, relative: &str) -> PathBuf {
        self.dir.path().join("files").join(owner).join(relative)
    }

    fn scratch(&self, session_id: &str) -> PathBuf {
        self.dir.path().join("scratch").join(session_id)
    }
}

async fn send(
    mgr: &UploadSessionManager,
    owner: &str,
    session_id: &str,
    file_id: &str,
    offset: u64,
    data: &[u8],
) -> Result<ChunkAck, TransferError> {
    let req = ChunkRequest {
        session_id: session_id.into(),
        file_id: file_id.into(),
        offset,
        length: data.len() as u64,
        digest: None,
        is_last: false,
    };
    let mut body = data;
    mgr.ingestion().apply_chunk(owner, &req, &mut body).await
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn hello_work() {
    let h = Harness::new(|_| {}).await;
    let s = h.mgr.create_session("u1", "").await.unwrap();
    let files = h
        .mgr
        .register_files("u1", &s.id, vec![FileDescriptor::new("doc.txt", Some(10))])
        .await
        .unwrap();
    let file_id = &files[0].file_id;

    let ack = send(&h.mgr, "u1", &s.id, file_id, 0, b"Hello ").await.unwrap();
    assert_eq!(ack.received_bytes, 6);
    assert!(!ack.completed);

    let status = h.mgr.get_status("u1", &s.id).await.unwrap();
    assert_eq!(status.files[0].received_bytes, 6);
    assert_eq!(status.files[0].status, FileStatus::Uploading);
    assert_eq!(status.files[0].percentage, Some(60.0));

    let ack = send(&h.mgr, "u1", &s.id, file_id, 6, b"Work").await.unwrap();
    assert!(ack.completed);
    assert_eq!(read(&h.dest("u1", "doc.txt")), b"Hello Work");

    let status = h.mgr.get_status("u1", &s.id).await.unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
    assert!(!h.scratch(&s.id).exists());
}

#[tokio::test]
async fn offset_ahead_of_received_is_rejected() {
    let h = Harness::new(|_| {}).await;
    let s = h.mgr.create_session("u1", "").await.unwrap();
    let files = h
        .mgr
        .register_files("u1", &s.id, vec![FileDescriptor::new("doc.txt", Some(10))])
        .await
        .unwrap();

    let err = send(&h.mgr, "u1", &s.id, &files[0].file_id, 5, b"abcde")
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::OffsetMismatch { .. }));
    assert_eq!(err.to_body().code.as_str(), "offset_mismatch");

    let status = h.mgr.get_status("u1", &s.id).await.unwrap();
    assert_eq!(status.files[0].received_bytes, 0);
}

#[tokio::test]
async fn third_file_exceeds_session_quota() {
    let h = Harness::new(|c| c.max_files_per_session = 2).await;
    let s = h.mgr.create_session("u1", "").await.unwrap();
    let first = h
        .mgr
        .register_files(
            "u1",
            &s.id,
            vec![
                FileDescriptor::new("a.txt", Some(1)),
                FileDescriptor::new("b.txt", Some(1)),
            ],
        )
        .await
        .unwrap();

    let err = h
        .mgr
        .register_files("u1", &s.id, vec![FileDescriptor::new("c.txt", Some(1))])
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::QuotaExceeded(_)));

    let status = h.mgr.get_status("u1", &s.id).await.unwrap();
    assert_eq!(status.files.len(), 2);
    let mut ids: Vec<_> = status.files.iter().map(|f| f.file_id.clone()).collect();
    let mut expected: Vec<_> = first.iter().map(|f| f.file_id.clone()).collect();
    ids.sort();
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn pause_blocks_chunks_without_losing_progress() {
    let h = Harness::new(|_| {}).await;
    let s = h.mgr.create_session("u1", "").await.unwrap();
    let files = h
        .mgr
        .register_files("u1", &s.id, vec![FileDescriptor::new("a", Some(4))])
        .await
        .unwrap();
    let fid = &files[0].file_id;
    send(&h.mgr, "u1", &s.id, fid, 0, b"ab").await.unwrap();

    h.mgr.pause("u1", &s.id).await.unwrap();
    let err = send(&h.mgr, "u1", &s.id, fid, 2, b"cd").await.unwrap_err();
    assert!(matches!(err, TransferError::SessionPaused(_)));
    assert_eq!(h.mgr.get_status("u1", &s.id).await.unwrap().received_bytes, 2);
}

#[tokio::test]
async fn idle_session_is_swept() {
    let h = Harness::new(|c| c.session_ttl_secs = 30).await;
    let s = h.mgr.create_session("u1", "").await.unwrap();
    let files = h
        .mgr
        .register_files("u1", &s.id, vec![FileDescriptor::new("a", Some(4))])
        .await
        .unwrap();
    send(&h.mgr, "u1", &s.id, &files[0].file_id, 0, b"ab")
        .await
        .unwrap();
    assert!(h.scratch(&s.id).exists());

    let cleaner = Cleaner::new(h.mgr.clone());
    let report = cleaner
        .sweep_once(Utc::now() + chrono::Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.expired, 1);

    assert!(!h.scratch(&s.id).exists());
    let key = landfall_transfer::session_key("u1", &s.id);
    assert!(h.store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_chunk_after_acceptance() {
    let h = Harness::new(|_| {}).await;
    let s = h.mgr.create_session("u1", "").await.unwrap();
    let files = h
        .mgr
        .register_files("u1", &s.id, vec![FileDescriptor::new("a", Some(8))])
        .await
        .unwrap();
    let fid = &files[0].file_id;

    send(&h.mgr, "u1", &s.id, fid, 0, b"1234").await.unwrap();
    let err = send(&h.mgr, "u1", &s.id, fid, 0, b"1234").await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::OffsetMismatch {
            expected: 4,
            actual: 0
        }
    ));
    // Resuming from the reported offset works.
    let ack = send(&h.mgr, "u1", &s.id, fid, 4, b"5678").await.unwrap();
    assert!(ack.completed);
    assert_eq!(read(&h.dest("u1", "a")), b"12345678");
}

#[tokio::test]
async fn folder_upload_sums_to_declared_sizes() {
    let h = Harness::new(|_| {}).await;
    let s = h.mgr.create_session("u1", "backup").await.unwrap();
    let contents: Vec<(&str, Vec<u8>)> = vec![
        ("root.txt", b"top level".to_vec()),
        ("nested/deeper/one.bin", vec![1u8; 1000]),
        ("nested/two.bin", vec![2u8; 333]),
    ];
    let descriptors = contents
        .iter()
        .map(|(p, d)| FileDescriptor::new(*p, Some(d.len() as u64)))
        .collect();
    let files = h.mgr.register_files("u1", &s.id, descriptors).await.unwrap();

    for (registered, (_, data)) in files.iter().zip(&contents) {
        let mut offset = 0;
        for piece in data.chunks(128) {
            send(&h.mgr, "u1", &s.id, &registered.file_id, offset, piece)
                .await
                .unwrap();
            offset += piece.len() as u64;
        }
    }

    let status = h.mgr.get_status("u1", &s.id).await.unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
    let declared: u64 = contents.iter().map(|(_, d)| d.len() as u64).sum();
    assert_eq!(status.received_bytes, declared);
    assert_eq!(status.total_bytes, Some(declared));

    for (path, data) in &contents {
        assert_eq!(&read(&h.dest("u1", &format!("backup/{path}"))), data);
    }
}

#[tokio::test]
async fn resume_after_restart() {
    let h = Harness::new(|_| {}).await;
    let s = h.mgr.create_session("u1", "").await.unwrap();
    let mut d = FileDescriptor::new("big.bin", Some(6));
    d.checksum = Some(checksum_bytes(b"abcdef"));
    let files = h.mgr.register_files("u1", &s.id, vec![d]).await.unwrap();
    let fid = &files[0].file_id;
    send(&h.mgr, "u1", &s.id, fid, 0, b"abc").await.unwrap();

    let restarted = h.restart();
    let listed = restarted.list_sessions("u1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, s.id);

    let status = restarted.get_status("u1", &s.id).await.unwrap();
    let offset = status.files[0].received_bytes;
    assert_eq!(offset, 3);
    let ack = send(&restarted, "u1", &s.id, fid, offset, b"def")
        .await
        .unwrap();
    assert!(ack.completed);
    assert_eq!(read(&h.dest("u1", "big.bin")), b"abcdef");
}

#[tokio::test]
async fn finalize_retry_through_status() {
    let h = Harness::new(|c| c.overwrite_existing = false).await;
    let dest = h.dest("u1", "taken.txt");
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::write(&dest, b"old").unwrap();

    let s = h.mgr.create_session("u1", "").await.unwrap();
    let files = h
        .mgr
        .register_files("u1", &s.id, vec![FileDescriptor::new("taken.txt", Some(3))])
        .await
        .unwrap();
    let err = send(&h.mgr, "u1", &s.id, &files[0].file_id, 0, b"new")
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::FinalizeFailed(_)));

    // Bytes are kept; the file waits for finalize.
    let status = h.mgr.get_status("u1", &s.id).await.unwrap();
    assert_eq!(status.files[0].received_bytes, 3);
    assert_eq!(status.files[0].status, FileStatus::Uploading);

    std::fs::remove_file(&dest).unwrap();
    let status = h.mgr.get_status("u1", &s.id).await.unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
    assert_eq!(read(&dest), b"new");
}

#[tokio::test]
async fn abort_removes_everything_but_finished_files() {
    let h = Harness::new(|_| {}).await;
    let s = h.mgr.create_session("u1", "").await.unwrap();
    let files = h
        .mgr
        .register_files(
            "u1",
            &s.id,
            vec![
                FileDescriptor::new("done.txt", Some(2)),
                FileDescriptor::new("half.txt", Some(4)),
            ],
        )
        .await
        .unwrap();
    send(&h.mgr, "u1", &s.id, &files[0].file_id, 0, b"ok").await.unwrap();
    send(&h.mgr, "u1", &s.id, &files[1].file_id, 0, b"ha").await.unwrap();

    let resp = h.mgr.abort("u1", &s.id).await.unwrap();
    assert_eq!(resp.status, SessionStatus::Aborted);
    assert!(!h.scratch(&s.id).exists());
    assert!(h.dest("u1", "done.txt").exists());
    assert!(!h.dest("u1", "half.txt").exists());
    assert!(h.mgr.list_sessions("u1").await.unwrap().is_empty());
}
