//! End-to-end file transfer scenarios.

use std::path::Path;
use std::sync::Arc;

use rand::RngCore;
use sha2::Digest;

use crate::start_relay;
use quill_core::addr::RelayAddr;
use quill_core::config::FilesConfig;
use quill_files::{FileDescription, FileError, FileEvent, FileTransfer};

const KIB: u64 = 1024;

fn files_config(dir: &Path, qr_budget: usize) -> FilesConfig {
    FilesConfig {
        // Scaled-down chunk classes keep the tests quick while exercising
        // the same default/small split as production sizes.
        default_chunk_size: 800 * KIB,
        small_chunk_size: 100 * KIB,
        temp_dir: dir.join("files_tmp"),
        max_inflight_bytes: 4 * 1024 * KIB,
        qr_budget,
    }
}

fn random_file(path: &Path, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    std::fs::write(path, &data).unwrap();
    data
}

fn transfer(
    dir: &Path,
    addr: &RelayAddr,
    qr_budget: usize,
) -> (
    Arc<FileTransfer>,
    tokio::sync::mpsc::Receiver<FileEvent>,
) {
    FileTransfer::new(files_config(dir, qr_budget), vec![addr.clone()])
}

/// Spec scenario: a file just over two default chunks splits into three,
/// progress climbs to the encrypted size, and the recipient's bytes match
/// the original.
#[tokio::test]
async fn file_round_trip_with_three_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let (_relay, addr) = start_relay(dir.path(), 64).await;
    let (sender, mut send_events) = transfer(&dir.path().join("snd"), &addr, 100_000);

    let src = dir.path().join("payload.bin");
    let data = random_file(&src, 1700 * KIB as usize);

    let result = sender.send_file(&src, 1).await.unwrap();
    assert_eq!(result.recipient_descriptions.len(), 1);

    let parsed = result.recipient_descriptions[0].parse().unwrap();
    assert_eq!(parsed.chunks.len(), 3, "two default chunks and one tail");
    let chunk_sum: u64 = parsed.chunks.iter().map(|c| c.size.unwrap()).sum();
    assert_eq!(chunk_sum, parsed.size, "chunk sizes sum to encrypted size");

    // Progress is monotone and finishes at the encrypted size.
    let mut last_sent = 0;
    let mut done = false;
    while let Ok(event) = send_events.try_recv() {
        match event {
            FileEvent::SfProg { sent, total } => {
                assert!(sent > last_sent);
                assert_eq!(total, parsed.size);
                last_sent = sent;
            }
            FileEvent::SfDone { descriptions } => {
                assert_eq!(descriptions.len(), 1);
                done = true;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(done);
    assert_eq!(last_sent, parsed.size);

    // Receive from the description alone.
    let (receiver, _rcv_events) = transfer(&dir.path().join("rcv"), &addr, 100_000);
    let dst = dir.path().join("restored.bin");
    receiver
        .receive_file(&result.recipient_descriptions[0], &dst)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

/// Every recipient gets an independent replica set; each can fetch the
/// file with only her own description.
#[tokio::test]
async fn fan_out_to_multiple_recipients() {
    let dir = tempfile::tempdir().unwrap();
    let (_relay, addr) = start_relay(dir.path(), 64).await;
    let (sender, _send_events) = transfer(&dir.path().join("snd"), &addr, 100_000);

    let src = dir.path().join("shared.bin");
    let data = random_file(&src, 300 * KIB as usize);

    let result = sender.send_file(&src, 3).await.unwrap();
    assert_eq!(result.recipient_descriptions.len(), 3);

    // Replica ids must be pairwise distinct across the descriptors.
    let mut ids = std::collections::HashSet::new();
    for desc in &result.recipient_descriptions {
        for chunk in desc.parse().unwrap().chunks {
            for replica in chunk.replicas {
                assert!(ids.insert(replica.replica_id), "replica id shared");
            }
        }
    }

    for (i, desc) in result.recipient_descriptions.iter().enumerate() {
        let (receiver, _ev) = transfer(&dir.path().join(format!("rcv{i}")), &addr, 100_000);
        let dst = dir.path().join(format!("out{i}.bin"));
        receiver.receive_file(desc, &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }
}

/// Spec scenario: a descriptor over the QR budget is replaced by a tiny
/// redirect descriptor; the receiver follows it transparently.
#[tokio::test]
async fn oversized_descriptor_redirects() {
    let dir = tempfile::tempdir().unwrap();
    let (_relay, addr) = start_relay(dir.path(), 64).await;
    // A budget small enough that any real descriptor overflows it.
    let (sender, mut send_events) = transfer(&dir.path().join("snd"), &addr, 400);

    let src = dir.path().join("payload.bin");
    let data = random_file(&src, 1700 * KIB as usize);

    let result = sender.send_file(&src, 1).await.unwrap();
    let tiny = &result.recipient_descriptions[0];
    assert!(tiny.redirect.is_some(), "descriptor must carry a redirect");

    // Two completions: the direct descriptors, then the tiny ones.
    let mut dones = 0;
    while let Ok(event) = send_events.try_recv() {
        if let FileEvent::SfDone { .. } = event {
            dones += 1;
        }
    }
    assert_eq!(dones, 2);

    let (receiver, mut rcv_events) = transfer(&dir.path().join("rcv"), &addr, 400);
    let dst = dir.path().join("restored.bin");
    receiver.receive_file(tiny, &dst).await.unwrap();
    assert_eq!(std::fs::read(&dst).unwrap(), data);

    // The redirect prefetch contributed progress events of its own.
    let mut progress_events = 0;
    while let Ok(event) = rcv_events.try_recv() {
        if let FileEvent::RfProg { .. } = event {
            progress_events += 1;
        }
    }
    assert!(progress_events > 3, "redirect prefetch counts in progress");
}

/// Spec scenario: chunks deleted at the relay make the download fail
/// permanently with AUTH; the temp prefix is cleaned up and later
/// operations are unaffected.
#[tokio::test]
async fn permanent_error_cleans_up_temp_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let (_relay, addr) = start_relay(dir.path(), 64).await;
    let tmp_root = dir.path().join("rcv");
    let (sender, _send_events) = transfer(&dir.path().join("snd"), &addr, 100_000);

    let src = dir.path().join("payload.bin");
    random_file(&src, 200 * KIB as usize);

    let result = sender.send_file(&src, 1).await.unwrap();
    // The sender wipes every chunk before the recipient arrives.
    sender.delete_file(&result.sender_description).await.unwrap();

    let (receiver, _rcv_events) = transfer(&tmp_root, &addr, 100_000);
    let dst = dir.path().join("restored.bin");
    let err = receiver
        .receive_file(&result.recipient_descriptions[0], &dst)
        .await
        .unwrap_err();
    assert!(matches!(err, FileError::Auth), "got {err:?}");
    assert!(!dst.exists());

    // No temp prefix directory survives the failure.
    let leftovers = std::fs::read_dir(tmp_root.join("files_tmp"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "temp prefix must be removed");

    // And the subsystem still works for the next transfer.
    let again = sender.send_file(&src, 1).await.unwrap();
    let dst2 = dir.path().join("second.bin");
    receiver
        .receive_file(&again.recipient_descriptions[0], &dst2)
        .await
        .unwrap();
    assert_eq!(
        sha2::Sha512::digest(std::fs::read(&dst2).unwrap()).to_vec(),
        sha2::Sha512::digest(std::fs::read(&src).unwrap()).to_vec()
    );
}

/// Tampering with a descriptor digest is caught before decryption ever
/// runs.
#[tokio::test]
async fn corrupted_descriptor_digest_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_relay, addr) = start_relay(dir.path(), 64).await;
    let (sender, _send_events) = transfer(&dir.path().join("snd"), &addr, 100_000);

    let src = dir.path().join("payload.bin");
    random_file(&src, 150 * KIB as usize);
    let result = sender.send_file(&src, 1).await.unwrap();

    // Corrupt the stream digest in the YAML.
    let yaml = result.recipient_descriptions[0].to_yaml();
    let mut desc = FileDescription::from_yaml(&yaml).unwrap();
    desc.digest = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD_NO_PAD.encode([0u8; 64])
    };

    let (receiver, _ev) = transfer(&dir.path().join("rcv"), &addr, 100_000);
    let err = receiver
        .receive_file(&desc, &dir.path().join("out.bin"))
        .await
        .unwrap_err();
    assert!(matches!(err, FileError::Digest), "got {err:?}");
}
