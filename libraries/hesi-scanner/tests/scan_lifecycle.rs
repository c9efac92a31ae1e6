//! End-to-end scans through the coordinator


use hesi_core::{ScanId, ScanOptions, ScanStatus};
use hesi_scanner::{ScanCoordinator, ScanError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{audio, id, wait_for_status, write, FailingSink, Fixture, MemorySink};

const LIVE_CUE: &str = r#"PERFORMER "The Band"
TITLE "Live at the Hall"
FILE "album.flac" WAVE
  TRACK 01 AUDIO
    TITLE "Opening"
    INDEX 01 00:00:00
  TRACK 02 AUDIO
    INDEX 00 02:58:00
    INDEX 01 03:00:00
"#;

#[tokio::test]
async fn scan_persists_audio_and_skips_excluded_and_hidden() {
    let fx = Fixture::new();
    let music = fx.music();
    audio(&music.join("a.mp3"), 215_000);
    audio(&music.join("b.flac"), 180_000);
    write(&music.join("notes.txt"), b"not audio");
    audio(&music.join(".hidden.mp3"), 1000);
    audio(&music.join(".git/e.mp3"), 1000);
    audio(&music.join("podcasts/c.mp3"), 1000);
    audio(&music.join("sub/d.ogg"), 90_000);

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let options = ScanOptions::new(vec![music.clone()])
        .with_excluded_paths(vec![music.join("podcasts")]);

    let scan_id = coordinator.start_scan(options).unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);

    assert_eq!(
        sink.ids(),
        vec![
            id(&music.join("a.mp3")),
            id(&music.join("b.flac")),
            id(&music.join("sub/d.ogg")),
        ]
    );

    let a = sink.record(&id(&music.join("a.mp3"))).unwrap();
    assert_eq!(a.duration_ms, 215_000);
    assert_eq!(a.title.as_deref(), Some("a"));
    assert_eq!(a.artist.as_deref(), Some("Fake Artist"));
    assert!(!a.is_virtual());

    let progress = coordinator.get_progress(&scan_id).unwrap();
    assert_eq!(progress.scanned_count, 4);
    assert_eq!(progress.found_songs, 3);
    assert!(progress.finished);

    let state = coordinator.state_store().load_state(&scan_id).unwrap().unwrap();
    assert_eq!(state.status, ScanStatus::Completed);
    assert!(state.completed_at.is_some());
    assert_eq!(state.checkpoint_error, None);
}

#[tokio::test]
async fn cue_sheet_expands_into_virtual_tracks() {
    let fx = Fixture::new();
    let album = fx.music().join("album");
    write(&album.join("album.cue"), LIVE_CUE.as_bytes());
    audio(&album.join("album.flac"), 600_000);
    write(&album.join("cover.jpg"), b"jpeg");
    audio(&fx.music().join("single.mp3"), 200_000);

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music()]))
        .unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);

    let flac = id(&album.join("album.flac"));
    assert_eq!(
        sink.ids(),
        vec![
            format!("{flac}#0"),
            format!("{flac}#180000"),
            id(&fx.music().join("single.mp3")),
        ]
    );
    // The physical file is not stored on its own
    assert!(sink.record(&flac).is_none());

    let first = sink.record(&format!("{flac}#0")).unwrap();
    assert_eq!(first.title.as_deref(), Some("Opening"));
    assert_eq!(first.artist.as_deref(), Some("The Band"));
    assert_eq!(first.album.as_deref(), Some("Live at the Hall"));
    assert_eq!(first.duration_ms, 180_000);
    assert_eq!(first.path, flac);

    let second = sink.record(&format!("{flac}#180000")).unwrap();
    assert_eq!(second.title.as_deref(), Some("Track 02"));
    assert_eq!(second.duration_ms, 420_000);
    let blob: serde_json::Value = serde_json::from_str(second.cue_blob.as_deref().unwrap()).unwrap();
    assert_eq!(blob["trackNumber"], 2);
    assert_eq!(blob["startMs"], 180_000);
    assert_eq!(blob["indexes"]["0"], 178_000);

    let progress = coordinator.get_progress(&scan_id).unwrap();
    assert_eq!(progress.scanned_count, 4);
    assert_eq!(progress.found_songs, 3);
}

#[tokio::test]
async fn cue_with_missing_audio_is_reported() {
    let fx = Fixture::new();
    write(&fx.music().join("orphan.cue"), LIVE_CUE.as_bytes());

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music()]))
        .unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);

    assert!(sink.ids().is_empty());
    let summary = coordinator.errors().summary(scan_id.as_str()).unwrap();
    assert!(summary.samples[0].contains("album.flac"));
}

#[tokio::test]
async fn second_sheet_for_the_same_audio_is_ignored() {
    let fx = Fixture::new();
    let album = fx.music().join("album");
    write(&album.join("album.cue"), LIVE_CUE.as_bytes());
    write(&album.join("album (utf8).cue"), LIVE_CUE.as_bytes());
    audio(&album.join("album.flac"), 600_000);

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music()]))
        .unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);

    let flac = id(&album.join("album.flac"));
    assert_eq!(sink.records().len(), 2);
    assert_eq!(sink.ids(), vec![format!("{flac}#0"), format!("{flac}#180000")]);

    let progress = coordinator.get_progress(&scan_id).unwrap();
    assert_eq!(progress.scanned_count, 3);
    assert_eq!(progress.found_songs, 2);

    let summary = coordinator.errors().summary(scan_id.as_str()).unwrap();
    assert_eq!(summary.count, 1);
    assert!(summary.samples[0].contains("already split by another CUE sheet"));
}

#[tokio::test]
async fn sheet_pointing_into_a_walked_directory_does_not_split_again() {
    let fx = Fixture::new();
    let music = fx.music();
    audio(&music.join("album.flac"), 600_000);
    let sheet = LIVE_CUE.replace("\"album.flac\"", "\"../album.flac\"");
    write(&music.join("sheets/album.cue"), sheet.as_bytes());

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let scan_id = coordinator.start_scan(ScanOptions::new(vec![music.clone()])).unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);

    // Stored whole when its own directory was walked
    assert_eq!(sink.ids(), vec![id(&music.join("album.flac"))]);
    assert_eq!(coordinator.get_progress(&scan_id).unwrap().found_songs, 1);

    let summary = coordinator.errors().summary(scan_id.as_str()).unwrap();
    assert!(summary.samples[0].contains("already scanned as a standalone file"));
}

#[tokio::test]
async fn final_checkpoint_failure_still_completes() {
    let fx = Fixture::new();
    audio(&fx.music().join("a.mp3"), 1000);
    // A plain file where the checkpoint directory should go
    write(&fx.state().join("scan_checkpoints"), b"not a directory");

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music()]))
        .unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);

    assert_eq!(sink.ids(), vec![id(&fx.music().join("a.mp3"))]);

    let state = coordinator.state_store().load_state(&scan_id).unwrap().unwrap();
    assert_eq!(state.status, ScanStatus::Completed);
    assert!(state.checkpoint_error.is_some());
    assert!(coordinator.state_store().load_checkpoint(&scan_id).is_err());
}

#[tokio::test]
async fn short_songs_are_not_persisted() {
    let fx = Fixture::new();
    audio(&fx.music().join("jingle.mp3"), 4_000);
    audio(&fx.music().join("song.mp3"), 240_000);

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music()]).with_min_duration_ms(30_000))
        .unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);

    assert_eq!(sink.ids(), vec![id(&fx.music().join("song.mp3"))]);
}

#[tokio::test]
async fn overlapping_roots_store_each_file_once() {
    let fx = Fixture::new();
    audio(&fx.music().join("a.mp3"), 1000);
    audio(&fx.music().join("sub/b.mp3"), 1000);

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music(), fx.music().join("sub")]))
        .unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);

    assert_eq!(sink.records().len(), 2);
    assert_eq!(coordinator.get_progress(&scan_id).unwrap().found_songs, 2);
}

#[tokio::test]
async fn unchanged_files_are_skipped_on_request() {
    let fx = Fixture::new();
    audio(&fx.music().join("a.mp3"), 1000);
    audio(&fx.music().join("b.mp3"), 1000);

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let options = ScanOptions::new(vec![fx.music()]).skip_unchanged(true);

    let first = coordinator.start_scan(options.clone()).unwrap();
    coordinator.wait_for(&first).await;
    assert_eq!(sink.records().len(), 2);
    assert_eq!(coordinator.deduplicator().len(), 2);

    let second = coordinator.start_scan(options).unwrap();
    assert_eq!(coordinator.wait_for(&second).await, ScanStatus::Completed);
    assert_eq!(sink.records().len(), 2);

    let progress = coordinator.get_progress(&second).unwrap();
    assert_eq!(progress.scanned_count, 2);
    assert_eq!(progress.found_songs, 0);
}

#[tokio::test]
async fn unreadable_files_are_reported_and_still_recorded() {
    let fx = Fixture::new();
    write(&fx.music().join("garbage.mp3"), b"not a number");

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let emissions: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
    let seen = Arc::clone(&emissions);
    coordinator.set_error_callback(Arc::new(move |key, json| {
        seen.lock().unwrap().push((key.to_string(), json.to_string()));
    }));

    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music()]))
        .unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);

    let record = sink.record(&id(&fx.music().join("garbage.mp3"))).unwrap();
    assert_eq!(record.title.as_deref(), Some("garbage"));
    assert_eq!(record.duration_ms, 0);
    assert_eq!(coordinator.get_progress(&scan_id).unwrap().found_songs, 0);

    let emissions = emissions.lock().unwrap();
    assert!(emissions.iter().any(|(key, _)| key == scan_id.as_str()));

    let state = coordinator.state_store().load_state(&scan_id).unwrap().unwrap();
    let summary = state.last_error_summary.unwrap();
    assert_eq!(summary.count, 1);
    assert!(summary.samples[0].contains("metadata could not be read"));
}

#[tokio::test]
async fn sink_failure_fails_the_scan() {
    let fx = Fixture::new();
    audio(&fx.music().join("a.mp3"), 1000);

    let coordinator = fx.coordinator(Arc::new(FailingSink));
    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music()]))
        .unwrap();
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Failed);

    let state = coordinator.state_store().load_state(&scan_id).unwrap().unwrap();
    assert_eq!(state.status, ScanStatus::Failed);
    assert!(state.failed_at.is_some());
    assert!(state.error_message.unwrap().contains("disk full"));
}

/// Nine files in three directories
fn three_albums(fx: &Fixture) -> Vec<String> {
    let mut ids = Vec::new();
    for album in ["d1", "d2", "d3"] {
        for track in 1..=3 {
            let path = fx.music().join(album).join(format!("{track}.mp3"));
            audio(&path, 60_000);
            ids.push(id(&path));
        }
    }
    ids
}

/// Stop `coordinator`'s scans the first time one reaches `at` files
fn stop_once_at(coordinator: &ScanCoordinator, at: u64) {
    let stopped = AtomicBool::new(false);
    let handle = coordinator.clone();
    coordinator.set_progress_callback(Arc::new(move |scan_id, progress| {
        if progress.scanned_count == at && !stopped.swap(true, Ordering::SeqCst) {
            assert!(handle.stop_scan(scan_id));
        }
    }));
}

#[tokio::test]
async fn stopped_scan_resumes_in_a_new_coordinator() {
    let fx = Fixture::new();
    let all_ids = three_albums(&fx);
    let sink = Arc::new(MemorySink::default());

    let first = ScanCoordinator::new(
        fx.config().with_batch_size(1),
        Arc::new(test_helpers::FakeExtractor),
        sink.clone(),
    );
    stop_once_at(&first, 4);
    let scan_id = first.start_scan(ScanOptions::new(vec![fx.music()])).unwrap();
    assert_eq!(first.wait_for(&scan_id).await, ScanStatus::Cancelled);
    assert!(sink.ids().len() < all_ids.len());
    assert!(first.state_store().load_cursor(&scan_id).unwrap().is_some());

    // Stopping a finished scan is a no-op
    assert!(first.stop_scan(&scan_id));
    assert_eq!(first.get_status(&scan_id), ScanStatus::Cancelled);

    let second = fx.coordinator(sink.clone());
    assert_eq!(second.get_status(&scan_id), ScanStatus::Cancelled);
    second.resume_scan(&scan_id).unwrap();
    assert_eq!(second.wait_for(&scan_id).await, ScanStatus::Completed);

    assert_eq!(sink.ids(), all_ids);
    let progress = second.get_progress(&scan_id).unwrap();
    assert_eq!(progress.scanned_count, 9);
    assert_eq!(progress.found_songs, 9);
    assert!(second.state_store().load_cursor(&scan_id).unwrap().unwrap().is_exhausted());
}

#[tokio::test]
async fn paused_scan_holds_until_resumed() {
    let fx = Fixture::new();
    let all_ids = three_albums(&fx);
    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());

    let paused = AtomicBool::new(false);
    let handle = coordinator.clone();
    coordinator.set_progress_callback(Arc::new(move |scan_id, _| {
        if !paused.swap(true, Ordering::SeqCst) {
            assert!(handle.pause_scan(scan_id));
        }
    }));

    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music()]))
        .unwrap();
    wait_for_status(&coordinator, &scan_id, ScanStatus::Paused).await;

    let before = coordinator.get_progress(&scan_id).unwrap().scanned_count;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = coordinator.get_progress(&scan_id).unwrap().scanned_count;
    assert_eq!(before, after);
    assert!(after < 9);
    assert_eq!(coordinator.get_status(&scan_id), ScanStatus::Paused);

    assert!(coordinator.resume_paused_scan(&scan_id));
    assert!(!coordinator.resume_paused_scan(&scan_id));
    assert_eq!(coordinator.wait_for(&scan_id).await, ScanStatus::Completed);
    assert_eq!(sink.ids(), all_ids);
}

#[tokio::test]
async fn finished_scans_are_visible_to_a_new_coordinator() {
    let fx = Fixture::new();
    audio(&fx.music().join("a.mp3"), 1000);

    let sink = Arc::new(MemorySink::default());
    let coordinator = fx.coordinator(sink.clone());
    let scan_id = coordinator
        .start_scan(ScanOptions::new(vec![fx.music()]))
        .unwrap();
    coordinator.wait_for(&scan_id).await;

    let fresh = fx.coordinator(sink);
    assert_eq!(fresh.get_status(&scan_id), ScanStatus::Completed);
    assert!(fresh.get_progress(&scan_id).unwrap().finished);
    assert_eq!(fresh.scan_ids(), vec![scan_id.clone()]);

    assert!(matches!(
        fresh.resume_scan(&scan_id),
        Err(ScanError::InvalidState {
            status: ScanStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn unknown_scans() {
    let fx = Fixture::new();
    let coordinator = fx.coordinator(Arc::new(MemorySink::default()));
    let ghost = ScanId::new("no-such-scan");

    assert_eq!(coordinator.get_status(&ghost), ScanStatus::Unknown);
    assert!(coordinator.get_progress(&ghost).is_none());
    assert!(!coordinator.stop_scan(&ghost));
    assert!(!coordinator.pause_scan(&ghost));
    assert!(matches!(
        coordinator.resume_scan(&ghost),
        Err(ScanError::UnknownScan(_))
    ));
    assert_eq!(coordinator.wait_for(&ghost).await, ScanStatus::Unknown);
}

#[test]
fn starting_outside_a_runtime_is_rejected() {
    let fx = Fixture::new();
    let coordinator = fx.coordinator(Arc::new(MemorySink::default()));

    let result = coordinator.start_scan(ScanOptions::new(vec![PathBuf::from("/music")]));
    assert!(matches!(result, Err(ScanError::NotInitialized)));
    assert!(coordinator.scan_ids().is_empty());
}
