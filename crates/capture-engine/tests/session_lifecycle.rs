mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use spanrec_capture_engine::sink::{read_wav_artifact, AudioArtifact};
use spanrec_capture_engine::{
    AudioAdjustment, CaptureTarget, MuxPlan, RecordingOutcome, RecordingSession, SessionEvent,
    SessionHandle, SessionState,
};
use spanrec_common::clock::ManualTimeSource;
use spanrec_common::error::SpanrecError;
use spanrec_platform_core::MonitorDescriptor;
use tokio::sync::broadcast;

async fn next_finished(events: &mut broadcast::Receiver<SessionEvent>) -> RecordingOutcome {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Finished { outcome }) => return outcome,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("session never finished")
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return seen,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn spanning_region_records_video_and_audio() {
    let dir = scratch_dir("spanning");
    let backend = Arc::new(SyntheticBackend::new(side_by_side()));
    let recorded = backend.recorded.clone();
    let mut session = RecordingSession::new(session_config(&dir, true), backend);
    let mut events = session.subscribe();

    session
        .start(CaptureTarget::Region(rect(1800, 100, 240, 120)))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Recording);
    tokio::time::sleep(Duration::from_millis(400)).await;
    let outcome = session.stop().await.unwrap();

    assert_eq!(outcome.state, SessionState::Completed);
    assert!(outcome.audio_present);
    assert_eq!(outcome.final_path, Some(dir.join("take_final.mp4")));
    assert_eq!(outcome.geometry.map(|g| (g.width(), g.height())), Some((240, 120)));
    assert_eq!(recorded.frames_encoded(), outcome.frames_written);
    assert_eq!(outcome.frames_written, outcome.ticks);
    assert!(recorded
        .frame_sizes
        .lock()
        .unwrap()
        .iter()
        .all(|size| *size == (240, 120)));
    // The loopback starts right away, so audio sits close to frame 0.
    let offset = outcome.audio_offset_secs.unwrap();
    assert!(offset.abs() < 0.25, "audio offset {offset}");

    // Both monitors contributed to every fresh frame.
    let grabbed = recorded.grabbed.lock().unwrap();
    assert!(grabbed.contains(&rect(1800, 100, 120, 120)));
    assert!(grabbed.contains(&rect(1920, 100, 120, 120)));

    let requests = recorded.mux_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.video_frames, outcome.frames_written);
    match &request.audio {
        AudioArtifact::Written {
            sample_rate,
            channels,
            duration_secs,
            ..
        } => {
            assert_eq!((*sample_rate, *channels), (48_000, 2));
            assert!(*duration_secs > 0.1);
        }
        AudioArtifact::Absent => panic!("audio should have been captured"),
    }

    // Interim files are removed once the final file exists.
    assert!(!dir.join("take_audio.wav").exists());
    assert!(!dir.join("take.mp4").exists());
    assert_eq!(outcome.audio_path, None);
    assert_eq!(outcome.video_path, None);

    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, SessionEvent::Started { audio: true, .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::StateChanged {
            from: SessionState::Finalizing,
            to: SessionState::Completed
        }
    )));
    assert_eq!(session.outcome(), Some(&outcome));
}

#[tokio::test(flavor = "multi_thread")]
async fn frame_count_tracks_ticks_when_grabs_are_slow() {
    let dir = scratch_dir("underrun");
    // Slower than one 33 ms interval per grab.
    let backend = Arc::new(
        SyntheticBackend::new(side_by_side())
            .without_audio()
            .with_grab_delay(Duration::from_millis(50)),
    );
    let recorded = backend.recorded.clone();
    let mut session = RecordingSession::new(session_config(&dir, false), backend);

    session
        .start(CaptureTarget::Region(rect(10, 10, 160, 90)))
        .await
        .unwrap();
    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(700)).await;
    let elapsed = started.elapsed().as_secs_f64();
    let outcome = session.stop().await.unwrap();

    assert_eq!(outcome.state, SessionState::Completed);
    assert!(outcome.duplicate_frames > 0, "slow grabs should repeat frames");
    // One output frame per tick served, however slow the grabs were.
    assert_eq!(outcome.frames_written, outcome.ticks);
    assert_eq!(recorded.frames_encoded(), outcome.ticks);
    assert!(
        outcome.ticks as f64 >= elapsed * 30.0 * 0.8,
        "{} ticks for {elapsed:.3}s at 30 fps",
        outcome.ticks
    );
    let grabs = recorded.grabs.load(std::sync::atomic::Ordering::SeqCst);
    assert!(grabs < outcome.frames_written);
}

#[tokio::test(flavor = "multi_thread")]
async fn region_change_keeps_output_geometry() {
    let dir = scratch_dir("region-change");
    let backend = Arc::new(SyntheticBackend::new(side_by_side()).without_audio());
    let recorded = backend.recorded.clone();
    let mut session = RecordingSession::new(session_config(&dir, false), backend)
        .with_time_source(Arc::new(ManualTimeSource::new()));
    let mut events = session.subscribe();

    session
        .start(CaptureTarget::Region(rect(0, 0, 320, 200)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let wider = rect(1800, 50, 640, 400);
    session.change_region(wider).unwrap();
    assert_eq!(session.state(), SessionState::Recording);
    assert_eq!(session.active_rect(), Some(wider));
    tokio::time::sleep(Duration::from_millis(60)).await;

    let outcome = session.stop().await.unwrap();
    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.geometry.map(|g| (g.width(), g.height())), Some((320, 200)));
    assert!(recorded
        .frame_sizes
        .lock()
        .unwrap()
        .iter()
        .all(|size| *size == (320, 200)));
    assert!(recorded
        .grabbed
        .lock()
        .unwrap()
        .iter()
        .any(|area| area.left() >= 1920));
    // Manual time never falls behind, so every tick grabbed fresh pixels.
    assert_eq!(outcome.duplicate_frames, 0);

    let request = recorded.mux_requests.lock().unwrap()[0].clone();
    assert_eq!(request.audio, AudioArtifact::Absent);
    assert_eq!(MuxPlan::new(&request).unwrap().audio, AudioAdjustment::Absent);

    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, SessionEvent::RegionChanged { rect } if *rect == wider)));
}

#[tokio::test(flavor = "multi_thread")]
async fn off_screen_region_change_is_rejected() {
    let dir = scratch_dir("reject");
    let backend = Arc::new(SyntheticBackend::new(side_by_side()).without_audio());
    let mut session = RecordingSession::new(session_config(&dir, false), backend);
    let mut events = session.subscribe();

    let original = rect(100, 100, 200, 100);
    session.start(CaptureTarget::Region(original)).await.unwrap();

    let result = session.change_region(rect(5000, 5000, 100, 100));
    assert!(matches!(result, Err(SpanrecError::CaptureSource { .. })));
    assert_eq!(session.state(), SessionState::Recording);
    assert_eq!(session.active_rect(), Some(original));

    let outcome = session.stop().await.unwrap();
    assert!(outcome.is_completed());
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::RegionRejected { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_loopback_falls_back_to_video_only() {
    let dir = scratch_dir("no-loopback");
    let backend = Arc::new(SyntheticBackend::new(side_by_side()).without_audio());
    let recorded = backend.recorded.clone();
    let mut session = RecordingSession::new(session_config(&dir, true), backend);
    let mut events = session.subscribe();

    session
        .start(CaptureTarget::Region(rect(0, 0, 640, 360)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let outcome = session.stop().await.unwrap();

    assert_eq!(outcome.state, SessionState::Completed);
    assert!(!outcome.audio_present);
    assert!(outcome.final_path.is_some());
    assert_eq!(
        recorded.mux_requests.lock().unwrap()[0].audio,
        AudioArtifact::Absent
    );
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::AudioUnavailable { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn negative_origin_monitor_is_composed_without_wraparound() {
    let dir = scratch_dir("negative-origin");
    let monitors = vec![
        MonitorDescriptor::new("DP-2", rect(-1920, 0, 1920, 1080), false),
        MonitorDescriptor::new("DP-1", rect(0, 0, 1920, 1080), true),
    ];
    let backend = Arc::new(SyntheticBackend::new(monitors).without_audio());
    let recorded = backend.recorded.clone();
    let mut session = RecordingSession::new(session_config(&dir, false), backend)
        .with_time_source(Arc::new(ManualTimeSource::new()));

    session
        .start(CaptureTarget::Region(rect(-100, 0, 200, 50)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let outcome = session.stop().await.unwrap();
    assert!(outcome.is_completed());

    let grabbed = recorded.grabbed.lock().unwrap();
    assert!(grabbed.contains(&rect(-100, 0, 100, 50)));
    assert!(grabbed.contains(&rect(0, 0, 100, 50)));

    let first = recorded.first_frame.lock().unwrap().clone().unwrap();
    assert_eq!(first.dimensions(), (200, 50));
    assert_eq!(*first.get_pixel(0, 0), desktop_pixel(-100, 0));
    assert_eq!(*first.get_pixel(99, 10), desktop_pixel(-1, 10));
    assert_eq!(*first.get_pixel(100, 10), desktop_pixel(0, 10));
    assert_eq!(*first.get_pixel(199, 49), desktop_pixel(99, 49));
}

#[tokio::test(flavor = "multi_thread")]
async fn window_capture_refuses_region_changes() {
    let dir = scratch_dir("window");
    let backend = Arc::new(SyntheticBackend::new(side_by_side()).without_audio());
    let mut session = RecordingSession::new(session_config(&dir, false), backend);

    session
        .start(CaptureTarget::Window {
            window_id: "0x3a00007".into(),
        })
        .await
        .unwrap();
    let result = session.change_region(rect(0, 0, 100, 100));
    assert!(matches!(result, Err(SpanrecError::Unsupported { .. })));
    assert_eq!(session.state(), SessionState::Recording);

    let outcome = session.stop().await.unwrap();
    assert_eq!(outcome.geometry.map(|g| (g.width(), g.height())), Some((400, 300)));
}

#[tokio::test(flavor = "multi_thread")]
async fn no_display_fails_the_session() {
    let dir = scratch_dir("no-display");
    let backend = Arc::new(SyntheticBackend::new(Vec::new()));
    let mut session = RecordingSession::new(session_config(&dir, true), backend);

    let result = session
        .start(CaptureTarget::Region(rect(0, 0, 100, 100)))
        .await;
    assert!(matches!(result, Err(SpanrecError::NoDisplayFound)));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.outcome().unwrap().error.is_some());

    // Terminal sessions cannot be restarted.
    let again = session
        .start(CaptureTarget::Region(rect(0, 0, 100, 100)))
        .await;
    assert!(matches!(again, Err(SpanrecError::InvalidState { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_before_region_change_is_applied_in_order() {
    let dir = scratch_dir("fifo");
    let backend = Arc::new(SyntheticBackend::new(side_by_side()).without_audio());
    let session = RecordingSession::new(session_config(&dir, false), backend);
    let (handle, task) = SessionHandle::spawn(session);

    handle
        .start(CaptureTarget::Region(rect(0, 0, 320, 180)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (stopped, changed) = tokio::join!(
        handle.stop(),
        handle.change_region(rect(1920, 0, 320, 180))
    );
    assert!(stopped.unwrap().is_completed());
    assert!(matches!(changed, Err(SpanrecError::InvalidState { .. })));
    assert_eq!(handle.state().await.unwrap(), SessionState::Completed);

    drop(handle);
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_grab_failure_fails_session_and_keeps_partial_video() {
    let dir = scratch_dir("grab-failure");
    let backend = Arc::new(
        SyntheticBackend::new(side_by_side())
            .without_audio()
            .failing_after(5),
    );
    let recorded = backend.recorded.clone();
    let mut config = session_config(&dir, false);
    config.capture_retry_ticks = 3;
    let session = RecordingSession::new(config, backend);
    let (handle, _task) = SessionHandle::spawn(session);
    let mut events = handle.subscribe();

    handle
        .start(CaptureTarget::Region(rect(0, 0, 160, 90)))
        .await
        .unwrap();
    let outcome = next_finished(&mut events).await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(outcome.error.unwrap().contains("consecutive"));
    assert!(recorded.frames_encoded() >= 5);
    assert!(recorded.mux_requests.lock().unwrap().is_empty());
    assert_eq!(handle.state().await.unwrap(), SessionState::Failed);
    // Stopping an ended session hands back the same outcome.
    assert_eq!(handle.stop().await.unwrap().state, SessionState::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn topology_change_fills_vanished_monitor() {
    let dir = scratch_dir("hotplug");
    let backend = Arc::new(SyntheticBackend::new(side_by_side()).without_audio());
    let recorded = backend.recorded.clone();
    let mut config = session_config(&dir, false);
    config.fill_color = [7, 7, 7, 255];
    let mut session = RecordingSession::new(config, backend.clone());

    session
        .start(CaptureTarget::Region(rect(2000, 10, 100, 60)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    backend.set_monitors(vec![MonitorDescriptor::new(
        "DP-1",
        rect(0, 0, 1920, 1080),
        true,
    )]);
    session.topology_changed().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcome = session.stop().await.unwrap();
    assert!(outcome.is_completed());
    let last = recorded.last_frame.lock().unwrap().clone().unwrap();
    assert_eq!(*last.get_pixel(0, 0), image::Rgba([7, 7, 7, 255]));
    assert_eq!(*last.get_pixel(99, 59), image::Rgba([7, 7, 7, 255]));
}

#[tokio::test(flavor = "multi_thread")]
async fn late_loopback_start_is_placed_on_the_timeline() {
    let dir = scratch_dir("late-audio");
    let backend = Arc::new(
        SyntheticBackend::new(side_by_side()).with_audio_delay(Duration::from_millis(400)),
    );
    let recorded = backend.recorded.clone();
    let mut session = RecordingSession::new(session_config(&dir, true), backend);

    session
        .start(CaptureTarget::Region(rect(0, 0, 160, 90)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let outcome = session.stop().await.unwrap();
    assert!(outcome.is_completed());
    assert!(outcome.audio_present);

    let request = recorded.mux_requests.lock().unwrap()[0].clone();
    let offset = request.audio.start_offset_secs();
    assert!((0.38..0.8).contains(&offset), "audio offset {offset}");
    assert_eq!(outcome.audio_offset_secs, Some(offset));

    let plan = MuxPlan::new(&request).unwrap();
    assert!((plan.audio_offset_secs - offset).abs() < 1e-9);
    let filter = plan
        .ffmpeg_args
        .windows(2)
        .find(|w| w[0] == "-af")
        .map(|w| w[1].clone())
        .unwrap();
    assert!(filter.starts_with("adelay=delays="), "{filter}");

    // Delayed audio ends with the video; only jitter is left to fit.
    let tail = match plan.audio {
        AudioAdjustment::Pad { secs } | AudioAdjustment::Truncate { secs } => secs,
        AudioAdjustment::Exact => 0.0,
        AudioAdjustment::Absent => panic!("audio should be muxed"),
    };
    assert!(tail < 0.25, "tail adjustment {tail}s for {plan:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn sink_write_failure_fails_session_and_keeps_partial_output() {
    let dir = scratch_dir("sink-failure");
    let backend = Arc::new(SyntheticBackend::new(side_by_side()).failing_encoder_after(10));
    let recorded = backend.recorded.clone();
    let session = RecordingSession::new(session_config(&dir, true), backend);
    let (handle, _task) = SessionHandle::spawn(session);
    let mut events = handle.subscribe();

    handle
        .start(CaptureTarget::Region(rect(0, 0, 160, 90)))
        .await
        .unwrap();
    let outcome = next_finished(&mut events).await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(outcome.error.unwrap().contains("No space left"));
    assert_eq!(outcome.final_path, None);
    assert_eq!(recorded.frames_encoded(), 10);
    assert!(recorded.mux_requests.lock().unwrap().is_empty());

    let video = outcome.video_path.expect("partial video kept");
    assert_eq!(std::fs::metadata(&video).unwrap().len(), 10);
    let audio = outcome.audio_path.expect("partial audio kept");
    assert!(audio.exists());
    assert_eq!(handle.state().await.unwrap(), SessionState::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn mux_failure_keeps_interim_artifacts() {
    let dir = scratch_dir("mux-failure");
    let backend = Arc::new(SyntheticBackend::new(side_by_side()).with_failing_mux());
    let recorded = backend.recorded.clone();
    let mut session = RecordingSession::new(session_config(&dir, true), backend);
    let mut events = session.subscribe();

    session
        .start(CaptureTarget::Region(rect(0, 0, 160, 90)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let outcome = session.stop().await.unwrap();

    assert_eq!(outcome.state, SessionState::Failed);
    assert_eq!(session.state(), SessionState::Failed);
    assert!(outcome.error.as_deref().unwrap().contains("moov atom"));
    assert_eq!(outcome.final_path, None);
    assert!(!dir.join("take_final.mp4").exists());
    assert_eq!(recorded.mux_requests.lock().unwrap().len(), 1);

    assert_eq!(outcome.video_path, Some(dir.join("take.mp4")));
    assert_eq!(outcome.audio_path, Some(dir.join("take_audio.wav")));
    assert!(dir.join("take.mp4").exists());
    assert!(matches!(
        read_wav_artifact(&dir.join("take_audio.wav")).unwrap(),
        AudioArtifact::Written { .. }
    ));

    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::StateChanged {
            from: SessionState::Finalizing,
            to: SessionState::Failed
        }
    )));
}
