//! End-to-end studio scenarios: registry churn, layout caps, speaker-driven
//! spotlight and the render loop.

use std::sync::Arc;
use std::time::Duration;

use image::{Rgba, RgbaImage};
use stagecast_common::{Error, StagecastConfig};
use stagecast_media::{AudioTap, MediaSource, VideoFrame, VideoTrack};
use stagecast_studio::compositor::PLACEHOLDER;
use stagecast_studio::{
    speaker, Compositor, GuestSlot, Layout, LayoutChange, NoConnections, ParticipantId, Session,
};
use tokio_util::sync::CancellationToken;

fn slot(n: u8) -> GuestSlot {
    GuestSlot::new(n).unwrap()
}

fn small_config() -> StagecastConfig {
    let mut config = StagecastConfig::default();
    config.video.width = 64;
    config.video.height = 36;
    config
}

/// Deterministic white noise, loud enough to clear the default threshold.
fn noise(len: usize, seed: u32) -> Vec<i16> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((state >> 16) as i16) / 2
        })
        .collect()
}

#[tokio::test]
async fn test_add_remove_sequences_stay_bounded() {
    let session = Session::new(small_config());
    session.select_layout(Layout::Grid3Up);

    let ops: [(bool, u8); 12] = [
        (true, 1),
        (true, 2),
        (true, 2),
        (true, 3),
        (false, 2),
        (true, 4),
        (true, 2),
        (false, 9),
        (true, 1),
        (false, 1),
        (false, 1),
        (true, 1),
    ];
    for (add, n) in ops {
        let Ok(slot) = GuestSlot::new(n) else {
            continue;
        };
        if add {
            let _ = session.add_guest(slot, "guest");
        } else {
            session.remove_guest(slot, &NoConnections).await;
        }
        session.with_registry(|r| {
            assert!(r.len() <= 5);
            assert!(r.guest_count() <= 4);
        });
    }
    session.with_registry(|r| assert_eq!(r.guest_count(), 4));
    assert!(matches!(
        session.add_guest(slot(3), "late"),
        Err(Error::DuplicateSlot(3))
    ));
}

#[tokio::test]
async fn test_auto_spotlight_from_real_audio() {
    let session = Arc::new(Session::new(small_config()));
    session.add_guest(slot(1), "alice").unwrap();
    session.add_guest(slot(2), "bob").unwrap();
    session.set_auto_spotlight(true);

    let quiet = AudioTap::new("alice-mic");
    let loud = AudioTap::new("bob-mic");
    session.attach_audio(ParticipantId::Guest(slot(1)), quiet.clone()).unwrap();
    session.attach_audio(ParticipantId::Guest(slot(2)), loud.clone()).unwrap();

    let mut speaker = None;
    for i in 0..10 {
        quiet.push(&[0; 256]);
        loud.push(&noise(256, i));
        if let Some(changed) = session.sample_audio() {
            speaker = Some(changed);
        }
    }
    assert_eq!(speaker, Some(ParticipantId::Guest(slot(2))));
    assert_eq!(session.current_layout(), Layout::Spotlight);
    assert_eq!(session.select_layout(Layout::Grid2x2), LayoutChange::Ignored);

    assert_eq!(session.set_auto_spotlight(false), Layout::Grid2x2);
    assert_eq!(
        session.select_layout(Layout::Grid4Up),
        LayoutChange::Applied(Layout::Grid4Up)
    );
}

#[tokio::test]
async fn test_host_media_via_devices() {
    use async_trait::async_trait;
    use stagecast_media::{MediaDevices, MediaRequest};

    struct NoCamera;

    #[async_trait]
    impl MediaDevices for NoCamera {
        async fn acquire(&self, _request: &MediaRequest) -> stagecast_common::Result<MediaSource> {
            Err(Error::media("no camera attached"))
        }
    }

    struct TestPattern;

    #[async_trait]
    impl MediaDevices for TestPattern {
        async fn acquire(&self, _request: &MediaRequest) -> stagecast_common::Result<MediaSource> {
            let track = VideoTrack::new("pattern");
            track.publish(VideoFrame::new(
                RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255])),
                0,
            ));
            Ok(MediaSource::new("host").with_video(track))
        }
    }

    let session = Session::new(small_config());
    let err = session
        .acquire_host_media(&NoCamera, &MediaRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MediaAcquisition(_)));

    session
        .acquire_host_media(&TestPattern, &MediaRequest::default())
        .await
        .unwrap();
    let plan = session.render_plan();
    assert!(plan.slots[0].frame.is_some());

    session.release_host_media();
    assert!(session.render_plan().slots[0].frame.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_render_loop_publishes_frames() {
    let session = Arc::new(Session::new(small_config()));
    session.select_layout(Layout::SideBySide);
    session.add_guest(slot(1), "alice").unwrap();

    let host_cam = VideoTrack::new("host-cam");
    host_cam.publish(VideoFrame::new(
        RgbaImage::from_pixel(16, 16, Rgba([200, 10, 10, 255])),
        0,
    ));
    session.set_host_media(MediaSource::new("host").with_video(host_cam));

    let mut compositor = Compositor::new(session.output().clone());
    let handle = compositor.handle();
    let mut frames = session.output().subscribe_video();
    let cancel = CancellationToken::new();

    let task = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            compositor.run(session, cancel).await;
            compositor
        })
    };

    frames.changed().await.unwrap();
    let frame = frames.borrow_and_update().clone().unwrap();
    assert_eq!(*frame.image.get_pixel(4, 4), Rgba([200, 10, 10, 255]));
    assert_eq!(*frame.image.get_pixel(50, 20), PLACEHOLDER);
    assert!(handle.is_running());

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let compositor = task.await.unwrap();
    assert!(!handle.is_running());
    assert!(compositor.frames_rendered() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_sampling_loop_runs_until_cancelled() {
    let session = Arc::new(Session::new(small_config()));
    let mic = AudioTap::new("host-mic");
    session.set_host_media(MediaSource::new("host").with_audio(mic.clone()));
    mic.push(&noise(2_048, 7));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(speaker::run(session.clone(), cancel.clone()));
    tokio::time::sleep(Duration::from_millis(1_050)).await;
    cancel.cancel();
    task.await.unwrap();

    assert_eq!(session.active_speaker(), Some(ParticipantId::Host));
}
