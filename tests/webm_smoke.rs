use warpcap::{
    CaptureOptions, CaptureSource, RasterSurface, VideoArtifact, VirtualClock, capture,
    encode::webm::is_ffmpeg_on_path,
};

// Full local pipeline against a real ffmpeg. Skipped when ffmpeg is not
// installed so the suite stays runnable on minimal hosts.
#[tokio::test(flavor = "multi_thread")]
async fn local_webm_capture_writes_a_nonempty_file() {
    if !is_ffmpeg_on_path() {
        eprintln!("skipping webm smoke test: ffmpeg not found on PATH");
        return;
    }

    let out_dir = std::env::temp_dir().join("warpcap-webm-smoke");
    std::fs::create_dir_all(&out_dir).unwrap();
    let out_path = out_dir.join("smoke.webm");
    let _ = std::fs::remove_file(&out_path);

    let clock = VirtualClock::new();
    let handle = clock.handle();

    // Animate so the encoder sees more than a still frame.
    let surface = RasterSurface::new(16, 12);
    fn animate(handle: &warpcap::ClockHandle, surface: RasterSurface) {
        let next = handle.clone();
        handle.request_animation_frame(move |t| {
            let shade = ((t / 4.0) as u32 % 256) as u8;
            surface.fill([shade, 64, 255 - shade, 255]);
            animate(&next, surface);
        });
    }
    animate(&handle, surface.clone());

    let artifact = capture(
        &clock,
        vec![CaptureSource::from(surface)],
        CaptureOptions {
            frames_to_capture: 6,
            fps: 30,
            batch_size: 4,
            out_path: out_path.clone(),
            ..CaptureOptions::default()
        },
    )
    .await
    .unwrap();

    match artifact {
        VideoArtifact::LocalFile(path) => {
            assert_eq!(path, out_path);
            let len = std::fs::metadata(&path).unwrap().len();
            assert!(len > 0, "encoded file must not be empty");
        }
        other => panic!("expected a local file artifact, got {other:?}"),
    }
}
