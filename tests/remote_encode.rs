use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader},
    net::TcpListener,
    task::JoinHandle,
};
use warpcap::{
    CaptureError, CaptureOptions, CaptureSource, EncoderBackend, EncoderFormat, FrameRgba,
    RasterSurface, VideoArtifact, VirtualClock, capture,
    encode::RemoteEncoder,
};

#[derive(Debug, Deserialize)]
struct ReceivedHeader {
    width: u32,
    height: u32,
    fps: u32,
    pix_fmt: String,
}

struct ServerReport {
    header: ReceivedHeader,
    frame_lens: Vec<u32>,
}

/// One-shot encode server: reads a header line and length-prefixed frames
/// until the zero terminator, then answers with `response` and hangs up.
async fn spawn_fake_server(response: &'static str) -> (String, JoinHandle<ServerReport>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let header: ReceivedHeader = serde_json::from_str(line.trim()).unwrap();

        let mut frame_lens = Vec::new();
        loop {
            let len = reader.read_u32().await.unwrap();
            if len == 0 {
                break;
            }
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf).await.unwrap();
            frame_lens.push(len);
        }

        let stream = reader.get_mut();
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        ServerReport { header, frame_lens }
    });
    (addr, task)
}

#[tokio::test]
async fn streams_header_frames_and_terminator_then_reads_result() {
    let (addr, server) =
        spawn_fake_server("{\"ok\":true,\"url\":\"http://fake.test/out.webm\"}\n").await;

    let mut encoder = RemoteEncoder::new(addr);
    encoder.start(4, 2, 30).await.unwrap();
    for _ in 0..3 {
        let frame = FrameRgba::new_premul(4, 2, vec![255u8; 4 * 2 * 4]).unwrap();
        encoder.feed(frame).await.unwrap();
    }
    let artifact = encoder.stop().await.unwrap();
    assert_eq!(
        artifact,
        VideoArtifact::Remote {
            url: "http://fake.test/out.webm".into()
        }
    );

    let report = server.await.unwrap();
    assert_eq!(report.header.width, 4);
    assert_eq!(report.header.height, 2);
    assert_eq!(report.header.fps, 30);
    assert_eq!(report.header.pix_fmt, "rgba");
    assert_eq!(report.frame_lens, vec![32, 32, 32]);
}

#[tokio::test]
async fn server_failure_surfaces_as_encoder_error() {
    let (addr, server) = spawn_fake_server("{\"ok\":false,\"error\":\"encode ran aground\"}\n").await;

    let mut encoder = RemoteEncoder::new(addr);
    encoder.start(2, 2, 60).await.unwrap();
    let frame = FrameRgba::new_premul(2, 2, vec![255u8; 2 * 2 * 4]).unwrap();
    encoder.feed(frame).await.unwrap();

    let err = encoder.stop().await.unwrap_err();
    match err {
        CaptureError::Encoder(msg) => assert!(msg.contains("encode ran aground"), "{msg}"),
        other => panic!("expected encoder error, got {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn capture_pipeline_round_trips_through_remote_backend() {
    let (addr, server) =
        spawn_fake_server("{\"ok\":true,\"url\":\"http://fake.test/clip.webm\"}\n").await;

    let clock = VirtualClock::new();
    let surface = RasterSurface::new(6, 4);
    surface.fill([10, 20, 30, 255]);

    let artifact = capture(
        &clock,
        vec![CaptureSource::from(surface)],
        CaptureOptions {
            frames_to_capture: 5,
            fps: 30,
            batch_size: 2,
            format: EncoderFormat::Ffmpeg,
            remote_addr: addr,
            ..CaptureOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(
        artifact,
        VideoArtifact::Remote {
            url: "http://fake.test/clip.webm".into()
        }
    );

    let report = server.await.unwrap();
    assert_eq!(report.header.width, 6);
    assert_eq!(report.header.height, 4);
    assert_eq!(report.frame_lens.len(), 5);
    assert!(report.frame_lens.iter().all(|&len| len == 6 * 4 * 4));
}
