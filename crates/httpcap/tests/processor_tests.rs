//! Integration tests for close-time processing
//!
//! Drives exchanges through the request/response hooks the way a proxy does
//! and checks the capture log and the files in the capture directory.

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::StreamExt;
use futures::stream::BoxStream;
use http::{Request, Response, StatusCode, header};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use httpcap::capture::{Recorder, SessionId, SessionTable, TappedBody};
use httpcap::config::{CaptureConfig, FilterConfig, InlineMode};
use httpcap::error::{CaptureError, ErrorReceiver, error_channel};
use httpcap::logwriter::LogWriter;
use httpcap::process::{CapturePolicy, CloseProcessor};
use httpcap::testing::{SharedSink, chunked_body, failing_body};

type Body = BoxStream<'static, io::Result<Bytes>>;

// =============================================================================
// Test Fixtures
// =============================================================================

struct Harness {
    recorder: Recorder,
    writer: LogWriter,
    sink: SharedSink,
    errors: ErrorReceiver,
    dir: TempDir,
    capture_dir: PathBuf,
}

struct Outcome {
    log: String,
    errors: Vec<CaptureError>,
    capture_dir: PathBuf,
    _dir: TempDir,
}

impl Outcome {
    fn file(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.capture_dir.join(name))
            .unwrap_or_else(|e| panic!("missing {name}: {e}\nlog:\n{}", self.log))
    }

    fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.capture_dir)
            .map(|entries| {
                entries
                    .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn harness(capture: CaptureConfig, filter: FilterConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let capture_dir = dir.path().join("captured");
    std::fs::create_dir_all(&capture_dir).unwrap();
    harness_in(dir, capture_dir, capture, filter)
}

fn harness_in(dir: TempDir, capture_dir: PathBuf, capture: CaptureConfig, filter: FilterConfig) -> Harness {
    let policy = CapturePolicy::from_config(&capture, &filter).unwrap();
    let (errors, error_rx) = error_channel(16);
    let sink = SharedSink::new();
    let (writer, log) = LogWriter::spawn(Box::new(sink.clone()), None, 16, errors.clone());

    let sessions = Arc::new(SessionTable::new());
    let processor = Arc::new(CloseProcessor::new(
        Arc::clone(&sessions),
        policy,
        capture_dir.clone(),
        log.clone(),
        errors,
    ));

    Harness {
        recorder: Recorder::new(sessions, processor, log),
        writer,
        sink,
        errors: error_rx,
        dir,
        capture_dir,
    }
}

impl Harness {
    /// Run one complete exchange, consuming both bodies like a proxy would
    async fn exchange(&self, id: u64, request: Request<Body>, response: Response<Body>) {
        let request = self.recorder.on_request(request, SessionId::new(id), "example.com");
        let (_, body) = request.into_parts();
        let _: Vec<_> = body.collect().await;

        let response = self.recorder.on_response(response, SessionId::new(id));
        let (_, body) = response.into_parts();
        let _: Vec<_> = body.collect().await;
    }

    async fn finish(mut self) -> Outcome {
        self.recorder.wait_idle().await;
        self.writer.shutdown().await;

        let mut errors = Vec::new();
        while let Ok(error) = self.errors.try_recv() {
            errors.push(error);
        }
        Outcome {
            log: self.sink.contents(),
            errors,
            capture_dir: self.capture_dir,
            _dir: self.dir,
        }
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(chunked_body(&[])).unwrap()
}

fn post(uri: &str, content_type: &str, body: &'static [u8]) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, content_type)
        .body(chunked_body(&[body]))
        .unwrap()
}

fn ok(content_type: &str, body: &[u8]) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(chunked_body(&[body]))
        .unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

// =============================================================================
// Log Record Tests
// =============================================================================

mod record_tests {
    use super::*;

    #[tokio::test]
    async fn test_record_layout() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let request = Request::get("http://example.com/page")
            .header(header::USER_AGENT, "curl/8")
            .body(chunked_body(&[]))
            .unwrap();
        h.exchange(1, request, ok("text/html", b"<p>hi</p>")).await;
        let out = h.finish().await;

        let lines: Vec<&str> = out.log.lines().collect();
        assert!(lines[0].ends_with("[1] start_req GET http://example.com/page (example.com)"));
        assert!(lines[1].ends_with("[1] open_resp (200 OK) GET http://example.com/page"));
        assert!(lines[2].ends_with("[1] close_resp (200 OK) GET http://example.com/page"));
        assert_eq!(
            &lines[3..],
            &[
                "\t==== Req: headers ====",
                "\t\tuser-agent: curl/8",
                "\t==== Resp (200 OK): headers ====",
                "\t\tcontent-type: text/html",
                "\t---- Resp: body ----",
                "\t\t(saved to 000001_b_page.html)",
                "",
            ]
        );
        assert!(out.log.ends_with("\n\n"));
        assert_eq!(out.file("000001_b_page.html"), b"<p>hi</p>");
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_empty_bodies_have_no_body_section() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        h.exchange(2, get("http://example.com/"), ok("text/plain", b"")).await;
        let out = h.finish().await;

        assert!(!out.log.contains("body ----"));
        assert!(out.file_names().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_logs_failed_line() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(failing_body(&[b"half"], io::ErrorKind::ConnectionReset))
            .unwrap();
        h.exchange(3, get("http://example.com/file.bin"), response).await;
        let out = h.finish().await;

        let failed: Vec<&str> = out.log.lines().filter(|l| l.contains(" failed (")).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].contains("[3] failed ("));
        assert!(failed[0].ends_with("GET http://example.com/file.bin"));
        assert!(!out.log.contains("close_resp"));
        assert!(out.file_names().is_empty());
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn test_response_without_exchange_passes_through() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let response = h.recorder.on_response(ok("text/plain", b"untracked"), SessionId::new(99));
        assert!(matches!(response.body(), TappedBody::Bypass(_)));

        let body: Vec<_> = response.into_body().collect().await;
        assert_eq!(&body[0].as_ref().unwrap()[..], b"untracked");

        let out = h.finish().await;
        assert!(out.log.is_empty());
    }

    #[tokio::test]
    async fn test_forward_failure_discards_exchange() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let _request = h
            .recorder
            .on_request(get("http://down.example/"), SessionId::new(4), "down.example");
        h.recorder.on_failure(SessionId::new(4), &"connection refused");
        assert!(h.recorder.sessions().is_empty());

        // A late response for the discarded session is not captured
        let response = h.recorder.on_response(ok("text/plain", b"late"), SessionId::new(4));
        assert!(matches!(response.body(), TappedBody::Bypass(_)));

        let out = h.finish().await;
        assert!(out.log.contains("[4] failed (connection refused) GET http://down.example/"));
    }
}

// =============================================================================
// Stale Session Tests
// =============================================================================

mod stale_session_tests {
    use super::*;

    #[tokio::test]
    async fn test_reused_session_id_processes_newest_exchange_only() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let id = SessionId::new(5);

        // First exchange gets its response but the body is not closed yet
        let first = h.recorder.on_request(get("http://example.com/first.txt"), id, "example.com");
        drop(first);
        let first_response = h.recorder.on_response(ok("text/plain", b"first"), id);

        // The id is reused before the first response body closes
        h.exchange(5, get("http://example.com/second.txt"), ok("text/plain", b"second"))
            .await;

        let _: Vec<_> = first_response.into_body().collect().await;
        let out = h.finish().await;

        assert_eq!(out.file_names(), vec!["000005_b_second.txt".to_string()]);
        assert_eq!(out.log.matches("close_resp").count(), 1);
    }
}

// =============================================================================
// Body Persistence Tests
// =============================================================================

mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn test_request_body_saved_by_method() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        h.exchange(
            6,
            post("http://example.com/api", "text/plain; charset=utf-8", b"ping"),
            ok("image/jpeg", b"\xff\xd8"),
        )
        .await;
        let out = h.finish().await;

        assert_eq!(out.file("000006_a_POST.txt"), b"ping");
        assert!(out.log.contains("\t---- Req: body ----\n\t\t(saved to 000006_a_POST.txt)\n"));
        assert_eq!(out.file("000006_b_api.jpg"), b"\xff\xd8");
    }

    #[tokio::test]
    async fn test_untyped_request_body_is_bin() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let request = Request::put("http://example.com/upload")
            .body(chunked_body(&[b"\x00\x01"]))
            .unwrap();
        h.exchange(7, request, ok("text/plain", b"")).await;
        let out = h.finish().await;

        assert_eq!(out.file("000007_a_PUT.bin"), b"\x00\x01");
    }

    #[tokio::test]
    async fn test_unknown_name_html_becomes_index() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        h.exchange(8, get("http://example.com/"), ok("text/html; charset=utf-8", b"<html/>"))
            .await;
        let out = h.finish().await;

        assert_eq!(out.file("000008_b_index.html"), b"<html/>");
    }

    #[tokio::test]
    async fn test_content_disposition_names_file() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let response = Response::builder()
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_DISPOSITION, r#"attachment; filename="report.pdf""#)
            .body(chunked_body(&[b"%PDF"]))
            .unwrap();
        h.exchange(9, get("http://example.com/download?id=3"), response).await;
        let out = h.finish().await;

        assert_eq!(out.file("000009_b_report.pdf"), b"%PDF");
    }

    #[tokio::test]
    async fn test_long_names_are_truncated() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let path = format!("http://example.com/{}.js", "x".repeat(60));
        h.exchange(10, get(&path), ok("application/javascript", b"1")).await;
        let out = h.finish().await;

        let expected = format!("000010_b_{}.js", "x".repeat(23));
        assert_eq!(out.file_names(), vec![expected]);
    }

    #[tokio::test]
    async fn test_gzip_bodies_are_decompressed() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let compressed = gzip(b"hello, decompressed world");
        let response = Response::builder()
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(chunked_body(&[&compressed[..10], &compressed[10..]]))
            .unwrap();
        h.exchange(11, get("http://example.com/notes.txt"), response).await;
        let out = h.finish().await;

        assert_eq!(out.file("000011_b_notes.txt"), b"hello, decompressed world");
    }

    #[tokio::test]
    async fn test_corrupt_gzip_reports_error_and_keeps_record() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        let response = Response::builder()
            .header(header::CONTENT_ENCODING, "gzip")
            .body(chunked_body(&[b"definitely not gzip"]))
            .unwrap();
        h.exchange(12, get("http://example.com/broken.gz"), response).await;
        let out = h.finish().await;

        assert!(out.log.contains("[12] close_resp (200 OK)"));
        assert!(out.log.contains("\t---- Resp: body ----"));
        assert!(out.file_names().is_empty());
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0], CaptureError::Decompress(_)));
    }

    #[tokio::test]
    async fn test_write_failure_reports_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let h = harness_in(dir, missing, CaptureConfig::default(), FilterConfig::default());
        h.exchange(13, get("http://example.com/a.txt"), ok("text/plain", b"data"))
            .await;
        let out = h.finish().await;

        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0], CaptureError::Persist { .. }));
        assert!(out.log.contains("[13] close_resp"));
        assert!(!out.log.contains("saved to"));
    }
}

// =============================================================================
// Partial Content Tests
// =============================================================================

mod partial_content_tests {
    use super::*;

    fn partial(range: &str, body: &[u8]) -> Response<Body> {
        Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::CONTENT_RANGE, range)
            .body(chunked_body(&[body]))
            .unwrap()
    }

    #[tokio::test]
    async fn test_partial_capture_gets_marker() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        h.exchange(14, get("http://example.com/movie.mp4"), partial("bytes 0-99/200", &[7u8; 100]))
            .await;
        let out = h.finish().await;

        assert_eq!(out.file_names(), vec!["000014_b_movie[partial_0-99(200)].mp4".to_string()]);
        assert!(out.log.contains("==== Resp (206 Partial Content): headers ===="));
    }

    #[tokio::test]
    async fn test_complete_capture_has_no_marker() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        h.exchange(15, get("http://example.com/movie.mp4"), partial("bytes 0-199/200", &[7u8; 200]))
            .await;
        let out = h.finish().await;

        assert_eq!(out.file_names(), vec!["000015_b_movie.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_range_is_ignored() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        h.exchange(16, get("http://example.com/movie.mp4"), partial("frames 1-2/3", b"ab"))
            .await;
        let out = h.finish().await;

        assert_eq!(out.file_names(), vec!["000016_b_movie.mp4".to_string()]);
        assert!(out.errors.is_empty());
    }
}

// =============================================================================
// Filter and Inline Tests
// =============================================================================

mod policy_tests {
    use super::*;

    #[tokio::test]
    async fn test_filename_deny_filter_skips_body() {
        let filter = FilterConfig {
            skip_if_match: vec![r"\.exe$".to_string()],
            ..Default::default()
        };
        let h = harness(CaptureConfig::default(), filter);
        h.exchange(17, get("http://example.com/setup.exe"), ok("application/octet-stream", b"MZ"))
            .await;
        h.exchange(18, get("http://example.com/readme.txt"), ok("text/plain", b"read me"))
            .await;
        let out = h.finish().await;

        assert_eq!(out.file_names(), vec!["000018_b_readme.txt".to_string()]);
        assert!(out.log.contains("\t\t(skipped by filter)"));
    }

    #[tokio::test]
    async fn test_content_type_allow_filter() {
        let filter = FilterConfig {
            save_content_types: vec!["image/png".to_string()],
            ..Default::default()
        };
        let h = harness(CaptureConfig::default(), filter);
        h.exchange(19, get("http://example.com/a.png"), ok("image/png", b"\x89PNG"))
            .await;
        h.exchange(20, get("http://example.com/a.html"), ok("text/html", b"<p/>"))
            .await;
        let out = h.finish().await;

        assert_eq!(out.file_names(), vec!["000019_b_a.png".to_string()]);
    }

    #[tokio::test]
    async fn test_inline_text_keeps_binary_in_files() {
        let capture = CaptureConfig {
            inline: InlineMode::Text,
            ..Default::default()
        };
        let h = harness(capture, FilterConfig::default());
        h.exchange(21, get("http://example.com/a.txt"), ok("text/plain", b"line one\nline two"))
            .await;
        h.exchange(22, get("http://example.com/a.png"), ok("image/png", b"\x89PNG"))
            .await;
        let out = h.finish().await;

        assert!(out.log.contains("\t---- Resp: body ----\n\t\tline one\n\t\tline two\n"));
        assert_eq!(out.file_names(), vec!["000022_b_a.png".to_string()]);
    }

    #[tokio::test]
    async fn test_inline_text_includes_untyped_bodies() {
        let capture = CaptureConfig {
            inline: InlineMode::Text,
            ..Default::default()
        };
        let h = harness(capture, FilterConfig::default());
        let request = Request::post("http://example.com/submit")
            .body(chunked_body(&[b"hello plain"]))
            .unwrap();
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(chunked_body(&[b"untyped reply"]))
            .unwrap();
        h.exchange(26, request, response).await;
        let out = h.finish().await;

        assert!(out.log.contains("\t---- Req: body ----\n\t\thello plain\n"));
        assert!(out.log.contains("\t---- Resp: body ----\n\t\tuntyped reply\n"));
        assert!(out.file_names().is_empty(), "files: {:?}", out.file_names());
    }

    #[tokio::test]
    async fn test_inline_form_is_decoded() {
        let capture = CaptureConfig {
            inline: InlineMode::All,
            ..Default::default()
        };
        let h = harness(capture, FilterConfig::default());
        h.exchange(
            23,
            post(
                "http://example.com/login",
                "application/x-www-form-urlencoded",
                b"user=alice&note=hello+there%21",
            ),
            ok("text/plain", b"welcome"),
        )
        .await;
        let out = h.finish().await;

        assert!(out.log.contains("\t---- Req: body ----\n\t\tuser=alice\n\t\tnote=hello there!\n"));
        assert!(out.file_names().is_empty());
    }

    #[tokio::test]
    async fn test_raw_form_kept_in_file() {
        let capture = CaptureConfig {
            raw_form: true,
            ..Default::default()
        };
        let h = harness(capture, FilterConfig::default());
        h.exchange(
            24,
            post("http://example.com/login", "application/x-www-form-urlencoded", b"a=1&b=2"),
            ok("text/plain", b""),
        )
        .await;
        let out = h.finish().await;

        assert_eq!(out.file_names(), vec!["000024_a_POST.bin".to_string()]);
        assert_eq!(out.file("000024_a_POST.bin"), b"a=1&b=2");
    }

    #[tokio::test]
    async fn test_form_decoded_into_file() {
        let h = harness(CaptureConfig::default(), FilterConfig::default());
        h.exchange(
            25,
            post("http://example.com/login", "application/x-www-form-urlencoded", b"a=1&b=x%20y"),
            ok("text/plain", b""),
        )
        .await;
        let out = h.finish().await;

        assert_eq!(out.file("000025_a_POST.bin"), b"a=1\nb=x y\n");
    }
}

// =============================================================================
// Concurrency Tests
// =============================================================================

mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_exchanges_do_not_leak_into_each_other() {
        let h = Arc::new(harness(CaptureConfig::default(), FilterConfig::default()));

        let tasks: Vec<_> = (100..132u64)
            .map(|id| {
                let h = Arc::clone(&h);
                tokio::spawn(async move {
                    let body = format!("body of {id}").into_bytes();
                    let response = Response::builder()
                        .header(header::CONTENT_TYPE, "text/plain")
                        .body(chunked_body(&[&body[..4], &body[4..]]))
                        .unwrap();
                    h.exchange(id, get(&format!("http://example.com/f{id}.txt")), response)
                        .await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let h = Arc::into_inner(h).unwrap();
        let out = h.finish().await;

        for id in 100..132u64 {
            let name = format!("000{id}_b_f{id}.txt");
            assert_eq!(out.file(&name), format!("body of {id}").into_bytes());
        }
        assert_eq!(out.log.matches("close_resp").count(), 32);
    }
}
