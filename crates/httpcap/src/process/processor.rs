//! The close-time processor

use bytes::Bytes;
use http::{HeaderMap, StatusCode, header};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::body::{FORM_URLENCODED, decode_content, decode_form};
use super::media::MediaType;
use super::naming::{ResponseName, disposition_filename, request_file_name, url_filename};
use super::policy::CapturePolicy;
use super::range::ContentRange;
use super::{status_text, timestamp};
use crate::capture::{Exchange, SessionTable};
use crate::error::{CaptureError, ErrorSender, Result};
use crate::logwriter::{LogRecord, LogSender};

/// Turns closed exchanges into log records and body files
///
/// Each exchange is processed at most once: processing starts by removing the
/// exchange from the session table and stops if someone else already did.
pub struct CloseProcessor {
    sessions: Arc<SessionTable>,
    policy: CapturePolicy,
    capture_dir: PathBuf,
    log: LogSender,
    errors: ErrorSender,
}

/// A body ready to be logged inline or saved
struct BodyOutput {
    media: Option<MediaType>,
    is_text: bool,
    file_name: String,
    body: Bytes,
    form: bool,
}

impl CloseProcessor {
    pub fn new(
        sessions: Arc<SessionTable>,
        policy: CapturePolicy,
        capture_dir: impl Into<PathBuf>,
        log: LogSender,
        errors: ErrorSender,
    ) -> Self {
        Self {
            sessions,
            policy,
            capture_dir: capture_dir.into(),
            log,
            errors,
        }
    }

    /// Process an exchange whose response body was closed
    ///
    /// `outcome` is the close error of the response body. Returns `false` when
    /// the exchange had already been claimed.
    pub async fn process(&self, exchange: Arc<Exchange>, outcome: Option<std::io::Error>) -> bool {
        if !self.claim(&exchange) {
            return false;
        }

        match outcome {
            Some(error) => self.log_failure(&exchange, &error),
            None => {
                let mut record = LogRecord::new();
                let result = self.render(&exchange, &mut record).await;
                // Whatever was rendered before a failure is still logged
                self.log.flush(record);
                if let Err(e) = result {
                    tracing::debug!("Processing session {} stopped: {e}", exchange.session_id);
                    self.errors.report(e);
                }
            }
        }
        true
    }

    /// Discard an exchange that will never see a response
    ///
    /// Logs a `failed` line. Returns `false` when the exchange had already
    /// been claimed.
    pub fn abandon(&self, exchange: &Arc<Exchange>, error: &dyn fmt::Display) -> bool {
        if !self.claim(exchange) {
            return false;
        }
        self.log_failure(exchange, error);
        true
    }

    fn claim(&self, exchange: &Arc<Exchange>) -> bool {
        let claimed = self.sessions.remove(exchange.session_id, exchange);
        if !claimed {
            tracing::debug!(
                "Session {} already processed or replaced, ignoring close",
                exchange.session_id
            );
        }
        claimed
    }

    fn log_failure(&self, exchange: &Exchange, error: &dyn fmt::Display) {
        let mut record = LogRecord::new();
        record.line(format_args!(
            "{} [{}] failed ({error}) {} {}",
            timestamp(),
            exchange.session_id,
            exchange.request.method,
            exchange.request.uri
        ));
        self.log.flush(record);
    }

    async fn render(&self, exchange: &Exchange, record: &mut LogRecord) -> Result<()> {
        let request = &exchange.request;
        let response = exchange.response();
        let status = response
            .map(|response| status_text(response.status))
            .unwrap_or_else(|| "-".to_string());

        record.line(format_args!(
            "{} [{}] close_resp ({status}) {} {}",
            timestamp(),
            exchange.session_id,
            request.method,
            request.uri
        ));

        record.line(format_args!("\t==== Req: headers ===="));
        write_headers(record, &request.headers);

        let request_capture = exchange.request_capture();
        if !request_capture.is_empty() {
            record.line(format_args!("\t---- Req: body ----"));
            let media = classify(&request.headers);
            let form = !self.policy.raw_form
                && media.as_ref().is_some_and(|media| media.essence == FORM_URLENCODED);
            let output = BodyOutput {
                file_name: request_file_name(exchange.session_id, request.method.as_str(), media.as_ref()),
                body: decode_content(&request.headers, request_capture.to_bytes())?,
                is_text: is_text(&request.headers, media.as_ref()),
                media,
                form,
            };
            self.write_body(record, output).await?;
        }

        let Some(response) = response else {
            record.blank();
            return Ok(());
        };

        record.line(format_args!("\t==== Resp ({status}): headers ===="));
        write_headers(record, &response.headers);

        if let Some(response_capture) = exchange.response_capture().filter(|c| !c.is_empty()) {
            record.line(format_args!("\t---- Resp: body ----"));
            let media = classify(&response.headers);
            let filename =
                disposition_filename(&response.headers).or_else(|| url_filename(&request.uri));
            let marker = if response.status == StatusCode::PARTIAL_CONTENT {
                partial_marker(&response.headers, response_capture.len() as u64)
            } else {
                None
            };
            let file_name = ResponseName {
                session_id: exchange.session_id,
                filename: filename.as_deref(),
                media: media.as_ref(),
                marker: marker.as_deref(),
                max_len: self.policy.filename_max_len,
            }
            .build();

            let output = BodyOutput {
                file_name,
                body: decode_content(&response.headers, response_capture.to_bytes())?,
                is_text: is_text(&response.headers, media.as_ref()),
                media,
                form: false,
            };
            self.write_body(record, output).await?;
        }

        record.blank();
        Ok(())
    }

    async fn write_body(&self, record: &mut LogRecord, output: BodyOutput) -> Result<()> {
        let essence = output.media.as_ref().map_or("", |media| media.essence.as_str());
        if !self.policy.should_save(essence, &output.file_name) {
            record.line(format_args!("\t\t(skipped by filter)"));
            return Ok(());
        }

        let body = if output.form {
            match decode_form(&output.body) {
                Some(lines) => Bytes::from(lines),
                None => output.body,
            }
        } else {
            output.body
        };

        if self.policy.inline.inlines(output.is_text) {
            for line in String::from_utf8_lossy(&body).lines() {
                record.line(format_args!("\t\t{line}"));
            }
            return Ok(());
        }

        let path = self.capture_dir.join(&output.file_name);
        tokio::fs::write(&path, &body)
            .await
            .map_err(|source| CaptureError::Persist { path, source })?;
        record.line(format_args!("\t\t(saved to {})", output.file_name));
        Ok(())
    }
}

fn write_headers(record: &mut LogRecord, headers: &HeaderMap) {
    for (name, value) in headers {
        record.line(format_args!(
            "\t\t{name}: {}",
            String::from_utf8_lossy(value.as_bytes())
        ));
    }
}

/// Classification of the first `Content-Type` header, if it parses
fn classify(headers: &HeaderMap) -> Option<MediaType> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    match MediaType::parse(value) {
        Ok(media) => Some(media),
        Err(e) => {
            tracing::debug!("Unclassified body: {e}");
            None
        }
    }
}

/// Untyped bodies count as text; typed ones follow their classification
fn is_text(headers: &HeaderMap, media: Option<&MediaType>) -> bool {
    match media {
        Some(media) => media.is_text,
        None => headers
            .get(header::CONTENT_TYPE)
            .is_none_or(|value| value.as_bytes().trim_ascii().is_empty()),
    }
}

fn partial_marker(headers: &HeaderMap, captured: u64) -> Option<String> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    match ContentRange::parse(value) {
        Ok(range) => range.partial_marker(captured),
        Err(e) => {
            tracing::debug!("Ignoring Content-Range: {e}");
            None
        }
    }
}
