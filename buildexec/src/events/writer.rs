//! Turns raw process output into durable log events.

use crate::core::{Event, Origin};
use crate::db::Build;
use crate::errors::Result;
use crate::utils::Clock;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Rewrites a payload before it is saved, e.g. to scrub credentials.
pub type OutputFilter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// How long a redacting writer may hold output without a line break.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Writes one output stream of one step into the build's event log.
///
/// The writer never splits a multi-byte character across events. Without a
/// filter every write is saved as is. With a filter, output is saved up to
/// the last line break so that a secret is never cut in half before the
/// filter sees it; text without a line break is held until the next break,
/// until [`EventWriter::close`], or until nothing has been flushed for the
/// flush interval.
pub struct EventWriter {
    build: Arc<dyn Build>,
    origin: Origin,
    clock: Arc<dyn Clock>,
    filter: Option<OutputFilter>,
    flush_interval: Duration,
    dangling: Vec<u8>,
    last_flush: DateTime<Utc>,
}

impl EventWriter {
    /// Creates a writer that saves every write immediately.
    #[must_use]
    pub fn new(build: Arc<dyn Build>, origin: Origin, clock: Arc<dyn Clock>) -> Self {
        let last_flush = clock.now();
        Self {
            build,
            origin,
            clock,
            filter: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            dangling: Vec::new(),
            last_flush,
        }
    }

    /// Buffers output by line and passes every payload through `filter`.
    #[must_use]
    pub fn with_filter(mut self, filter: OutputFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets how long line-buffered output may be held.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Accepts a chunk of output. Returns the number of bytes consumed, which
    /// is all of them unless saving fails.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut text = std::mem::take(&mut self.dangling);
        text.extend_from_slice(data);

        if ends_mid_character(&text) {
            self.dangling = text;
            return Ok(data.len());
        }

        if self.filter.is_none() {
            self.flush(&text).await?;
            return Ok(data.len());
        }

        if let Some(boundary) = text.iter().rposition(|b| matches!(b, b'\n' | b'\r')) {
            self.dangling = text.split_off(boundary + 1);
            self.flush(&text).await?;
        } else if self.is_stale() {
            self.flush(&text).await?;
        } else {
            self.dangling = text;
        }

        Ok(data.len())
    }

    /// Saves whatever is still buffered. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        let text = std::mem::take(&mut self.dangling);
        self.flush(&text).await
    }

    fn is_stale(&self) -> bool {
        let elapsed = self.clock.now() - self.last_flush;
        elapsed
            .to_std()
            .map_or(false, |elapsed| elapsed >= self.flush_interval)
    }

    async fn flush(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let text = String::from_utf8_lossy(bytes);
        let payload = match &self.filter {
            Some(filter) => filter(&text),
            None => text.into_owned(),
        };

        self.build
            .save_event(Event::Log {
                time: self.clock.unix(),
                origin: self.origin.clone(),
                payload,
            })
            .await?;

        self.last_flush = self.clock.now();
        Ok(())
    }
}

impl fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventWriter")
            .field("origin", &self.origin)
            .field("filtered", &self.filter.is_some())
            .field("dangling", &self.dangling.len())
            .finish()
    }
}

/// True if `bytes` ends partway through a UTF-8 sequence that more input
/// could still complete.
fn ends_mid_character(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(_) => false,
        Err(err) => err.error_len().is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OriginSource;
    use crate::exec::CredentialTracker;
    use crate::testing::FakeBuild;
    use crate::utils::FakeClock;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(1991, 6, 3, 5, 30, 0).unwrap()
    }

    fn origin() -> Origin {
        Origin::new("some-plan-id".into()).with_source(OriginSource::Stdout)
    }

    fn log(payload: &str) -> Event {
        Event::Log {
            time: now().timestamp(),
            origin: origin(),
            payload: payload.to_string(),
        }
    }

    fn redacting(build: &FakeBuild, clock: &FakeClock) -> EventWriter {
        let tracker = Arc::new(CredentialTracker::new(true));
        tracker.track("source-param", &serde_json::json!("super-secret-source"));
        tracker.track("git-key", &serde_json::json!("{\n123\n456\n789\n}\n"));

        EventWriter::new(Arc::new(build.clone()), origin(), Arc::new(clock.clone()))
            .with_filter(Arc::new(move |s: &str| tracker.redact(s)))
    }

    fn plain(build: &FakeBuild, clock: &FakeClock) -> EventWriter {
        EventWriter::new(Arc::new(build.clone()), origin(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_redacts_single_line_secret() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut writer = redacting(&build, &clock);

        let input = b"ok super-secret-source ok";
        assert_eq!(writer.write(input).await.unwrap(), input.len());
        writer.close().await.unwrap();

        assert_eq!(build.events(), vec![log("ok ((redacted)) ok")]);
    }

    #[tokio::test]
    async fn test_redaction_survives_any_split() {
        let input = b"ok super-secret-source ok";
        for offset in 1..input.len() {
            let build = FakeBuild::new(1);
            let clock = FakeClock::new(now());
            let mut writer = redacting(&build, &clock);

            writer.write(&input[..offset]).await.unwrap();
            writer.write(&input[offset..]).await.unwrap();
            writer.close().await.unwrap();

            assert_eq!(build.events(), vec![log("ok ((redacted)) ok")], "split at {offset}");
        }
    }

    #[tokio::test]
    async fn test_redacts_multi_line_secret() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut writer = redacting(&build, &clock);

        writer.write(b"ok123ok\nok456ok\nok789ok\n").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(
            build.events(),
            vec![log("ok((redacted))ok\nok((redacted))ok\nok((redacted))ok\n")]
        );
    }

    #[tokio::test]
    async fn test_holds_partial_line_until_break() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut writer = redacting(&build, &clock);

        writer.write(b"ok123ok\nok4").await.unwrap();
        writer.write(b"56ok\nok789ok\n").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(
            build.events(),
            vec![
                log("ok((redacted))ok\n"),
                log("ok((redacted))ok\nok((redacted))ok\n"),
            ]
        );
    }

    #[tokio::test]
    async fn test_line_buffering_splits_on_last_break() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut writer = redacting(&build, &clock);

        assert_eq!(writer.write(b"hello\nworld").await.unwrap(), 11);
        writer.close().await.unwrap();

        assert_eq!(build.events(), vec![log("hello\n"), log("world")]);
    }

    #[tokio::test]
    async fn test_stale_output_is_flushed_without_break() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut writer = redacting(&build, &clock);

        writer.write(b"progress").await.unwrap();
        assert!(build.events().is_empty());

        clock.advance(Duration::from_secs(1));
        writer.write(b"...").await.unwrap();

        let events = build.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Log { payload, .. } if payload == "progress..."));
    }

    #[tokio::test]
    async fn test_unfiltered_writes_are_not_buffered() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut writer = plain(&build, &clock);

        for chunk in [b"1\r", b"2\r", b"3\r"] {
            assert_eq!(writer.write(chunk).await.unwrap(), 2);
        }
        writer.close().await.unwrap();

        assert_eq!(build.events(), vec![log("1\r"), log("2\r"), log("3\r")]);
    }

    #[tokio::test]
    async fn test_never_splits_a_character() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut writer = plain(&build, &clock);

        let bytes = "日".as_bytes();
        assert_eq!(bytes.len(), 3);

        writer.write(&bytes[..1]).await.unwrap();
        assert!(build.events().is_empty());

        writer.write(&bytes[1..]).await.unwrap();
        assert_eq!(build.events(), vec![log("日")]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut writer = redacting(&build, &clock);

        writer.write(b"tail").await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(build.events(), vec![log("tail")]);
    }

    #[tokio::test]
    async fn test_save_failure_is_returned() {
        let build = FakeBuild::new(1);
        build.fail_save_event("nope");
        let clock = FakeClock::new(now());
        let mut writer = plain(&build, &clock);

        let err = writer.write(b"hello\n").await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
