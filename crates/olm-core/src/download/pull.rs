//! Model pulls driven over the server's NDJSON stream.
//!
//! The server downloads layers itself; this side only reads its event
//! stream, aggregates per-layer byte counts and decides when the pull is
//! finished. A resumed pull re-issues the same request and the server skips
//! layers it already has.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::control::{ControlSignal, TaskControl};
use super::progress::{ProgressSnapshot, ProgressTracker};
use super::retry::RetryPolicy;
use crate::error::{CoreError, Result};
use crate::ollama::{OllamaClient, PullEvent};

/// Status fragments that describe protocol steps rather than anything a
/// user needs to read.
const TECHNICAL_MARKERS: &[&str] = &[
    "pulling",
    "verifying",
    "sha256",
    "digest",
    "manifest",
    "config",
    "modelfile",
    "license",
    "template",
    "parameters",
    "writing",
];

/// Byte counts for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerProgress {
    /// Layer size.
    pub total: u64,
    /// Bytes present.
    pub completed: u64,
}

/// Something the caller may want to show.
#[derive(Debug, Clone, PartialEq)]
pub enum PullUpdate {
    /// Human-readable status line.
    Status(String),
    /// Aggregated byte progress over all layers seen so far.
    Progress(ProgressSnapshot),
}

/// How a pull ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The server reported success or the model was already current.
    Completed {
        /// True when the server short-circuited because nothing was missing.
        already_current: bool,
    },
    /// Stopped on request. Re-issuing the pull continues it.
    Paused,
    /// Stopped on request.
    Cancelled,
}

/// True for statuses that mean the model is already present.
#[must_use]
pub fn is_satisfied_status(status: &str) -> bool {
    let status = status.to_ascii_lowercase();
    status.contains("already exists") || status.contains("already up to date")
}

/// True for protocol-step statuses that are hidden from the status channel.
#[must_use]
pub fn is_technical_status(status: &str) -> bool {
    let status = status.to_ascii_lowercase();
    TECHNICAL_MARKERS.iter().any(|marker| status.contains(marker))
}

fn same_digest(a: &str, b: &str) -> bool {
    let strip = |d: &str| d.trim().trim_start_matches("sha256:").to_ascii_lowercase();
    !a.trim().is_empty() && strip(a) == strip(b)
}

fn stopped_outcome(signal: ControlSignal) -> PullOutcome {
    match signal {
        ControlSignal::Pause => PullOutcome::Paused,
        _ => PullOutcome::Cancelled,
    }
}

struct PullState {
    layers: BTreeMap<String, LayerProgress>,
    tracker: ProgressTracker,
    installed: Option<String>,
}

impl PullState {
    fn totals(&self) -> (u64, u64) {
        self.layers
            .values()
            .fold((0, 0), |(t, c), l| (t + l.total, c + l.completed.min(l.total)))
    }

    fn record(&mut self, digest: &str, layer: LayerProgress, now: Instant) {
        self.layers.insert(digest.to_string(), layer);
        let (total, completed) = self.totals();
        self.tracker.set_total(Some(total));
        self.tracker.record(completed, now);
    }

    /// Snapshot with every known layer counted as complete.
    fn finished_snapshot(&mut self, now: Instant) -> Option<ProgressSnapshot> {
        let (total, _) = self.totals();
        if total == 0 {
            return None;
        }
        for layer in self.layers.values_mut() {
            layer.completed = layer.total;
        }
        self.tracker.set_total(Some(total));
        self.tracker.record(total, now);
        Some(self.tracker.snapshot())
    }
}

/// Pull `name` through the model server.
///
/// Reads the event stream until the server reports success, the model turns
/// out to be current already, or `control` asks to stop. Connection failures
/// re-issue the pull under `retry`.
pub async fn pull_model<F>(
    client: &OllamaClient,
    name: &str,
    control: &TaskControl,
    retry: &RetryPolicy,
    progress_interval: Duration,
    mut on_update: F,
) -> Result<PullOutcome>
where
    F: FnMut(PullUpdate) + Send,
{
    let installed = match client.installed_digest(name).await {
        Ok(digest) => digest,
        Err(e) => {
            debug!("Could not read installed digest for {}: {}", name, e);
            None
        }
    };

    let mut state = PullState {
        layers: BTreeMap::new(),
        tracker: ProgressTracker::new(progress_interval),
        installed,
    };
    let mut attempt = 0;

    loop {
        let signal = control.signal();
        if signal != ControlSignal::Run {
            return Ok(stopped_outcome(signal));
        }

        let (_, completed) = state.totals();
        state.tracker.start(completed, None, Instant::now());

        match read_stream(client, name, control, &mut state, &mut on_update).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_retryable() && retry.allows_retry(attempt) => {
                attempt += 1;
                warn!(
                    "Pull of {} interrupted ({}), retry {}/{} in {:?}",
                    name, err, attempt, retry.max_retries, retry.backoff
                );
                if let Some(signal) = retry.wait(control).await {
                    return Ok(stopped_outcome(signal));
                }
            }
            Err(err) => return Err(err),
        }
    }
}

async fn read_stream<F>(
    client: &OllamaClient,
    name: &str,
    control: &TaskControl,
    state: &mut PullState,
    on_update: &mut F,
) -> Result<PullOutcome>
where
    F: FnMut(PullUpdate) + Send,
{
    info!("Pulling model {}", name);
    let mut stream = Box::pin(client.pull_stream(name));

    loop {
        let next = tokio::select! {
            biased;
            signal = control.stopped() => return Ok(stopped_outcome(signal)),
            next = stream.next() => next,
        };

        let Some(event) = next else {
            info!("Pull stream for {} ended", name);
            return Ok(PullOutcome::Completed {
                already_current: false,
            });
        };

        if let Some(outcome) = handle_event(event?, state, on_update)? {
            if let Some(snapshot) = state.finished_snapshot(Instant::now()) {
                on_update(PullUpdate::Progress(snapshot));
            }
            info!("Pull of {} finished: {:?}", name, outcome);
            return Ok(outcome);
        }

        let signal = control.signal();
        if signal != ControlSignal::Run {
            return Ok(stopped_outcome(signal));
        }
    }
}

/// Apply one event. Returns the outcome when the event is terminal.
fn handle_event<F>(
    event: PullEvent,
    state: &mut PullState,
    on_update: &mut F,
) -> Result<Option<PullOutcome>>
where
    F: FnMut(PullUpdate) + Send,
{
    if let Some(error) = event.error {
        return Err(CoreError::Api(error));
    }

    if is_satisfied_status(&event.status) {
        return Ok(Some(PullOutcome::Completed {
            already_current: true,
        }));
    }

    if let (Some(digest), Some(installed)) = (event.digest.as_deref(), state.installed.as_deref())
        && same_digest(digest, installed)
    {
        debug!("Layer {} matches the installed digest", digest);
        return Ok(Some(PullOutcome::Completed {
            already_current: true,
        }));
    }

    if event.status.eq_ignore_ascii_case("success") {
        return Ok(Some(PullOutcome::Completed {
            already_current: false,
        }));
    }

    match (event.digest.as_deref(), event.total) {
        (Some(digest), Some(total)) if total > 0 => {
            let layer = LayerProgress {
                total,
                completed: event.completed.unwrap_or(0),
            };
            let now = Instant::now();
            state.record(digest, layer, now);
            if state.tracker.should_emit(now) {
                on_update(PullUpdate::Progress(state.tracker.snapshot()));
            }
        }
        _ => {
            let status = event.status.trim();
            if !status.is_empty() && !is_technical_status(status) {
                on_update(PullUpdate::Status(status.to_string()));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(installed: Option<&str>) -> PullState {
        PullState {
            layers: BTreeMap::new(),
            tracker: ProgressTracker::new(Duration::ZERO),
            installed: installed.map(str::to_string),
        }
    }

    fn layer(digest: &str, total: u64, completed: u64) -> PullEvent {
        PullEvent {
            status: format!("pulling {digest}"),
            digest: Some(digest.to_string()),
            total: Some(total),
            completed: Some(completed),
            error: None,
        }
    }

    fn status(text: &str) -> PullEvent {
        PullEvent {
            status: text.to_string(),
            ..PullEvent::default()
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(is_satisfied_status("Already Exists"));
        assert!(is_satisfied_status("model already up to date"));
        assert!(!is_satisfied_status("success"));

        assert!(is_technical_status("pulling manifest"));
        assert!(is_technical_status("verifying sha256 digest"));
        assert!(!is_technical_status("downloading model weights"));
    }

    #[test]
    fn test_layers_aggregate() {
        let mut state = state(None);
        let mut updates = Vec::new();
        let mut sink = |u| updates.push(u);

        handle_event(layer("sha256:a", 100, 50), &mut state, &mut sink).unwrap();
        handle_event(layer("sha256:b", 300, 0), &mut state, &mut sink).unwrap();
        handle_event(layer("sha256:a", 100, 100), &mut state, &mut sink).unwrap();

        assert_eq!(state.totals(), (400, 100));
        let Some(PullUpdate::Progress(last)) = updates.last() else {
            panic!("expected progress");
        };
        assert!((last.percent() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_already_exists_is_terminal() {
        let mut state = state(None);
        let mut sink = |_| {};
        handle_event(layer("sha256:d", 100, 100), &mut state, &mut sink).unwrap();
        let outcome = handle_event(status("already exists"), &mut state, &mut sink).unwrap();
        assert_eq!(
            outcome,
            Some(PullOutcome::Completed {
                already_current: true
            })
        );
        let snapshot = state.finished_snapshot(Instant::now()).unwrap();
        assert!((snapshot.percent() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_installed_digest_is_terminal() {
        let mut state = state(Some("abc123"));
        let mut sink = |_| {};
        let outcome = handle_event(layer("sha256:ABC123", 10, 0), &mut state, &mut sink).unwrap();
        assert_eq!(
            outcome,
            Some(PullOutcome::Completed {
                already_current: true
            })
        );
    }

    #[test]
    fn test_technical_status_filtered() {
        let mut state = state(None);
        let mut updates = Vec::new();
        let mut sink = |u| updates.push(u);
        handle_event(status("pulling manifest"), &mut state, &mut sink).unwrap();
        handle_event(status("downloading weights"), &mut state, &mut sink).unwrap();
        assert_eq!(
            updates,
            vec![PullUpdate::Status("downloading weights".to_string())]
        );
    }

    #[test]
    fn test_error_event() {
        let mut state = state(None);
        let mut event = status("");
        event.error = Some("pull model manifest: file does not exist".to_string());
        let err = handle_event(event, &mut state, &mut |_| {}).unwrap_err();
        assert!(matches!(err, CoreError::Api(_)));
    }
}
