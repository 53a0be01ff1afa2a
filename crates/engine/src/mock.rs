//! Scripted engine for tests. Outcomes are queued per transcribe
//! call; loads, unloads and observed cancellations are counted so
//! lifecycle tests can assert on them.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use scribe_core::model::WhisperModel;
use scribe_core::task::TranscriptSegment;

use crate::{
    AudioMetadata, Device, DownloadProgress, EngineError, EngineResult, ModelHandle,
    Transcription, TranscriptionEngine,
};

/// What the next transcribe call should do.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Success { text: String, language: String },
    Transient(String),
    Fatal(String),
    InvalidInput(String),
    /// Sleep this long before succeeding; lets tests drive timeouts
    /// and mid-transcribe cancellation.
    Slow(Duration),
}

struct MockState {
    outcomes: VecDeque<MockOutcome>,
    loads: usize,
    unloads: usize,
    load_failures: VecDeque<EngineError>,
}

/// Engine whose behavior is a queue of scripted outcomes. With an
/// empty queue every call succeeds immediately.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    transcribe_latency: Duration,
    download_steps: Vec<i8>,
    peak_memory_gb: Option<f64>,
    transcribed: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                outcomes: VecDeque::new(),
                loads: 0,
                unloads: 0,
                load_failures: VecDeque::new(),
            })),
            transcribe_latency: Duration::from_millis(5),
            download_steps: Vec::new(),
            peak_memory_gb: None,
            transcribed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.transcribe_latency = latency;
        self
    }

    /// Progress values emitted through the download callback on every
    /// load, simulating a model fetch.
    pub fn with_download_steps(mut self, steps: Vec<i8>) -> Self {
        self.download_steps = steps;
        self
    }

    /// Peak memory every handle reports, feeding pool calibration.
    pub fn with_peak_memory(mut self, gb: f64) -> Self {
        self.peak_memory_gb = Some(gb);
        self
    }

    /// Queue an outcome for a future transcribe call (FIFO).
    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.state.lock().outcomes.push_back(outcome);
    }

    /// Queue a failure for a future load call.
    pub fn push_load_failure(&self, error: EngineError) {
        self.state.lock().load_failures.push_back(error);
    }

    pub fn loads(&self) -> usize {
        self.state.lock().loads
    }

    pub fn unloads(&self) -> usize {
        self.state.lock().unloads
    }

    pub fn transcribe_calls(&self) -> usize {
        self.transcribed.load(Ordering::SeqCst)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptionEngine for MockEngine {
    async fn load(
        &self,
        model: WhisperModel,
        _device: Device,
        progress: DownloadProgress<'_>,
    ) -> EngineResult<Box<dyn ModelHandle>> {
        if let Some(error) = self.state.lock().load_failures.pop_front() {
            progress(-1, "model fetch failed");
            return Err(error);
        }
        for step in &self.download_steps {
            progress(*step, &format!("fetching {model}"));
        }
        self.state.lock().loads += 1;
        Ok(Box::new(MockHandle {
            engine: self.clone(),
        }))
    }
}

struct MockHandle {
    engine: MockEngine,
}

#[async_trait]
impl ModelHandle for MockHandle {
    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<&str>,
    ) -> EngineResult<Transcription> {
        let outcome = self
            .engine
            .state
            .lock()
            .outcomes
            .pop_front()
            .unwrap_or(MockOutcome::Success {
                text: "transcribed audio".to_string(),
                language: "en".to_string(),
            });

        tokio::time::sleep(self.engine.transcribe_latency).await;
        self.engine.transcribed.fetch_add(1, Ordering::SeqCst);

        match outcome {
            MockOutcome::Success { text, language: detected } => {
                let detected = match language {
                    Some(code) if code != "auto" => code.to_string(),
                    _ => detected,
                };
                Ok(Transcription {
                    segments: vec![TranscriptSegment {
                        start: 0.0,
                        end: 2.0,
                        text: text.clone(),
                    }],
                    text,
                    detected_language: detected,
                })
            }
            MockOutcome::Transient(msg) => Err(EngineError::Transient(msg)),
            MockOutcome::Fatal(msg) => Err(EngineError::Fatal(msg)),
            MockOutcome::InvalidInput(msg) => Err(EngineError::InvalidInput(format!(
                "{msg}: {}",
                audio.display()
            ))),
            MockOutcome::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Transcription {
                    text: "slow transcription".to_string(),
                    detected_language: "en".to_string(),
                    segments: Vec::new(),
                })
            }
        }
    }

    fn peak_memory_gb(&self) -> Option<f64> {
        self.engine.peak_memory_gb
    }

    async fn unload(self: Box<Self>) {
        self.engine.state.lock().unloads += 1;
    }
}

/// Fixed-duration metadata source.
pub struct StaticMetadata {
    duration_secs: f64,
}

impl StaticMetadata {
    pub fn new(duration_secs: f64) -> Self {
        Self { duration_secs }
    }
}

impl AudioMetadata for StaticMetadata {
    fn duration_seconds(&self, _audio: &Path) -> EngineResult<f64> {
        Ok(self.duration_secs)
    }
}
