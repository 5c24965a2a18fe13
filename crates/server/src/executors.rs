//! Bounded inference worker pools. Each pool owns a fixed number of
//! blocking-friendly workers and accepts jobs over a bounded channel,
//! applying natural backpressure to the media pumps that feed it instead
//! of spawning unbounded work per frame.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

/// A lip-reading model consumes a buffered sequence of standardized,
/// grayscale mouth crops and returns a decoded utterance. The concrete
/// model (CTC beam search over a trained network) is out of scope here;
/// this trait is the seam a real model plugs into.
pub trait LipReadingModel: Send + Sync {
    fn predict(&self, frames: &[Vec<f32>]) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechResult {
    Partial(String),
    Final(String),
}

/// A speech recognizer consumes successive mono 16kHz PCM16 chunks and
/// reports either a partial or finalized transcript, mirroring a
/// streaming ASR engine's `AcceptWaveform` contract.
pub trait SpeechRecognizer: Send {
    fn accept_waveform(&mut self, pcm16: &[u8]) -> SpeechResult;
}

struct Job<I, O> {
    input: I,
    reply: oneshot::Sender<O>,
}

/// A pool of `worker_count` tasks draining a shared bounded queue. Used
/// for both the single-worker video pool and the multi-worker audio
/// pool; the worker body differs because the underlying model types
/// differ (`&self` vs `&mut self`).
pub struct VideoPool {
    sender: mpsc::Sender<Job<Vec<Vec<f32>>, String>>,
}

impl VideoPool {
    /// Per the adopted design, the video pool runs a single worker: the
    /// model processes one buffered sequence at a time.
    pub fn new(model: Arc<dyn LipReadingModel>, queue_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job<Vec<Vec<f32>>, String>>(queue_capacity);
        tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                let result = model.predict(&job.input);
                let _ = job.reply.send(result);
            }
        });
        Self { sender: tx }
    }

    pub async fn predict(&self, frames: Vec<Vec<f32>>) -> Option<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender.send(Job { input: frames, reply: reply_tx }).await.ok()?;
        reply_rx.await.ok()
    }
}

/// Sharded across `worker_count` independent recognizer instances, one
/// per in-flight call, since a streaming ASR session is stateful and
/// cannot be time-sliced across unrelated audio streams on one worker.
pub struct AudioWorkerHandle {
    sender: mpsc::Sender<Job<Vec<u8>, SpeechResult>>,
}

impl AudioWorkerHandle {
    pub fn spawn(mut recognizer: Box<dyn SpeechRecognizer>, queue_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job<Vec<u8>, SpeechResult>>(queue_capacity);
        tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                let result = recognizer.accept_waveform(&job.input);
                let _ = job.reply.send(result);
            }
        });
        Self { sender: tx }
    }

    pub async fn accept_chunk(&self, pcm16: Vec<u8>) -> Option<SpeechResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender.send(Job { input: pcm16, reply: reply_tx }).await.ok()?;
        reply_rx.await.ok()
    }
}

/// Chooses the default audio worker count: `min(4, cpus - 1)`, floored
/// at 1.
pub fn default_audio_worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    (cpus.saturating_sub(1)).clamp(1, 4)
}

/// Stand-in lip-reading model used when no trained model is configured:
/// always reports an empty utterance. Keeps the Media Terminus wired and
/// exercised end to end without depending on a real CTC decoder.
pub struct NoopLipReader;

impl LipReadingModel for NoopLipReader {
    fn predict(&self, _frames: &[Vec<f32>]) -> String {
        String::new()
    }
}

/// Stand-in speech recognizer used when no trained model is configured:
/// always reports an empty partial result.
pub struct NoopRecognizer;

impl SpeechRecognizer for NoopRecognizer {
    fn accept_waveform(&mut self, _pcm16: &[u8]) -> SpeechResult {
        SpeechResult::Partial(String::new())
    }
}
