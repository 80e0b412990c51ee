//! # Playback Queue
//!
//! Owns the contract for gapless sequential playback of decoded sample
//! buffers and for immediate termination on interruption.
//!
//! ## Design:
//! A dedicated tokio task holds the FIFO queue and drives an [`AudioSink`]
//! (the output-device seam). Callers talk to the task through a single
//! command channel, so ordering between `enqueue` and `interrupt` is the
//! channel's FIFO order: an interrupt issued before later enqueues is
//! always acted on first. While a buffer is playing, the task selects
//! between the in-flight sink future and the command channel; `Interrupt`
//! drops the future on the spot, which stops the active buffer mid-sample.
//!
//! ## Guarantees:
//! - Buffers play strictly in enqueue order with at most one active buffer.
//! - The next buffer starts within one loop iteration of the previous one
//!   finishing (no audible gap).
//! - A natural drain emits [`PlaybackEvent::Idle`]; an interrupted drain
//!   does not.
//! - `interrupt` is idempotent and a no-op when already idle.

use crate::engine::codec::SampleBuffer;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The output device. `play` resolves when the buffer has finished playing;
/// dropping the returned future stops the buffer immediately.
#[async_trait]
pub trait AudioSink: Send + 'static {
    async fn play(&mut self, buffer: SampleBuffer) -> EngineResult<()>;
}

/// Hand-offs from the playback task to the session worker.
#[derive(Debug)]
pub enum PlaybackEvent {
    /// The queue drained naturally: the last enqueued buffer finished and
    /// nothing is pending.
    Idle,
    /// The sink failed; all queued buffers were discarded.
    Failed(EngineError),
}

enum PlaybackCommand {
    Enqueue(SampleBuffer),
    Interrupt,
}

/// Handle to a session's playback task.
pub struct PlaybackQueue {
    commands: mpsc::UnboundedSender<PlaybackCommand>,
}

impl PlaybackQueue {
    /// Spawn the playback task over the given sink. Returns the handle and
    /// the event stream the session worker listens on.
    pub fn spawn<S: AudioSink>(sink: S) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_playback(sink, command_rx, event_tx));
        (Self { commands }, event_rx)
    }

    /// Append a decoded buffer. Playback of the head starts immediately if
    /// nothing is currently playing.
    pub fn enqueue(&self, buffer: SampleBuffer) {
        let _ = self.commands.send(PlaybackCommand::Enqueue(buffer));
    }

    /// Stop the active buffer mid-sample, discard everything queued, and
    /// return to idle. Safe to call when already idle, and safe to call
    /// repeatedly.
    pub fn interrupt(&self) {
        let _ = self.commands.send(PlaybackCommand::Interrupt);
    }
}

async fn run_playback<S: AudioSink>(
    mut sink: S,
    mut commands: mpsc::UnboundedReceiver<PlaybackCommand>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) {
    let mut queue: VecDeque<SampleBuffer> = VecDeque::new();

    loop {
        // Idle: wait for work.
        let Some(command) = commands.recv().await else {
            return;
        };
        match command {
            PlaybackCommand::Interrupt => continue,
            PlaybackCommand::Enqueue(buffer) => queue.push_back(buffer),
        }

        let mut interrupted = false;
        let mut failed = false;

        // Drain the queue; each iteration plays exactly one buffer.
        'playing: while let Some(buffer) = queue.pop_front() {
            let play = sink.play(buffer);
            tokio::pin!(play);

            loop {
                tokio::select! {
                    result = &mut play => {
                        match result {
                            Ok(()) => break,
                            Err(e) => {
                                warn!(error = %e, "playback sink failed, discarding queue");
                                queue.clear();
                                let _ = events.send(PlaybackEvent::Failed(e));
                                failed = true;
                                break 'playing;
                            }
                        }
                    }
                    command = commands.recv() => {
                        match command {
                            Some(PlaybackCommand::Enqueue(buffer)) => {
                                queue.push_back(buffer);
                            }
                            Some(PlaybackCommand::Interrupt) => {
                                // Dropping `play` stops the active buffer
                                // mid-sample.
                                debug!(discarded = queue.len(), "playback interrupted");
                                queue.clear();
                                interrupted = true;
                                break 'playing;
                            }
                            None => return,
                        }
                    }
                }
            }
        }

        if !interrupted && !failed {
            let _ = events.send(PlaybackEvent::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;
    use tokio::time::{timeout, Duration};

    /// Sink that records starts/completions; completion is either instant
    /// or gated on a test-controlled release.
    struct TestSink {
        started: Arc<Mutex<Vec<u32>>>,
        completed: Arc<Mutex<Vec<u32>>>,
        release: Option<Arc<Notify>>,
        active: Arc<Mutex<u32>>,
        max_active: Arc<Mutex<u32>>,
    }

    impl TestSink {
        fn instant() -> (Self, Arc<Mutex<Vec<u32>>>, Arc<Mutex<Vec<u32>>>) {
            let started = Arc::new(Mutex::new(Vec::new()));
            let completed = Arc::new(Mutex::new(Vec::new()));
            let sink = Self {
                started: started.clone(),
                completed: completed.clone(),
                release: None,
                active: Arc::new(Mutex::new(0)),
                max_active: Arc::new(Mutex::new(0)),
            };
            (sink, started, completed)
        }

        fn gated() -> (Self, Arc<Mutex<Vec<u32>>>, Arc<Mutex<Vec<u32>>>, Arc<Notify>) {
            let (mut sink, started, completed) = Self::instant();
            let release = Arc::new(Notify::new());
            sink.release = Some(release.clone());
            (sink, started, completed, release)
        }
    }

    #[async_trait]
    impl AudioSink for TestSink {
        async fn play(&mut self, buffer: SampleBuffer) -> EngineResult<()> {
            let id = buffer.samples[0] as u32;
            {
                let mut active = self.active.lock().unwrap();
                *active += 1;
                let mut max = self.max_active.lock().unwrap();
                *max = (*max).max(*active);
            }
            self.started.lock().unwrap().push(id);
            if let Some(release) = &self.release {
                release.notified().await;
            }
            self.completed.lock().unwrap().push(id);
            *self.active.lock().unwrap() -= 1;
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AudioSink for FailingSink {
        async fn play(&mut self, _buffer: SampleBuffer) -> EngineResult<()> {
            Err(EngineError::DeviceUnavailable("output device lost".into()))
        }
    }

    fn buffer(id: u32) -> SampleBuffer {
        SampleBuffer::new(vec![id as i16; 4], 24000)
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within budget");
    }

    #[tokio::test]
    async fn test_buffers_play_in_enqueue_order() {
        let (sink, _started, completed) = TestSink::instant();
        let max_active = sink.max_active.clone();
        let (queue, mut events) = PlaybackQueue::spawn(sink);

        for id in 1..=3 {
            queue.enqueue(buffer(id));
        }

        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert!(matches!(event, Some(PlaybackEvent::Idle)));
        assert_eq!(*completed.lock().unwrap(), vec![1, 2, 3]);
        // Never more than one buffer driving the sink
        assert_eq!(*max_active.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_stops_active_buffer_and_discards_queue() {
        let (sink, started, completed, release) = TestSink::gated();
        let (queue, mut events) = PlaybackQueue::spawn(sink);

        for id in 1..=3 {
            queue.enqueue(buffer(id));
        }
        wait_until(|| started.lock().unwrap().len() == 1).await;

        queue.interrupt();

        // A fresh buffer enqueued after the interrupt still plays; buffers
        // 2 and 3 were discarded without ever starting.
        queue.enqueue(buffer(9));
        wait_until(|| started.lock().unwrap().contains(&9)).await;
        assert_eq!(*started.lock().unwrap(), vec![1, 9]);

        release.notify_one();
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert!(matches!(event, Some(PlaybackEvent::Idle)));
        // Buffer 1 was dropped mid-play and never completed.
        assert_eq!(*completed.lock().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_interrupt_while_idle_is_noop() {
        let (sink, _started, completed) = TestSink::instant();
        let (queue, mut events) = PlaybackQueue::spawn(sink);

        queue.interrupt();
        queue.interrupt();

        queue.enqueue(buffer(7));
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert!(matches!(event, Some(PlaybackEvent::Idle)));
        assert_eq!(*completed.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_no_idle_event_after_interrupt() {
        let (sink, started, _completed, _release) = TestSink::gated();
        let (queue, mut events) = PlaybackQueue::spawn(sink);

        queue.enqueue(buffer(1));
        wait_until(|| started.lock().unwrap().len() == 1).await;
        queue.interrupt();

        // Interrupted drains stay silent; only a natural drain emits Idle.
        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_sink_failure_surfaces_and_clears() {
        let (queue, mut events) = PlaybackQueue::spawn(FailingSink);

        queue.enqueue(buffer(1));
        queue.enqueue(buffer(2));

        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        match event {
            Some(PlaybackEvent::Failed(EngineError::DeviceUnavailable(_))) => {}
            other => panic!("expected device failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_enqueue_during_playback_extends_queue() {
        let (sink, started, completed, release) = TestSink::gated();
        let (queue, mut events) = PlaybackQueue::spawn(sink);

        queue.enqueue(buffer(1));
        wait_until(|| started.lock().unwrap().len() == 1).await;
        queue.enqueue(buffer(2));

        release.notify_one();
        wait_until(|| started.lock().unwrap().len() == 2).await;
        release.notify_one();

        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert!(matches!(event, Some(PlaybackEvent::Idle)));
        assert_eq!(*completed.lock().unwrap(), vec![1, 2]);
    }
}
