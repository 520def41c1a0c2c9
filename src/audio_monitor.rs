use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};

use crate::{
    config::ActivityConfig,
    event::{emit, SessionEvent, SessionEventSender},
};

/// Anything that can hand out the latest time-domain PCM samples in `[-1, 1]`.
pub trait AudioSource: Send + Sync + Debug {
    /// Copies the most recent samples into `window` and returns how many were written.
    fn read_window(&self, window: &mut [f32]) -> usize;
}

/// How long pushed samples stay audible. Older samples read as silence.
pub const SAMPLE_MAX_AGE: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct Ring {
    samples: VecDeque<f32>,
    last_push: Option<Instant>,
}

/// Bounded ring of PCM samples. Capture code pushes into it and the monitor reads from it.
/// Once nothing was pushed for `max_age` the ring is emptied on the next read.
#[derive(Debug)]
pub struct SampleBuffer {
    capacity: usize,
    max_age: Duration,
    ring: Mutex<Ring>,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_max_age(capacity, SAMPLE_MAX_AGE)
    }

    pub fn with_max_age(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity,
            max_age,
            ring: Mutex::new(Ring {
                samples: VecDeque::with_capacity(capacity),
                last_push: None,
            }),
        }
    }

    pub fn push(&self, samples: &[f32]) {
        if let Ok(mut ring) = self.ring.lock() {
            for sample in samples {
                if ring.samples.len() == self.capacity {
                    ring.samples.pop_front();
                }
                ring.samples.push_back(sample.clamp(-1.0, 1.0));
            }
            ring.last_push = Some(Instant::now());
        }
    }

    /// Renders an RFC 6464 audio level (0 is loudest, 127 is silence, in -dBov) as a flat block with the same RMS.
    pub fn push_level(&self, level_dbov: u8, len: usize) {
        let db = -(f32::from(level_dbov.min(127)));
        let amplitude = if level_dbov >= 127 {
            0.0
        } else {
            10f32.powf(db / 20.0)
        };
        let block = vec![amplitude; len];
        self.push(&block);
    }

    pub fn clear(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.samples.clear();
            ring.last_push = None;
        }
    }
}

impl AudioSource for SampleBuffer {
    fn read_window(&self, window: &mut [f32]) -> usize {
        let Ok(mut ring) = self.ring.lock() else {
            return 0;
        };
        let stale = ring
            .last_push
            .map(|at| at.elapsed() > self.max_age)
            .unwrap_or(true);
        if stale {
            ring.samples.clear();
            return 0;
        }
        let count = window.len().min(ring.samples.len());
        let skip = ring.samples.len() - count;
        for (slot, sample) in window.iter_mut().zip(ring.samples.iter().skip(skip)) {
            *slot = *sample;
        }
        count
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt().clamp(0.0, 1.0)
}

fn round_level(level: f32) -> f32 {
    (level * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityUpdate {
    /// RMS loudness rounded to two decimals.
    pub level: f32,
    pub speaking: bool,
}

pub type OnActivityFn = Box<dyn Fn(ActivityUpdate) + Send + Sync>;

/// Tracks whether one audio source is speaking and reports changes only.
#[derive(Debug)]
pub struct AudioActivityMonitor {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioActivityMonitor {
    pub fn start(
        source: Arc<dyn AudioSource>,
        config: &ActivityConfig,
        on_activity: OnActivityFn,
    ) -> Self {
        let threshold = config.speaking_threshold;
        let interval = config.sample_interval;
        let window_size = config.window_size.max(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut window = vec![0.0f32; window_size];
            let mut last: Option<ActivityUpdate> = None;
            loop {
                ticker.tick().await;
                let len = source.read_window(&mut window);
                let update = evaluate(&window[..len], threshold);
                if last != Some(update) {
                    last = Some(update);
                    on_activity(update);
                }
            }
        });

        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops sampling. Calling it more than once is harmless.
    pub fn stop(&self) {
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
                tracing::debug!("AudioActivityMonitor is stopped");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|handle| handle.is_some())
            .unwrap_or(false)
    }
}

pub(crate) fn evaluate(samples: &[f32], threshold: f32) -> ActivityUpdate {
    let level = round_level(rms(samples));
    ActivityUpdate {
        level,
        speaking: level >= threshold,
    }
}

/// Monitor whose updates are reported as [`SessionEvent::AudioActivity`].
pub(crate) fn activity_monitor(
    participant_id: Option<String>,
    source: Arc<dyn AudioSource>,
    config: &ActivityConfig,
    events: SessionEventSender,
) -> AudioActivityMonitor {
    AudioActivityMonitor::start(
        source,
        config,
        Box::new(move |update| {
            emit(
                &events,
                SessionEvent::AudioActivity {
                    participant_id: participant_id.clone(),
                    level: update.level,
                    speaking: update.speaking,
                },
            )
        }),
    )
}

impl Drop for AudioActivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.5, -0.5, 0.5, -0.5]), 0.5);
        assert_eq!(rms(&[2.0, 2.0]), 1.0);
    }

    #[test]
    fn test_evaluate_threshold() {
        let quiet = evaluate(&[0.01; 32], 0.05);
        assert_eq!(quiet.level, 0.01);
        assert!(!quiet.speaking);

        let loud = evaluate(&[0.05; 32], 0.05);
        assert!(loud.speaking);
    }

    #[test]
    fn test_sample_buffer_window() {
        let buffer = SampleBuffer::new(4);
        buffer.push(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        let mut window = [0.0; 8];
        let len = buffer.read_window(&mut window);
        assert_eq!(len, 4);
        assert_eq!(&window[..len], &[0.2, 0.3, 0.4, 0.5]);

        let mut small = [0.0; 2];
        assert_eq!(buffer.read_window(&mut small), 2);
        assert_eq!(small, [0.4, 0.5]);
    }

    #[test]
    fn test_push_level() {
        let buffer = SampleBuffer::new(16);
        buffer.push_level(20, 16);
        let mut window = [0.0; 16];
        let len = buffer.read_window(&mut window);
        let level = rms(&window[..len]);
        assert!((level - 0.1).abs() < 0.001, "level={}", level);

        buffer.push_level(127, 16);
        let len = buffer.read_window(&mut window);
        assert_eq!(rms(&window[..len]), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_samples_read_as_silence() {
        let buffer = SampleBuffer::with_max_age(16, Duration::from_millis(50));
        buffer.push(&[0.4; 16]);
        let mut window = [0.0; 16];
        assert_eq!(buffer.read_window(&mut window), 16);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(buffer.read_window(&mut window), 0);
        assert_eq!(buffer.read_window(&mut window), 0);

        buffer.push(&[0.2; 4]);
        assert_eq!(buffer.read_window(&mut window), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_ends_when_input_stops() {
        let buffer = Arc::new(SampleBuffer::new(64));
        buffer.push(&[0.3; 64]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _monitor = AudioActivityMonitor::start(
            buffer.clone(),
            &ActivityConfig::default(),
            Box::new(move |update| {
                let _ = tx.send(update);
            }),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        assert!(updates[0].speaking);
        assert_eq!(
            updates.last(),
            Some(&ActivityUpdate {
                level: 0.0,
                speaking: false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_only_on_change() {
        let buffer = Arc::new(SampleBuffer::new(64));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = AudioActivityMonitor::start(
            buffer.clone(),
            &ActivityConfig::default(),
            Box::new(move |update| {
                let _ = tx.send(update);
            }),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.level, 0.0);
        assert!(!first.speaking);
        assert!(rx.try_recv().is_err());

        buffer.push(&[0.3; 64]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let update = rx.recv().await.unwrap();
        assert_eq!(update.level, 0.3);
        assert!(update.speaking);
        assert!(rx.try_recv().is_err());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
