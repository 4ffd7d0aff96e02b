use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cove_media::{MediaEndpoint, VoiceFilterChain, VoiceFilterMode};
use flume::Sender;

use crate::updates::{CoreMsg, InternalEvent};

const SAMPLE_RATE: u32 = 48_000;
const FRAME_SAMPLES: usize = 960; // 20ms @ 48kHz mono.

/// Per-call audio pump. Runs a 20ms loop on its own thread: capture a
/// frame, run it through the voice filter, hand it to the transport.
/// Every `stats_interval_ms` it samples endpoint stats back into the
/// core channel, which is also what drives the reconnect watchdog.
#[derive(Debug)]
pub(super) struct CaptureWorker {
    stop: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    filter: Arc<Mutex<VoiceFilterMode>>,
}

impl CaptureWorker {
    pub(super) fn spawn(
        call_id: &str,
        endpoint: Arc<dyn MediaEndpoint>,
        tx: Sender<CoreMsg>,
        stats_interval_ms: u64,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let muted = Arc::new(AtomicBool::new(false));
        let filter = Arc::new(Mutex::new(VoiceFilterMode::Normal));

        let call_id = call_id.to_string();
        let stop_for_thread = stop.clone();
        let muted_for_thread = muted.clone();
        let filter_for_thread = filter.clone();
        let ticks_per_stats = (stats_interval_ms / 20).max(1);
        thread::spawn(move || {
            let mut source = ToneSource::new();
            let mut chain = VoiceFilterChain::new(SAMPLE_RATE);
            let mut tick = 0u64;

            while !stop_for_thread.load(Ordering::Relaxed) {
                if !muted_for_thread.load(Ordering::Relaxed) {
                    let desired = *filter_for_thread
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if chain.mode() != desired {
                        chain.set_mode(desired);
                    }
                    let pcm = source.next_frame();
                    // NotConnected before linking or mid-reconnect is expected.
                    let _ = endpoint.send_audio_frame(&chain.process_frame(&pcm));
                }

                tick = tick.saturating_add(1);
                if tick % ticks_per_stats == 0 {
                    let sent = tx.send(CoreMsg::Internal(Box::new(InternalEvent::CallTick {
                        call_id: call_id.clone(),
                        stats: endpoint.stats(),
                    })));
                    if sent.is_err() {
                        break;
                    }
                }

                thread::sleep(Duration::from_millis(20));
            }
        });

        Self { stop, muted, filter }
    }

    pub(super) fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub(super) fn set_filter(&self, mode: VoiceFilterMode) {
        *self
            .filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = mode;
    }

    pub(super) fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Synthetic capture source: a quiet 220Hz sine so frames carry a real
/// waveform through the filter chain. A platform build would feed
/// microphone PCM here instead.
#[derive(Debug)]
struct ToneSource {
    phase: f32,
}

impl ToneSource {
    fn new() -> Self {
        Self { phase: 0.0 }
    }

    fn next_frame(&mut self) -> Vec<i16> {
        let mut out = Vec::with_capacity(FRAME_SAMPLES);
        let step = 2.0 * std::f32::consts::PI * 220.0 / SAMPLE_RATE as f32;
        for _ in 0..FRAME_SAMPLES {
            out.push((self.phase.sin() * i16::MAX as f32 * 0.15) as i16);
            self.phase += step;
            if self.phase > 2.0 * std::f32::consts::PI {
                self.phase -= 2.0 * std::f32::consts::PI;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_source_produces_full_nonsilent_frames() {
        let mut source = ToneSource::new();
        let frame = source.next_frame();
        assert_eq!(frame.len(), FRAME_SAMPLES);
        assert!(frame.iter().any(|&s| s != 0));
    }
}
