use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use log::warn;

use crate::core::{
    now_secs, AudioFrame, AudioParams, Clock, Result, SerialRef, MIX_MAX_VOLUME,
};
use crate::player::frame_queue::FrameQueue;
use crate::player::sync::{AudioDiffControl, SyncController};

/// 解码失败/暂停时输出的最小静音配额（采样帧数）
pub const AUDIO_MIN_BUFFER_SIZE: usize = 512;

/// 音频重采样器：把一帧源格式音频变成目标参数的 S16 交织样本
///
/// wanted_nb_samples 与帧样本数不同时做速率补偿；实现内部缓存转换
/// 上下文，源参数变化时自行重建。
pub trait AudioResampler: Send {
    fn resample(
        &mut self,
        frame: &AudioFrame,
        wanted_nb_samples: usize,
        tgt: AudioParams,
    ) -> Result<Vec<i16>>;
}

/// 音频泵 - 音频设备回调的填充方
///
/// 设备要多少字节就给多少：帧队列取帧（丢掉换代的旧帧）、按同步
/// 控制器要求的样本数重采样、带音量混合拷出。每次回调结束时把音频
/// 时钟设到"听到的位置"：刚写出的数据还要在硬件缓冲里排队，所以
/// 要从帧 pts 里扣掉两倍硬件缓冲加上未写完的工作缓冲。
pub struct AudioPump {
    sampq: Arc<FrameQueue<AudioFrame>>,
    audioq_serial: SerialRef,
    sync: SyncController,
    diff: AudioDiffControl,
    resampler: Box<dyn AudioResampler>,
    tgt: AudioParams,
    /// 硬件缓冲字节数（设备打开时确定）
    hw_buf_size: usize,
    buf: Vec<i16>,
    buf_index: usize,
    /// 当前工作缓冲播完时对应的流位置
    audio_clock: f64,
    audio_clock_serial: u64,
    volume: Arc<AtomicI32>,
    muted: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl AudioPump {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sampq: Arc<FrameQueue<AudioFrame>>,
        audioq_serial: SerialRef,
        sync: SyncController,
        resampler: Box<dyn AudioResampler>,
        tgt: AudioParams,
        hw_buf_size: usize,
        volume: Arc<AtomicI32>,
        muted: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
    ) -> Self {
        let mut diff = AudioDiffControl::new();
        // 平滑偏差低于硬件缓冲时长时不值得补偿
        diff.threshold = hw_buf_size as f64 / tgt.bytes_per_sec() as f64;
        Self {
            sampq,
            audioq_serial,
            sync,
            diff,
            resampler,
            tgt,
            hw_buf_size,
            buf: Vec::new(),
            buf_index: 0,
            audio_clock: f64::NAN,
            audio_clock_serial: 0,
            volume,
            muted,
            paused,
        }
    }

    /// seek 之后清掉补偿积累
    pub fn reset_compensation(&mut self) {
        self.diff.reset();
    }

    /// 设备回调入口：把 out 填满
    pub fn fill(&mut self, out: &mut [i16]) {
        let callback_time = now_secs();
        let mut offset = 0;
        while offset < out.len() {
            if self.buf_index >= self.buf.len() {
                if !self.next_buffer() {
                    // 出错或暂停：给一个最小配额的静音
                    self.buf.clear();
                    self.buf
                        .resize(AUDIO_MIN_BUFFER_SIZE * self.tgt.channels as usize, 0);
                    self.buf_index = 0;
                }
            }
            let n = (self.buf.len() - self.buf_index).min(out.len() - offset);
            let volume = if self.muted.load(Ordering::Relaxed) {
                0
            } else {
                self.volume.load(Ordering::Relaxed).clamp(0, MIX_MAX_VOLUME)
            };
            let src = &self.buf[self.buf_index..self.buf_index + n];
            let dst = &mut out[offset..offset + n];
            if volume == MIX_MAX_VOLUME {
                dst.copy_from_slice(src);
            } else {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = ((*s as i32 * volume) / MIX_MAX_VOLUME) as i16;
                }
            }
            self.buf_index += n;
            offset += n;
        }

        // 回调时刻的音频时钟：扣掉还没被听到的部分
        if !self.audio_clock.is_nan() {
            let write_buf_bytes = (self.buf.len() - self.buf_index) * 2;
            let pending =
                (2 * self.hw_buf_size + write_buf_bytes) as f64 / self.tgt.bytes_per_sec() as f64;
            self.sync.audclk().set_at(
                self.audio_clock - pending,
                self.audio_clock_serial,
                callback_time,
            );
            Clock::sync_to_slave(self.sync.extclk(), self.sync.audclk());
        }
    }

    /// 取下一帧、重采样进工作缓冲。返回 false 表示这轮只能给静音
    fn next_buffer(&mut self) -> bool {
        if self.paused.load(Ordering::Relaxed) {
            return false;
        }
        let af = loop {
            let af = match self.sampq.peek_readable() {
                Some(f) => f,
                None => return false,
            };
            self.sampq.next();
            // seek 之前解出的帧直接跳过
            if af.serial == self.audioq_serial.get() {
                break af;
            }
        };

        let wanted = if self.sync.is_audio_master() {
            af.nb_samples
        } else {
            let diff = self.sync.audclk().get() - self.sync.master_clock();
            self.diff.wanted_samples(diff, af.nb_samples, af.rate)
        };

        match self.resampler.resample(&af, wanted, self.tgt) {
            Ok(samples) => {
                self.buf = samples;
                self.buf_index = 0;
            }
            Err(e) => {
                warn!("音频重采样失败（本轮静音）: {}", e);
                return false;
            }
        }

        // 时钟推进到这帧播完的位置
        self.audio_clock = if af.pts.is_nan() {
            f64::NAN
        } else {
            af.pts + af.nb_samples as f64 / af.rate as f64
        };
        self.audio_clock_serial = af.serial;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SyncMode;
    use crate::player::packet_queue::PacketQueue;

    /// 测试替身：f32 样本直接量化成 i16，不改变采样率
    struct StubResampler;

    impl AudioResampler for StubResampler {
        fn resample(
            &mut self,
            frame: &AudioFrame,
            _wanted: usize,
            _tgt: AudioParams,
        ) -> Result<Vec<i16>> {
            Ok(frame
                .data
                .iter()
                .map(|s| (s * i16::MAX as f32) as i16)
                .collect())
        }
    }

    fn audio_frame(serial: u64, pts: f64, nb_samples: usize) -> AudioFrame {
        AudioFrame {
            data: vec![0.5; nb_samples * 2],
            rate: 48000,
            channels: 2,
            nb_samples,
            pts,
            duration: nb_samples as f64 / 48000.0,
            pos: -1,
            serial,
        }
    }

    struct Fixture {
        pktq: Arc<PacketQueue>,
        sampq: Arc<FrameQueue<AudioFrame>>,
        pump: AudioPump,
        volume: Arc<AtomicI32>,
        muted: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let pktq = Arc::new(PacketQueue::new());
        pktq.start();
        let sampq = Arc::new(FrameQueue::new(pktq.clone(), 9, true));
        let audclk = Clock::new(pktq.serial_ref());
        let sync = SyncController::new(
            SyncMode::Audio,
            true,
            false,
            audclk,
            Clock::free_running(),
            Clock::free_running(),
        );
        let volume = Arc::new(AtomicI32::new(MIX_MAX_VOLUME));
        let muted = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let pump = AudioPump::new(
            sampq.clone(),
            pktq.serial_ref(),
            sync,
            Box::new(StubResampler),
            AudioParams { freq: 48000, channels: 2 },
            4096,
            volume.clone(),
            muted.clone(),
            paused.clone(),
        );
        Fixture {
            pktq,
            sampq,
            pump,
            volume,
            muted,
            paused,
        }
    }

    #[test]
    fn test_fill_copies_samples_and_updates_clock() {
        let mut fx = fixture();
        let serial = fx.pktq.serial();
        fx.sampq.push(audio_frame(serial, 1.0, 512));

        let mut out = vec![0i16; 1024];
        fx.pump.fill(&mut out);
        assert!(out.iter().all(|&s| s != 0));

        // 工作缓冲恰好耗尽：时钟 = 帧尾 pts - 两倍硬件缓冲时长
        let expect = (1.0 + 512.0 / 48000.0) - 2.0 * 4096.0 / (48000.0 * 4.0);
        assert!((fx.pump.sync.audclk().pts() - expect).abs() < 1e-9);
        assert_eq!(fx.pump.audio_clock_serial, serial);
    }

    #[test]
    fn test_stale_frames_skipped() {
        let mut fx = fixture();
        let old_serial = fx.pktq.serial();
        fx.sampq.push(audio_frame(old_serial, 1.0, 256));
        // 换代，旧帧作废
        fx.pktq.put_barrier().unwrap();
        fx.sampq.push(audio_frame(fx.pktq.serial(), 9.0, 256));

        let mut out = vec![0i16; 512];
        fx.pump.fill(&mut out);
        // 时钟来自新纪元那帧
        assert!((fx.pump.audio_clock - (9.0 + 256.0 / 48000.0)).abs() < 1e-9);
    }

    #[test]
    fn test_abort_yields_silence() {
        let mut fx = fixture();
        fx.pktq.abort();
        fx.sampq.signal();
        let mut out = vec![7i16; 256];
        fx.pump.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_paused_yields_silence_without_consuming() {
        let mut fx = fixture();
        let serial = fx.pktq.serial();
        fx.sampq.push(audio_frame(serial, 0.0, 256));
        fx.paused.store(true, Ordering::Relaxed);
        let mut out = vec![7i16; 256];
        fx.pump.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0));
        // 帧没有被消费
        assert_eq!(fx.sampq.nb_remaining(), 1);
    }

    #[test]
    fn test_volume_scaling_and_mute() {
        let mut fx = fixture();
        let serial = fx.pktq.serial();
        fx.sampq.push(audio_frame(serial, 0.0, 512));
        fx.volume.store(MIX_MAX_VOLUME / 2, Ordering::Relaxed);

        let mut out = vec![0i16; 256];
        fx.pump.fill(&mut out);
        let full = (0.5 * i16::MAX as f32) as i16;
        assert!(out.iter().all(|&s| (s - full / 2).abs() <= 1));

        fx.muted.store(true, Ordering::Relaxed);
        let mut out = vec![1i16; 256];
        fx.pump.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }
}
