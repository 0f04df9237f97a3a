use log::trace;

use crate::core::{Clock, SyncMode, AV_NOSYNC_THRESHOLD};

/// 同步微调下限/上限（秒）：目标延迟小于帧长时夹到这个区间
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// 帧长超过这个值就不再用加倍来补偿超前，改为直接加上偏差
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

/// 重采样补偿最多偏离请求样本数的百分比
pub const SAMPLE_CORRECTION_PERCENT_MAX: f64 = 10.0;
/// 平滑音频时钟差值所用的样本窗口
pub const AUDIO_DIFF_AVG_NB: u32 = 20;

/// 外部时钟变速范围与步进（仅实时源）
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;
/// 包队列低于/高于这个水位时减速/加速
pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;

/// 同步控制器 - 主时钟选择与各路对齐量的计算
///
/// 三个时钟的写入方各自固定（音频泵写 audclk、调度器写 vidclk、
/// reader 与外部变速写 extclk），这里只读并给出修正量。
#[derive(Clone)]
pub struct SyncController {
    mode: SyncMode,
    has_audio: bool,
    has_video: bool,
    audclk: Clock,
    vidclk: Clock,
    extclk: Clock,
}

impl SyncController {
    pub fn new(
        mode: SyncMode,
        has_audio: bool,
        has_video: bool,
        audclk: Clock,
        vidclk: Clock,
        extclk: Clock,
    ) -> Self {
        Self {
            mode,
            has_audio,
            has_video,
            audclk,
            vidclk,
            extclk,
        }
    }

    /// 实际生效的主时钟：要求的那路流不存在时逐级降级
    pub fn master_sync_type(&self) -> SyncMode {
        match self.mode {
            SyncMode::Video => {
                if self.has_video {
                    SyncMode::Video
                } else {
                    SyncMode::Audio
                }
            }
            SyncMode::Audio => {
                if self.has_audio {
                    SyncMode::Audio
                } else {
                    SyncMode::External
                }
            }
            SyncMode::External => SyncMode::External,
        }
    }

    /// 主时钟当前读数
    pub fn master_clock(&self) -> f64 {
        match self.master_sync_type() {
            SyncMode::Video => self.vidclk.get(),
            SyncMode::Audio => self.audclk.get(),
            SyncMode::External => self.extclk.get(),
        }
    }

    pub fn is_audio_master(&self) -> bool {
        self.master_sync_type() == SyncMode::Audio
    }

    pub fn is_video_master(&self) -> bool {
        self.master_sync_type() == SyncMode::Video
    }

    pub fn audclk(&self) -> &Clock {
        &self.audclk
    }

    pub fn vidclk(&self) -> &Clock {
        &self.vidclk
    }

    pub fn extclk(&self) -> &Clock {
        &self.extclk
    }

    /// 计算一帧的目标延迟
    ///
    /// delay 是上一帧到当前帧的名义时长；主时钟不是视频时按视频时钟
    /// 与主时钟的偏差收缩/拉长/加倍，偏差超过 max_frame_duration 视为
    /// 时间戳跳变，不做修正。
    pub fn compute_target_delay(&self, delay: f64, max_frame_duration: f64) -> f64 {
        let mut delay = delay;
        if !self.is_video_master() {
            let diff = self.vidclk.get() - self.master_clock();
            let sync_threshold = delay.clamp(AV_SYNC_THRESHOLD_MIN, AV_SYNC_THRESHOLD_MAX);
            if !diff.is_nan() && diff.abs() < max_frame_duration {
                if diff <= -sync_threshold {
                    // 晚了：压缩延迟尽快追上
                    delay = (delay + diff).max(0.0);
                } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
                    delay += diff;
                } else if diff >= sync_threshold {
                    // 早了：这一帧再放一遍
                    delay *= 2.0;
                }
            }
            trace!("video: delay={:.3} A-V={:.6}", delay, -diff);
        }
        delay
    }

    /// 按队列水位微调外部时钟速度（实时源专用）
    ///
    /// 入参是存在的流对应包队列的当前包数，不存在的流传 None。
    pub fn check_external_clock_speed(
        &self,
        video_packets: Option<usize>,
        audio_packets: Option<usize>,
    ) {
        let low = |n: Option<usize>| matches!(n, Some(c) if c <= EXTERNAL_CLOCK_MIN_FRAMES);
        let high = |n: Option<usize>| n.is_none() || matches!(n, Some(c) if c > EXTERNAL_CLOCK_MAX_FRAMES);

        let speed = self.extclk.speed();
        if low(video_packets) || low(audio_packets) {
            self.extclk
                .set_speed(EXTERNAL_CLOCK_SPEED_MIN.max(speed - EXTERNAL_CLOCK_SPEED_STEP));
        } else if high(video_packets) && high(audio_packets) {
            self.extclk
                .set_speed(EXTERNAL_CLOCK_SPEED_MAX.min(speed + EXTERNAL_CLOCK_SPEED_STEP));
        } else if speed != 1.0 {
            // 水位正常：一步步向 1.0 回靠
            self.extclk
                .set_speed(speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs());
        }
    }
}

/// 音频重采样补偿量计算
///
/// 主时钟不是音频时，把音频时钟与主时钟的偏差喂进指数滑动平均，
/// 攒满窗口后按平滑值调整送入重采样器的目标样本数，幅度不超过
/// 原样本数的 ±10%。偏差离谱（≥10 秒）则清零重来。
pub struct AudioDiffControl {
    cum: f64,
    coef: f64,
    avg_count: u32,
    /// 平滑偏差小于该阈值（硬件缓冲时长）时不做补偿
    pub threshold: f64,
}

impl AudioDiffControl {
    pub fn new() -> Self {
        Self {
            cum: 0.0,
            coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            avg_count: 0,
            threshold: 0.0,
        }
    }

    /// 重置累计（seek 或失同步之后）
    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.avg_count = 0;
    }

    /// 返回希望重采样产出的样本数
    pub fn wanted_samples(&mut self, diff: f64, nb_samples: usize, src_freq: u32) -> usize {
        if diff.is_nan() || diff.abs() >= AV_NOSYNC_THRESHOLD {
            self.reset();
            return nb_samples;
        }

        self.cum = diff + self.coef * self.cum;
        if self.avg_count < AUDIO_DIFF_AVG_NB {
            // 窗口还没攒满，先只计数
            self.avg_count += 1;
            return nb_samples;
        }

        let avg_diff = self.cum * (1.0 - self.coef);
        if avg_diff.abs() < self.threshold {
            return nb_samples;
        }

        let wanted = nb_samples as f64 + diff * src_freq as f64;
        let min = nb_samples as f64 * (100.0 - SAMPLE_CORRECTION_PERCENT_MAX) / 100.0;
        let max = nb_samples as f64 * (100.0 + SAMPLE_CORRECTION_PERCENT_MAX) / 100.0;
        wanted.clamp(min, max) as usize
    }
}

impl Default for AudioDiffControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Clock;

    fn paused_clock(pts: f64, serial: u64) -> Clock {
        let clock = Clock::free_running();
        clock.set(pts, serial);
        clock.set_paused(true);
        clock
    }

    fn controller(mode: SyncMode, video_pts: f64, master_pts: f64) -> SyncController {
        let audclk = paused_clock(master_pts, 1);
        let vidclk = paused_clock(video_pts, 1);
        let extclk = paused_clock(master_pts, 1);
        SyncController::new(mode, true, true, audclk, vidclk, extclk)
    }

    #[test]
    fn test_master_fallback_without_streams() {
        let c = SyncController::new(
            SyncMode::Video,
            true,
            false,
            paused_clock(0.0, 1),
            paused_clock(0.0, 1),
            paused_clock(0.0, 1),
        );
        assert_eq!(c.master_sync_type(), SyncMode::Audio);

        let c = SyncController::new(
            SyncMode::Audio,
            false,
            true,
            paused_clock(0.0, 1),
            paused_clock(0.0, 1),
            paused_clock(0.0, 1),
        );
        assert_eq!(c.master_sync_type(), SyncMode::External);
    }

    #[test]
    fn test_video_master_returns_delay_unchanged() {
        let c = controller(SyncMode::Video, 5.0, 3.0);
        for d in [0.0, 0.02, 0.04, 0.1, 1.0] {
            assert!((c.compute_target_delay(d, 3600.0) - d).abs() < 1e-12);
        }
    }

    #[test]
    fn test_late_video_shrinks_delay() {
        // 视频落后 0.5 秒，延迟被压缩到 0
        let c = controller(SyncMode::Audio, 1.0, 1.5);
        let delay = c.compute_target_delay(0.04, 3600.0);
        assert!((delay - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_early_video_doubles_short_frame() {
        // 视频超前 0.06 秒，短帧加倍等待
        let c = controller(SyncMode::Audio, 1.06, 1.0);
        let delay = c.compute_target_delay(0.04, 3600.0);
        assert!((delay - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_early_video_long_frame_adds_slack() {
        // 长帧（>0.1s）超前时加上偏差而不是加倍
        let c = controller(SyncMode::Audio, 1.2, 1.0);
        let delay = c.compute_target_delay(0.5, 3600.0);
        assert!((delay - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_huge_diff_skips_adjustment() {
        // 偏差超过 max_frame_duration：时间戳跳变，不修正
        let c = controller(SyncMode::Audio, 100.0, 1.0);
        let delay = c.compute_target_delay(0.04, 10.0);
        assert!((delay - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_delay_bound_property() {
        let max_frame_duration = 10.0;
        for (v, m) in [(1.0, 1.0), (1.0, 1.05), (1.05, 1.0), (3.0, 1.0), (1.0, 3.0)] {
            let c = controller(SyncMode::Audio, v, m);
            for d in [0.0, 0.01, 0.04, 0.1, 0.5, 5.0] {
                let delay = c.compute_target_delay(d, max_frame_duration);
                assert!(delay >= 0.0);
                assert!(delay <= 2.0 * d + max_frame_duration);
            }
        }
    }

    #[test]
    fn test_audio_compensation_warmup_then_clamp() {
        let mut ctl = AudioDiffControl::new();
        ctl.threshold = 0.001;
        // 窗口攒满前不调整
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(ctl.wanted_samples(0.5, 1024, 48000), 1024);
        }
        // 攒满后偏差很大，命中 +10% 上限
        let wanted = ctl.wanted_samples(0.5, 1024, 48000);
        assert_eq!(wanted, (1024.0 * 1.1) as usize);
        // 反向偏差命中 -10% 下限
        let mut ctl = AudioDiffControl::new();
        ctl.threshold = 0.001;
        for _ in 0..AUDIO_DIFF_AVG_NB {
            ctl.wanted_samples(-0.5, 1024, 48000);
        }
        let wanted = ctl.wanted_samples(-0.5, 1024, 48000);
        assert_eq!(wanted, (1024.0 * 0.9) as usize);
    }

    #[test]
    fn test_audio_compensation_below_threshold_keeps_samples() {
        let mut ctl = AudioDiffControl::new();
        ctl.threshold = 1.0;
        for _ in 0..AUDIO_DIFF_AVG_NB + 5 {
            assert_eq!(ctl.wanted_samples(0.005, 1024, 48000), 1024);
        }
    }

    #[test]
    fn test_audio_compensation_resets_on_nosync() {
        let mut ctl = AudioDiffControl::new();
        ctl.threshold = 0.001;
        for _ in 0..AUDIO_DIFF_AVG_NB {
            ctl.wanted_samples(0.2, 1024, 48000);
        }
        // 离谱偏差清零，重新进入预热期
        assert_eq!(ctl.wanted_samples(20.0, 1024, 48000), 1024);
        assert_eq!(ctl.wanted_samples(0.2, 1024, 48000), 1024);
    }

    #[test]
    fn test_external_clock_speed_stepping() {
        let c = controller(SyncMode::External, 0.0, 0.0);
        // 水位低 → 减速
        c.check_external_clock_speed(Some(1), Some(1));
        assert!((c.extclk().speed() - (1.0 - EXTERNAL_CLOCK_SPEED_STEP)).abs() < 1e-9);
        // 水位高 → 加速并逐步回升
        for _ in 0..100 {
            c.check_external_clock_speed(Some(50), Some(50));
        }
        assert!(c.extclk().speed() <= EXTERNAL_CLOCK_SPEED_MAX + 1e-9);
        // 水位正常 → 向 1.0 回靠
        c.check_external_clock_speed(Some(5), Some(5));
        assert!(c.extclk().speed() <= EXTERNAL_CLOCK_SPEED_MAX);
    }
}
