use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;

use crate::core::{now_secs, Clock, SubtitleFrame, VideoFrame};
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::PacketQueue;
use crate::player::sync::{SyncController, AV_SYNC_THRESHOLD_MAX};
use crate::player::video_output::VideoOutput;

/// 事件循环的基础刷新间隔（秒）
pub const REFRESH_RATE: f64 = 0.01;

/// 呈现调度器 - 决定每一帧什么时候上屏、什么时候丢弃
///
/// 单线程，由会话事件循环以 ≥100Hz 驱动。frame_timer 是当前帧理论
/// 上该出现的墙钟时刻，每帧按目标延迟前移；落后超过一个阈值就直接
/// 对齐到当前时间，不追旧账。
pub struct VideoScheduler {
    pictq: Arc<FrameQueue<VideoFrame>>,
    subq: Option<Arc<FrameQueue<SubtitleFrame>>>,
    videoq: Arc<PacketQueue>,
    subtitleq: Option<Arc<PacketQueue>>,
    sync: SyncController,
    output: VideoOutput,
    framedrop: Option<bool>,
    /// 帧间隔超过它就视为时间戳跳变（容器有跳变标记时 10s，否则 3600s）
    max_frame_duration: f64,
    frame_timer: f64,
    force_refresh: bool,
    drops_late: Arc<AtomicU64>,
}

impl VideoScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pictq: Arc<FrameQueue<VideoFrame>>,
        subq: Option<Arc<FrameQueue<SubtitleFrame>>>,
        videoq: Arc<PacketQueue>,
        subtitleq: Option<Arc<PacketQueue>>,
        sync: SyncController,
        output: VideoOutput,
        framedrop: Option<bool>,
        max_frame_duration: f64,
        drops_late: Arc<AtomicU64>,
    ) -> Self {
        Self {
            pictq,
            subq,
            videoq,
            subtitleq,
            sync,
            output,
            framedrop,
            max_frame_duration,
            frame_timer: 0.0,
            force_refresh: false,
            drops_late,
        }
    }

    /// 外部要求重绘（resize、暂停中 seek 等）
    pub fn request_refresh(&mut self) {
        self.force_refresh = true;
    }

    /// 取消暂停后把 frame_timer 拉回来，暂停期间的时间不算帧欠账
    pub fn on_unpause(&mut self) {
        self.frame_timer += now_secs() - self.sync.vidclk().last_updated();
    }

    pub fn drops_late(&self) -> u64 {
        self.drops_late.load(Ordering::Relaxed)
    }

    /// 一次刷新。返回是否向前推进了一帧（单步播放用）
    pub fn refresh(&mut self, paused: bool, step: bool, remaining_time: &mut f64) -> bool {
        self.refresh_at(now_secs(), paused, step, remaining_time)
    }

    fn refresh_at(&mut self, time: f64, paused: bool, step: bool, remaining_time: &mut f64) -> bool {
        let mut advanced = false;
        loop {
            if self.pictq.nb_remaining() == 0 {
                // 队列里没有待播帧
                break;
            }
            let vp = match self.pictq.peek() {
                Some(v) => v,
                None => break,
            };
            if vp.serial != self.videoq.serial() {
                // seek 之前解出的帧，直接丢
                self.pictq.next();
                continue;
            }

            let lastvp = self.pictq.peek_last();
            if lastvp.as_ref().map(|f| f.serial) != Some(vp.serial) {
                // 新纪元（seek 或换流）重新起表
                self.frame_timer = time;
            }

            if paused {
                break;
            }

            let last_duration = match &lastvp {
                Some(last) => self.vp_duration(last, &vp),
                None => 0.0,
            };
            let delay = self
                .sync
                .compute_target_delay(last_duration, self.max_frame_duration);

            if time < self.frame_timer + delay {
                // 还没到点：告诉事件循环最多睡多久
                *remaining_time = (self.frame_timer + delay - time).min(*remaining_time);
                break;
            }

            self.frame_timer += delay;
            if delay > 0.0 && time - self.frame_timer > AV_SYNC_THRESHOLD_MAX {
                self.frame_timer = time;
            }

            if !vp.pts.is_nan() {
                self.sync.vidclk().set(vp.pts, vp.serial);
                Clock::sync_to_slave(self.sync.extclk(), self.sync.vidclk());
            }

            // 后面还排着帧且已经迟到一整帧：丢掉当前帧去追
            if self.pictq.nb_remaining() > 1 {
                if let Some(next) = self.pictq.peek_next() {
                    let duration = self.vp_duration(&vp, &next);
                    let drop_enabled = matches!(self.framedrop, Some(true))
                        || (self.framedrop.is_none() && !self.sync.is_video_master());
                    if !step && drop_enabled && time > self.frame_timer + duration {
                        self.drops_late.fetch_add(1, Ordering::Relaxed);
                        self.pictq.next();
                        continue;
                    }
                }
            }

            self.retire_subtitles();

            self.pictq.next();
            self.force_refresh = true;
            advanced = true;
            break;
        }

        if self.force_refresh && self.pictq.rindex_shown() {
            if let Some(frame) = self.pictq.peek_last() {
                let subtitle = self.current_subtitle();
                if let Err(e) = self.output.display(&frame, subtitle.as_deref()) {
                    warn!("渲染失败（已跳过）: {}", e);
                }
            }
        }
        self.force_refresh = false;
        advanced
    }

    /// 上一帧到下一帧的名义时长；serial 不同或差值出格就退回帧自带时长
    fn vp_duration(&self, vp: &VideoFrame, next: &VideoFrame) -> f64 {
        if vp.serial == next.serial {
            let duration = next.pts - vp.pts;
            if duration.is_nan() || duration <= 0.0 || duration > self.max_frame_duration {
                vp.duration
            } else {
                duration
            }
        } else {
            0.0
        }
    }

    /// 按视频时钟清退到期/换代的字幕
    fn retire_subtitles(&mut self) {
        let (subq, subtitleq) = match (self.subq.clone(), self.subtitleq.clone()) {
            (Some(a), Some(b)) => (a, b),
            _ => return,
        };
        while subq.nb_remaining() > 0 {
            let sp = match subq.peek() {
                Some(s) => s,
                None => break,
            };
            let sp2 = if subq.nb_remaining() > 1 {
                subq.peek_next()
            } else {
                None
            };
            let vid_pts = self.sync.vidclk().pts();
            let expired = sp.serial != subtitleq.serial()
                || (!vid_pts.is_nan() && vid_pts > sp.pts + sp.end_ms as f64 / 1000.0)
                || sp2
                    .map(|n| !vid_pts.is_nan() && vid_pts > n.pts + n.start_ms as f64 / 1000.0)
                    .unwrap_or(false);
            if expired {
                self.output.clear_subtitle();
                subq.next();
            } else {
                break;
            }
        }
    }

    /// 当前应当叠加的字幕（进入显示窗口才算）
    fn current_subtitle(&self) -> Option<Arc<SubtitleFrame>> {
        let subq = self.subq.as_ref()?;
        let sp = subq.peek()?;
        let vid_pts = self.sync.vidclk().pts();
        if !vid_pts.is_nan() && vid_pts >= sp.pts + sp.start_ms as f64 / 1000.0 {
            Some(sp)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PixelFormat, SyncMode};
    use crate::player::video_output::NullVideoSink;

    fn frame(serial: u64, pts: f64) -> VideoFrame {
        VideoFrame {
            data: Vec::new(),
            width: 16,
            height: 16,
            format: PixelFormat::Yuv420p,
            pts,
            duration: 0.04,
            pos: -1,
            serial,
        }
    }

    struct Fixture {
        videoq: Arc<PacketQueue>,
        pictq: Arc<FrameQueue<VideoFrame>>,
        scheduler: VideoScheduler,
    }

    fn fixture(mode: SyncMode, framedrop: Option<bool>) -> Fixture {
        let videoq = Arc::new(PacketQueue::new());
        videoq.start();
        let pictq = Arc::new(FrameQueue::new(videoq.clone(), 3, true));
        let vidclk = Clock::new(videoq.serial_ref());
        let sync = SyncController::new(
            mode,
            false,
            true,
            Clock::free_running(),
            vidclk,
            Clock::free_running(),
        );
        let output = VideoOutput::new(Box::new(NullVideoSink::new(640, 480)), None);
        let scheduler = VideoScheduler::new(
            pictq.clone(),
            None,
            videoq.clone(),
            None,
            sync,
            output,
            framedrop,
            3600.0,
            Arc::new(AtomicU64::new(0)),
        );
        Fixture {
            videoq,
            pictq,
            scheduler,
        }
    }

    #[test]
    fn test_stale_frames_dropped_before_display() {
        let mut fx = fixture(SyncMode::Video, None);
        let old_serial = fx.videoq.serial();
        fx.pictq.push(frame(old_serial, 0.0));
        fx.pictq.push(frame(old_serial, 0.04));
        // seek：队列换代
        fx.videoq.put_barrier().unwrap();
        fx.pictq.push(frame(fx.videoq.serial(), 10.0));

        let mut remaining = REFRESH_RATE;
        let advanced = fx.scheduler.refresh_at(100.0, false, false, &mut remaining);
        assert!(advanced);
        // 旧纪元两帧被丢，展示的是新纪元的帧
        let shown = fx.pictq.peek_last().unwrap();
        assert!((shown.pts - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_not_yet_due_sets_remaining_time() {
        let mut fx = fixture(SyncMode::Video, None);
        let serial = fx.videoq.serial();
        fx.pictq.push(frame(serial, 0.0));
        fx.pictq.push(frame(serial, 0.04));

        // 先推进一帧，建立 frame_timer 与 lastvp
        let mut remaining = REFRESH_RATE;
        assert!(fx.scheduler.refresh_at(100.0, false, false, &mut remaining));

        // 下一帧要等 0.04s：在 100.01 时刻来问，应当睡 ~0.03
        let mut remaining = 1.0;
        let advanced = fx.scheduler.refresh_at(100.01, false, false, &mut remaining);
        assert!(!advanced);
        assert!((remaining - 0.03).abs() < 1e-6);

        // 到点之后推进并更新视频时钟
        let mut remaining = REFRESH_RATE;
        let advanced = fx.scheduler.refresh_at(100.05, false, false, &mut remaining);
        assert!(advanced);
        assert!((fx.scheduler.sync.vidclk().pts() - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_paused_keeps_frame() {
        let mut fx = fixture(SyncMode::Video, None);
        let serial = fx.videoq.serial();
        fx.pictq.push(frame(serial, 0.0));
        let mut remaining = REFRESH_RATE;
        let advanced = fx.scheduler.refresh_at(100.0, true, false, &mut remaining);
        assert!(!advanced);
        assert_eq!(fx.pictq.nb_remaining(), 1);
    }

    #[test]
    fn test_late_drop_counts_and_skips() {
        // 丢帧开启，时间已经远超后一帧的应播时刻
        let mut fx = fixture(SyncMode::Video, Some(true));
        let serial = fx.videoq.serial();
        fx.pictq.push(frame(serial, 0.0));
        fx.pictq.push(frame(serial, 0.04));
        fx.pictq.push(frame(serial, 0.08));

        let mut remaining = REFRESH_RATE;
        assert!(fx.scheduler.refresh_at(100.0, false, false, &mut remaining));

        // 迟到一帧多（但没到整表重置的程度）：当前帧被记为 late drop 并跳过
        let mut remaining = REFRESH_RATE;
        fx.scheduler.refresh_at(100.13, false, false, &mut remaining);
        assert_eq!(fx.scheduler.drops_late(), 1);
        // 丢掉 0.04 之后直接展示 0.08
        let shown = fx.pictq.peek_last().unwrap();
        assert!((shown.pts - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_frame_timer_snaps_when_far_behind() {
        let mut fx = fixture(SyncMode::Video, None);
        let serial = fx.videoq.serial();
        fx.pictq.push(frame(serial, 0.0));
        fx.pictq.push(frame(serial, 0.04));

        let mut remaining = REFRESH_RATE;
        fx.scheduler.refresh_at(100.0, false, false, &mut remaining);
        // 停顿了很久再来刷新：frame_timer 直接对齐当前时间
        let mut remaining = REFRESH_RATE;
        fx.scheduler.refresh_at(200.0, false, false, &mut remaining);
        assert!((fx.scheduler.frame_timer - 200.0).abs() < 1e-9);
    }
}
