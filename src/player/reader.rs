use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::core::{Clock, Packet, PlayerOptions, TimeBase};
use crate::player::packet_queue::PacketQueue;
use crate::player::session::{PlaybackShared, SeekRequest};
use crate::player::source::MediaInput;

/// 三条包队列的总字节水位，超过就停读
pub const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;
/// 单条流"够用"的最少包数
pub const MIN_FRAMES: usize = 25;
/// seek 窗口端点的微调量（微秒）。解封装层取整方向不可靠，
/// 窗口两端各让一点避免落在边界外；保留为常量方便按容器调整。
pub const SEEK_WINDOW_FUDGE_US: i64 = 2;

/// reader 眼中的一条活动流
pub struct ReaderStream {
    pub index: usize,
    pub queue: Arc<PacketQueue>,
    /// 对应解码器的排空水位
    pub finished: Arc<AtomicU64>,
    /// 对应帧队列的余量探针
    pub frames_remaining: Arc<dyn Fn() -> usize + Send + Sync>,
    pub time_base: TimeBase,
    /// 流自身的起始时间（time_base 单位），播放范围判断用
    pub start_time: Option<i64>,
    pub attached_picture: bool,
}

impl ReaderStream {
    /// 这条流已经彻底播完（解码器排空且帧队列清空）
    fn drained(&self) -> bool {
        self.finished.load(Ordering::SeqCst) == self.queue.serial()
            && (self.frames_remaining)() == 0
    }

    /// 队列里攒的包够不够解码线程吃一阵
    fn has_enough_packets(&self) -> bool {
        self.queue.is_aborted()
            || self.attached_picture
            || (self.queue.nb_packets() > MIN_FRAMES
                && (self.queue.duration() == 0
                    || self.time_base.to_f64() * self.queue.duration() as f64 > 1.0))
    }
}

/// 解封装线程 - 读包、分发、处理 seek 与 EOF/循环
pub struct Reader {
    pub input: Box<dyn MediaInput>,
    pub shared: Arc<PlaybackShared>,
    pub options: PlayerOptions,
    pub video: Option<ReaderStream>,
    pub audio: Option<ReaderStream>,
    pub subtitle: Option<ReaderStream>,
    pub extclk: Clock,
}

impl Reader {
    pub fn run(mut self) {
        info!("📦 解封装线程启动: {}", self.input.description());

        // 起播偏移
        if let Some(start) = self.options.start_time_us {
            let mut timestamp = start;
            if let Some(st) = self.input.start_time_us() {
                timestamp += st;
            }
            if let Err(e) = self.input.seek(i64::MIN, timestamp, i64::MAX, false) {
                warn!("{}: 跳到起始位置 {} 失败: {}", self.input.description(), timestamp as f64 / 1e6, e);
            }
        }

        let mut loops_left = self.options.loop_count;
        let mut eof = false;
        let infinite_buffer = self
            .options
            .infinite_buffer
            .unwrap_or_else(|| self.input.is_realtime());

        loop {
            if self.shared.is_aborted() {
                break;
            }

            // ---------- seek 请求 ----------
            if let Some(req) = self.shared.take_seek() {
                self.handle_seek(&req);
                eof = false;
                self.shared.set_eof(false);
            }

            // ---------- 附图流（封面）----------
            if self.shared.take_queue_attachments() {
                if let Some(video) = &self.video {
                    if video.attached_picture {
                        if let Some(pic) = self.input.attached_picture(video.index) {
                            let _ = video.queue.put(pic);
                            let _ = video.queue.put(Packet::null(video.index));
                        }
                    }
                }
            }

            // ---------- 背压：缓冲够了就打盹 ----------
            let total_size = self.queue_size_total();
            if !infinite_buffer
                && (total_size > MAX_QUEUE_SIZE
                    || (Self::enough(&self.audio)
                        && Self::enough(&self.video)
                        && Self::enough(&self.subtitle)))
            {
                self.shared.reader_nap(Duration::from_millis(10));
                continue;
            }

            // ---------- 播完：循环或退出 ----------
            if !self.shared.is_paused()
                && self.video.as_ref().map(|s| s.drained()).unwrap_or(true)
                && self.audio.as_ref().map(|s| s.drained()).unwrap_or(true)
                && eof
            {
                if loops_left != 1 {
                    if loops_left > 0 {
                        loops_left -= 1;
                    }
                    let start = self.options.start_time_us.unwrap_or(0);
                    info!("🔁 循环播放，跳回 {}s（剩余 {} 次）", start as f64 / 1e6, loops_left);
                    self.shared.request_seek(SeekRequest {
                        target: start,
                        rel: 0,
                        by_bytes: false,
                    });
                    continue;
                } else if self.options.autoexit {
                    info!("播放完成，autoexit 退出");
                    self.shared.request_quit();
                    break;
                }
            }

            // ---------- 读一个包 ----------
            match self.input.read_packet() {
                Ok(Some(pkt)) => {
                    if self.in_play_range(&pkt) {
                        self.dispatch(pkt);
                    }
                    // 范围之外的包直接丢
                }
                Ok(None) => {
                    if !eof {
                        // 给每条活动流补一个空包，命令解码器排空
                        for stream in [&self.video, &self.audio, &self.subtitle]
                            .into_iter()
                            .flatten()
                        {
                            let _ = stream.queue.put(Packet::null(stream.index));
                        }
                        eof = true;
                        self.shared.set_eof(true);
                        info!("📄 读到文件末尾，等待解码排空");
                    }
                    self.shared.reader_nap(Duration::from_millis(10));
                }
                Err(e) => {
                    error!("❌ 读包失败: {}", e);
                    self.shared.set_fatal(e);
                    break;
                }
            }
        }

        info!("🛑 解封装线程退出");
    }

    fn handle_seek(&mut self, req: &SeekRequest) {
        // 窗口端点带微调量：rel 的符号决定哪一端收紧
        let min = if req.rel > 0 {
            req.target - req.rel + SEEK_WINDOW_FUDGE_US
        } else {
            i64::MIN
        };
        let max = if req.rel < 0 {
            req.target - req.rel - SEEK_WINDOW_FUDGE_US
        } else {
            i64::MAX
        };

        match self.input.seek(min, req.target, max, req.by_bytes) {
            Err(e) => {
                // seek 失败不影响继续播放
                error!("❌ {}: seek 失败: {}", self.input.description(), e);
            }
            Ok(()) => {
                for stream in [&self.video, &self.audio, &self.subtitle]
                    .into_iter()
                    .flatten()
                {
                    stream.queue.flush();
                    let _ = stream.queue.put_barrier();
                }
                if req.by_bytes {
                    // 按字节 seek 后时间位置未知
                    self.extclk.set(f64::NAN, 0);
                } else {
                    self.extclk.set(req.target as f64 / 1e6, 0);
                }
                info!(
                    "🎯 seek 完成: target={}{}",
                    if req.by_bytes {
                        format!("{} 字节", req.target)
                    } else {
                        format!("{:.3}s", req.target as f64 / 1e6)
                    },
                    if req.rel != 0 { "（相对）" } else { "" }
                );
            }
        }
        self.shared.set_queue_attachments(true);
        // 暂停中 seek：放一帧出来刷新画面
        if self.shared.is_paused() {
            self.shared.set_step(true);
        }
    }

    fn queue_size_total(&self) -> usize {
        [&self.video, &self.audio, &self.subtitle]
            .into_iter()
            .flatten()
            .map(|s| s.queue.size())
            .sum()
    }

    fn enough(stream: &Option<ReaderStream>) -> bool {
        match stream {
            None => true,
            Some(s) => s.has_enough_packets(),
        }
    }

    /// 包是否落在 [start_time, start_time + duration] 播放范围内
    fn in_play_range(&self, pkt: &Packet) -> bool {
        let duration = match self.options.play_duration_us {
            None => return true,
            Some(d) => d,
        };
        let stream = [&self.video, &self.audio, &self.subtitle]
            .into_iter()
            .flatten()
            .find(|s| s.index == pkt.stream_index);
        let stream = match stream {
            Some(s) => s,
            None => return false,
        };
        let ts = match pkt.pts.or(pkt.dts) {
            Some(t) => t,
            None => return true,
        };
        let stream_start = stream.start_time.unwrap_or(0);
        let pos_secs = (ts - stream_start) as f64 * stream.time_base.to_f64()
            - self.options.start_time_us.unwrap_or(0) as f64 / 1e6;
        pos_secs <= duration as f64 / 1e6
    }

    fn dispatch(&mut self, pkt: Packet) {
        let stream = [&self.video, &self.audio, &self.subtitle]
            .into_iter()
            .flatten()
            .find(|s| s.index == pkt.stream_index);
        if let Some(s) = stream {
            // 附图流的常规包不入队（封面只走 queue_attachments 路径）
            if s.attached_picture {
                return;
            }
            let _ = s.queue.put(pkt);
        }
    }
}
