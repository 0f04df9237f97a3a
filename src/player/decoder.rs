use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::core::Packet;
use crate::core::{AudioFrame, SubtitleFrame, TimeBase, VideoFrame, AV_NOSYNC_THRESHOLD};
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::{Got, PacketQueue};
use crate::player::source::{AudioCodec, Receive, SendStatus, SubtitleCodec, VideoCodec};
use crate::player::sync::SyncController;

/// 解码工作线程的公共状态
///
/// finished 是排空水位：解码器在某个 serial 上把缓冲吐干净后记下该
/// serial，reader 据此判断整条流播完；flush 屏障把它清回 0。
pub struct DecoderState {
    queue: Arc<PacketQueue>,
    pending: Option<Packet>,
    pkt_serial: u64,
    finished: Arc<AtomicU64>,
}

enum Fetch {
    Packet(Packet),
    Aborted,
}

impl DecoderState {
    pub fn new(queue: Arc<PacketQueue>) -> Self {
        Self {
            queue,
            pending: None,
            pkt_serial: 0,
            finished: Arc::new(AtomicU64::new(0)),
        }
    }

    /// reader 线程持有的排空水位句柄
    pub fn finished_handle(&self) -> Arc<AtomicU64> {
        self.finished.clone()
    }

    /// 阻塞取下一个当前纪元的包；碰到屏障时回调重置解码器
    fn next_packet(&mut self, mut on_flush: impl FnMut()) -> Fetch {
        loop {
            match self.queue.get(true) {
                Got::Aborted => return Fetch::Aborted,
                Got::Flush(serial) => {
                    self.pkt_serial = serial;
                    self.finished.store(0, Ordering::SeqCst);
                    self.pending = None;
                    on_flush();
                }
                Got::Packet { pkt, serial } => {
                    // seek 之前入队的旧包直接丢
                    if serial != self.queue.serial() {
                        continue;
                    }
                    self.pkt_serial = serial;
                    return Fetch::Packet(pkt);
                }
                Got::Empty => unreachable!("阻塞模式不会返回空"),
            }
        }
    }

    fn mark_finished(&self) {
        self.finished.store(self.pkt_serial, Ordering::SeqCst);
    }
}

/// 视频解码工作线程
pub struct VideoDecodeWorker {
    state: DecoderState,
    codec: Box<dyn VideoCodec>,
    time_base: TimeBase,
    frame_rate: f64,
    /// 视频 pts 来源：-1 解码器推断，0 用 dts，1 用 pts
    reorder_pts: i32,
    framedrop: Option<bool>,
    sync: SyncController,
    pictq: Arc<FrameQueue<VideoFrame>>,
    drops_early: Arc<AtomicU64>,
}

impl VideoDecodeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: DecoderState,
        codec: Box<dyn VideoCodec>,
        time_base: TimeBase,
        frame_rate: f64,
        reorder_pts: i32,
        framedrop: Option<bool>,
        sync: SyncController,
        pictq: Arc<FrameQueue<VideoFrame>>,
        drops_early: Arc<AtomicU64>,
    ) -> Self {
        Self {
            state,
            codec,
            time_base,
            frame_rate,
            reorder_pts,
            framedrop,
            sync,
            pictq,
            drops_early,
        }
    }

    pub fn run(&mut self) {
        info!("🎬 视频解码线程启动");
        'outer: loop {
            // 先把解码器里攒着的帧吐出来
            while self.state.pkt_serial == self.state.queue.serial() {
                if self.state.queue.is_aborted() {
                    break 'outer;
                }
                match self.codec.receive_frame() {
                    Ok(Receive::Frame(raw)) => {
                        if !self.deliver(raw) {
                            break 'outer;
                        }
                    }
                    Ok(Receive::NeedInput) => break,
                    Ok(Receive::Eof) => {
                        self.state.mark_finished();
                        self.codec.flush();
                        break;
                    }
                    Err(e) => {
                        // 单帧失败不终止播放
                        warn!("视频解码错误（已跳过）: {}", e);
                        break;
                    }
                }
            }

            let pkt = match self.state.pending.take() {
                Some(pkt) => pkt,
                None => {
                    let codec = &mut self.codec;
                    match self.state.next_packet(|| codec.flush()) {
                        Fetch::Packet(pkt) => pkt,
                        Fetch::Aborted => break,
                    }
                }
            };

            let send = if pkt.is_null() { None } else { Some(&pkt) };
            match self.codec.send_packet(send) {
                Ok(SendStatus::Accepted) => {}
                Ok(SendStatus::Full) => {
                    // 解码器吃不下，挂起下轮先收帧再重送
                    self.state.pending = Some(pkt);
                }
                Err(e) => {
                    warn!("视频包送解码失败（已丢弃）: {}", e);
                }
            }
        }
        info!("🛑 视频解码线程退出");
    }

    /// 计算 pts 并决定早期丢帧，然后提交帧队列。返回 false 表示中止
    fn deliver(&mut self, raw: crate::player::source::DecodedVideo) -> bool {
        let ts = match self.reorder_pts {
            -1 => raw.best_effort_ts,
            0 => raw.dts,
            _ => raw.pts,
        };
        let pts = match ts {
            Some(t) => t as f64 * self.time_base.to_f64(),
            None => f64::NAN,
        };
        let duration = if self.frame_rate > 0.0 {
            1.0 / self.frame_rate
        } else {
            0.0
        };

        if self.should_drop_early(pts) {
            self.drops_early.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let frame = VideoFrame {
            data: raw.data,
            width: raw.width,
            height: raw.height,
            format: raw.format,
            pts,
            duration,
            pos: raw.pos,
            serial: self.state.pkt_serial,
        };
        if !self.pictq.peek_writable() {
            return false;
        }
        self.pictq.push(frame);
        true
    }

    /// 落后主时钟太多的帧在入队前就扔掉（丢帧开启或主时钟不是视频时）
    fn should_drop_early(&self, pts: f64) -> bool {
        let enabled = matches!(self.framedrop, Some(true))
            || (self.framedrop.is_none() && !self.sync.is_video_master());
        if !enabled || pts.is_nan() {
            return false;
        }
        let diff = pts - self.sync.master_clock();
        !diff.is_nan()
            && diff.abs() < AV_NOSYNC_THRESHOLD
            && diff < 0.0
            && self.state.pkt_serial == self.sync.vidclk().serial()
            && self.state.queue.nb_packets() != 0
    }
}

/// 音频解码工作线程
pub struct AudioDecodeWorker {
    state: DecoderState,
    codec: Box<dyn AudioCodec>,
    time_base: TimeBase,
    sampq: Arc<FrameQueue<AudioFrame>>,
    /// 没有时间戳的帧从这里续（1/采样率单位）
    next_pts: Option<i64>,
}

impl AudioDecodeWorker {
    pub fn new(
        state: DecoderState,
        codec: Box<dyn AudioCodec>,
        time_base: TimeBase,
        sampq: Arc<FrameQueue<AudioFrame>>,
    ) -> Self {
        Self {
            state,
            codec,
            time_base,
            sampq,
            next_pts: None,
        }
    }

    pub fn run(&mut self) {
        info!("🔊 音频解码线程启动");
        'outer: loop {
            while self.state.pkt_serial == self.state.queue.serial() {
                if self.state.queue.is_aborted() {
                    break 'outer;
                }
                match self.codec.receive_frame() {
                    Ok(Receive::Frame(raw)) => {
                        if !self.deliver(raw) {
                            break 'outer;
                        }
                    }
                    Ok(Receive::NeedInput) => break,
                    Ok(Receive::Eof) => {
                        self.state.mark_finished();
                        self.codec.flush();
                        break;
                    }
                    Err(e) => {
                        warn!("音频解码错误（已跳过）: {}", e);
                        break;
                    }
                }
            }

            let pkt = match self.state.pending.take() {
                Some(pkt) => pkt,
                None => {
                    let codec = &mut self.codec;
                    let next_pts = &mut self.next_pts;
                    match self.state.next_packet(|| {
                        codec.flush();
                        *next_pts = None;
                    }) {
                        Fetch::Packet(pkt) => pkt,
                        Fetch::Aborted => break,
                    }
                }
            };

            let send = if pkt.is_null() { None } else { Some(&pkt) };
            match self.codec.send_packet(send) {
                Ok(SendStatus::Accepted) => {}
                Ok(SendStatus::Full) => {
                    self.state.pending = Some(pkt);
                }
                Err(e) => {
                    warn!("音频包送解码失败（已丢弃）: {}", e);
                }
            }
        }
        info!("🛑 音频解码线程退出");
    }

    fn deliver(&mut self, raw: crate::player::source::DecodedAudio) -> bool {
        // 有时间戳就从流单位换到采样单位，否则接着上一帧往下数
        let pts_samples = match raw.pts {
            Some(p) => Some((p as f64 * self.time_base.to_f64() * raw.rate as f64).round() as i64),
            None => self.next_pts,
        };
        self.next_pts = pts_samples.map(|s| s + raw.nb_samples as i64);

        let pts = match pts_samples {
            Some(s) => s as f64 / raw.rate as f64,
            None => f64::NAN,
        };
        let frame = AudioFrame {
            duration: raw.nb_samples as f64 / raw.rate as f64,
            data: raw.data,
            rate: raw.rate,
            channels: raw.channels,
            nb_samples: raw.nb_samples,
            pts,
            pos: raw.pos,
            serial: self.state.pkt_serial,
        };
        if !self.sampq.peek_writable() {
            return false;
        }
        self.sampq.push(frame);
        true
    }
}

/// 字幕解码工作线程 - 一包进零或一条出，没有内部排队
pub struct SubtitleDecodeWorker {
    state: DecoderState,
    codec: Box<dyn SubtitleCodec>,
    subq: Arc<FrameQueue<SubtitleFrame>>,
}

impl SubtitleDecodeWorker {
    pub fn new(
        state: DecoderState,
        codec: Box<dyn SubtitleCodec>,
        subq: Arc<FrameQueue<SubtitleFrame>>,
    ) -> Self {
        Self { state, codec, subq }
    }

    pub fn run(&mut self) {
        info!("💬 字幕解码线程启动");
        loop {
            let codec = &mut self.codec;
            let pkt = match self.state.next_packet(|| codec.flush()) {
                Fetch::Packet(pkt) => pkt,
                Fetch::Aborted => break,
            };

            match self.codec.decode(&pkt) {
                Ok(Some(raw)) => {
                    let frame = SubtitleFrame {
                        text: raw.text,
                        pts: match raw.pts_us {
                            Some(us) => us as f64 / 1e6,
                            None => f64::NAN,
                        },
                        start_ms: raw.start_ms,
                        end_ms: raw.end_ms,
                        serial: self.state.pkt_serial,
                    };
                    if !self.subq.peek_writable() {
                        break;
                    }
                    self.subq.push(frame);
                }
                Ok(None) => {
                    if pkt.is_null() {
                        self.state.mark_finished();
                    }
                }
                Err(e) => {
                    warn!("字幕解码错误（已跳过）: {}", e);
                }
            }
        }
        info!("🛑 字幕解码线程退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Clock, PixelFormat, SyncMode};
    use crate::player::source::DecodedVideo;
    use std::collections::VecDeque;
    use std::thread;
    use std::time::Duration;

    /// 测试替身：每个包原样变成一帧，空包进入排空
    struct StubVideoCodec {
        ready: VecDeque<DecodedVideo>,
        draining: bool,
        flushes: Arc<AtomicU64>,
    }

    impl StubVideoCodec {
        fn new(flushes: Arc<AtomicU64>) -> Self {
            Self {
                ready: VecDeque::new(),
                draining: false,
                flushes,
            }
        }
    }

    impl VideoCodec for StubVideoCodec {
        fn send_packet(&mut self, pkt: Option<&Packet>) -> crate::core::Result<SendStatus> {
            match pkt {
                Some(p) => {
                    self.ready.push_back(DecodedVideo {
                        data: p.data.clone(),
                        width: 16,
                        height: 16,
                        format: PixelFormat::Yuv420p,
                        best_effort_ts: p.pts,
                        pts: p.pts,
                        dts: p.dts,
                        pos: p.pos,
                    });
                }
                None => self.draining = true,
            }
            Ok(SendStatus::Accepted)
        }

        fn receive_frame(&mut self) -> crate::core::Result<Receive<DecodedVideo>> {
            if let Some(f) = self.ready.pop_front() {
                return Ok(Receive::Frame(f));
            }
            if self.draining {
                return Ok(Receive::Eof);
            }
            Ok(Receive::NeedInput)
        }

        fn flush(&mut self) {
            self.ready.clear();
            self.draining = false;
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn video_pkt(pts: i64) -> Packet {
        Packet {
            data: vec![1, 2, 3],
            stream_index: 0,
            pts: Some(pts),
            dts: Some(pts),
            duration: 40,
            pos: -1,
            keyframe: true,
        }
    }

    fn spawn_worker(
        queue: Arc<PacketQueue>,
        pictq: Arc<FrameQueue<VideoFrame>>,
        flushes: Arc<AtomicU64>,
    ) -> (thread::JoinHandle<()>, Arc<AtomicU64>) {
        let state = DecoderState::new(queue.clone());
        let finished = state.finished_handle();
        let vidclk = Clock::new(queue.serial_ref());
        let sync = SyncController::new(
            SyncMode::Video,
            false,
            true,
            Clock::free_running(),
            vidclk,
            Clock::free_running(),
        );
        let codec = Box::new(StubVideoCodec::new(flushes));
        let mut worker = VideoDecodeWorker::new(
            state,
            codec,
            TimeBase::new(1, 1000),
            25.0,
            -1,
            Some(false),
            sync,
            pictq,
            Arc::new(AtomicU64::new(0)),
        );
        (thread::spawn(move || worker.run()), finished)
    }

    #[test]
    fn test_video_worker_decodes_and_tags_serial() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let pictq = Arc::new(FrameQueue::new(queue.clone(), 3, true));
        let (handle, _) = spawn_worker(queue.clone(), pictq.clone(), Arc::new(AtomicU64::new(0)));

        queue.put(video_pkt(40)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pictq.nb_remaining() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let frame = pictq.peek().expect("应当解出一帧");
        assert_eq!(frame.serial, queue.serial());
        assert!((frame.pts - 0.040).abs() < 1e-9);
        assert!((frame.duration - 0.04).abs() < 1e-9);

        queue.abort();
        pictq.signal();
        handle.join().unwrap();
    }

    #[test]
    fn test_flush_barrier_resets_codec_and_drops_stale() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let pictq = Arc::new(FrameQueue::new(queue.clone(), 3, true));
        let flushes = Arc::new(AtomicU64::new(0));

        // 旧纪元的包先排进去再换代，最后才启动线程：旧包必然被丢、解码器被冲
        queue.put(video_pkt(40)).unwrap();
        queue.put(video_pkt(80)).unwrap();
        queue.put_barrier().unwrap();
        queue.put(video_pkt(1040)).unwrap();
        let (handle, finished) = spawn_worker(queue.clone(), pictq.clone(), flushes.clone());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pictq.nb_remaining() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let frame = pictq.peek().expect("新纪元应当解出一帧");
        assert_eq!(frame.serial, queue.serial());
        assert!((frame.pts - 1.040).abs() < 1e-9);
        assert!(flushes.load(Ordering::SeqCst) >= 1);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        queue.abort();
        pictq.signal();
        handle.join().unwrap();
    }

    #[test]
    fn test_null_packet_drains_and_marks_finished() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let pictq = Arc::new(FrameQueue::new(queue.clone(), 3, true));
        let (handle, finished) =
            spawn_worker(queue.clone(), pictq.clone(), Arc::new(AtomicU64::new(0)));

        queue.put(video_pkt(0)).unwrap();
        queue.put(Packet::null(0)).unwrap();

        let serial = queue.serial();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while finished.load(Ordering::SeqCst) != serial && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(finished.load(Ordering::SeqCst), serial);

        queue.abort();
        pictq.signal();
        handle.join().unwrap();
    }
}
