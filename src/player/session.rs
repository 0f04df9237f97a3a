use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};

use crate::core::{
    now_secs, AudioParams, Clock, MediaInfo, PlayerError, PlayerOptions, Result, SyncMode,
    MIX_MAX_VOLUME,
};
use crate::player::audio_output::AudioDevice;
use crate::player::audio_pump::{AudioPump, AudioResampler};
use crate::player::decoder::{
    AudioDecodeWorker, DecoderState, SubtitleDecodeWorker, VideoDecodeWorker,
};
use crate::player::frame_queue::{
    FrameQueue, SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE,
};
use crate::player::packet_queue::PacketQueue;
use crate::player::reader::{Reader, ReaderStream};
use crate::player::scheduler::{VideoScheduler, REFRESH_RATE};
use crate::player::source::{MediaInput, StreamKind};
use crate::player::sync::SyncController;
use crate::player::video_output::{FrameConverter, VideoOutput, VideoSink};

fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", std::process::id(), thread::current().id())
}

/// 一次 seek 请求。target/rel 是微秒或字节（看 by_bytes）
#[derive(Debug, Clone)]
pub struct SeekRequest {
    pub target: i64,
    pub rel: i64,
    pub by_bytes: bool,
}

/// 会话共享状态 - 原来的全局开关都收敛到这里
///
/// reader、解码线程、音频回调和事件循环都持有同一份 Arc。
pub struct PlaybackShared {
    abort: Arc<AtomicBool>,
    pub paused: Arc<AtomicBool>,
    pub muted: Arc<AtomicBool>,
    pub volume: Arc<AtomicI32>,
    step: AtomicBool,
    eof: AtomicBool,
    queue_attachments: AtomicBool,
    seek: parking_lot::Mutex<Option<SeekRequest>>,
    fatal: parking_lot::Mutex<Option<PlayerError>>,
    /// reader 背压/空转时的打盹点，seek 等事件来了随时叫醒
    continue_read: (StdMutex<()>, Condvar),
}

impl PlaybackShared {
    pub fn new(options: &PlayerOptions) -> Self {
        let volume = (MIX_MAX_VOLUME * options.volume.clamp(0, 100) / 100).clamp(0, MIX_MAX_VOLUME);
        Self {
            abort: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            muted: Arc::new(AtomicBool::new(false)),
            volume: Arc::new(AtomicI32::new(volume)),
            step: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            // 开播先把封面（如果有）排进去
            queue_attachments: AtomicBool::new(true),
            seek: parking_lot::Mutex::new(None),
            fatal: parking_lot::Mutex::new(None),
            continue_read: (StdMutex::new(()), Condvar::new()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// 中止标志的句柄（挂到媒体输入的中断回调上）
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn request_quit(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.wake_reader();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_step(&self, step: bool) {
        self.step.store(step, Ordering::SeqCst);
    }

    pub fn is_step(&self) -> bool {
        self.step.load(Ordering::SeqCst)
    }

    pub fn eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    pub fn set_eof(&self, eof: bool) {
        self.eof.store(eof, Ordering::SeqCst);
    }

    pub fn set_queue_attachments(&self, v: bool) {
        self.queue_attachments.store(v, Ordering::SeqCst);
    }

    pub fn take_queue_attachments(&self) -> bool {
        self.queue_attachments.swap(false, Ordering::SeqCst)
    }

    /// 没有未处理请求时才接受新的 seek
    pub fn request_seek(&self, req: SeekRequest) {
        {
            let mut seek = self.seek.lock();
            if seek.is_some() {
                return;
            }
            *seek = Some(req);
        }
        self.wake_reader();
    }

    pub fn take_seek(&self) -> Option<SeekRequest> {
        self.seek.lock().take()
    }

    pub fn set_fatal(&self, e: PlayerError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(e);
        }
    }

    pub fn take_fatal(&self) -> Option<PlayerError> {
        self.fatal.lock().take()
    }

    /// reader 打盹：最多 d，有人摇醒就提前回来
    pub fn reader_nap(&self, d: Duration) {
        let (lock, cvar) = &self.continue_read;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout(guard, d).unwrap();
    }

    pub fn wake_reader(&self) {
        let (lock, cvar) = &self.continue_read;
        let _guard = lock.lock().unwrap();
        cvar.notify_one();
    }
}

/// 用户命令（键盘/遥控映射到这里）
#[derive(Debug, Clone, Copy)]
pub enum Command {
    TogglePause,
    StepFrame,
    Mute,
    VolumeUp,
    VolumeDown,
    /// 相对 seek（秒，可负）
    SeekBy(f64),
    /// 绝对 seek（秒）
    SeekTo(f64),
    Quit,
}

/// 渲染与输出的后端集合（依赖注入点，测试换成无声/无窗实现）
pub struct Sinks {
    pub video: Box<dyn VideoSink>,
    pub converter: Option<Box<dyn FrameConverter>>,
    pub audio: Box<dyn AudioDevice>,
    pub resampler: Box<dyn AudioResampler>,
}

/// 播放会话 - 组装全部组件并驱动事件循环
pub struct Session {
    shared: Arc<PlaybackShared>,
    options: PlayerOptions,
    media_info: MediaInfo,
    sync: SyncController,
    scheduler: Option<VideoScheduler>,

    videoq: Arc<PacketQueue>,
    audioq: Arc<PacketQueue>,
    subtitleq: Arc<PacketQueue>,
    pictq: Arc<FrameQueue<crate::core::VideoFrame>>,
    sampq: Arc<FrameQueue<crate::core::AudioFrame>>,
    subpq: Arc<FrameQueue<crate::core::SubtitleFrame>>,

    reader_thread: Option<thread::JoinHandle<()>>,
    video_thread: Option<thread::JoinHandle<()>>,
    audio_thread: Option<thread::JoinHandle<()>>,
    subtitle_thread: Option<thread::JoinHandle<()>>,

    audio_device: Box<dyn AudioDevice>,
    #[allow(dead_code)]
    pump: Option<Arc<parking_lot::Mutex<AudioPump>>>,

    command_tx: Sender<Command>,
    command_rx: Receiver<Command>,

    has_video: bool,
    has_audio: bool,
    seek_by_bytes: bool,
    realtime: bool,
    byte_size: Option<i64>,
    duration_us: Option<i64>,
    start_time_us: Option<i64>,
    drops_early: Arc<AtomicU64>,
    drops_late: Arc<AtomicU64>,
    last_status: f64,
}

impl Session {
    /// 打开输入并启动全部工作线程。返回时 reader 和解码器已经在跑
    pub fn open(mut input: Box<dyn MediaInput>, options: PlayerOptions, sinks: Sinks) -> Result<Self> {
        info!("{} 🎮 创建播放会话: {}", log_ctx(), input.description());
        let shared = Arc::new(PlaybackShared::new(&options));
        input.set_interrupt(shared.abort_flag());
        let media_info = input.media_info();
        info!("{} 📎 媒体信息: {:?}", log_ctx(), media_info);

        let video_index = if options.disable_video {
            None
        } else {
            input.best_stream(StreamKind::Video)
        };
        let audio_index = if options.disable_audio {
            None
        } else {
            input.best_stream(StreamKind::Audio)
        };
        let subtitle_index = if options.disable_subtitle {
            None
        } else {
            input.best_stream(StreamKind::Subtitle)
        };
        if video_index.is_none() && audio_index.is_none() {
            return Err(PlayerError::NoStream);
        }

        let videoq = Arc::new(PacketQueue::new());
        let audioq = Arc::new(PacketQueue::new());
        let subtitleq = Arc::new(PacketQueue::new());

        let vidclk = Clock::new(videoq.serial_ref());
        let audclk = Clock::new(audioq.serial_ref());
        let extclk = Clock::free_running();
        let sync = SyncController::new(
            options.sync,
            audio_index.is_some(),
            video_index.is_some(),
            audclk,
            vidclk,
            extclk.clone(),
        );

        let pictq = Arc::new(FrameQueue::new(videoq.clone(), VIDEO_PICTURE_QUEUE_SIZE, true));
        let sampq = Arc::new(FrameQueue::new(audioq.clone(), SAMPLE_QUEUE_SIZE, true));
        let subpq = Arc::new(FrameQueue::new(subtitleq.clone(), SUBPICTURE_QUEUE_SIZE, false));

        let max_frame_duration = if input.timestamp_discontinuities() {
            10.0
        } else {
            3600.0
        };
        let drops_early = Arc::new(AtomicU64::new(0));
        let drops_late = Arc::new(AtomicU64::new(0));

        // ---------- 先把所有可能失败的步骤做完（解码器、设备协商），
        // ---------- 再开线程，避免半开状态下出错还要回收 ----------
        let stream_meta = |input: &Box<dyn MediaInput>, index: usize| {
            input
                .streams()
                .iter()
                .find(|s| s.index == index)
                .cloned()
                .ok_or(PlayerError::NoStream)
        };

        let mut video_parts = None;
        if let Some(index) = video_index {
            let meta = stream_meta(&input, index)?;
            let codec = input.open_video_codec(index, &options)?;
            video_parts = Some((index, meta, codec));
        }

        let mut audio_device = sinks.audio;
        let mut audio_parts = None;
        if let Some(index) = audio_index {
            let meta = stream_meta(&input, index)?;
            let codec = input.open_audio_codec(index, &options)?;
            let wanted = AudioParams {
                freq: if media_info.sample_rate > 0 {
                    media_info.sample_rate
                } else {
                    48000
                },
                channels: if media_info.channels > 0 {
                    media_info.channels
                } else {
                    2
                },
            };
            // 设备协商失败是致命错误：降级序列已经在里面试过一轮
            let opened = audio_device.open(wanted)?;
            audio_parts = Some((index, meta, codec, opened));
        }

        let mut subtitle_parts = None;
        if let Some(index) = subtitle_index {
            let meta = stream_meta(&input, index)?;
            // 字幕出错不拦播放
            match input.open_subtitle_codec(index, &options) {
                Ok(codec) => subtitle_parts = Some((index, meta, codec)),
                Err(e) => {
                    warn!("{} ❌ 创建字幕解码器失败: {}，继续播放（无字幕）", log_ctx(), e);
                }
            }
        }

        // ---------- 视频解码线程 ----------
        let mut video_thread = None;
        let mut video_desc = None;
        if let Some((index, meta, codec)) = video_parts {
            videoq.start();
            let state = DecoderState::new(videoq.clone());
            let finished = state.finished_handle();
            let mut worker = VideoDecodeWorker::new(
                state,
                codec,
                meta.time_base,
                meta.frame_rate,
                options.decoder_reorder_pts,
                options.framedrop,
                sync.clone(),
                pictq.clone(),
                drops_early.clone(),
            );
            video_thread = Some(thread::spawn(move || worker.run()));
            let probe = pictq.clone();
            video_desc = Some(ReaderStream {
                index,
                queue: videoq.clone(),
                finished,
                frames_remaining: Arc::new(move || probe.nb_remaining()),
                time_base: meta.time_base,
                start_time: meta.start_time,
                attached_picture: meta.attached_picture,
            });
        }

        // ---------- 音频解码线程 + 输出泵 ----------
        let mut audio_thread = None;
        let mut audio_desc = None;
        let mut pump_handle = None;
        if let Some((index, meta, codec, opened)) = audio_parts {
            audioq.start();
            let state = DecoderState::new(audioq.clone());
            let finished = state.finished_handle();
            let pump = Arc::new(parking_lot::Mutex::new(AudioPump::new(
                sampq.clone(),
                audioq.serial_ref(),
                sync.clone(),
                sinks.resampler,
                opened.params,
                opened.hw_buf_size,
                shared.volume.clone(),
                shared.muted.clone(),
                shared.paused.clone(),
            )));
            audio_device.start(pump.clone())?;
            pump_handle = Some(pump);

            let mut worker = AudioDecodeWorker::new(state, codec, meta.time_base, sampq.clone());
            audio_thread = Some(thread::spawn(move || worker.run()));
            let probe = sampq.clone();
            audio_desc = Some(ReaderStream {
                index,
                queue: audioq.clone(),
                finished,
                frames_remaining: Arc::new(move || probe.nb_remaining()),
                time_base: meta.time_base,
                start_time: meta.start_time,
                attached_picture: false,
            });
        }

        // ---------- 字幕解码线程 ----------
        let mut subtitle_thread = None;
        let mut subtitle_desc = None;
        let mut subtitle_active = false;
        if let Some((index, meta, codec)) = subtitle_parts {
            subtitleq.start();
            let state = DecoderState::new(subtitleq.clone());
            let finished = state.finished_handle();
            let mut worker = SubtitleDecodeWorker::new(state, codec, subpq.clone());
            subtitle_thread = Some(thread::spawn(move || worker.run()));
            let probe = subpq.clone();
            subtitle_desc = Some(ReaderStream {
                index,
                queue: subtitleq.clone(),
                finished,
                frames_remaining: Arc::new(move || probe.nb_remaining()),
                time_base: meta.time_base,
                start_time: meta.start_time,
                attached_picture: false,
            });
            subtitle_active = true;
        }

        // ---------- 呈现调度器 ----------
        let scheduler = if video_index.is_some() {
            Some(VideoScheduler::new(
                pictq.clone(),
                if subtitle_active { Some(subpq.clone()) } else { None },
                videoq.clone(),
                if subtitle_active { Some(subtitleq.clone()) } else { None },
                sync.clone(),
                VideoOutput::new(sinks.video, sinks.converter),
                options.framedrop,
                max_frame_duration,
                drops_late.clone(),
            ))
        } else {
            None
        };

        let seek_by_bytes = options
            .seek_by_bytes
            .unwrap_or_else(|| input.timestamp_discontinuities());
        let realtime = input.is_realtime();
        let byte_size = input.byte_size();
        let duration_us = input.duration_us();
        let start_time_us = input.start_time_us();

        // ---------- 解封装线程 ----------
        let reader = Reader {
            input,
            shared: shared.clone(),
            options: options.clone(),
            video: video_desc,
            audio: audio_desc,
            subtitle: subtitle_desc,
            extclk,
        };
        let reader_thread = Some(thread::spawn(move || reader.run()));

        let (command_tx, command_rx) = unbounded();

        Ok(Self {
            has_video: video_index.is_some(),
            has_audio: audio_index.is_some(),
            shared,
            options,
            media_info,
            sync,
            scheduler,
            videoq,
            audioq,
            subtitleq,
            pictq,
            sampq,
            subpq,
            reader_thread,
            video_thread,
            audio_thread,
            subtitle_thread,
            audio_device,
            pump: pump_handle,
            command_tx,
            command_rx,
            seek_by_bytes,
            realtime,
            byte_size,
            duration_us,
            start_time_us,
            drops_early,
            drops_late,
            last_status: 0.0,
        })
    }

    /// 命令入口（其它线程持有发送端）
    pub fn command_sender(&self) -> Sender<Command> {
        self.command_tx.clone()
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    pub fn options(&self) -> &PlayerOptions {
        &self.options
    }

    /// 当前播放位置（秒），未知为 NaN
    pub fn position(&self) -> f64 {
        self.sync.master_clock()
    }

    /// 事件循环：命令分发 + 呈现调度。正常退出返回 Ok
    pub fn run(&mut self) -> Result<()> {
        info!("{} ▶️  事件循环启动", log_ctx());
        let mut remaining_time = 0.0_f64;
        loop {
            if self.shared.is_aborted() {
                break;
            }
            if let Some(e) = self.shared.take_fatal() {
                error!("{} ❌ 播放异常终止: {}", log_ctx(), e);
                self.shutdown();
                return Err(e);
            }

            // 等命令，最多等到下一次该刷新的时刻
            let timeout = Duration::from_secs_f64(remaining_time.clamp(0.0, 1.0));
            match self.command_rx.recv_timeout(timeout) {
                Ok(Command::Quit) => break,
                Ok(cmd) => self.handle_command(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            remaining_time = REFRESH_RATE;

            // 实时源挂外部主时钟：按队列水位微调速度
            if self.realtime
                && !self.shared.is_paused()
                && self.sync.master_sync_type() == SyncMode::External
            {
                let v = self.has_video.then(|| self.videoq.nb_packets());
                let a = self.has_audio.then(|| self.audioq.nb_packets());
                self.sync.check_external_clock_speed(v, a);
            }

            let paused = self.shared.is_paused();
            let step = self.shared.is_step();
            let advanced = match &mut self.scheduler {
                Some(scheduler) => scheduler.refresh(paused, step, &mut remaining_time),
                None => false,
            };
            // 单步：推进了一帧就停回去
            if advanced && step && !paused {
                self.toggle_pause();
                self.shared.set_step(false);
            }

            self.maybe_log_status();
        }
        self.shutdown();
        info!("{} ⏹️  会话结束", log_ctx());
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::TogglePause => {
                self.toggle_pause();
                self.shared.set_step(false);
            }
            Command::StepFrame => self.step_to_next_frame(),
            Command::Mute => {
                let muted = !self.shared.muted.load(Ordering::SeqCst);
                self.shared.muted.store(muted, Ordering::SeqCst);
                info!("{}", if muted { "🔇 静音" } else { "🔊 取消静音" });
            }
            Command::VolumeUp => self.update_volume(1),
            Command::VolumeDown => self.update_volume(-1),
            Command::SeekBy(incr) => self.seek_relative(incr),
            Command::SeekTo(secs) => {
                self.shared.request_seek(SeekRequest {
                    target: (secs * 1e6) as i64,
                    rel: 0,
                    by_bytes: false,
                });
            }
            Command::Quit => unreachable!("Quit 在循环里拦截"),
        }
    }

    /// 暂停/恢复。恢复时把 frame_timer 和时钟重新锚定
    fn toggle_pause(&mut self) {
        let was_paused = self.shared.is_paused();
        if was_paused {
            if let Some(scheduler) = &mut self.scheduler {
                scheduler.on_unpause();
            }
            self.sync.vidclk().set_paused(false);
            let serial = self.sync.vidclk().serial();
            let v = self.sync.vidclk().get();
            self.sync.vidclk().set(v, serial);
        }
        let e = self.sync.extclk().get();
        let es = self.sync.extclk().serial();
        self.sync.extclk().set(e, es);

        let now_paused = !was_paused;
        self.shared.paused.store(now_paused, Ordering::SeqCst);
        self.sync.audclk().set_paused(now_paused);
        self.sync.vidclk().set_paused(now_paused);
        self.sync.extclk().set_paused(now_paused);
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.request_refresh();
        }
        info!("{}", if now_paused { "⏸️  暂停" } else { "▶️  继续播放" });
    }

    /// 单步：暂停中先恢复，推进一帧后由事件循环再停回去
    fn step_to_next_frame(&mut self) {
        if self.shared.is_paused() {
            self.toggle_pause();
        }
        self.shared.set_step(true);
    }

    fn update_volume(&self, sign: i32) {
        let step = (MIX_MAX_VOLUME / 50).max(1);
        let volume =
            (self.shared.volume.load(Ordering::SeqCst) + sign * step).clamp(0, MIX_MAX_VOLUME);
        self.shared.volume.store(volume, Ordering::SeqCst);
        info!("🔊 音量: {}%", volume * 100 / MIX_MAX_VOLUME);
    }

    /// 相对 seek：时间基准用主时钟；按字节的容器用帧位置推
    fn seek_relative(&self, incr: f64) {
        if self.seek_by_bytes {
            let mut pos = self
                .pictq
                .last_pos()
                .or_else(|| self.sampq.last_pos())
                .unwrap_or(-1);
            if pos < 0 {
                pos = 0;
            }
            // 码率估不出来就按经验兜底值（约 1.4Mbps）
            let byte_rate = match (self.byte_size, self.duration_us) {
                (Some(size), Some(dur)) if dur > 0 => size as f64 * 1e6 / dur as f64,
                _ => 180000.0,
            };
            let incr_bytes = (incr * byte_rate) as i64;
            self.shared.request_seek(SeekRequest {
                target: pos + incr_bytes,
                rel: incr_bytes,
                by_bytes: true,
            });
        } else {
            let mut pos = self.sync.master_clock();
            if pos.is_nan() {
                pos = 0.0;
            }
            let mut target = pos + incr;
            if let Some(st) = self.start_time_us {
                let start = st as f64 / 1e6;
                if target < start {
                    target = start;
                }
            }
            self.shared.request_seek(SeekRequest {
                target: (target * 1e6) as i64,
                rel: (incr * 1e6) as i64,
                by_bytes: false,
            });
        }
    }

    /// 周期性播放状态一览（排查同步问题的第一现场）
    fn maybe_log_status(&mut self) {
        let now = now_secs();
        if now - self.last_status < 30.0 {
            return;
        }
        self.last_status = now;
        let av_diff = if self.has_audio && self.has_video {
            self.sync.audclk().get() - self.sync.vidclk().get()
        } else {
            f64::NAN
        };
        info!(
            "⏱  master={:.2}s A-V={:+.3}s 丢帧 early={} late={} vq={}KB aq={}KB sq={}KB",
            self.position(),
            av_diff,
            self.drops_early.load(Ordering::Relaxed),
            self.drops_late.load(Ordering::Relaxed),
            self.videoq.size() / 1024,
            self.audioq.size() / 1024,
            self.subtitleq.size() / 1024,
        );
    }

    /// 停止一切：中止队列唤醒所有阻塞点，逐个 join
    fn shutdown(&mut self) {
        info!("{} ⏹️  停止播放，回收线程", log_ctx());
        self.shared.request_quit();

        self.videoq.abort();
        self.audioq.abort();
        self.subtitleq.abort();
        self.pictq.signal();
        self.sampq.signal();
        self.subpq.signal();

        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
            info!("{} ✅ 解封装线程已结束", log_ctx());
        }
        if let Some(handle) = self.video_thread.take() {
            let _ = handle.join();
            info!("{} ✅ 视频解码线程已结束", log_ctx());
        }
        if let Some(handle) = self.audio_thread.take() {
            let _ = handle.join();
            info!("{} ✅ 音频解码线程已结束", log_ctx());
        }
        if let Some(handle) = self.subtitle_thread.take() {
            let _ = handle.join();
            info!("{} ✅ 字幕解码线程已结束", log_ctx());
        }

        self.audio_device.close();
        info!("{} ✅ 停止完成，所有线程已清理", log_ctx());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.reader_thread.is_some() {
            warn!("{} ⚠ 会话未显式停止，执行兜底清理", log_ctx());
            self.shutdown();
        }
    }
}
