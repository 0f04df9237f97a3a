use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::{format, media};
use log::{debug, info, warn};

use crate::core::{MediaInfo, Packet, PlayerError, PlayerOptions, Result, TimeBase};
use crate::player::codec_ffmpeg::{FfmpegAudioCodec, FfmpegSubtitleCodec, FfmpegVideoCodec};
use crate::player::source::{
    AudioCodec, MediaInput, StreamKind, StreamMeta, SubtitleCodec, VideoCodec,
};

/// 解封装器 - 基于 FFmpeg 读取媒体文件/网络流并分离基本流
pub struct FfmpegInput {
    input: format::context::Input,
    streams: Vec<StreamMeta>,
    media_info: MediaInfo,
    source_path: String,
    realtime: bool,
    /// 中断标志：I/O 阻塞时由 FFmpeg 回调查询
    interrupt: Option<Box<Arc<AtomicBool>>>,
}

// 中断回调：opaque 指向 Arc<AtomicBool>
unsafe extern "C" fn interrupt_cb(opaque: *mut std::ffi::c_void) -> i32 {
    if opaque.is_null() {
        return 0;
    }
    let flag = &*(opaque as *const Arc<AtomicBool>);
    flag.load(Ordering::SeqCst) as i32
}

impl FfmpegInput {
    /// 打开媒体源。网络流附加一组稳定性选项
    pub fn open(path: &str, options: &PlayerOptions) -> Result<Self> {
        info!("正在打开媒体: {}", path);

        let is_network = path.starts_with("http://")
            || path.starts_with("https://")
            || path.starts_with("rtsp://")
            || path.starts_with("rtmp://")
            || path.contains(".m3u8");

        let mut dict = ffmpeg::Dictionary::new();
        if options.genpts {
            dict.set("fflags", "+genpts");
        }
        if is_network {
            info!("🌐 检测到网络流，应用优化选项");
            // discardcorrupt: 丢弃损坏的帧
            // genpts: 生成 PTS（防止时间戳问题）
            dict.set("fflags", "+discardcorrupt+genpts");
            dict.set("analyzeduration", "5000000");
            dict.set("probesize", "10000000");
            dict.set("rw_timeout", "8000000");
            dict.set("reconnect", "1");
            dict.set("reconnect_streamed", "1");
            dict.set("reconnect_delay_max", "4");
        }

        let input = format::input_with_dictionary(&path, dict)
            .map_err(|e| PlayerError::OpenError(format!("无法打开媒体: {}", e)))?;

        let realtime = path.starts_with("rtp:")
            || path.starts_with("rtsp:")
            || path.starts_with("udp:")
            || path.ends_with(".sdp");

        let mut streams = Vec::new();
        for stream in input.streams() {
            let kind = match stream.parameters().medium() {
                media::Type::Video => StreamKind::Video,
                media::Type::Audio => StreamKind::Audio,
                media::Type::Subtitle => StreamKind::Subtitle,
                _ => continue,
            };
            let tb = stream.time_base();
            let fr = stream.avg_frame_rate();
            let frame_rate = if fr.denominator() != 0 {
                fr.numerator() as f64 / fr.denominator() as f64
            } else {
                0.0
            };
            let attached_picture = unsafe {
                ((*stream.as_ptr()).disposition & ffi::AV_DISPOSITION_ATTACHED_PIC as i32) != 0
            };
            let start_time = {
                let st = unsafe { (*stream.as_ptr()).start_time };
                if st == ffi::AV_NOPTS_VALUE {
                    None
                } else {
                    Some(st)
                }
            };
            streams.push(StreamMeta {
                index: stream.index(),
                kind,
                time_base: TimeBase::new(tb.numerator(), tb.denominator()),
                start_time,
                codec_name: stream.parameters().id().name().to_string(),
                attached_picture,
                frame_rate,
            });
        }
        if streams.is_empty() {
            return Err(PlayerError::NoStream);
        }
        debug!("探测到 {} 条可用流", streams.len());

        let mut demuxer = Self {
            media_info: MediaInfo::default(),
            source_path: path.to_string(),
            realtime,
            interrupt: None,
            streams,
            input,
        };
        demuxer.media_info = demuxer.extract_media_info();
        Ok(demuxer)
    }

    fn extract_media_info(&self) -> MediaInfo {
        let mut info = MediaInfo {
            duration_us: self.input.duration(),
            start_time_us: self.start_time_us().unwrap_or(0),
            ..Default::default()
        };

        if let Some(stream) = self.input.streams().best(media::Type::Video) {
            info.video_codec = stream.parameters().id().name().to_string();
            if let Ok(ctx) = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            {
                if let Ok(video) = ctx.decoder().video() {
                    info.width = video.width();
                    info.height = video.height();
                }
            }
            let fr = stream.avg_frame_rate();
            if fr.denominator() != 0 {
                info.fps = fr.numerator() as f64 / fr.denominator() as f64;
            }
        } else {
            info.video_codec = "none".to_string();
        }

        if let Some(stream) = self.input.streams().best(media::Type::Audio) {
            info.audio_codec = stream.parameters().id().name().to_string();
            if let Ok(ctx) = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            {
                if let Ok(audio) = ctx.decoder().audio() {
                    info.sample_rate = audio.rate();
                    info.channels = audio.channels();
                }
            }
        } else {
            info.audio_codec = "none".to_string();
        }

        info
    }

    fn stream_meta(&self, index: usize) -> Result<&StreamMeta> {
        self.streams
            .iter()
            .find(|s| s.index == index)
            .ok_or(PlayerError::NoStream)
    }
}

impl MediaInput for FfmpegInput {
    fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    let index = stream.index();
                    // 只转发我们认识的流
                    if self.streams.iter().all(|s| s.index != index) {
                        continue;
                    }
                    let data = packet.data().map(|d| d.to_vec()).unwrap_or_default();
                    return Ok(Some(Packet {
                        data,
                        stream_index: index,
                        pts: packet.pts(),
                        dts: packet.dts(),
                        duration: packet.duration(),
                        pos: packet.position() as i64,
                        keyframe: packet.is_key(),
                    }));
                }
                None => return Ok(None),
            }
        }
    }

    fn seek(&mut self, min: i64, target: i64, max: i64, by_bytes: bool) -> Result<()> {
        let flags = if by_bytes {
            ffi::AVSEEK_FLAG_BYTE as i32
        } else {
            0
        };
        let ret = unsafe {
            ffi::avformat_seek_file(self.input.as_mut_ptr(), -1, min, target, max, flags)
        };
        if ret < 0 {
            return Err(PlayerError::FFmpegError(ffmpeg::Error::from(ret)));
        }
        Ok(())
    }

    fn streams(&self) -> &[StreamMeta] {
        &self.streams
    }

    /// FFmpeg 的加权选流（解码器支持度+码率）
    fn best_stream(&self, kind: StreamKind) -> Option<usize> {
        let media_type = match kind {
            StreamKind::Video => media::Type::Video,
            StreamKind::Audio => media::Type::Audio,
            StreamKind::Subtitle => media::Type::Subtitle,
        };
        self.input.streams().best(media_type).map(|s| s.index())
    }

    fn duration_us(&self) -> Option<i64> {
        let d = self.input.duration();
        if d > 0 {
            Some(d)
        } else {
            None
        }
    }

    fn start_time_us(&self) -> Option<i64> {
        let st = unsafe { (*self.input.as_ptr()).start_time };
        if st == ffi::AV_NOPTS_VALUE {
            None
        } else {
            Some(st)
        }
    }

    fn byte_size(&self) -> Option<i64> {
        let size = unsafe {
            let pb = (*self.input.as_ptr()).pb;
            if pb.is_null() {
                return None;
            }
            ffi::avio_size(pb)
        };
        if size > 0 {
            Some(size)
        } else {
            None
        }
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }

    /// 挂上中断标志，读包阻塞期间置位即可解除 I/O
    fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        let boxed = Box::new(flag);
        unsafe {
            let ctx = self.input.as_mut_ptr();
            (*ctx).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_cb),
                opaque: &*boxed as *const Arc<AtomicBool> as *mut std::ffi::c_void,
            };
        }
        self.interrupt = Some(boxed);
    }

    fn is_seekable(&self) -> bool {
        unsafe {
            let pb = (*self.input.as_ptr()).pb;
            !pb.is_null() && (*pb).seekable != 0
        }
    }

    fn timestamp_discontinuities(&self) -> bool {
        unsafe {
            let iformat = (*self.input.as_ptr()).iformat;
            !iformat.is_null() && ((*iformat).flags & ffi::AVFMT_TS_DISCONT as i32) != 0
        }
    }

    fn attached_picture(&self, stream: usize) -> Option<Packet> {
        let meta = self.streams.iter().find(|s| s.index == stream)?;
        if !meta.attached_picture {
            return None;
        }
        unsafe {
            let st = (*self.input.as_ptr()).streams.add(stream).read();
            let pic = &(*st).attached_pic;
            if pic.data.is_null() || pic.size <= 0 {
                return None;
            }
            let data = std::slice::from_raw_parts(pic.data, pic.size as usize).to_vec();
            Some(Packet {
                data,
                stream_index: stream,
                pts: if pic.pts == ffi::AV_NOPTS_VALUE {
                    None
                } else {
                    Some(pic.pts)
                },
                dts: None,
                duration: pic.duration,
                pos: -1,
                keyframe: true,
            })
        }
    }

    fn open_video_codec(
        &mut self,
        stream: usize,
        options: &PlayerOptions,
    ) -> Result<Box<dyn VideoCodec>> {
        let meta = self.stream_meta(stream)?;
        info!("创建视频解码器: {}", meta.codec_name);
        let st = self
            .input
            .streams()
            .find(|s| s.index() == stream)
            .ok_or(PlayerError::NoStream)?;
        match FfmpegVideoCodec::from_stream(&st, options) {
            Ok(codec) => Ok(Box::new(codec)),
            Err(e) => {
                warn!("❌ 视频解码器创建失败: {}", e);
                Err(e)
            }
        }
    }

    fn open_audio_codec(
        &mut self,
        stream: usize,
        options: &PlayerOptions,
    ) -> Result<Box<dyn AudioCodec>> {
        let meta = self.stream_meta(stream)?;
        info!("创建音频解码器: {}", meta.codec_name);
        let st = self
            .input
            .streams()
            .find(|s| s.index() == stream)
            .ok_or(PlayerError::NoStream)?;
        Ok(Box::new(FfmpegAudioCodec::from_stream(&st, options)?))
    }

    fn open_subtitle_codec(
        &mut self,
        stream: usize,
        _options: &PlayerOptions,
    ) -> Result<Box<dyn SubtitleCodec>> {
        let meta = self.stream_meta(stream)?;
        info!("创建字幕解码器: {}", meta.codec_name);
        let st = self
            .input
            .streams()
            .find(|s| s.index() == stream)
            .ok_or(PlayerError::NoStream)?;
        Ok(Box::new(FfmpegSubtitleCodec::from_stream(&st)?))
    }

    fn media_info(&self) -> MediaInfo {
        self.media_info.clone()
    }

    fn description(&self) -> String {
        format!("FFmpeg Demuxer: {}", self.source_path)
    }
}
