use ffmpeg_next as ffmpeg;
use ffmpeg_next::software;
use ffmpeg_next::util;
use ffmpeg_next::util::format::{Pixel, Sample};
use log::{debug, warn};

use crate::core::{
    AudioFrame, AudioParams, Packet, PixelFormat, PlayerError, PlayerOptions, Result, VideoFrame,
};
use crate::player::audio_pump::AudioResampler;
use crate::player::source::{
    AudioCodec, DecodedAudio, DecodedSubtitle, DecodedVideo, Receive, SendStatus, SubtitleCodec,
    VideoCodec,
};
use crate::player::video_output::FrameConverter;

fn map_pixel(pixel: Pixel) -> Option<PixelFormat> {
    match pixel {
        Pixel::YUV420P => Some(PixelFormat::Yuv420p),
        Pixel::NV12 => Some(PixelFormat::Nv12),
        Pixel::RGBA => Some(PixelFormat::Rgba),
        Pixel::BGRA => Some(PixelFormat::Bgra),
        _ => None,
    }
}

fn to_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Bgra => Pixel::BGRA,
    }
}

/// 把解码帧逐行拷进紧凑缓冲（stride 去掉）
fn pack_video(frame: &util::frame::Video, format: PixelFormat) -> Vec<u8> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let mut out = Vec::with_capacity(format.buffer_size(frame.width(), frame.height()));

    let mut copy_plane = |plane: usize, row_bytes: usize, rows: usize| {
        let stride = frame.stride(plane);
        let data = frame.data(plane);
        for y in 0..rows {
            out.extend_from_slice(&data[y * stride..y * stride + row_bytes]);
        }
    };

    match format {
        PixelFormat::Yuv420p => {
            copy_plane(0, width, height);
            copy_plane(1, width / 2, height / 2);
            copy_plane(2, width / 2, height / 2);
        }
        PixelFormat::Nv12 => {
            copy_plane(0, width, height);
            copy_plane(1, width, height / 2);
        }
        PixelFormat::Rgba | PixelFormat::Bgra => {
            copy_plane(0, width * 4, height);
        }
    }
    out
}

/// 紧凑缓冲还原成 FFmpeg 帧（转换器输入用）
fn unpack_video(src: &VideoFrame) -> util::frame::Video {
    let mut frame = util::frame::Video::new(to_pixel(src.format), src.width, src.height);
    let width = src.width as usize;
    let height = src.height as usize;

    let mut offset = 0usize;
    let mut fill_plane = |frame: &mut util::frame::Video, plane: usize, row_bytes: usize, rows: usize| {
        let stride = frame.stride(plane);
        let data = frame.data_mut(plane);
        for y in 0..rows {
            data[y * stride..y * stride + row_bytes]
                .copy_from_slice(&src.data[offset..offset + row_bytes]);
            offset += row_bytes;
        }
    };

    match src.format {
        PixelFormat::Yuv420p => {
            fill_plane(&mut frame, 0, width, height);
            fill_plane(&mut frame, 1, width / 2, height / 2);
            fill_plane(&mut frame, 2, width / 2, height / 2);
        }
        PixelFormat::Nv12 => {
            fill_plane(&mut frame, 0, width, height);
            fill_plane(&mut frame, 1, width, height / 2);
        }
        PixelFormat::Rgba | PixelFormat::Bgra => {
            fill_plane(&mut frame, 0, width * 4, height);
        }
    }
    frame
}

/// 我们的 Packet 还原成 FFmpeg packet
fn to_ffmpeg_packet(pkt: &Packet) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&pkt.data);
    out.set_pts(pkt.pts);
    out.set_dts(pkt.dts);
    out.set_duration(pkt.duration);
    out
}

/// 视频解码器（FFmpeg 软解 + 不认识的像素格式就地转 BGRA）
pub struct FfmpegVideoCodec {
    decoder: ffmpeg::codec::decoder::Video,
    scaler: Option<software::scaling::Context>,
    /// 最近送入包的文件位置，解码帧继承它
    last_pkt_pos: i64,
}

// SwsContext 不是 Send，但解码器实例只在自己的解码线程里使用
unsafe impl Send for FfmpegVideoCodec {}

impl FfmpegVideoCodec {
    pub fn from_stream(stream: &ffmpeg::format::stream::Stream, options: &PlayerOptions) -> Result<Self> {
        let mut context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
        unsafe {
            let ptr = context.as_mut_ptr();
            if options.fast {
                (*ptr).flags2 |= ffmpeg::ffi::AV_CODEC_FLAG2_FAST as i32;
            }
            if options.lowres > 0 {
                (*ptr).lowres = options.lowres;
            }
        }
        let decoder = context.decoder().video()?;
        debug!(
            "视频解码器: {}x{}, 格式: {:?}",
            decoder.width(),
            decoder.height(),
            decoder.format()
        );
        Ok(Self {
            decoder,
            scaler: None,
            last_pkt_pos: -1,
        })
    }

    fn convert(&mut self, frame: &util::frame::Video) -> Result<(Vec<u8>, PixelFormat)> {
        if let Some(format) = map_pixel(frame.format()) {
            return Ok((pack_video(frame, format), format));
        }
        // 不认识的格式统一转 BGRA（转换上下文按需建一次）
        if self.scaler.is_none() {
            self.scaler = Some(software::scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                Pixel::BGRA,
                frame.width(),
                frame.height(),
                software::scaling::Flags::BILINEAR,
            )?);
        }
        let mut bgra = util::frame::Video::empty();
        self.scaler.as_mut().unwrap().run(frame, &mut bgra)?;
        Ok((pack_video(&bgra, PixelFormat::Bgra), PixelFormat::Bgra))
    }
}

impl VideoCodec for FfmpegVideoCodec {
    fn send_packet(&mut self, pkt: Option<&Packet>) -> Result<SendStatus> {
        match pkt {
            Some(p) => {
                self.last_pkt_pos = p.pos;
                match self.decoder.send_packet(&to_ffmpeg_packet(p)) {
                    Ok(()) => Ok(SendStatus::Accepted),
                    Err(ffmpeg::Error::Other { errno: 11 }) => Ok(SendStatus::Full), // EAGAIN
                    Err(ffmpeg::Error::Eof) => Ok(SendStatus::Accepted),
                    Err(e) => Err(e.into()),
                }
            }
            None => match self.decoder.send_eof() {
                Ok(()) | Err(ffmpeg::Error::Eof) => Ok(SendStatus::Accepted),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn receive_frame(&mut self) -> Result<Receive<DecodedVideo>> {
        let mut frame = util::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let (data, format) = self.convert(&frame)?;
                let dts = unsafe {
                    let v = (*frame.as_ptr()).pkt_dts;
                    if v == ffmpeg::ffi::AV_NOPTS_VALUE {
                        None
                    } else {
                        Some(v)
                    }
                };
                Ok(Receive::Frame(DecodedVideo {
                    width: frame.width(),
                    height: frame.height(),
                    format,
                    best_effort_ts: frame.timestamp(),
                    pts: frame.pts(),
                    dts,
                    pos: self.last_pkt_pos,
                    data,
                }))
            }
            Err(ffmpeg::Error::Other { errno: 11 }) => Ok(Receive::NeedInput), // EAGAIN
            Err(ffmpeg::Error::Eof) => Ok(Receive::Eof),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// 音频解码器（输出统一为交织 f32，采样率保持原样，交给音频泵重采样）
pub struct FfmpegAudioCodec {
    decoder: ffmpeg::codec::decoder::Audio,
    converter: Option<software::resampling::Context>,
    /// 变更检测：源格式变了就重建转换器
    src_desc: Option<(Sample, u32, u16)>,
    last_pkt_pos: i64,
}

unsafe impl Send for FfmpegAudioCodec {}

impl FfmpegAudioCodec {
    pub fn from_stream(stream: &ffmpeg::format::stream::Stream, _options: &PlayerOptions) -> Result<Self> {
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().audio()?;
        debug!(
            "音频解码器: {} Hz, {} 声道, 格式: {:?}",
            decoder.rate(),
            decoder.channels(),
            decoder.format()
        );
        Ok(Self {
            decoder,
            converter: None,
            src_desc: None,
            last_pkt_pos: -1,
        })
    }

    fn to_f32_interleaved(&mut self, frame: &util::frame::Audio) -> Result<Vec<f32>> {
        let rate = frame.rate();
        let channels = frame.channels();
        let layout = if frame.channel_layout().is_empty() {
            util::channel_layout::ChannelLayout::default(channels as i32)
        } else {
            frame.channel_layout()
        };

        let desc = (frame.format(), rate, channels);
        if self.src_desc != Some(desc) {
            debug!(
                "🔧 重建音频格式转换器: {:?}/{}Hz/{}ch → f32",
                frame.format(),
                rate,
                channels
            );
            self.converter = Some(software::resampling::Context::get(
                frame.format(),
                layout,
                rate,
                Sample::F32(util::format::sample::Type::Packed),
                layout,
                rate,
            )?);
            self.src_desc = Some(desc);
        }

        let mut converted = util::frame::Audio::empty();
        self.converter
            .as_mut()
            .unwrap()
            .run(frame, &mut converted)?;

        let nb = converted.samples() * channels as usize;
        let bytes = converted.data(0);
        let out = unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, nb) }.to_vec();
        Ok(out)
    }
}

impl AudioCodec for FfmpegAudioCodec {
    fn send_packet(&mut self, pkt: Option<&Packet>) -> Result<SendStatus> {
        match pkt {
            Some(p) => {
                self.last_pkt_pos = p.pos;
                match self.decoder.send_packet(&to_ffmpeg_packet(p)) {
                    Ok(()) => Ok(SendStatus::Accepted),
                    Err(ffmpeg::Error::Other { errno: 11 }) => Ok(SendStatus::Full), // EAGAIN
                    Err(ffmpeg::Error::Eof) => Ok(SendStatus::Accepted),
                    Err(e) => Err(e.into()),
                }
            }
            None => match self.decoder.send_eof() {
                Ok(()) | Err(ffmpeg::Error::Eof) => Ok(SendStatus::Accepted),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn receive_frame(&mut self) -> Result<Receive<DecodedAudio>> {
        let mut frame = util::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let data = self.to_f32_interleaved(&frame)?;
                Ok(Receive::Frame(DecodedAudio {
                    rate: frame.rate(),
                    channels: frame.channels(),
                    nb_samples: frame.samples(),
                    pts: frame.pts(),
                    pos: self.last_pkt_pos,
                    data,
                }))
            }
            Err(ffmpeg::Error::Other { errno: 11 }) => Ok(Receive::NeedInput), // EAGAIN
            Err(ffmpeg::Error::Eof) => Ok(Receive::Eof),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// 字幕解码器（文本/ASS 取文本，位图字幕暂不处理）
pub struct FfmpegSubtitleCodec {
    decoder: ffmpeg::codec::decoder::Subtitle,
}

impl FfmpegSubtitleCodec {
    pub fn from_stream(stream: &ffmpeg::format::stream::Stream) -> Result<Self> {
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().subtitle()?;
        Ok(Self { decoder })
    }

    /// 去掉 ASS 覆盖标签，把 \N 换成换行
    fn clean_text(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        let mut in_tag = false;
        while let Some(ch) = chars.next() {
            match ch {
                '{' => in_tag = true,
                '}' => in_tag = false,
                '\\' if !in_tag => match chars.peek() {
                    Some('N') | Some('n') => {
                        chars.next();
                        out.push('\n');
                    }
                    Some('h') => {
                        chars.next();
                        out.push(' ');
                    }
                    _ => out.push(ch),
                },
                _ if in_tag => {}
                _ => out.push(ch),
            }
        }
        out.trim().to_string()
    }
}

impl SubtitleCodec for FfmpegSubtitleCodec {
    fn decode(&mut self, pkt: &Packet) -> Result<Option<DecodedSubtitle>> {
        let mut subtitle = ffmpeg::codec::subtitle::Subtitle::default();
        let got = match self.decoder.decode(&to_ffmpeg_packet(pkt), &mut subtitle) {
            Ok(got) => got,
            Err(ffmpeg::Error::Other { errno: 11 }) => false, // EAGAIN
            Err(e) => {
                warn!("字幕解码失败: {}", e);
                return Err(e.into());
            }
        };
        if !got {
            return Ok(None);
        }

        let (start_ms, end_ms) = unsafe {
            let raw = subtitle.as_ptr();
            ((*raw).start_display_time, (*raw).end_display_time)
        };
        let pts_us = subtitle.pts();

        let mut text = String::new();
        for rect in subtitle.rects() {
            match rect {
                ffmpeg::codec::subtitle::Rect::Text(t) => {
                    text.push_str(t.get());
                    text.push('\n');
                }
                ffmpeg::codec::subtitle::Rect::Ass(a) => {
                    // ASS 行的第 9 个逗号之后才是正文
                    let line = a.get();
                    let body = line.splitn(10, ',').nth(9).unwrap_or(line);
                    text.push_str(&Self::clean_text(body));
                    text.push('\n');
                }
                _ => {
                    // 位图字幕跳过
                }
            }
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(DecodedSubtitle {
            text,
            pts_us,
            start_ms,
            end_ms,
        }))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// 音频泵用的重采样器：f32 交织源 → S16 目标参数，带速率补偿
pub struct FfmpegResampler {
    ctx: Option<software::resampling::Context>,
    src: Option<(u32, u16)>,
    tgt: Option<AudioParams>,
}

unsafe impl Send for FfmpegResampler {}

impl FfmpegResampler {
    pub fn new() -> Self {
        Self {
            ctx: None,
            src: None,
            tgt: None,
        }
    }
}

impl Default for FfmpegResampler {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioResampler for FfmpegResampler {
    fn resample(
        &mut self,
        frame: &AudioFrame,
        wanted_nb_samples: usize,
        tgt: AudioParams,
    ) -> Result<Vec<i16>> {
        let src_layout = util::channel_layout::ChannelLayout::default(frame.channels as i32);
        let tgt_layout = util::channel_layout::ChannelLayout::default(tgt.channels as i32);

        // 源或目标参数变化：重建上下文
        if self.src != Some((frame.rate, frame.channels)) || self.tgt != Some(tgt) {
            debug!(
                "🔧 重建重采样器: {}Hz/{}ch → {}Hz/{}ch",
                frame.rate, frame.channels, tgt.freq, tgt.channels
            );
            self.ctx = Some(software::resampling::Context::get(
                Sample::F32(util::format::sample::Type::Packed),
                src_layout,
                frame.rate,
                Sample::I16(util::format::sample::Type::Packed),
                tgt_layout,
                tgt.freq,
            )?);
            self.src = Some((frame.rate, frame.channels));
            self.tgt = Some(tgt);
        }
        let ctx = self.ctx.as_mut().unwrap();

        // 请求的样本数和帧不一致时让 swr 做微调
        if wanted_nb_samples != frame.nb_samples {
            let delta = (wanted_nb_samples as i64 - frame.nb_samples as i64) * tgt.freq as i64
                / frame.rate as i64;
            let distance = wanted_nb_samples as i64 * tgt.freq as i64 / frame.rate as i64;
            let ret = unsafe {
                ffmpeg::ffi::swr_set_compensation(ctx.as_mut_ptr(), delta as i32, distance as i32)
            };
            if ret < 0 {
                return Err(PlayerError::FFmpegError(ffmpeg::Error::from(ret)));
            }
        }

        // 源帧还原成 FFmpeg 帧
        let mut src_frame = util::frame::Audio::new(
            Sample::F32(util::format::sample::Type::Packed),
            frame.nb_samples,
            src_layout,
        );
        src_frame.set_rate(frame.rate);
        {
            let bytes = frame.data.len() * 4;
            let src_bytes =
                unsafe { std::slice::from_raw_parts(frame.data.as_ptr() as *const u8, bytes) };
            src_frame.data_mut(0)[..bytes].copy_from_slice(src_bytes);
        }

        // 输出留出补偿余量
        let out_count =
            wanted_nb_samples * tgt.freq as usize / frame.rate as usize + 256;
        let mut out_frame = util::frame::Audio::new(
            Sample::I16(util::format::sample::Type::Packed),
            out_count,
            tgt_layout,
        );
        out_frame.set_rate(tgt.freq);
        ctx.run(&src_frame, &mut out_frame)?;

        let produced = out_frame.samples() * tgt.channels as usize;
        let bytes = out_frame.data(0);
        let samples =
            unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i16, produced) }.to_vec();
        Ok(samples)
    }
}

/// 视频输出用的像素格式转换器（NV12/RGBA → BGRA）
pub struct FfmpegFrameConverter {
    ctx: Option<software::scaling::Context>,
    src: Option<(PixelFormat, u32, u32)>,
}

unsafe impl Send for FfmpegFrameConverter {}

impl FfmpegFrameConverter {
    pub fn new() -> Self {
        Self {
            ctx: None,
            src: None,
        }
    }
}

impl Default for FfmpegFrameConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameConverter for FfmpegFrameConverter {
    fn to_bgra(&mut self, frame: &VideoFrame) -> Result<VideoFrame> {
        let desc = (frame.format, frame.width, frame.height);
        if self.src != Some(desc) {
            self.ctx = Some(software::scaling::Context::get(
                to_pixel(frame.format),
                frame.width,
                frame.height,
                Pixel::BGRA,
                frame.width,
                frame.height,
                software::scaling::Flags::BILINEAR,
            )?);
            self.src = Some(desc);
        }

        let src = unpack_video(frame);
        let mut dst = util::frame::Video::empty();
        self.ctx.as_mut().unwrap().run(&src, &mut dst)?;

        Ok(VideoFrame {
            data: pack_video(&dst, PixelFormat::Bgra),
            width: frame.width,
            height: frame.height,
            format: PixelFormat::Bgra,
            pts: frame.pts,
            duration: frame.duration,
            pos: frame.pos,
            serial: frame.serial,
        })
    }
}
