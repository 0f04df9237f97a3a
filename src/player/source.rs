use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::core::{MediaInfo, Packet, PlayerOptions, Result, TimeBase};

/// 流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
}

/// 一条基本流的元数据（打开容器时采集一次）
#[derive(Debug, Clone)]
pub struct StreamMeta {
    pub index: usize,
    pub kind: StreamKind,
    pub time_base: TimeBase,
    /// 流自身的起始时间（time_base 单位）
    pub start_time: Option<i64>,
    pub codec_name: String,
    /// 封面图等单帧附图流
    pub attached_picture: bool,
    /// 视频流的猜测帧率（帧时长 = 1/fps），未知为 0
    pub frame_rate: f64,
}

/// 解码器吐帧的结果
pub enum Receive<T> {
    Frame(T),
    /// 需要喂更多数据
    NeedInput,
    /// 排空完毕
    Eof,
}

/// send_packet 的结果
pub enum SendStatus {
    Accepted,
    /// 解码器内部缓冲已满，包要挂起待重送
    Full,
}

/// 解码出的原始视频帧（时间戳还是流单位，由解码工作线程换算）
pub struct DecodedVideo {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: crate::core::PixelFormat,
    /// 解码器综合推断的时间戳
    pub best_effort_ts: Option<i64>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub pos: i64,
}

/// 解码出的原始音频帧（交织 f32，保持源采样率）
pub struct DecodedAudio {
    pub data: Vec<f32>,
    pub rate: u32,
    pub channels: u16,
    pub nb_samples: usize,
    /// 流 time_base 单位
    pub pts: Option<i64>,
    pub pos: i64,
}

/// 解码出的原始字幕
pub struct DecodedSubtitle {
    pub text: String,
    /// 微秒
    pub pts_us: Option<i64>,
    pub start_ms: u32,
    pub end_ms: u32,
}

/// 视频/音频解码器接口：send/receive 两段式，送 None 进入排空
pub trait VideoCodec: Send {
    fn send_packet(&mut self, pkt: Option<&Packet>) -> Result<SendStatus>;
    fn receive_frame(&mut self) -> Result<Receive<DecodedVideo>>;
    /// 丢掉内部缓冲（seek 换代时由 flush 屏障触发）
    fn flush(&mut self);
}

pub trait AudioCodec: Send {
    fn send_packet(&mut self, pkt: Option<&Packet>) -> Result<SendStatus>;
    fn receive_frame(&mut self) -> Result<Receive<DecodedAudio>>;
    fn flush(&mut self);
}

/// 字幕解码是一包进零或一条出，没有内部排队
pub trait SubtitleCodec: Send {
    fn decode(&mut self, pkt: &Packet) -> Result<Option<DecodedSubtitle>>;
    fn flush(&mut self);
}

/// 媒体输入抽象接口
///
/// 不同的媒体源（本地文件、网络流）实现这个接口；播放核心只通过它
/// 读包、seek、打开解码器，不直接接触具体的解封装库。
pub trait MediaInput: Send {
    /// 读取下一个数据包
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达文件末尾
    /// - Err(e): 读取错误
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// 在 [min, max] 窗口内 seek 到 target。
    /// by_bytes 为真时三个参数是字节偏移，否则是微秒。
    fn seek(&mut self, min: i64, target: i64, max: i64, by_bytes: bool) -> Result<()>;

    fn streams(&self) -> &[StreamMeta];

    /// 选这个类型里最合适的流。默认取第一条，具体实现可以按
    /// 解码器支持度和码率加权
    fn best_stream(&self, kind: StreamKind) -> Option<usize> {
        self.streams()
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.index)
    }

    /// 容器时长（微秒）
    fn duration_us(&self) -> Option<i64>;

    /// 容器起始时间（微秒）
    fn start_time_us(&self) -> Option<i64>;

    /// 容器字节大小（按字节 seek 的换算基准）
    fn byte_size(&self) -> Option<i64>;

    /// 实时源（rtp/rtsp/sdp/udp）：不限缓冲、外部时钟可变速
    fn is_realtime(&self) -> bool;

    /// 挂上中断标志：I/O 阻塞期间置位即可让读取尽快返回
    fn set_interrupt(&mut self, _flag: Arc<AtomicBool>) {}

    fn is_seekable(&self) -> bool {
        true
    }

    /// 容器是否自带时间戳跳变（决定帧时长判定上限）
    fn timestamp_discontinuities(&self) -> bool {
        false
    }

    /// 附图流的那张图（克隆一份入队）
    fn attached_picture(&self, stream: usize) -> Option<Packet>;

    fn open_video_codec(
        &mut self,
        stream: usize,
        options: &PlayerOptions,
    ) -> Result<Box<dyn VideoCodec>>;

    fn open_audio_codec(
        &mut self,
        stream: usize,
        options: &PlayerOptions,
    ) -> Result<Box<dyn AudioCodec>>;

    fn open_subtitle_codec(
        &mut self,
        stream: usize,
        options: &PlayerOptions,
    ) -> Result<Box<dyn SubtitleCodec>>;

    fn media_info(&self) -> MediaInfo;

    /// 获取描述信息（用于日志）
    fn description(&self) -> String;
}
