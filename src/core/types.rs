use std::path::PathBuf;

/// 主时钟类型 - 其它时钟都向它对齐
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// 以音频时钟为主（默认）
    Audio,
    /// 以视频时钟为主
    Video,
    /// 以外部时钟为主
    External,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Audio => "audio",
            SyncMode::Video => "video",
            SyncMode::External => "ext",
        }
    }
}

/// 流时间基（num/den 秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MICROSECONDS: TimeBase = TimeBase { num: 1, den: 1_000_000 };

    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 换算为秒的系数
    pub fn to_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

/// 解封装得到的数据包
///
/// 自有字节数据，可安全跨线程传递。pts/dts 以所属流的 time_base 为单位。
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    /// 容器内字节偏移，未知为 -1
    pub pos: i64,
    pub keyframe: bool,
}

impl Packet {
    /// 空包 - 发给解码器表示"没有更多数据了，吐出缓冲帧"
    pub fn null(stream_index: usize) -> Self {
        Self {
            data: Vec::new(),
            stream_index,
            pts: None,
            dts: None,
            duration: 0,
            pos: -1,
            keyframe: false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_empty()
    }

    /// 载荷字节数（队列大小统计用）
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Rgba,
    Bgra,
}

impl PixelFormat {
    /// 紧凑存储所需的字节数
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => w * h * 3 / 2,
            PixelFormat::Rgba | PixelFormat::Bgra => w * h * 4,
        }
    }
}

/// 解码后的视频帧
///
/// pts 以秒为单位，可能为 NaN（容器没给时间戳）。serial 继承自产生
/// 该帧的数据包，消费端用它判断帧是否属于当前播放纪元。
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pts: f64,
    pub duration: f64,
    pub pos: i64,
    pub serial: u64,
}

/// 解码后的音频帧（交织 f32，保持源采样率，由音频泵统一重采样）
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Vec<f32>,
    pub rate: u32,
    pub channels: u16,
    pub nb_samples: usize,
    pub pts: f64,
    pub duration: f64,
    pub pos: i64,
    pub serial: u64,
}

/// 解码后的字幕帧
///
/// start_ms/end_ms 是相对 pts 的显示偏移（毫秒），沿用容器的表示。
#[derive(Debug, Clone)]
pub struct SubtitleFrame {
    pub text: String,
    pub pts: f64,
    pub start_ms: u32,
    pub end_ms: u32,
    pub serial: u64,
}

/// 音频输出参数（输出侧固定 S16 交织）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub freq: u32,
    pub channels: u16,
}

impl AudioParams {
    /// 单个采样点（所有声道）的字节数
    pub fn frame_size(&self) -> usize {
        self.channels as usize * 2
    }

    pub fn bytes_per_sec(&self) -> usize {
        self.freq as usize * self.frame_size()
    }
}

/// 音量混合的满刻度，步进为 1/50
pub const MIX_MAX_VOLUME: i32 = 128;

/// 媒体信息（打开成功后记录一次，供日志与 UI 使用）
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub duration_us: i64,
    pub start_time_us: i64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// 播放选项 - 原来散落的全局开关统一收进会话配置
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub input: PathBuf,
    pub disable_audio: bool,
    pub disable_video: bool,
    pub disable_subtitle: bool,
    /// 起播偏移（微秒）
    pub start_time_us: Option<i64>,
    /// 播放时长上限（微秒）
    pub play_duration_us: Option<i64>,
    /// Seek 单位：Some(true) 按字节，Some(false) 按时间，None 由容器决定
    pub seek_by_bytes: Option<bool>,
    pub sync: SyncMode,
    /// 播放次数，0 表示无限循环
    pub loop_count: u32,
    /// 丢帧策略：Some(true) 总是、Some(false) 从不、None 主时钟不是视频时自动
    pub framedrop: Option<bool>,
    /// 不限制输入缓冲：None 时实时流自动开启
    pub infinite_buffer: Option<bool>,
    pub autoexit: bool,
    /// 初始音量 0..=100
    pub volume: i32,
    pub lowres: i32,
    pub fast: bool,
    pub genpts: bool,
    /// 视频 pts 来源：-1 自动，0 用 dts，1 用 pts
    pub decoder_reorder_pts: i32,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            disable_audio: false,
            disable_video: false,
            disable_subtitle: false,
            start_time_us: None,
            play_duration_us: None,
            seek_by_bytes: None,
            sync: SyncMode::Audio,
            loop_count: 1,
            framedrop: None,
            infinite_buffer: None,
            autoexit: false,
            volume: 100,
            lowres: 0,
            fast: false,
            genpts: false,
            decoder_reorder_pts: -1,
        }
    }
}
