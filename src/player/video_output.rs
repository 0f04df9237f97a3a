use log::debug;

use crate::core::{PixelFormat, Result, SubtitleFrame, VideoFrame};

/// 纹理混合模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    None,
    Blend,
}

pub type TextureId = u64;

/// 输出矩形（窗口坐标）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// 视频渲染后端接口
///
/// 具体实现负责纹理管理与合成；纹理在任意线程同步创建，
/// 不再经由跨线程事件转发。
pub trait VideoSink: Send {
    fn create_texture(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
        blend: BlendMode,
    ) -> Result<TextureId>;

    fn upload(&mut self, texture: TextureId, frame: &VideoFrame) -> Result<()>;

    fn render(&mut self, texture: TextureId, dst: Rect);

    fn destroy_texture(&mut self, texture: TextureId);

    /// 叠加字幕文本（无窗口实现可忽略）
    fn draw_text(&mut self, _text: &str) {}

    /// 输出区域尺寸
    fn dimensions(&self) -> (u32, u32);
}

/// 像素格式转换器：把非直传格式统一转成 BGRA
///
/// 实现内部缓存转换上下文，源尺寸/格式变化时自行重建。
pub trait FrameConverter: Send {
    fn to_bgra(&mut self, frame: &VideoFrame) -> Result<VideoFrame>;
}

/// 按宽高比把画面适配进窗口，居中放置
pub fn calculate_display_rect(
    screen_width: u32,
    screen_height: u32,
    pic_width: u32,
    pic_height: u32,
) -> Rect {
    if pic_width == 0 || pic_height == 0 || screen_width == 0 || screen_height == 0 {
        return Rect { x: 0, y: 0, w: screen_width, h: screen_height };
    }
    let aspect = pic_width as f64 / pic_height as f64;
    let mut width = screen_width;
    let mut height = (width as f64 / aspect).round() as u32;
    if height > screen_height {
        height = screen_height;
        width = (height as f64 * aspect).round() as u32;
    }
    Rect {
        x: ((screen_width - width) / 2) as i32,
        y: ((screen_height - height) / 2) as i32,
        w: width.max(1),
        h: height.max(1),
    }
}

struct VideoTexture {
    id: TextureId,
    format: PixelFormat,
    width: u32,
    height: u32,
}

/// 视频输出 - 帧到后端的路由层
///
/// YUV420P 原生上传、BGRA 直传，其余格式经缓存的转换器转成 BGRA
/// 再上传。纹理只在格式或尺寸变化时重建。
pub struct VideoOutput {
    sink: Box<dyn VideoSink>,
    converter: Option<Box<dyn FrameConverter>>,
    vid_texture: Option<VideoTexture>,
    subtitle_visible: bool,
}

impl VideoOutput {
    pub fn new(sink: Box<dyn VideoSink>, converter: Option<Box<dyn FrameConverter>>) -> Self {
        Self {
            sink,
            converter,
            vid_texture: None,
            subtitle_visible: false,
        }
    }

    /// 展示一帧（以及当前字幕）
    pub fn display(&mut self, frame: &VideoFrame, subtitle: Option<&SubtitleFrame>) -> Result<()> {
        // 格式路由：直传或先转 BGRA
        let converted;
        let upload_frame = match frame.format {
            PixelFormat::Yuv420p | PixelFormat::Bgra => frame,
            _ => {
                let conv = self
                    .converter
                    .as_mut()
                    .ok_or_else(|| crate::core::PlayerError::Other("缺少像素格式转换器".into()))?;
                converted = conv.to_bgra(frame)?;
                &converted
            }
        };

        let texture = self.ensure_texture(upload_frame)?;
        self.sink.upload(texture, upload_frame)?;

        let (sw, sh) = self.sink.dimensions();
        let dst = calculate_display_rect(sw, sh, upload_frame.width, upload_frame.height);
        self.sink.render(texture, dst);

        if let Some(sub) = subtitle {
            self.sink.draw_text(&sub.text);
            self.subtitle_visible = true;
        }
        Ok(())
    }

    /// 字幕到期或换代时清掉叠加层
    pub fn clear_subtitle(&mut self) {
        if self.subtitle_visible {
            self.sink.draw_text("");
            self.subtitle_visible = false;
        }
    }

    fn ensure_texture(&mut self, frame: &VideoFrame) -> Result<TextureId> {
        let needs_new = match &self.vid_texture {
            Some(t) => {
                t.format != frame.format || t.width != frame.width || t.height != frame.height
            }
            None => true,
        };
        if needs_new {
            if let Some(old) = self.vid_texture.take() {
                self.sink.destroy_texture(old.id);
            }
            debug!(
                "重建视频纹理: {}x{} {:?}",
                frame.width, frame.height, frame.format
            );
            let id =
                self.sink
                    .create_texture(frame.format, frame.width, frame.height, BlendMode::None)?;
            self.vid_texture = Some(VideoTexture {
                id,
                format: frame.format,
                width: frame.width,
                height: frame.height,
            });
        }
        Ok(self.vid_texture.as_ref().unwrap().id)
    }
}

/// 无窗口后端：只记账，不画任何东西（测试与无显示环境用）
#[derive(Default)]
pub struct NullVideoSink {
    next_id: TextureId,
    pub created: usize,
    pub uploads: usize,
    pub renders: usize,
    pub width: u32,
    pub height: u32,
}

impl NullVideoSink {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }
}

impl VideoSink for NullVideoSink {
    fn create_texture(
        &mut self,
        _format: PixelFormat,
        _width: u32,
        _height: u32,
        _blend: BlendMode,
    ) -> Result<TextureId> {
        self.next_id += 1;
        self.created += 1;
        Ok(self.next_id)
    }

    fn upload(&mut self, _texture: TextureId, _frame: &VideoFrame) -> Result<()> {
        self.uploads += 1;
        Ok(())
    }

    fn render(&mut self, _texture: TextureId, _dst: Rect) {
        self.renders += 1;
    }

    fn destroy_texture(&mut self, _texture: TextureId) {}

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: u32, h: u32, format: PixelFormat) -> VideoFrame {
        VideoFrame {
            data: vec![0; format.buffer_size(w, h)],
            width: w,
            height: h,
            format,
            pts: 0.0,
            duration: 0.04,
            pos: -1,
            serial: 1,
        }
    }

    #[test]
    fn test_display_rect_letterbox() {
        // 16:9 画面放进 4:3 窗口：上下留黑边
        let rect = calculate_display_rect(1024, 768, 1920, 1080);
        assert_eq!(rect.w, 1024);
        assert_eq!(rect.h, 576);
        assert_eq!(rect.x, 0);
        assert_eq!(rect.y, 96);
    }

    #[test]
    fn test_display_rect_pillarbox() {
        // 4:3 画面放进 16:9 窗口：左右留黑边
        let rect = calculate_display_rect(1920, 1080, 640, 480);
        assert_eq!(rect.h, 1080);
        assert_eq!(rect.w, 1440);
        assert_eq!(rect.x, 240);
        assert_eq!(rect.y, 0);
    }

    struct CountingSink {
        inner: NullVideoSink,
        created: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl VideoSink for CountingSink {
        fn create_texture(
            &mut self,
            format: PixelFormat,
            width: u32,
            height: u32,
            blend: BlendMode,
        ) -> Result<TextureId> {
            self.created
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.create_texture(format, width, height, blend)
        }
        fn upload(&mut self, t: TextureId, f: &VideoFrame) -> Result<()> {
            self.inner.upload(t, f)
        }
        fn render(&mut self, t: TextureId, dst: Rect) {
            self.inner.render(t, dst)
        }
        fn destroy_texture(&mut self, t: TextureId) {
            self.inner.destroy_texture(t)
        }
        fn dimensions(&self) -> (u32, u32) {
            self.inner.dimensions()
        }
    }

    #[test]
    fn test_texture_reused_until_format_changes() {
        let created = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sink = CountingSink {
            inner: NullVideoSink::new(640, 480),
            created: created.clone(),
        };
        let mut out = VideoOutput::new(Box::new(sink), None);
        out.display(&frame(320, 240, PixelFormat::Yuv420p), None).unwrap();
        out.display(&frame(320, 240, PixelFormat::Yuv420p), None).unwrap();
        // 同格式同尺寸复用纹理
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);
        // 尺寸变了才重建
        out.display(&frame(640, 480, PixelFormat::Yuv420p), None).unwrap();
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_format_requires_converter() {
        let mut out = VideoOutput::new(Box::new(NullVideoSink::new(640, 480)), None);
        // RGBA 不能直传且没给转换器：报错而不是崩
        assert!(out.display(&frame(320, 240, PixelFormat::Rgba), None).is_err());
    }

    struct ToBgra;
    impl FrameConverter for ToBgra {
        fn to_bgra(&mut self, f: &VideoFrame) -> Result<VideoFrame> {
            let mut out = f.clone();
            out.format = PixelFormat::Bgra;
            out.data = vec![0; PixelFormat::Bgra.buffer_size(f.width, f.height)];
            Ok(out)
        }
    }

    #[test]
    fn test_other_formats_route_through_converter() {
        let mut out = VideoOutput::new(Box::new(NullVideoSink::new(640, 480)), Some(Box::new(ToBgra)));
        out.display(&frame(320, 240, PixelFormat::Nv12), None).unwrap();
        out.display(&frame(320, 240, PixelFormat::Rgba), None).unwrap();
    }
}
