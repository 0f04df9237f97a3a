use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig, SupportedStreamConfigRange};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::core::{AudioParams, PlayerError, Result};
use crate::player::audio_pump::{AudioPump, AUDIO_MIN_BUFFER_SIZE};

/// 回调频率上限：硬件缓冲至少装得下 1/30 秒
const MAX_CALLBACKS_PER_SEC: u32 = 30;

/// 设备实际接受的参数
#[derive(Debug, Clone, Copy)]
pub struct AudioOpened {
    pub params: AudioParams,
    /// 硬件缓冲字节数（时钟补偿用）
    pub hw_buf_size: usize,
}

/// 音频设备抽象
///
/// open 负责参数协商（带降级），start 挂上音频泵开始周期回调。
pub trait AudioDevice: Send {
    fn open(&mut self, wanted: AudioParams) -> Result<AudioOpened>;
    fn start(&mut self, pump: Arc<Mutex<AudioPump>>) -> Result<()>;
    fn close(&mut self);
}

/// 打开失败时的降级序列：先逐级减声道，声道耗尽再降采样率重来
///
/// 声道表按当前声道数索引（7 当 6 用）；采样率只会往低走。
fn fallback_candidates(wanted: AudioParams) -> Vec<AudioParams> {
    const NEXT_CHANNELS: [u16; 8] = [0, 0, 1, 6, 2, 6, 4, 6];
    const RATES: [u32; 4] = [44100, 48000, 96000, 192000];

    let mut out = vec![wanted];
    let mut rate_idx = RATES.iter().rposition(|&r| r < wanted.freq);
    let mut channels = wanted.channels;
    let mut freq = wanted.freq;
    loop {
        channels = NEXT_CHANNELS[channels.min(7) as usize];
        if channels == 0 {
            match rate_idx {
                Some(idx) => {
                    freq = RATES[idx];
                    rate_idx = idx.checked_sub(1);
                    channels = wanted.channels;
                }
                None => break,
            }
        }
        out.push(AudioParams { freq, channels });
    }
    out
}

/// 按回调频率上限算硬件缓冲大小（采样帧数，二的幂）
fn hw_buffer_samples(freq: u32) -> usize {
    let period = (freq / MAX_CALLBACKS_PER_SEC).max(1);
    AUDIO_MIN_BUFFER_SIZE.max(2usize << period.ilog2())
}

/// 音频输出 - 用 cpal 驱动系统音频设备
pub struct CpalAudioOutput {
    device: Option<cpal::Device>,
    config: Option<StreamConfig>,
    stream: Option<cpal::Stream>,
}

// cpal::Stream 不是 Send，但我们保证它只在创建它的会话线程中被持有和销毁
unsafe impl Send for CpalAudioOutput {}

impl CpalAudioOutput {
    pub fn new() -> Self {
        Self {
            device: None,
            config: None,
            stream: None,
        }
    }

    fn config_supported(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_ok = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        let channels_ok = config.channels == supported.channels();
        let format_ok = supported.sample_format() == cpal::SampleFormat::I16;
        rate_ok && channels_ok && format_ok
    }
}

impl Default for CpalAudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for CpalAudioOutput {
    fn open(&mut self, wanted: AudioParams) -> Result<AudioOpened> {
        if wanted.freq == 0 || wanted.channels == 0 {
            return Err(PlayerError::AudioError("无效的音频参数".to_string()));
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        // 逐个候选参数试，全部失败才算打不开
        let mut chosen: Option<AudioParams> = None;
        for candidate in fallback_candidates(wanted) {
            let config = StreamConfig {
                channels: candidate.channels,
                sample_rate: SampleRate(candidate.freq),
                buffer_size: cpal::BufferSize::Default,
            };
            let supported = device
                .supported_output_configs()
                .map_err(|e| PlayerError::AudioError(format!("无法枚举音频配置: {}", e)))?;
            if supported.into_iter().any(|s| Self::config_supported(&config, &s)) {
                if candidate != wanted {
                    warn!(
                        "⚠️  设备不支持 {} Hz / {} 声道，降级到 {} Hz / {} 声道",
                        wanted.freq, wanted.channels, candidate.freq, candidate.channels
                    );
                }
                chosen = Some(candidate);
                break;
            }
        }
        let params = chosen.ok_or_else(|| {
            PlayerError::AudioError(format!(
                "音频设备不接受任何候选配置（原请求 {} Hz / {} 声道）",
                wanted.freq, wanted.channels
            ))
        })?;

        self.config = Some(StreamConfig {
            channels: params.channels,
            sample_rate: SampleRate(params.freq),
            buffer_size: cpal::BufferSize::Default,
        });
        self.device = Some(device);

        let hw_buf_size = hw_buffer_samples(params.freq) * params.frame_size();
        info!(
            "音频参数协商完成: {} Hz, {} 声道, 硬件缓冲 {} 字节",
            params.freq, params.channels, hw_buf_size
        );
        Ok(AudioOpened { params, hw_buf_size })
    }

    fn start(&mut self, pump: Arc<Mutex<AudioPump>>) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| PlayerError::AudioError("音频设备尚未打开".to_string()))?;
        let config = self.config.clone().unwrap();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    pump.lock().fill(data);
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;
        stream
            .play()
            .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;
        self.stream = Some(stream);
        info!("音频输出已启动");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!("音频输出已停止");
        }
    }
}

impl Drop for CpalAudioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// 无声后端：假装打开成功，测试里手动驱动音频泵
pub struct NullAudioDevice {
    pub pump: Option<Arc<Mutex<AudioPump>>>,
    pub hw_buf_size: usize,
}

impl NullAudioDevice {
    pub fn new(hw_buf_size: usize) -> Self {
        Self {
            pump: None,
            hw_buf_size,
        }
    }
}

impl AudioDevice for NullAudioDevice {
    fn open(&mut self, wanted: AudioParams) -> Result<AudioOpened> {
        Ok(AudioOpened {
            params: wanted,
            hw_buf_size: self.hw_buf_size,
        })
    }

    fn start(&mut self, pump: Arc<Mutex<AudioPump>>) -> Result<()> {
        self.pump = Some(pump);
        Ok(())
    }

    fn close(&mut self) {
        self.pump = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_walks_channels_then_rates() {
        let seq = fallback_candidates(AudioParams { freq: 48000, channels: 2 });
        assert_eq!(seq[0], AudioParams { freq: 48000, channels: 2 });
        assert_eq!(seq[1], AudioParams { freq: 48000, channels: 1 });
        assert_eq!(seq[2], AudioParams { freq: 44100, channels: 2 });
        assert_eq!(seq[3], AudioParams { freq: 44100, channels: 1 });
        assert_eq!(seq.len(), 4);
    }

    #[test]
    fn test_fallback_multichannel_descends() {
        let seq = fallback_candidates(AudioParams { freq: 44100, channels: 6 });
        // 6 → 4 → 2 → 1，采样率已是最低档就不再降
        let channels: Vec<u16> = seq.iter().map(|p| p.channels).collect();
        assert_eq!(channels, vec![6, 4, 2, 1]);
        assert!(seq.iter().all(|p| p.freq == 44100));
    }

    #[test]
    fn test_fallback_seven_channels_treated_as_six() {
        let seq = fallback_candidates(AudioParams { freq: 48000, channels: 7 });
        assert_eq!(seq[1].channels, 6);
    }

    #[test]
    fn test_fallback_high_rate_steps_down() {
        let seq = fallback_candidates(AudioParams { freq: 192000, channels: 2 });
        let rates: Vec<u32> = seq.iter().map(|p| p.freq).collect();
        assert!(rates.contains(&96000));
        assert!(rates.contains(&48000));
        assert!(rates.contains(&44100));
    }

    #[test]
    fn test_hw_buffer_size_power_of_two() {
        // 48000/30 = 1600 → 2048
        assert_eq!(hw_buffer_samples(48000), 2048);
        // 最小不低于静音配额
        assert_eq!(hw_buffer_samples(8000), AUDIO_MIN_BUFFER_SIZE);
        assert_eq!(hw_buffer_samples(192000), 8192);
    }
}
