use anyhow::Result;
use log::{error, info};

mod core;
mod player;

use crate::core::{PlayerOptions, SyncMode};
use player::audio_output::CpalAudioOutput;
use player::codec_ffmpeg::{FfmpegFrameConverter, FfmpegResampler};
use player::video_output::NullVideoSink;
use player::{Command, FfmpegInput, Session, Sinks};

const USAGE: &str = "用法: lyy_player [选项] <输入文件或 URL>
选项:
  -an / -vn / -sn     关闭音频 / 视频 / 字幕
  -ss <微秒>          起播偏移
  -t <微秒>           播放时长上限
  -bytes <0|1|-1>     seek 单位：时间/字节/由容器决定
  -sync <audio|video|ext>  主时钟
  -loop <N>           播放次数（0 = 无限）
  -framedrop          总是允许丢帧
  -infbuf             不限制输入缓冲
  -volume <0..100>    初始音量
  -lowres <N>         低分辨率解码档位
  -fast               非规范加速
  -genpts             生成缺失的 pts
  -drp <-1|0|1>       视频 pts 来源
  -autoexit           播完自动退出";

/// 命令行参数 → 播放选项。保持最小实现，复杂的都在核心里
fn parse_args(args: &[String]) -> std::result::Result<PlayerOptions, String> {
    let mut options = PlayerOptions::default();
    let mut input = None;
    let mut iter = args.iter().peekable();

    fn value<'a>(
        iter: &mut std::iter::Peekable<std::slice::Iter<'a, String>>,
        flag: &str,
    ) -> std::result::Result<&'a String, String> {
        iter.next().ok_or_else(|| format!("{} 缺少参数", flag))
    }

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-an" => options.disable_audio = true,
            "-vn" => options.disable_video = true,
            "-sn" => options.disable_subtitle = true,
            "-ss" => {
                options.start_time_us =
                    Some(value(&mut iter, "-ss")?.parse().map_err(|e| format!("-ss: {}", e))?)
            }
            "-t" => {
                options.play_duration_us =
                    Some(value(&mut iter, "-t")?.parse().map_err(|e| format!("-t: {}", e))?)
            }
            "-bytes" => {
                options.seek_by_bytes = match value(&mut iter, "-bytes")?.as_str() {
                    "0" => Some(false),
                    "1" => Some(true),
                    "-1" => None,
                    other => return Err(format!("-bytes 取值无效: {}", other)),
                }
            }
            "-sync" => {
                options.sync = match value(&mut iter, "-sync")?.as_str() {
                    "audio" => SyncMode::Audio,
                    "video" => SyncMode::Video,
                    "ext" => SyncMode::External,
                    other => return Err(format!("-sync 取值无效: {}", other)),
                }
            }
            "-loop" => {
                options.loop_count =
                    value(&mut iter, "-loop")?.parse().map_err(|e| format!("-loop: {}", e))?
            }
            "-framedrop" => options.framedrop = Some(true),
            "-infbuf" => options.infinite_buffer = Some(true),
            "-volume" => {
                options.volume =
                    value(&mut iter, "-volume")?.parse().map_err(|e| format!("-volume: {}", e))?
            }
            "-lowres" => {
                options.lowres =
                    value(&mut iter, "-lowres")?.parse().map_err(|e| format!("-lowres: {}", e))?
            }
            "-fast" => options.fast = true,
            "-genpts" => options.genpts = true,
            "-drp" => {
                options.decoder_reorder_pts =
                    value(&mut iter, "-drp")?.parse().map_err(|e| format!("-drp: {}", e))?
            }
            "-autoexit" => options.autoexit = true,
            other if other.starts_with('-') => return Err(format!("未知选项: {}", other)),
            other => input = Some(other.to_string()),
        }
    }

    match input {
        Some(path) => {
            options.input = path.into();
            Ok(options)
        }
        None => Err("缺少输入文件".to_string()),
    }
}

/// 标准输入当遥控器用：p 暂停、s 单步、m 静音、9/0 音量、
/// f/b 前后 10 秒、seek N 绝对跳转、q 退出
fn spawn_stdin_control(tx: crossbeam_channel::Sender<Command>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let cmd = match line.trim() {
                "p" | "pause" => Some(Command::TogglePause),
                "s" | "step" => Some(Command::StepFrame),
                "m" | "mute" => Some(Command::Mute),
                "0" => Some(Command::VolumeUp),
                "9" => Some(Command::VolumeDown),
                "f" => Some(Command::SeekBy(10.0)),
                "b" => Some(Command::SeekBy(-10.0)),
                "q" | "quit" => Some(Command::Quit),
                "" => None,
                other => other
                    .strip_prefix("seek ")
                    .and_then(|s| s.trim().parse().ok())
                    .map(Command::SeekTo),
            };
            if let Some(cmd) = cmd {
                let quit = matches!(cmd, Command::Quit);
                if tx.send(cmd).is_err() || quit {
                    break;
                }
            }
        }
    });
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(1);
        }
    };

    info!("🎬 LYY Player 启动");

    // 初始化 FFmpeg
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("FFmpeg 初始化失败: {}", e))?;

    let path = options.input.to_string_lossy().to_string();
    let input = FfmpegInput::open(&path, &options)?;

    let sinks = Sinks {
        // 渲染后端是可替换的协作方；无窗口环境用空实现跑通整条管线
        video: Box::new(NullVideoSink::new(1280, 720)),
        converter: Some(Box::new(FfmpegFrameConverter::new())),
        audio: Box::new(CpalAudioOutput::new()),
        resampler: Box::new(FfmpegResampler::new()),
    };

    let mut session = Session::open(Box::new(input), options, sinks)?;
    spawn_stdin_control(session.command_sender());

    match session.run() {
        Ok(()) => {
            info!("✅ 播放结束");
            Ok(())
        }
        Err(e) => {
            error!("播放失败: {}", e);
            Err(e.into())
        }
    }
}
