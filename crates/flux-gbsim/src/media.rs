// 推流源
// 把本地媒体推到中继的本地端口，中继只负责转发和统计

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::config::MediaConfig;
use crate::session::SessionKey;
use crate::{Result, SimError};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// 一次推流请求
#[derive(Debug, Clone)]
pub struct FeedRequest<'a> {
    pub device_id: &'a str,
    pub key: &'a SessionKey,
    /// 画面水印（通道名，缺省为通道编码）
    pub label: &'a str,
    /// 中继的本地监听端口
    pub local_port: u16,
}

/// 推流进程句柄
#[derive(Debug, Default)]
pub struct FeedHandle {
    child: Option<Child>,
}

impl FeedHandle {
    pub fn none() -> Self {
        Self { child: None }
    }

    pub fn from_child(child: Child) -> Self {
        Self { child: Some(child) }
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// 结束推流进程：先 kill，超时未退出则放弃等待
    pub async fn terminate(mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            tracing::debug!(target: "gbsim::media", error = %e, "Feed process already exited");
            return;
        }
        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(target: "gbsim::media", %status, "Feed process stopped");
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "gbsim::media", error = %e, "Failed to wait for feed process");
            }
            Err(_) => {
                tracing::warn!(target: "gbsim::media", "Feed process did not exit in time");
            }
        }
    }
}

/// 媒体源
///
/// 中继只告诉媒体源一个本地端口，不关心内容。
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn start(&self, req: FeedRequest<'_>) -> Result<FeedHandle>;

    async fn stop(&self, handle: FeedHandle) {
        handle.terminate().await;
    }
}

/// 不推流（仅保留中继），用于测试或外部自行推流
#[derive(Debug, Default, Clone)]
pub struct NullSource;

#[async_trait]
impl MediaSource for NullSource {
    async fn start(&self, req: FeedRequest<'_>) -> Result<FeedHandle> {
        tracing::debug!(
            target: "gbsim::media",
            session = %req.key,
            local_port = req.local_port,
            "Media feed disabled"
        );
        Ok(FeedHandle::none())
    }
}

/// 基于 ffmpeg 的本地文件循环推流
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    config: MediaConfig,
}

impl FfmpegSource {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    /// 收集可用的 .mp4 文件：显式源文件在前，其余按目录扫描排序
    pub fn collect_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();

        for dir in &self.config.search_dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut found: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_mp4(p))
                .collect();
            found.sort();
            for path in found {
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }

        if let Some(source) = self.config.source.as_ref().filter(|p| p.is_file()) {
            files.retain(|p| p != source);
            files.insert(0, source.clone());
        }

        files
    }

    async fn write_playlist(&self, device_id: &str, files: &[PathBuf]) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("gbsim_playlist_{}.txt", device_id));
        let content: String = files
            .iter()
            .map(|p| format!("file '{}'\n", p.display()))
            .collect();
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| SimError::Media(format!("Failed to write playlist {}: {}", path.display(), e)))?;
        Ok(path)
    }
}

#[async_trait]
impl MediaSource for FfmpegSource {
    async fn start(&self, req: FeedRequest<'_>) -> Result<FeedHandle> {
        if !self.config.enabled {
            return Ok(FeedHandle::none());
        }

        let files = self.collect_files();
        let input = match files.len() {
            0 => {
                return Err(SimError::Media(
                    "No local .mp4 files found in the configured search dirs".into(),
                ))
            }
            1 => FeedInput::File(files[0].clone()),
            _ => FeedInput::Playlist(self.write_playlist(req.device_id, &files).await?),
        };

        let args = ffmpeg_args(&input, &self.config, req.label, req.local_port);
        let child = Command::new(&self.config.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SimError::Media(format!("Failed to spawn {}: {}", self.config.ffmpeg, e)))?;

        tracing::info!(
            target: "gbsim::media",
            session = %req.key,
            files = files.len(),
            url = %format!("rtp://127.0.0.1:{}", req.local_port),
            "Media feed started"
        );
        Ok(FeedHandle::from_child(child))
    }
}

/// ffmpeg 输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedInput {
    File(PathBuf),
    Playlist(PathBuf),
}

/// 生成 ffmpeg 参数：循环实时读取，叠加水印，H.264/AAC 以 rtp_mpegts 推到本地端口
pub fn ffmpeg_args(input: &FeedInput, config: &MediaConfig, label: &str, local_port: u16) -> Vec<String> {
    let mut args: Vec<String> = vec!["-stream_loop".into(), "-1".into(), "-re".into()];
    match input {
        FeedInput::File(path) => {
            args.push("-i".into());
            args.push(path.display().to_string());
        }
        FeedInput::Playlist(path) => {
            args.extend(["-f", "concat", "-safe", "0", "-i"].map(String::from));
            args.push(path.display().to_string());
        }
    }

    let text = drawtext_escape(label);
    let filter = match &config.font_file {
        Some(font) => format!(
            "drawtext=fontfile={}:text='{}':fontcolor=white:fontsize=28:box=1:boxcolor=black@0.4:boxborderw=6:x=10:y=10",
            font.display(),
            text
        ),
        None => format!(
            "drawtext=text='{}':fontcolor=white:fontsize=28:box=1:boxcolor=black@0.4:boxborderw=6:x=10:y=10",
            text
        ),
    };
    args.push("-vf".into());
    args.push(filter);

    let bitrate = format!("{}k", config.bitrate_kbps);
    let bufsize = format!("{}k", config.bitrate_kbps * 2);
    args.extend(
        [
            "-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency", "-b:v", bitrate.as_str(),
            "-maxrate", bitrate.as_str(), "-bufsize", bufsize.as_str(), "-g", "50", "-pix_fmt", "yuv420p",
            "-flags", "+global_header", "-c:a", "aac", "-b:a", "128k", "-f", "rtp_mpegts",
        ]
        .map(String::from),
    );
    args.push(format!("rtp://127.0.0.1:{}", local_port));
    args
}

fn is_mp4(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false)
}

fn drawtext_escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "")
        .replace(':', "\\:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_collect_files_orders_explicit_source_first() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.mp4"), b"x").unwrap();
        fs::write(dir.path().join("a.MP4"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let config = MediaConfig {
            search_dirs: vec![dir.path().to_path_buf(), dir.path().join("missing")],
            source: Some(dir.path().join("b.mp4")),
            ..MediaConfig::default()
        };
        let files = FfmpegSource::new(config).collect_files();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0], dir.path().join("b.mp4"));
        assert_eq!(files[1], dir.path().join("a.MP4"));
    }

    #[test]
    fn test_ffmpeg_args() {
        let config = MediaConfig {
            bitrate_kbps: 1000,
            font_file: None,
            ..MediaConfig::default()
        };
        let args = ffmpeg_args(
            &FeedInput::Playlist(PathBuf::from("/tmp/list.txt")),
            &config,
            "cam:1",
            40000,
        );

        let joined = args.join(" ");
        assert!(joined.starts_with("-stream_loop -1 -re -f concat -safe 0 -i /tmp/list.txt"));
        assert!(joined.contains("text='cam\\:1'"));
        assert!(joined.contains("-b:v 1000k -maxrate 1000k -bufsize 2000k"));
        assert_eq!(args.last().unwrap(), "rtp://127.0.0.1:40000");
    }

    #[tokio::test]
    async fn test_disabled_source_starts_nothing() {
        let source = FfmpegSource::new(MediaConfig {
            enabled: false,
            ..MediaConfig::default()
        });
        let key = SessionKey::new("CH1", "10.0.0.5:5004".parse().unwrap());
        let handle = source
            .start(FeedRequest {
                device_id: "dev",
                key: &key,
                label: "CH1",
                local_port: 1,
            })
            .await
            .unwrap();
        assert!(!handle.is_running());
        source.stop(handle).await;
    }

    #[tokio::test]
    async fn test_no_files_is_media_error() {
        let dir = tempdir().unwrap();
        let source = FfmpegSource::new(MediaConfig {
            search_dirs: vec![dir.path().to_path_buf()],
            ..MediaConfig::default()
        });
        let key = SessionKey::new("CH1", "10.0.0.5:5004".parse().unwrap());
        let result = source
            .start(FeedRequest {
                device_id: "dev",
                key: &key,
                label: "CH1",
                local_port: 1,
            })
            .await;
        assert!(matches!(result, Err(SimError::Media(_))));
    }
}
