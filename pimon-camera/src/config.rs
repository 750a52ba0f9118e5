use std::{net::IpAddr, path::PathBuf, time::Duration};

use confique::Config;

use crate::{
    camera::{CameraSettings, SourceKind},
    remediation::{Remediator, RestoreAction},
};

#[derive(Config, Debug)]
pub struct Conf {
    /// Port to listen on
    #[config(env = "PIMON_CAMERA_PORT", default = 8000)]
    pub port: u16,

    /// Bind address
    #[config(env = "PIMON_CAMERA_ADDRESS", default = "0.0.0.0")]
    pub address: IpAddr,

    #[config(nested)]
    pub camera: CameraConf,

    #[config(nested)]
    pub stats: StatsConf,

    #[config(nested)]
    pub monitor: MonitorConf,

    #[config(nested)]
    pub remediation: RemediationConf,
}

#[derive(Config, Debug)]
pub struct CameraConf {
    /// `v4l` or `test-pattern`
    #[config(default = "v4l")]
    pub source: SourceKind,

    /// Video4Linux device node
    #[config(default = "/dev/video0")]
    pub device: String,

    #[config(default = 640)]
    pub width: u32,

    #[config(default = 480)]
    pub height: u32,

    /// Quality used when frames have to be re-encoded
    #[config(default = 80)]
    pub jpeg_quality: u8,
}

impl CameraConf {
    pub fn settings(&self) -> CameraSettings {
        CameraSettings {
            source: self.source,
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

#[derive(Config, Debug)]
pub struct StatsConf {
    /// Filesystem reported as disk usage
    #[config(default = "/")]
    pub disk_mount: PathBuf,
}

#[derive(Config, Debug)]
pub struct MonitorConf {
    /// CPU usage in percent that counts as high
    #[config(default = 45.0)]
    pub threshold: f64,

    /// Consecutive high samples before an alert
    #[config(default = 3)]
    pub duration: u32,

    /// Pause between two samples, each sample itself takes one second
    #[config(default = 1000)]
    pub poll_interval_ms: u64,
}

impl MonitorConf {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Config, Debug)]
pub struct RemediationConf {
    /// Run the restore actions on alerts, otherwise alerts are only logged
    #[config(default = true)]
    pub enabled: bool,

    /// Prefix every copy with `sudo -n`, so a password prompt fails the copy
    #[config(default = true)]
    pub use_sudo: bool,

    /// `SOURCE:DESTINATION` copies, run in order
    #[config(default = [
        "/home/hackberrypi/bashrc.backup:~/.bashrc",
        "/home/hackberrypi/motd.backup:/etc/motd"
    ])]
    pub restore: Vec<RestoreAction>,
}

impl RemediationConf {
    pub fn remediator(&self) -> Remediator {
        Remediator::new(self.use_sudo, self.restore.clone())
    }
}

pub fn load(path: &str) -> anyhow::Result<Conf> {
    Conf::builder()
        .env()
        .file(path)
        .load()
        .map_err(|e| e.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let conf = load("definitely-missing-config.toml").unwrap();

        assert_eq!(conf.port, 8000);
        assert_eq!((conf.camera.width, conf.camera.height), (640, 480));
        assert_eq!(conf.monitor.threshold, 45.0);
        assert_eq!(conf.monitor.duration, 3);
        assert_eq!(conf.remediation.restore.len(), 2);
        assert_eq!(
            conf.remediation.restore[1],
            "/home/hackberrypi/motd.backup:/etc/motd"
                .parse::<RestoreAction>()
                .unwrap()
        );
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            port = 9000

            [camera]
            source = "test-pattern"

            [remediation]
            use_sudo = false
            restore = ["/tmp/a:/tmp/b"]
            "#,
        )
        .unwrap();

        let conf = load(path.to_str().unwrap()).unwrap();
        assert_eq!(conf.port, 9000);
        assert_eq!(conf.camera.source, SourceKind::TestPattern);
        assert!(!conf.remediation.use_sudo);
        assert_eq!(conf.remediation.restore.len(), 1);
    }
}
