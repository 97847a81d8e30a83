//! Server-level configuration, loaded once at start from TOML.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use shared::{ClientInfo, TransformName};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Streaming server parameters.
///
/// Only `ListeningPort` and `OutputChannelId` are required.
///
/// ```toml
/// ListeningPort = 18944
/// OutputChannelId = "TrackerStream"
/// MaxTimeSpentWithProcessingMs = 50
///
/// [DefaultClientInfo]
/// TransformNames = ["ToolToTracker"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ServerConfig {
    /// TCP port to listen on, 0 picks an ephemeral port
    pub listening_port: u16,
    /// Frame source channel to broadcast
    pub output_channel_id: String,
    #[serde(default)]
    pub missing_input_grace_period_sec: f64,
    #[serde(default = "default_processing_budget_ms")]
    pub max_time_spent_with_processing_ms: f64,
    #[serde(default = "default_max_messages_per_batch")]
    pub max_messages_per_batch: usize,
    #[serde(default = "default_send_retry_attempts")]
    pub send_retry_attempts: u32,
    #[serde(default = "default_send_retry_delay_sec")]
    pub send_retry_delay_sec: f64,
    /// Defaults to half the client send timeout
    #[serde(default)]
    pub keep_alive_interval_sec: Option<f64>,
    #[serde(default = "default_true")]
    pub send_valid_transforms_only: bool,
    #[serde(default)]
    pub crc_check_enabled: bool,
    #[serde(default = "default_true")]
    pub warn_on_no_data_available: bool,
    #[serde(default = "default_socket_timeout_sec")]
    pub client_send_timeout_sec: f64,
    #[serde(default = "default_socket_timeout_sec")]
    pub client_receive_timeout_sec: f64,
    #[serde(default)]
    pub max_number_of_strays: u32,
    #[serde(default = "default_stray_reference_frame")]
    pub stray_reference_frame: String,
    /// Directory that named resource requests are resolved against
    #[serde(default)]
    pub resource_directory: Option<PathBuf>,
    /// Subscription given to clients that never send their own
    #[serde(default)]
    pub default_client_info: ClientInfo,
}

fn default_processing_budget_ms() -> f64 {
    50.0
}

fn default_max_messages_per_batch() -> usize {
    100
}

fn default_send_retry_attempts() -> u32 {
    10
}

fn default_send_retry_delay_sec() -> f64 {
    0.05
}

fn default_true() -> bool {
    true
}

fn default_socket_timeout_sec() -> f64 {
    0.5
}

fn default_stray_reference_frame() -> String {
    "Tracker".to_string()
}

impl ServerConfig {
    /// A configuration with every optional parameter at its default.
    pub fn new(listening_port: u16, output_channel_id: impl Into<String>) -> Self {
        Self {
            listening_port,
            output_channel_id: output_channel_id.into(),
            missing_input_grace_period_sec: 0.0,
            max_time_spent_with_processing_ms: default_processing_budget_ms(),
            max_messages_per_batch: default_max_messages_per_batch(),
            send_retry_attempts: default_send_retry_attempts(),
            send_retry_delay_sec: default_send_retry_delay_sec(),
            keep_alive_interval_sec: None,
            send_valid_transforms_only: true,
            crc_check_enabled: false,
            warn_on_no_data_available: true,
            client_send_timeout_sec: default_socket_timeout_sec(),
            client_receive_timeout_sec: default_socket_timeout_sec(),
            max_number_of_strays: 0,
            stray_reference_frame: default_stray_reference_frame(),
            resource_directory: None,
            default_client_info: ClientInfo::default(),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ServerError> {
        let config: ServerConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ServerError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Rejects values the loops cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        let invalid = |msg: String| Err(ServerError::InvalidConfig(msg));

        if self.output_channel_id.trim().is_empty() {
            return invalid("OutputChannelId must not be empty".to_string());
        }
        if !(self.max_time_spent_with_processing_ms > 0.0) {
            return invalid(format!(
                "MaxTimeSpentWithProcessingMs must be positive, got {}",
                self.max_time_spent_with_processing_ms
            ));
        }
        if self.max_messages_per_batch == 0 {
            return invalid("MaxMessagesPerBatch must be at least 1".to_string());
        }
        if self.send_retry_attempts == 0 {
            return invalid("SendRetryAttempts must be at least 1".to_string());
        }
        if !(self.send_retry_delay_sec >= 0.0) {
            return invalid(format!(
                "SendRetryDelaySec must not be negative, got {}",
                self.send_retry_delay_sec
            ));
        }
        if !(self.client_send_timeout_sec > 0.0) || !(self.client_receive_timeout_sec > 0.0) {
            return invalid("client socket timeouts must be positive".to_string());
        }
        if !(self.missing_input_grace_period_sec >= 0.0) {
            return invalid(format!(
                "MissingInputGracePeriodSec must not be negative, got {}",
                self.missing_input_grace_period_sec
            ));
        }
        if let Some(interval) = self.keep_alive_interval_sec {
            if !(interval >= 0.0) {
                return invalid(format!(
                    "KeepAliveIntervalSec must not be negative, got {}",
                    interval
                ));
            }
        }
        let durations = [
            ("SendRetryDelaySec", Some(self.send_retry_delay_sec)),
            ("ClientSendTimeoutSec", Some(self.client_send_timeout_sec)),
            ("ClientReceiveTimeoutSec", Some(self.client_receive_timeout_sec)),
            ("MissingInputGracePeriodSec", Some(self.missing_input_grace_period_sec)),
            ("KeepAliveIntervalSec", self.keep_alive_interval_sec),
        ];
        for (key, value) in durations {
            if let Some(value) = value {
                if Duration::try_from_secs_f64(value).is_err() {
                    return invalid(format!("{} is not a usable duration: {}", key, value));
                }
            }
        }
        if self.max_number_of_strays > 0 && self.stray_reference_frame.is_empty() {
            return invalid("StrayReferenceFrame is required when strays are enabled".to_string());
        }
        Ok(())
    }

    pub fn keep_alive_interval(&self) -> Duration {
        let secs = self
            .keep_alive_interval_sec
            .unwrap_or(self.client_send_timeout_sec / 2.0);
        seconds(secs)
    }

    pub fn send_retry_delay(&self) -> Duration {
        seconds(self.send_retry_delay_sec)
    }

    pub fn client_send_timeout(&self) -> Duration {
        seconds(self.client_send_timeout_sec)
    }

    pub fn client_receive_timeout(&self) -> Duration {
        seconds(self.client_receive_timeout_sec)
    }

    pub fn missing_input_grace_period(&self) -> Duration {
        seconds(self.missing_input_grace_period_sec)
    }

    /// The subscription a fresh session starts with: the configured template
    /// plus one `StrayNNTo<Reference>` transform per configured stray.
    pub fn default_client_info(&self) -> ClientInfo {
        let mut info = self.default_client_info.clone();
        for index in 1..=self.max_number_of_strays {
            let name = TransformName::new(format!("Stray{:02}", index), &self.stray_reference_frame);
            if !info.transform_names.contains(&name) {
                info.transform_names.push(name);
            }
        }
        info
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::io::Write;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config =
            ServerConfig::from_toml_str("ListeningPort = 18944\nOutputChannelId = \"TrackerStream\"")
                .unwrap();

        assert_eq!(config, ServerConfig::new(18944, "TrackerStream"));
        assert_approx_eq!(config.max_time_spent_with_processing_ms, 50.0);
        assert_eq!(config.max_messages_per_batch, 100);
        assert_eq!(config.send_retry_attempts, 10);
        assert!(config.send_valid_transforms_only);
        assert!(!config.crc_check_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_required_key_fails_to_parse() {
        let result = ServerConfig::from_toml_str("ListeningPort = 18944");
        assert!(matches!(result, Err(ServerError::ConfigParse(_))));
    }

    #[test]
    fn test_full_config_parses() {
        let toml = r#"
            ListeningPort = 0
            OutputChannelId = "TrackerStream"
            MissingInputGracePeriodSec = 2.5
            MaxMessagesPerBatch = 20
            SendRetryDelaySec = 0.01
            KeepAliveIntervalSec = 1.0
            CrcCheckEnabled = true
            ResourceDirectory = "models"

            [DefaultClientInfo]
            TransformNames = ["ToolToTracker", "ProbeToReference"]
            StringNames = ["Depth"]

            [[DefaultClientInfo.ImageStreams]]
            Name = "Image"
            EmbeddedTransformToFrame = "Reference"
        "#;
        let config = ServerConfig::from_toml_str(toml).unwrap();

        assert_eq!(config.max_messages_per_batch, 20);
        assert!(config.crc_check_enabled);
        assert_eq!(config.keep_alive_interval(), Duration::from_secs(1));
        assert_eq!(config.resource_directory, Some(PathBuf::from("models")));
        assert_eq!(config.default_client_info.transform_names.len(), 2);
        assert_eq!(config.default_client_info.transform_names[1].to, "Reference");
        assert_eq!(config.default_client_info.image_streams[0].name, "Image");
    }

    #[test]
    fn test_bad_transform_name_is_a_parse_error() {
        let toml = r#"
            ListeningPort = 1
            OutputChannelId = "A"
            [DefaultClientInfo]
            TransformNames = ["Tracker"]
        "#;
        assert!(matches!(
            ServerConfig::from_toml_str(toml),
            Err(ServerError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_keep_alive_defaults_to_half_send_timeout() {
        let config = ServerConfig::new(1, "A");
        assert_eq!(config.keep_alive_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = ServerConfig::new(1, "A");

        let mut config = base.clone();
        config.output_channel_id = " ".to_string();
        assert!(matches!(config.validate(), Err(ServerError::InvalidConfig(_))));

        let mut config = base.clone();
        config.max_time_spent_with_processing_ms = 0.0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.max_messages_per_batch = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.send_retry_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.client_receive_timeout_sec = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = base;
        config.keep_alive_interval_sec = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unrepresentable_durations() {
        let base = ServerConfig::new(1, "A");

        let mut config = base.clone();
        config.client_send_timeout_sec = f64::INFINITY;
        assert!(matches!(config.validate(), Err(ServerError::InvalidConfig(_))));

        let mut config = base.clone();
        config.send_retry_delay_sec = 1e300;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.keep_alive_interval_sec = Some(f64::INFINITY);
        assert!(config.validate().is_err());

        let parsed = ServerConfig::from_toml_str(
            "ListeningPort = 1\nOutputChannelId = \"A\"\nClientSendTimeoutSec = inf",
        )
        .unwrap();
        assert!(parsed.validate().is_err());

        assert!(base.validate().is_ok());
    }

    #[test]
    fn test_strays_extend_default_subscription() {
        let mut config = ServerConfig::new(1, "A");
        config.max_number_of_strays = 11;
        config.default_client_info.transform_names =
            vec![TransformName::parse("ToolToTracker").unwrap()];

        let names: Vec<String> = config
            .default_client_info()
            .transform_names
            .iter()
            .map(|n| n.to_string())
            .collect();

        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "ToolToTracker");
        assert_eq!(names[1], "Stray01ToTracker");
        assert_eq!(names[9], "Stray09ToTracker");
        assert_eq!(names[10], "Stray10ToTracker");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ListeningPort = 18945").unwrap();
        writeln!(file, "OutputChannelId = \"Video\"").unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.listening_port, 18945);
        assert_eq!(config.output_channel_id, "Video");

        let missing = ServerConfig::load(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(ServerError::Io(_))));
    }
}
