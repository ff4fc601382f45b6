//! Testbed configuration loading and validation.
//!
//! The expected YAML structure is:
//! ```yaml
//! id: 7
//! testbed_type: "stm32-waveform"
//! devices:
//!   tester:
//!     kind: serial_tester
//!     usb_path: /dev/ttyACM0
//!     input_waveform_file: waveform.txt
//!     output_waveform_file: waveform_out.txt
//!     output_metadata:
//!       tick_frequency: 3000.0
//!   console:
//!     kind: dut_console
//!     dev_path: /dev/ttyUSB0
//!     log_file: dut_uart.txt
//! device_order: [tester, console]
//! required_input_files: [waveform.txt]
//! required_output_files: [waveform_out.txt, dut_uart.txt]
//! remote:
//!   host: grader.example.org
//!   listening_port: 9000
//! ```
//!
//! Loading goes through `anyhow` so the caller sees which file failed;
//! [`TestbedConfig::validate`] returns the structured [`ConfigError`].

pub mod error;

pub use error::ConfigError;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::device::DeviceSpec;

// ── Data structures ───────────────────────────────────────────────────────────

/// Grading-service endpoint the testbed reports to.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub use_https: bool,
    /// Set to `false` to accept self-signed certificates.
    #[serde(default = "default_ssl_verify")]
    pub ssl_verify: bool,
    /// Port the testbed's request listener is reachable on; identifies this
    /// testbed to the service.
    pub listening_port: u16,
}

fn default_ssl_verify() -> bool {
    true
}

/// One testbed: its devices and the files a task exchanges.
#[derive(Debug, Clone, Deserialize)]
pub struct TestbedConfig {
    pub id: u32,
    #[serde(default)]
    pub testbed_type: Option<String>,
    pub devices: BTreeMap<String, DeviceSpec>,
    /// Lifecycle order.  Defaults to the device names sorted.
    #[serde(default)]
    pub device_order: Option<Vec<String>>,
    #[serde(default)]
    pub required_input_files: Vec<String>,
    #[serde(default)]
    pub required_output_files: Vec<String>,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

impl TestbedConfig {
    /// Parse and validate `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid YAML for
    /// this schema (including unknown device kinds), or fails
    /// [`validate`](Self::validate).
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading testbed configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid configuration file: {}", path.display()))?;

        info!(
            "Testbed {} loaded: {} device(s), {} input(s), {} output(s)",
            config.id,
            config.devices.len(),
            config.required_input_files.len(),
            config.required_output_files.len(),
        );
        for (name, spec) in &config.devices {
            debug!("  Device: {} | kind: {}", name, spec.kind());
        }
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: TestbedConfig = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Device names in lifecycle order.
    pub fn ordered_device_names(&self) -> Vec<&str> {
        match &self.device_order {
            Some(order) => order.iter().map(String::as_str).collect(),
            None => self.devices.keys().map(String::as_str).collect(),
        }
    }

    pub fn testbed_type(&self) -> &str {
        self.testbed_type.as_deref().unwrap_or("unknown")
    }

    /// Check the structural rules a testbed must satisfy.
    ///
    /// # Errors
    /// The first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        if let Some(order) = &self.device_order {
            let mut seen = HashSet::new();
            for name in order {
                if !self.devices.contains_key(name) {
                    return Err(ConfigError::UnknownDevice(name.clone()));
                }
                if !seen.insert(name.as_str()) {
                    return Err(ConfigError::DuplicateDevice(name.clone()));
                }
            }
            if let Some(missing) = self.devices.keys().find(|n| !seen.contains(n.as_str())) {
                return Err(ConfigError::UnorderedDevice(missing.clone()));
            }
        }

        let inputs = file_set(&self.required_input_files)?;
        let outputs = file_set(&self.required_output_files)?;
        if let Some(f) = self.required_input_files.iter().find(|f| outputs.contains(f.as_str())) {
            return Err(ConfigError::InputOutputOverlap(f.clone()));
        }

        let mut writers: HashMap<&str, &str> = HashMap::new();
        for (device, spec) in &self.devices {
            for file in spec.input_files() {
                check_file_name(file)?;
                if !inputs.contains(file) {
                    return Err(ConfigError::UndeclaredInput {
                        device: device.clone(),
                        file: file.to_string(),
                    });
                }
            }
            for file in spec.output_files() {
                check_file_name(file)?;
                if inputs.contains(file) {
                    return Err(ConfigError::OutputShadowsInput {
                        device: device.clone(),
                        file: file.to_string(),
                    });
                }
                if let Some(first) = writers.insert(file, device.as_str()) {
                    return Err(ConfigError::SharedOutput {
                        first: first.to_string(),
                        second: device.clone(),
                        file: file.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn check_file_name(name: &str) -> Result<(), ConfigError> {
    let bare = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\');
    if bare {
        Ok(())
    } else {
        Err(ConfigError::InvalidFileName(name.to_string()))
    }
}

fn file_set(names: &[String]) -> Result<HashSet<&str>, ConfigError> {
    let mut set = HashSet::new();
    for name in names {
        check_file_name(name)?;
        if !set.insert(name.as_str()) {
            return Err(ConfigError::DuplicateFile(name.clone()));
        }
    }
    Ok(set)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    const EXAMPLE: &str = r#"
id: 7
testbed_type: "stm32-waveform"
devices:
  tester:
    kind: serial_tester
    usb_path: /dev/ttyACM0
    input_waveform_file: waveform.txt
    output_waveform_file: waveform_out.txt
    output_metadata:
      tick_frequency: 3000.0
      pins:
        - { label: "DUT0", indexes: [0, 1] }
  console:
    kind: dut_console
    dev_path: /dev/ttyUSB0
    log_file: dut_uart.txt
device_order: [tester, console]
required_input_files: [waveform.txt]
required_output_files: [waveform_out.txt, dut_uart.txt]
remote:
  host: grader.example.org
  port: 443
  use_https: true
  listening_port: 9000
"#;

    fn echo_yaml(extra: &str) -> String {
        format!(
            "id: 1\ndevices:\n  a:\n    kind: echo\n    input_file: in.txt\n    output_file: out.txt\n{extra}"
        )
    }

    // ── load_from_file ────────────────────────────────────────────────────────

    #[test]
    fn load_example_yaml() {
        let f = yaml_tempfile(EXAMPLE);
        let cfg = TestbedConfig::load_from_file(f.path()).unwrap();

        assert_eq!(cfg.id, 7);
        assert_eq!(cfg.testbed_type(), "stm32-waveform");
        assert_eq!(cfg.ordered_device_names(), vec!["tester", "console"]);
        assert_eq!(cfg.devices["tester"].kind(), "serial_tester");

        let remote = cfg.remote.unwrap();
        assert_eq!(remote.port, Some(443));
        assert!(remote.use_https);
        assert!(remote.ssl_verify); // default
    }

    #[test]
    fn missing_file_returns_error() {
        let result = TestbedConfig::load_from_file(Path::new("/nonexistent/path/testbed.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_yaml_returns_error() {
        let f = yaml_tempfile("this is: not: valid: yaml: content:::");
        assert!(TestbedConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let yaml = "id: 1\ndevices:\n  x:\n    kind: logic_analyzer\n";
        assert!(TestbedConfig::from_yaml(yaml).is_err());
    }

    // ── ordering ──────────────────────────────────────────────────────────────

    #[test]
    fn default_order_is_sorted_names() {
        let yaml = "id: 1\ndevices:\n  zeta:\n    kind: echo\n    input_file: i1\n    output_file: o1\n  alpha:\n    kind: echo\n    input_file: i2\n    output_file: o2\nrequired_input_files: [i1, i2]\n";
        let cfg = TestbedConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.ordered_device_names(), vec!["alpha", "zeta"]);
    }

    // ── validate ──────────────────────────────────────────────────────────────

    fn validate(yaml: &str) -> Result<(), ConfigError> {
        let cfg: TestbedConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.validate()
    }

    #[test]
    fn valid_echo_config_passes() {
        assert_eq!(
            validate(&echo_yaml(
                "required_input_files: [in.txt]\nrequired_output_files: [out.txt]\n"
            )),
            Ok(())
        );
    }

    #[test]
    fn empty_device_map_is_rejected() {
        assert_eq!(validate("id: 1\ndevices: {}\n"), Err(ConfigError::NoDevices));
    }

    #[test]
    fn order_must_be_a_permutation() {
        let base = "required_input_files: [in.txt]\n";
        assert_eq!(
            validate(&echo_yaml(&format!("{base}device_order: [a, b]\n"))),
            Err(ConfigError::UnknownDevice("b".into()))
        );
        assert_eq!(
            validate(&echo_yaml(&format!("{base}device_order: [a, a]\n"))),
            Err(ConfigError::DuplicateDevice("a".into()))
        );
        assert_eq!(
            validate(&echo_yaml(&format!("{base}device_order: []\n"))),
            Err(ConfigError::UnorderedDevice("a".into()))
        );
    }

    #[test]
    fn file_names_must_be_bare_and_unique() {
        assert_eq!(
            validate(&echo_yaml("required_input_files: [in.txt, ../x]\n")),
            Err(ConfigError::InvalidFileName("../x".into()))
        );
        assert_eq!(
            validate(&echo_yaml("required_input_files: [in.txt, in.txt]\n")),
            Err(ConfigError::DuplicateFile("in.txt".into()))
        );
    }

    #[test]
    fn inputs_and_outputs_are_disjoint() {
        assert_eq!(
            validate(&echo_yaml(
                "required_input_files: [in.txt]\nrequired_output_files: [in.txt]\n"
            )),
            Err(ConfigError::InputOutputOverlap("in.txt".into()))
        );
    }

    #[test]
    fn device_inputs_must_be_required() {
        assert_eq!(
            validate(&echo_yaml("")),
            Err(ConfigError::UndeclaredInput {
                device: "a".into(),
                file: "in.txt".into()
            })
        );
    }

    #[test]
    fn device_outputs_are_exclusive() {
        let yaml = "id: 1\ndevices:\n  a:\n    kind: echo\n    input_file: in.txt\n    output_file: out.txt\n  b:\n    kind: echo\n    input_file: in.txt\n    output_file: out.txt\nrequired_input_files: [in.txt]\n";
        assert_eq!(
            validate(yaml),
            Err(ConfigError::SharedOutput {
                first: "a".into(),
                second: "b".into(),
                file: "out.txt".into()
            })
        );

        let shadow = "id: 1\ndevices:\n  a:\n    kind: echo\n    input_file: in.txt\n    output_file: in.txt\nrequired_input_files: [in.txt]\n";
        assert_eq!(
            validate(shadow),
            Err(ConfigError::OutputShadowsInput {
                device: "a".into(),
                file: "in.txt".into()
            })
        );
    }
}
