//! Default configuration values

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "tessera.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "tessera.yaml";

/// Default flaky store file, relative to the run root
pub const DEFAULT_FLAKY_FILE: &str = "flaky-list.json";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".tessera.toml",
        ".tessera.yaml",
    ]
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Tessera Configuration

[scheduler]
max_parallel = 4
cpu_threshold = 80.0
memory_threshold = 85.0
disk_threshold = 90.0
fail_fast = false
skip_quarantined = false
cascade_skips = true
default_timeout_secs = 900
default_max_retries = 2
retry_delay_ms = 5000

[flaky]
enabled = true
path = "flaky-list.json"
"#;
