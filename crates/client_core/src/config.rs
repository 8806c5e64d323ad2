use std::{collections::HashMap, fs, time::Duration};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    /// Ticks shown before a mission start request is issued.
    pub countdown_ticks: u32,
    pub tick_interval: Duration,
    /// Capacity of the broadcast channels UI observers subscribe to.
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            countdown_ticks: 5,
            tick_interval: Duration::from_secs(1),
            event_buffer: 256,
        }
    }
}

pub fn load_client_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_file_settings(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("CREW_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__COUNTDOWN_TICKS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.countdown_ticks = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__TICK_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.tick_interval = Duration::from_millis(parsed);
        }
    }

    settings
}

fn apply_file_settings(settings: &mut ClientSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
        settings.server_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = file_cfg
        .get("countdown_ticks")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u32::try_from(v).ok())
    {
        settings.countdown_ticks = v;
    }
    if let Some(v) = file_cfg
        .get("tick_interval_ms")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u64::try_from(v).ok())
    {
        settings.tick_interval = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg
        .get("event_buffer")
        .and_then(toml::Value::as_integer)
        .and_then(|v| usize::try_from(v).ok())
    {
        settings.event_buffer = v.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_five_one_second_ticks() {
        let settings = ClientSettings::default();
        assert_eq!(settings.countdown_ticks, 5);
        assert_eq!(settings.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn file_settings_override_defaults() {
        let mut settings = ClientSettings::default();
        apply_file_settings(
            &mut settings,
            r#"
server_url = "https://crew.example/"
countdown_ticks = 3
tick_interval_ms = 250
"#,
        );
        assert_eq!(settings.server_url, "https://crew.example");
        assert_eq!(settings.countdown_ticks, 3);
        assert_eq!(settings.tick_interval, Duration::from_millis(250));
    }

    #[test]
    fn negative_values_are_ignored() {
        let mut settings = ClientSettings::default();
        apply_file_settings(&mut settings, "countdown_ticks = -2");
        assert_eq!(settings.countdown_ticks, 5);
    }
}
