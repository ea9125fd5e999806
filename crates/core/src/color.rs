//! Presentation color per trigger type.

#![forbid(unsafe_code)]

use crate::TriggerType;

pub const CRON: &str = "#3b82f6";
pub const MESSAGE_QUEUE: &str = "#10b981";
pub const KAFKA: &str = "#f59e0b";
pub const HTTP: &str = "#8b5cf6";
pub const PROMETHEUS: &str = "#ef4444";
pub const CUSTOM: &str = "#6b7280";

/// Color code for a trigger type. Pure; callers on every write path go through here.
pub fn derive_color(t: TriggerType) -> &'static str {
    match t {
        TriggerType::Cron => CRON,
        TriggerType::MessageQueue => MESSAGE_QUEUE,
        TriggerType::Kafka => KAFKA,
        TriggerType::Http => HTTP,
        TriggerType::Prometheus => PROMETHEUS,
        TriggerType::Custom => CUSTOM,
    }
}

/// Color for a raw trigger type name; unknown names get the cron color.
pub fn color_for_name(name: &str) -> &'static str {
    name.parse::<TriggerType>().map(derive_color).unwrap_or(CRON)
}
