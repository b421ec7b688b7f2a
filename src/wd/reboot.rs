use crate::wd::log::event;

/// One year; longer intervals are refused rather than silently truncated.
const MAX_REBOOT_MINUTES: i64 = 525_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootPolicy {
    Disabled,
    /// Local wall-clock time, 24h.
    Daily { hour: u32, min: u32 },
    Interval { minutes: i64 },
}

/// Grammar: `HH:MM` daily; `Nh`/`Nd`/`Nw`/`Nm` hours/days/weeks/30-days;
/// bare `N` means days. Anything unparsable disables the feature.
pub fn parse_periodic_reboot(value: &str) -> RebootPolicy {
    let value = value.trim();
    if value.is_empty() {
        return RebootPolicy::Disabled;
    }

    if let Some((h, m)) = value.split_once(':') {
        if let (Ok(hour), Ok(min)) = (h.trim().parse::<u32>(), m.trim().parse::<u32>()) {
            if hour <= 23 && min <= 59 {
                event("reboot", None, format!("periodic reboot daily at {hour:02}:{min:02}"));
                return RebootPolicy::Daily { hour, min };
            }
        }
        event("reboot", None, format!("invalid periodic_reboot time {value:?}, disabled"));
        return RebootPolicy::Disabled;
    }

    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let Ok(interval) = value[..digits_end].parse::<i64>() else {
        event("reboot", None, format!("invalid periodic_reboot {value:?}, disabled"));
        return RebootPolicy::Disabled;
    };
    let unit = value[digits_end..].trim();
    let multiplier: i64 = match unit {
        "h" | "H" => 60,
        "" | "d" | "D" => 24 * 60,
        "w" | "W" => 7 * 24 * 60,
        "m" | "M" => 30 * 24 * 60,
        _ => {
            event("reboot", None, format!("invalid periodic_reboot unit {unit:?}, disabled"));
            return RebootPolicy::Disabled;
        }
    };

    if interval <= 0 {
        event("reboot", None, format!("invalid periodic_reboot {value:?}, disabled"));
        return RebootPolicy::Disabled;
    }
    let Some(minutes) = interval.checked_mul(multiplier) else {
        event("reboot", None, "periodic_reboot interval overflows, disabled");
        return RebootPolicy::Disabled;
    };
    if minutes > MAX_REBOOT_MINUTES {
        event(
            "reboot",
            None,
            format!("periodic_reboot interval of {minutes} minutes is too long (max {MAX_REBOOT_MINUTES}), disabled"),
        );
        return RebootPolicy::Disabled;
    }

    event("reboot", None, format!("periodic reboot every {minutes} minutes"));
    RebootPolicy::Interval { minutes }
}

impl RebootPolicy {
    /// Called once per uptime minute; `local_hm` is the current local
    /// (hour, minute) for the daily mode.
    pub fn due(&self, uptime_s: i64, local_hm: (u32, u32)) -> bool {
        match *self {
            RebootPolicy::Disabled => false,
            RebootPolicy::Daily { hour, min } => local_hm == (hour, min),
            RebootPolicy::Interval { minutes } => {
                let uptime_minutes = uptime_s / 60;
                uptime_minutes > 0 && uptime_minutes % minutes == 0
            }
        }
    }
}
