use crate::wd::log::event;
use crate::wd::reboot::{parse_periodic_reboot, RebootPolicy};
use crate::wd::{MAX_APPS, MAX_APP_CMD_LENGTH, MAX_APP_NAME_LENGTH};
use anyhow::Context as _;
use ini::Ini;
use std::path::Path;

const WATCHDOG_SECTION: &str = "processWatchdog";
const APP_SECTION_PREFIX: &str = "app:";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    pub cmd: String,
    pub start_delay: u32,
    pub heartbeat_delay: u32,
    pub heartbeat_interval: u32,
}

#[derive(Debug)]
pub struct Config {
    pub udp_port: u16,
    pub periodic_reboot: RebootPolicy,
    /// Declaration order from the file; fixed for the supervisor's lifetime.
    pub apps: Vec<AppConfig>,
}

/// Named-section grammar only. The historical positional grammar
/// (`n_apps`, `1_name`, ...) is rejected outright so the two cannot be mixed.
/// Unknown keys and unknown sections are ignored.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let ini = Ini::load_from_file(path)
        .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;

    let wd = ini
        .section(Some(WATCHDOG_SECTION))
        .with_context(|| format!("missing [{WATCHDOG_SECTION}] section in {}", path.display()))?;
    anyhow::ensure!(
        wd.get("n_apps").is_none(),
        "positional app grammar (n_apps) is not supported; use [app:<Name>] sections"
    );

    let port_raw = wd.get("udp_port").context("missing udp_port")?;
    let udp_port: u32 = port_raw
        .trim()
        .parse()
        .with_context(|| format!("invalid udp_port {port_raw:?}"))?;
    anyhow::ensure!(
        (1..=65535).contains(&udp_port),
        "udp_port {udp_port} out of range 1..65535"
    );

    let periodic_reboot = match wd.get("periodic_reboot") {
        Some(v) => parse_periodic_reboot(v),
        None => RebootPolicy::Disabled,
    };

    let mut apps: Vec<AppConfig> = Vec::new();
    for (section, props) in ini.iter() {
        let Some(section) = section else { continue };
        let Some(name) = section.strip_prefix(APP_SECTION_PREFIX) else {
            continue;
        };
        anyhow::ensure!(!name.is_empty(), "empty app name in section [{section}]");
        anyhow::ensure!(
            name.len() < MAX_APP_NAME_LENGTH,
            "app name {name:?} longer than {} characters",
            MAX_APP_NAME_LENGTH - 1
        );
        anyhow::ensure!(
            !apps.iter().any(|a| a.name.eq_ignore_ascii_case(name)),
            "duplicate app section [{section}]"
        );
        if apps.len() >= MAX_APPS {
            event(
                "config",
                None,
                format!("MAX_APPS ({MAX_APPS}) reached, ignoring section [{section}]"),
            );
            continue;
        }

        let cmd = props
            .get("cmd")
            .with_context(|| format!("app {name} has no cmd"))?
            .trim()
            .to_string();
        anyhow::ensure!(!cmd.is_empty(), "app {name} has an empty cmd");
        anyhow::ensure!(
            cmd.len() < MAX_APP_CMD_LENGTH,
            "cmd for app {name} longer than {} characters",
            MAX_APP_CMD_LENGTH - 1
        );

        apps.push(AppConfig {
            name: name.to_string(),
            cmd,
            start_delay: parse_seconds(props.get("start_delay"), "start_delay", name)?,
            heartbeat_delay: parse_seconds(props.get("heartbeat_delay"), "heartbeat_delay", name)?,
            heartbeat_interval: parse_seconds(
                props.get("heartbeat_interval"),
                "heartbeat_interval",
                name,
            )?,
        });
    }

    event(
        "config",
        None,
        format!("{} apps found in {}", apps.len(), path.display()),
    );
    Ok(Config {
        udp_port: udp_port as u16,
        periodic_reboot,
        apps,
    })
}

fn parse_seconds(value: Option<&str>, key: &str, app: &str) -> anyhow::Result<u32> {
    match value {
        None => Ok(0),
        Some(v) => v
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid {key} for app {app}: {v:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_ini(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const SAMPLE: &str = "\
[processWatchdog]
udp_port = 12345
periodic_reboot = 04:00

[app:Communicator]
start_delay = 10
heartbeat_delay = 60
heartbeat_interval = 20
cmd = /usr/bin/python test_child.py 1 crash

[app:Bot]
start_delay = 20
heartbeat_delay = 90
heartbeat_interval = 30
cmd = /usr/bin/python test_child.py 2 noheartbeat
";

    #[test]
    fn parses_the_named_section_grammar() {
        let f = write_ini(SAMPLE);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.udp_port, 12345);
        assert_eq!(cfg.periodic_reboot, RebootPolicy::Daily { hour: 4, min: 0 });
        assert_eq!(cfg.apps.len(), 2);
        assert_eq!(cfg.apps[0].name, "Communicator");
        assert_eq!(cfg.apps[0].start_delay, 10);
        assert_eq!(cfg.apps[0].heartbeat_interval, 20);
        assert_eq!(cfg.apps[1].name, "Bot");
        assert_eq!(cfg.apps[1].cmd, "/usr/bin/python test_child.py 2 noheartbeat");
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let f = write_ini(
            "[processWatchdog]\nudp_port = 9000\n\n[app:Quiet]\ncmd = /bin/sleep 999\n",
        );
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.apps[0].start_delay, 0);
        assert_eq!(cfg.apps[0].heartbeat_interval, 0);
        assert_eq!(cfg.periodic_reboot, RebootPolicy::Disabled);
    }

    #[test]
    fn rejects_out_of_range_ports() {
        for port in ["0", "65536", "-1", "nope"] {
            let f = write_ini(&format!("[processWatchdog]\nudp_port = {port}\n"));
            assert!(load_config(f.path()).is_err(), "port {port} should be rejected");
        }
    }

    #[test]
    fn rejects_oversized_name_and_cmd() {
        let long_name = "A".repeat(MAX_APP_NAME_LENGTH);
        let f = write_ini(&format!(
            "[processWatchdog]\nudp_port = 9000\n[app:{long_name}]\ncmd = /bin/true\n"
        ));
        assert!(load_config(f.path()).is_err());

        let long_cmd = "/bin/echo ".to_string() + &"x".repeat(MAX_APP_CMD_LENGTH);
        let f = write_ini(&format!(
            "[processWatchdog]\nudp_port = 9000\n[app:Big]\ncmd = {long_cmd}\n"
        ));
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn rejects_duplicate_apps_case_insensitively() {
        let f = write_ini(
            "[processWatchdog]\nudp_port = 9000\n[app:Bot]\ncmd = /bin/true\n[app:bot]\ncmd = /bin/true\n",
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn rejects_positional_grammar() {
        let f = write_ini("[processWatchdog]\nudp_port = 9000\nn_apps = 2\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn ignores_unknown_keys_and_sections() {
        let f = write_ini(
            "[processWatchdog]\nudp_port = 9000\nfancy = yes\n[stuff]\nx = 1\n[app:A]\ncmd = /bin/true\nextra = 2\n",
        );
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.apps.len(), 1);
    }

    #[test]
    fn ignores_apps_past_the_table_limit() {
        let mut body = String::from("[processWatchdog]\nudp_port = 9000\n");
        for i in 0..MAX_APPS + 2 {
            body.push_str(&format!("[app:App{i}]\ncmd = /bin/true\n"));
        }
        let f = write_ini(&body);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.apps.len(), MAX_APPS);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config(Path::new("/nonexistent/config.ini")).is_err());
    }
}
