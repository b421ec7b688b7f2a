use crate::wd::log::{event, init_log_file};
use crate::wd::{build_info, config, daemon, selftest, EXIT_CONFIG, EXIT_NORMALLY};
use clap::Parser;
use std::path::{Path, PathBuf};

const FILE_COMMANDS_HELP: &str = "\
File commands (empty files in the working directory):
  start<app>    spawn a stopped app, file is consumed
  stop<app>     stop an app; the file latches until removed
  restart<app>  restart an app, file is consumed
  wdtstop       exit with code 0
  wdtrestart    exit with code 2 (relaunch me)
  wdtreboot     exit with code 3 (reboot host)

Example config.ini:
  [processWatchdog]
  udp_port = 12345
  periodic_reboot = 04:00

  [app:Communicator]
  start_delay = 10
  heartbeat_delay = 60
  heartbeat_interval = 20
  cmd = /usr/bin/python test_child.py 1";

#[derive(Debug, Parser)]
#[command(
    name = "procwatch",
    about = "Starts the applications listed in the ini file and restarts them \
             when they crash or stop sending p<pid> heartbeats to the UDP port.",
    after_help = FILE_COMMANDS_HELP,
    disable_version_flag = true
)]
pub struct Args {
    /// Path to the watchdog INI config
    #[arg(short = 'i', long = "ini", default_value = "config.ini")]
    pub ini: PathBuf,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Run a named self-test and exit ("list" shows the names)
    #[arg(short = 't', long = "test")]
    pub test: Option<String>,
}

pub async fn run() -> i32 {
    let args = Args::parse();

    if args.version {
        println!("{}", build_info::banner());
        return EXIT_NORMALLY;
    }
    if let Some(name) = args.test.as_deref() {
        return selftest::run(name);
    }

    init_log_file(Path::new("procwatch.log"));
    event("main", None, format!("started, {}", build_info::banner()));

    let cfg = match config::load_config(&args.ini) {
        Ok(cfg) => cfg,
        Err(e) => {
            event("config", None, format!("invalid configuration: {e:#}"));
            return EXIT_CONFIG;
        }
    };

    match daemon::run_daemon_async(cfg).await {
        Ok(code) => code,
        Err(e) => {
            event("main", None, format!("fatal: {e:#}"));
            EXIT_CONFIG
        }
    }
}
