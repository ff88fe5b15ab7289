// log4rs setup for the server and worker processes.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {T} - {m}{n}";
const LOG_FILE: &str = "genserve.log";
const ROLL_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const ROLL_ARCHIVES: u32 = 5;

pub fn parse_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level).unwrap_or(LevelFilter::Info)
}

/// Console plus a size-rotated file under `log_dir`.
pub fn setup_logging(log_dir: &Path, level: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;

    let archive = log_dir.join("genserve.{}.log");
    let roller = FixedWindowRoller::builder()
        .build(&archive.to_string_lossy(), ROLL_ARCHIVES)
        .context("invalid log archive pattern")?;
    let policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(ROLL_SIZE_BYTES)),
        Box::new(roller),
    );
    let file = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(log_dir.join(LOG_FILE), Box::new(policy))
        .context("cannot open log file")?;
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .appender(Appender::builder().build("file", Box::new(file)))
        .build(
            Root::builder()
                .appender("console")
                .appender("file")
                .build(parse_level(level)),
        )?;
    log4rs::init_config(config)?;
    Ok(())
}

/// stderr only: the worker's stdout carries IPC frames.
pub fn setup_worker_logging(level: &str) -> Result<()> {
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(console)))
        .build(Root::builder().appender("stderr").build(parse_level(level)))?;
    log4rs::init_config(config)?;
    Ok(())
}
