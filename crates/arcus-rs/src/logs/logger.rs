use env_logger::{Builder, Env};
use std::io::Write;

/// Installs the gateway's log format.
///
/// One line per record: millisecond timestamp, padded level, module
/// target, message. The filter comes from `ARCUS_LOG` (default `info`),
/// so per-module tuning like `ARCUS_LOG=info,arcus_rs::services=debug`
/// works without code changes. Color detection is env_logger's own, which
/// honors `NO_COLOR` and non-tty output.
pub fn configure_logger() {
    Builder::from_env(Env::new().filter_or("ARCUS_LOG", "info"))
        .format(|buf, record| {
            let style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "{} {style}{:<5}{style:#} {} > {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args(),
            )
        })
        .init();
}
