#[derive(Copy, Clone, Debug)]
pub enum LogVerbosity {
    Normal,
    Verbose,
    Debug,
}

impl LogVerbosity {
    /// Collapses the repeatable -v/-d CLI flags into one level; wire-level
    /// debugging implies verbose logs.
    pub fn from_flags(verbose: u8, debug: u8) -> Self {
        match verbose.max(debug) {
            0 => LogVerbosity::Normal,
            1 => LogVerbosity::Verbose,
            _ => LogVerbosity::Debug,
        }
    }

    fn level_filter(self) -> log::LevelFilter {
        match self {
            LogVerbosity::Normal => log::LevelFilter::Info,
            LogVerbosity::Verbose => log::LevelFilter::Debug,
            LogVerbosity::Debug => log::LevelFilter::Trace,
        }
    }
}

pub fn init_logger(verbosity: LogVerbosity) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(verbosity.level_filter())
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_collapse() {
        assert!(matches!(LogVerbosity::from_flags(0, 0), LogVerbosity::Normal));
        assert!(matches!(LogVerbosity::from_flags(1, 0), LogVerbosity::Verbose));
        assert!(matches!(LogVerbosity::from_flags(0, 2), LogVerbosity::Debug));
    }
}
