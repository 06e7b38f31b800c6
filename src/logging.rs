//! Process-wide tracing setup.

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::LoggingConfig;

/// `RUST_LOG` if set, else `level`, else `info`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Run `f` under a temporary stderr subscriber. Config loading happens
/// before [`init`] knows the configured level; its events go through here.
pub fn with_startup<T>(level: Option<&str>, f: impl FnOnce() -> T) -> T {
    tracing::subscriber::with_default(startup_subscriber(level, std::io::stderr), f)
}

fn startup_subscriber<W>(level: Option<&str>, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter(level.unwrap_or("info")))
        .with_ansi(false)
        .with_writer(writer)
        .finish()
}

/// Install the global subscriber. Call once.
pub fn init(cfg: &LoggingConfig) {
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter(&cfg.level))
        .with_thread_names(true);
    if cfg.json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn config_loading_is_logged_before_init() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "[server]\nport = 9300\n").unwrap();

        let out = Captured::default();
        let make = {
            let out = out.clone();
            move || out.clone()
        };
        let cfg = tracing::subscriber::with_default(startup_subscriber(Some("info"), make), || {
            AgentConfig::resolve(Some(&path))
        })
        .unwrap();
        assert_eq!(cfg.server.port, 9300);

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("loaded agent configuration"), "{}", text);
    }
}
